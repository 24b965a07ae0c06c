use crate::infra::{demo_catalog, demo_context, demo_scope, read_context, DEMO_EVENT, DEMO_TENANT};
use chrono::{DateTime, Utc};
use clap::Args;
use loyalty_engine::error::AppError;
use loyalty_engine::policy::{
    evaluate_snapshot, evaluate_with_policies, load_policy_document, read_policy_document,
    validate_policy, Action, ContributionType, EvaluationError, EvaluationResult, Policy,
    PolicyContext, PolicyEngine, PolicyId, PolicyRegistry, RegistrySettings, SourceError,
    StackingStrategy,
};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct EvaluateArgs {
    /// JSON or YAML policy document
    #[arg(long)]
    pub(crate) policies: PathBuf,
    /// JSON event context to evaluate
    #[arg(long)]
    pub(crate) context: PathBuf,
    /// Print the result on a single line
    #[arg(long)]
    pub(crate) compact: bool,
}

#[derive(Args, Debug)]
pub(crate) struct ValidateArgs {
    /// JSON or YAML policy document
    #[arg(long)]
    pub(crate) policies: PathBuf,
}

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Purchase amount for the reference catalog walk-through. Defaults to 100.
    #[arg(long)]
    pub(crate) amount: Option<Decimal>,
    /// Member tier attribute for the reference catalog walk-through. Defaults to gold.
    #[arg(long)]
    pub(crate) tier: Option<String>,
    /// Print every result as JSON instead of a breakdown listing.
    #[arg(long)]
    pub(crate) json: bool,
}

pub(crate) fn run_evaluate(args: EvaluateArgs) -> Result<(), AppError> {
    let EvaluateArgs {
        policies,
        context,
        compact,
    } = args;

    let result = evaluate_document(&policies, &context)?;
    let rendered = if compact {
        serde_json::to_string(&result)?
    } else {
        serde_json::to_string_pretty(&result)?
    };
    println!("{rendered}");
    Ok(())
}

fn evaluate_document(
    policies: &std::path::Path,
    context: &std::path::Path,
) -> Result<EvaluationResult, AppError> {
    let policies = load_policy_document(policies)?;
    let context = read_context(context)?;
    Ok(evaluate_with_policies(&policies, &context)?)
}

pub(crate) fn run_validate(args: ValidateArgs) -> Result<(), AppError> {
    let document = read_policy_document(&args.policies)?;
    println!(
        "Validating {} ({} policy versions)",
        args.policies.display(),
        document.policies.len()
    );

    let mut first_failure = None;
    for policy in &document.policies {
        match validate_policy(policy) {
            Ok(()) => println!("  ok       {} v{}", policy.id, policy.version),
            Err(err) => {
                println!("  invalid  {} v{}: {err}", policy.id, policy.version);
                first_failure.get_or_insert(err);
            }
        }
    }

    let latest = document.latest_versions();
    let active = latest.iter().filter(|policy| policy.is_eligible_at(Utc::now())).count();
    println!(
        "- {} distinct policies | {} eligible now",
        latest.len(),
        active
    );

    match first_failure {
        Some(err) => Err(SourceError::Invalid(err).into()),
        None => Ok(()),
    }
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs { amount, tier, json } = args;
    let amount = amount.unwrap_or(Decimal::ONE_HUNDRED);
    let tier = tier.unwrap_or_else(|| "gold".to_string());
    let timestamp = Utc::now();

    println!("Loyalty policy engine demo");

    let catalog = Arc::new(demo_catalog()?);
    let registry = Arc::new(PolicyRegistry::new(
        catalog.clone(),
        RegistrySettings::default(),
    ));
    let engine = PolicyEngine::new(registry.clone());

    let context = demo_context(amount, &tier, timestamp);
    let result = engine.evaluate(&context).await?;
    render_result(
        &format!("Reference catalog ({} policies, tier {tier})", catalog.len()),
        &result,
        json,
    )?;

    for scenario in demo_scenarios(timestamp) {
        let result = evaluate_with_policies(&scenario.policies, &scenario.context)?;
        render_result(scenario.title, &result, json)?;
    }

    println!("\nRevision while an evaluation is in flight");
    let snapshot = registry
        .snapshot(DEMO_TENANT, DEMO_EVENT)
        .await
        .map_err(EvaluationError::from)?;
    let gold_bonus = PolicyId::from("gold-bonus");
    let Some(mut revised) = catalog.latest(&gold_bonus) else {
        return Err(SourceError::NotFound(gold_bonus).into());
    };
    revised.version += 1;
    revised.actions = vec![Action::FlatBonus { amount: 80 }];
    let change = catalog.publish(revised)?;
    let marked = registry.invalidate_change(&change);

    let in_flight = evaluate_snapshot(&snapshot, &context, None)?;
    let fresh = engine.evaluate(&context).await?;
    println!(
        "- published {} v{} and invalidated {} cached scope(s)",
        change.policy_id, change.version, marked
    );
    println!(
        "- in-flight evaluation on generation {}: {} points",
        in_flight.snapshot_generation, in_flight.total
    );
    println!(
        "- next evaluation on generation {}: {} points",
        fresh.snapshot_generation, fresh.total
    );

    Ok(())
}

struct Scenario {
    title: &'static str,
    policies: Vec<Policy>,
    context: PolicyContext,
}

fn flat(id: &str, stacking: StackingStrategy, amount: i64) -> Policy {
    Policy::new(id, stacking, vec![Action::FlatBonus { amount }]).with_scope(demo_scope())
}

fn multiplier(id: &str, factor: Decimal) -> Policy {
    Policy::new(
        id,
        StackingStrategy::Multiplicative,
        vec![Action::Multiplier { factor }],
    )
    .with_scope(demo_scope())
}

fn demo_scenarios(timestamp: DateTime<Utc>) -> Vec<Scenario> {
    let context = demo_context(Decimal::ONE_HUNDRED, "silver", timestamp);

    vec![
        Scenario {
            title: "Additive bonuses stack",
            policies: vec![
                flat("welcome", StackingStrategy::Additive, 100),
                flat("spring-bonus", StackingStrategy::Additive, 250),
            ],
            context: context.clone(),
        },
        Scenario {
            title: "Exclusive group keeps one winner",
            policies: vec![
                flat("tier-silver", StackingStrategy::Exclusive, 10).with_precedence(10),
                flat("tier-gold-b", StackingStrategy::Exclusive, 20).with_precedence(20),
                flat("tier-gold-a", StackingStrategy::Exclusive, 30).with_precedence(20),
            ],
            context: context.clone(),
        },
        Scenario {
            title: "Multipliers compose against the base amount",
            policies: vec![
                multiplier("spring-campaign", Decimal::new(15, 1)),
                multiplier("double-points", Decimal::TWO),
            ],
            context: context.clone(),
        },
        Scenario {
            title: "Negative contribution is isolated",
            policies: vec![
                flat("clawback", StackingStrategy::Additive, -20),
                flat("welcome", StackingStrategy::Additive, 30),
            ],
            context,
        },
    ]
}

fn render_result(title: &str, result: &EvaluationResult, json: bool) -> Result<(), AppError> {
    println!("\n{title}");
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    for line in summarize(result) {
        println!("{line}");
    }
    Ok(())
}

fn summarize(result: &EvaluationResult) -> Vec<String> {
    let mut lines = vec![format!(
        "- total {} points on base amount {}",
        result.total, result.base_amount
    )];

    for entry in &result.breakdown {
        let detail = match entry.contribution_type {
            ContributionType::Multiplier => entry
                .factor
                .map(|factor| format!("x{factor}"))
                .unwrap_or_default(),
            ContributionType::Unlock => {
                format!("unlocks {}", entry.unlock.as_deref().unwrap_or_default())
            }
            _ => format!("{:+}", entry.points),
        };
        lines.push(format!(
            "  - {} ({:?}, {:?}): {detail}",
            entry.policy_id, entry.stacking, entry.contribution_type
        ));
    }

    for exclusion in &result.excluded {
        lines.push(format!(
            "  - excluded {}: {}",
            exclusion.policy_id,
            exclusion.reason.code()
        ));
    }

    if !result.unlocks.is_empty() {
        lines.push(format!("  - unlocked: {}", result.unlocks.join(", ")));
    }

    lines
}
