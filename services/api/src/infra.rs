use chrono::{DateTime, Utc};
use loyalty_engine::config::EngineConfig;
use loyalty_engine::error::AppError;
use loyalty_engine::policy::{
    Action, Condition, ConditionOperator, ConditionValue, FilePolicySource,
    InMemoryPolicySource, Policy, PolicyBranch, PolicyContext, PolicyId, PolicyScope,
    PolicySource, SourceError, StackingStrategy,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Policy source selected from configuration.
pub(crate) enum ConfiguredSource {
    File(FilePolicySource),
    Catalog(Arc<InMemoryPolicySource>),
}

impl ConfiguredSource {
    pub(crate) fn from_config(config: &EngineConfig) -> Result<Self, AppError> {
        match &config.policy_source {
            Some(path) => Ok(Self::File(FilePolicySource::new(path.clone()))),
            None => Ok(Self::Catalog(Arc::new(demo_catalog()?))),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            ConfiguredSource::File(source) => format!("file:{}", source.path().display()),
            ConfiguredSource::Catalog(catalog) => format!("catalog:{} policies", catalog.len()),
        }
    }
}

impl PolicySource for ConfiguredSource {
    fn list_active_policies(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Policy>, SourceError> {
        match self {
            ConfiguredSource::File(source) => source.list_active_policies(tenant_id, event_type),
            ConfiguredSource::Catalog(catalog) => {
                catalog.list_active_policies(tenant_id, event_type)
            }
        }
    }
}

pub(crate) const DEMO_TENANT: &str = "acme";
pub(crate) const DEMO_EVENT: &str = "purchase";

pub(crate) fn demo_scope() -> PolicyScope {
    PolicyScope::new(DEMO_TENANT, &[DEMO_EVENT])
}

/// Reference policy set covering every stacking strategy.
pub(crate) fn demo_policies() -> Vec<Policy> {
    let gold_bonus = Policy::new(
        "gold-bonus",
        StackingStrategy::Additive,
        vec![Action::FlatBonus { amount: 50 }],
    )
    .with_scope(demo_scope())
    .with_condition(Condition::equals("tier", "gold"));

    let base_earn = Policy::new(
        "base-earn",
        StackingStrategy::Additive,
        vec![Action::RatePerUnit {
            rate: Decimal::new(2, 2),
        }],
    )
    .with_scope(demo_scope());

    let basket_tiers = Policy::new("basket-tiers", StackingStrategy::Exclusive, Vec::new())
        .with_scope(demo_scope())
        .with_precedence(10)
        .with_branch(PolicyBranch {
            id: PolicyId::from("large-basket"),
            conditions: vec![Condition::new(
                "amount",
                ConditionOperator::GreaterOrEqual,
                ConditionValue::Scalar(Decimal::from(500).into()),
            )],
            actions: vec![Action::FlatBonus { amount: 120 }],
            precedence: 2,
        })
        .with_branch(PolicyBranch {
            id: PolicyId::from("medium-basket"),
            conditions: vec![Condition::new(
                "amount",
                ConditionOperator::Between,
                ConditionValue::Range {
                    min: Decimal::from(200),
                    max: Decimal::from(500),
                },
            )],
            actions: vec![Action::FlatBonus { amount: 40 }],
            precedence: 1,
        });

    let first_purchase = Policy::new(
        "first-purchase",
        StackingStrategy::Exclusive,
        vec![Action::FlatBonus { amount: 75 }],
    )
    .with_scope(demo_scope())
    .with_precedence(5)
    .with_condition(Condition::equals("first_purchase", true));

    let weekend_double = Policy::new(
        "weekend-double",
        StackingStrategy::Multiplicative,
        vec![Action::Multiplier {
            factor: Decimal::TWO,
        }],
    )
    .with_scope(demo_scope())
    .with_condition(Condition::new(
        "day_of_week",
        ConditionOperator::In,
        ConditionValue::List(vec!["saturday".into(), "sunday".into()]),
    ));

    let lounge = Policy::new(
        "platinum-lounge",
        StackingStrategy::Additive,
        vec![Action::UnlockFlag {
            unlock_id: "airport-lounge".to_string(),
        }],
    )
    .with_condition(Condition::equals("tier", "platinum"));

    vec![
        gold_bonus,
        base_earn,
        basket_tiers,
        first_purchase,
        weekend_double,
        lounge,
    ]
}

pub(crate) fn demo_catalog() -> Result<InMemoryPolicySource, AppError> {
    Ok(InMemoryPolicySource::with_policies(demo_policies())?)
}

pub(crate) fn demo_context(
    amount: Decimal,
    tier: &str,
    timestamp: DateTime<Utc>,
) -> PolicyContext {
    PolicyContext::new("member-1001", DEMO_TENANT, DEMO_EVENT, timestamp)
        .with_amount(amount)
        .with_attribute("tier", tier)
}

pub(crate) fn read_context(path: &Path) -> Result<PolicyContext, AppError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
