use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::calculator::compute_contribution;
use super::condition::evaluate_all;
use super::domain::{Policy, PolicyBranch, PolicyContext};
use super::errors::{ConditionError, EvaluationError};
use super::registry::{PolicyRegistry, PolicySnapshot, PolicySource};
use super::resolver::{precedence_order, resolve, select_branch};
use super::result::{EvaluationResult, Exclusion, ExclusionReason};
use super::validation::validate_policy;

/// Entry point turning a [`PolicyContext`] into an auditable [`EvaluationResult`].
///
/// Shares nothing mutable across calls beyond the registry's snapshot cache, so a single engine
/// can serve any number of concurrent evaluations.
pub struct PolicyEngine<S> {
    registry: Arc<PolicyRegistry<S>>,
    deadline: Option<Duration>,
}

impl<S> PolicyEngine<S>
where
    S: PolicySource + 'static,
{
    pub fn new(registry: Arc<PolicyRegistry<S>>) -> Self {
        Self {
            registry,
            deadline: None,
        }
    }

    /// Bounds every [`PolicyEngine::evaluate`] call.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry<S>> {
        &self.registry
    }

    pub async fn evaluate(
        &self,
        context: &PolicyContext,
    ) -> Result<EvaluationResult, EvaluationError> {
        let deadline = self
            .deadline
            .map(|budget| tokio::time::Instant::now() + budget);
        self.evaluate_until(context, deadline).await
    }

    /// Evaluates against a caller-supplied deadline. Expiry while fetching policies or between
    /// candidates fails with [`EvaluationError::Timeout`]; no partial result is returned.
    pub async fn evaluate_until(
        &self,
        context: &PolicyContext,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<EvaluationResult, EvaluationError> {
        validate_context(context)?;

        let lookup = self
            .registry
            .snapshot(&context.tenant_id, &context.event_type);
        let snapshot = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, lookup)
                .await
                .map_err(|_| EvaluationError::Timeout)??,
            None => lookup.await?,
        };

        evaluate_snapshot(
            &snapshot,
            context,
            deadline.map(tokio::time::Instant::into_std),
        )
    }
}

/// Evaluates against an already fetched snapshot.
pub fn evaluate_snapshot(
    snapshot: &PolicySnapshot,
    context: &PolicyContext,
    deadline: Option<Instant>,
) -> Result<EvaluationResult, EvaluationError> {
    validate_context(context)?;
    let candidates = snapshot.candidates(context.timestamp);
    debug!(
        tenant_id = %context.tenant_id,
        event_type = %context.event_type,
        generation = snapshot.generation(),
        candidates = candidates.len(),
        "evaluating policy snapshot"
    );
    evaluate_candidates(
        candidates.iter().map(Arc::as_ref),
        context,
        snapshot.generation(),
        deadline,
    )
}

/// Replays an evaluation against a pinned set of policy versions, bypassing the registry.
/// Eligibility and scope are applied as the registry would; the snapshot generation is 0.
pub fn evaluate_with_policies(
    policies: &[Policy],
    context: &PolicyContext,
) -> Result<EvaluationResult, EvaluationError> {
    validate_context(context)?;
    let mut candidates: Vec<&Policy> = policies
        .iter()
        .filter(|policy| {
            policy.is_eligible_at(context.timestamp)
                && policy
                    .scope
                    .matches(&context.tenant_id, &context.event_type)
        })
        .collect();
    candidates.sort_by(|left, right| {
        precedence_order((left.precedence, &left.id), (right.precedence, &right.id))
    });
    evaluate_candidates(candidates, context, 0, None)
}

fn validate_context(context: &PolicyContext) -> Result<(), EvaluationError> {
    if context.tenant_id.trim().is_empty() {
        return Err(EvaluationError::InvalidContext(
            "tenant_id must not be empty".to_string(),
        ));
    }
    if context.event_type.trim().is_empty() {
        return Err(EvaluationError::InvalidContext(
            "event_type must not be empty".to_string(),
        ));
    }
    if let Some(amount) = context.amount {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(EvaluationError::InvalidContext(format!(
                "amount must not be negative (got {amount})"
            )));
        }
    }
    Ok(())
}

enum PolicyMatch<'a> {
    Matched(Option<&'a PolicyBranch>),
    Unmatched,
}

/// AND over the policy's own conditions, then OR over its branches.
fn match_policy<'a>(
    policy: &'a Policy,
    context: &PolicyContext,
) -> Result<PolicyMatch<'a>, ConditionError> {
    if !evaluate_all(&policy.conditions, context)? {
        return Ok(PolicyMatch::Unmatched);
    }
    if policy.branches.is_empty() {
        return Ok(PolicyMatch::Matched(None));
    }

    let mut matched = Vec::new();
    for branch in &policy.branches {
        if evaluate_all(&branch.conditions, context)? {
            matched.push(branch);
        }
    }
    Ok(match select_branch(matched) {
        Some(branch) => PolicyMatch::Matched(Some(branch)),
        None => PolicyMatch::Unmatched,
    })
}

fn evaluate_candidates<'a, I>(
    candidates: I,
    context: &PolicyContext,
    generation: u64,
    deadline: Option<Instant>,
) -> Result<EvaluationResult, EvaluationError>
where
    I: IntoIterator<Item = &'a Policy>,
{
    let mut contributions = Vec::new();
    let mut isolated = Vec::new();

    for policy in candidates {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(
                tenant_id = %context.tenant_id,
                event_type = %context.event_type,
                "evaluation deadline exceeded"
            );
            return Err(EvaluationError::Timeout);
        }

        // Sources may hand over policies that never passed load-time validation.
        if let Err(err) = validate_policy(policy) {
            let reason = ExclusionReason::InvalidPolicy {
                detail: err.to_string(),
            };
            warn!(
                policy_id = %policy.id,
                version = policy.version,
                reason = reason.code(),
                error = %err,
                "invalid policy excluded from evaluation"
            );
            isolated.push(Exclusion {
                policy_id: policy.id.clone(),
                reason,
            });
            continue;
        }

        let outcome = match match_policy(policy, context) {
            Ok(PolicyMatch::Unmatched) => continue,
            Ok(PolicyMatch::Matched(branch)) => compute_contribution(policy, branch, context)
                .map_err(|err| ExclusionReason::InvalidAction {
                    detail: err.to_string(),
                }),
            Err(err) => Err(ExclusionReason::MalformedCondition {
                detail: err.to_string(),
            }),
        };

        match outcome {
            Ok(contribution) => contributions.push(contribution),
            Err(reason) => {
                warn!(
                    policy_id = %policy.id,
                    version = policy.version,
                    reason = reason.code(),
                    "policy excluded from evaluation"
                );
                isolated.push(Exclusion {
                    policy_id: policy.id.clone(),
                    reason,
                });
            }
        }
    }

    let base_amount = context.amount.unwrap_or(Decimal::ZERO);
    let resolution =
        resolve(contributions, base_amount).map_err(|_| EvaluationError::Overflow)?;

    let mut excluded = resolution.excluded;
    excluded.extend(isolated);

    Ok(EvaluationResult {
        actor_id: context.actor_id.clone(),
        tenant_id: context.tenant_id.clone(),
        event_type: context.event_type.clone(),
        transaction_id: context.transaction_id.clone(),
        snapshot_generation: generation,
        base_amount,
        total: resolution.total,
        breakdown: resolution.breakdown,
        applied: resolution.applied,
        excluded,
        unlocks: resolution.unlocks,
    })
}
