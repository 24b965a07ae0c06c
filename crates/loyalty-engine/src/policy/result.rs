use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::domain::{PolicyId, StackingStrategy};
use super::resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionType {
    FlatBonus,
    RatePerUnit,
    Multiplier,
    Unlock,
    CapAdjustment,
}

/// One audited line of an evaluation.
///
/// Point entries carry `points`; multiplier entries carry `factor`; unlock entries carry
/// `unlock`. Cap adjustments are negative point entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownEntry {
    pub policy_id: PolicyId,
    pub stacking: StackingStrategy,
    pub contribution_type: ContributionType,
    pub points: i64,
    #[serde(
        default,
        with = "crate::policy::numeric::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub factor: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock: Option<String>,
}

impl BreakdownEntry {
    pub fn points(
        policy_id: &PolicyId,
        stacking: StackingStrategy,
        contribution_type: ContributionType,
        points: i64,
    ) -> Self {
        Self {
            policy_id: policy_id.clone(),
            stacking,
            contribution_type,
            points,
            factor: None,
            unlock: None,
        }
    }

    pub fn multiplier(policy_id: &PolicyId, stacking: StackingStrategy, factor: Decimal) -> Self {
        Self {
            factor: Some(factor),
            ..Self::points(policy_id, stacking, ContributionType::Multiplier, 0)
        }
    }

    pub fn unlock(policy_id: &PolicyId, stacking: StackingStrategy, unlock: &str) -> Self {
        Self {
            unlock: Some(unlock.to_string()),
            ..Self::points(policy_id, stacking, ContributionType::Unlock, 0)
        }
    }
}

/// Why a matched or candidate policy did not contribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    ExclusiveGroupSuperseded { winner: PolicyId },
    MalformedCondition { detail: String },
    InvalidAction { detail: String },
    InvalidPolicy { detail: String },
}

impl ExclusionReason {
    pub fn code(&self) -> &'static str {
        match self {
            ExclusionReason::ExclusiveGroupSuperseded { .. } => "exclusive_group_superseded",
            ExclusionReason::MalformedCondition { .. } => "malformed_condition",
            ExclusionReason::InvalidAction { .. } => "invalid_action",
            ExclusionReason::InvalidPolicy { .. } => "invalid_policy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub policy_id: PolicyId,
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

/// Auditable outcome of one evaluation, handed to the ledger collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub actor_id: String,
    pub tenant_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Registry generation of the snapshot the evaluation ran against; 0 for pinned replays.
    pub snapshot_generation: u64,
    #[serde(with = "crate::policy::numeric")]
    pub base_amount: Decimal,
    pub total: u64,
    pub breakdown: Vec<BreakdownEntry>,
    pub applied: Vec<PolicyId>,
    pub excluded: Vec<Exclusion>,
    pub unlocks: Vec<String>,
}

impl EvaluationResult {
    /// Re-applies the stacking arithmetic to the breakdown.
    pub fn reconstructed_total(&self) -> Option<u64> {
        resolver::reconstruct_total(&self.breakdown, self.base_amount)
    }

    pub fn excluded_ids(&self) -> Vec<&PolicyId> {
        self.excluded.iter().map(|exclusion| &exclusion.policy_id).collect()
    }
}
