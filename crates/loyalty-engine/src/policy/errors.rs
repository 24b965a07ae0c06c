use std::path::PathBuf;

use rust_decimal::Decimal;

use super::domain::{ConditionOperator, PolicyId};
use super::result::ContributionType;

/// A condition whose operand cannot be compared against the context value it resolved to.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("malformed condition on `{field}`: `{operator}` cannot compare {actual}; expected {expected}")]
    Malformed {
        field: String,
        operator: ConditionOperator,
        actual: &'static str,
        expected: &'static str,
    },
}

/// An action that cannot produce a valid, non-negative contribution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("invalid action: {kind:?} produced negative contribution {value}")]
    NegativeContribution {
        kind: ContributionType,
        value: Decimal,
    },
    #[error("invalid action: multiplier {factor} is below 1")]
    MultiplierBelowOne { factor: Decimal },
    #[error("invalid action: multipliers require multiplicative stacking")]
    MultiplierOutsideMultiplicative,
    #[error("invalid action: max_contribution cannot bound a multiplier uplift")]
    CappedMultiplier,
    #[error("invalid action: {kind:?} overflowed")]
    Overflow { kind: ContributionType },
}

/// Structural problems rejected when a policy is loaded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyValidationError {
    #[error("policy id must not be empty")]
    EmptyId,
    #[error("policy {policy_id} declares no actions")]
    MissingActions { policy_id: PolicyId },
    #[error("policy {policy_id}: `{operator}` on `{field}` requires {expected}")]
    OperandShape {
        policy_id: PolicyId,
        field: String,
        operator: ConditionOperator,
        expected: &'static str,
    },
    #[error("policy {policy_id}: condition on `{field}` has an empty field path segment")]
    EmptyField { policy_id: PolicyId, field: String },
    #[error("policy {policy_id}: range on `{field}` has min {min} above max {max}")]
    InvertedRange {
        policy_id: PolicyId,
        field: String,
        min: Decimal,
        max: Decimal,
    },
    #[error("policy {policy_id}: active window ends before it starts")]
    InvertedWindow { policy_id: PolicyId },
    #[error("policy {policy_id}: multiplier actions require multiplicative stacking")]
    MultiplierOutsideMultiplicative { policy_id: PolicyId },
    #[error("policy {policy_id}: max_contribution cannot be combined with multiplier actions")]
    CapOnMultiplier { policy_id: PolicyId },
    #[error("policy {policy_id}: unlock actions need an unlock id")]
    EmptyUnlockId { policy_id: PolicyId },
    #[error("policy {policy_id}: branch id `{branch_id}` is empty or repeated")]
    InvalidBranchId {
        policy_id: PolicyId,
        branch_id: PolicyId,
    },
}

/// Failures raised by a policy source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("policy source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read policy document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy document {path}: {detail}")]
    Parse { path: PathBuf, detail: String },
    #[error(transparent)]
    Invalid(#[from] PolicyValidationError),
    #[error("policy {policy_id} version {attempted} does not supersede version {latest}")]
    VersionConflict {
        policy_id: PolicyId,
        latest: u32,
        attempted: u32,
    },
    #[error("policy {0} not found")]
    NotFound(PolicyId),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("policy registry unavailable for tenant `{tenant_id}` event `{event_type}`: {detail}")]
    Unavailable {
        tenant_id: String,
        event_type: String,
        detail: String,
    },
}

/// Hard failures returned to callers of the evaluation engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("evaluation deadline exceeded")]
    Timeout,
    #[error("invalid context: {0}")]
    InvalidContext(String),
    #[error("reward total overflowed while resolving contributions")]
    Overflow,
}
