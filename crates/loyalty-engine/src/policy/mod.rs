//! Conditional reward policies: condition matching, reward calculation, stacking resolution and
//! the cached registry that feeds them.
//!
//! Data flows one way: context → registry snapshot → candidate policies → condition filter →
//! per-policy contribution → stacking resolver → [`EvaluationResult`].

pub mod calculator;
pub mod condition;
pub mod domain;
pub mod engine;
pub mod errors;
mod numeric;
pub mod registry;
pub mod resolver;
pub mod result;
pub mod router;
pub mod source;
pub mod validation;

#[cfg(test)]
mod tests;

pub use calculator::{compute_contribution, Contribution};
pub use condition::{evaluate, evaluate_all};
pub use domain::{
    Action, ActiveWindow, AttributeValue, Condition, ConditionOperator, ConditionValue,
    LifecycleState, Policy, PolicyBranch, PolicyContext, PolicyId, PolicyScope, StackingStrategy,
};
pub use engine::{evaluate_snapshot, evaluate_with_policies, PolicyEngine};
pub use errors::{
    ActionError, ConditionError, EvaluationError, PolicyValidationError, RegistryError,
    SourceError,
};
pub use registry::{PolicyRegistry, PolicySnapshot, PolicySource, RegistrySettings, ScopeKey};
pub use resolver::{reconstruct_total, resolve, Resolution};
pub use result::{BreakdownEntry, ContributionType, EvaluationResult, Exclusion, ExclusionReason};
pub use router::policy_router;
pub use source::{
    load_policy_document, read_policy_document, DocumentFormat, FilePolicySource,
    InMemoryPolicySource, PolicyChange, PolicyDocument,
};
pub use validation::validate_policy;
