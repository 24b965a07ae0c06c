use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Stable identifier shared by every version of a policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub String);

impl PolicyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PolicyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Value stored under a context attribute.
///
/// Text is tried before numbers when deserializing so quoted digits stay text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Text(String),
    Number(#[serde(with = "crate::policy::numeric")] Decimal),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Text(_) => "text",
            AttributeValue::Number(_) => "number",
            AttributeValue::List(_) => "list",
            AttributeValue::Map(_) => "map",
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, AttributeValue::List(_) | AttributeValue::Map(_))
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<Decimal> for AttributeValue {
    fn from(value: Decimal) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(Decimal::from(value))
    }
}

/// Snapshot of one business event, immutable for the duration of an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub actor_id: String,
    pub tenant_id: String,
    pub event_type: String,
    #[serde(
        default,
        with = "crate::policy::numeric::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied idempotency key, echoed back for the ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl PolicyContext {
    pub fn new(
        actor_id: impl Into<String>,
        tenant_id: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
            amount: None,
            attributes: BTreeMap::new(),
            timestamp,
            transaction_id: None,
        }
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// Comparison operators understood by the condition evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Between,
    In,
    NotIn,
    Contains,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::GreaterOrEqual => "greater_or_equal",
            ConditionOperator::LessOrEqual => "less_or_equal",
            ConditionOperator::Between => "between",
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "not_in",
            ConditionOperator::Contains => "contains",
        }
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Right-hand side of a condition.
///
/// Lists are tried before ranges so `[10, 20]` stays a list; BETWEEN accepts either shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    List(Vec<AttributeValue>),
    Range {
        #[serde(with = "crate::policy::numeric")]
        min: Decimal,
        #[serde(with = "crate::policy::numeric")]
        max: Decimal,
    },
    Scalar(AttributeValue),
}

impl ConditionValue {
    /// Inclusive numeric bounds, from either an explicit range or a two-element numeric list.
    pub fn range_bounds(&self) -> Option<(Decimal, Decimal)> {
        match self {
            ConditionValue::Range { min, max } => Some((*min, *max)),
            ConditionValue::List(items) => match items.as_slice() {
                [AttributeValue::Number(min), AttributeValue::Number(max)] => Some((*min, *max)),
                _ => None,
            },
            ConditionValue::Scalar(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttributeValue]> {
        match self {
            ConditionValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&AttributeValue> {
        match self {
            ConditionValue::Scalar(value) => Some(value),
            _ => None,
        }
    }
}

/// Atomic predicate over a dot-path into the context attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: ConditionValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::new(
            field,
            ConditionOperator::Equals,
            ConditionValue::Scalar(value.into()),
        )
    }
}

/// Effect applied when a policy's conditions hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    FlatBonus {
        amount: i64,
    },
    Multiplier {
        #[serde(with = "crate::policy::numeric")]
        factor: Decimal,
    },
    RatePerUnit {
        #[serde(with = "crate::policy::numeric")]
        rate: Decimal,
    },
    UnlockFlag {
        unlock_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackingStrategy {
    Exclusive,
    Additive,
    Multiplicative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    Active,
    Archived,
}

/// Half-open `[starts_at, ends_at)` window; a missing bound is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
}

impl ActiveWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let started = self.starts_at.map_or(true, |start| start <= at);
        let not_ended = self.ends_at.map_or(true, |end| at < end);
        started && not_ended
    }
}

/// Coarse tenant/event filter used by the registry index.
///
/// `None` tenant and empty event types match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
}

impl PolicyScope {
    pub fn new(tenant_id: impl Into<String>, event_types: &[&str]) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            event_types: event_types.iter().map(|event| event.to_string()).collect(),
        }
    }

    pub fn matches(&self, tenant_id: &str, event_type: &str) -> bool {
        let tenant_ok = self
            .tenant_id
            .as_deref()
            .map_or(true, |tenant| tenant == tenant_id);
        let event_ok =
            self.event_types.is_empty() || self.event_types.iter().any(|event| event == event_type);
        tenant_ok && event_ok
    }

    /// Whether every match can be enumerated as concrete (tenant, event type) keys.
    pub fn is_indexable(&self) -> bool {
        self.tenant_id.is_some() && !self.event_types.is_empty()
    }
}

/// Alternative condition set nested under a policy; branches are OR-ed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBranch {
    pub id: PolicyId,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub precedence: i32,
}

/// Administrator-authored reward rule. Never mutated once loaded; edits publish a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub scope: PolicyScope,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    pub stacking: StackingStrategy,
    #[serde(default)]
    pub precedence: i32,
    #[serde(default)]
    pub window: ActiveWindow,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_contribution: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<PolicyBranch>,
}

impl Policy {
    /// Active policy with no conditions, no window and an unrestricted scope.
    pub fn new(
        id: impl Into<String>,
        stacking: StackingStrategy,
        actions: Vec<Action>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: PolicyId(id),
            version: 1,
            scope: PolicyScope::default(),
            conditions: Vec::new(),
            actions,
            stacking,
            precedence: 0,
            window: ActiveWindow::default(),
            state: LifecycleState::Active,
            max_contribution: None,
            branches: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: PolicyScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_precedence(mut self, precedence: i32) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn with_window(mut self, window: ActiveWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_contribution(mut self, cap: u64) -> Self {
        self.max_contribution = Some(cap);
        self
    }

    pub fn with_branch(mut self, branch: PolicyBranch) -> Self {
        self.branches.push(branch);
        self
    }

    /// Eligible for evaluation at `at`: ACTIVE and inside the active window.
    pub fn is_eligible_at(&self, at: DateTime<Utc>) -> bool {
        self.state == LifecycleState::Active && self.window.contains(at)
    }
}
