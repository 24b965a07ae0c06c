use std::collections::BTreeSet;

use super::domain::{
    Action, Condition, ConditionOperator, ConditionValue, Policy, PolicyId, StackingStrategy,
};
use super::errors::PolicyValidationError;

/// Structural checks applied when a policy is loaded, so evaluation never sees a condition whose
/// operand shape disagrees with its operator. Sign and overflow problems are left to the
/// calculator, which isolates them per policy.
pub fn validate_policy(policy: &Policy) -> Result<(), PolicyValidationError> {
    if policy.id.as_str().trim().is_empty() {
        return Err(PolicyValidationError::EmptyId);
    }

    let branches_carry_actions =
        !policy.branches.is_empty() && policy.branches.iter().all(|branch| !branch.actions.is_empty());
    if policy.actions.is_empty() && !branches_carry_actions {
        return Err(PolicyValidationError::MissingActions {
            policy_id: policy.id.clone(),
        });
    }

    if let (Some(start), Some(end)) = (policy.window.starts_at, policy.window.ends_at) {
        if end < start {
            return Err(PolicyValidationError::InvertedWindow {
                policy_id: policy.id.clone(),
            });
        }
    }

    validate_conditions(&policy.id, &policy.conditions)?;
    validate_actions(&policy.id, policy.stacking, &policy.actions)?;

    let mut branch_ids = BTreeSet::new();
    for branch in &policy.branches {
        if branch.id.as_str().trim().is_empty() || !branch_ids.insert(&branch.id) {
            return Err(PolicyValidationError::InvalidBranchId {
                policy_id: policy.id.clone(),
                branch_id: branch.id.clone(),
            });
        }
        validate_conditions(&policy.id, &branch.conditions)?;
        validate_actions(&policy.id, policy.stacking, &branch.actions)?;
    }

    // The uplift of a multiplier is composed across policies, so a per-policy cap has nothing
    // it could clamp.
    let multiplies = policy
        .actions
        .iter()
        .chain(policy.branches.iter().flat_map(|branch| branch.actions.iter()))
        .any(|action| matches!(action, Action::Multiplier { .. }));
    if multiplies && policy.max_contribution.is_some() {
        return Err(PolicyValidationError::CapOnMultiplier {
            policy_id: policy.id.clone(),
        });
    }

    Ok(())
}

fn validate_conditions(
    policy_id: &PolicyId,
    conditions: &[Condition],
) -> Result<(), PolicyValidationError> {
    for condition in conditions {
        if condition.field.split('.').any(|segment| segment.trim().is_empty()) {
            return Err(PolicyValidationError::EmptyField {
                policy_id: policy_id.clone(),
                field: condition.field.clone(),
            });
        }

        let shape_error = |expected: &'static str| PolicyValidationError::OperandShape {
            policy_id: policy_id.clone(),
            field: condition.field.clone(),
            operator: condition.operator,
            expected,
        };

        match condition.operator {
            ConditionOperator::Between => {
                let (min, max) = condition
                    .value
                    .range_bounds()
                    .ok_or_else(|| shape_error("a {min, max} range or a two-number list"))?;
                if min > max {
                    return Err(PolicyValidationError::InvertedRange {
                        policy_id: policy_id.clone(),
                        field: condition.field.clone(),
                        min,
                        max,
                    });
                }
            }
            ConditionOperator::In | ConditionOperator::NotIn => {
                if condition.value.as_list().is_none() {
                    return Err(shape_error("a list of values"));
                }
            }
            _ => {
                if !matches!(condition.value, ConditionValue::Scalar(_)) {
                    return Err(shape_error("a single comparison value"));
                }
            }
        }
    }
    Ok(())
}

fn validate_actions(
    policy_id: &PolicyId,
    stacking: StackingStrategy,
    actions: &[Action],
) -> Result<(), PolicyValidationError> {
    for action in actions {
        match action {
            Action::Multiplier { .. } if stacking != StackingStrategy::Multiplicative => {
                return Err(PolicyValidationError::MultiplierOutsideMultiplicative {
                    policy_id: policy_id.clone(),
                });
            }
            Action::UnlockFlag { unlock_id } if unlock_id.trim().is_empty() => {
                return Err(PolicyValidationError::EmptyUnlockId {
                    policy_id: policy_id.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::*;
    use crate::policy::domain::{ActiveWindow, AttributeValue, PolicyBranch};

    fn bonus(amount: i64) -> Vec<Action> {
        vec![Action::FlatBonus { amount }]
    }

    #[test]
    fn accepts_unconditional_policies() {
        let policy = Policy::new("unconditional", StackingStrategy::Additive, bonus(10));
        assert_eq!(validate_policy(&policy), Ok(()));
    }

    #[test]
    fn rejects_policies_without_actions() {
        let policy = Policy::new("empty", StackingStrategy::Additive, Vec::new());
        assert!(matches!(
            validate_policy(&policy),
            Err(PolicyValidationError::MissingActions { .. })
        ));
    }

    #[test]
    fn branch_actions_can_stand_in_for_parent_actions() {
        let policy = Policy::new("branched", StackingStrategy::Additive, Vec::new()).with_branch(
            PolicyBranch {
                id: PolicyId::from("weekend"),
                conditions: vec![Condition::equals("day", "saturday")],
                actions: bonus(5),
                precedence: 0,
            },
        );
        assert_eq!(validate_policy(&policy), Ok(()));
    }

    #[test]
    fn rejects_operand_shape_mismatches() {
        let between_scalar = Policy::new("between", StackingStrategy::Additive, bonus(1))
            .with_condition(Condition::new(
                "amount",
                ConditionOperator::Between,
                ConditionValue::Scalar(AttributeValue::from(5_i64)),
            ));
        assert!(matches!(
            validate_policy(&between_scalar),
            Err(PolicyValidationError::OperandShape { operator: ConditionOperator::Between, .. })
        ));

        let in_scalar = Policy::new("in", StackingStrategy::Additive, bonus(1)).with_condition(
            Condition::new("tier", ConditionOperator::In, ConditionValue::Scalar("gold".into())),
        );
        assert!(matches!(
            validate_policy(&in_scalar),
            Err(PolicyValidationError::OperandShape { operator: ConditionOperator::In, .. })
        ));

        let equals_list = Policy::new("eq", StackingStrategy::Additive, bonus(1)).with_condition(
            Condition::new("tier", ConditionOperator::Equals, ConditionValue::List(Vec::new())),
        );
        assert!(validate_policy(&equals_list).is_err());
    }

    #[test]
    fn rejects_inverted_ranges_and_windows() {
        let range = Policy::new("range", StackingStrategy::Additive, bonus(1)).with_condition(
            Condition::new(
                "amount",
                ConditionOperator::Between,
                ConditionValue::Range {
                    min: Decimal::from(10),
                    max: Decimal::from(1),
                },
            ),
        );
        assert!(matches!(
            validate_policy(&range),
            Err(PolicyValidationError::InvertedRange { .. })
        ));

        let start = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).single().expect("valid");
        let window = Policy::new("window", StackingStrategy::Additive, bonus(1)).with_window(
            ActiveWindow {
                starts_at: Some(start),
                ends_at: Some(start - Duration::days(1)),
            },
        );
        assert!(matches!(
            validate_policy(&window),
            Err(PolicyValidationError::InvertedWindow { .. })
        ));
    }

    #[test]
    fn multipliers_require_multiplicative_stacking() {
        let policy = Policy::new(
            "double",
            StackingStrategy::Exclusive,
            vec![Action::Multiplier {
                factor: Decimal::TWO,
            }],
        );
        assert!(matches!(
            validate_policy(&policy),
            Err(PolicyValidationError::MultiplierOutsideMultiplicative { .. })
        ));
    }

    #[test]
    fn caps_cannot_bound_multiplier_policies() {
        let double = Policy::new(
            "double",
            StackingStrategy::Multiplicative,
            vec![Action::Multiplier {
                factor: Decimal::TWO,
            }],
        );
        assert_eq!(validate_policy(&double), Ok(()));

        assert!(matches!(
            validate_policy(&double.clone().with_max_contribution(10)),
            Err(PolicyValidationError::CapOnMultiplier { .. })
        ));

        let branched = Policy::new("tiered", StackingStrategy::Multiplicative, Vec::new())
            .with_max_contribution(10)
            .with_branch(PolicyBranch {
                id: PolicyId::from("weekend"),
                conditions: Vec::new(),
                actions: vec![Action::Multiplier {
                    factor: Decimal::TWO,
                }],
                precedence: 0,
            });
        assert!(matches!(
            validate_policy(&branched),
            Err(PolicyValidationError::CapOnMultiplier { .. })
        ));
    }

    #[test]
    fn rejects_repeated_branch_ids_and_blank_unlocks() {
        let branch = PolicyBranch {
            id: PolicyId::from("b"),
            conditions: Vec::new(),
            actions: Vec::new(),
            precedence: 0,
        };
        let repeated = Policy::new("repeated", StackingStrategy::Additive, bonus(1))
            .with_branch(branch.clone())
            .with_branch(branch);
        assert!(matches!(
            validate_policy(&repeated),
            Err(PolicyValidationError::InvalidBranchId { .. })
        ));

        let blank = Policy::new(
            "blank",
            StackingStrategy::Additive,
            vec![Action::UnlockFlag {
                unlock_id: " ".to_string(),
            }],
        );
        assert!(matches!(
            validate_policy(&blank),
            Err(PolicyValidationError::EmptyUnlockId { .. })
        ));
    }

    #[test]
    fn negative_bonuses_are_left_to_evaluation() {
        let policy = Policy::new("clawback", StackingStrategy::Additive, bonus(-10));
        assert_eq!(validate_policy(&policy), Ok(()));
    }
}
