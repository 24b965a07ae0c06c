use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::domain::{Action, Policy, PolicyBranch, PolicyContext, PolicyId, StackingStrategy};
use super::errors::ActionError;
use super::result::{BreakdownEntry, ContributionType};

/// Per-policy effect prior to stacking resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub policy_id: PolicyId,
    pub version: u32,
    pub stacking: StackingStrategy,
    pub precedence: i32,
    /// Sum of point entries after the policy cap; never negative.
    pub points: i64,
    /// Product of the policy's multiplier actions, left for the resolver to compose.
    pub factor: Option<Decimal>,
    pub unlocks: Vec<String>,
    pub entries: Vec<BreakdownEntry>,
}

/// Compute the contribution of a policy whose conditions already matched. Actions of the
/// selected branch, if any, follow the policy's own actions.
pub fn compute_contribution(
    policy: &Policy,
    branch: Option<&PolicyBranch>,
    context: &PolicyContext,
) -> Result<Contribution, ActionError> {
    let amount = context.amount.unwrap_or(Decimal::ZERO);
    let stacking = policy.stacking;
    let id = &policy.id;

    let mut points: i64 = 0;
    let mut factor: Option<Decimal> = None;
    let mut unlocks = Vec::new();
    let mut entries = Vec::new();

    let actions = policy
        .actions
        .iter()
        .chain(branch.into_iter().flat_map(|branch| branch.actions.iter()));

    for action in actions {
        match action {
            Action::FlatBonus { amount: bonus } => {
                let kind = ContributionType::FlatBonus;
                if *bonus < 0 {
                    return Err(ActionError::NegativeContribution {
                        kind,
                        value: Decimal::from(*bonus),
                    });
                }
                points = points
                    .checked_add(*bonus)
                    .ok_or(ActionError::Overflow { kind })?;
                entries.push(BreakdownEntry::points(id, stacking, kind, *bonus));
            }
            Action::RatePerUnit { rate } => {
                let kind = ContributionType::RatePerUnit;
                let raw = amount
                    .checked_mul(*rate)
                    .ok_or(ActionError::Overflow { kind })?;
                if raw < Decimal::ZERO {
                    return Err(ActionError::NegativeContribution { kind, value: raw });
                }
                let value = raw
                    .trunc()
                    .to_i64()
                    .ok_or(ActionError::Overflow { kind })?;
                points = points
                    .checked_add(value)
                    .ok_or(ActionError::Overflow { kind })?;
                entries.push(BreakdownEntry::points(id, stacking, kind, value));
            }
            Action::Multiplier { factor: value } => {
                if stacking != StackingStrategy::Multiplicative {
                    return Err(ActionError::MultiplierOutsideMultiplicative);
                }
                if *value < Decimal::ONE {
                    return Err(ActionError::MultiplierBelowOne { factor: *value });
                }
                let combined = match factor {
                    Some(current) => current.checked_mul(*value).ok_or(ActionError::Overflow {
                        kind: ContributionType::Multiplier,
                    })?,
                    None => *value,
                };
                factor = Some(combined);
                entries.push(BreakdownEntry::multiplier(id, stacking, *value));
            }
            Action::UnlockFlag { unlock_id } => {
                unlocks.push(unlock_id.clone());
                entries.push(BreakdownEntry::unlock(id, stacking, unlock_id));
            }
        }
    }

    if factor.is_some() && policy.max_contribution.is_some() {
        return Err(ActionError::CappedMultiplier);
    }

    if let Some(cap) = policy.max_contribution {
        let cap = i64::try_from(cap).unwrap_or(i64::MAX);
        if points > cap {
            entries.push(BreakdownEntry::points(
                id,
                stacking,
                ContributionType::CapAdjustment,
                cap - points,
            ));
            points = cap;
        }
    }

    Ok(Contribution {
        policy_id: id.clone(),
        version: policy.version,
        stacking,
        precedence: policy.precedence,
        points,
        factor,
        unlocks,
        entries,
    })
}
