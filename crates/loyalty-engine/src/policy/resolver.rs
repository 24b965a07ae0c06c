//! Stacking and conflict resolution.
//!
//! The canonical combination rule:
//!
//! ```text
//! total = Σ additive points
//!       + exclusive winner points
//!       + Σ multiplicative points
//!       + trunc(base × (Π multiplicative factors − 1))
//! ```
//!
//! The last term is `base × product − base`: the multiplicative group already includes the base
//! once, so only the uplift is credited. The total is computed by [`reconstruct_total`] over the
//! emitted breakdown, which keeps the audit trail and the total in lockstep.

use std::cmp::Ordering;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::calculator::Contribution;
use super::domain::{PolicyBranch, PolicyId, StackingStrategy};
use super::result::{BreakdownEntry, ContributionType, Exclusion, ExclusionReason};

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub total: u64,
    pub applied: Vec<PolicyId>,
    pub excluded: Vec<Exclusion>,
    pub breakdown: Vec<BreakdownEntry>,
    pub unlocks: Vec<String>,
}

impl Resolution {
    fn empty() -> Self {
        Self {
            total: 0,
            applied: Vec::new(),
            excluded: Vec::new(),
            breakdown: Vec::new(),
            unlocks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stacked reward total overflowed")]
pub struct ResolutionOverflow;

/// Higher precedence first, then lexically smaller id.
pub(crate) fn precedence_order(
    left: (i32, &PolicyId),
    right: (i32, &PolicyId),
) -> Ordering {
    right.0.cmp(&left.0).then_with(|| left.1.cmp(right.1))
}

/// Resolve matched contributions into a single reward.
pub fn resolve(
    contributions: Vec<Contribution>,
    base_amount: Decimal,
) -> Result<Resolution, ResolutionOverflow> {
    if contributions.is_empty() {
        return Ok(Resolution::empty());
    }

    let mut exclusive = Vec::new();
    let mut additive = Vec::new();
    let mut multiplicative = Vec::new();
    for contribution in contributions {
        match contribution.stacking {
            StackingStrategy::Exclusive => exclusive.push(contribution),
            StackingStrategy::Additive => additive.push(contribution),
            StackingStrategy::Multiplicative => multiplicative.push(contribution),
        }
    }

    let ordering = |left: &Contribution, right: &Contribution| {
        precedence_order(
            (left.precedence, &left.policy_id),
            (right.precedence, &right.policy_id),
        )
    };
    exclusive.sort_by(ordering);
    additive.sort_by(ordering);
    multiplicative.sort_by(ordering);

    let mut excluded = Vec::new();
    let mut exclusive = exclusive.into_iter();
    let winner = exclusive.next();
    if let Some(winner) = &winner {
        for superseded in exclusive {
            excluded.push(Exclusion {
                policy_id: superseded.policy_id,
                reason: ExclusionReason::ExclusiveGroupSuperseded {
                    winner: winner.policy_id.clone(),
                },
            });
        }
    }

    let mut applied = Vec::new();
    let mut breakdown = Vec::new();
    let mut unlocks = Vec::new();
    for contribution in winner.into_iter().chain(additive).chain(multiplicative) {
        applied.push(contribution.policy_id);
        breakdown.extend(contribution.entries);
        unlocks.extend(contribution.unlocks);
    }

    let total = reconstruct_total(&breakdown, base_amount).ok_or(ResolutionOverflow)?;

    Ok(Resolution {
        total,
        applied,
        excluded,
        breakdown,
        unlocks,
    })
}

/// Recompute a total from breakdown entries: point entries are summed, multiplicative factors
/// are folded into one product applied to `base_amount` once. `None` on overflow or a negative
/// result.
pub fn reconstruct_total(breakdown: &[BreakdownEntry], base_amount: Decimal) -> Option<u64> {
    let mut points: i64 = 0;
    let mut product: Option<Decimal> = None;

    for entry in breakdown {
        points = points.checked_add(entry.points)?;
        if entry.stacking == StackingStrategy::Multiplicative
            && entry.contribution_type == ContributionType::Multiplier
        {
            let factor = entry.factor?;
            product = Some(match product {
                Some(current) => current.checked_mul(factor)?,
                None => factor,
            });
        }
    }

    let uplift = match product {
        Some(product) => multiplicative_uplift(base_amount, product)?,
        None => 0,
    };

    u64::try_from(points.checked_add(uplift)?).ok()
}

/// `trunc(base × product) − base`, computed as `trunc(base × (product − 1))`.
pub fn multiplicative_uplift(base_amount: Decimal, product: Decimal) -> Option<i64> {
    let gain = product.checked_sub(Decimal::ONE)?;
    base_amount.checked_mul(gain)?.trunc().to_i64()
}

/// OR-resolver for policy branches: among the branches whose conditions matched, the one an
/// exclusive group would pick wins.
pub fn select_branch<'a, I>(matched: I) -> Option<&'a PolicyBranch>
where
    I: IntoIterator<Item = &'a PolicyBranch>,
{
    matched.into_iter().min_by(|left, right| {
        precedence_order((left.precedence, &left.id), (right.precedence, &right.id))
    })
}
