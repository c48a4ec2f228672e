//! Market resolution: the payout vector of a resolved condition.

use crate::domain::{ConditionId, Decimal, OutcomeIndex, TimeMs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("payout denominator must be > 0")]
    ZeroDenominator,
    #[error("payout vector is empty")]
    EmptyPayouts,
    #[error("payout numerators sum to {sum}, above denominator {denominator}")]
    Overpaid { sum: u64, denominator: u64 },
    #[error("winning outcome {index} outside {count} outcomes")]
    WinnerOutOfRange { index: OutcomeIndex, count: usize },
}

/// Resolved outcome of a condition.
///
/// Invariant (checked by [`MarketResolution::validate`]):
/// `sum(payout_numerators) <= payout_denominator` and `payout_denominator > 0`, so every
/// outcome price `payout_numerators[i] / payout_denominator` lies in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketResolution {
    pub condition_id: ConditionId,
    pub winning_outcome_index: OutcomeIndex,
    pub payout_numerators: Vec<u64>,
    pub payout_denominator: u64,
    pub resolved_at: TimeMs,
}

impl MarketResolution {
    pub fn new(
        condition_id: ConditionId,
        winning_outcome_index: OutcomeIndex,
        payout_numerators: Vec<u64>,
        payout_denominator: u64,
        resolved_at: TimeMs,
    ) -> Result<Self, ResolutionError> {
        let resolution = Self {
            condition_id,
            winning_outcome_index,
            payout_numerators,
            payout_denominator,
            resolved_at,
        };
        resolution.validate()?;
        Ok(resolution)
    }

    /// Binary resolution where `winner` pays 1 and the other outcome pays 0.
    pub fn binary(condition_id: ConditionId, winner: OutcomeIndex, resolved_at: TimeMs) -> Self {
        let payout_numerators = if winner == 0 { vec![1, 0] } else { vec![0, 1] };
        Self {
            condition_id,
            winning_outcome_index: winner,
            payout_numerators,
            payout_denominator: 1,
            resolved_at,
        }
    }

    pub fn validate(&self) -> Result<(), ResolutionError> {
        if self.payout_denominator == 0 {
            return Err(ResolutionError::ZeroDenominator);
        }
        if self.payout_numerators.is_empty() {
            return Err(ResolutionError::EmptyPayouts);
        }
        let sum = self
            .payout_numerators
            .iter()
            .fold(0u64, |acc, n| acc.saturating_add(*n));
        if sum > self.payout_denominator {
            return Err(ResolutionError::Overpaid {
                sum,
                denominator: self.payout_denominator,
            });
        }
        if self.winning_outcome_index as usize >= self.payout_numerators.len() {
            return Err(ResolutionError::WinnerOutOfRange {
                index: self.winning_outcome_index,
                count: self.payout_numerators.len(),
            });
        }
        Ok(())
    }

    pub fn outcome_count(&self) -> usize {
        self.payout_numerators.len()
    }

    /// Settlement value of one share of `outcome`. `None` when the index is out of range.
    pub fn payout_price(&self, outcome: OutcomeIndex) -> Option<Decimal> {
        let numerator = *self.payout_numerators.get(outcome as usize)?;
        Decimal::from_u64(numerator).checked_div(Decimal::from_u64(self.payout_denominator))
    }

    /// True when holders of `outcome` receive a non-zero payout.
    pub fn pays_out(&self, outcome: OutcomeIndex) -> bool {
        self.payout_numerators
            .get(outcome as usize)
            .map(|n| *n > 0)
            .unwrap_or(false)
    }
}
