//! Greedy calibration of token → outcome assignments against a ground-truth P&L.
//!
//! The search is a pure function of its inputs: the same problem always yields the same
//! assignment, iteration count and error.

use crate::domain::{
    Address, ConditionId, Decimal, MarketResolution, MappingSource, MappingStatus, OutcomeIndex,
    SettlementEvent, SettlementPolicy, TokenId, TokenOutcomeMapping, TradeEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use super::partition::{fold_all, partition_events, FoldInput};
use super::settlement::settle_position;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationConfig {
    /// Largest acceptable |error| as a percentage of |ground truth|.
    pub tolerance_pct: Decimal,
    /// Iteration cap is `iteration_factor * token_count`.
    pub iteration_factor: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            tolerance_pct: Decimal::from_i64(5),
            iteration_factor: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundTruthMethod {
    /// USDC balance change plus resolution-marked value of held positions over the same events.
    BalanceDelta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub total_pnl: Decimal,
    pub method: GroundTruthMethod,
}

impl GroundTruth {
    pub fn balance_delta(total_pnl: Decimal) -> Self {
        Self {
            total_pnl,
            method: GroundTruthMethod::BalanceDelta,
        }
    }
}

/// One wallet's view of an ambiguous condition.
#[derive(Debug, Clone)]
pub struct CalibrationProblem {
    pub wallet: Address,
    pub condition_id: ConditionId,
    pub outcome_count: u32,
    /// Outcomes a token may be assigned to: the slots no production mapping holds. Empty
    /// means every outcome of the condition.
    pub candidate_outcomes: Vec<OutcomeIndex>,
    /// Tokens to assign, in a fixed order.
    pub tokens: Vec<TokenId>,
    /// The wallet's trades on `tokens`, plus trades already attached to the condition.
    pub trades: Vec<TradeEvent>,
    /// The wallet's settlements on the condition.
    pub settlements: Vec<SettlementEvent>,
    pub resolution: Option<MarketResolution>,
    /// Wallet P&L outside this condition.
    pub baseline: Decimal,
    pub ground_truth: GroundTruth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalibrationOutcome {
    pub condition_id: ConditionId,
    pub assignment: Vec<OutcomeIndex>,
    pub computed_pnl: Decimal,
    pub error: Decimal,
    pub iterations: usize,
    pub confidence: Decimal,
    pub converged: bool,
    pub mappings: Vec<TokenOutcomeMapping>,
}

/// Baseline plus the condition's P&L under the symmetric policy for one assignment.
pub fn evaluate_assignment(problem: &CalibrationProblem, assignment: &[OutcomeIndex]) -> Decimal {
    let outcome_of: HashMap<&TokenId, OutcomeIndex> =
        problem.tokens.iter().zip(assignment.iter().copied()).collect();

    let trades: Vec<TradeEvent> = problem
        .trades
        .iter()
        .filter_map(|t| match outcome_of.get(&t.token_id) {
            Some(outcome) => Some(t.with_outcome(problem.condition_id.clone(), *outcome)),
            // tokens already mapped on this condition keep their outcome
            None if t.condition_id.as_ref() == Some(&problem.condition_id) => Some(t.clone()),
            None => None,
        })
        .collect();

    let mut counts = HashMap::new();
    counts.insert(problem.condition_id.clone(), problem.outcome_count);
    let parts = partition_events(&trades, &problem.settlements, &counts);

    let inputs = parts
        .partitions
        .into_iter()
        .map(|(key, legs)| FoldInput::fresh(key, legs, problem.resolution.clone()))
        .collect();

    let condition_pnl: Decimal = fold_all(inputs)
        .iter()
        .map(|out| {
            settle_position(
                &out.position,
                problem.resolution.as_ref(),
                SettlementPolicy::Symmetric,
            )
            .0
            .total_pnl()
        })
        .sum();

    problem.baseline + condition_pnl
}

impl CalibrationProblem {
    fn candidates(&self) -> Vec<OutcomeIndex> {
        if self.candidate_outcomes.is_empty() {
            (0..self.outcome_count.max(1)).collect()
        } else {
            self.candidate_outcomes.clone()
        }
    }
}

/// Greedy single-token search over the candidate outcomes.
///
/// Starts from token `i` → candidate `i mod N`. Each iteration tries every single-token
/// reassignment and takes the one with the smallest error (ties: lower token index, then lower
/// outcome index) if it strictly improves. Stops when nothing improves or after
/// `iteration_factor * token_count` iterations.
pub fn calibrate(problem: &CalibrationProblem, config: &CalibrationConfig) -> CalibrationOutcome {
    let candidates = problem.candidates();
    let target = problem.ground_truth.total_pnl;
    let error_of = |assignment: &[OutcomeIndex]| {
        let computed = evaluate_assignment(problem, assignment);
        (computed, (computed - target).abs())
    };

    let mut assignment: Vec<OutcomeIndex> = (0..problem.tokens.len())
        .map(|i| candidates[i % candidates.len()])
        .collect();
    let (mut computed_pnl, mut error) = error_of(&assignment);
    let max_iterations = config.iteration_factor * problem.tokens.len();
    let mut iterations = 0usize;

    while iterations < max_iterations {
        let mut best: Option<(usize, OutcomeIndex, Decimal, Decimal)> = None;

        for token_index in 0..assignment.len() {
            for &outcome in &candidates {
                if assignment[token_index] == outcome {
                    continue;
                }
                let mut candidate = assignment.clone();
                candidate[token_index] = outcome;
                let (candidate_pnl, candidate_error) = error_of(&candidate);

                let better = match &best {
                    None => true,
                    Some((_, _, _, best_error)) => candidate_error < *best_error,
                };
                if better {
                    best = Some((token_index, outcome, candidate_pnl, candidate_error));
                }
            }
        }

        match best {
            Some((token_index, outcome, candidate_pnl, candidate_error))
                if candidate_error < error =>
            {
                debug!(
                    condition = %problem.condition_id,
                    token = %problem.tokens[token_index],
                    outcome,
                    error = %candidate_error,
                    "calibration step"
                );
                assignment[token_index] = outcome;
                computed_pnl = candidate_pnl;
                error = candidate_error;
                iterations += 1;
            }
            _ => break,
        }
    }

    let magnitude = target.abs();
    let (confidence, converged) = if magnitude.is_zero() {
        let exact = error.is_zero();
        (if exact { Decimal::one() } else { Decimal::zero() }, exact)
    } else {
        let confidence = (Decimal::one() - error / magnitude).clamp_to(Decimal::zero(), Decimal::one());
        let tolerance = magnitude * config.tolerance_pct / Decimal::hundred();
        (confidence, error <= tolerance)
    };

    let status = if converged {
        MappingStatus::Production
    } else {
        MappingStatus::LowConfidence
    };
    let mappings = problem
        .tokens
        .iter()
        .zip(assignment.iter())
        .map(|(token, outcome)| TokenOutcomeMapping {
            token_id: token.clone(),
            condition_id: problem.condition_id.clone(),
            outcome_index: *outcome,
            source: MappingSource::Calibrated,
            confidence,
            status,
        })
        .collect();

    info!(
        condition = %problem.condition_id,
        wallet = %problem.wallet,
        iterations,
        error = %error,
        converged,
        "calibration finished"
    );

    CalibrationOutcome {
        condition_id: problem.condition_id.clone(),
        assignment,
        computed_pnl,
        error,
        iterations,
        confidence,
        converged,
        mappings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKey, Side, TimeMs, TxHash};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn problem(ground_truth: &str) -> CalibrationProblem {
        let condition = ConditionId::new("0xc");
        let wallet = Address::new("0xa");
        let buy = |tx: &str, token: &str, shares: &str, price: &str| TradeEvent {
            key: EventKey::new(TxHash::new(tx), 0),
            wallet: wallet.clone(),
            token_id: TokenId::new(token),
            condition_id: None,
            outcome_index: None,
            side: Side::Buy,
            shares: d(shares),
            price: d(price),
            fee: Decimal::zero(),
            time_ms: TimeMs::new(1),
        };
        CalibrationProblem {
            wallet: wallet.clone(),
            condition_id: condition.clone(),
            outcome_count: 2,
            candidate_outcomes: vec![0, 1],
            tokens: vec![TokenId::new("a"), TokenId::new("b")],
            trades: vec![
                buy("0x01", "a", "120", "0.75"),
                buy("0x02", "b", "10", "0.6666"),
            ],
            settlements: vec![],
            resolution: Some(MarketResolution::binary(condition, 0, TimeMs::new(10))),
            baseline: Decimal::zero(),
            ground_truth: GroundTruth::balance_delta(d(ground_truth)),
        }
    }

    #[test]
    fn test_initial_assignment_evaluation() {
        let p = problem("-86.66");
        assert_eq!(evaluate_assignment(&p, &[0, 1]), d("23.334"));
        assert_eq!(evaluate_assignment(&p, &[1, 1]), d("-96.666"));
        assert_eq!(evaluate_assignment(&p, &[1, 0]), d("-86.666"));
    }

    #[test]
    fn test_converges_on_known_fixture() {
        let outcome = calibrate(&problem("-86.66"), &CalibrationConfig::default());
        assert!(outcome.converged);
        assert_eq!(outcome.assignment, vec![1, 0]);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.error, d("0.006"));
        assert!(outcome.confidence > d("0.99"));
        assert!(outcome
            .mappings
            .iter()
            .all(|m| m.status == MappingStatus::Production));
    }

    #[test]
    fn test_unreachable_ground_truth_diverges() {
        let outcome = calibrate(&problem("500"), &CalibrationConfig::default());
        assert!(!outcome.converged);
        assert!(outcome.iterations <= 6);
        assert!(outcome
            .mappings
            .iter()
            .all(|m| m.status == MappingStatus::LowConfidence));
    }

    #[test]
    fn test_is_deterministic() {
        let a = calibrate(&problem("-86.66"), &CalibrationConfig::default());
        let b = calibrate(&problem("-86.66"), &CalibrationConfig::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_iteration_factor_keeps_initial_assignment() {
        let config = CalibrationConfig {
            tolerance_pct: d("5"),
            iteration_factor: 0,
        };
        let outcome = calibrate(&problem("-86.66"), &config);
        assert_eq!(outcome.assignment, vec![0, 1]);
        assert_eq!(outcome.iterations, 0);
        assert!(!outcome.converged);
    }

    #[test]
    fn test_search_stays_on_free_outcomes() {
        // outcome 0 already belongs to a mapped token; both ambiguous tokens must land on 1
        let mut p = problem("-86.66");
        p.outcome_count = 3;
        p.candidate_outcomes = vec![1, 2];
        p.resolution = Some(
            MarketResolution::new(p.condition_id.clone(), 0, vec![1, 0, 0], 1, TimeMs::new(10))
                .unwrap(),
        );

        let outcome = calibrate(&p, &CalibrationConfig::default());
        assert!(outcome.assignment.iter().all(|o| *o != 0));
        assert!(outcome
            .mappings
            .iter()
            .all(|m| p.candidate_outcomes.contains(&m.outcome_index)));
    }

    #[test]
    fn test_single_free_outcome_fixes_assignment() {
        let mut p = problem("-86.66");
        p.candidate_outcomes = vec![1];

        let outcome = calibrate(&p, &CalibrationConfig::default());
        assert_eq!(outcome.assignment, vec![1, 1]);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.computed_pnl, d("-96.666"));
    }
}
