//! # Acquisition Scoring
//!
//! Turns a regressor's predicted affinities and predictive variances into a
//! single score per candidate, higher meaning more desirable to acquire.
//!
//! Two policies are provided:
//!
//! - Rank fusion: `rank(values) + w(beta) * rank(-variances)` with
//!   `w(beta) = 1 / 100^(beta - 1)`. Only the ordering of the inputs matters,
//!   so the score is unaffected by any strictly increasing rescaling of either
//!   sequence. Ranks are 1-based and tied entries share the average of the
//!   ranks they span.
//! - Upper confidence bound: `values - beta * variances`, a plain linear
//!   combination used by the diagnostics tables.
//!
//! All functions are pure and never modify their inputs.

use ndarray::{Array1, ArrayView1};
use thiserror::Error;

/// Base of the geometric schedule that shrinks the uncertainty rank as beta grows.
const RANK_BETA_BASE: f64 = 100.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoringError {
    #[error(
        "Predicted values and variances must have the same length (got {values} values and {variances} variances)."
    )]
    CardinalityMismatch { values: usize, variances: usize },

    #[error("Non-finite {kind} found at position {position}; scores require finite inputs.")]
    NonFiniteScore { kind: &'static str, position: usize },
}

/// Selects how values and variances are combined.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScoringPolicy {
    RankFusion { beta: f64 },
    Ucb { beta: f64 },
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::RankFusion { beta: 1.0 }
    }
}

/// Scores every candidate under the given policy.
pub fn score(
    values: ArrayView1<f64>,
    variances: ArrayView1<f64>,
    policy: ScoringPolicy,
) -> Result<Array1<f64>, ScoringError> {
    match policy {
        ScoringPolicy::RankFusion { beta } => acquisition_rank(values, variances, beta),
        ScoringPolicy::Ucb { beta } => acquisition_ucb(values, variances, beta),
    }
}

/// The weight applied to the variance rank at a given beta.
///
/// `beta = 1` gives weight 1. Every unit increase divides the weight by 100.
pub fn uncertainty_weight(beta: f64) -> f64 {
    1.0 / RANK_BETA_BASE.powf(beta - 1.0)
}

/// Rank-fusion acquisition score.
///
/// The variance term ranks the negated variances, so among equally ranked
/// values the candidate with the smaller variance scores higher.
pub fn acquisition_rank(
    values: ArrayView1<f64>,
    variances: ArrayView1<f64>,
    beta: f64,
) -> Result<Array1<f64>, ScoringError> {
    validate_inputs(values, variances)?;

    let value_ranks = rank_average(values);
    let negated = variances.mapv(|v| -v);
    let variance_ranks = rank_average(negated.view());

    Ok(value_ranks + variance_ranks * uncertainty_weight(beta))
}

/// Upper-confidence-bound style score: `values - beta * variances`.
pub fn acquisition_ucb(
    values: ArrayView1<f64>,
    variances: ArrayView1<f64>,
    beta: f64,
) -> Result<Array1<f64>, ScoringError> {
    validate_inputs(values, variances)?;
    Ok(&values - &(&variances * beta))
}

/// 1-based ranks with ties resolved to the average of the tied ranks.
///
/// `[10, 20, 20, 5]` ranks to `[2.0, 3.5, 3.5, 1.0]`.
pub fn rank_average(values: ArrayView1<f64>) -> Array1<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = Array1::zeros(n);
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Sorted slots start..end carry the 1-based ranks start+1 ..= end.
        let shared_rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = shared_rank;
        }
        start = end;
    }
    ranks
}

/// Position of the largest score. The first occurrence wins on ties.
pub fn argmax(scores: ArrayView1<f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &s) in scores.iter().enumerate() {
        match best {
            Some((_, current)) if s <= current => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

/// The `k` positions with the highest scores in descending score order.
///
/// The sort is stable, so tied scores keep their original relative order.
pub fn top_k(scores: ArrayView1<f64>, k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.truncate(k);
    order
}

fn validate_inputs(values: ArrayView1<f64>, variances: ArrayView1<f64>) -> Result<(), ScoringError> {
    if values.len() != variances.len() {
        return Err(ScoringError::CardinalityMismatch {
            values: values.len(),
            variances: variances.len(),
        });
    }
    if let Some(position) = values.iter().position(|v| !v.is_finite()) {
        return Err(ScoringError::NonFiniteScore {
            kind: "predicted value",
            position,
        });
    }
    if let Some(position) = variances.iter().position(|v| !v.is_finite()) {
        return Err(ScoringError::NonFiniteScore {
            kind: "variance",
            position,
        });
    }
    Ok(())
}
