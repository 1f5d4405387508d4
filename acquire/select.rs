//! # Candidate Selection
//!
//! Chooses which unknown pairs to acquire in a round. Every strategy asks the
//! regressor for predictions over some subset of the unknown pool, scores
//! them with the rank-fusion policy and returns positions into the *current*
//! unknown pool.
//!
//! Strategies:
//!
//! 1. Global top-k over the whole pool, in exploit or explore mode.
//! 2. Per quadrant (side, repurpose, novel), each handled like (1).
//! 3. Per protein, one pick each.
//! 4. Per partition (k-means clusters of chemicals or a supplied grouping),
//!    one pick each.
//!
//! `acquire` dispatches on the closed `AcquisitionScheme` enum.
//!
//! Groups without candidates are skipped with a warning. A request where no
//! group has any candidate fails with `EmptyCandidateSet`.

use crate::iterate::RoundState;
use crate::kmeans::{KMeansError, kmeans};
use crate::partition::{PartitionArena, PartitionError};
use crate::pool::Pool;
use crate::regressor::{ModelError, Regressor};
use crate::scoring::{ScoringError, acquisition_rank, argmax, top_k};
use crate::types::{PairIndex, Prediction, Quadrants, SelectionMode};
use ahash::AHashSet;
use itertools::Itertools;
use ndarray::ArrayView2;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of k-means initializations used when a partition must be computed.
pub const DEFAULT_KMEANS_RESTARTS: usize = 3;

/// Rounds run by default for the partition scheme.
const PARTITION_ROUNDS: usize = 5;
/// Rounds run by default for every other scheme.
const STANDARD_ROUNDS: usize = 30;

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error(
        "Unrecognised acquisition scheme '{0}'. Expected one of: exploit, explore, quad, quadexplore, perprot, partition."
    )]
    InvalidScheme(String),

    #[error("The number of candidates per round must be at least 1.")]
    InvalidCandidateCount,

    #[error("No unknown candidates are available in {group}.")]
    EmptyCandidateSet { group: String },

    #[error(
        "The regressor returned {found} predictions for {expected} inputs while scoring {context}."
    )]
    CardinalityMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error(
        "Partition acquisition selected {found} distinct pairs but {expected} partitions had candidates."
    )]
    PartitionSizeMismatch { expected: usize, found: usize },

    #[error("The quadrant schemes need quadrant assignments, but none were loaded.")]
    MissingQuadrants,

    #[error("Scoring {context} failed: {source}")]
    Scoring {
        context: String,
        source: ScoringError,
    },

    #[error("Prediction over {context} failed: {source}")]
    Model { context: String, source: ModelError },

    #[error("Partition bookkeeping failed: {0}")]
    Partition(#[from] PartitionError),

    #[error("Clustering chemicals for the partition scheme failed: {0}")]
    KMeans(#[from] KMeansError),
}

/// The acquisition strategy for a run, with exactly the parameters it needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionScheme {
    Exploit { n_candidates: usize },
    Explore { n_candidates: usize },
    Quadrant { n_candidates: usize, mode: SelectionMode },
    PerProtein,
    Partition { n_partitions: usize, restarts: usize },
}

impl Default for AcquisitionScheme {
    fn default() -> Self {
        Self::Exploit { n_candidates: 1 }
    }
}

impl AcquisitionScheme {
    /// Builds a scheme from its command-line name.
    pub fn from_name(name: &str, n_candidates: usize) -> Result<Self, AcquisitionError> {
        if n_candidates == 0 {
            return Err(AcquisitionError::InvalidCandidateCount);
        }
        let scheme = match name {
            "exploit" => Self::Exploit { n_candidates },
            "explore" => Self::Explore { n_candidates },
            "quad" => Self::Quadrant {
                n_candidates,
                mode: SelectionMode::Exploit,
            },
            "quadexplore" => Self::Quadrant {
                n_candidates,
                mode: SelectionMode::Explore,
            },
            "perprot" => Self::PerProtein,
            "partition" => Self::Partition {
                n_partitions: n_candidates,
                restarts: DEFAULT_KMEANS_RESTARTS,
            },
            other => return Err(AcquisitionError::InvalidScheme(other.to_string())),
        };
        Ok(scheme)
    }

    /// Overrides the k-means restart count of the partition scheme.
    pub fn with_kmeans_restarts(self, restarts: usize) -> Self {
        match self {
            Self::Partition { n_partitions, .. } => Self::Partition {
                n_partitions,
                restarts,
            },
            other => other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Exploit { .. } => "exploit",
            Self::Explore { .. } => "explore",
            Self::Quadrant {
                mode: SelectionMode::Exploit,
                ..
            } => "quad",
            Self::Quadrant {
                mode: SelectionMode::Explore,
                ..
            } => "quadexplore",
            Self::PerProtein => "perprot",
            Self::Partition { .. } => "partition",
        }
    }

    /// How many rounds a campaign with this scheme runs unless overridden.
    pub fn default_rounds(&self) -> usize {
        match self {
            Self::Partition { .. } => PARTITION_ROUNDS,
            _ => STANDARD_ROUNDS,
        }
    }
}

impl fmt::Display for AcquisitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AcquisitionScheme {
    type Err = AcquisitionError;

    /// Parses a scheme name with a single candidate per round.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s, 1)
    }
}

/// One acquired pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Pick {
    /// Position in the unknown pool the selection was made against.
    pub position: usize,
    pub id: PairIndex,
    pub predicted: f64,
    pub variance: f64,
    /// The true label, when the unknown pool carries labels.
    pub observed: Option<f64>,
}

/// The picks of one round, in the order they are moved to the observed pool.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selection {
    pub picks: Vec<Pick>,
}

impl Selection {
    pub fn positions(&self) -> Vec<usize> {
        self.picks.iter().map(|p| p.position).collect()
    }

    pub fn len(&self) -> usize {
        self.picks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.picks.is_empty()
    }
}

/// The outcome of `acquire`: the picks plus the partition state to carry forward.
#[derive(Clone, Debug)]
pub struct Acquired {
    pub selection: Selection,
    pub partition: Option<PartitionArena>,
}

fn predict_checked(
    regressor: &dyn Regressor,
    x: ArrayView2<f64>,
    context: &str,
) -> Result<Prediction, AcquisitionError> {
    let prediction = regressor
        .predict(x)
        .map_err(|source| AcquisitionError::Model {
            context: context.to_string(),
            source,
        })?;
    let found = prediction.values.len().max(prediction.variances.len());
    if prediction.values.len() != x.nrows() || prediction.variances.len() != x.nrows() {
        return Err(AcquisitionError::CardinalityMismatch {
            context: context.to_string(),
            expected: x.nrows(),
            found,
        });
    }
    Ok(prediction)
}

fn rank_scores(
    prediction: &Prediction,
    beta: f64,
    context: &str,
) -> Result<ndarray::Array1<f64>, AcquisitionError> {
    acquisition_rank(prediction.values(), prediction.variances(), beta).map_err(|source| {
        AcquisitionError::Scoring {
            context: context.to_string(),
            source,
        }
    })
}

/// Local positions chosen within one scored group.
///
/// Exploit returns the `n` best rank-fusion scores in descending order.
/// Explore returns the ascending, deduplicated argmax positions for every
/// integer beta in `1..=n`, so it can return fewer than `n` positions.
fn choose(
    prediction: &Prediction,
    n: usize,
    mode: SelectionMode,
    context: &str,
) -> Result<Vec<usize>, AcquisitionError> {
    match mode {
        SelectionMode::Exploit => {
            let scores = rank_scores(prediction, 1.0, context)?;
            Ok(top_k(scores.view(), n))
        }
        SelectionMode::Explore => {
            let mut chosen = Vec::with_capacity(n);
            for beta in 1..=n {
                let scores = rank_scores(prediction, beta as f64, context)?;
                chosen.extend(argmax(scores.view()));
            }
            Ok(chosen.into_iter().sorted_unstable().dedup().collect())
        }
    }
}

fn make_pick(unknown: &Pool, position: usize, prediction: &Prediction, local: usize) -> Pick {
    Pick {
        position,
        id: unknown.ids()[position],
        predicted: prediction.values[local],
        variance: prediction.variances[local],
        observed: unknown.label(position),
    }
}

fn log_pick(pick: &Pick) {
    match pick.observed {
        Some(real) => log::info!(
            "\tAcquire element {} with real Kd value {}",
            pick.id,
            real
        ),
        None => log::info!(
            "\tAcquire element {} with predicted Kd value {:.3} and variance {:.3}",
            pick.id,
            pick.predicted,
            pick.variance
        ),
    }
}

/// Global top-k over the whole unknown pool.
pub fn select_candidates(
    regressor: &dyn Regressor,
    unknown: &Pool,
    n_candidates: usize,
    mode: SelectionMode,
) -> Result<Selection, AcquisitionError> {
    if unknown.is_empty() {
        return Err(AcquisitionError::EmptyCandidateSet {
            group: "the unknown pool".to_string(),
        });
    }

    match mode {
        SelectionMode::Exploit => log::info!("Exploiting..."),
        SelectionMode::Explore => log::info!("Exploring..."),
    }

    let context = "the unknown pool";
    let prediction = predict_checked(regressor, unknown.features(), context)?;
    let chosen = choose(&prediction, n_candidates, mode, context)?;

    let picks: Vec<Pick> = chosen
        .into_iter()
        .map(|i| make_pick(unknown, i, &prediction, i))
        .collect();
    picks.iter().for_each(log_pick);

    Ok(Selection { picks })
}

/// Runs the global strategy independently inside each quadrant.
///
/// Picks are concatenated in quadrant order (side, repurpose, novel).
pub fn select_candidates_per_quadrant(
    regressor: &dyn Regressor,
    unknown: &Pool,
    quadrants: &Quadrants,
    n_candidates: usize,
    mode: SelectionMode,
) -> Result<Selection, AcquisitionError> {
    let mut picks = Vec::new();
    let mut scored_groups = 0usize;

    for (name, members) in quadrants.groups() {
        match mode {
            SelectionMode::Exploit => log::info!("Considering quadrant {name}"),
            SelectionMode::Explore => log::info!("Exploring quadrant {name}"),
        }

        let positions: Vec<usize> = unknown
            .ids()
            .iter()
            .enumerate()
            .filter(|(_, id)| members.contains(*id))
            .map(|(pos, _)| pos)
            .collect();
        if positions.is_empty() {
            log::warn!("Quadrant {name} has no unknown candidates left; skipping it");
            continue;
        }
        scored_groups += 1;

        let context = format!("quadrant {name}");
        let prediction = predict_checked(regressor, unknown.rows(&positions).view(), &context)?;
        let chosen = choose(&prediction, n_candidates, mode, &context)?;

        for local in chosen {
            let pick = make_pick(unknown, positions[local], &prediction, local);
            log_pick(&pick);
            picks.push(pick);
        }
    }

    if scored_groups == 0 {
        return Err(AcquisitionError::EmptyCandidateSet {
            group: "every quadrant".to_string(),
        });
    }
    Ok(Selection { picks })
}

/// One top-scoring pair per protein, in protein order.
pub fn select_candidates_per_protein(
    regressor: &dyn Regressor,
    unknown: &Pool,
    proteins: &[String],
) -> Result<Selection, AcquisitionError> {
    let mut picks = Vec::with_capacity(proteins.len());

    for (protein_idx, protein) in proteins.iter().enumerate() {
        let positions: Vec<usize> = unknown
            .ids()
            .iter()
            .enumerate()
            .filter(|(_, id)| id.protein == protein_idx)
            .map(|(pos, _)| pos)
            .collect();
        if positions.is_empty() {
            log::warn!("Protein {protein} has no unknown candidates left; skipping it");
            continue;
        }

        let context = format!("protein {protein}");
        let prediction = predict_checked(regressor, unknown.rows(&positions).view(), &context)?;
        let scores = rank_scores(&prediction, 1.0, &context)?;
        let Some(local) = argmax(scores.view()) else {
            continue;
        };

        let pick = make_pick(unknown, positions[local], &prediction, local);
        log::info!("Protein {protein}");
        log_pick(&pick);
        picks.push(pick);
    }

    if picks.is_empty() {
        return Err(AcquisitionError::EmptyCandidateSet {
            group: "every protein".to_string(),
        });
    }
    Ok(Selection { picks })
}

/// One top-scoring pair per partition.
///
/// Returns the picks sorted by pool position together with a copy of the
/// arena in which the acquired members have been retired. Once the picks are
/// moved out of the pool, every live member of the returned arena still maps
/// to a row of the shrunken unknown pool.
pub fn select_candidates_per_partition(
    regressor: &dyn Regressor,
    unknown: &Pool,
    arena: &PartitionArena,
) -> Result<(Selection, PartitionArena), AcquisitionError> {
    let mut arena = arena.clone();
    let stale = arena.prune(unknown);
    if stale > 0 {
        log::debug!("Dropped {stale} partition members no longer in the unknown pool");
    }

    let groups = arena.positions(unknown);
    let mut picks = Vec::with_capacity(groups.len());
    let mut scored_groups = 0usize;

    for (partition, positions) in groups.iter().enumerate() {
        if positions.is_empty() {
            log::warn!("Partition {partition} has no unknown candidates left; skipping it");
            continue;
        }
        scored_groups += 1;

        let context = format!("partition {partition}");
        let prediction = predict_checked(regressor, unknown.rows(positions).view(), &context)?;
        let scores = rank_scores(&prediction, 1.0, &context)?;
        let local = argmax(scores.view()).ok_or_else(|| AcquisitionError::EmptyCandidateSet {
            group: context.clone(),
        })?;

        let pick = make_pick(unknown, positions[local], &prediction, local);
        log::info!("Partition {partition}");
        log_pick(&pick);
        arena.retire(pick.id)?;
        picks.push(pick);
    }

    if scored_groups == 0 {
        return Err(AcquisitionError::EmptyCandidateSet {
            group: "every partition".to_string(),
        });
    }

    picks.sort_by_key(|p| p.position);
    let distinct: AHashSet<usize> = picks.iter().map(|p| p.position).collect();
    if distinct.len() != scored_groups || picks.len() != scored_groups {
        return Err(AcquisitionError::PartitionSizeMismatch {
            expected: scored_groups,
            found: distinct.len(),
        });
    }

    Ok((Selection { picks }, arena))
}

/// Clusters the catalog's chemicals and assigns every unknown pair to the
/// cluster of its chemical.
pub fn build_partition<R: Rng>(
    state: &RoundState,
    n_partitions: usize,
    restarts: usize,
    rng: &mut R,
) -> Result<PartitionArena, AcquisitionError> {
    log::info!(
        "Partitioning {} chemicals into {} clusters ({} k-means restarts)",
        state.catalog.chemicals.len(),
        n_partitions,
        restarts
    );
    let fit = kmeans(
        state.catalog.chemical_features(),
        n_partitions,
        restarts,
        rng,
    )?;
    Ok(PartitionArena::from_chemical_clusters(
        &state.unknown,
        &fit.labels,
        n_partitions,
    )?)
}

/// Selects this round's acquisitions according to `scheme`.
///
/// The partition scheme reuses `state.partition` when present and otherwise
/// clusters the chemicals first. Other schemes pass the partition through.
pub fn acquire<R: Rng>(
    regressor: &dyn Regressor,
    state: &RoundState,
    scheme: &AcquisitionScheme,
    rng: &mut R,
) -> Result<Acquired, AcquisitionError> {
    let unknown = &state.unknown;
    let selection = match *scheme {
        AcquisitionScheme::Exploit { n_candidates } => {
            select_candidates(regressor, unknown, n_candidates, SelectionMode::Exploit)?
        }
        AcquisitionScheme::Explore { n_candidates } => {
            select_candidates(regressor, unknown, n_candidates, SelectionMode::Explore)?
        }
        AcquisitionScheme::Quadrant { n_candidates, mode } => {
            let quadrants = state
                .quadrants
                .as_deref()
                .ok_or(AcquisitionError::MissingQuadrants)?;
            select_candidates_per_quadrant(regressor, unknown, quadrants, n_candidates, mode)?
        }
        AcquisitionScheme::PerProtein => {
            select_candidates_per_protein(regressor, unknown, &state.catalog.proteins)?
        }
        AcquisitionScheme::Partition {
            n_partitions,
            restarts,
        } => {
            let arena = match &state.partition {
                Some(existing) => existing.clone(),
                None => build_partition(state, n_partitions, restarts, rng)?,
            };
            let (selection, arena) = select_candidates_per_partition(regressor, unknown, &arena)?;
            return Ok(Acquired {
                selection,
                partition: Some(arena),
            });
        }
    };

    Ok(Acquired {
        selection,
        partition: state.partition.clone(),
    })
}
