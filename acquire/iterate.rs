//! Round sequencing for an acquisition campaign.
//!
//! A round trains the regressor on the observed pool, selects candidates from
//! the unknown pool and moves them across. State is threaded through rounds as
//! a value: `iterate` borrows the previous state and returns a fresh one, so a
//! failed round leaves the caller's state exactly as it was.

use crate::partition::PartitionArena;
use crate::pool::{Pool, PoolError, apply_acquisition};
use crate::regressor::{ModelError, Regressor};
use crate::select::{AcquisitionError, AcquisitionScheme, Selection, acquire};
use crate::types::{Catalog, Quadrants};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoundError {
    #[error("Acquisition with scheme '{scheme}' failed: {source}")]
    Acquisition {
        scheme: &'static str,
        #[source]
        source: AcquisitionError,
    },
    #[error("Moving acquisitions chosen by scheme '{scheme}' into the observed pool failed: {source}")]
    Pool {
        scheme: &'static str,
        #[source]
        source: PoolError,
    },
    #[error("Training the {regressor} regressor before round {round} failed: {source}")]
    Training {
        regressor: &'static str,
        round: usize,
        #[source]
        source: ModelError,
    },
}

/// Everything a round needs besides the regressor.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub catalog: Arc<Catalog>,
    pub observed: Pool,
    pub unknown: Pool,
    /// Present when the dataset split produced quadrant assignments.
    pub quadrants: Option<Arc<Quadrants>>,
    /// Carried between rounds by the partition scheme.
    pub partition: Option<PartitionArena>,
}

/// Result of one `iterate` call.
#[derive(Clone, Debug)]
pub struct RoundOutcome {
    pub state: RoundState,
    pub selection: Selection,
}

/// Receives campaign progress. All methods default to doing nothing.
pub trait RoundObserver {
    fn on_round_start(&mut self, round: usize, total_rounds: usize) {
        let _ = (round, total_rounds);
    }
    /// Called after training, before selection, with the freshly fitted model.
    fn on_trained(&mut self, round: usize, regressor: &dyn Regressor, state: &RoundState) {
        let _ = (round, regressor, state);
    }
    fn on_round_complete(&mut self, round: usize, selection: &Selection, state: &RoundState) {
        let _ = (round, selection, state);
    }
}

#[derive(Default)]
pub struct NoopRoundObserver;

impl RoundObserver for NoopRoundObserver {}

/// Final state of a campaign plus a few counters for the closing log line.
#[derive(Clone, Debug)]
pub struct CampaignSummary {
    pub state: RoundState,
    pub rounds_completed: usize,
    pub acquired: usize,
    /// True when the campaign stopped because no unknown pairs were left.
    pub exhausted: bool,
}

/// Fits `regressor` on the observed pool.
pub fn train(regressor: &mut dyn Regressor, observed: &Pool) -> Result<(), ModelError> {
    let labels = observed.labels().ok_or(ModelError::MissingTargets)?;
    log::debug!(
        "Training {} on {} observed pairs",
        regressor.name(),
        observed.len()
    );
    regressor.fit(observed.features(), labels)
}

/// Runs one acquisition round against an already trained regressor.
pub fn iterate<R: Rng>(
    state: &RoundState,
    regressor: &dyn Regressor,
    scheme: &AcquisitionScheme,
    rng: &mut R,
) -> Result<RoundOutcome, RoundError> {
    let acquired =
        acquire(regressor, state, scheme, rng).map_err(|source| RoundError::Acquisition {
            scheme: scheme.name(),
            source,
        })?;

    let positions = acquired.selection.positions();
    let (observed, unknown) =
        apply_acquisition(&state.observed, &state.unknown, &positions).map_err(|source| {
            RoundError::Pool {
                scheme: scheme.name(),
                source,
            }
        })?;

    Ok(RoundOutcome {
        state: RoundState {
            catalog: Arc::clone(&state.catalog),
            observed,
            unknown,
            quadrants: state.quadrants.clone(),
            partition: acquired.partition,
        },
        selection: acquired.selection,
    })
}

/// Trains and iterates for up to `rounds` rounds.
///
/// Stops early once the unknown pool is empty.
pub fn run_campaign<R: Rng>(
    mut state: RoundState,
    regressor: &mut dyn Regressor,
    scheme: &AcquisitionScheme,
    rounds: usize,
    rng: &mut R,
    observer: &mut dyn RoundObserver,
) -> Result<CampaignSummary, RoundError> {
    let mut acquired = 0usize;
    let mut rounds_completed = 0usize;
    let mut exhausted = false;

    for round in 0..rounds {
        if state.unknown.is_empty() {
            log::info!("Unknown pool exhausted after {round} rounds; stopping early");
            exhausted = true;
            break;
        }

        log::info!("Iteration {round}");
        observer.on_round_start(round, rounds);

        train(regressor, &state.observed).map_err(|source| RoundError::Training {
            regressor: regressor.name(),
            round,
            source,
        })?;
        observer.on_trained(round, &*regressor, &state);

        let outcome = iterate(&state, &*regressor, scheme, rng)?;
        acquired += outcome.selection.len();
        rounds_completed += 1;
        observer.on_round_complete(round, &outcome.selection, &outcome.state);
        state = outcome.state;
    }

    if !exhausted && state.unknown.is_empty() {
        exhausted = true;
    }

    log::info!(
        "Campaign finished: {} rounds, {} pairs acquired, {} observed, {} unknown",
        rounds_completed,
        acquired,
        state.observed.len(),
        state.unknown.len()
    );

    Ok(CampaignSummary {
        state,
        rounds_completed,
        acquired,
        exhausted,
    })
}
