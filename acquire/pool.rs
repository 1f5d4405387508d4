//! # Observed / Unknown Pool Bookkeeping
//!
//! The dataset is split into two disjoint pools of chemical-protein pairs:
//! the observed pool (labels known, used for training) and the unknown pool
//! (candidates for acquisition). Each acquisition round moves a set of rows,
//! addressed by their position in the current unknown pool, into the observed
//! pool.
//!
//! Pools are values: `apply_acquisition` validates the whole request first and
//! then builds two fresh pools, so a rejected request leaves the caller's
//! pools exactly as they were.

use crate::types::PairIndex;
use ahash::{AHashMap, AHashSet};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, ShapeError, concatenate};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(
        "Pool row counts disagree: {features} feature rows, {labels} labels and {ids} identifiers."
    )]
    LengthMismatch {
        features: usize,
        labels: usize,
        ids: usize,
    },
    #[error("Identifier {0} appears more than once in the same pool.")]
    DuplicateIdentifier(PairIndex),
    #[error("Acquired position {position} is out of bounds for an unknown pool of {len} items.")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("Acquired position {0} was requested more than once in a single round.")]
    DuplicatePosition(usize),
    #[error(
        "Cannot move unlabelled pairs into a labelled observed pool; the unknown pool carries no affinities."
    )]
    UnlabeledAcquisition,
    #[error("Observed pool has {observed} feature columns but the unknown pool has {unknown}.")]
    FeatureWidthMismatch { observed: usize, unknown: usize },
    #[error("Failed to stack pool features: {0}")]
    Shape(#[from] ShapeError),
}

/// An ordered set of pairs with their feature rows and optional labels.
#[derive(Clone, Debug)]
pub struct Pool {
    features: Array2<f64>,
    labels: Option<Array1<f64>>,
    ids: Vec<PairIndex>,
}

impl Pool {
    pub fn new(
        features: Array2<f64>,
        labels: Option<Array1<f64>>,
        ids: Vec<PairIndex>,
    ) -> Result<Self, PoolError> {
        let label_len = labels.as_ref().map_or(ids.len(), |l| l.len());
        if features.nrows() != ids.len() || label_len != ids.len() {
            return Err(PoolError::LengthMismatch {
                features: features.nrows(),
                labels: label_len,
                ids: ids.len(),
            });
        }

        let mut seen = AHashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(*id) {
                return Err(PoolError::DuplicateIdentifier(*id));
            }
        }

        Ok(Self {
            features,
            labels,
            ids,
        })
    }

    /// A pool with no rows.
    pub fn empty(n_features: usize, labelled: bool) -> Self {
        Self {
            features: Array2::zeros((0, n_features)),
            labels: labelled.then(|| Array1::zeros(0)),
            ids: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn labels(&self) -> Option<ArrayView1<'_, f64>> {
        self.labels.as_ref().map(|l| l.view())
    }

    pub fn ids(&self) -> &[PairIndex] {
        &self.ids
    }

    pub fn label(&self, position: usize) -> Option<f64> {
        self.labels.as_ref().and_then(|l| l.get(position).copied())
    }

    /// Feature rows at `positions`, in the given order.
    pub fn rows(&self, positions: &[usize]) -> Array2<f64> {
        self.features.select(Axis(0), positions)
    }

    /// Maps every identifier to its current position in this pool.
    pub fn position_map(&self) -> AHashMap<PairIndex, usize> {
        self.ids
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos))
            .collect()
    }
}

/// Moves the rows at `positions` from `unknown` into `observed`.
///
/// The acquired rows are appended to the observed pool in the order given.
/// The remaining unknown rows keep their relative order.
pub fn apply_acquisition(
    observed: &Pool,
    unknown: &Pool,
    positions: &[usize],
) -> Result<(Pool, Pool), PoolError> {
    let mut acquired_mask = vec![false; unknown.len()];
    for &position in positions {
        if position >= unknown.len() {
            return Err(PoolError::PositionOutOfBounds {
                position,
                len: unknown.len(),
            });
        }
        if acquired_mask[position] {
            return Err(PoolError::DuplicatePosition(position));
        }
        acquired_mask[position] = true;
    }

    if positions.is_empty() {
        return Ok((observed.clone(), unknown.clone()));
    }

    if observed.n_features() != unknown.n_features() {
        return Err(PoolError::FeatureWidthMismatch {
            observed: observed.n_features(),
            unknown: unknown.n_features(),
        });
    }
    if observed.labels.is_some() && unknown.labels.is_none() {
        return Err(PoolError::UnlabeledAcquisition);
    }

    let retained: Vec<usize> = (0..unknown.len())
        .filter(|&pos| !acquired_mask[pos])
        .collect();

    let acquired_rows = unknown.rows(positions);
    let observed_features = concatenate(Axis(0), &[observed.features.view(), acquired_rows.view()])?;

    let observed_labels = match (&observed.labels, &unknown.labels) {
        (Some(obs), Some(unk)) => {
            let picked = unk.select(Axis(0), positions);
            Some(concatenate(Axis(0), &[obs.view(), picked.view()])?)
        }
        _ => None,
    };

    let mut observed_ids = Vec::with_capacity(observed.len() + positions.len());
    observed_ids.extend_from_slice(&observed.ids);
    observed_ids.extend(positions.iter().map(|&pos| unknown.ids[pos]));

    let next_observed = Pool {
        features: observed_features,
        labels: observed_labels,
        ids: observed_ids,
    };

    let next_unknown = Pool {
        features: unknown.rows(&retained),
        labels: unknown
            .labels
            .as_ref()
            .map(|l| l.select(Axis(0), &retained)),
        ids: retained.iter().map(|&pos| unknown.ids[pos]).collect(),
    };

    log::debug!(
        "Moved {} pairs: observed pool {} -> {}, unknown pool {} -> {}",
        positions.len(),
        observed.len(),
        next_observed.len(),
        unknown.len(),
        next_unknown.len()
    );

    Ok((next_observed, next_unknown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn pools() -> (Pool, Pool) {
        let observed = Pool::new(
            array![[0.0, 0.0], [1.0, 1.0]],
            Some(array![10.0, 11.0]),
            vec![PairIndex::new(0, 0), PairIndex::new(1, 1)],
        )
        .unwrap();
        let unknown = Pool::new(
            array![[2.0, 0.5], [3.0, 0.5], [4.0, 0.5], [5.0, 0.5], [6.0, 0.5]],
            Some(array![20.0, 30.0, 40.0, 50.0, 60.0]),
            vec![
                PairIndex::new(0, 1),
                PairIndex::new(1, 0),
                PairIndex::new(2, 0),
                PairIndex::new(2, 1),
                PairIndex::new(3, 0),
            ],
        )
        .unwrap();
        (observed, unknown)
    }

    #[test]
    fn test_apply_acquisition_moves_rows_in_given_order() {
        let (observed, unknown) = pools();
        let (obs, unk) = apply_acquisition(&observed, &unknown, &[3, 1]).unwrap();

        assert_eq!(obs.len(), 4);
        assert_eq!(unk.len(), 3);
        assert_eq!(
            obs.ids(),
            &[
                PairIndex::new(0, 0),
                PairIndex::new(1, 1),
                PairIndex::new(2, 1),
                PairIndex::new(1, 0)
            ]
        );
        assert_eq!(obs.labels().unwrap(), array![10.0, 11.0, 50.0, 30.0]);
        assert_eq!(obs.features().row(2), array![5.0, 0.5]);
        assert_eq!(obs.features().row(3), array![3.0, 0.5]);

        assert_eq!(
            unk.ids(),
            &[
                PairIndex::new(0, 1),
                PairIndex::new(2, 0),
                PairIndex::new(3, 0)
            ]
        );
        assert_eq!(unk.labels().unwrap(), array![20.0, 40.0, 60.0]);
        assert_eq!(unk.features().column(0), array![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_apply_acquisition_preserves_identifier_union() {
        let (observed, unknown) = pools();
        let mut before: Vec<PairIndex> = observed.ids().iter().chain(unknown.ids()).copied().collect();
        before.sort();

        for positions in [vec![0], vec![4, 0, 2], vec![0, 1, 2, 3, 4]] {
            let (obs, unk) = apply_acquisition(&observed, &unknown, &positions).unwrap();
            assert_eq!(unk.len() + positions.len(), unknown.len());
            assert_eq!(obs.len(), observed.len() + positions.len());

            let mut after: Vec<PairIndex> = obs.ids().iter().chain(unk.ids()).copied().collect();
            after.sort();
            assert_eq!(after, before);

            let obs_set: AHashSet<PairIndex> = obs.ids().iter().copied().collect();
            assert!(unk.ids().iter().all(|id| !obs_set.contains(id)));
        }
    }

    #[test]
    fn test_empty_acquisition_is_identity() {
        let (observed, unknown) = pools();
        let (obs, unk) = apply_acquisition(&observed, &unknown, &[]).unwrap();
        assert_eq!(obs.ids(), observed.ids());
        assert_eq!(unk.ids(), unknown.ids());
    }

    #[test]
    fn test_out_of_bounds_and_duplicate_positions_rejected() {
        let (observed, unknown) = pools();
        match apply_acquisition(&observed, &unknown, &[1, 5]) {
            Err(PoolError::PositionOutOfBounds { position, len }) => {
                assert_eq!(position, 5);
                assert_eq!(len, 5);
            }
            other => panic!("Expected PositionOutOfBounds, got {:?}", other.map(|_| ())),
        }
        match apply_acquisition(&observed, &unknown, &[2, 0, 2]) {
            Err(PoolError::DuplicatePosition(pos)) => assert_eq!(pos, 2),
            other => panic!("Expected DuplicatePosition, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unlabelled_unknown_pool_cannot_feed_labelled_observed_pool() {
        let (observed, unknown) = pools();
        let unlabelled = Pool::new(
            unknown.features().to_owned(),
            None,
            unknown.ids().to_vec(),
        )
        .unwrap();
        assert!(matches!(
            apply_acquisition(&observed, &unlabelled, &[0]),
            Err(PoolError::UnlabeledAcquisition)
        ));
    }

    #[test]
    fn test_pool_construction_validates_shapes_and_identifiers() {
        let err = Pool::new(
            array![[1.0], [2.0]],
            Some(array![1.0]),
            vec![PairIndex::new(0, 0), PairIndex::new(0, 1)],
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::LengthMismatch { .. }));

        let err = Pool::new(
            array![[1.0], [2.0]],
            None,
            vec![PairIndex::new(0, 0), PairIndex::new(0, 0)],
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::DuplicateIdentifier(id) if id == PairIndex::new(0, 0)));
    }

    #[test]
    fn test_position_map_tracks_current_positions() {
        let (_, unknown) = pools();
        let map = unknown.position_map();
        assert_eq!(map[&PairIndex::new(2, 0)], 2);
        assert_eq!(map.len(), unknown.len());
        assert_eq!(unknown.label(4), Some(60.0));
        assert_eq!(unknown.label(9), None);
    }
}
