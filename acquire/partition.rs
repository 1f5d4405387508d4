//! Partition state for the per-partition acquisition strategy.
//!
//! Members are stored once, by stable pair identifier, in an arena of slots.
//! Each slot carries a live flag; acquiring a member retires its slot instead
//! of shifting integer positions around. Current pool positions are derived on
//! demand from the unknown pool's identifier map, so the partition can never
//! point at a row that has already moved to the observed pool.

use crate::pool::Pool;
use crate::types::PairIndex;
use ahash::{AHashMap, AHashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PartitionError {
    #[error("A partition needs at least one group.")]
    NoPartitions,
    #[error("Pair {0} is assigned to more than one partition; partitions must be disjoint.")]
    OverlappingPartitions(PairIndex),
    #[error("Pair refers to chemical {chemical}, but cluster labels exist for only {n_labels} chemicals.")]
    UnknownChemical { chemical: usize, n_labels: usize },
    #[error("Cluster label {label} is outside the expected range 0..{n_partitions}.")]
    LabelOutOfRange { label: usize, n_partitions: usize },
    #[error("Pair {0} is not a live member of any partition.")]
    NotLive(PairIndex),
}

#[derive(Clone, Debug)]
struct Slot {
    id: PairIndex,
    live: bool,
}

/// Disjoint grouping of unknown pairs with per-member liveness.
#[derive(Clone, Debug)]
pub struct PartitionArena {
    slots: Vec<Slot>,
    /// Slot indices of each partition, in the order members were supplied.
    members: Vec<Vec<usize>>,
    slot_of: AHashMap<PairIndex, usize>,
}

impl PartitionArena {
    /// Builds an arena from explicit groups of identifiers.
    pub fn from_groups(groups: Vec<Vec<PairIndex>>) -> Result<Self, PartitionError> {
        if groups.is_empty() {
            return Err(PartitionError::NoPartitions);
        }

        let mut slots = Vec::new();
        let mut members = Vec::with_capacity(groups.len());
        let mut slot_of = AHashMap::new();

        for group in groups {
            let mut slot_indices = Vec::with_capacity(group.len());
            for id in group {
                if slot_of.insert(id, slots.len()).is_some() {
                    return Err(PartitionError::OverlappingPartitions(id));
                }
                slot_indices.push(slots.len());
                slots.push(Slot { id, live: true });
            }
            members.push(slot_indices);
        }

        Ok(Self {
            slots,
            members,
            slot_of,
        })
    }

    /// Assigns every unknown pair to the cluster of its chemical.
    ///
    /// `chemical_labels[c]` is the cluster of chemical `c`. Members of each
    /// partition keep the unknown pool's order.
    pub fn from_chemical_clusters(
        unknown: &Pool,
        chemical_labels: &[usize],
        n_partitions: usize,
    ) -> Result<Self, PartitionError> {
        if n_partitions == 0 {
            return Err(PartitionError::NoPartitions);
        }

        let mut groups: Vec<Vec<PairIndex>> = vec![Vec::new(); n_partitions];
        for id in unknown.ids() {
            let label = *chemical_labels
                .get(id.chemical)
                .ok_or(PartitionError::UnknownChemical {
                    chemical: id.chemical,
                    n_labels: chemical_labels.len(),
                })?;
            if label >= n_partitions {
                return Err(PartitionError::LabelOutOfRange {
                    label,
                    n_partitions,
                });
            }
            groups[label].push(*id);
        }

        Self::from_groups(groups)
    }

    pub fn n_partitions(&self) -> usize {
        self.members.len()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    pub fn is_live(&self, id: &PairIndex) -> bool {
        self.slot_of
            .get(id)
            .is_some_and(|&slot| self.slots[slot].live)
    }

    /// Live identifiers of partition `partition`, in member order.
    pub fn live_members(&self, partition: usize) -> Vec<PairIndex> {
        self.members
            .get(partition)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|&&s| self.slots[s].live)
                    .map(|&s| self.slots[s].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Retires live members whose identifier is no longer in `unknown`.
    ///
    /// Returns how many members were retired.
    pub fn prune(&mut self, unknown: &Pool) -> usize {
        let present: AHashSet<PairIndex> = unknown.ids().iter().copied().collect();
        let mut retired = 0;
        for slot in self.slots.iter_mut().filter(|s| s.live) {
            if !present.contains(&slot.id) {
                slot.live = false;
                retired += 1;
            }
        }
        retired
    }

    /// Marks a member as acquired.
    pub fn retire(&mut self, id: PairIndex) -> Result<(), PartitionError> {
        match self.slot_of.get(&id) {
            Some(&slot) if self.slots[slot].live => {
                self.slots[slot].live = false;
                Ok(())
            }
            _ => Err(PartitionError::NotLive(id)),
        }
    }

    /// Current unknown-pool positions of each partition's live members.
    ///
    /// Members missing from `unknown` are skipped.
    pub fn positions(&self, unknown: &Pool) -> Vec<Vec<usize>> {
        let position_of = unknown.position_map();
        (0..self.n_partitions())
            .map(|partition| {
                self.live_members(partition)
                    .iter()
                    .filter_map(|id| position_of.get(id).copied())
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    fn unknown_pool(ids: &[(usize, usize)]) -> Pool {
        Pool::new(
            Array2::zeros((ids.len(), 1)),
            None,
            ids.iter().map(|&p| PairIndex::from(p)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_chemical_clusters_group_pairs_by_chemical() {
        let unknown = unknown_pool(&[(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]);
        let arena = PartitionArena::from_chemical_clusters(&unknown, &[1, 0, 1], 2).unwrap();

        assert_eq!(arena.n_partitions(), 2);
        assert_eq!(arena.positions(&unknown), vec![vec![1, 4], vec![0, 2, 3, 5]]);
        assert_eq!(arena.live_count(), 6);
    }

    #[test]
    fn test_retire_and_reindex_after_removal() {
        let unknown = unknown_pool(&[(0, 0), (1, 0), (2, 0), (3, 0), (4, 0)]);
        let mut arena = PartitionArena::from_groups(vec![
            vec![PairIndex::new(0, 0), PairIndex::new(3, 0)],
            vec![PairIndex::new(1, 0), PairIndex::new(2, 0), PairIndex::new(4, 0)],
        ])
        .unwrap();
        assert_eq!(arena.positions(&unknown), vec![vec![0, 3], vec![1, 2, 4]]);

        arena.retire(PairIndex::new(0, 0)).unwrap();
        arena.retire(PairIndex::new(2, 0)).unwrap();
        assert!(!arena.is_live(&PairIndex::new(0, 0)));
        assert_eq!(arena.live_count(), 3);

        // The pool after the two pairs have been moved out.
        let shrunk = unknown_pool(&[(1, 0), (3, 0), (4, 0)]);
        let positions = arena.positions(&shrunk);
        assert_eq!(positions, vec![vec![1], vec![0, 2]]);
        for group in &positions {
            assert!(group.iter().all(|&p| p < shrunk.len()));
        }

        assert_eq!(
            arena.retire(PairIndex::new(0, 0)),
            Err(PartitionError::NotLive(PairIndex::new(0, 0)))
        );
    }

    #[test]
    fn test_prune_drops_stale_members() {
        let mut arena = PartitionArena::from_groups(vec![
            vec![PairIndex::new(0, 0)],
            vec![PairIndex::new(1, 0), PairIndex::new(2, 0)],
        ])
        .unwrap();
        let unknown = unknown_pool(&[(2, 0), (0, 0)]);
        assert_eq!(arena.prune(&unknown), 1);
        assert_eq!(arena.live_members(1), vec![PairIndex::new(2, 0)]);
        assert_eq!(arena.positions(&unknown), vec![vec![1], vec![0]]);
    }

    #[test]
    fn test_invalid_groupings_are_rejected() {
        assert_eq!(
            PartitionArena::from_groups(Vec::new()).unwrap_err(),
            PartitionError::NoPartitions
        );
        assert_eq!(
            PartitionArena::from_groups(vec![
                vec![PairIndex::new(0, 0)],
                vec![PairIndex::new(0, 0)],
            ])
            .unwrap_err(),
            PartitionError::OverlappingPartitions(PairIndex::new(0, 0))
        );

        let unknown = Pool::new(array![[0.0]], None, vec![PairIndex::new(5, 0)]).unwrap();
        assert_eq!(
            PartitionArena::from_chemical_clusters(&unknown, &[0, 1], 2).unwrap_err(),
            PartitionError::UnknownChemical {
                chemical: 5,
                n_labels: 2
            }
        );
    }
}
