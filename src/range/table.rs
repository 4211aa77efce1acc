//! Assignment snapshots and deltas
//!
//! A snapshot is an immutable, versioned cover of the keyspace. Readers
//! share it behind an `Arc`; the assigner publishes a fresh one on every
//! change and keeps a short history so pollers can fetch deltas.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::keyspace::{KeyRange, KEYSPACE_END};
use crate::types::LeafId;

/// One range and its owner; `leaf_id` is `None` only while no leaf exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeAssignment {
    pub range: KeyRange,
    pub leaf_id: Option<LeafId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_address: Option<String>,
}

/// Versioned, sorted, gap-free cover of the keyspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    pub version: u64,
    pub assignments: Vec<RangeAssignment>,
}

/// Changes between two snapshot versions
///
/// With `full` set, `assignments` is a complete snapshot and `removed` is
/// empty. Otherwise `assignments` are upserts keyed by range and `removed`
/// lists ranges that no longer exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentDelta {
    pub version: u64,
    pub full: bool,
    #[serde(default)]
    pub assignments: Vec<RangeAssignment>,
    #[serde(default)]
    pub removed: Vec<KeyRange>,
}

impl AssignmentDelta {
    pub fn is_empty(&self) -> bool {
        !self.full && self.assignments.is_empty() && self.removed.is_empty()
    }
}

impl AssignmentSnapshot {
    pub fn new(version: u64, mut assignments: Vec<RangeAssignment>) -> Self {
        assignments.sort_by(|a, b| a.range.start.cmp(&b.range.start));
        Self {
            version,
            assignments,
        }
    }

    /// The range containing `key`, by binary search on range starts
    pub fn lookup(&self, key: &[u8]) -> Option<&RangeAssignment> {
        let idx = self
            .assignments
            .partition_point(|a| a.range.start.as_slice() <= key);
        let candidate = self.assignments.get(idx.checked_sub(1)?)?;
        candidate.range.contains(key).then_some(candidate)
    }

    /// Known leaves and their addresses
    pub fn leaves(&self) -> BTreeMap<LeafId, String> {
        self.assignments
            .iter()
            .filter_map(|a| Some((a.leaf_id?, a.leaf_address.clone()?)))
            .collect()
    }

    pub fn ranges_of(&self, leaf: LeafId) -> Vec<KeyRange> {
        self.assignments
            .iter()
            .filter(|a| a.leaf_id == Some(leaf))
            .map(|a| a.range.clone())
            .collect()
    }

    /// Ranges are sorted, contiguous, and span `[""; FF FF)`
    pub fn is_complete_cover(&self) -> bool {
        let Some(first) = self.assignments.first() else {
            return false;
        };
        if !first.range.start.is_empty() {
            return false;
        }
        let contiguous = self
            .assignments
            .windows(2)
            .all(|w| w[0].range.end == w[1].range.start && w[0].range.start < w[0].range.end);
        let last = &self.assignments[self.assignments.len() - 1];
        contiguous && last.range.end == KEYSPACE_END
    }

    /// Delta that takes `self` to `newer`
    pub fn diff(&self, newer: &AssignmentSnapshot) -> AssignmentDelta {
        let old: HashMap<&KeyRange, &RangeAssignment> =
            self.assignments.iter().map(|a| (&a.range, a)).collect();
        let new: HashMap<&KeyRange, &RangeAssignment> =
            newer.assignments.iter().map(|a| (&a.range, a)).collect();

        let assignments = newer
            .assignments
            .iter()
            .filter(|a| old.get(&a.range).copied() != Some(*a))
            .cloned()
            .collect();
        let removed = self
            .assignments
            .iter()
            .filter(|a| !new.contains_key(&a.range))
            .map(|a| a.range.clone())
            .collect();

        AssignmentDelta {
            version: newer.version,
            full: false,
            assignments,
            removed,
        }
    }

    /// Snapshot describing the full state, as a delta
    pub fn to_full_delta(&self) -> AssignmentDelta {
        AssignmentDelta {
            version: self.version,
            full: true,
            assignments: self.assignments.clone(),
            removed: Vec::new(),
        }
    }

    /// Apply a delta, returning the newer snapshot
    ///
    /// Deltas older than this snapshot are ignored so versions observed by
    /// a holder never go backwards.
    pub fn apply(&self, delta: &AssignmentDelta) -> AssignmentSnapshot {
        if delta.version < self.version {
            return self.clone();
        }
        if delta.full {
            return AssignmentSnapshot::new(delta.version, delta.assignments.clone());
        }
        let mut by_range: BTreeMap<KeyRange, RangeAssignment> = self
            .assignments
            .iter()
            .map(|a| (a.range.clone(), a.clone()))
            .collect();
        for range in &delta.removed {
            by_range.remove(range);
        }
        for assignment in &delta.assignments {
            by_range.insert(assignment.range.clone(), assignment.clone());
        }
        AssignmentSnapshot::new(delta.version, by_range.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(start: &[u8], end: &[u8], leaf: u64) -> RangeAssignment {
        RangeAssignment {
            range: KeyRange::new(start.to_vec(), end.to_vec()).unwrap(),
            leaf_id: Some(LeafId(leaf)),
            leaf_address: Some(format!("leaf-{leaf}:8080")),
        }
    }

    fn two_leaf_snapshot() -> AssignmentSnapshot {
        AssignmentSnapshot::new(
            2,
            vec![
                assignment(&[0x7F], &KEYSPACE_END, 2),
                assignment(&[], &[0x7F], 1),
            ],
        )
    }

    #[test]
    fn test_lookup_uses_half_open_bounds() {
        let snap = two_leaf_snapshot();
        assert_eq!(snap.lookup(b"").unwrap().leaf_id, Some(LeafId(1)));
        assert_eq!(snap.lookup(&[0x7E, 0xFF]).unwrap().leaf_id, Some(LeafId(1)));
        assert_eq!(snap.lookup(&[0x7F]).unwrap().leaf_id, Some(LeafId(2)));
        assert!(snap.lookup(&KEYSPACE_END).is_none());
        assert!(snap.is_complete_cover());
    }

    #[test]
    fn test_diff_then_apply_reaches_newer() {
        let old = AssignmentSnapshot::new(1, vec![assignment(&[], &KEYSPACE_END, 1)]);
        let new = two_leaf_snapshot();
        let delta = old.diff(&new);
        assert!(!delta.full);
        assert_eq!(delta.removed, vec![KeyRange::full()]);
        assert_eq!(old.apply(&delta), new);
    }

    #[test]
    fn test_apply_ignores_stale_delta() {
        let snap = two_leaf_snapshot();
        let stale = AssignmentDelta {
            version: 1,
            full: true,
            assignments: vec![],
            removed: vec![],
        };
        assert_eq!(snap.apply(&stale), snap);
    }

    #[test]
    fn test_leaves_listing() {
        let leaves = two_leaf_snapshot().leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[&LeafId(2)], "leaf-2:8080");
    }
}
