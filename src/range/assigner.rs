//! Authoritative range assigner
//!
//! Owns the mapping from key ranges to leaves. Mutations (join, leave,
//! failure) are serialized under one mutex; every mutation publishes a new
//! immutable snapshot with a higher version. Readers clone the current
//! `Arc<AssignmentSnapshot>` and never wait on a rebalance.
//!
//! # Rebalancing
//!
//! - **Join**: the first leaf takes the whole keyspace. Later leaves take
//!   the upper half of the widest splittable range held by a most-loaded
//!   leaf.
//! - **Leave**: each orphaned range merges into a neighbour owned by the
//!   least-loaded remaining leaf, or is handed to that leaf whole. When the
//!   last leaf leaves, the keyspace collapses back to one unowned range.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::keyspace::KeyRange;
use super::table::{AssignmentDelta, AssignmentSnapshot, RangeAssignment};
use super::{AssignmentSource, HeartbeatStatus, LeafInfo, LeafRegistration};
use crate::config::RangeAssignerConfig;
use crate::error::{Error, Result};
use crate::index::HintsIndex;
use crate::services::PeriodicTask;
use crate::types::LeafId;

#[derive(Debug, Clone)]
struct Slot {
    range: KeyRange,
    owner: Option<LeafId>,
}

#[derive(Debug, Clone)]
struct Registration {
    address: String,
    generation: u64,
    last_heartbeat: Instant,
}

struct AssignerState {
    /// Sorted, contiguous cover of the keyspace
    slots: Vec<Slot>,
    leaves: BTreeMap<LeafId, Registration>,
    /// Last generation handed out per address
    generations: HashMap<String, u64>,
    next_leaf_id: u64,
    version: u64,
    history: VecDeque<Arc<AssignmentSnapshot>>,
}

impl AssignerState {
    fn load(&self, leaf: LeafId) -> usize {
        self.slots.iter().filter(|s| s.owner == Some(leaf)).count()
    }

    fn least_loaded(&self) -> Option<LeafId> {
        self.leaves
            .keys()
            .copied()
            .min_by_key(|&id| (self.load(id), id))
    }

    fn snapshot(&self) -> AssignmentSnapshot {
        let assignments = self
            .slots
            .iter()
            .map(|slot| RangeAssignment {
                range: slot.range.clone(),
                leaf_id: slot.owner,
                leaf_address: slot
                    .owner
                    .and_then(|id| self.leaves.get(&id))
                    .map(|r| r.address.clone()),
            })
            .collect();
        AssignmentSnapshot::new(self.version, assignments)
    }

    /// Give a newly registered leaf its share of the keyspace
    fn rebalance_join(&mut self, leaf: LeafId) {
        let mut took_unowned = false;
        for slot in self.slots.iter_mut().filter(|s| s.owner.is_none()) {
            slot.owner = Some(leaf);
            took_unowned = true;
        }
        if took_unowned {
            return;
        }

        let loads: BTreeMap<LeafId, usize> = self
            .leaves
            .keys()
            .filter(|&&id| id != leaf)
            .map(|&id| (id, self.load(id)))
            .collect();
        let max_load = loads.values().copied().max().unwrap_or(0);

        // Widest splittable range of a most-loaded leaf; if none of those
        // can split, fall back to the widest splittable range anywhere.
        let pick = |only_max: bool| {
            self.slots
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    !only_max || s.owner.map_or(false, |o| loads.get(&o) == Some(&max_load))
                })
                .filter(|(_, s)| s.range.midpoint().is_some())
                .max_by(|(ia, a), (ib, b)| {
                    a.range
                        .width()
                        .cmp(&b.range.width())
                        .then_with(|| ib.cmp(ia))
                })
                .map(|(i, _)| i)
        };
        let Some(idx) = pick(true).or_else(|| pick(false)) else {
            tracing::warn!(leaf = %leaf, "No splittable range left; leaf joins without ranges");
            return;
        };

        let Some((lower, upper)) = self.slots[idx].range.split() else {
            return;
        };
        let owner = self.slots[idx].owner;
        self.slots[idx] = Slot {
            range: lower,
            owner,
        };
        self.slots.insert(
            idx + 1,
            Slot {
                range: upper,
                owner: Some(leaf),
            },
        );
    }

    /// Hand the ranges of a departed leaf to the survivors
    fn rebalance_leave(&mut self, leaf: LeafId) {
        if self.leaves.is_empty() {
            self.slots = vec![Slot {
                range: KeyRange::full(),
                owner: None,
            }];
            return;
        }

        while let Some(idx) = self.slots.iter().position(|s| s.owner == Some(leaf)) {
            let Some(heir) = self.least_loaded() else {
                return;
            };
            let left = idx
                .checked_sub(1)
                .filter(|&i| self.slots[i].owner == Some(heir));
            let right = Some(idx + 1).filter(|&i| {
                self.slots.get(i).map_or(false, |s| s.owner == Some(heir))
            });

            if let Some(l) = left {
                let orphan = self.slots.remove(idx);
                self.slots[l].range.end = orphan.range.end;
            } else if let Some(r) = right {
                let orphan = self.slots.remove(idx);
                // `r` shifted down by one after the removal
                self.slots[r - 1].range.start = orphan.range.start;
            } else {
                self.slots[idx].owner = Some(heir);
            }
        }
    }

    fn publish(&mut self, history_len: usize) -> Arc<AssignmentSnapshot> {
        self.version += 1;
        let snapshot = Arc::new(self.snapshot());
        self.history.push_back(snapshot.clone());
        while self.history.len() > history_len.max(1) {
            self.history.pop_front();
        }
        snapshot
    }
}

/// The range assigner
pub struct RangeAssigner {
    config: RangeAssignerConfig,
    state: Mutex<AssignerState>,
    current: RwLock<Arc<AssignmentSnapshot>>,
    hints: Option<Arc<dyn HintsIndex>>,
}

impl RangeAssigner {
    /// Start with the whole keyspace unowned at version 1
    pub fn new(config: RangeAssignerConfig) -> Self {
        let mut state = AssignerState {
            slots: vec![Slot {
                range: KeyRange::full(),
                owner: None,
            }],
            leaves: BTreeMap::new(),
            generations: HashMap::new(),
            next_leaf_id: 1,
            version: 0,
            history: VecDeque::new(),
        };
        let initial = state.publish(config.history_len);
        Self {
            config,
            state: Mutex::new(state),
            current: RwLock::new(initial),
            hints: None,
        }
    }

    /// Tell the zone index to drop hints of leaves that leave
    pub fn with_hints_index(mut self, hints: Arc<dyn HintsIndex>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn config(&self) -> &RangeAssignerConfig {
        &self.config
    }

    /// Current snapshot; never blocks on a rebalance in progress
    pub fn snapshot(&self) -> Arc<AssignmentSnapshot> {
        self.current.read().clone()
    }

    pub fn leaves(&self) -> Vec<LeafInfo> {
        let state = self.state.lock();
        state
            .leaves
            .iter()
            .map(|(&id, reg)| LeafInfo {
                leaf_id: id,
                address: reg.address.clone(),
                generation: reg.generation,
                ranges: state
                    .slots
                    .iter()
                    .filter(|s| s.owner == Some(id))
                    .map(|s| s.range.clone())
                    .collect(),
            })
            .collect()
    }

    fn install(&self, snapshot: Arc<AssignmentSnapshot>) {
        let mut current = self.current.write();
        if snapshot.version > current.version {
            *current = snapshot;
        }
    }

    /// Register a leaf at `address`
    ///
    /// An address already registered is treated as a restart: the old
    /// identity is retired and the new one gets the next generation.
    pub async fn register(&self, address: &str) -> Result<LeafRegistration> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::InvalidInput("leaf address must not be empty".into()));
        }

        let (registration, retired) = {
            let mut state = self.state.lock();
            let retired: Vec<LeafId> = state
                .leaves
                .iter()
                .filter(|(_, r)| r.address == address)
                .map(|(&id, _)| id)
                .collect();
            for &old in &retired {
                state.leaves.remove(&old);
                state.rebalance_leave(old);
            }

            let generation = state.generations.get(address).copied().unwrap_or(0) + 1;
            state.generations.insert(address.to_string(), generation);
            let leaf_id = LeafId(state.next_leaf_id);
            state.next_leaf_id += 1;
            state.leaves.insert(
                leaf_id,
                Registration {
                    address: address.to_string(),
                    generation,
                    last_heartbeat: Instant::now(),
                },
            );
            state.rebalance_join(leaf_id);
            let snapshot = state.publish(self.config.history_len);
            self.install(snapshot.clone());

            (
                LeafRegistration {
                    leaf_id,
                    generation,
                    assigned_ranges: snapshot.ranges_of(leaf_id),
                    snapshot_version: snapshot.version,
                },
                retired,
            )
        };

        tracing::info!(
            leaf = %registration.leaf_id,
            address,
            generation = registration.generation,
            ranges = registration.assigned_ranges.len(),
            version = registration.snapshot_version,
            "Leaf registered"
        );
        for old in retired {
            tracing::info!(leaf = %old, address, "Retired previous incarnation");
            self.forget_hints(old).await;
        }
        Ok(registration)
    }

    /// Remove a leaf and redistribute its ranges
    pub async fn deregister(&self, leaf: LeafId) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.leaves.remove(&leaf).is_none() {
                return Err(Error::NotFound(format!("{leaf} is not registered")));
            }
            state.rebalance_leave(leaf);
            let snapshot = state.publish(self.config.history_len);
            self.install(snapshot);
        }
        tracing::info!(leaf = %leaf, "Leaf deregistered");
        self.forget_hints(leaf).await;
        Ok(())
    }

    async fn forget_hints(&self, leaf: LeafId) {
        if let Some(hints) = &self.hints {
            if let Err(e) = hints.forget_leaf(leaf).await {
                tracing::warn!(leaf = %leaf, error = %e, "Failed to drop hints of departed leaf");
            }
        }
    }

    pub fn record_heartbeat(&self, leaf: LeafId, generation: u64) -> HeartbeatStatus {
        let mut state = self.state.lock();
        match state.leaves.get_mut(&leaf) {
            Some(reg) if reg.generation == generation => {
                reg.last_heartbeat = Instant::now();
                HeartbeatStatus::Ok
            },
            _ => HeartbeatStatus::Stale,
        }
    }

    /// Delta from `since` to the current snapshot
    pub fn assignments_since(&self, since: Option<u64>) -> AssignmentDelta {
        let current = self.snapshot();
        let Some(since) = since else {
            return current.to_full_delta();
        };
        if since == current.version {
            return AssignmentDelta {
                version: current.version,
                ..AssignmentDelta::default()
            };
        }
        let state = self.state.lock();
        match state.history.iter().find(|s| s.version == since) {
            Some(old) => old.diff(&current),
            None => current.to_full_delta(),
        }
    }

    /// Deregister every leaf silent for longer than the failure threshold
    pub async fn expire_silent_leaves(&self, now: Instant) -> Vec<LeafId> {
        let limit = self.failure_timeout();
        let silent: Vec<LeafId> = {
            let state = self.state.lock();
            state
                .leaves
                .iter()
                .filter(|(_, r)| now.saturating_duration_since(r.last_heartbeat) > limit)
                .map(|(&id, _)| id)
                .collect()
        };
        let mut expired = Vec::with_capacity(silent.len());
        for leaf in silent {
            tracing::warn!(leaf = %leaf, "Leaf missed heartbeats; deregistering");
            if self.deregister(leaf).await.is_ok() {
                expired.push(leaf);
            }
        }
        expired
    }

    fn failure_timeout(&self) -> Duration {
        Duration::from_millis(
            self.config
                .heartbeat_interval_ms
                .saturating_mul(u64::from(self.config.failure_threshold)),
        )
    }
}

#[async_trait]
impl AssignmentSource for RangeAssigner {
    async fn register_leaf(&self, address: &str) -> Result<LeafRegistration> {
        self.register(address).await
    }

    async fn deregister_leaf(&self, leaf: LeafId) -> Result<()> {
        self.deregister(leaf).await
    }

    async fn heartbeat(&self, leaf: LeafId, generation: u64) -> Result<HeartbeatStatus> {
        Ok(self.record_heartbeat(leaf, generation))
    }

    async fn get_assignments(&self, since: Option<u64>) -> Result<AssignmentDelta> {
        Ok(self.assignments_since(since))
    }
}

/// Periodically expires leaves that stopped heartbeating
pub struct FailureDetector {
    assigner: Arc<RangeAssigner>,
}

impl FailureDetector {
    pub fn new(assigner: Arc<RangeAssigner>) -> Self {
        Self { assigner }
    }
}

#[async_trait]
impl PeriodicTask for FailureDetector {
    fn name(&self) -> &'static str {
        "failure-detector"
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.assigner.config.heartbeat_interval_ms.max(1))
    }

    async fn run_once(&self) -> Result<()> {
        self.assigner.expire_silent_leaves(Instant::now()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::KEYSPACE_END;

    fn assigner() -> RangeAssigner {
        RangeAssigner::new(RangeAssignerConfig::default())
    }

    #[tokio::test]
    async fn test_initial_state_is_one_unowned_range() {
        let ra = assigner();
        let snap = ra.snapshot();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.assignments.len(), 1);
        assert_eq!(snap.assignments[0].leaf_id, None);
        assert!(snap.is_complete_cover());
    }

    #[tokio::test]
    async fn test_first_leaf_owns_everything() {
        let ra = assigner();
        let reg = ra.register("h1:1").await.unwrap();
        assert_eq!(reg.leaf_id, LeafId(1));
        assert_eq!(reg.generation, 1);
        assert_eq!(reg.assigned_ranges, vec![KeyRange::full()]);
        assert_eq!(reg.snapshot_version, 2);
    }

    #[tokio::test]
    async fn test_second_leaf_splits_at_midpoint() {
        let ra = assigner();
        ra.register("h1:1").await.unwrap();
        let reg = ra.register("h2:1").await.unwrap();
        assert_eq!(
            reg.assigned_ranges,
            vec![KeyRange::new(vec![0x7F], KEYSPACE_END.to_vec()).unwrap()]
        );
        let snap = ra.snapshot();
        assert_eq!(snap.lookup(b"ComputeTask").unwrap().leaf_id, Some(LeafId(1)));
        assert!(snap.is_complete_cover());
    }

    #[tokio::test]
    async fn test_leave_merges_back() {
        let ra = assigner();
        ra.register("h1:1").await.unwrap();
        let second = ra.register("h2:1").await.unwrap();
        ra.deregister(second.leaf_id).await.unwrap();

        let snap = ra.snapshot();
        assert_eq!(snap.assignments.len(), 1);
        assert_eq!(snap.assignments[0].leaf_id, Some(LeafId(1)));
        assert!(snap.is_complete_cover());
    }

    #[tokio::test]
    async fn test_last_leaf_leaving_collapses_keyspace() {
        let ra = assigner();
        let only = ra.register("h1:1").await.unwrap();
        ra.deregister(only.leaf_id).await.unwrap();
        let snap = ra.snapshot();
        assert_eq!(snap.assignments.len(), 1);
        assert_eq!(snap.assignments[0].leaf_id, None);
        assert_eq!(snap.assignments[0].range, KeyRange::full());
    }

    #[tokio::test]
    async fn test_reregistration_bumps_generation() {
        let ra = assigner();
        let first = ra.register("h1:1").await.unwrap();
        let again = ra.register("h1:1").await.unwrap();
        assert_ne!(first.leaf_id, again.leaf_id);
        assert_eq!(again.generation, first.generation + 1);
        assert_eq!(again.assigned_ranges, vec![KeyRange::full()]);
        assert_eq!(
            ra.record_heartbeat(first.leaf_id, first.generation),
            HeartbeatStatus::Stale
        );
        assert_eq!(
            ra.record_heartbeat(again.leaf_id, again.generation),
            HeartbeatStatus::Ok
        );
    }

    #[tokio::test]
    async fn test_deregister_unknown_leaf() {
        let ra = assigner();
        assert!(matches!(
            ra.deregister(LeafId(9)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deltas_from_history() {
        let ra = assigner();
        ra.register("h1:1").await.unwrap();
        let base = ra.snapshot();
        ra.register("h2:1").await.unwrap();

        let delta = ra.assignments_since(Some(base.version));
        assert!(!delta.full);
        assert_eq!(base.apply(&delta), *ra.snapshot());

        let unchanged = ra.assignments_since(Some(ra.snapshot().version));
        assert!(unchanged.is_empty());

        let ancient = ra.assignments_since(Some(9_999));
        assert!(ancient.full);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_leaf_is_expired() {
        let ra = assigner();
        let a = ra.register("h1:1").await.unwrap();
        let b = ra.register("h2:1").await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        ra.record_heartbeat(a.leaf_id, a.generation);
        tokio::time::advance(Duration::from_secs(2)).await;

        let expired = ra.expire_silent_leaves(Instant::now()).await;
        assert_eq!(expired, vec![b.leaf_id]);
        let snap = ra.snapshot();
        assert_eq!(snap.assignments.len(), 1);
        assert_eq!(snap.assignments[0].leaf_id, Some(a.leaf_id));
    }

    #[tokio::test]
    async fn test_many_joins_keep_cover_and_balance() {
        let ra = assigner();
        for i in 0..16 {
            ra.register(&format!("h{i}:1")).await.unwrap();
        }
        let snap = ra.snapshot();
        assert!(snap.is_complete_cover());
        let leaves = ra.leaves();
        assert_eq!(leaves.len(), 16);
        assert!(leaves.iter().all(|l| !l.ranges.is_empty()));
    }
}
