//! Stateless write router
//!
//! Resolves the owning leaf of a write from a cached assignment snapshot
//! and forwards it. Retry policy:
//!
//! - `wrong_leaf`: refresh the snapshot, one more attempt
//! - temporary failures (5xx, network, timeout with budget left): up to
//!   `max_write_retries` retries with `min(base × 2^n, max)` backoff, then
//!   refresh and one final attempt
//! - anything else (`invalid_input`): returned as is

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RouterConfig;
use crate::context::Deadline;
use crate::error::{Error, Result};
use crate::leaf::LeafClient;
use crate::range::{RangeAssignment, SnapshotCache};
use crate::types::{LeafId, TargetString, TimeSeries};

/// Response of a routed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedWrite {
    pub status: String,
    pub leaf_id: LeafId,
}

/// Counters for `/metrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub writes_ok: u64,
    pub writes_invalid: u64,
    pub writes_failed: u64,
    pub retries: u64,
    pub refreshes: u64,
    pub snapshot_version: u64,
}

#[derive(Default)]
struct Counters {
    ok: AtomicU64,
    invalid: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    refreshes: AtomicU64,
}

enum Attempt {
    Done(LeafId),
    Refresh(Error),
    Retry(Error),
    Fail(Error),
}

pub struct IngestionRouter {
    cache: Arc<SnapshotCache>,
    leaves: Arc<dyn LeafClient>,
    config: RouterConfig,
    counters: Counters,
}

impl IngestionRouter {
    pub fn new(cache: Arc<SnapshotCache>, leaves: Arc<dyn LeafClient>, config: RouterConfig) -> Self {
        Self {
            cache,
            leaves,
            config,
            counters: Counters::default(),
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Owner of `key` under the cached snapshot
    pub fn route(&self, key: &TargetString) -> Result<RangeAssignment> {
        let assignment = self
            .cache
            .lookup(key.as_bytes())
            .ok_or_else(|| Error::unavailable("no assignment snapshot loaded"))?;
        if assignment.leaf_id.is_none() || assignment.leaf_address.is_none() {
            return Err(Error::unavailable(format!(
                "range {} has no owner",
                assignment.range
            )));
        }
        Ok(assignment)
    }

    /// Route one series write
    pub async fn write(&self, series: &TimeSeries, deadline: &Deadline) -> Result<RoutedWrite> {
        let result = self.write_inner(series, deadline).await;
        match &result {
            Ok(_) => self.counters.ok.fetch_add(1, Ordering::Relaxed),
            Err(Error::InvalidInput(_)) => self.counters.invalid.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn write_inner(&self, series: &TimeSeries, deadline: &Deadline) -> Result<RoutedWrite> {
        let key = TargetString::from_target(&series.target);
        match deadline
            .run("assignment snapshot", self.cache.ensure_loaded())
            .await
        {
            Ok(_) => {},
            Err(e @ Error::Timeout(_)) => return Err(e),
            Err(e) => tracing::warn!(error = %e, "Could not load assignment snapshot"),
        }

        let mut retries = 0;
        let last_error = loop {
            match self.attempt(&key, series, deadline).await {
                Attempt::Done(leaf_id) => return Ok(ok(leaf_id)),
                Attempt::Fail(e) => return Err(e),
                Attempt::Refresh(e) => break e,
                Attempt::Retry(e) if retries < self.config.max_write_retries => {
                    tracing::debug!(target_key = %key, retries, error = %e, "Retrying write");
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    deadline.sleep(self.config.backoff(retries)).await?;
                    retries += 1;
                },
                Attempt::Retry(e) => break e,
            }
        };

        tracing::debug!(target_key = %key, error = %last_error, "Refreshing snapshot for a final attempt");
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        deadline
            .run("assignment refresh", self.cache.refresh())
            .await?;
        match self.attempt(&key, series, deadline).await {
            Attempt::Done(leaf_id) => Ok(ok(leaf_id)),
            Attempt::Fail(e) | Attempt::Refresh(e) | Attempt::Retry(e) => {
                tracing::warn!(target_key = %key, error = %e, "Write failed after refresh");
                match e {
                    Error::WrongLeaf { snapshot_version } => Err(Error::unavailable(format!(
                        "range ownership is still moving (leaf at snapshot {snapshot_version})"
                    ))),
                    other => Err(other),
                }
            },
        }
    }

    async fn attempt(&self, key: &TargetString, series: &TimeSeries, deadline: &Deadline) -> Attempt {
        let owner = match self.route(key) {
            Ok(owner) => owner,
            Err(e) => return Attempt::Refresh(e),
        };
        let (Some(leaf_id), Some(address)) = (owner.leaf_id, owner.leaf_address.as_deref()) else {
            return Attempt::Refresh(Error::unavailable("range has no owner"));
        };
        match self.leaves.write(address, series, deadline).await {
            Ok(ack) => Attempt::Done(ack.leaf_id.unwrap_or(leaf_id)),
            Err(e @ Error::WrongLeaf { .. }) => Attempt::Refresh(e),
            Err(e @ Error::Timeout(_)) if !deadline.is_expired() => Attempt::Retry(e),
            Err(e) if e.is_retryable() => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            writes_ok: self.counters.ok.load(Ordering::Relaxed),
            writes_invalid: self.counters.invalid.load(Ordering::Relaxed),
            writes_failed: self.counters.failed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            snapshot_version: self.cache.version(),
        }
    }
}

fn ok(leaf_id: LeafId) -> RoutedWrite {
    RoutedWrite {
        status: "ok".to_string(),
        leaf_id,
    }
}
