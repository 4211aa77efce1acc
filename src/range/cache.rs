//! Read-mostly copy of the assignment snapshot
//!
//! Routers, mixers and leaves hold one of these. Lookups clone an `Arc`
//! and binary-search it; refreshes pull a delta from the assigner and
//! swap the pointer. A refresh never installs an older version.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::table::{AssignmentSnapshot, RangeAssignment};
use super::AssignmentSource;
use crate::error::Result;
use crate::services::PeriodicTask;

/// Locally cached assignment snapshot
pub struct SnapshotCache {
    source: Arc<dyn AssignmentSource>,
    current: RwLock<Arc<AssignmentSnapshot>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SnapshotCache {
    /// Empty cache at version 0; the first lookup will miss until refreshed
    pub fn new(source: Arc<dyn AssignmentSource>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(AssignmentSnapshot::default())),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<AssignmentSnapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Owner of `key` according to the cached snapshot
    pub fn lookup(&self, key: &[u8]) -> Option<RangeAssignment> {
        self.snapshot().lookup(key).cloned()
    }

    /// Install a snapshot obtained elsewhere, if it is newer
    pub fn install(&self, snapshot: AssignmentSnapshot) -> Arc<AssignmentSnapshot> {
        let mut current = self.current.write();
        if snapshot.version > current.version {
            *current = Arc::new(snapshot);
        }
        current.clone()
    }

    /// Pull changes from the assigner
    ///
    /// Concurrent callers coalesce: whoever waits on the lock re-reads the
    /// version and asks only for what is still missing.
    pub async fn refresh(&self) -> Result<Arc<AssignmentSnapshot>> {
        let _guard = self.refresh_lock.lock().await;
        let base = self.snapshot();
        let since = (base.version > 0).then_some(base.version);
        let delta = self.source.get_assignments(since).await?;
        if delta.is_empty() {
            return Ok(base);
        }
        let next = base.apply(&delta);
        if next.version != base.version {
            tracing::debug!(
                from = base.version,
                to = next.version,
                full = delta.full,
                "Assignment snapshot refreshed"
            );
        }
        Ok(self.install(next))
    }

    /// Snapshot, refreshing first if nothing was ever loaded
    pub async fn ensure_loaded(&self) -> Result<Arc<AssignmentSnapshot>> {
        let current = self.snapshot();
        if current.version > 0 {
            return Ok(current);
        }
        self.refresh().await
    }
}

/// Keeps a [`SnapshotCache`] fresh in the background
pub struct SnapshotRefresher {
    cache: Arc<SnapshotCache>,
    period: Duration,
}

impl SnapshotRefresher {
    pub fn new(cache: Arc<SnapshotCache>, period: Duration) -> Self {
        Self { cache, period }
    }
}

#[async_trait]
impl PeriodicTask for SnapshotRefresher {
    fn name(&self) -> &'static str {
        "snapshot-refresher"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> Result<()> {
        self.cache.refresh().await.map(|_| ())
    }
}
