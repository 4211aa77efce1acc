//! Leaf lifecycle against the range assigner and zone index
//!
//! ```text
//!   start ──▶ register ──▶ sync assignments ──▶ replay gained ranges
//!     │
//!     ├── every heartbeat_interval: heartbeat (stale → register again)
//!     ├── every assignment_poll:    sync assignments
//!     ├── every hint_flush:         flush pending hints to ZIS
//!     ├── every second:             drop lost ranges past their grace
//!     └── every remote_config_poll: re-read durable write mode
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::store::{LeafIdentity, LeafStore, OwnershipChange};
use crate::client::config_service::KEY_DURABLE_WRITES;
use crate::client::ConfigServiceClient;
use crate::error::Result;
use crate::index::HintsIndex;
use crate::range::{AssignmentSource, HeartbeatStatus, LeafRegistration, SnapshotCache};
use crate::services::PeriodicTask;

/// Drives one [`LeafStore`]
pub struct LeafAgent {
    store: Arc<LeafStore>,
    source: Arc<dyn AssignmentSource>,
    index: Arc<dyn HintsIndex>,
    cache: SnapshotCache,
    address: String,
}

impl LeafAgent {
    pub fn new(
        store: Arc<LeafStore>,
        source: Arc<dyn AssignmentSource>,
        index: Arc<dyn HintsIndex>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            cache: SnapshotCache::new(source.clone()),
            store,
            source,
            index,
            address: address.into(),
        }
    }

    pub fn store(&self) -> &Arc<LeafStore> {
        &self.store
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register (or re-register) with the assigner and take over ranges
    pub async fn register(&self) -> Result<LeafRegistration> {
        let registration = self.source.register_leaf(&self.address).await?;
        self.store.set_identity(LeafIdentity {
            leaf_id: registration.leaf_id,
            generation: registration.generation,
        });
        self.sync_assignments().await?;
        Ok(registration)
    }

    /// Leave the fleet on shutdown
    pub async fn deregister(&self) -> Result<()> {
        match self.store.identity() {
            Some(identity) => self.source.deregister_leaf(identity.leaf_id).await,
            None => Ok(()),
        }
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatStatus> {
        let Some(identity) = self.store.identity() else {
            self.register().await?;
            return Ok(HeartbeatStatus::Ok);
        };
        let status = self
            .source
            .heartbeat(identity.leaf_id, identity.generation)
            .await?;
        if status == HeartbeatStatus::Stale {
            tracing::warn!(leaf = %identity.leaf_id, "Assigner no longer knows this leaf; re-registering");
            self.register().await?;
        }
        Ok(status)
    }

    /// Pull the latest snapshot, apply it and replay every gained range
    pub async fn sync_assignments(&self) -> Result<Option<OwnershipChange>> {
        let snapshot = self.cache.refresh().await?;
        let change = self.store.apply_assignments(&snapshot);
        for range in self.store.recovering_ranges() {
            self.store.recover_range(&range).await?;
        }
        Ok(change)
    }

    pub async fn flush_hints(&self) -> Result<usize> {
        self.store.flush_hints(self.index.as_ref()).await
    }

    pub fn sweep(&self) -> usize {
        self.store.sweep_lost(Instant::now())
    }
}

// ============================================================================
// Periodic tasks
// ============================================================================

pub struct HeartbeatTask {
    agent: Arc<LeafAgent>,
    period: Duration,
}

impl HeartbeatTask {
    pub fn new(agent: Arc<LeafAgent>, period: Duration) -> Self {
        Self { agent, period }
    }
}

#[async_trait]
impl PeriodicTask for HeartbeatTask {
    fn name(&self) -> &'static str {
        "leaf-heartbeat"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> Result<()> {
        self.agent.heartbeat().await.map(|_| ())
    }
}

pub struct AssignmentSyncTask {
    agent: Arc<LeafAgent>,
    period: Duration,
}

impl AssignmentSyncTask {
    pub fn new(agent: Arc<LeafAgent>, period: Duration) -> Self {
        Self { agent, period }
    }
}

#[async_trait]
impl PeriodicTask for AssignmentSyncTask {
    fn name(&self) -> &'static str {
        "leaf-assignment-sync"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> Result<()> {
        self.agent.sync_assignments().await.map(|_| ())
    }
}

pub struct HintFlushTask {
    agent: Arc<LeafAgent>,
    period: Duration,
}

impl HintFlushTask {
    pub fn new(agent: Arc<LeafAgent>, period: Duration) -> Self {
        Self { agent, period }
    }
}

#[async_trait]
impl PeriodicTask for HintFlushTask {
    fn name(&self) -> &'static str {
        "leaf-hint-flush"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> Result<()> {
        self.agent.flush_hints().await.map(|_| ())
    }
}

pub struct GraceSweepTask {
    agent: Arc<LeafAgent>,
}

impl GraceSweepTask {
    pub fn new(agent: Arc<LeafAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl PeriodicTask for GraceSweepTask {
    fn name(&self) -> &'static str {
        "leaf-grace-sweep"
    }

    fn period(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn run_once(&self) -> Result<()> {
        self.agent.sweep();
        Ok(())
    }
}

/// Re-reads the durable write switch from the configuration service
pub struct RemoteConfigTask {
    store: Arc<LeafStore>,
    client: Arc<ConfigServiceClient>,
    period: Duration,
}

impl RemoteConfigTask {
    pub fn new(store: Arc<LeafStore>, client: Arc<ConfigServiceClient>, period: Duration) -> Self {
        Self {
            store,
            client,
            period,
        }
    }
}

#[async_trait]
impl PeriodicTask for RemoteConfigTask {
    fn name(&self) -> &'static str {
        "leaf-remote-config"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> Result<()> {
        if let Some(durable) = self.client.get_parsed::<bool>(KEY_DURABLE_WRITES).await? {
            self.store.set_durable(durable);
        }
        Ok(())
    }
}
