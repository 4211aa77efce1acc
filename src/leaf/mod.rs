//! Leaf store
//!
//! ```text
//!   write ──▶ ownership check ──▶ series latch ──▶ insert ──▶ recovery log
//!                                                        └──▶ hint collector ──▶ ZIS
//!   query ──▶ by_metric index ──▶ per-series range scan ──▶ SeriesPoints
//! ```
//!
//! [`LeafStore`] holds the data, [`LeafAgent`] runs its lifecycle against
//! the range assigner and zone index, and [`LeafClient`] is how routers
//! and mixers reach a leaf by address.

pub mod agent;
pub mod hints;
pub mod local;
pub mod recovery;
pub mod series;
pub mod store;

pub use agent::{
    AssignmentSyncTask, GraceSweepTask, HeartbeatTask, HintFlushTask, LeafAgent, RemoteConfigTask,
};
pub use local::LocalLeafClient;
pub use store::{LeafIdentity, LeafStats, LeafStore, OwnershipChange, WriteAck};

use async_trait::async_trait;

use crate::context::Deadline;
use crate::error::Result;
use crate::query::{LeafQuery, SeriesPoints};
use crate::types::TimeSeries;

/// Calls a router or mixer makes on a leaf identified by its address
#[async_trait]
pub trait LeafClient: Send + Sync {
    async fn write(&self, address: &str, series: &TimeSeries, deadline: &Deadline) -> Result<WriteAck>;

    async fn query(
        &self,
        address: &str,
        query: &LeafQuery,
        deadline: &Deadline,
    ) -> Result<Vec<SeriesPoints>>;
}
