//! Range assignment
//!
//! The keyspace of target strings is partitioned into contiguous ranges,
//! each owned by exactly one leaf:
//!
//! ```text
//!                  ┌──────────────────┐
//!   registerLeaf → │  RangeAssigner   │ → AssignmentSnapshot (versioned)
//!   heartbeat    → │  split / merge   │        │
//!                  └──────────────────┘        ▼
//!                               ┌──────────────────────────────┐
//!                               │ SnapshotCache (router, mixer,│
//!                               │ leaf) polls deltas by version│
//!                               └──────────────────────────────┘
//! ```
//!
//! - [`keyspace`]: byte-range arithmetic and midpoint computation
//! - [`table`]: immutable snapshots, deltas and binary-search lookup
//! - [`assigner`]: the authoritative assigner and its failure detector
//! - [`cache`]: the read-mostly copy held by every other component

pub mod assigner;
pub mod cache;
pub mod keyspace;
pub mod table;

pub use assigner::{FailureDetector, RangeAssigner};
pub use cache::{SnapshotCache, SnapshotRefresher};
pub use keyspace::{KeyRange, KEYSPACE_END};
pub use table::{AssignmentDelta, AssignmentSnapshot, RangeAssignment};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::LeafId;

/// Answer to a successful leaf registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRegistration {
    pub leaf_id: LeafId,
    pub generation: u64,
    pub assigned_ranges: Vec<KeyRange>,
    pub snapshot_version: u64,
}

/// Heartbeat verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Ok,
    /// Unknown leaf or superseded generation; the leaf must re-register
    Stale,
}

/// Body of a heartbeat call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub leaf_id: LeafId,
    pub generation: u64,
}

/// Answer to a heartbeat call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub status: HeartbeatStatus,
}

/// Registered leaf as listed by the assigner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafInfo {
    pub leaf_id: LeafId,
    pub address: String,
    pub generation: u64,
    pub ranges: Vec<KeyRange>,
}

/// Anything that can answer range-assignment calls
///
/// Implemented by [`RangeAssigner`] itself and by the HTTP client, so
/// leaves, routers and mixers work identically in-process and over the
/// network.
#[async_trait]
pub trait AssignmentSource: Send + Sync {
    async fn register_leaf(&self, address: &str) -> Result<LeafRegistration>;

    async fn deregister_leaf(&self, leaf: LeafId) -> Result<()>;

    async fn heartbeat(&self, leaf: LeafId, generation: u64) -> Result<HeartbeatStatus>;

    /// Delta since `since`, or the full snapshot when `since` is `None`
    /// or too old to diff against
    async fn get_assignments(&self, since: Option<u64>) -> Result<AssignmentDelta>;
}
