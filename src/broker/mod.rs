//! Recovery log
//!
//! Leaves append every accepted point to a partitioned, key-ordered log.
//! A leaf that takes over a range replays the records whose key falls in
//! it. The broker only has to keep per-key order, which partitioning by a
//! hash of the key gives for free.

pub mod memory;
pub mod rest;

pub use memory::MemoryBroker;
pub use rest::RestBroker;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::range::KeyRange;

/// Topic leaves write recovery records to
pub const RECOVERY_TOPIC: &str = "monarch-recovery-logs";

/// Header carrying the canonical target JSON
pub const TARGET_HEADER: &str = "target";

/// Header carrying the canonical metric JSON
pub const METRIC_HEADER: &str = "metric";

/// One log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Append-only, partitioned log
#[async_trait]
pub trait LogBroker: Send + Sync {
    /// Append records in order; returns how many were stored
    async fn append(&self, topic: &str, records: Vec<LogRecord>) -> Result<usize>;

    /// Records whose key lies in `range`, per-key order preserved
    async fn read(&self, topic: &str, range: &KeyRange) -> Result<Vec<LogRecord>>;
}
