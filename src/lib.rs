//! Kuba Fleet - range-sharded in-memory time-series monitoring
//!
//! One zone of the fleet is made of cooperating processes:
//! - **Range assigner**: partitions the target-string keyspace among leaves
//! - **Ingestion router**: sends each write to the leaf owning its range
//! - **Leaf store**: keeps series in memory, logs writes for recovery,
//!   and reports field hints
//! - **Zone index**: field-hints index used to prune query fan-out
//! - **Zone and root mixers**: scatter queries and merge answers
//! - **Standing-query scheduler**: re-issues registered queries periodically
//!
//! Each component is a plain Rust type; the [`server`] module exposes it
//! over HTTP and the [`client`] module talks to it from other processes
//! through the same traits.

#![warn(clippy::all)]

pub mod broker;
pub mod client;
pub mod context;
pub mod error;
pub mod index;
pub mod leaf;
pub mod query;
pub mod range;
pub mod scheduler;
pub mod trigram;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Ingestion routing
pub mod ingestion;

/// Per-process Prometheus registry
pub mod metrics;

/// Zone and root query mixers
pub mod mixer;

/// axum routers for every component
pub mod server;

/// Background service lifecycle and periodic tasks
pub mod services;

pub use context::Deadline;
pub use error::{Error, Result};
pub use types::{LeafId, Metric, Target, TimeSeries, TimeSeriesPoint};
