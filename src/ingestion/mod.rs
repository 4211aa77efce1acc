//! Write ingestion
//!
//! ```text
//!   producer ──▶ IngestionRouter ──▶ SnapshotCache.lookup(target string)
//!                      │                      ▲
//!                      ▼                      │ refresh on wrong_leaf,
//!                 LeafClient.write ───────────┘ exhausted retries, timer
//! ```

pub mod router;

pub use router::{IngestionRouter, RoutedWrite, RouterStats};
