//! Query mixers
//!
//! ```text
//!   client ──▶ RootMixer ──┬──▶ zone-1 ZoneMixer ──▶ ZIS (candidates) ──▶ leaves
//!                          └──▶ zone-2 ZoneMixer ──▶ ...
//! ```
//!
//! Both levels degrade instead of failing: an unreachable child is listed
//! in `unreachable` and the answer is flagged `partial`. Only when no
//! child at all answers does the query fail with `unavailable`.

pub mod root;
pub mod zone;

pub use root::RootMixer;
pub use zone::{MixerStats, ZoneMixer};

use async_trait::async_trait;

use crate::context::Deadline;
use crate::error::Result;
use crate::query::{QueryNode, QueryResult};

/// A zone as seen by the root mixer
#[async_trait]
pub trait ZoneClient: Send + Sync {
    async fn query(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult>;
}
