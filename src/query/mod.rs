//! Query model
//!
//! ```text
//!   QueryNode (JSON tree)
//!       │
//!       ├── planner: filter → trigram alternatives → candidate leaves (FHI)
//!       ├── leaves:  fetch + exact predicate evaluation
//!       └── mixers:  merge series / accumulators → QueryResult
//! ```

pub mod aggregate;
pub mod ast;
pub mod planner;
pub mod result;

pub use aggregate::{Accumulator, AggregateFunction};
pub use ast::{FetchNode, FieldPredicate, FieldScope, MatchKind, Predicate, QueryNode};
pub use planner::{plan_hints, HintPlan, MAX_ALTERNATIVES};
pub use result::{merge_series, AggregateOutput, QueryResult, SeriesAggregate, SeriesPoints};

use serde::{Deserialize, Serialize};

/// Read request a mixer sends to a leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafQuery {
    pub metric: String,
    pub from: i64,
    pub to: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,
}

impl From<&FetchNode> for LeafQuery {
    fn from(fetch: &FetchNode) -> Self {
        Self {
            metric: fetch.metric.clone(),
            from: fetch.from,
            to: fetch.to,
            predicate: fetch.filter.clone(),
        }
    }
}
