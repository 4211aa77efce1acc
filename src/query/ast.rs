//! Query operator tree
//!
//! Queries arrive pre-parsed as JSON trees. Only two operators exist:
//! `fetch` (leaf level, selects raw points) and `aggregate` (applied by
//! mixers over whatever the subtree produced).
//!
//! # Example
//!
//! ```rust
//! use kuba_fleet::query::ast::QueryNode;
//!
//! let json = r#"{
//!     "op": "aggregate", "function": "sum",
//!     "input": {"op": "fetch", "metric": "/rpc/latency", "from": 0, "to": 1000,
//!               "filter": {"op": "field", "scope": "target", "field": "job",
//!                          "match": "contains", "value": "frontend"}}
//! }"#;
//! let query: QueryNode = serde_json::from_str(json).unwrap();
//! assert!(query.validate().is_ok());
//! assert_eq!(query.fetch().metric, "/rpc/latency");
//! ```

use serde::{Deserialize, Serialize};

use super::aggregate::AggregateFunction;
use crate::error::{Error, Result};
use crate::types::{Metric, Target};

// ============================================================================
// Operators
// ============================================================================

/// Root of a query tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueryNode {
    Fetch(FetchNode),
    Aggregate {
        function: AggregateFunction,
        /// Also return one accumulator per series
        #[serde(default)]
        by_series: bool,
        input: Box<QueryNode>,
    },
}

/// Selects points of one metric schema in `[from, to]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchNode {
    pub metric: String,
    pub from: i64,
    pub to: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Predicate>,
}

impl QueryNode {
    pub fn fetch_all(metric: impl Into<String>, from: i64, to: i64) -> Self {
        QueryNode::Fetch(FetchNode {
            metric: metric.into(),
            from,
            to,
            filter: None,
        })
    }

    pub fn aggregate(function: AggregateFunction, input: QueryNode) -> Self {
        QueryNode::Aggregate {
            function,
            by_series: false,
            input: Box::new(input),
        }
    }

    /// The fetch at the bottom of the tree
    pub fn fetch(&self) -> &FetchNode {
        match self {
            QueryNode::Fetch(fetch) => fetch,
            QueryNode::Aggregate { input, .. } => input.fetch(),
        }
    }

    /// Outermost aggregation, if any
    pub fn aggregation(&self) -> Option<(AggregateFunction, bool)> {
        match self {
            QueryNode::Fetch(_) => None,
            QueryNode::Aggregate {
                function,
                by_series,
                ..
            } => Some((*function, *by_series)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let QueryNode::Aggregate { input, .. } = self {
            if matches!(**input, QueryNode::Aggregate { .. }) {
                return Err(Error::InvalidInput(
                    "nested aggregations are not supported".into(),
                ));
            }
        }
        let fetch = self.fetch();
        if fetch.metric.trim().is_empty() {
            return Err(Error::InvalidInput("fetch.metric must not be empty".into()));
        }
        if fetch.from > fetch.to {
            return Err(Error::InvalidInput(format!(
                "fetch.from ({}) is after fetch.to ({})",
                fetch.from, fetch.to
            )));
        }
        if let Some(filter) = &fetch.filter {
            filter.validate()?;
        }
        Ok(())
    }
}

// ============================================================================
// Predicates
// ============================================================================

/// Which field map a field predicate inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldScope {
    Target,
    Metric,
}

/// How a rendered field value is compared with the literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Equals,
    Contains,
}

/// Condition on one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPredicate {
    pub scope: FieldScope,
    pub field: String,
    #[serde(rename = "match")]
    pub matcher: MatchKind,
    pub value: String,
}

/// Boolean filter over target and metric fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Field(FieldPredicate),
    And { args: Vec<Predicate> },
    Or { args: Vec<Predicate> },
    Not { arg: Box<Predicate> },
}

impl Predicate {
    pub fn target_equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Field(FieldPredicate {
            scope: FieldScope::Target,
            field: field.into(),
            matcher: MatchKind::Equals,
            value: value.into(),
        })
    }

    pub fn target_contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Field(FieldPredicate {
            scope: FieldScope::Target,
            field: field.into(),
            matcher: MatchKind::Contains,
            value: value.into(),
        })
    }

    /// Exact evaluation against one series
    pub fn matches(&self, target: &Target, metric: &Metric) -> bool {
        match self {
            Predicate::Field(p) => {
                let fields = match p.scope {
                    FieldScope::Target => &target.fields,
                    FieldScope::Metric => &metric.fields,
                };
                let Some(value) = fields.get(&p.field) else {
                    return false;
                };
                let rendered = value.render();
                match p.matcher {
                    MatchKind::Equals => rendered == p.value,
                    MatchKind::Contains => rendered.contains(p.value.as_str()),
                }
            },
            Predicate::And { args } => args.iter().all(|a| a.matches(target, metric)),
            Predicate::Or { args } => args.iter().any(|a| a.matches(target, metric)),
            Predicate::Not { arg } => !arg.matches(target, metric),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Predicate::Field(p) if p.field.is_empty() => Err(Error::InvalidInput(
                "field predicate needs a field name".into(),
            )),
            Predicate::Field(_) => Ok(()),
            Predicate::And { args } | Predicate::Or { args } => {
                args.iter().try_for_each(Predicate::validate)
            },
            Predicate::Not { arg } => arg.validate(),
        }
    }
}
