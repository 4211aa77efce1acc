//! Query results and how they merge across leaves and zones

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::aggregate::{Accumulator, AggregateFunction};
use super::ast::QueryNode;
use crate::types::{Metric, SeriesKey, Target, TimeSeriesPoint};

/// Points of one series, sorted by timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoints {
    pub series_key: SeriesKey,
    pub target: Target,
    pub metric: Metric,
    pub points: Vec<TimeSeriesPoint>,
}

/// Aggregate over every selected point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOutput {
    pub function: AggregateFunction,
    pub value: Option<f64>,
    pub accumulator: Accumulator,
}

/// Aggregate over the points of one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesAggregate {
    pub series_key: SeriesKey,
    pub value: Option<f64>,
    pub accumulator: Accumulator,
}

/// Answer to a query at any level of the fan-out tree
///
/// `partial` is set when some child could not be reached; `unreachable`
/// names them (`leaf_N` at a zone mixer, `zone/leaf_N` or `zone` at the
/// root).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub series: Vec<SeriesPoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_series: Vec<SeriesAggregate>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub unreachable: Vec<String>,
}

/// Merge `incoming` into `into`, keyed by series
///
/// Points of the same series coming from two places are combined and
/// de-duplicated by timestamp; the copy already in `into` wins.
pub fn merge_series(into: &mut BTreeMap<SeriesKey, SeriesPoints>, incoming: Vec<SeriesPoints>) {
    for series in incoming {
        match into.get_mut(&series.series_key) {
            Some(existing) => {
                existing.points.extend(series.points);
                existing.points.sort_by_key(|p| p.timestamp_ms);
                existing.points.dedup_by_key(|p| p.timestamp_ms);
            },
            None => {
                into.insert(series.series_key.clone(), series);
            },
        }
    }
}

impl QueryResult {
    /// Shape merged series according to the query's operator
    pub fn from_series(
        node: &QueryNode,
        series: BTreeMap<SeriesKey, SeriesPoints>,
        unreachable: Vec<String>,
    ) -> Self {
        let partial = !unreachable.is_empty();
        match node.aggregation() {
            None => QueryResult {
                series: series.into_values().collect(),
                aggregate: None,
                by_series: Vec::new(),
                partial,
                unreachable,
            },
            Some((function, by_series)) => {
                let mut total = Accumulator::default();
                let mut per_series = Vec::new();
                for s in series.values() {
                    let acc = Accumulator::from_points(&s.points);
                    total.merge(&acc);
                    if by_series {
                        per_series.push(SeriesAggregate {
                            series_key: s.series_key.clone(),
                            value: acc.value(function),
                            accumulator: acc,
                        });
                    }
                }
                QueryResult {
                    series: Vec::new(),
                    aggregate: Some(AggregateOutput {
                        function,
                        value: total.value(function),
                        accumulator: total,
                    }),
                    by_series: per_series,
                    partial,
                    unreachable,
                }
            },
        }
    }

    /// Combine results of sibling subtrees (zones under the root)
    pub fn merge(mut self, other: QueryResult) -> QueryResult {
        let mut series: BTreeMap<SeriesKey, SeriesPoints> = self
            .series
            .drain(..)
            .map(|s| (s.series_key.clone(), s))
            .collect();
        merge_series(&mut series, other.series);
        self.series = series.into_values().collect();

        self.aggregate = match (self.aggregate.take(), other.aggregate) {
            (Some(mut a), Some(b)) => {
                a.accumulator.merge(&b.accumulator);
                a.value = a.accumulator.value(a.function);
                Some(a)
            },
            (a, b) => a.or(b),
        };

        let mut by_series: BTreeMap<SeriesKey, SeriesAggregate> = self
            .by_series
            .drain(..)
            .map(|s| (s.series_key.clone(), s))
            .collect();
        let function = self.aggregate.as_ref().map(|a| a.function);
        for s in other.by_series {
            match by_series.get_mut(&s.series_key) {
                Some(existing) => {
                    existing.accumulator.merge(&s.accumulator);
                    existing.value = function.and_then(|f| existing.accumulator.value(f));
                },
                None => {
                    by_series.insert(s.series_key.clone(), s);
                },
            }
        }
        self.by_series = by_series.into_values().collect();

        self.unreachable.extend(other.unreachable);
        self.partial = self.partial || other.partial || !self.unreachable.is_empty();
        self
    }

    /// Empty result shaped for `node`
    pub fn empty(node: &QueryNode) -> Self {
        Self::from_series(node, BTreeMap::new(), Vec::new())
    }

    /// Prefix every unreachable entry with a zone name
    pub fn scoped_to_zone(mut self, zone: &str) -> Self {
        for entry in &mut self.unreachable {
            *entry = format!("{zone}/{entry}");
        }
        self
    }
}
