//! Aggregation functions and mergeable accumulators
//!
//! Mixers never ship raw points upward for aggregate queries: each level
//! folds points into an [`Accumulator`], and parents merge accumulators.
//! Merging is associative and commutative, so the final value does not
//! depend on how series were spread over leaves and zones.

use serde::{Deserialize, Serialize};

use crate::types::{PointValue, TimeSeriesPoint};

/// Supported aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl std::str::FromStr for AggregateFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "avg" | "mean" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            other => Err(format!("unknown aggregation function '{other}'")),
        }
    }
}

/// Partial aggregate state
///
/// `count` counts every contributing sample (distribution samples
/// included, strings included). `numeric_count` is the denominator of
/// `avg` and only counts samples that also contributed to `sum`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    pub count: u64,
    pub numeric_count: u64,
    pub sum: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Accumulator {
    fn observe_scalar(&mut self, v: f64) {
        self.count += 1;
        self.numeric_count += 1;
        self.sum += v;
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    /// Fold one point in
    pub fn push(&mut self, value: &PointValue) {
        match value {
            PointValue::Int64(i) => self.observe_scalar(*i as f64),
            PointValue::Float64(f) => self.observe_scalar(*f),
            PointValue::Bool(b) => self.observe_scalar(if *b { 1.0 } else { 0.0 }),
            PointValue::Distribution(d) => {
                self.count += d.count;
                self.numeric_count += d.count;
                self.sum += d.sum;
            },
            PointValue::String(_) => self.count += 1,
        }
    }

    pub fn extend<'a>(&mut self, points: impl IntoIterator<Item = &'a TimeSeriesPoint>) {
        for point in points {
            self.push(&point.value);
        }
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a TimeSeriesPoint>) -> Self {
        let mut acc = Self::default();
        acc.extend(points);
        acc
    }

    /// Combine two partial states
    pub fn merge(&mut self, other: &Accumulator) {
        self.count += other.count;
        self.numeric_count += other.numeric_count;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Final value; `None` when the function has no defined result
    pub fn value(&self, function: AggregateFunction) -> Option<f64> {
        match function {
            AggregateFunction::Count => Some(self.count as f64),
            AggregateFunction::Sum => Some(self.sum),
            AggregateFunction::Avg => {
                (self.numeric_count > 0).then(|| self.sum / self.numeric_count as f64)
            },
            AggregateFunction::Min => self.min,
            AggregateFunction::Max => self.max,
        }
    }
}
