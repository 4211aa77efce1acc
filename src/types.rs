//! Core data types shared by every fleet component
//!
//! # Key Types
//!
//! - **`Target`**: the monitored entity (schema name plus typed fields)
//! - **`Metric`**: what is measured about the target
//! - **`TimeSeriesPoint`**: one timestamped value
//! - **`TargetString`**: canonical sharding key derived from a target
//! - **`SeriesKey`**: storage identity of one time series inside a leaf
//! - **`LeafId`**: identity handed out by the range assigner
//!
//! # Example
//!
//! ```rust
//! use kuba_fleet::types::{FieldValue, Target, TargetString};
//!
//! let mut target = Target::new("ComputeTask");
//! target.fields.insert("cluster".to_string(), FieldValue::String("a".to_string()));
//! target.fields.insert("job".to_string(), FieldValue::Int(7));
//!
//! let key = TargetString::from_target(&target);
//! assert_eq!(key.as_str(), "ComputeTask\u{1f}a\u{1f}7");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Separator between the components of a target string
pub const FIELD_SEPARATOR: char = '\u{1f}';

/// Escape byte used when a field value contains a separator or itself
pub const ESCAPE: char = '\u{1b}';

// ============================================================================
// Fields
// ============================================================================

/// Typed value of a target or metric field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl FieldValue {
    /// Render the value the way it participates in keys and trigram hints
    pub fn render(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Fields keyed by name; iteration order is the canonical (sorted) order
pub type FieldMap = BTreeMap<String, FieldValue>;

// ============================================================================
// Target and Metric
// ============================================================================

/// The monitored entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub schema: String,
    #[serde(default)]
    pub fields: FieldMap,
}

impl Target {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            fields: FieldMap::new(),
        }
    }

    /// Builder-style field insertion
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Whether a metric reports instantaneous or accumulated values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Gauge,
    Cumulative,
}

/// What is measured about a target
///
/// `kind` is descriptive only; series identity is `(schema, fields)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub schema: String,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub kind: MetricKind,
}

impl Metric {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            fields: FieldMap::new(),
            kind: MetricKind::Gauge,
        }
    }

    pub fn cumulative(schema: impl Into<String>) -> Self {
        Self {
            kind: MetricKind::Cumulative,
            ..Self::new(schema)
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

// ============================================================================
// Points
// ============================================================================

/// Histogram bucket: number of samples at or below `upper_bound`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub upper_bound: f64,
    pub count: u64,
}

/// Sample attached to a distribution for drill-down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub value: f64,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub fields: FieldMap,
}

/// Histogram-valued point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub count: u64,
    pub sum: f64,
    #[serde(default)]
    pub sum_of_squares: f64,
    #[serde(default)]
    pub buckets: Vec<Bucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exemplar: Option<Exemplar>,
}

impl Distribution {
    /// Check bucket ordering and that bucket counts add up
    pub fn validate(&self) -> Result<(), String> {
        for pair in self.buckets.windows(2) {
            if !(pair[0].upper_bound < pair[1].upper_bound) {
                return Err("distribution bucket bounds must be strictly increasing".to_string());
            }
        }
        if !self.buckets.is_empty() {
            let total: u64 = self.buckets.iter().map(|b| b.count).sum();
            if total != self.count {
                return Err(format!(
                    "distribution bucket counts sum to {total}, expected {}",
                    self.count
                ));
            }
        }
        Ok(())
    }
}

/// Kind of value a series carries; fixed by its first accepted point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int64,
    Float64,
    String,
    Distribution,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Int64 => "int64",
            ValueKind::Float64 => "float64",
            ValueKind::String => "string",
            ValueKind::Distribution => "distribution",
        };
        f.write_str(name)
    }
}

/// Value of a single point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Distribution(Distribution),
}

impl PointValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PointValue::Bool(_) => ValueKind::Bool,
            PointValue::Int64(_) => ValueKind::Int64,
            PointValue::Float64(_) => ValueKind::Float64,
            PointValue::String(_) => ValueKind::String,
            PointValue::Distribution(_) => ValueKind::Distribution,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One timestamped value
///
/// `reset` is computed by the leaf: it marks the first point after the
/// cumulative start time changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    #[serde(alias = "ts")]
    pub timestamp_ms: i64,
    pub value: PointValue,
    #[serde(
        default,
        alias = "start_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reset: bool,
}

impl TimeSeriesPoint {
    pub fn new(timestamp_ms: i64, value: PointValue) -> Self {
        Self {
            timestamp_ms,
            value,
            start_time_ms: None,
            reset: false,
        }
    }

    pub fn with_start_time(mut self, start_time_ms: i64) -> Self {
        self.start_time_ms = Some(start_time_ms);
        self
    }
}

/// A write unit: one series and a batch of its points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub target: Target,
    pub metric: Metric,
    pub points: Vec<TimeSeriesPoint>,
}

// ============================================================================
// Keys
// ============================================================================

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        if c == FIELD_SEPARATOR || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// Canonical sharding key of a target
///
/// `schema ‖ 0x1F ‖ v1 ‖ 0x1F ‖ v2 ...`: field values only, taken in
/// sorted field-name order. Separator and escape bytes inside values are
/// prefixed with 0x1B so values never bleed into each other. String ordering is byte
/// ordering, which is the keyspace order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetString(String);

impl TargetString {
    pub fn from_target(target: &Target) -> Self {
        let mut out = String::with_capacity(target.schema.len() + 16 * target.fields.len());
        push_escaped(&mut out, &target.schema);
        for value in target.fields.values() {
            out.push(FIELD_SEPARATOR);
            push_escaped(&mut out, &value.render());
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TargetString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.replace(FIELD_SEPARATOR, "|"))
    }
}

/// Identity of a stored series: target string, separator, metric schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesKey(String);

impl SeriesKey {
    pub fn new(target: &TargetString, metric_schema: &str) -> Self {
        let mut out = String::with_capacity(target.as_str().len() + metric_schema.len() + 1);
        out.push_str(target.as_str());
        out.push(FIELD_SEPARATOR);
        push_escaped(&mut out, metric_schema);
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.replace(FIELD_SEPARATOR, "|"))
    }
}

/// Leaf identity assigned by the range assigner
///
/// Rendered as `leaf_N` in logs and in the `unreachable` list of partial
/// query results; serialized as the bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeafId(pub u64);

impl fmt::Display for LeafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "leaf_{}", self.0)
    }
}
