//! Per-series point storage
//!
//! Points are kept sorted by timestamp in a `Vec`. Appends in timestamp
//! order hit the fast path; late points are placed by binary search and a
//! point at an existing timestamp replaces it (last write wins).

use std::ops::RangeInclusive;

use crate::types::{Metric, Target, TargetString, TimeSeriesPoint, ValueKind};

/// What an insert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Appended,
    OutOfOrder,
    Overwrote,
}

/// One stored time series
#[derive(Debug, Clone)]
pub struct SeriesRecord {
    pub target: Target,
    pub target_string: TargetString,
    pub metric: Metric,
    value_kind: Option<ValueKind>,
    points: Vec<TimeSeriesPoint>,
}

impl SeriesRecord {
    pub fn new(target: Target, target_string: TargetString, metric: Metric) -> Self {
        Self {
            target,
            target_string,
            metric,
            value_kind: None,
            points: Vec::new(),
        }
    }

    pub fn value_kind(&self) -> Option<ValueKind> {
        self.value_kind
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Insert one point; the caller has already checked its value kind
    pub fn insert(&mut self, mut point: TimeSeriesPoint) -> InsertOutcome {
        self.value_kind.get_or_insert(point.value.kind());
        point.reset = false;

        if self
            .points
            .last()
            .map_or(true, |last| last.timestamp_ms < point.timestamp_ms)
        {
            self.points.push(point);
            let idx = self.points.len() - 1;
            self.refresh_reset(idx);
            return InsertOutcome::Appended;
        }

        match self
            .points
            .binary_search_by_key(&point.timestamp_ms, |p| p.timestamp_ms)
        {
            Ok(idx) => {
                self.points[idx] = point;
                self.refresh_reset(idx);
                self.refresh_reset(idx + 1);
                InsertOutcome::Overwrote
            },
            Err(idx) => {
                self.points.insert(idx, point);
                self.refresh_reset(idx);
                self.refresh_reset(idx + 1);
                InsertOutcome::OutOfOrder
            },
        }
    }

    /// A point is a reset when its cumulative start time differs from
    /// that of its predecessor
    fn refresh_reset(&mut self, idx: usize) {
        if idx >= self.points.len() {
            return;
        }
        if idx == 0 {
            self.points[0].reset = false;
            return;
        }
        let previous = self.points[idx - 1].start_time_ms;
        let current = &mut self.points[idx];
        current.reset = current.start_time_ms.is_some() && current.start_time_ms != previous;
    }

    /// Points with timestamps in `range`, in timestamp order
    pub fn range(&self, range: RangeInclusive<i64>) -> &[TimeSeriesPoint] {
        let lo = self
            .points
            .partition_point(|p| p.timestamp_ms < *range.start());
        let hi = self
            .points
            .partition_point(|p| p.timestamp_ms <= *range.end());
        &self.points[lo..hi.max(lo)]
    }

    pub fn points(&self) -> &[TimeSeriesPoint] {
        &self.points
    }
}
