//! In-memory leaf store
//!
//! # Layout
//!
//! ```text
//!   series:    SeriesKey → Arc<Mutex<SeriesRecord>>     (sharded map)
//!   by_metric: metric schema → {SeriesKey}              (read path index)
//!   ownership: owned / recovering / lost key ranges     (RwLock)
//! ```
//!
//! A write locks only its own series. Reads collect the `Arc`s first and
//! then lock each series briefly, so a long scan never blocks writers of
//! other series.
//!
//! Writers of one series queue on its commit gate. A batch reaches the
//! recovery log before it becomes visible, and in durable mode only
//! after the broker acknowledged it.
//!
//! # Range states
//!
//! - **owned**: writes accepted, reads served
//! - **recovering**: newly gained, log replay in progress; writes get
//!   `unavailable`, reads skip it
//! - **lost**: reassigned away; writes get `wrong_leaf`, state is dropped
//!   after the grace period

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::hints::HintCollector;
use super::recovery::{decode_record, encode_record, RecoveryLogWriter};
use super::series::{InsertOutcome, SeriesRecord};
use crate::broker::{LogBroker, RECOVERY_TOPIC};
use crate::config::LeafConfig;
use crate::error::{Error, Result};
use crate::index::HintsIndex;
use crate::query::{LeafQuery, SeriesPoints};
use crate::range::keyspace::{covers, intersect, normalize, subtract};
use crate::range::{AssignmentSnapshot, KeyRange};
use crate::types::{
    LeafId, Metric, MetricKind, PointValue, SeriesKey, Target, TargetString, TimeSeries, ValueKind,
    FIELD_SEPARATOR,
};

/// Identity handed out by the range assigner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafIdentity {
    pub leaf_id: LeafId,
    pub generation: u64,
}

/// Successful write acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_id: Option<LeafId>,
    pub series_key: SeriesKey,
    pub points: usize,
}

/// Ranges gained and lost by applying a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipChange {
    pub version: u64,
    pub gained: Vec<KeyRange>,
    pub lost: Vec<KeyRange>,
}

#[derive(Debug, Default)]
struct Ownership {
    version: u64,
    owned: Vec<KeyRange>,
    recovering: Vec<KeyRange>,
    lost: Vec<(KeyRange, Instant)>,
}

/// Counters exported on `/metrics` and `/health`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafStats {
    pub leaf_id: Option<LeafId>,
    pub snapshot_version: u64,
    pub series: usize,
    pub points: usize,
    pub points_written: u64,
    pub out_of_order: u64,
    pub overwrites: u64,
    pub rejected_writes: u64,
    pub owned_ranges: usize,
    pub recovering_ranges: usize,
    pub lost_ranges: usize,
    pub pending_hints: usize,
}

#[derive(Default)]
struct Counters {
    points_written: AtomicU64,
    out_of_order: AtomicU64,
    overwrites: AtomicU64,
    rejected: AtomicU64,
}

/// Leaf store
pub struct LeafStore {
    max_points_per_write: usize,
    grace_period: Duration,
    durable: AtomicBool,
    identity: RwLock<Option<LeafIdentity>>,
    series: DashMap<SeriesKey, Arc<Mutex<SeriesRecord>>>,
    commit_gates: DashMap<SeriesKey, Arc<tokio::sync::Mutex<()>>>,
    by_metric: DashMap<String, DashSet<SeriesKey>>,
    ownership: RwLock<Ownership>,
    broker: Arc<dyn LogBroker>,
    log: RecoveryLogWriter,
    hints: HintCollector,
    counters: Counters,
}

impl LeafStore {
    /// Create a store; must be called inside a Tokio runtime since the
    /// recovery log writer task is spawned here
    pub fn new(config: &LeafConfig, broker: Arc<dyn LogBroker>) -> Self {
        let (log, _task) =
            RecoveryLogWriter::spawn(broker.clone(), RECOVERY_TOPIC, config.log_queue_capacity);
        Self {
            max_points_per_write: config.max_points_per_write,
            grace_period: Duration::from_secs(config.grace_period_secs),
            durable: AtomicBool::new(config.durable_writes),
            identity: RwLock::new(None),
            series: DashMap::new(),
            commit_gates: DashMap::new(),
            by_metric: DashMap::new(),
            ownership: RwLock::new(Ownership::default()),
            broker,
            log,
            hints: HintCollector::new(),
            counters: Counters::default(),
        }
    }

    // ========================================================================
    // Identity and configuration
    // ========================================================================

    pub fn identity(&self) -> Option<LeafIdentity> {
        *self.identity.read()
    }

    /// Adopt the identity from a (re-)registration
    ///
    /// A new leaf id means the zone index forgot every hint of the old
    /// one, so all stored values are queued for hinting again.
    pub fn set_identity(&self, identity: LeafIdentity) {
        let previous = self.identity.write().replace(identity);
        if previous.map(|p| p.leaf_id) == Some(identity.leaf_id) {
            return;
        }
        if previous.is_some() {
            self.hints.reset();
            let records: Vec<_> = self.series.iter().map(|e| e.value().clone()).collect();
            for record in records {
                let record = record.lock();
                self.hints.observe(&record.target, &record.metric);
            }
        }
        tracing::info!(
            leaf = %identity.leaf_id,
            generation = identity.generation,
            "Leaf identity assigned"
        );
    }

    pub fn set_durable(&self, durable: bool) {
        let previous = self.durable.swap(durable, Ordering::Relaxed);
        if previous != durable {
            tracing::info!(durable, "Durable write mode changed");
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Write path
    // ========================================================================

    fn validate(&self, series: &TimeSeries) -> Result<ValueKind> {
        if series.target.schema.trim().is_empty() {
            return Err(Error::InvalidInput("target.schema must not be empty".into()));
        }
        if series.metric.schema.trim().is_empty() {
            return Err(Error::InvalidInput("metric.schema must not be empty".into()));
        }
        let Some(first) = series.points.first() else {
            return Err(Error::InvalidInput("write carries no points".into()));
        };
        if series.points.len() > self.max_points_per_write {
            return Err(Error::InvalidInput(format!(
                "write carries {} points, limit is {}",
                series.points.len(),
                self.max_points_per_write
            )));
        }
        let kind = first.value.kind();
        for point in &series.points {
            if point.value.kind() != kind {
                return Err(Error::InvalidInput(format!(
                    "write mixes {kind} and {} values",
                    point.value.kind()
                )));
            }
            if let PointValue::Distribution(d) = &point.value {
                d.validate().map_err(Error::InvalidInput)?;
            }
            if series.metric.kind == MetricKind::Cumulative && point.start_time_ms.is_none() {
                return Err(Error::InvalidInput(format!(
                    "cumulative point at {} lacks start_time_ms",
                    point.timestamp_ms
                )));
            }
        }
        Ok(kind)
    }

    fn check_owned(&self, key: &[u8]) -> Result<()> {
        let own = self.ownership.read();
        if covers(&own.recovering, key) {
            return Err(Error::Unavailable {
                message: "range is recovering".into(),
                retry_after_secs: 1,
            });
        }
        if covers(&own.owned, key) {
            return Ok(());
        }
        Err(Error::WrongLeaf {
            snapshot_version: own.version,
        })
    }

    fn record_for(&self, key: &SeriesKey, target: &Target, ts: &TargetString, metric: &Metric) -> Arc<Mutex<SeriesRecord>> {
        let record = self
            .series
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SeriesRecord::new(
                    target.clone(),
                    ts.clone(),
                    metric.clone(),
                )))
            })
            .clone();
        self.by_metric
            .entry(metric.schema.clone())
            .or_default()
            .insert(key.clone());
        record
    }

    /// Accept a batch of points for one series
    pub async fn write(&self, series: TimeSeries) -> Result<WriteAck> {
        let result = self.write_inner(series).await;
        if result.is_err() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn write_inner(&self, series: TimeSeries) -> Result<WriteAck> {
        let kind = self.validate(&series)?;
        let target_string = TargetString::from_target(&series.target);
        self.check_owned(target_string.as_bytes())?;

        let key = SeriesKey::new(&target_string, &series.metric.schema);
        let durable = self.is_durable();
        let count = series.points.len();

        let gate = self.commit_gates.entry(key.clone()).or_default().clone();
        let _commit = gate.lock().await;

        if let Some(record) = self.series.get(&key).map(|r| r.value().clone()) {
            let established = record.lock().value_kind();
            if let Some(established) = established.filter(|&k| k != kind) {
                return Err(Error::InvalidInput(format!(
                    "series {key} holds {established} values, got {kind}"
                )));
            }
        }

        let records = series
            .points
            .iter()
            .map(|p| encode_record(&key, &series.target, &series.metric, p))
            .collect::<Result<Vec<_>>>()?;
        let ack = self.log.enqueue(records, durable)?;
        if durable {
            ack.wait().await?;
        }

        let record = self.record_for(&key, &series.target, &target_string, &series.metric);
        {
            let mut rec = record.lock();
            rec.metric = series.metric.clone();
            for point in series.points {
                match rec.insert(point) {
                    InsertOutcome::Appended => {},
                    InsertOutcome::OutOfOrder => {
                        self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
                    },
                    InsertOutcome::Overwrote => {
                        self.counters.overwrites.fetch_add(1, Ordering::Relaxed);
                    },
                }
            }
        }
        self.counters
            .points_written
            .fetch_add(count as u64, Ordering::Relaxed);
        self.hints.observe(&series.target, &series.metric);

        Ok(WriteAck {
            status: "ok".to_string(),
            leaf_id: self.identity().map(|i| i.leaf_id),
            series_key: key,
            points: count,
        })
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Points of every series of `query.metric` matching the predicate,
    /// with timestamps in `[from, to]`
    pub fn query(&self, query: &LeafQuery) -> Result<Vec<SeriesPoints>> {
        if query.from > query.to {
            return Err(Error::InvalidInput(format!(
                "from ({}) is after to ({})",
                query.from, query.to
            )));
        }
        let keys: Vec<SeriesKey> = self
            .by_metric
            .get(&query.metric)
            .map(|set| set.iter().map(|k| k.key().clone()).collect())
            .unwrap_or_default();
        let records: Vec<Arc<Mutex<SeriesRecord>>> = keys
            .iter()
            .filter_map(|k| self.series.get(k).map(|r| r.value().clone()))
            .collect();
        let recovering = self.ownership.read().recovering.clone();

        let mut out = Vec::new();
        for (key, record) in keys.into_iter().zip(records) {
            let record = record.lock();
            if covers(&recovering, record.target_string.as_bytes()) {
                continue;
            }
            if let Some(predicate) = &query.predicate {
                if !predicate.matches(&record.target, &record.metric) {
                    continue;
                }
            }
            let points = record.range(query.from..=query.to);
            if points.is_empty() {
                continue;
            }
            out.push(SeriesPoints {
                series_key: key,
                target: record.target.clone(),
                metric: record.metric.clone(),
                points: points.to_vec(),
            });
        }
        out.sort_by(|a, b| a.series_key.cmp(&b.series_key));
        Ok(out)
    }

    /// Series keys whose metric schema starts with `prefix`
    pub fn enumerate_series(&self, prefix: Option<&str>) -> Vec<SeriesKey> {
        let prefix = prefix.unwrap_or("");
        let mut keys: Vec<SeriesKey> = self
            .by_metric
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|k| k.key().clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    // ========================================================================
    // Ownership
    // ========================================================================

    /// Recompute owned ranges from a snapshot
    ///
    /// Returns `None` when the leaf has no identity yet or the snapshot is
    /// older than the one already applied.
    pub fn apply_assignments(&self, snapshot: &AssignmentSnapshot) -> Option<OwnershipChange> {
        let identity = self.identity()?;
        let new_owned = normalize(snapshot.ranges_of(identity.leaf_id));

        let mut own = self.ownership.write();
        if snapshot.version < own.version {
            return None;
        }
        let gained = subtract(&new_owned, &own.owned);
        let lost = subtract(&own.owned, &new_owned);

        let mut recovering = intersect(&own.recovering, &new_owned);
        recovering.extend(gained.iter().cloned());
        own.recovering = normalize(recovering);

        let now = Instant::now();
        let mut still_lost: Vec<(KeyRange, Instant)> = own
            .lost
            .iter()
            .flat_map(|(range, since)| {
                subtract(std::slice::from_ref(range), &new_owned)
                    .into_iter()
                    .map(move |piece| (piece, *since))
            })
            .collect();
        still_lost.extend(lost.iter().cloned().map(|r| (r, now)));
        own.lost = still_lost;
        own.owned = new_owned;
        own.version = snapshot.version;

        if !gained.is_empty() || !lost.is_empty() {
            tracing::info!(
                leaf = %identity.leaf_id,
                version = snapshot.version,
                gained = gained.len(),
                lost = lost.len(),
                "Range ownership changed"
            );
        }
        Some(OwnershipChange {
            version: snapshot.version,
            gained,
            lost,
        })
    }

    pub fn snapshot_version(&self) -> u64 {
        self.ownership.read().version
    }

    pub fn owned_ranges(&self) -> Vec<KeyRange> {
        self.ownership.read().owned.clone()
    }

    pub fn recovering_ranges(&self) -> Vec<KeyRange> {
        self.ownership.read().recovering.clone()
    }

    /// Replay the recovery log for `range` and mark it writable
    pub async fn recover_range(&self, range: &KeyRange) -> Result<usize> {
        let records = self
            .broker
            .read(RECOVERY_TOPIC, &series_key_span(range)?)
            .await?;
        let mut replayed = 0;
        for log_record in &records {
            let decoded = match decode_record(log_record) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(key = %log_record.key, error = %e, "Skipping undecodable log record");
                    continue;
                },
            };
            let target_string = TargetString::from_target(&decoded.target);
            if !range.contains(target_string.as_bytes()) {
                continue;
            }
            let key = SeriesKey::new(&target_string, &decoded.metric.schema);
            let record = self.record_for(&key, &decoded.target, &target_string, &decoded.metric);
            {
                let mut rec = record.lock();
                if rec.value_kind().map_or(false, |k| k != decoded.point.value.kind()) {
                    tracing::warn!(series = %key, "Skipping replayed point of the wrong kind");
                    continue;
                }
                rec.insert(decoded.point);
            }
            self.hints.observe(&decoded.target, &decoded.metric);
            replayed += 1;
        }

        {
            let mut own = self.ownership.write();
            own.recovering = subtract(&own.recovering, std::slice::from_ref(range));
        }
        tracing::info!(range = %range, replayed, "Range recovered from log");
        Ok(replayed)
    }

    /// Drop state of ranges lost longer than the grace period ago
    pub fn sweep_lost(&self, now: Instant) -> usize {
        let (expired, owned) = {
            let mut own = self.ownership.write();
            let grace = self.grace_period;
            let (expired, kept): (Vec<_>, Vec<_>) = own
                .lost
                .drain(..)
                .partition(|(_, since)| now.saturating_duration_since(*since) >= grace);
            own.lost = kept;
            (
                expired.into_iter().map(|(r, _)| r).collect::<Vec<_>>(),
                own.owned.clone(),
            )
        };
        if expired.is_empty() {
            return 0;
        }

        let doomed: Vec<(SeriesKey, String)> = self
            .series
            .iter()
            .filter_map(|entry| {
                let rec = entry.value().lock();
                let key = rec.target_string.as_bytes();
                (covers(&expired, key) && !covers(&owned, key))
                    .then(|| (entry.key().clone(), rec.metric.schema.clone()))
            })
            .collect();
        for (key, schema) in &doomed {
            self.series.remove(key);
            self.commit_gates.remove(key);
            if let Some(set) = self.by_metric.get(schema) {
                set.remove(key);
            }
        }
        self.by_metric.retain(|_, set| !set.is_empty());
        if !doomed.is_empty() {
            tracing::info!(series = doomed.len(), "Dropped series of lost ranges");
        }
        doomed.len()
    }

    // ========================================================================
    // Hints and stats
    // ========================================================================

    pub async fn flush_hints(&self, index: &dyn HintsIndex) -> Result<usize> {
        match self.identity() {
            Some(identity) => self.hints.flush(index, identity.leaf_id).await,
            None => Ok(0),
        }
    }

    pub fn stats(&self) -> LeafStats {
        let points = self
            .series
            .iter()
            .map(|entry| entry.value().lock().len())
            .sum();
        let own = self.ownership.read();
        LeafStats {
            leaf_id: self.identity().map(|i| i.leaf_id),
            snapshot_version: own.version,
            series: self.series.len(),
            points,
            points_written: self.counters.points_written.load(Ordering::Relaxed),
            out_of_order: self.counters.out_of_order.load(Ordering::Relaxed),
            overwrites: self.counters.overwrites.load(Ordering::Relaxed),
            rejected_writes: self.counters.rejected.load(Ordering::Relaxed),
            owned_ranges: own.owned.len(),
            recovering_ranges: own.recovering.len(),
            lost_ranges: own.lost.len(),
            pending_hints: self.hints.pending_len(),
        }
    }
}

/// Log keys are series keys, which sort after their target string
///
/// A target string `t < end` can still carry series keys `t ‖ 0x1F ‖ …`
/// at or past `end` when `t` is a prefix of `end`. The span returned
/// here reaches past all of them; callers filter by target string.
fn series_key_span(range: &KeyRange) -> Result<KeyRange> {
    let separator = FIELD_SEPARATOR as u8;
    let end = &range.end;
    let upper = match end.iter().position(|&b| b <= separator) {
        Some(k) => {
            let mut upper = end[..k].to_vec();
            upper.push(separator + 1);
            upper
        },
        None => end.clone(),
    };
    KeyRange::new(range.start.clone(), upper)
}
