//! Recovery log writer and record codec
//!
//! Appends are queued in commit order and drained by one task, so the
//! order in which a leaf commits points for a key is the order in which
//! they reach the broker. A write in durable mode waits for its batch's
//! acknowledgement; otherwise it returns as soon as the batch is queued.
//! The queue is bounded; a full queue sheds writes as `unavailable`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broker::{LogBroker, LogRecord, METRIC_HEADER, TARGET_HEADER};
use crate::error::{Error, Result};
use crate::types::{Metric, SeriesKey, Target, TimeSeriesPoint};

const MAX_APPEND_ATTEMPTS: u32 = 5;
const APPEND_BACKOFF: Duration = Duration::from_millis(100);

/// Build the log record for one committed point
pub fn encode_record(
    key: &SeriesKey,
    target: &Target,
    metric: &Metric,
    point: &TimeSeriesPoint,
) -> Result<LogRecord> {
    let mut headers = BTreeMap::new();
    headers.insert(TARGET_HEADER.to_string(), serde_json::to_string(target)?);
    headers.insert(METRIC_HEADER.to_string(), serde_json::to_string(metric)?);
    Ok(LogRecord {
        key: key.as_str().to_string(),
        value: serde_json::to_string(point)?,
        headers,
    })
}

/// A replayed log record
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub target: Target,
    pub metric: Metric,
    pub point: TimeSeriesPoint,
}

pub fn decode_record(record: &LogRecord) -> Result<DecodedRecord> {
    let header = |name: &str| {
        record
            .headers
            .get(name)
            .ok_or_else(|| Error::Internal(format!("log record for {} lacks '{name}'", record.key)))
    };
    Ok(DecodedRecord {
        target: serde_json::from_str(header(TARGET_HEADER)?)
            .map_err(|e| Error::Internal(format!("bad target header: {e}")))?,
        metric: serde_json::from_str(header(METRIC_HEADER)?)
            .map_err(|e| Error::Internal(format!("bad metric header: {e}")))?,
        point: serde_json::from_str(&record.value)
            .map_err(|e| Error::Internal(format!("bad point payload: {e}")))?,
    })
}

struct AppendJob {
    records: Vec<LogRecord>,
    ack: Option<oneshot::Sender<Result<usize>>>,
}

/// Ordered, single-consumer queue in front of the broker
#[derive(Clone)]
pub struct RecoveryLogWriter {
    tx: mpsc::Sender<AppendJob>,
}

/// Resolves once the broker acknowledged a batch
#[derive(Debug)]
pub struct AppendAck(Option<oneshot::Receiver<Result<usize>>>);

impl AppendAck {
    pub async fn wait(self) -> Result<usize> {
        match self.0 {
            None => Ok(0),
            Some(rx) => rx
                .await
                .map_err(|_| Error::unavailable("recovery log writer stopped"))?,
        }
    }
}

impl RecoveryLogWriter {
    /// Spawn the drain task; it ends when every writer handle is dropped
    pub fn spawn(
        broker: Arc<dyn LogBroker>,
        topic: impl Into<String>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(drain(broker, topic.into(), rx));
        (Self { tx }, handle)
    }

    /// Queue records; callers hold the series commit gate so per-key
    /// order holds
    pub fn enqueue(&self, records: Vec<LogRecord>, want_ack: bool) -> Result<AppendAck> {
        let (ack, rx) = if want_ack {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        match self.tx.try_send(AppendJob { records, ack }) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Recovery log queue is full; shedding write");
                return Err(Error::unavailable("recovery log queue is full"));
            },
            Err(TrySendError::Closed(_)) => {
                return Err(Error::unavailable("recovery log writer stopped"));
            },
        }
        Ok(AppendAck(rx))
    }
}

async fn drain(
    broker: Arc<dyn LogBroker>,
    topic: String,
    mut rx: mpsc::Receiver<AppendJob>,
) {
    while let Some(job) = rx.recv().await {
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match broker.append(&topic, job.records.clone()).await {
                Ok(n) => break Ok(n),
                Err(e) if attempt < MAX_APPEND_ATTEMPTS => {
                    tracing::warn!(topic, attempt, error = %e, "Recovery log append failed; retrying");
                    tokio::time::sleep(APPEND_BACKOFF * attempt).await;
                },
                Err(e) => {
                    tracing::error!(
                        topic,
                        records = job.records.len(),
                        error = %e,
                        "Recovery log append abandoned"
                    );
                    break Err(e);
                },
            }
        };
        if let Some(ack) = job.ack {
            let _ = ack.send(result);
        }
    }
    tracing::debug!(topic, "Recovery log writer stopped");
}
