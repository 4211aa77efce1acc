//! Standing-query scheduler
//!
//! Holds registered queries and re-issues each one every `period_ms`
//! against the root mixer:
//!
//! ```text
//!   tick ──▶ due = { q | !in_flight(q) ∧ (last_issued(q) or registered_at(q)) + period(q) ≤ now }
//!        ──▶ mark in flight, last_issued = now
//!        ──▶ spawn: permit ──▶ QueryIssuer.issue ──▶ ResultSink.deliver ──▶ clear in flight
//! ```
//!
//! The in-flight flag is cleared when the issuance task ends, also when
//! the issuer or the sink panics.
//!
//! Ticks missed while a query is in flight or while the scheduler was
//! busy coalesce into a single issuance.

pub mod clock;
pub mod sink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use sink::{BrokerSink, TracingSink, RESULTS_TOPIC};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::context::Deadline;
use crate::error::{Error, Result};
use crate::query::{QueryNode, QueryResult};
use crate::services::PeriodicTask;

/// Whatever answers standing queries (the root mixer)
#[async_trait]
pub trait QueryIssuer: Send + Sync {
    async fn issue(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult>;
}

/// Where issuance results go
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: &StandingResult) -> Result<()>;
}

/// Outcome of one issuance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingResult {
    pub query_id: String,
    pub issued_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `/sqs/standing/register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterStanding {
    pub query: QueryNode,
    pub period_ms: u64,
}

/// Answer to `/sqs/standing/register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredStanding {
    pub query_id: String,
}

/// Body of `/sqs/standing/remove`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveStanding {
    pub query_id: String,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingQueryInfo {
    pub query_id: String,
    pub query: QueryNode,
    pub period_ms: u64,
    pub registered_at_ms: i64,
    pub last_issued_ms: Option<i64>,
    pub issuances: u64,
}

struct Entry {
    info: StandingQueryInfo,
    in_flight: Arc<AtomicBool>,
}

impl Entry {
    fn due(&self, now: i64) -> bool {
        let base = self.info.last_issued_ms.unwrap_or(self.info.registered_at_ms);
        !self.in_flight.load(Ordering::Acquire)
            && base.saturating_add(self.info.period_ms as i64) <= now
    }
}

/// Clears an entry's in-flight flag on drop
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StandingQueryScheduler {
    queries: RwLock<BTreeMap<String, Entry>>,
    issuer: Arc<dyn QueryIssuer>,
    sink: Arc<dyn ResultSink>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    issued: AtomicU64,
}

impl StandingQueryScheduler {
    pub fn new(
        config: &SchedulerConfig,
        issuer: Arc<dyn QueryIssuer>,
        sink: Arc<dyn ResultSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queries: RwLock::new(BTreeMap::new()),
            issuer,
            sink,
            clock,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            issued: AtomicU64::new(0),
        }
    }

    pub fn register(&self, query: QueryNode, period_ms: u64) -> Result<String> {
        if period_ms == 0 {
            return Err(Error::InvalidInput("period_ms must be positive".into()));
        }
        if period_ms > i64::MAX as u64 {
            return Err(Error::InvalidInput("period_ms is out of range".into()));
        }
        query.validate()?;

        let query_id = uuid::Uuid::new_v4().to_string();
        let info = StandingQueryInfo {
            query_id: query_id.clone(),
            query,
            period_ms,
            registered_at_ms: self.clock.now_ms(),
            last_issued_ms: None,
            issuances: 0,
        };
        self.queries.write().insert(
            query_id.clone(),
            Entry {
                info,
                in_flight: Arc::new(AtomicBool::new(false)),
            },
        );
        tracing::info!(query_id = %query_id, period_ms, "Standing query registered");
        Ok(query_id)
    }

    pub fn remove(&self, query_id: &str) -> Result<()> {
        match self.queries.write().remove(query_id) {
            Some(_) => {
                tracing::info!(query_id, "Standing query removed");
                Ok(())
            },
            None => Err(Error::NotFound(format!("standing query {query_id}"))),
        }
    }

    pub fn list(&self) -> Vec<StandingQueryInfo> {
        self.queries
            .read()
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn issued_total(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Issue every due query; returns the spawned issuances
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        let now = self.clock.now_ms();
        let due: Vec<(String, QueryNode, u64, Arc<AtomicBool>)> = {
            let mut queries = self.queries.write();
            queries
                .values_mut()
                .filter(|e| e.due(now))
                .map(|e| {
                    e.in_flight.store(true, Ordering::Release);
                    e.info.last_issued_ms = Some(now);
                    e.info.issuances += 1;
                    (
                        e.info.query_id.clone(),
                        e.info.query.clone(),
                        e.info.period_ms,
                        e.in_flight.clone(),
                    )
                })
                .collect()
        };

        due.into_iter()
            .map(|(query_id, query, period_ms, in_flight)| {
                self.issued.fetch_add(1, Ordering::Relaxed);
                let issuer = self.issuer.clone();
                let sink = self.sink.clone();
                let permits = self.permits.clone();
                tokio::spawn(async move {
                    let _in_flight = InFlightGuard(in_flight);
                    let _permit = permits.acquire_owned().await;
                    let deadline = Deadline::after(Duration::from_millis(period_ms));
                    let outcome = issuer.issue(&query, &deadline).await;
                    let result = StandingResult {
                        query_id: query_id.clone(),
                        issued_at_ms: now,
                        error: outcome.as_ref().err().map(ToString::to_string),
                        result: outcome.ok(),
                    };
                    if let Err(e) = sink.deliver(&result).await {
                        tracing::warn!(query_id = %query_id, error = %e, "Result sink rejected issuance");
                    }
                })
            })
            .collect()
    }
}

/// Drives [`StandingQueryScheduler::tick`]
pub struct SchedulerTicker {
    scheduler: Arc<StandingQueryScheduler>,
    period: Duration,
}

impl SchedulerTicker {
    pub fn new(scheduler: Arc<StandingQueryScheduler>, period: Duration) -> Self {
        Self { scheduler, period }
    }
}

#[async_trait]
impl PeriodicTask for SchedulerTicker {
    fn name(&self) -> &'static str {
        "standing-query-ticker"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_once(&self) -> Result<()> {
        self.scheduler.tick();
        Ok(())
    }
}
