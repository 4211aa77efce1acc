//! Request deadlines
//!
//! A deadline is fixed when a request enters the fleet and travels with
//! it: outbound calls carry the remaining budget in the `x-deadline-ms`
//! header and every await on a peer is bounded by it.

use std::future::Future;
use std::time::Duration;

use axum::http::HeaderMap;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Header carrying the remaining budget in milliseconds
pub const DEADLINE_HEADER: &str = "x-deadline-ms";

/// Absolute point in time a request must finish by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// Deadline from an inbound request, or `default` from now
    pub fn from_headers(headers: &HeaderMap, default: Duration) -> Self {
        let budget = headers
            .get(DEADLINE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(default);
        Self::after(budget)
    }

    /// This deadline or `budget` from now, whichever comes first
    pub fn capped(&self, budget: Duration) -> Self {
        Self {
            at: self.at.min(Instant::now() + budget),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Remaining budget formatted for the deadline header
    pub fn header_value(&self) -> String {
        self.remaining().as_millis().to_string()
    }

    /// Run `fut`, failing with `Timeout` if the deadline passes first
    pub async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{what} did not finish in time"))),
        }
    }

    /// Sleep for `duration`, or fail if that would overrun the deadline
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if duration >= self.remaining() {
            return Err(Error::Timeout("deadline reached while backing off".into()));
        }
        tokio::time::sleep(duration).await;
        Ok(())
    }
}
