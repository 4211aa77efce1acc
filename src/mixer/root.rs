//! Root mixer: cross-zone fan-out and final merge
//!
//! The root does no trigram planning; every zone gets the full query and
//! prunes its own leaves. Zone answers are merged with
//! [`QueryResult::merge`], which is associative, so the order in which
//! zones answer does not matter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::zone::{MixerCounters, MixerStats};
use super::ZoneClient;
use crate::config::MixerConfig;
use crate::context::Deadline;
use crate::error::{Error, Result};
use crate::query::{QueryNode, QueryResult};
use crate::scheduler::QueryIssuer;

pub struct RootMixer {
    zones: Vec<(String, Arc<dyn ZoneClient>)>,
    config: MixerConfig,
    counters: MixerCounters,
}

impl RootMixer {
    pub fn new(zones: Vec<(String, Arc<dyn ZoneClient>)>, config: MixerConfig) -> Self {
        Self {
            zones,
            config,
            counters: MixerCounters::default(),
        }
    }

    pub fn zones(&self) -> impl Iterator<Item = &str> {
        self.zones.iter().map(|(name, _)| name.as_str())
    }

    pub fn stats(&self) -> MixerStats {
        self.counters.snapshot()
    }

    pub async fn query(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult> {
        node.validate()?;
        let deadline = deadline.capped(Duration::from_millis(self.config.query_timeout_ms));
        let deadline = &deadline;

        let mut calls = Vec::with_capacity(self.zones.len());
        for (name, zone) in &self.zones {
            let name = name.clone();
            let zone = zone.clone();
            calls.push(async move {
                let reply = zone.query(node, deadline).await;
                (name, reply)
            });
        }
        let replies = stream::iter(calls)
            .buffer_unordered(self.config.fan_out_limit.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut merged: Option<QueryResult> = None;
        let mut failed = Vec::new();
        for (name, reply) in replies {
            match reply {
                Ok(result) => {
                    let scoped = result.scoped_to_zone(&name);
                    merged = Some(match merged {
                        Some(acc) => acc.merge(scoped),
                        None => scoped,
                    });
                },
                Err(e) => {
                    tracing::warn!(zone = %name, error = %e, "Zone query failed");
                    failed.push(name);
                },
            }
        }

        let result = match merged {
            Some(mut result) => {
                result.unreachable.extend(failed.iter().cloned());
                result.unreachable.sort();
                result.partial = !result.unreachable.is_empty();
                Ok(result)
            },
            None if self.zones.is_empty() => Ok(QueryResult::empty(node)),
            None => Err(Error::unavailable(format!(
                "none of {} zones answered",
                failed.len()
            ))),
        };
        self.counters
            .record(&result, self.zones.len(), failed.len());
        result
    }
}

#[async_trait]
impl QueryIssuer for RootMixer {
    async fn issue(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult> {
        self.query(node, deadline).await
    }
}
