//! In-process leaf client
//!
//! Routes calls to [`LeafStore`]s living in the same process, keyed by
//! the address they registered with. Used for single-process zones and
//! for exercising routers and mixers without sockets.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::store::{LeafStore, WriteAck};
use super::LeafClient;
use crate::context::Deadline;
use crate::error::{Error, Result};
use crate::query::{LeafQuery, SeriesPoints};
use crate::types::TimeSeries;

#[derive(Default)]
pub struct LocalLeafClient {
    leaves: DashMap<String, Arc<LeafStore>>,
    down: DashSet<String>,
}

impl LocalLeafClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, address: impl Into<String>, store: Arc<LeafStore>) {
        self.leaves.insert(address.into(), store);
    }

    /// Make an address unreachable (or reachable again)
    pub fn set_down(&self, address: &str, down: bool) {
        if down {
            self.down.insert(address.to_string());
        } else {
            self.down.remove(address);
        }
    }

    fn store(&self, address: &str) -> Result<Arc<LeafStore>> {
        if self.down.contains(address) {
            return Err(Error::unavailable(format!("leaf at {address} is down")));
        }
        self.leaves
            .get(address)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::unavailable(format!("no leaf at {address}")))
    }
}

#[async_trait]
impl LeafClient for LocalLeafClient {
    async fn write(&self, address: &str, series: &TimeSeries, deadline: &Deadline) -> Result<WriteAck> {
        let store = self.store(address)?;
        deadline.run(address, store.write(series.clone())).await
    }

    async fn query(
        &self,
        address: &str,
        query: &LeafQuery,
        deadline: &Deadline,
    ) -> Result<Vec<SeriesPoints>> {
        let store = self.store(address)?;
        if deadline.is_expired() {
            return Err(Error::Timeout(format!("query to {address}")));
        }
        store.query(query)
    }
}
