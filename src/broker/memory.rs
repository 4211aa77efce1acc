//! In-process log broker

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{LogBroker, LogRecord};
use crate::error::Result;
use crate::range::KeyRange;
use crate::trigram::fnv1a;

const DEFAULT_PARTITIONS: usize = 8;

type Partition = RwLock<Vec<LogRecord>>;

/// Log broker held in memory; used by tests and single-node setups
pub struct MemoryBroker {
    partitions: usize,
    topics: DashMap<String, Arc<Vec<Partition>>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: DashMap::new(),
        }
    }

    fn topic(&self, name: &str) -> Arc<Vec<Partition>> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new((0..self.partitions).map(|_| RwLock::default()).collect()))
            .clone()
    }

    fn partition_of(&self, key: &str) -> usize {
        (fnv1a(key.as_bytes()) % self.partitions as u64) as usize
    }

    /// Total records in a topic
    pub fn len(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|parts| parts.iter().map(|p| p.read().len()).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }
}

#[async_trait]
impl LogBroker for MemoryBroker {
    async fn append(&self, topic: &str, records: Vec<LogRecord>) -> Result<usize> {
        let parts = self.topic(topic);
        let count = records.len();
        for record in records {
            let idx = self.partition_of(&record.key);
            parts[idx].write().push(record);
        }
        Ok(count)
    }

    async fn read(&self, topic: &str, range: &KeyRange) -> Result<Vec<LogRecord>> {
        let Some(parts) = self.topics.get(topic).map(|p| p.clone()) else {
            return Ok(Vec::new());
        };
        Ok(parts
            .iter()
            .flat_map(|p| {
                p.read()
                    .iter()
                    .filter(|r| range.contains(r.key.as_bytes()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }
}
