//! Field-hint batching
//!
//! Every distinct field value a leaf stores is cut into trigrams once.
//! New fingerprints accumulate in a pending set and are flushed to the
//! zone index in batches. A failed flush puts the batch back so hints are
//! never lost, only delayed.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashSet;
use parking_lot::Mutex;

use crate::error::Result;
use crate::index::{HintBatch, HintsIndex};
use crate::trigram::{trigrams, Fingerprint};
use crate::types::{LeafId, Metric, Target};

/// Collects fingerprints that still have to reach the zone index
#[derive(Default)]
pub struct HintCollector {
    seen: DashSet<String>,
    pending: Mutex<BTreeSet<Fingerprint>>,
}

impl HintCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the field values of a series; returns new fingerprints queued
    pub fn observe(&self, target: &Target, metric: &Metric) -> usize {
        let mut fresh = BTreeSet::new();
        for value in target.fields.values().chain(metric.fields.values()) {
            let rendered = value.render();
            if self.seen.contains(&rendered) {
                continue;
            }
            fresh.extend(trigrams(&rendered));
            self.seen.insert(rendered);
        }
        if fresh.is_empty() {
            return 0;
        }
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.extend(fresh);
        pending.len() - before
    }

    /// Forget what was sent; used when the leaf got a new identity and the
    /// index no longer knows it
    pub fn reset(&self) {
        self.seen.clear();
        self.pending.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send pending fingerprints under `leaf`
    pub async fn flush(&self, index: &dyn HintsIndex, leaf: LeafId) -> Result<usize> {
        let batch: BTreeSet<Fingerprint> = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        let hints: HintBatch = batch
            .iter()
            .map(|&fp| (fp, BTreeSet::from([leaf])))
            .collect::<BTreeMap<_, _>>();

        match index.register_hints(hints).await {
            Ok(()) => {
                tracing::debug!(leaf = %leaf, fingerprints = count, "Hints flushed");
                Ok(count)
            },
            Err(e) => {
                self.pending.lock().extend(batch);
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::index::FieldHintsIndex;
    use crate::types::FieldValue;
    use async_trait::async_trait;

    struct DownIndex;

    #[async_trait]
    impl HintsIndex for DownIndex {
        async fn register_hints(&self, _hints: HintBatch) -> Result<()> {
            Err(Error::unavailable("index down"))
        }

        async fn query_hints(&self, _fps: &BTreeSet<Fingerprint>) -> Result<BTreeSet<LeafId>> {
            Err(Error::unavailable("index down"))
        }

        async fn forget_leaf(&self, _leaf: LeafId) -> Result<()> {
            Ok(())
        }
    }

    fn target(job: &str) -> Target {
        Target::new("T").with_field("job", FieldValue::String(job.into()))
    }

    #[test]
    fn test_values_are_hinted_once() {
        let collector = HintCollector::new();
        assert!(collector.observe(&target("frontend"), &Metric::new("/m")) > 0);
        assert_eq!(collector.observe(&target("frontend"), &Metric::new("/m")), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch() {
        let collector = HintCollector::new();
        collector.observe(&target("frontend"), &Metric::new("/m"));
        let pending = collector.pending_len();

        assert!(collector.flush(&DownIndex, LeafId(1)).await.is_err());
        assert_eq!(collector.pending_len(), pending);

        let index = FieldHintsIndex::new();
        assert_eq!(collector.flush(&index, LeafId(1)).await.unwrap(), pending);
        assert_eq!(collector.pending_len(), 0);
        assert_eq!(index.query(&trigrams("front")), BTreeSet::from([LeafId(1)]));
    }
}
