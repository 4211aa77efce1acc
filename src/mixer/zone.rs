//! Zone mixer
//!
//! 1. Plan trigram alternatives from the fetch filter
//! 2. Ask the zone index for candidates of each alternative; union them
//! 3. Fan the leaf query out, at most `fan_out_limit` leaves at a time
//! 4. Merge series, shape by the query operator, report unreachable leaves
//!
//! A series answered by the leaf that owns its key in the snapshot wins
//! over copies from leaves still holding it through a grace period.
//!
//! A universe plan skips the index and contacts every leaf of the
//! snapshot, as does a failing index: a superset of leaves is always a
//! correct answer, a subset is not.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::ZoneClient;
use crate::config::MixerConfig;
use crate::context::Deadline;
use crate::error::{Error, Result};
use crate::index::HintsIndex;
use crate::leaf::LeafClient;
use crate::query::{
    merge_series, plan_hints, AggregateFunction, HintPlan, LeafQuery, QueryNode, QueryResult,
    SeriesPoints,
};
use crate::range::{AssignmentSnapshot, SnapshotCache};
use crate::types::{LeafId, TargetString};

/// Counters for `/metrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerStats {
    pub queries: u64,
    pub partial: u64,
    pub failed: u64,
    pub children_contacted: u64,
    pub child_failures: u64,
}

#[derive(Default)]
pub(crate) struct MixerCounters {
    queries: AtomicU64,
    partial: AtomicU64,
    failed: AtomicU64,
    contacted: AtomicU64,
    child_failures: AtomicU64,
}

impl MixerCounters {
    pub(crate) fn record(&self, result: &Result<QueryResult>, contacted: usize, failures: usize) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.contacted.fetch_add(contacted as u64, Ordering::Relaxed);
        self.child_failures.fetch_add(failures as u64, Ordering::Relaxed);
        match result {
            Ok(r) if r.partial => self.partial.fetch_add(1, Ordering::Relaxed),
            Ok(_) => 0,
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn snapshot(&self) -> MixerStats {
        MixerStats {
            queries: self.queries.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            children_contacted: self.contacted.load(Ordering::Relaxed),
            child_failures: self.child_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct ZoneMixer {
    zone_id: String,
    cache: Arc<SnapshotCache>,
    index: Arc<dyn HintsIndex>,
    leaves: Arc<dyn LeafClient>,
    config: MixerConfig,
    counters: MixerCounters,
}

impl ZoneMixer {
    pub fn new(
        zone_id: impl Into<String>,
        cache: Arc<SnapshotCache>,
        index: Arc<dyn HintsIndex>,
        leaves: Arc<dyn LeafClient>,
        config: MixerConfig,
    ) -> Self {
        Self {
            zone_id: zone_id.into(),
            cache,
            index,
            leaves,
            config,
            counters: MixerCounters::default(),
        }
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn stats(&self) -> MixerStats {
        self.counters.snapshot()
    }

    /// `aggregate(function, fetch(metric, from, to))`
    pub async fn aggregate(
        &self,
        metric: &str,
        from: i64,
        to: i64,
        function: AggregateFunction,
        deadline: &Deadline,
    ) -> Result<QueryResult> {
        let node = QueryNode::aggregate(function, QueryNode::fetch_all(metric, from, to));
        self.query(&node, deadline).await
    }

    pub async fn query(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult> {
        node.validate()?;
        let deadline = deadline.capped(Duration::from_millis(self.config.query_timeout_ms));
        let mut contacted = 0;
        let mut failures = 0;
        let result = self
            .execute(node, &deadline, &mut contacted, &mut failures)
            .await;
        self.counters.record(&result, contacted, failures);
        result
    }

    async fn execute(
        &self,
        node: &QueryNode,
        deadline: &Deadline,
        contacted: &mut usize,
        failures: &mut usize,
    ) -> Result<QueryResult> {
        let snapshot = deadline
            .run("assignment snapshot", self.cache.ensure_loaded())
            .await?;
        let plan = plan_hints(node.fetch().filter.as_ref());
        let candidates = self.candidates(&plan, &snapshot, deadline).await;
        let targets = self.resolve(candidates, snapshot.clone()).await;
        if targets.is_empty() {
            return Ok(QueryResult::empty(node));
        }

        let leaf_query = LeafQuery::from(node.fetch());
        let leaf_query = &leaf_query;
        *contacted = targets.len();
        let mut calls = Vec::with_capacity(targets.len());
        for (leaf, address) in targets {
            let leaves = self.leaves.clone();
            calls.push(async move {
                let reply = leaves.query(&address, leaf_query, deadline).await;
                (leaf, reply)
            });
        }
        let replies = stream::iter(calls)
            .buffer_unordered(self.config.fan_out_limit.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut merged = BTreeMap::new();
        let mut stale = BTreeMap::new();
        let mut unreachable = Vec::new();
        let mut reached = 0;
        for (leaf, reply) in replies {
            match reply {
                Ok(series) => {
                    reached += 1;
                    let (owned, others): (Vec<_>, Vec<_>) = series
                        .into_iter()
                        .partition(|s| owner_of(&snapshot, s) == Some(leaf));
                    merge_series(&mut merged, owned);
                    merge_series(&mut stale, others);
                },
                Err(e) => {
                    tracing::warn!(zone = %self.zone_id, leaf = %leaf, error = %e, "Leaf query failed");
                    unreachable.push(leaf);
                },
            }
        }
        for (key, series) in stale {
            merged.entry(key).or_insert(series);
        }
        *failures = unreachable.len();
        if reached == 0 {
            return Err(Error::unavailable(format!(
                "none of {} candidate leaves answered",
                unreachable.len()
            )));
        }
        unreachable.sort();
        let unreachable = unreachable.iter().map(LeafId::to_string).collect();
        Ok(QueryResult::from_series(node, merged, unreachable))
    }

    async fn candidates(
        &self,
        plan: &HintPlan,
        snapshot: &AssignmentSnapshot,
        deadline: &Deadline,
    ) -> BTreeSet<LeafId> {
        let everyone = || snapshot.leaves().into_keys().collect::<BTreeSet<_>>();
        if plan.is_universe() {
            return everyone();
        }
        let mut candidates = BTreeSet::new();
        for alternative in plan.alternatives() {
            match deadline
                .run("hint lookup", self.index.query_hints(alternative))
                .await
            {
                Ok(leaves) => candidates.extend(leaves),
                Err(e) => {
                    tracing::warn!(zone = %self.zone_id, error = %e, "Zone index unavailable; querying every leaf");
                    return everyone();
                },
            }
        }
        candidates
    }

    /// Addresses of `candidates`; one refresh if the index knows a leaf
    /// the cached snapshot does not
    async fn resolve(
        &self,
        candidates: BTreeSet<LeafId>,
        snapshot: Arc<AssignmentSnapshot>,
    ) -> Vec<(LeafId, String)> {
        let mut addresses = snapshot.leaves();
        if candidates.iter().any(|id| !addresses.contains_key(id)) {
            if let Ok(fresh) = self.cache.refresh().await {
                addresses = fresh.leaves();
            }
        }
        candidates
            .into_iter()
            .filter_map(|id| addresses.get(&id).map(|a| (id, a.clone())))
            .collect()
    }
}

/// Leaf owning the series' target string in `snapshot`
fn owner_of(snapshot: &AssignmentSnapshot, series: &SeriesPoints) -> Option<LeafId> {
    let key = TargetString::from_target(&series.target);
    snapshot.lookup(key.as_bytes()).and_then(|a| a.leaf_id)
}

#[async_trait]
impl ZoneClient for ZoneMixer {
    async fn query(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult> {
        ZoneMixer::query(self, node, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::{LeafConfig, RangeAssignerConfig};
    use crate::index::{FieldHintsIndex, HintBatch};
    use crate::leaf::{LeafAgent, LeafStore, LocalLeafClient};
    use crate::query::Predicate;
    use crate::range::RangeAssigner;
    use crate::trigram::Fingerprint;
    use crate::types::{FieldValue, Metric, PointValue, Target, TimeSeries, TimeSeriesPoint};

    struct DownIndex;

    #[async_trait]
    impl HintsIndex for DownIndex {
        async fn register_hints(&self, _hints: HintBatch) -> Result<()> {
            Err(Error::unavailable("down"))
        }

        async fn query_hints(&self, _fps: &BTreeSet<Fingerprint>) -> Result<BTreeSet<LeafId>> {
            Err(Error::unavailable("down"))
        }

        async fn forget_leaf(&self, _leaf: LeafId) -> Result<()> {
            Ok(())
        }
    }

    struct Zone {
        agents: Vec<LeafAgent>,
        leaves: Arc<LocalLeafClient>,
        cache: Arc<SnapshotCache>,
        index: Arc<FieldHintsIndex>,
    }

    /// Two leaves: the first owns the lower half of the keyspace, the
    /// second the upper half (schemas starting at 0x7F and above)
    async fn zone() -> Zone {
        let index = Arc::new(FieldHintsIndex::new());
        let broker = Arc::new(MemoryBroker::default());
        let ra = Arc::new(RangeAssigner::new(RangeAssignerConfig::default()));
        let leaves = Arc::new(LocalLeafClient::new());
        let mut agents = Vec::new();
        for address in ["leaf-a:1", "leaf-b:1"] {
            let store = Arc::new(LeafStore::new(&LeafConfig::default(), broker.clone()));
            leaves.attach(address, store.clone());
            let agent = LeafAgent::new(store, ra.clone(), index.clone(), address);
            agent.register().await.unwrap();
            agents.push(agent);
        }
        agents[0].sync_assignments().await.unwrap();
        Zone {
            agents,
            leaves,
            cache: Arc::new(SnapshotCache::new(ra)),
            index,
        }
    }

    impl Zone {
        fn mixer(&self, index: Arc<dyn HintsIndex>) -> ZoneMixer {
            ZoneMixer::new(
                "zone-1",
                self.cache.clone(),
                index,
                self.leaves.clone(),
                MixerConfig::default(),
            )
        }

        async fn write(&self, leaf: usize, schema: &str, job: &str, values: &[i64]) {
            let series = TimeSeries {
                target: Target::new(schema).with_field("job", FieldValue::String(job.into())),
                metric: Metric::new("/m"),
                points: values
                    .iter()
                    .map(|&v| TimeSeriesPoint::new(v * 10, PointValue::Int64(v)))
                    .collect(),
            };
            self.agents[leaf].store().write(series).await.unwrap();
            self.agents[leaf].flush_hints().await.unwrap();
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_hints_prune_leaves() {
        let zone = zone().await;
        zone.write(0, "T", "frontend", &[1, 2]).await;
        zone.write(1, "Ω", "backend", &[3]).await;
        let mixer = zone.mixer(zone.index.clone());

        let mut node = QueryNode::fetch_all("/m", 0, 1000);
        if let QueryNode::Fetch(fetch) = &mut node {
            fetch.filter = Some(Predicate::target_equals("job", "backend"));
        }
        let result = mixer.query(&node, &deadline()).await.unwrap();
        assert_eq!(result.series.len(), 1);
        assert!(!result.partial);
        assert_eq!(mixer.stats().children_contacted, 1);
    }

    #[tokio::test]
    async fn test_average_across_leaves() {
        let zone = zone().await;
        zone.write(0, "T", "a", &[1, 2, 3, 4, 5]).await;
        zone.write(1, "Ω", "b", &[6, 7, 8, 9, 10]).await;
        let mixer = zone.mixer(zone.index.clone());

        for (function, expected) in [
            (AggregateFunction::Avg, 5.5),
            (AggregateFunction::Sum, 55.0),
            (AggregateFunction::Count, 10.0),
            (AggregateFunction::Max, 10.0),
        ] {
            let result = mixer
                .aggregate("/m", 0, 1000, function, &deadline())
                .await
                .unwrap();
            assert_eq!(result.aggregate.unwrap().value, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_unreachable_leaf_makes_result_partial() {
        let zone = zone().await;
        zone.write(0, "T", "a", &[1]).await;
        zone.write(1, "Ω", "b", &[2]).await;
        zone.leaves.set_down("leaf-b:1", true);
        let mixer = zone.mixer(zone.index.clone());

        let result = mixer
            .query(&QueryNode::fetch_all("/m", 0, 1000), &deadline())
            .await
            .unwrap();
        assert!(result.partial);
        assert_eq!(result.unreachable, vec!["leaf_2".to_string()]);
        assert_eq!(result.series.len(), 1);

        zone.leaves.set_down("leaf-a:1", true);
        let err = mixer
            .query(&QueryNode::fetch_all("/m", 0, 1000), &deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_index_outage_widens_to_every_leaf() {
        let zone = zone().await;
        zone.write(0, "T", "frontend", &[1]).await;
        let mixer = zone.mixer(Arc::new(DownIndex));

        let mut node = QueryNode::fetch_all("/m", 0, 1000);
        if let QueryNode::Fetch(fetch) = &mut node {
            fetch.filter = Some(Predicate::target_contains("job", "front"));
        }
        let result = mixer.query(&node, &deadline()).await.unwrap();
        assert_eq!(result.series.len(), 1);
        assert_eq!(mixer.stats().children_contacted, 2);
    }

    #[tokio::test]
    async fn test_no_candidates_is_an_empty_answer() {
        let zone = zone().await;
        zone.write(0, "T", "frontend", &[1]).await;
        let mixer = zone.mixer(zone.index.clone());

        let mut node = QueryNode::fetch_all("/m", 0, 1000);
        if let QueryNode::Fetch(fetch) = &mut node {
            fetch.filter = Some(Predicate::target_equals("job", "nowhere"));
        }
        let result = mixer.query(&node, &deadline()).await.unwrap();
        assert!(result.series.is_empty());
        assert!(!result.partial);
    }
}
