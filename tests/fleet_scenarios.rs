//! End-to-end fleet scenarios
//!
//! A whole zone is wired in-process: range assigner, field-hints index,
//! an in-memory recovery log, leaves behind a [`LocalLeafClient`], the
//! ingestion router and both mixers. Everything talks through the same
//! traits the HTTP clients implement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kuba_fleet::{
    broker::MemoryBroker,
    config::{LeafConfig, MixerConfig, RangeAssignerConfig, RouterConfig, SchedulerConfig},
    context::Deadline,
    index::FieldHintsIndex,
    ingestion::IngestionRouter,
    leaf::{LeafAgent, LeafStore, LocalLeafClient},
    mixer::{RootMixer, ZoneClient, ZoneMixer},
    query::{AggregateFunction, LeafQuery, Predicate, QueryNode, QueryResult},
    range::{KeyRange, RangeAssigner, SnapshotCache},
    scheduler::{ManualClock, QueryIssuer, StandingQueryScheduler, TracingSink},
    types::{
        FieldValue, LeafId, Metric, PointValue, Target, TargetString, TimeSeries, TimeSeriesPoint,
    },
    Result,
};

// =============================================================================
// Zone fixture
// =============================================================================

struct Zone {
    ra: Arc<RangeAssigner>,
    index: Arc<FieldHintsIndex>,
    broker: Arc<MemoryBroker>,
    leaves: Arc<LocalLeafClient>,
    agents: Vec<Arc<LeafAgent>>,
}

impl Zone {
    fn new() -> Self {
        let index = Arc::new(FieldHintsIndex::new());
        let ra = RangeAssigner::new(RangeAssignerConfig::default()).with_hints_index(index.clone());
        Self {
            ra: Arc::new(ra),
            index,
            broker: Arc::new(MemoryBroker::default()),
            leaves: Arc::new(LocalLeafClient::new()),
            agents: Vec::new(),
        }
    }

    /// Start a leaf at `address` and let every leaf catch up
    async fn add_leaf(&mut self, address: &str) -> Result<Arc<LeafAgent>> {
        let store = Arc::new(LeafStore::new(&LeafConfig::default(), self.broker.clone()));
        store.set_durable(true);
        let agent = Arc::new(LeafAgent::new(
            store.clone(),
            self.ra.clone(),
            self.index.clone(),
            address,
        ));
        self.leaves.attach(address, store);
        agent.register().await?;
        self.agents.push(agent.clone());
        for agent in &self.agents {
            agent.sync_assignments().await?;
        }
        Ok(agent)
    }

    async fn flush_hints(&self) -> Result<()> {
        for agent in &self.agents {
            agent.flush_hints().await?;
        }
        Ok(())
    }

    fn cache(&self) -> Arc<SnapshotCache> {
        Arc::new(SnapshotCache::new(self.ra.clone()))
    }

    fn router(&self) -> IngestionRouter {
        IngestionRouter::new(self.cache(), self.leaves.clone(), RouterConfig::default())
    }

    fn mixer(&self) -> Arc<ZoneMixer> {
        Arc::new(ZoneMixer::new(
            "zone-1",
            self.cache(),
            self.index.clone(),
            self.leaves.clone(),
            MixerConfig::default(),
        ))
    }
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

fn series(target: Target, metric: &str, points: &[(i64, i64)]) -> TimeSeries {
    TimeSeries {
        target,
        metric: Metric::new(metric),
        points: points
            .iter()
            .map(|&(ts, v)| TimeSeriesPoint::new(ts, PointValue::Int64(v)))
            .collect(),
    }
}

/// Lands in the lower half of the keyspace (leaf_1 after the first split)
fn frontend() -> Target {
    Target::new("T").with_field("job", FieldValue::String("frontend".into()))
}

/// Lands in the upper half of the keyspace (leaf_2 after the first split)
fn database() -> Target {
    Target::new("Ω").with_field("job", FieldValue::String("database".into()))
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_single_leaf_round_trip() {
    let mut zone = Zone::new();
    let leaf = zone.add_leaf("leaf-1:9000").await.unwrap();
    let router = zone.router();

    let target = Target::new("T").with_field("h", FieldValue::String("a".into()));
    let routed = router
        .write(&series(target, "/m", &[(100, 1)]), &deadline())
        .await
        .unwrap();
    assert_eq!(routed.leaf_id, LeafId(1));

    let read = leaf
        .store()
        .query(&LeafQuery {
            metric: "/m".into(),
            from: 0,
            to: 200,
            predicate: None,
        })
        .unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(
        read[0].points,
        vec![TimeSeriesPoint::new(100, PointValue::Int64(1))]
    );
}

#[tokio::test]
async fn test_split_on_join() {
    let mut zone = Zone::new();
    zone.add_leaf("leaf-1:9000").await.unwrap();
    assert_eq!(zone.ra.snapshot().assignments.len(), 1);
    assert_eq!(zone.ra.snapshot().assignments[0].range, KeyRange::full());

    zone.add_leaf("leaf-2:9000").await.unwrap();
    let snapshot = zone.ra.snapshot();
    assert_eq!(snapshot.assignments.len(), 2);
    assert!(snapshot.is_complete_cover());

    let owners: Vec<_> = snapshot.assignments.iter().map(|a| a.leaf_id).collect();
    assert!(owners.contains(&Some(LeafId(1))));
    assert!(owners.contains(&Some(LeafId(2))));

    for target in [frontend(), database(), Target::new("a"), Target::new("zzz")] {
        let key = TargetString::from_target(&target);
        let holders = snapshot
            .assignments
            .iter()
            .filter(|a| a.range.contains(key.as_bytes()))
            .count();
        assert_eq!(holders, 1, "{key} must fall in exactly one range");
    }

    for agent in &zone.agents {
        assert_eq!(agent.store().owned_ranges().len(), 1);
    }
}

#[tokio::test]
async fn test_routing_after_split_prunes_by_hints() {
    let mut zone = Zone::new();
    zone.add_leaf("leaf-1:9000").await.unwrap();
    zone.add_leaf("leaf-2:9000").await.unwrap();
    let router = zone.router();

    let front = router
        .write(&series(frontend(), "/m", &[(1, 1)]), &deadline())
        .await
        .unwrap();
    let db = router
        .write(&series(database(), "/m", &[(1, 2)]), &deadline())
        .await
        .unwrap();
    assert_eq!(front.leaf_id, LeafId(1));
    assert_eq!(db.leaf_id, LeafId(2));
    zone.flush_hints().await.unwrap();

    let mixer = zone.mixer();
    let query = QueryNode::Fetch(kuba_fleet::query::FetchNode {
        metric: "/m".into(),
        from: 0,
        to: 10,
        filter: Some(Predicate::target_contains("job", "front")),
    });
    let result = mixer.query(&query, &deadline()).await.unwrap();
    assert_eq!(result.series.len(), 1);
    assert_eq!(result.series[0].target, frontend());
    assert_eq!(mixer.stats().children_contacted, 1);
}

#[tokio::test]
async fn test_aggregation_across_leaves() {
    let mut zone = Zone::new();
    zone.add_leaf("leaf-1:9000").await.unwrap();
    zone.add_leaf("leaf-2:9000").await.unwrap();
    let router = zone.router();

    let low: Vec<(i64, i64)> = (1..=5).map(|v| (v, v)).collect();
    let high: Vec<(i64, i64)> = (6..=10).map(|v| (v, v)).collect();
    router
        .write(&series(frontend(), "/m", &low), &deadline())
        .await
        .unwrap();
    router
        .write(&series(database(), "/m", &high), &deadline())
        .await
        .unwrap();

    let mixer = zone.mixer();
    for (function, expected) in [
        (AggregateFunction::Avg, 5.5),
        (AggregateFunction::Sum, 55.0),
        (AggregateFunction::Count, 10.0),
        (AggregateFunction::Min, 1.0),
        (AggregateFunction::Max, 10.0),
    ] {
        let result = mixer
            .aggregate("/m", 0, 100, function, &deadline())
            .await
            .unwrap();
        assert_eq!(result.aggregate.unwrap().value, Some(expected), "{function:?}");
    }
}

#[tokio::test]
async fn test_partial_failure_reports_unreachable_leaf() {
    let mut zone = Zone::new();
    zone.add_leaf("leaf-1:9000").await.unwrap();
    zone.add_leaf("leaf-2:9000").await.unwrap();
    let router = zone.router();
    router
        .write(&series(frontend(), "/m", &[(1, 1), (2, 2)]), &deadline())
        .await
        .unwrap();
    router
        .write(&series(database(), "/m", &[(1, 3)]), &deadline())
        .await
        .unwrap();

    zone.leaves.set_down("leaf-2:9000", true);
    let result = zone
        .mixer()
        .query(&QueryNode::fetch_all("/m", 0, 10), &deadline())
        .await
        .unwrap();
    assert!(result.partial);
    assert_eq!(result.unreachable, vec!["leaf_2".to_string()]);
    assert_eq!(result.series.len(), 1);
    assert_eq!(result.series[0].points.len(), 2);
}

/// Root mixer wrapper counting issuances
struct CountingRoot {
    root: RootMixer,
    issued: AtomicU64,
}

#[async_trait]
impl QueryIssuer for CountingRoot {
    async fn issue(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        self.root.query(node, deadline).await
    }
}

#[tokio::test]
async fn test_standing_query_issued_once_per_period() {
    let mut zone = Zone::new();
    zone.add_leaf("leaf-1:9000").await.unwrap();
    zone.router()
        .write(&series(frontend(), "/m", &[(1, 1)]), &deadline())
        .await
        .unwrap();

    let zone_client: Arc<dyn ZoneClient> = zone.mixer();
    let root = Arc::new(CountingRoot {
        root: RootMixer::new(vec![("zone-1".into(), zone_client)], MixerConfig::default()),
        issued: AtomicU64::new(0),
    });
    let clock = Arc::new(ManualClock::new(0));
    let sqs = StandingQueryScheduler::new(
        &SchedulerConfig::default(),
        root.clone(),
        Arc::new(TracingSink),
        clock.clone(),
    );
    let query_id = sqs
        .register(
            QueryNode::aggregate(AggregateFunction::Sum, QueryNode::fetch_all("/m", 0, 10)),
            1_000,
        )
        .unwrap();

    for _ in 0..35 {
        clock.advance(100);
        for handle in sqs.tick() {
            handle.await.unwrap();
        }
    }
    assert_eq!(root.issued.load(Ordering::SeqCst), 3);

    sqs.remove(&query_id).unwrap();
    for _ in 0..30 {
        clock.advance(100);
        for handle in sqs.tick() {
            handle.await.unwrap();
        }
    }
    assert_eq!(root.issued.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_leaf_departure_moves_data_through_recovery_log() {
    let mut zone = Zone::new();
    zone.add_leaf("leaf-1:9000").await.unwrap();
    let second = zone.add_leaf("leaf-2:9000").await.unwrap();
    let router = zone.router();
    router
        .write(&series(database(), "/m", &[(1, 7), (2, 8)]), &deadline())
        .await
        .unwrap();

    second.deregister().await.unwrap();
    zone.leaves.set_down("leaf-2:9000", true);
    zone.agents[0].sync_assignments().await.unwrap();

    let result = zone
        .mixer()
        .query(&QueryNode::fetch_all("/m", 0, 10), &deadline())
        .await
        .unwrap();
    assert!(!result.partial);
    assert_eq!(result.series.len(), 1);
    assert_eq!(result.series[0].points.len(), 2);
}

#[tokio::test]
async fn test_owner_copy_wins_over_grace_period_copy() {
    let mut zone = Zone::new();
    zone.add_leaf("leaf-1:9000").await.unwrap();
    zone.router()
        .write(&series(database(), "/m", &[(1, 7)]), &deadline())
        .await
        .unwrap();

    // leaf_2 takes the upper half; leaf_1 keeps its stale copy while in grace
    zone.add_leaf("leaf-2:9000").await.unwrap();
    let routed = zone
        .router()
        .write(&series(database(), "/m", &[(1, 99)]), &deadline())
        .await
        .unwrap();
    assert_eq!(routed.leaf_id, LeafId(2));

    let mixer = zone.mixer();
    let result = mixer
        .query(&QueryNode::fetch_all("/m", 0, 10), &deadline())
        .await
        .unwrap();
    assert_eq!(mixer.stats().children_contacted, 2);
    assert_eq!(result.series.len(), 1);
    assert_eq!(
        result.series[0].points,
        vec![TimeSeriesPoint::new(1, PointValue::Int64(99))]
    );
}
