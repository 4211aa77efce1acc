//! HTTP Server Integration Tests
//!
//! Every component router is exercised in-process with
//! `tower::ServiceExt::oneshot`; no sockets are opened.
//!
//! # Test Coverage
//!
//! 1. **Health / Metrics** - common routes on every component
//! 2. **Range assigner** - register, heartbeat, assignments, leaves
//! 3. **Leaf** - write, wrong leaf, data, series, malformed bodies
//! 4. **Zone index** - register, query and forget hints
//! 5. **Ingestion router** - routed write through an in-process zone
//! 6. **Zone mixer** - query tree and aggregate endpoint
//! 7. **Scheduler** - register, list, remove

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use kuba_fleet::{
    broker::MemoryBroker,
    config::{LeafConfig, MixerConfig, RangeAssignerConfig, RouterConfig, SchedulerConfig},
    index::FieldHintsIndex,
    ingestion::IngestionRouter,
    leaf::{LeafAgent, LeafStore, LocalLeafClient},
    mixer::ZoneMixer,
    range::{RangeAssigner, SnapshotCache},
    scheduler::{ManualClock, StandingQueryScheduler, TracingSink},
    server::{
        self, AssignerState, IndexState, IngestState, LeafState, SchedulerState, ServerContext,
        ZoneMixerState,
    },
    trigram::trigrams,
    Result,
};
use serde_json::{json, Value};
use tower::ServiceExt;

// =============================================================================
// Helpers
// =============================================================================

fn context(component: &'static str) -> ServerContext {
    ServerContext::new(component, Duration::from_secs(5)).unwrap()
}

/// Helper to make a request with an optional raw body
async fn raw_request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Vec<u8>>,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(bytes) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(bytes)
        },
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn get_request(router: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = raw_request(router, "GET", uri, None).await;
    (status, serde_json::from_slice(&body).unwrap_or(json!({})))
}

async fn post_request(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let (status, body) =
        raw_request(router, "POST", uri, Some(serde_json::to_vec(&body).unwrap())).await;
    (status, serde_json::from_slice(&body).unwrap_or(json!({})))
}

fn series_json(schema: &str, job: &str, points: &[(i64, i64)]) -> Value {
    json!({
        "target": {"schema": schema, "fields": {"job": job}},
        "metric": {"schema": "/rpc/latency"},
        "points": points
            .iter()
            .map(|(ts, v)| json!({"timestamp_ms": ts, "value": v}))
            .collect::<Vec<_>>(),
    })
}

/// Assigner plus one registered leaf that owns the whole keyspace
struct OneLeafZone {
    ra: Arc<RangeAssigner>,
    index: Arc<FieldHintsIndex>,
    agent: Arc<LeafAgent>,
    leaves: Arc<LocalLeafClient>,
}

impl OneLeafZone {
    async fn new() -> Result<Self> {
        let index = Arc::new(FieldHintsIndex::new());
        let ra = Arc::new(
            RangeAssigner::new(RangeAssignerConfig::default()).with_hints_index(index.clone()),
        );
        let store = Arc::new(LeafStore::new(
            &LeafConfig::default(),
            Arc::new(MemoryBroker::default()),
        ));
        let agent = Arc::new(LeafAgent::new(store.clone(), ra.clone(), index.clone(), "leaf-a:9000"));
        agent.register().await?;
        let leaves = Arc::new(LocalLeafClient::new());
        leaves.attach("leaf-a:9000", store);
        Ok(Self {
            ra,
            index,
            agent,
            leaves,
        })
    }

    fn leaf_router(&self) -> Router {
        server::leaf::router(Arc::new(LeafState {
            context: context("leaf"),
            store: self.agent.store().clone(),
        }))
    }

    fn cache(&self) -> Arc<SnapshotCache> {
        Arc::new(SnapshotCache::new(self.ra.clone()))
    }
}

// =============================================================================
// Tests: Health / Metrics
// =============================================================================

#[tokio::test]
async fn test_health_reports_component() {
    let router = server::index::router(Arc::new(IndexState {
        context: context("zone-index"),
        index: Arc::new(FieldHintsIndex::new()),
    }));

    let (status, json) = get_request(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["component"], "zone-index");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_leaf_health_tracks_registration() {
    let store = Arc::new(LeafStore::new(
        &LeafConfig::default(),
        Arc::new(MemoryBroker::default()),
    ));
    let router = server::leaf::router(Arc::new(LeafState {
        context: context("leaf"),
        store,
    }));
    let (_, json) = get_request(&router, "/health").await;
    assert_eq!(json["status"], "starting");

    let zone = OneLeafZone::new().await.unwrap();
    let (_, json) = get_request(&zone.leaf_router(), "/health").await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint_renders_requests_and_stats() {
    let zone = OneLeafZone::new().await.unwrap();
    let router = zone.leaf_router();
    post_request(&router, "/leaf/write", series_json("T", "frontend", &[(1, 1)])).await;

    let (status, body) = raw_request(&router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("fleet_requests_total"));
    assert!(text.contains(r#"route="/leaf/write""#));
    assert!(text.contains(r#"stat="series""#));
    assert!(text.contains(r#"component="leaf""#));
}

// =============================================================================
// Tests: Range Assigner
// =============================================================================

#[tokio::test]
async fn test_range_assigner_routes() {
    let ra = Arc::new(RangeAssigner::new(RangeAssignerConfig::default()));
    let router = server::assigner::router(Arc::new(AssignerState {
        context: context("range-assigner"),
        assigner: ra,
    }));

    let (status, json) = post_request(&router, "/ra/registerLeaf", json!("leaf-a:9000")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["leaf_id"], 1);
    assert_eq!(json["generation"], 1);

    let (status, body) =
        raw_request(&router, "POST", "/ra/registerLeaf", Some(b"leaf-b:9000".to_vec())).await;
    assert_eq!(status, StatusCode::OK);
    let second: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(second["leaf_id"], 2);

    let (_, json) = post_request(
        &router,
        "/ra/heartbeat",
        json!({"leaf_id": 1, "generation": 1}),
    )
    .await;
    assert_eq!(json["status"], "ok");
    let (_, json) = post_request(
        &router,
        "/ra/heartbeat",
        json!({"leaf_id": 1, "generation": 7}),
    )
    .await;
    assert_eq!(json["status"], "stale");

    let (status, full) = get_request(&router, "/ra/assignments").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(full["full"], true);
    assert_eq!(full["assignments"].as_array().unwrap().len(), 2);

    let version = full["version"].as_u64().unwrap();
    let (_, delta) = get_request(&router, &format!("/ra/assignments?since={version}")).await;
    assert_eq!(delta["full"], false);
    assert!(delta["assignments"].as_array().unwrap().is_empty());

    let (_, leaves) = get_request(&router, "/ra/leaves").await;
    assert_eq!(leaves.as_array().unwrap().len(), 2);

    let (status, _) = post_request(&router, "/ra/deregisterLeaf", json!({"leaf_id": 2})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, leaves) = get_request(&router, "/ra/leaves").await;
    assert_eq!(leaves.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_register_rejects_empty_address() {
    let router = server::assigner::router(Arc::new(AssignerState {
        context: context("range-assigner"),
        assigner: Arc::new(RangeAssigner::new(RangeAssignerConfig::default())),
    }));
    let (status, json) = post_request(&router, "/ra/registerLeaf", json!("  ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "invalid_input");
}

// =============================================================================
// Tests: Leaf
// =============================================================================

#[tokio::test]
async fn test_leaf_write_and_read_back() {
    let zone = OneLeafZone::new().await.unwrap();
    let router = zone.leaf_router();

    let (status, ack) = post_request(
        &router,
        "/leaf/write",
        series_json("T", "frontend", &[(10, 1), (20, 2)]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["points"], 2);

    let (status, data) = get_request(&router, "/leaf/data?metric=%2Frpc%2Flatency&from=0&to=15").await;
    assert_eq!(status, StatusCode::OK);
    let series = data.as_array().unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0]["points"].as_array().unwrap().len(), 1);
    assert_eq!(series[0]["points"][0]["value"], 1);

    let (_, query) = post_request(
        &router,
        "/leaf/query",
        json!({
            "metric": "/rpc/latency", "from": 0, "to": 100,
            "predicate": {"op": "field", "scope": "target", "field": "job",
                          "match": "equals", "value": "backend"}
        }),
    )
    .await;
    assert!(query.as_array().unwrap().is_empty());

    let (_, keys) = get_request(&router, "/leaf/series?prefix=%2Frpc").await;
    assert_eq!(keys.as_array().unwrap().len(), 1);
    let (_, keys) = get_request(&router, "/leaf/series?prefix=%2Fdisk").await;
    assert!(keys.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_leaf_rejects_malformed_and_invalid_writes() {
    let zone = OneLeafZone::new().await.unwrap();
    let router = zone.leaf_router();

    let (status, body) =
        raw_request(&router, "POST", "/leaf/write", Some(b"{\"target\":".to_vec())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "invalid_input");

    let (status, json) = post_request(&router, "/leaf/write", series_json("T", "frontend", &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "invalid_input");
}

#[tokio::test]
async fn test_unregistered_leaf_answers_wrong_leaf() {
    let store = Arc::new(LeafStore::new(
        &LeafConfig::default(),
        Arc::new(MemoryBroker::default()),
    ));
    let router = server::leaf::router(Arc::new(LeafState {
        context: context("leaf"),
        store,
    }));
    let (status, json) = post_request(&router, "/leaf/write", series_json("T", "x", &[(1, 1)])).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "wrong_leaf");
}

// =============================================================================
// Tests: Zone Index
// =============================================================================

#[tokio::test]
async fn test_zone_index_routes() {
    let router = server::index::router(Arc::new(IndexState {
        context: context("zone-index"),
        index: Arc::new(FieldHintsIndex::new()),
    }));

    let mut batch = serde_json::Map::new();
    for fp in trigrams("frontend") {
        batch.insert(fp.to_string(), json!([1]));
    }
    for fp in trigrams("backend") {
        batch.insert(fp.to_string(), json!([2]));
    }
    let (status, _) = post_request(&router, "/zis/registerHints", Value::Object(batch)).await;
    assert_eq!(status, StatusCode::OK);

    let wanted: Vec<u64> = trigrams("front").into_iter().collect();
    let (_, leaves) = post_request(&router, "/zis/queryHints", json!(wanted)).await;
    assert_eq!(leaves, json!([1]));

    let (_, everyone) = post_request(&router, "/zis/queryHints", json!([])).await;
    assert_eq!(everyone, json!([1, 2]));

    post_request(&router, "/zis/forgetLeaf", json!({"leaf_id": 1})).await;
    let (_, leaves) = post_request(&router, "/zis/queryHints", json!(wanted)).await;
    assert_eq!(leaves, json!([]));

    let (_, stats) = get_request(&router, "/zis/stats").await;
    assert_eq!(stats["leaves"], 1);
    assert_eq!(stats["forgotten"], 1);
}

// =============================================================================
// Tests: Ingestion Router
// =============================================================================

#[tokio::test]
async fn test_ingest_write_is_routed_to_owner() {
    let zone = OneLeafZone::new().await.unwrap();
    let router = server::ingest::router(Arc::new(IngestState {
        context: context("ingest-router"),
        router: Arc::new(IngestionRouter::new(
            zone.cache(),
            zone.leaves.clone(),
            RouterConfig::default(),
        )),
    }));

    let (status, json) =
        post_request(&router, "/ingest/write", series_json("T", "frontend", &[(5, 5)])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"status": "ok", "leaf_id": 1}));
    assert_eq!(zone.agent.store().stats().points, 1);

    let (status, json) = post_request(&router, "/ingest/write", series_json("", "x", &[(5, 5)])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "invalid_input");
}

// =============================================================================
// Tests: Zone Mixer
// =============================================================================

#[tokio::test]
async fn test_zone_mixer_query_and_aggregate() {
    let zone = OneLeafZone::new().await.unwrap();
    let leaf = zone.leaf_router();
    post_request(&leaf, "/leaf/write", series_json("T", "frontend", &[(1, 2), (2, 4)])).await;
    post_request(&leaf, "/leaf/write", series_json("T", "backend", &[(1, 6)])).await;
    zone.agent.flush_hints().await.unwrap();

    let router = server::mixer::zone_router(Arc::new(ZoneMixerState {
        context: context("zone-mixer"),
        mixer: Arc::new(ZoneMixer::new(
            "zone-1",
            zone.cache(),
            zone.index.clone(),
            zone.leaves.clone(),
            MixerConfig::default(),
        )),
    }));

    let (status, json) = get_request(
        &router,
        "/zm/aggregate?metric=%2Frpc%2Flatency&from=0&to=10&type=avg",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["aggregate"]["value"], 4.0);
    assert_eq!(json["partial"], false);

    let (status, json) = post_request(
        &router,
        "/zm/query",
        json!({
            "op": "fetch", "metric": "/rpc/latency", "from": 0, "to": 10,
            "filter": {"op": "field", "scope": "target", "field": "job",
                       "match": "contains", "value": "front"}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["series"].as_array().unwrap().len(), 1);

    let (status, json) = get_request(
        &router,
        "/zm/aggregate?metric=%2Frpc%2Flatency&from=0&to=10&type=median",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "invalid_input");
}

// =============================================================================
// Tests: Scheduler
// =============================================================================

#[tokio::test]
async fn test_standing_query_routes() {
    let zone = OneLeafZone::new().await.unwrap();
    let mixer = Arc::new(kuba_fleet::mixer::RootMixer::new(
        vec![(
            "zone-1".to_string(),
            Arc::new(ZoneMixer::new(
                "zone-1",
                zone.cache(),
                zone.index.clone(),
                zone.leaves.clone(),
                MixerConfig::default(),
            )) as Arc<dyn kuba_fleet::mixer::ZoneClient>,
        )],
        MixerConfig::default(),
    ));
    let scheduler = Arc::new(StandingQueryScheduler::new(
        &SchedulerConfig::default(),
        mixer,
        Arc::new(TracingSink),
        Arc::new(ManualClock::new(0)),
    ));
    let router = server::scheduler::router(Arc::new(SchedulerState {
        context: context("scheduler"),
        scheduler,
    }));

    let (status, json) = post_request(
        &router,
        "/sqs/standing/register",
        json!({"query": {"op": "fetch", "metric": "/m", "from": 0, "to": 10}, "period_ms": 1000}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let query_id = json["query_id"].as_str().unwrap().to_string();

    let (_, list) = get_request(&router, "/sqs/standing/list").await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["query_id"], query_id.as_str());
    assert_eq!(list[0]["last_issued_ms"], Value::Null);

    let (status, _) = post_request(&router, "/sqs/standing/remove", json!({"query_id": query_id})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, json) = post_request(&router, "/sqs/standing/remove", json!({"query_id": query_id})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "not_found");

    let (status, _) = post_request(
        &router,
        "/sqs/standing/register",
        json!({"query": {"op": "fetch", "metric": "/m", "from": 0, "to": 10}, "period_ms": 0}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
