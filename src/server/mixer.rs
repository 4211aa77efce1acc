//! Zone mixer (`/zm/*`) and root mixer (`/rm/*`) routes

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::{finish, parse_json, ComponentState, ServerContext};
use crate::error::{Error, Result};
use crate::mixer::{MixerStats, RootMixer, ZoneMixer};
use crate::query::{AggregateFunction, QueryNode, QueryResult};

fn mixer_stats(stats: MixerStats) -> Vec<(&'static str, f64)> {
    vec![
        ("queries", stats.queries as f64),
        ("partial", stats.partial as f64),
        ("failed", stats.failed as f64),
        ("children_contacted", stats.children_contacted as f64),
        ("child_failures", stats.child_failures as f64),
    ]
}

// =============================================================================
// Zone mixer
// =============================================================================

pub struct ZoneMixerState {
    pub context: ServerContext,
    pub mixer: Arc<ZoneMixer>,
}

impl ComponentState for ZoneMixerState {
    fn context(&self) -> &ServerContext {
        &self.context
    }

    fn stats(&self) -> Vec<(&'static str, f64)> {
        let mut stats = mixer_stats(self.mixer.stats());
        stats.push(("snapshot_version", self.mixer.cache().version() as f64));
        stats
    }
}

/// Query string of `/zm/aggregate`
#[derive(Debug, Deserialize)]
pub struct AggregateParams {
    pub metric: String,
    pub from: i64,
    pub to: i64,
    #[serde(rename = "type")]
    pub function: String,
}

async fn zone_query(
    State(state): State<Arc<ZoneMixerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<QueryResult>> {
    let node: QueryNode = parse_json(&body)?;
    let deadline = state.context.deadline(&headers);
    Ok(Json(state.mixer.query(&node, &deadline).await?))
}

async fn zone_aggregate(
    State(state): State<Arc<ZoneMixerState>>,
    headers: HeaderMap,
    Query(params): Query<AggregateParams>,
) -> Result<Json<QueryResult>> {
    let function: AggregateFunction = params.function.parse().map_err(Error::InvalidInput)?;
    let deadline = state.context.deadline(&headers);
    let result = state
        .mixer
        .aggregate(&params.metric, params.from, params.to, function, &deadline)
        .await?;
    Ok(Json(result))
}

pub fn zone_router(state: Arc<ZoneMixerState>) -> Router {
    let routes = Router::new()
        .route("/zm/query", post(zone_query))
        .route("/zm/aggregate", get(zone_aggregate));
    finish(routes, state)
}

// =============================================================================
// Root mixer
// =============================================================================

pub struct RootMixerState {
    pub context: ServerContext,
    pub mixer: Arc<RootMixer>,
}

impl ComponentState for RootMixerState {
    fn context(&self) -> &ServerContext {
        &self.context
    }

    fn stats(&self) -> Vec<(&'static str, f64)> {
        let mut stats = mixer_stats(self.mixer.stats());
        stats.push(("zones", self.mixer.zones().count() as f64));
        stats
    }
}

async fn root_query(
    State(state): State<Arc<RootMixerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<QueryResult>> {
    let node: QueryNode = parse_json(&body)?;
    let deadline = state.context.deadline(&headers);
    Ok(Json(state.mixer.query(&node, &deadline).await?))
}

pub fn root_router(state: Arc<RootMixerState>) -> Router {
    let routes = Router::new().route("/rm/query", post(root_query));
    finish(routes, state)
}
