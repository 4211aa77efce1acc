//! Leaf store routes (`/leaf/*`)

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
use crate::error::Result;
use crate::leaf::{LeafStore, WriteAck};
use crate::query::{LeafQuery, SeriesPoints};
use crate::types::{SeriesKey, TimeSeries};

pub struct LeafState {
    pub context: ServerContext,
    pub store: Arc<LeafStore>,
}

impl ComponentState for LeafState {
    fn context(&self) -> &ServerContext {
        &self.context
    }

    fn stats(&self) -> Vec<(&'static str, f64)> {
        let stats = self.store.stats();
        vec![
            ("snapshot_version", stats.snapshot_version as f64),
            ("series", stats.series as f64),
            ("points", stats.points as f64),
            ("points_written", stats.points_written as f64),
            ("out_of_order", stats.out_of_order as f64),
            ("overwrites", stats.overwrites as f64),
            ("rejected_writes", stats.rejected_writes as f64),
            ("owned_ranges", stats.owned_ranges as f64),
            ("recovering_ranges", stats.recovering_ranges as f64),
            ("lost_ranges", stats.lost_ranges as f64),
            ("pending_hints", stats.pending_hints as f64),
        ]
    }

    fn status(&self) -> &'static str {
        if self.store.identity().is_none() {
            "starting"
        } else if !self.store.recovering_ranges().is_empty() {
            "recovering"
        } else {
            "ok"
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SeriesParams {
    pub prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DataParams {
    pub metric: String,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
}

async fn write(
    State(state): State<Arc<LeafState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WriteAck>> {
    let series: TimeSeries = parse_json(&body)?;
    let deadline = state.context.deadline(&headers);
    let ack = deadline.run("leaf write", state.store.write(series)).await?;
    Ok(Json(ack))
}

async fn query(
    State(state): State<Arc<LeafState>>,
    body: Bytes,
) -> Result<Json<Vec<SeriesPoints>>> {
    let query: LeafQuery = parse_json(&body)?;
    Ok(Json(state.store.query(&query)?))
}

async fn series(
    State(state): State<Arc<LeafState>>,
    Query(params): Query<SeriesParams>,
) -> Json<Vec<SeriesKey>> {
    Json(state.store.enumerate_series(params.prefix.as_deref()))
}

async fn data(
    State(state): State<Arc<LeafState>>,
    Query(params): Query<DataParams>,
) -> Result<Json<Vec<SeriesPoints>>> {
    let query = LeafQuery {
        metric: params.metric,
        from: params.from.unwrap_or(i64::MIN),
        to: params.to.unwrap_or(i64::MAX),
        predicate: None,
    };
    Ok(Json(state.store.query(&query)?))
}

pub fn router(state: Arc<LeafState>) -> Router {
    let routes = Router::new()
        .route("/leaf/write", post(write))
        .route("/leaf/query", post(query))
        .route("/leaf/series", get(series))
        .route("/leaf/data", get(data));
    finish(routes, state)
}
