//! Ingestion router route (`/ingest/write`)

use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Json, Router};

use super::{finish, parse_json, ComponentState, ServerContext};
use crate::error::Result;
use crate::ingestion::{IngestionRouter, RoutedWrite};
use crate::types::TimeSeries;

pub struct IngestState {
    pub context: ServerContext,
    pub router: Arc<IngestionRouter>,
}

impl ComponentState for IngestState {
    fn context(&self) -> &ServerContext {
        &self.context
    }

    fn stats(&self) -> Vec<(&'static str, f64)> {
        let stats = self.router.stats();
        vec![
            ("writes_ok", stats.writes_ok as f64),
            ("writes_invalid", stats.writes_invalid as f64),
            ("writes_failed", stats.writes_failed as f64),
            ("retries", stats.retries as f64),
            ("refreshes", stats.refreshes as f64),
            ("snapshot_version", stats.snapshot_version as f64),
        ]
    }
}

async fn write(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RoutedWrite>> {
    let series: TimeSeries = parse_json(&body)?;
    let deadline = state.context.deadline(&headers);
    Ok(Json(state.router.write(&series, &deadline).await?))
}

pub fn router(state: Arc<IngestState>) -> Router {
    let routes = Router::new().route("/ingest/write", post(write));
    finish(routes, state)
}
