//! HTTP surfaces of the fleet components
//!
//! Every component is served by its own axum [`Router`]; all of them share
//! the same plumbing:
//!
//! ```text
//!   request ──▶ CORS ──▶ trace ──▶ request metrics ──▶ handler
//!                                                        │
//!                 JSON body / Error envelope  ◀──────────┘
//! ```
//!
//! - `GET /health` and `GET /metrics` on every component
//! - bodies parsed with `serde_json` so malformed JSON is an
//!   `invalid_input` envelope like any other validation failure
//! - request deadlines read from `x-deadline-ms`, defaulting to
//!   `server.default_deadline_ms`

pub mod assigner;
pub mod index;
pub mod ingest;
pub mod leaf;
pub mod mixer;
pub mod scheduler;

pub use assigner::AssignerState;
pub use index::IndexState;
pub use ingest::IngestState;
pub use leaf::LeafState;
pub use mixer::{RootMixerState, ZoneMixerState};
pub use scheduler::SchedulerState;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{MatchedPath, Request, State},
    http::{header, HeaderMap, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::Deadline;
use crate::error::Result;
use crate::metrics::FleetMetrics;

// =============================================================================
// Shared state
// =============================================================================

/// What every component's state carries
#[derive(Clone)]
pub struct ServerContext {
    pub component: &'static str,
    pub metrics: Arc<FleetMetrics>,
    pub default_deadline: Duration,
    pub cors_origins: Vec<String>,
}

impl ServerContext {
    pub fn new(component: &'static str, default_deadline: Duration) -> Result<Self> {
        Ok(Self {
            component,
            metrics: Arc::new(FleetMetrics::new(component)?),
            default_deadline,
            cors_origins: Vec::new(),
        })
    }

    pub fn deadline(&self, headers: &HeaderMap) -> Deadline {
        Deadline::from_headers(headers, self.default_deadline)
    }
}

/// Implemented by each component's axum state
pub trait ComponentState: Send + Sync + 'static {
    fn context(&self) -> &ServerContext;

    /// Gauges copied into `/metrics` right before rendering
    fn stats(&self) -> Vec<(&'static str, f64)>;

    /// Reported by `/health`
    fn status(&self) -> &'static str {
        "ok"
    }
}

// =============================================================================
// Common responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub component: String,
}

/// Body of calls that answer nothing but success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
}

pub fn ack() -> Json<Ack> {
    Json(Ack {
        status: "ok".to_string(),
    })
}

/// Parse a JSON request body
pub fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

pub async fn health<S: ComponentState>(State(state): State<Arc<S>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.status().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        component: state.context().component.to_string(),
    })
}

pub async fn metrics<S: ComponentState>(State(state): State<Arc<S>>) -> Result<Response> {
    let metrics = &state.context().metrics;
    metrics.set_stats(state.stats());
    let body = metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

// =============================================================================
// Router assembly
// =============================================================================

/// Build CORS layer from configuration
fn build_cors_layer(cors_origins: &[String]) -> CorsLayer {
    if cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    }
}

async fn track_requests(
    State(metrics): State<Arc<FleetMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let response = next.run(request).await;
    metrics.record_request(
        &route,
        response.status().as_str(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Add `/health`, `/metrics` and the shared layers to a component router
pub fn finish<S: ComponentState>(routes: Router<Arc<S>>, state: Arc<S>) -> Router {
    let context = state.context().clone();
    routes
        .route("/health", get(health::<S>))
        .route("/metrics", get(metrics::<S>))
        .route_layer(middleware::from_fn_with_state(
            context.metrics.clone(),
            track_requests,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&context.cors_origins))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_maps_to_invalid_input() {
        let body = Bytes::from_static(b"{not json");
        let err = parse_json::<Ack>(&body).unwrap_err();
        assert_eq!(err.code(), "invalid_input");

        let ok: Ack = parse_json(&Bytes::from_static(br#"{"status":"ok"}"#)).unwrap();
        assert_eq!(ok.status, "ok");
    }

    #[test]
    fn test_context_default_deadline() {
        let context = ServerContext::new("leaf", Duration::from_millis(250)).unwrap();
        let deadline = context.deadline(&HeaderMap::new());
        assert!(deadline.remaining() <= Duration::from_millis(250));
        assert!(!deadline.is_expired());
    }
}
