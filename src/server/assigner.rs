//! Range assigner routes (`/ra/*`)

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::{ack, finish, parse_json, Ack, ComponentState, ServerContext};
use crate::error::{Error, Result};
use crate::index::ForgetLeaf;
use crate::range::{
    AssignmentDelta, Heartbeat, HeartbeatReply, LeafInfo, LeafRegistration, RangeAssigner,
};

pub struct AssignerState {
    pub context: ServerContext,
    pub assigner: Arc<RangeAssigner>,
}

impl ComponentState for AssignerState {
    fn context(&self) -> &ServerContext {
        &self.context
    }

    fn stats(&self) -> Vec<(&'static str, f64)> {
        let snapshot = self.assigner.snapshot();
        vec![
            ("snapshot_version", snapshot.version as f64),
            ("ranges", snapshot.assignments.len() as f64),
            ("leaves", self.assigner.leaves().len() as f64),
        ]
    }
}

#[derive(Debug, Deserialize)]
pub struct SinceParams {
    pub since: Option<u64>,
}

/// Registration body: a JSON string, or the bare address as text
fn parse_address(body: &Bytes) -> Result<String> {
    let address = match serde_json::from_slice::<String>(body) {
        Ok(address) => address,
        Err(_) => std::str::from_utf8(body)
            .map_err(|_| Error::InvalidInput("leaf address is not UTF-8".into()))?
            .to_string(),
    };
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::InvalidInput("leaf address cannot be empty".into()));
    }
    Ok(address.to_string())
}

async fn register_leaf(
    State(state): State<Arc<AssignerState>>,
    body: Bytes,
) -> Result<Json<LeafRegistration>> {
    let address = parse_address(&body)?;
    Ok(Json(state.assigner.register(&address).await?))
}

async fn deregister_leaf(
    State(state): State<Arc<AssignerState>>,
    body: Bytes,
) -> Result<Json<Ack>> {
    let ForgetLeaf { leaf_id } = parse_json(&body)?;
    state.assigner.deregister(leaf_id).await?;
    Ok(ack())
}

async fn heartbeat(
    State(state): State<Arc<AssignerState>>,
    body: Bytes,
) -> Result<Json<HeartbeatReply>> {
    let beat: Heartbeat = parse_json(&body)?;
    let status = state.assigner.record_heartbeat(beat.leaf_id, beat.generation);
    Ok(Json(HeartbeatReply { status }))
}

async fn assignments(
    State(state): State<Arc<AssignerState>>,
    Query(params): Query<SinceParams>,
) -> Json<AssignmentDelta> {
    Json(state.assigner.assignments_since(params.since))
}

async fn leaves(State(state): State<Arc<AssignerState>>) -> Json<Vec<LeafInfo>> {
    Json(state.assigner.leaves())
}

pub fn router(state: Arc<AssignerState>) -> Router {
    let routes = Router::new()
        .route("/ra/registerLeaf", post(register_leaf))
        .route("/ra/deregisterLeaf", post(deregister_leaf))
        .route("/ra/heartbeat", post(heartbeat))
        .route("/ra/assignments", get(assignments))
        .route("/ra/leaves", get(leaves));
    finish(routes, state)
}
