//! Zone index server routes (`/zis/*`)

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    routing::{get, post},
    Json, Router,
};

use super::{ack, finish, parse_json, Ack, ComponentState, ServerContext};
use crate::error::Result;
use crate::index::{FieldHintsIndex, ForgetLeaf, HintBatch, IndexStats};
use crate::trigram::Fingerprint;
use crate::types::LeafId;

pub struct IndexState {
    pub context: ServerContext,
    pub index: Arc<FieldHintsIndex>,
}

impl ComponentState for IndexState {
    fn context(&self) -> &ServerContext {
        &self.context
    }

    fn stats(&self) -> Vec<(&'static str, f64)> {
        let stats = self.index.stats();
        vec![
            ("fingerprints", stats.fingerprints as f64),
            ("postings", stats.postings as f64),
            ("leaves", stats.leaves as f64),
            ("forgotten", stats.forgotten as f64),
        ]
    }
}

async fn register_hints(State(state): State<Arc<IndexState>>, body: Bytes) -> Result<Json<Ack>> {
    let batch: HintBatch = parse_json(&body)?;
    state.index.register(&batch);
    Ok(ack())
}

async fn query_hints(
    State(state): State<Arc<IndexState>>,
    body: Bytes,
) -> Result<Json<BTreeSet<LeafId>>> {
    let fingerprints: BTreeSet<Fingerprint> = parse_json(&body)?;
    Ok(Json(state.index.query(&fingerprints)))
}

async fn forget_leaf(State(state): State<Arc<IndexState>>, body: Bytes) -> Result<Json<Ack>> {
    let ForgetLeaf { leaf_id } = parse_json(&body)?;
    state.index.forget(leaf_id);
    Ok(ack())
}

async fn stats(State(state): State<Arc<IndexState>>) -> Json<IndexStats> {
    Json(state.index.stats())
}

pub fn router(state: Arc<IndexState>) -> Router {
    let routes = Router::new()
        .route("/zis/registerHints", post(register_hints))
        .route("/zis/queryHints", post(query_hints))
        .route("/zis/forgetLeaf", post(forget_leaf))
        .route("/zis/stats", get(stats));
    finish(routes, state)
}
