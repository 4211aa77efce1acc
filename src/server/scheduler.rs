//! Standing-query scheduler routes (`/sqs/standing/*`)

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    routing::{get, post},
    Json, Router,
};

use super::{ack, finish, parse_json, Ack, ComponentState, ServerContext};
use crate::error::Result;
use crate::scheduler::{
    RegisterStanding, RegisteredStanding, RemoveStanding, StandingQueryInfo,
    StandingQueryScheduler,
};

pub struct SchedulerState {
    pub context: ServerContext,
    pub scheduler: Arc<StandingQueryScheduler>,
}

impl ComponentState for SchedulerState {
    fn context(&self) -> &ServerContext {
        &self.context
    }

    fn stats(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("standing_queries", self.scheduler.list().len() as f64),
            ("issuances", self.scheduler.issued_total() as f64),
        ]
    }
}

async fn register(
    State(state): State<Arc<SchedulerState>>,
    body: Bytes,
) -> Result<Json<RegisteredStanding>> {
    let request: RegisterStanding = parse_json(&body)?;
    let query_id = state.scheduler.register(request.query, request.period_ms)?;
    Ok(Json(RegisteredStanding { query_id }))
}

async fn remove(State(state): State<Arc<SchedulerState>>, body: Bytes) -> Result<Json<Ack>> {
    let request: RemoveStanding = parse_json(&body)?;
    state.scheduler.remove(&request.query_id)?;
    Ok(ack())
}

async fn list(State(state): State<Arc<SchedulerState>>) -> Json<Vec<StandingQueryInfo>> {
    Json(state.scheduler.list())
}

pub fn router(state: Arc<SchedulerState>) -> Router {
    let routes = Router::new()
        .route("/sqs/standing/register", post(register))
        .route("/sqs/standing/remove", post(remove))
        .route("/sqs/standing/list", get(list));
    finish(routes, state)
}
