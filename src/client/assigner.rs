//! Range assigner client

use async_trait::async_trait;

use super::{HttpClient, BACKGROUND_CALL_TIMEOUT};
use crate::context::Deadline;
use crate::error::Result;
use crate::index::ForgetLeaf;
use crate::range::{
    AssignmentDelta, AssignmentSource, Heartbeat, HeartbeatReply, HeartbeatStatus, LeafInfo,
    LeafRegistration,
};
use crate::types::LeafId;

pub struct RangeAssignerClient {
    http: HttpClient,
    base: String,
}

impl RangeAssignerClient {
    pub fn new(base: &str) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new()?,
            base: HttpClient::base_url(base),
        })
    }

    pub async fn leaves(&self) -> Result<Vec<LeafInfo>> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        self.http
            .get_json(&format!("{}/ra/leaves", self.base), &deadline)
            .await
    }
}

#[async_trait]
impl AssignmentSource for RangeAssignerClient {
    async fn register_leaf(&self, address: &str) -> Result<LeafRegistration> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        self.http
            .post_json(&format!("{}/ra/registerLeaf", self.base), address, &deadline)
            .await
    }

    async fn deregister_leaf(&self, leaf: LeafId) -> Result<()> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        self.http
            .post_unit(
                &format!("{}/ra/deregisterLeaf", self.base),
                &ForgetLeaf { leaf_id: leaf },
                &deadline,
            )
            .await
    }

    async fn heartbeat(&self, leaf: LeafId, generation: u64) -> Result<HeartbeatStatus> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        let reply: HeartbeatReply = self
            .http
            .post_json(
                &format!("{}/ra/heartbeat", self.base),
                &Heartbeat {
                    leaf_id: leaf,
                    generation,
                },
                &deadline,
            )
            .await?;
        Ok(reply.status)
    }

    async fn get_assignments(&self, since: Option<u64>) -> Result<AssignmentDelta> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        let url = match since {
            Some(v) => format!("{}/ra/assignments?since={v}", self.base),
            None => format!("{}/ra/assignments", self.base),
        };
        self.http.get_json(&url, &deadline).await
    }
}
