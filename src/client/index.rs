//! Zone index client

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{HttpClient, BACKGROUND_CALL_TIMEOUT};
use crate::context::Deadline;
use crate::error::Result;
use crate::index::{ForgetLeaf, HintBatch, HintsIndex, IndexStats};
use crate::trigram::Fingerprint;
use crate::types::LeafId;

pub struct ZoneIndexClient {
    http: HttpClient,
    base: String,
}

impl ZoneIndexClient {
    pub fn new(base: &str) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new()?,
            base: HttpClient::base_url(base),
        })
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        self.http
            .get_json(&format!("{}/zis/stats", self.base), &deadline)
            .await
    }
}

#[async_trait]
impl HintsIndex for ZoneIndexClient {
    async fn register_hints(&self, hints: HintBatch) -> Result<()> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        self.http
            .post_unit(&format!("{}/zis/registerHints", self.base), &hints, &deadline)
            .await
    }

    async fn query_hints(&self, fingerprints: &BTreeSet<Fingerprint>) -> Result<BTreeSet<LeafId>> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        self.http
            .post_json(&format!("{}/zis/queryHints", self.base), fingerprints, &deadline)
            .await
    }

    async fn forget_leaf(&self, leaf: LeafId) -> Result<()> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        self.http
            .post_unit(
                &format!("{}/zis/forgetLeaf", self.base),
                &ForgetLeaf { leaf_id: leaf },
                &deadline,
            )
            .await
    }
}
