//! Log broker reached over HTTP
//!
//! ```text
//!   POST {base}/topics/{topic}/records          {"records": [...]} → {"appended": n}
//!   GET  {base}/topics/{topic}/records?start=&end=                 → {"records": [...]}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LogBroker, LogRecord};
use crate::client::{HttpClient, BACKGROUND_CALL_TIMEOUT};
use crate::context::Deadline;
use crate::error::Result;
use crate::range::KeyRange;

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendRequest {
    pub records: Vec<LogRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub appended: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub records: Vec<LogRecord>,
}

/// HTTP log broker client
pub struct RestBroker {
    http: HttpClient,
    base: String,
}

impl RestBroker {
    pub fn new(base: &str) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new()?,
            base: HttpClient::base_url(base),
        })
    }

    fn records_url(&self, topic: &str) -> String {
        format!("{}/topics/{}/records", self.base, topic)
    }
}

#[async_trait]
impl LogBroker for RestBroker {
    async fn append(&self, topic: &str, records: Vec<LogRecord>) -> Result<usize> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        let response: AppendResponse = self
            .http
            .post_json(&self.records_url(topic), &AppendRequest { records }, &deadline)
            .await?;
        Ok(response.appended)
    }

    async fn read(&self, topic: &str, range: &KeyRange) -> Result<Vec<LogRecord>> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        let url = format!(
            "{}?start={}&end={}",
            self.records_url(topic),
            hex::encode(&range.start),
            hex::encode(&range.end)
        );
        let response: ReadResponse = self.http.get_json(&url, &deadline).await?;
        Ok(response.records)
    }
}
