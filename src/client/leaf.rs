//! Leaf client addressing leaves by their registered address

use async_trait::async_trait;

use super::HttpClient;
use crate::context::Deadline;
use crate::error::Result;
use crate::leaf::{LeafClient, WriteAck};
use crate::query::{LeafQuery, SeriesPoints};
use crate::types::TimeSeries;

pub struct HttpLeafClient {
    http: HttpClient,
}

impl HttpLeafClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: HttpClient::new()?,
        })
    }
}

#[async_trait]
impl LeafClient for HttpLeafClient {
    async fn write(&self, address: &str, series: &TimeSeries, deadline: &Deadline) -> Result<WriteAck> {
        let url = format!("{}/leaf/write", HttpClient::base_url(address));
        self.http.post_json(&url, series, deadline).await
    }

    async fn query(
        &self,
        address: &str,
        query: &LeafQuery,
        deadline: &Deadline,
    ) -> Result<Vec<SeriesPoints>> {
        let url = format!("{}/leaf/query", HttpClient::base_url(address));
        self.http.post_json(&url, query, deadline).await
    }
}
