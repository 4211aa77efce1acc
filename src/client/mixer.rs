//! Mixer clients: a remote zone as seen by the root, and the root as
//! seen by the scheduler

use async_trait::async_trait;

use super::HttpClient;
use crate::context::Deadline;
use crate::error::Result;
use crate::mixer::ZoneClient;
use crate::query::{QueryNode, QueryResult};
use crate::scheduler::QueryIssuer;

pub struct ZoneMixerClient {
    http: HttpClient,
    url: String,
}

impl ZoneMixerClient {
    pub fn new(base: &str) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new()?,
            url: format!("{}/zm/query", HttpClient::base_url(base)),
        })
    }
}

#[async_trait]
impl ZoneClient for ZoneMixerClient {
    async fn query(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult> {
        self.http.post_json(&self.url, node, deadline).await
    }
}

pub struct RootMixerClient {
    http: HttpClient,
    url: String,
}

impl RootMixerClient {
    pub fn new(base: &str) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new()?,
            url: format!("{}/rm/query", HttpClient::base_url(base)),
        })
    }
}

#[async_trait]
impl QueryIssuer for RootMixerClient {
    async fn issue(&self, node: &QueryNode, deadline: &Deadline) -> Result<QueryResult> {
        self.http.post_json(&self.url, node, deadline).await
    }
}
