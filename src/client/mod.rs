//! HTTP clients for talking to other fleet processes
//!
//! Each client implements the same trait the in-process component does, so
//! a zone can be wired with real sockets or entirely in memory.
//!
//! Every call carries the caller's remaining deadline in `x-deadline-ms`
//! and is cut off locally when it expires. Peer error envelopes are decoded
//! back into [`Error`] so `wrong_leaf` and `invalid_input` survive a hop.

pub mod assigner;
pub mod config_service;
pub mod index;
pub mod leaf;
pub mod mixer;

pub use assigner::RangeAssignerClient;
pub use config_service::{ConfigEntry, ConfigServiceClient};
pub use index::ZoneIndexClient;
pub use leaf::HttpLeafClient;
pub use mixer::{RootMixerClient, ZoneMixerClient};

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{Deadline, DEADLINE_HEADER};
use crate::error::{Error, ErrorBody, Result};

/// Deadline used by background calls that have no caller
pub const BACKGROUND_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin JSON-over-HTTP wrapper shared by every client
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Prefix `http://` when an address has no scheme
    pub fn base_url(address: &str) -> String {
        let trimmed = address.trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        }
    }

    pub async fn get_json<R>(&self, url: &str, deadline: &Deadline) -> Result<R>
    where
        R: DeserializeOwned,
    {
        self.send(self.client.get(url), url, deadline).await
    }

    pub async fn post_json<B, R>(&self, url: &str, body: &B, deadline: &Deadline) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send(self.client.post(url).json(body), url, deadline)
            .await
    }

    /// POST and ignore the response body
    pub async fn post_unit<B>(&self, url: &str, body: &B, deadline: &Deadline) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        let request = self.client.post(url).json(body);
        self.execute(request, url, deadline).await.map(|_| ())
    }

    /// GET that maps 404 to `None`
    pub async fn get_optional<R>(&self, url: &str, deadline: &Deadline) -> Result<Option<R>>
    where
        R: DeserializeOwned,
    {
        match self.get_json(url, deadline).await {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn send<R>(&self, request: RequestBuilder, url: &str, deadline: &Deadline) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let response = self.execute(request, url, deadline).await?;
        deadline
            .run(url, async { response.json::<R>().await.map_err(Error::from) })
            .await
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        url: &str,
        deadline: &Deadline,
    ) -> Result<Response> {
        if deadline.is_expired() {
            return Err(Error::Timeout(format!("no time left to call {url}")));
        }
        let request = request
            .header(DEADLINE_HEADER, deadline.header_value())
            .timeout(deadline.remaining());
        let response = deadline
            .run(url, async { request.send().await.map_err(Error::from) })
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.bytes().await.ok();
        let envelope = body
            .as_deref()
            .and_then(|b| serde_json::from_slice::<ErrorBody>(b).ok());
        let err = Error::from_wire(status.as_u16(), envelope);
        tracing::debug!(url, status = status.as_u16(), error = %err, "Peer returned an error");
        Err(err)
    }
}
