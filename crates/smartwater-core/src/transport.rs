use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

use crate::config::{ChannelConfig, Credentials, Endpoints};
use crate::feed::FeedResponse;

const MAX_MESSAGE_LEN: usize = 240;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("http {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn fetch_feed(
        &self,
        credentials: &Credentials,
        results: u32,
    ) -> Result<FeedResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoints: Endpoints,
}

impl HttpTransport {
    pub fn new(endpoints: Endpoints, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Other(format!("failed to build http client: {err}")))?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// The upstream body exactly as served, for callers that pass it through.
    pub async fn fetch_raw_channel(
        &self,
        channel: &ChannelConfig,
        results: u32,
    ) -> Result<serde_json::Value, TransportError> {
        let url = channel_feed_url(&self.endpoints.thingspeak_url, &channel.channel_id)?;
        debug!(channel_id = %channel.channel_id, results, "fetching upstream feed");
        let request = self.client.get(url).query(&[
            ("api_key", channel.read_key.as_str()),
            ("results", results.to_string().as_str()),
        ]);
        self.get_json(request).await
    }

    async fn fetch_via_backend(&self, token: &str) -> Result<serde_json::Value, TransportError> {
        let url = join_url(&self.endpoints.backend_url, &["data", "readings"])?;
        debug!(%url, "fetching readings through backend");
        let request = self.client.get(url).bearer_auth(token);
        self.get_json(request).await
    }

    async fn get_json(&self, request: RequestBuilder) -> Result<serde_json::Value, TransportError> {
        let response = request.send().await.map_err(map_request_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_request_error)?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: status_message(status, &body),
            });
        }

        serde_json::from_str(&body).map_err(|err| TransportError::Decode(err.to_string()))
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn fetch_feed(
        &self,
        credentials: &Credentials,
        results: u32,
    ) -> Result<FeedResponse, TransportError> {
        let raw = match credentials {
            Credentials::Channel(channel) => self.fetch_raw_channel(channel, results).await?,
            Credentials::Session { token } => self.fetch_via_backend(token).await?,
        };
        decode_feed(raw)
    }
}

/// A body without a `feeds` array is a decode failure, not an empty channel.
pub fn decode_feed(raw: serde_json::Value) -> Result<FeedResponse, TransportError> {
    serde_json::from_value(raw).map_err(|err| TransportError::Decode(err.to_string()))
}

pub(crate) fn channel_feed_url(base: &str, channel_id: &str) -> Result<Url, TransportError> {
    join_url(base, &["channels", channel_id.trim(), "feeds.json"])
}

fn join_url(base: &str, segments: &[&str]) -> Result<Url, TransportError> {
    let mut url = Url::parse(base)
        .map_err(|err| TransportError::Other(format!("invalid base url {base}: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| TransportError::Other(format!("base url cannot carry a path: {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn map_request_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::Unreachable(err.to_string())
    } else if err.is_decode() || err.is_body() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

pub(crate) fn status_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("message").and_then(|v| v.as_str()) {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.chars().take(MAX_MESSAGE_LEN).collect();
    }

    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}
