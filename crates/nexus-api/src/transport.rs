//! Streaming transport for agent, approval and summary requests

use std::{pin::Pin, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result, error_detail},
    frame::{Frame, FrameDecoder},
};

/// Retry configuration for opening a stream
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Streaming endpoints exposed by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A new agent turn
    AgentStream,
    /// Resume a turn paused for approval
    Approve,
    /// Narrative summary of an uploaded file
    Summary,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::AgentStream => "/api/chat/agent/stream",
            Endpoint::Approve => "/api/chat/agent/approve",
            Endpoint::Summary => "/api/chat/summary/stream",
        }
    }
}

/// What a transport delivers to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One frame payload, not yet decoded
    Frame(String),
    /// The stream ended normally (sentinel or end of body)
    Complete,
    /// The stream failed; nothing follows
    Failed(String),
}

/// A stream of transport events.
///
/// Yields zero or more `Frame`s followed by exactly one `Complete` or
/// `Failed`, unless cancelled, in which case it just ends.
pub type TransportStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Opens cancellable streams against the backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a streaming request
    async fn open(
        &self,
        endpoint: Endpoint,
        body: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<TransportStream>;
}

/// Check that a server URL is an absolute http(s) URL
pub fn validate_server_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    match rest {
        Some(host) if !host.trim_matches('/').is_empty() => Ok(()),
        _ => Err(Error::InvalidConfig(format!(
            "server URL must start with http:// or https://, got {:?}",
            url
        ))),
    }
}

/// HTTP transport over `reqwest`
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    server_url: String,
    token: Option<String>,
    retry_config: RetryConfig,
}

impl HttpTransport {
    /// Create a transport for the given server
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), server_url)
    }

    /// Create a transport reusing an existing client
    pub fn with_client(client: reqwest::Client, server_url: impl Into<String>) -> Self {
        Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: None,
            retry_config: RetryConfig::default(),
        }
    }

    /// Attach a bearer token to every request
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Full URL for an endpoint
    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.server_url, endpoint.path())
    }
}

async fn send_request(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    body: &serde_json::Value,
) -> Result<reqwest::Response> {
    let mut request = client
        .post(url)
        .header("accept", "text/event-stream")
        .json(body);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::status(status.as_u16(), error_detail(&text)));
    }
    Ok(response)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        endpoint: Endpoint,
        body: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<TransportStream> {
        let client = self.client.clone();
        let url = self.url(endpoint);
        let token = self.token.clone();
        let retry_config = self.retry_config.clone();

        tracing::debug!("Opening stream: POST {}", url);

        let event_stream: TransportStream = Box::pin(stream! {
            // Retry loop; only reached before any frame was delivered
            let mut attempt = 0u32;
            let response = loop {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = send_request(&client, &url, token.as_deref(), &body) => Some(result),
                };
                let Some(sent) = sent else {
                    return;
                };

                match sent {
                    Ok(response) => break response,
                    Err(e) => {
                        if attempt < retry_config.max_retries && e.is_retryable() {
                            let delay = retry_config.delay_for_attempt(attempt);
                            tracing::warn!(
                                "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                                attempt + 1,
                                retry_config.max_retries + 1,
                                e,
                                delay
                            );
                            attempt += 1;
                            let slept = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => false,
                                _ = tokio::time::sleep(delay) => true,
                            };
                            if !slept {
                                return;
                            }
                            continue;
                        }

                        yield TransportEvent::Failed(e.to_string());
                        return;
                    }
                }
            };

            let mut body_stream = response.bytes_stream();
            let mut decoder = FrameDecoder::new();
            let mut received_any = false;

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    chunk = body_stream.next() => Some(chunk),
                };
                let Some(chunk) = chunk else {
                    return;
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        received_any |= !bytes.is_empty();
                        for frame in decoder.push(&bytes) {
                            if cancel.is_cancelled() {
                                return;
                            }
                            match frame {
                                Frame::Data(payload) => yield TransportEvent::Frame(payload),
                                Frame::Done => {
                                    yield TransportEvent::Complete;
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        yield TransportEvent::Failed(Error::from(e).to_string());
                        return;
                    }
                    None => break,
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            if !received_any {
                yield TransportEvent::Failed(Error::MissingBody.to_string());
                return;
            }
            if let Some(Frame::Data(payload)) = decoder.finish() {
                yield TransportEvent::Frame(payload);
            }
            yield TransportEvent::Complete;
        });

        Ok(event_stream)
    }
}
