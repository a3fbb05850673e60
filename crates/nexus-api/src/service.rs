//! REST client for the session service

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result, error_detail};

/// A persisted conversation as listed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub title: String,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub file_id: Option<i64>,
}

/// One recorded tool step of a persisted model message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredStep {
    #[serde(default, deserialize_with = "null_default")]
    pub tool: String,
    #[serde(default, deserialize_with = "null_default")]
    pub status: String,
    /// Query text the tool was called with, if any
    #[serde(default, deserialize_with = "opt_text")]
    pub input: Option<String>,
    /// Tool output, truncated server-side
    #[serde(default, deserialize_with = "opt_text")]
    pub output: Option<String>,
}

/// A persisted message as returned by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub role: String,
    #[serde(default, deserialize_with = "null_default")]
    pub content: String,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub steps: Vec<StoredStep>,
    /// Stored visualization configuration (a single config or a list)
    #[serde(default)]
    pub viz_config: Option<serde_json::Value>,
}

/// The session service collaborator
#[async_trait]
pub trait SessionService: Send + Sync {
    /// List the user's sessions, most recently updated first
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;

    /// Create a session bound to an uploaded file
    async fn create_session(&self, file_id: i64, title: &str) -> Result<SessionSummary>;

    /// Delete a session
    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Fetch a session's persisted messages in chronological order
    async fn fetch_messages(&self, id: &str) -> Result<Vec<StoredMessage>>;
}

/// HTTP implementation of [`SessionService`]
#[derive(Clone)]
pub struct HttpSessionService {
    client: reqwest::Client,
    server_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    file_id: i64,
    title: &'a str,
}

#[derive(Deserialize)]
struct CreatedSession {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default, deserialize_with = "null_default")]
    title: String,
}

impl HttpSessionService {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), server_url)
    }

    pub fn with_client(client: reqwest::Client, server_url: impl Into<String>) -> Self {
        Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Attach a bearer token to every request
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chat/sessions{}", self.server_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::status(status.as_u16(), error_detail(&text)));
        }
        Ok(response)
    }
}

#[async_trait]
impl SessionService for HttpSessionService {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let response = self.send(self.client.get(self.url(""))).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn create_session(&self, file_id: i64, title: &str) -> Result<SessionSummary> {
        let body = CreateSessionBody { file_id, title };
        let response = self.send(self.client.post(self.url("")).json(&body)).await?;
        let created: CreatedSession = serde_json::from_str(&response.text().await?)?;
        tracing::debug!("Created session {} for file {}", created.id, file_id);
        Ok(SessionSummary {
            id: created.id,
            title: created.title,
            updated_at: chrono::Utc::now().timestamp_millis(),
            file_id: Some(file_id),
        })
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/{}", id))))
            .await?;
        Ok(())
    }

    async fn fetch_messages(&self, id: &str) -> Result<Vec<StoredMessage>> {
        let response = self
            .send(self.client.get(self.url(&format!("/{}/messages", id))))
            .await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Accept ids as strings or numbers
fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Treat an explicit `null` like a missing field
fn null_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Text field that may be stored as a string, `null` or any JSON value
fn opt_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
