//! Conversation data model

use nexus_api::DataSourceRef;
use serde::{Deserialize, Serialize};

use crate::placeholder::THINKING_PLACEHOLDER;
use crate::util::now_millis;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

impl Role {
    /// Role name as sent in request history
    pub fn history_name(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "assistant",
        }
    }
}

/// Lifecycle of a model message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Thinking,
    Executing,
    PendingApproval,
    Executed,
    Error,
}

impl MessageStatus {
    /// `executed` or `error`
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Executed | MessageStatus::Error)
    }

    /// A stream is expected to still be writing to the message
    pub fn is_in_flight(self) -> bool {
        matches!(self, MessageStatus::Thinking | MessageStatus::Executing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Thinking => "thinking",
            MessageStatus::Executing => "executing",
            MessageStatus::PendingApproval => "pending_approval",
            MessageStatus::Executed => "executed",
            MessageStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a visualization should be shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    Table,
    Chart,
}

/// A chart or table artifact attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Raw chart type proposed by the agent (`bar`, `line`, `pie`, `table`, ...)
    pub chart_type_suggestion: String,
    pub display_type: DisplayType,
    pub title: Option<String>,
}

/// One message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Text with inline placeholder tokens
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub status: MessageStatus,
    /// The single query artifact of the turn
    pub sql_query: Option<String>,
    /// Artifacts for the chart placeholders, in content order
    pub execution_results: Vec<VisualizationResult>,
    pub error: Option<String>,
}

impl Message {
    /// A user's turn
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            timestamp: now_millis(),
            status: MessageStatus::Executed,
            sql_query: None,
            execution_results: Vec::new(),
            error: None,
        }
    }

    /// A fresh model message showing the transient placeholder
    pub fn model_placeholder() -> Self {
        Self::model_with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Like [`Message::model_placeholder`], with a caller-chosen id
    pub fn model_with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Model,
            content: THINKING_PLACEHOLDER.to_string(),
            timestamp: now_millis(),
            status: MessageStatus::Thinking,
            sql_query: None,
            execution_results: Vec::new(),
            error: None,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

/// A conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    /// Milliseconds since the Unix epoch
    pub updated_at: i64,
    pub data_source: Option<DataSourceRef>,
}

impl Session {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            messages: Vec::new(),
            updated_at: now_millis(),
            data_source: None,
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}
