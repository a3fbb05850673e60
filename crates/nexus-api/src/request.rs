//! Request payloads for the streaming endpoints

use serde::{Deserialize, Serialize};

/// Reference to the data the agent analyses, as issued by the upload or
/// connection service. Opaque to this client beyond its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DataSourceRef {
    /// An uploaded file (converted to SQLite server-side)
    File(i64),
    /// A saved external database connection
    Connection(i64),
}

impl DataSourceRef {
    pub fn file_id(&self) -> Option<i64> {
        match self {
            DataSourceRef::File(id) => Some(*id),
            DataSourceRef::Connection(_) => None,
        }
    }

    pub fn connection_id(&self) -> Option<i64> {
        match self {
            DataSourceRef::Connection(id) => Some(*id),
            DataSourceRef::File(_) => None,
        }
    }
}

impl std::fmt::Display for DataSourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSourceRef::File(id) => write!(f, "file #{}", id),
            DataSourceRef::Connection(id) => write!(f, "connection #{}", id),
        }
    }
}

/// Per-request model settings forwarded to the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Immutable capability set for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Retrieval-augmented context from the knowledge base
    #[serde(rename = "use_rag")]
    pub retrieval: bool,
    /// Long-term user memory
    #[serde(rename = "use_memory")]
    pub memory: bool,
    /// Run generated SQL without asking the user first
    #[serde(rename = "allow_auto_execute")]
    pub auto_execute: bool,
    /// Enhanced multi-candidate SQL generation
    #[serde(rename = "use_sql_expert")]
    pub enhanced_generation: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            retrieval: false,
            memory: false,
            auto_execute: true,
            enhanced_generation: false,
        }
    }
}

/// One prior message sent as conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// Body of an agent turn request
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub session_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<i64>,
    pub history: Vec<HistoryEntry>,
    #[serde(flatten)]
    pub model: ModelOverrides,
    #[serde(rename = "max_tool_rounds")]
    pub tool_round_budget: u32,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

impl AgentRequest {
    /// Create a request with no history and default capabilities
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            file_id: None,
            connection_id: None,
            history: Vec::new(),
            model: ModelOverrides::default(),
            tool_round_budget: 12,
            capabilities: Capabilities::default(),
        }
    }

    /// Bind the data source this turn runs against
    pub fn with_data_source(mut self, source: Option<DataSourceRef>) -> Self {
        self.file_id = source.and_then(|s| s.file_id());
        self.connection_id = source.and_then(|s| s.connection_id());
        self
    }
}

/// Body of an approval-resume request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub session_id: String,
    /// Message that is paused in `pending_approval`
    pub message_id: String,
    /// The query to run, verbatim as approved (possibly edited)
    #[serde(rename = "sql")]
    pub approved_query_text: String,
    #[serde(flatten)]
    pub model: ModelOverrides,
}

/// Body of a data-source summary request
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRequest {
    pub file_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub model: ModelOverrides,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_request_wire_shape() {
        let mut req = AgentRequest::new("s1", "top customers")
            .with_data_source(Some(DataSourceRef::File(7)));
        req.model.model = Some("gpt-4o".into());
        req.capabilities.auto_execute = false;
        req.history.push(HistoryEntry {
            role: "user".into(),
            content: "hi".into(),
        });

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "session_id": "s1",
                "message": "top customers",
                "file_id": 7,
                "history": [{"role": "user", "content": "hi"}],
                "model": "gpt-4o",
                "max_tool_rounds": 12,
                "use_rag": false,
                "use_memory": false,
                "allow_auto_execute": false,
                "use_sql_expert": false
            })
        );
    }

    #[test]
    fn test_connection_source_sets_connection_id() {
        let req = AgentRequest::new("s1", "q").with_data_source(Some(DataSourceRef::Connection(3)));
        assert_eq!(req.file_id, None);
        assert_eq!(req.connection_id, Some(3));
    }

    #[test]
    fn test_approval_request_wire_shape() {
        let req = ApprovalRequest {
            session_id: "s1".into(),
            message_id: "m2".into(),
            approved_query_text: "SELECT 2".into(),
            model: ModelOverrides::default(),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"session_id": "s1", "message_id": "m2", "sql": "SELECT 2"})
        );
    }

    #[test]
    fn test_capabilities_default_allows_auto_execute() {
        let caps = Capabilities::default();
        assert!(caps.auto_execute);
    }
}
