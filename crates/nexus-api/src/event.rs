//! Agent stream events and the frame payload decoder

use serde::{Deserialize, Deserializer, Serialize};

/// Status carried by a `tool_call` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Tool invocation started
    #[default]
    Start,
    /// Tool is running
    Executing,
    /// Turn paused until the user approves the generated query
    PendingApproval,
    /// Any status this client does not know; handled like `executing`
    #[serde(other)]
    Other,
}

/// Status carried by a `tool_result` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    #[default]
    Success,
    Error,
    #[serde(other)]
    Unknown,
}

impl ToolResultStatus {
    pub fn is_success(self) -> bool {
        self == ToolResultStatus::Success
    }
}

/// Events emitted by the agent over the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Narrative text
    Text { content: String },
    /// A tool invocation (query text present for the SQL tools)
    ToolCall {
        tool: String,
        #[serde(default)]
        status: ToolCallStatus,
        #[serde(
            default,
            rename = "sql_code",
            alias = "query",
            skip_serializing_if = "Option::is_none"
        )]
        query_text: Option<String>,
    },
    /// A tool finished; `result` is the tool's raw output text
    ToolResult {
        tool: String,
        #[serde(default, deserialize_with = "string_or_json")]
        result: String,
        #[serde(default)]
        status: ToolResultStatus,
    },
    /// The agent failed
    Error {
        #[serde(rename = "error", alias = "message")]
        message: String,
    },
    /// The agent finished this turn
    Done,
}

impl StreamEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }

    /// Create a text event
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Create an error event
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Create a tool call event
    pub fn tool_call(
        tool: impl Into<String>,
        status: ToolCallStatus,
        query_text: Option<&str>,
    ) -> Self {
        Self::ToolCall {
            tool: tool.into(),
            status,
            query_text: query_text.map(str::to_string),
        }
    }

    /// Create a tool result event
    pub fn tool_result(
        tool: impl Into<String>,
        result: impl Into<String>,
        status: ToolResultStatus,
    ) -> Self {
        Self::ToolResult {
            tool: tool.into(),
            result: result.into(),
            status,
        }
    }
}

/// Untyped frames written by the summary endpoint
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyFrame {
    Chunk { chunk: String },
    Error { error: String },
}

/// Decode one frame payload.
pub fn decode(payload: &str) -> Result<StreamEvent, serde_json::Error> {
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => Ok(event),
        Err(err) => match serde_json::from_str::<LegacyFrame>(payload) {
            Ok(LegacyFrame::Chunk { chunk }) => Ok(StreamEvent::Text { content: chunk }),
            Ok(LegacyFrame::Error { error }) => Ok(StreamEvent::Error { message: error }),
            Err(_) => Err(err),
        },
    }
}

/// Decode one frame payload, logging and dropping it if malformed.
///
/// One bad frame must not take the rest of the turn down with it.
pub fn decode_lenient(payload: &str) -> Option<StreamEvent> {
    match decode(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            let preview: String = payload.chars().take(120).collect();
            tracing::warn!("Skipping malformed frame ({}): {}", e, preview);
            None
        }
    }
}

fn string_or_json<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_text() {
        let ev = decode(r#"{"type":"text","content":"hello"}"#).unwrap();
        assert_eq!(ev, StreamEvent::text("hello"));
    }

    #[test]
    fn test_decode_pending_approval_tool_call() {
        let ev = decode(
            r#"{"type":"tool_call","tool":"sql_inter","status":"pending_approval","sql_code":"SELECT 1"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            StreamEvent::tool_call("sql_inter", ToolCallStatus::PendingApproval, Some("SELECT 1"))
        );
    }

    #[test]
    fn test_decode_tool_call_null_sql_code() {
        let ev = decode(
            r#"{"type":"tool_call","tool":"sql_inter","status":"pending_approval","sql_code":null}"#,
        )
        .unwrap();
        match ev {
            StreamEvent::ToolCall { query_text, .. } => assert!(query_text.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_tool_status() {
        let ev = decode(r#"{"type":"tool_call","tool":"python_inter","status":"warming_up"}"#)
            .unwrap();
        assert_eq!(
            ev,
            StreamEvent::tool_call("python_inter", ToolCallStatus::Other, None)
        );
    }

    #[test]
    fn test_decode_tool_result_string() {
        let ev = decode(
            r#"{"type":"tool_result","tool":"sql_inter","result":"{\"row_count\":2}","status":"success"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            StreamEvent::tool_result("sql_inter", r#"{"row_count":2}"#, ToolResultStatus::Success)
        );
    }

    #[test]
    fn test_decode_tool_result_json_value_is_reencoded() {
        let ev = decode(
            r#"{"type":"tool_result","tool":"sql_inter","result":{"columns":["a"],"rows":[[1]]},"status":"success"}"#,
        )
        .unwrap();
        match ev {
            StreamEvent::ToolResult { result, .. } => {
                assert_eq!(result, r#"{"columns":["a"],"rows":[[1]]}"#);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_field_and_alias() {
        assert_eq!(
            decode(r#"{"type":"error","error":"timeout"}"#).unwrap(),
            StreamEvent::error("timeout")
        );
        assert_eq!(
            decode(r#"{"type":"error","message":"timeout"}"#).unwrap(),
            StreamEvent::error("timeout")
        );
    }

    #[test]
    fn test_decode_done_ignores_extra_fields() {
        assert_eq!(
            decode(r#"{"type":"done","elapsed":3}"#).unwrap(),
            StreamEvent::Done
        );
    }

    #[test]
    fn test_decode_legacy_summary_frames() {
        assert_eq!(
            decode(r#"{"chunk":"The table has"}"#).unwrap(),
            StreamEvent::text("The table has")
        );
        assert_eq!(
            decode(r#"{"error":"File not found"}"#).unwrap(),
            StreamEvent::error("File not found")
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"type":"telepathy"}"#).is_err());
        assert!(decode(r#"{"type":"text"}"#).is_err());
    }

    #[test]
    fn test_decode_lenient_skips() {
        assert!(decode_lenient("{broken").is_none());
        assert!(decode_lenient(r#"{"type":"done"}"#).is_some());
    }

    #[test]
    fn test_is_terminal() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::error("x").is_terminal());
        assert!(!StreamEvent::text("x").is_terminal());
    }
}
