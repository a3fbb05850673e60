//! Rebuilding message state from persisted history
//!
//! The backend stores a turn's narrative text with no artifact tokens in it,
//! plus the ordered tool steps and the last visualization config. Hydration
//! replays that record through a `TurnReducer`, so a reloaded message gets
//! the same heading, result lines and tokens the live stream produced. Where
//! text fell between steps is not stored; the narrative is replayed ahead of
//! the steps. Content that already carries tokens only has missing ones
//! restored.

use nexus_api::{
    Capabilities, StoredMessage, StoredStep, StreamEvent, ToolCallStatus, ToolResultStatus,
};
use serde_json::{Value, json};

use crate::{
    message::{Message, MessageStatus, Role, VisualizationResult},
    placeholder::{
        count_chart_placeholders, count_sql_placeholders, ensure_chart_placeholders,
        ensure_sql_placeholder, sweep_running_markers,
    },
    reducer::TurnReducer,
    viz::{VISUALIZATION_TOOL, carries_query, parse_visualization_payload, results_from_stored},
};

/// Prefix the backend writes into persisted failures
pub const PERSISTED_ERROR_PREFIX: &str = "Error occurred:";

/// Opening of an agent error the backend appends to the narrative
const INLINE_ERROR_OPEN: &str = "[Error: ";

const PENDING_APPROVAL_STEP: &str = "pending_approval";
const SUCCESS_STEP: &str = "success";
const ERROR_STEP: &str = "error";
const STARTED_STEP: &str = "start";

/// Rebuild one message
pub fn hydrate_message(stored: &StoredMessage) -> Message {
    if stored.role == "user" {
        return Message {
            id: stored.id.clone(),
            role: Role::User,
            content: stored.content.clone(),
            timestamp: stored.timestamp,
            status: MessageStatus::Executed,
            sql_query: None,
            execution_results: Vec::new(),
            error: None,
        };
    }

    let tokenized = count_sql_placeholders(&stored.content) > 0
        || count_chart_placeholders(&stored.content) > 0;
    let mut msg = if tokenized || stored.content.trim_start().starts_with(PERSISTED_ERROR_PREFIX) {
        restore_tokens(stored)
    } else {
        replay(stored)
    };
    msg.timestamp = stored.timestamp;
    msg
}

/// Rebuild a session's message list
pub fn hydrate_messages(stored: &[StoredMessage]) -> Vec<Message> {
    stored.iter().map(hydrate_message).collect()
}

/// Feed the stored record to a fresh reducer as the events that produced it
fn replay(stored: &StoredMessage) -> Message {
    let (text, failure) = split_inline_error(&stored.content);
    let last_viz = stored
        .steps
        .iter()
        .rposition(|s| s.tool == VISUALIZATION_TOOL && s.status == SUCCESS_STEP);

    let mut events = Vec::with_capacity(stored.steps.len() * 2 + 3);
    if !text.is_empty() {
        events.push(StreamEvent::text(text));
    }
    for (i, step) in stored.steps.iter().enumerate() {
        let query = step_query(step);
        if step.status == PENDING_APPROVAL_STEP {
            events.push(StreamEvent::tool_call(
                &step.tool,
                ToolCallStatus::PendingApproval,
                query.as_deref(),
            ));
            continue;
        }
        events.push(StreamEvent::tool_call(
            &step.tool,
            ToolCallStatus::Executing,
            query.as_deref(),
        ));

        let status = match step.status.as_str() {
            STARTED_STEP => continue,
            SUCCESS_STEP => ToolResultStatus::Success,
            ERROR_STEP => ToolResultStatus::Error,
            _ => ToolResultStatus::Unknown,
        };
        let output = step.output.clone().unwrap_or_default();
        // stored step outputs are truncated; the config is kept whole
        let output = match &stored.viz_config {
            Some(config)
                if last_viz == Some(i)
                    && !config.is_null()
                    && parse_visualization_payload(&output).is_none() =>
            {
                stored_payload(config)
            }
            _ => output,
        };
        events.push(StreamEvent::tool_result(&step.tool, output, status));
    }
    if let Some(failure) = failure {
        events.push(StreamEvent::error(failure));
    }
    events.push(StreamEvent::Done);

    let mut msg = Message::model_with_id(stored.id.clone());
    let capabilities = Capabilities {
        auto_execute: false,
        ..Capabilities::default()
    };
    TurnReducer::new(capabilities).apply_all(&mut msg, &events);

    if msg.execution_results.is_empty() {
        let results = stored_results(stored);
        ensure_chart_placeholders(&mut msg.content, results.len());
        msg.execution_results = results;
    }
    msg
}

/// Keep tokenized content as is and add any tokens it lacks
fn restore_tokens(stored: &StoredMessage) -> Message {
    let mut msg = Message {
        id: stored.id.clone(),
        role: Role::Model,
        content: stored.content.clone(),
        timestamp: stored.timestamp,
        status: MessageStatus::Executed,
        sql_query: None,
        execution_results: Vec::new(),
        error: None,
    };
    sweep_running_markers(&mut msg.content);

    let pending = stored
        .steps
        .iter()
        .rev()
        .find(|s| s.status == PENDING_APPROVAL_STEP);

    msg.sql_query = match pending {
        Some(step) => step_query(step),
        None => stored
            .steps
            .iter()
            .rev()
            .filter(|s| carries_query(&s.tool))
            .find_map(step_query),
    };

    msg.execution_results = stored_results(stored);

    if msg.sql_query.is_some() {
        ensure_sql_placeholder(&mut msg.content);
    }
    ensure_chart_placeholders(&mut msg.content, msg.execution_results.len());

    if pending.is_some() {
        msg.status = MessageStatus::PendingApproval;
    } else if stored.content.trim_start().starts_with(PERSISTED_ERROR_PREFIX) {
        msg.status = MessageStatus::Error;
        msg.error = Some(stored.content.trim().to_string());
    } else if let (_, Some(failure)) = split_inline_error(&stored.content) {
        msg.status = MessageStatus::Error;
        msg.error = Some(failure.to_string());
    }
    msg
}

/// Split off the first `[Error: ..]` the backend appended to the narrative.
///
/// The stream ended at that error, so anything after it is dropped.
fn split_inline_error(content: &str) -> (&str, Option<&str>) {
    let start = if content.starts_with(INLINE_ERROR_OPEN) {
        Some(0)
    } else {
        content
            .find(&format!("\n{}", INLINE_ERROR_OPEN))
            .map(|i| i + 1)
    };
    let Some(start) = start else {
        return (content, None);
    };

    let rest = &content[start + INLINE_ERROR_OPEN.len()..];
    let message = match rest.find("]\n") {
        Some(end) => &rest[..end],
        None => {
            let rest = rest.trim_end();
            rest.strip_suffix(']').unwrap_or(rest)
        }
    };
    (&content[..start.saturating_sub(1)], Some(message))
}

fn step_query(step: &StoredStep) -> Option<String> {
    step.input
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
}

/// The stored config as a visualization tool result
fn stored_payload(config: &Value) -> String {
    match config {
        Value::String(s) => s.clone(),
        Value::Object(map)
            if map.get("type").and_then(Value::as_str) == Some("visualization_config") =>
        {
            config.to_string()
        }
        other => json!({"type": "visualization_config", "config": other}).to_string(),
    }
}

/// Artifacts from the stored config, or failing that from the
/// visualization tool's recorded outputs.
fn stored_results(stored: &StoredMessage) -> Vec<VisualizationResult> {
    if let Some(config) = &stored.viz_config {
        let results = results_from_stored(config);
        if !results.is_empty() {
            return results;
        }
    }
    stored
        .steps
        .iter()
        .filter(|s| s.tool == VISUALIZATION_TOOL && s.status == SUCCESS_STEP)
        .filter_map(|s| s.output.as_deref())
        .filter_map(parse_visualization_payload)
        .flatten()
        .collect()
}
