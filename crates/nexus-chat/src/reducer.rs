//! Folding stream events into message state
//!
//! One `TurnReducer` lives for exactly one stream. It is fed events in
//! arrival order and mutates the model message in place. The initial
//! placeholder is replaced by the first event that produces content, after
//! which content only grows. Reaching `executed` or `error` ends the stream's
//! say over the message; so does pausing at `pending_approval`, until the
//! approval gate hands the message to a new reducer in resume mode.

use std::collections::{HashMap, VecDeque};

use nexus_api::{Capabilities, StreamEvent, ToolCallStatus, ToolResultStatus};

use crate::{
    message::{Message, MessageStatus},
    placeholder::{
        CHART_PLACEHOLDER, COMPLETION_HINT, INTERRUPTED_MARKER, NO_RESPONSE_TEXT,
        THINKING_PLACEHOLDER, ensure_sql_placeholder, has_category_marker, push_block,
        push_final_line, push_line, remove_running_marker, running_marker,
        sweep_running_markers, with_category_marker,
    },
    util::truncate_chars,
    viz::{QUERY_TOOL, QueryOutcome, VISUALIZATION_TOOL, carries_query, parse_visualization_payload},
};

/// Characters of a tool result shown inline
pub const PREVIEW_CHARS: usize = 200;

/// Which stream the reducer is consuming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceMode {
    /// A new turn; the message starts as the transient placeholder
    Fresh,
    /// An approval resume; existing content is kept and appended to
    Resume,
    /// A data-source summary; like `Fresh`, without the category heading
    Summary,
}

#[derive(Debug, Default)]
struct ToolState {
    last_status: Option<ToolCallStatus>,
    /// Running markers still in content, oldest first
    running: VecDeque<String>,
}

/// Per-stream event folder
#[derive(Debug)]
pub struct TurnReducer {
    capabilities: Capabilities,
    mode: ReduceMode,
    tools: HashMap<String, ToolState>,
    next_marker_id: u32,
    saw_text: bool,
    saw_tool: bool,
    paused: bool,
    finished: bool,
}

impl TurnReducer {
    /// Reducer for a new turn
    pub fn new(capabilities: Capabilities) -> Self {
        Self::with_mode(capabilities, ReduceMode::Fresh)
    }

    /// Reducer for the stream that continues an approved message
    pub fn resume(capabilities: Capabilities) -> Self {
        Self::with_mode(capabilities, ReduceMode::Resume)
    }

    /// Reducer for a data-source summary stream
    pub fn summary(capabilities: Capabilities) -> Self {
        Self::with_mode(capabilities, ReduceMode::Summary)
    }

    fn with_mode(capabilities: Capabilities, mode: ReduceMode) -> Self {
        Self {
            capabilities,
            mode,
            tools: HashMap::new(),
            next_marker_id: 1,
            saw_text: false,
            saw_tool: false,
            paused: false,
            finished: false,
        }
    }

    /// The stream reached `executed`/`error`, or paused for approval and
    /// has since seen `done`. Further events are ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Apply one event. Returns whether the message changed.
    pub fn apply(&mut self, msg: &mut Message, event: &StreamEvent) -> bool {
        if self.settled(msg) {
            tracing::debug!("Ignoring {:?} after stream finished for {}", event_name(event), msg.id);
            return false;
        }
        if self.paused && !matches!(event, StreamEvent::Done) {
            tracing::debug!("Ignoring {:?} while {} awaits approval", event_name(event), msg.id);
            return false;
        }

        match event {
            StreamEvent::Text { content } => self.on_text(msg, content),
            StreamEvent::ToolCall {
                tool,
                status: ToolCallStatus::PendingApproval,
                query_text,
            } => self.on_pending_approval(msg, tool, query_text.as_deref()),
            StreamEvent::ToolCall {
                tool,
                status,
                query_text,
            } => self.on_tool_call(msg, tool, *status, query_text.as_deref()),
            StreamEvent::ToolResult {
                tool,
                result,
                status,
            } => self.on_tool_result(msg, tool, result, *status),
            StreamEvent::Error { message } => self.on_error(msg, message),
            StreamEvent::Done => self.on_done(msg),
        }
    }

    /// Apply events in order
    pub fn apply_all<'a>(
        &mut self,
        msg: &mut Message,
        events: impl IntoIterator<Item = &'a StreamEvent>,
    ) {
        for event in events {
            self.apply(msg, event);
        }
    }

    /// Finalize a stream that ended without a `done` event.
    pub fn finish(&mut self, msg: &mut Message) -> bool {
        if self.settled(msg) {
            return false;
        }
        self.on_done(msg)
    }

    /// A message that is already `executed` or `error` is never touched
    /// again, whoever settled it.
    fn settled(&mut self, msg: &Message) -> bool {
        if msg.status.is_terminal() {
            self.finished = true;
        }
        self.finished
    }

    fn heading(&self) -> bool {
        self.mode == ReduceMode::Fresh
    }

    fn on_text(&mut self, msg: &mut Message, text: &str) -> bool {
        if msg.content == THINKING_PLACEHOLDER {
            msg.content = if self.heading() {
                with_category_marker(text)
            } else {
                text.to_string()
            };
        } else {
            msg.content.push_str(text);
        }
        self.saw_text = true;
        msg.status = MessageStatus::Thinking;
        true
    }

    fn on_pending_approval(&mut self, msg: &mut Message, tool: &str, query: Option<&str>) -> bool {
        clear_transient(msg);
        sweep_running_markers(&mut msg.content);
        self.saw_tool = true;
        self.tools.entry(tool.to_string()).or_default().last_status =
            Some(ToolCallStatus::PendingApproval);

        if let Some(query) = query {
            msg.sql_query = Some(query.to_string());
        }
        if msg.sql_query.is_some() {
            ensure_sql_placeholder(&mut msg.content);
        } else {
            tracing::warn!("{} paused for approval without query text", tool);
        }

        if self.capabilities.auto_execute {
            tracing::warn!(
                "Agent requested approval for {} although auto-execute is enabled",
                tool
            );
        }

        tracing::debug!("Message {} paused for approval", msg.id);
        msg.status = MessageStatus::PendingApproval;
        self.paused = true;
        true
    }

    fn on_tool_call(
        &mut self,
        msg: &mut Message,
        tool: &str,
        status: ToolCallStatus,
        query: Option<&str>,
    ) -> bool {
        clear_transient(msg);
        self.saw_tool = true;

        if carries_query(tool) {
            if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
                msg.sql_query = Some(query.to_string());
                ensure_sql_placeholder(&mut msg.content);
            }
        }

        let marker = running_marker(self.next_marker_id, tool);
        self.next_marker_id += 1;
        push_line(&mut msg.content, &marker);

        let state = self.tools.entry(tool.to_string()).or_default();
        state.last_status = Some(status);
        state.running.push_back(marker);

        tracing::debug!("Tool {} started for {}", tool, msg.id);
        msg.status = MessageStatus::Executing;
        true
    }

    fn on_tool_result(
        &mut self,
        msg: &mut Message,
        tool: &str,
        result: &str,
        status: ToolResultStatus,
    ) -> bool {
        clear_transient(msg);
        self.saw_tool = true;
        if let Some(state) = self.tools.get_mut(tool) {
            if let Some(marker) = state.running.pop_front() {
                remove_running_marker(&mut msg.content, &marker);
            }
        }

        if !status.is_success() {
            append_failure(msg, tool, result);
            return true;
        }

        if tool == VISUALIZATION_TOOL {
            if let Some(results) = parse_visualization_payload(result) {
                tracing::debug!("{} produced {} visualization(s)", tool, results.len());
                for viz in results {
                    push_block(&mut msg.content, CHART_PLACEHOLDER);
                    msg.execution_results.push(viz);
                }
                return true;
            }
        }

        if tool == QUERY_TOOL {
            if let Some(outcome) = QueryOutcome::parse(result) {
                match outcome.embedded_error() {
                    Some(error) => append_failure(msg, tool, error),
                    None => push_block(
                        &mut msg.content,
                        &format!("Query returned {} row(s).", outcome.row_count()),
                    ),
                }
                return true;
            }
        }

        push_block(
            &mut msg.content,
            &format!("{}: {}", tool, truncate_chars(result.trim(), PREVIEW_CHARS)),
        );
        true
    }

    fn on_error(&mut self, msg: &mut Message, message: &str) -> bool {
        clear_transient(msg);
        sweep_running_markers(&mut msg.content);
        push_final_line(&mut msg.content, &format!("Error: {}", message));
        msg.error = Some(message.to_string());
        msg.status = MessageStatus::Error;
        self.finished = true;
        tracing::debug!("Message {} failed: {}", msg.id, message);
        true
    }

    fn on_done(&mut self, msg: &mut Message) -> bool {
        self.finished = true;
        if self.paused || msg.status == MessageStatus::PendingApproval {
            // approval freeze wins over done
            return false;
        }

        sweep_running_markers(&mut msg.content);
        if !self.saw_text && !self.saw_tool {
            if msg.content == THINKING_PLACEHOLDER || msg.content.trim().is_empty() {
                msg.content = NO_RESPONSE_TEXT.to_string();
            } else {
                push_final_line(&mut msg.content, NO_RESPONSE_TEXT);
            }
        } else if !self.saw_text {
            push_final_line(&mut msg.content, COMPLETION_HINT);
        } else if self.heading() && !has_category_marker(&msg.content) {
            msg.content = with_category_marker(&msg.content);
        }

        tracing::debug!("Message {} executed", msg.id);
        msg.status = MessageStatus::Executed;
        true
    }
}

/// Mark an in-flight message as interrupted.
///
/// Leaves messages that are paused or already terminal untouched, so calling
/// it twice, or after the stream finished, is harmless.
pub fn mark_interrupted(msg: &mut Message) -> bool {
    if !msg.status.is_in_flight() {
        return false;
    }
    clear_transient(msg);
    sweep_running_markers(&mut msg.content);
    push_final_line(&mut msg.content, INTERRUPTED_MARKER);
    msg.error = Some("Interrupted".to_string());
    msg.status = MessageStatus::Error;
    tracing::debug!("Message {} interrupted", msg.id);
    true
}

fn clear_transient(msg: &mut Message) {
    if msg.content == THINKING_PLACEHOLDER {
        msg.content.clear();
    }
}

fn append_failure(msg: &mut Message, tool: &str, detail: &str) {
    push_block(
        &mut msg.content,
        &format!(
            "Tool {} failed: {}",
            tool,
            truncate_chars(detail.trim(), PREVIEW_CHARS)
        ),
    );
}

fn event_name(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::Text { .. } => "text",
        StreamEvent::ToolCall { .. } => "tool_call",
        StreamEvent::ToolResult { .. } => "tool_result",
        StreamEvent::Error { .. } => "error",
        StreamEvent::Done => "done",
    }
}
