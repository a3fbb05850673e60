//! Plain-text rendering of messages

use std::collections::HashSet;

use nexus_chat::{
    DisplayType, Message, MessageStatus, Segment, VisualizationResult, resolve, util::truncate_chars,
};

/// Rows shown per table before eliding the rest
const MAX_TABLE_ROWS: usize = 20;

/// Widest a table cell may get
const MAX_CELL_CHARS: usize = 40;

/// Render a message with its artifacts inlined
pub fn render_message(msg: &Message) -> String {
    if msg.is_user() {
        return format!("> {}", msg.content);
    }

    let mut out = String::new();
    for segment in resolve(&msg.content, msg.sql_query.as_deref(), &msg.execution_results) {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Sql(Some(query)) => {
                out.push_str("```sql\n");
                out.push_str(query.trim_end());
                out.push_str("\n```");
            }
            Segment::Sql(None) => {}
            Segment::Chart {
                result: Some(result),
                ..
            } => out.push_str(&render_result(result)),
            Segment::Chart {
                index,
                result: None,
            } => out.push_str(&format!("[chart {} unavailable]", index + 1)),
            Segment::Running { tool, .. } => out.push_str(&format!("[running {}...]", tool)),
        }
    }

    let mut out = out.trim_end().to_string();
    if msg.status == MessageStatus::PendingApproval {
        out.push_str("\n\nAwaiting approval: /approve to run it, /approve <sql> to run an edited query, /reject to discard.");
    }
    out
}

/// Render a visualization as a titled text table
pub fn render_result(result: &VisualizationResult) -> String {
    let mut out = String::new();
    let kind = match result.display_type {
        DisplayType::Table => "table".to_string(),
        DisplayType::Chart => format!("{} chart", result.chart_type_suggestion),
    };
    match &result.title {
        Some(title) => out.push_str(&format!("{} ({})\n", title, kind)),
        None => out.push_str(&format!("({})\n", kind)),
    }
    out.push_str(&render_table(&result.columns, &result.rows));
    out
}

fn render_table(columns: &[String], rows: &[Vec<serde_json::Value>]) -> String {
    let shown: Vec<Vec<String>> = rows
        .iter()
        .take(MAX_TABLE_ROWS)
        .map(|row| {
            (0..columns.len())
                .map(|i| row.get(i).map(cell_text).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            shown
                .iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        format!("| {} |\n", padded.join(" | "))
    };

    let mut out = line(columns);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&format!("|-{}-|\n", rule.join("-|-")));
    for row in &shown {
        out.push_str(&line(row));
    }
    if rows.len() > MAX_TABLE_ROWS {
        out.push_str(&format!("... {} more rows\n", rows.len() - MAX_TABLE_ROWS));
    }
    out
}

fn cell_text(value: &serde_json::Value) -> String {
    let text = match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate_chars(&text.replace('\n', " "), MAX_CELL_CHARS)
}

/// Tracks what has been reported about the streaming message
#[derive(Debug, Default)]
pub struct Progress {
    message_id: Option<String>,
    running: HashSet<u32>,
    status: Option<MessageStatus>,
}

impl Progress {
    /// Progress lines for a new state of a model message
    pub fn observe(&mut self, msg: &Message) -> Vec<String> {
        if msg.is_user() {
            return Vec::new();
        }
        if self.message_id.as_deref() != Some(msg.id.as_str()) {
            *self = Self {
                message_id: Some(msg.id.clone()),
                ..Self::default()
            };
        }

        let mut lines = Vec::new();
        for segment in resolve(&msg.content, msg.sql_query.as_deref(), &msg.execution_results) {
            if let Segment::Running { id, tool } = segment {
                if self.running.insert(id) {
                    lines.push(format!("[running {}...]", tool));
                }
            }
        }
        if self.status != Some(msg.status) {
            if msg.status == MessageStatus::PendingApproval {
                lines.push("[waiting for approval]".to_string());
            }
            self.status = Some(msg.status);
        }
        lines
    }
}
