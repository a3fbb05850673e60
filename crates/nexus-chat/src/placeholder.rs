//! Inline content tokens and the order-preserving resolver
//!
//! Message content is plain text with three kinds of inline tokens:
//! `[[SQL_QUERY]]` for the turn's query, `[[CHART]]` for the i-th entry of
//! `execution_results`, and `[[RUNNING:<id>:<tool>]]` for a tool that is
//! still executing. Artifact tokens are never stripped from stored content,
//! so a reloaded message interleaves text and artifacts exactly as the live
//! stream did.

use std::sync::LazyLock;

use regex::Regex;

use crate::message::VisualizationResult;

pub const SQL_PLACEHOLDER: &str = "[[SQL_QUERY]]";
pub const CHART_PLACEHOLDER: &str = "[[CHART]]";

/// Content of a model message before any event has arrived
pub const THINKING_PLACEHOLDER: &str = "Thinking...";
/// Heading that leads an analysis answer
pub const CATEGORY_MARKER: &str = "**Analysis**\n\n";
pub const NO_RESPONSE_TEXT: &str = "No response received from the agent.";
pub const COMPLETION_HINT: &str = "Analysis complete.";
pub const INTERRUPTED_MARKER: &str = "[Interrupted]";
pub const REJECTED_NOTE: &str = "[Query rejected]";

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[(?:(SQL_QUERY)|(CHART)|RUNNING:(\d+):([^\]\n]*))\]\]").unwrap()
});

static RUNNING_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[RUNNING:\d+:[^\]\n]*\]\]\n?").unwrap());

/// Build the transient marker for a running tool
pub fn running_marker(id: u32, tool: &str) -> String {
    format!("[[RUNNING:{}:{}]]", id, tool)
}

/// Append `line` so that it sits on a line of its own.
pub fn push_line(content: &mut String, line: &str) {
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
}

/// Append a closing line (interruption, rejection, error) without a
/// trailing newline, so content ends with exactly that line.
pub fn push_final_line(content: &mut String, line: &str) {
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
}

/// Append a token as its own paragraph.
pub fn push_block(content: &mut String, token: &str) {
    if !content.is_empty() {
        if !content.ends_with('\n') {
            content.push('\n');
        }
        if !content.ends_with("\n\n") {
            content.push('\n');
        }
    }
    content.push_str(token);
    content.push_str("\n\n");
}

pub fn count_sql_placeholders(content: &str) -> usize {
    content.matches(SQL_PLACEHOLDER).count()
}

pub fn count_chart_placeholders(content: &str) -> usize {
    content.matches(CHART_PLACEHOLDER).count()
}

/// Append the SQL placeholder unless one is already present.
/// Returns whether content changed.
pub fn ensure_sql_placeholder(content: &mut String) -> bool {
    if content.contains(SQL_PLACEHOLDER) {
        return false;
    }
    push_block(content, SQL_PLACEHOLDER);
    true
}

/// Append chart placeholders until there are `wanted` of them.
pub fn ensure_chart_placeholders(content: &mut String, wanted: usize) {
    for _ in count_chart_placeholders(content)..wanted {
        push_block(content, CHART_PLACEHOLDER);
    }
}

/// Remove one running marker by its exact token.
pub fn remove_running_marker(content: &mut String, marker: &str) -> bool {
    let Some(start) = content.find(marker) else {
        return false;
    };
    let mut end = start + marker.len();
    if content[end..].starts_with('\n') {
        end += 1;
    }
    content.replace_range(start..end, "");
    true
}

/// Remove every running marker left in `content`.
pub fn sweep_running_markers(content: &mut String) -> bool {
    if !content.contains("[[RUNNING:") {
        return false;
    }
    let swept = RUNNING_PATTERN.replace_all(content, "").into_owned();
    let changed = swept != *content;
    *content = swept;
    changed
}

pub fn has_category_marker(content: &str) -> bool {
    content.starts_with(CATEGORY_MARKER.trim_end())
}

/// Prefix `text` with the category marker if it lacks one.
pub fn with_category_marker(text: &str) -> String {
    if has_category_marker(text) {
        text.to_string()
    } else {
        format!("{}{}", CATEGORY_MARKER, text)
    }
}

/// One piece of resolved content
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Segment<'a> {
    /// Narrative text between tokens
    Text(&'a str),
    /// The query artifact (`None` if the message has no query)
    Sql(Option<&'a str>),
    /// The `index`-th chart artifact (`None` if it is missing)
    Chart {
        index: usize,
        result: Option<&'a VisualizationResult>,
    },
    /// A tool that is still executing
    Running { id: u32, tool: &'a str },
}

/// Split content into text and artifact segments, in content order.
///
/// Every SQL token renders the single `sql_query`; the i-th chart token
/// renders `results[i]`.
pub fn resolve<'a>(
    content: &'a str,
    sql_query: Option<&'a str>,
    results: &'a [VisualizationResult],
) -> Vec<Segment<'a>> {
    let mut segments = Vec::new();
    let mut last = 0;
    let mut chart_index = 0;

    for caps in TOKEN_PATTERN.captures_iter(content) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > last {
            segments.push(Segment::Text(&content[last..whole.start()]));
        }
        last = whole.end();

        if caps.get(1).is_some() {
            segments.push(Segment::Sql(sql_query));
        } else if caps.get(2).is_some() {
            segments.push(Segment::Chart {
                index: chart_index,
                result: results.get(chart_index),
            });
            chart_index += 1;
        } else {
            let id = caps
                .get(3)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or_default();
            let tool = caps.get(4).map(|m| m.as_str()).unwrap_or_default();
            segments.push(Segment::Running { id, tool });
        }
    }

    if last < content.len() {
        segments.push(Segment::Text(&content[last..]));
    }
    segments
}
