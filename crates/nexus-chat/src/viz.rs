//! Tool result payloads: visualization configs and query outcomes

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

use crate::message::{DisplayType, VisualizationResult};

/// Tool that carries the generated query and executes it
pub const QUERY_TOOL: &str = "sql_inter";
/// Tool that loads a query's rows into a dataframe
pub const EXTRACT_TOOL: &str = "extract_data";
/// Tool that produces chart/table configurations
pub const VISUALIZATION_TOOL: &str = "python_inter";

/// Whether a tool call carries query text worth recording as `sqlQuery`
pub fn carries_query(tool: &str) -> bool {
    tool == QUERY_TOOL || tool == EXTRACT_TOOL
}

/// Parse a visualization tool result into its artifacts.
///
/// Returns `None` when the text is not a visualization payload at all.
pub fn parse_visualization_payload(text: &str) -> Option<Vec<VisualizationResult>> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    let configs = match &value {
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("visualization_config") => {
            match (map.get("configs"), map.get("config")) {
                (Some(Value::Array(list)), _) => list.iter().collect(),
                (_, Some(Value::Array(list))) => list.iter().collect(),
                (_, Some(single)) => vec![single],
                _ => Vec::new(),
            }
        }
        Value::Array(list) if !list.is_empty() && list.iter().all(is_config) => list.iter().collect(),
        _ => return None,
    };
    Some(dedup(configs.into_iter().filter_map(from_config)))
}

/// Artifacts from a stored visualization config: a single config, a list of
/// configs, or a full `visualization_config` payload.
pub fn results_from_stored(value: &Value) -> Vec<VisualizationResult> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(list) => dedup(list.iter().filter_map(from_config)),
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("visualization_config") => {
            parse_visualization_payload(&value.to_string()).unwrap_or_default()
        }
        Value::String(s) => parse_visualization_payload(s).unwrap_or_default(),
        other => from_config(other).into_iter().collect(),
    }
}

fn is_config(value: &Value) -> bool {
    value.get("type").is_some() && value.get("data").is_some()
}

/// One chart/table config: `{type, title?, data: [{col: value}]}`
fn from_config(value: &Value) -> Option<VisualizationResult> {
    if !is_config(value) {
        return None;
    }
    let chart_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("table")
        .to_string();
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string);
    let data = value.get("data").and_then(Value::as_array);

    let rows_in: Vec<&serde_json::Map<String, Value>> = data
        .map(|d| d.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();
    let columns: Vec<String> = rows_in
        .first()
        .map(|first| first.keys().cloned().collect())
        .unwrap_or_default();
    let rows = rows_in
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    let display_type = if chart_type == "table" {
        DisplayType::Table
    } else {
        DisplayType::Chart
    };

    Some(VisualizationResult {
        columns,
        rows,
        chart_type_suggestion: chart_type,
        display_type,
        title,
    })
}

/// Drop configs with the same title, column set and row count; first wins.
fn dedup(results: impl Iterator<Item = VisualizationResult>) -> Vec<VisualizationResult> {
    let mut seen = HashSet::new();
    results
        .filter(|r| {
            let mut keys = r.columns.clone();
            keys.sort();
            seen.insert((r.title.clone(), keys, r.rows.len()))
        })
        .collect()
}

/// Result of the query tool
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryOutcome {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl QueryOutcome {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text.trim()).ok()
    }

    /// Error text the tool embedded in an otherwise successful result
    pub fn embedded_error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.unwrap_or(self.rows.len() as u64)
    }
}
