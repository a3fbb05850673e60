//! Session listing

use chrono::{Local, TimeZone};
use nexus_chat::SessionInfo;

/// Format the session list, marking the current one
pub fn format_sessions(sessions: &[SessionInfo], current_id: &str) -> String {
    if sessions.is_empty() {
        return "No saved sessions.".to_string();
    }

    let mut output = String::from("Sessions\n");
    output.push_str(&"-".repeat(60));
    output.push('\n');

    for session in sessions {
        let marker = if session.id == current_id { "*" } else { " " };
        let source = session
            .data_source
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        output.push_str(&format!(
            "{} {:<8} {:<16} {:<10} {}\n",
            marker,
            session.id,
            format_timestamp(session.updated_at),
            source,
            session.title
        ));
    }
    output.push_str("\nUse /open <id> to switch.");
    output
}

/// Local date and time for a millisecond timestamp
fn format_timestamp(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        None => "-".to_string(),
    }
}
