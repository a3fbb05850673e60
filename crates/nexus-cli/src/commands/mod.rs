//! Slash commands for interactive mode

mod session;

pub use session::format_sessions;

/// Result of parsing a slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Show a message to the user (not sent to the agent)
    Message(String),
    /// List sessions
    Sessions,
    /// Switch to a session
    Open(String),
    /// Start a new draft
    New,
    /// Delete a session
    Delete(String),
    /// Bind an uploaded file
    File(i64),
    /// Approve the paused query, optionally replacing it
    Approve(Option<String>),
    /// Reject the paused query
    Reject,
    /// Summarize the bound file
    Summary,
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse a slash command
pub fn parse_command(input: &str) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let (command, args) = match rest.split_once(char::is_whitespace) {
        Some((command, args)) => (command.to_lowercase(), args.trim()),
        None => (rest.to_lowercase(), ""),
    };

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "sessions" | "ls" => CommandResult::Sessions,

        "open" | "o" => match args {
            "" => usage("/open <session-id>"),
            id => CommandResult::Open(id.to_string()),
        },

        "new" | "n" => CommandResult::New,

        "delete" | "rm" => match args {
            "" => usage("/delete <session-id>"),
            id => CommandResult::Delete(id.to_string()),
        },

        "file" | "f" => match args.parse::<i64>() {
            Ok(id) => CommandResult::File(id),
            Err(_) => usage("/file <file-id>"),
        },

        "approve" | "a" => {
            CommandResult::Approve((!args.is_empty()).then(|| args.to_string()))
        }

        "reject" | "r" => CommandResult::Reject,

        "summary" => CommandResult::Summary,

        "quit" | "exit" | "q" => CommandResult::Exit,

        _ => CommandResult::Unknown(command),
    })
}

fn usage(text: &str) -> CommandResult {
    CommandResult::Message(format!("Usage: {}", text))
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?          Show this help message
  /sessions, /ls         List saved sessions
  /open, /o <id>         Switch to a session
  /new, /n               Start a new analysis
  /delete, /rm <id>      Delete a session
  /file, /f <id>         Analyze an uploaded file
  /approve, /a [sql]     Run the proposed query (or your edited version)
  /reject, /r            Discard the proposed query
  /summary               Summarize the current file
  /quit, /exit, /q       Exit nexus

Ctrl-C cancels the running turn.

Examples:
  /file 12               Ask questions about file 12
  /approve               Run the query as proposed
  /approve SELECT region, SUM(total) FROM sales GROUP BY region"#
        .to_string()
}
