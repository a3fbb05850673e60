//! nexus - command-line client for the DataNexus analytics agent

mod commands;
mod config;
mod render;

use clap::Parser;
use commands::CommandResult;
use nexus_api::{DataSourceRef, HttpSessionService, HttpTransport, validate_server_url};
use nexus_chat::{Chat, ChatEvent, MessageStatus, TurnHandle};
use std::io::{IsTerminal, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// nexus - ask questions about your data
#[derive(Parser, Debug)]
#[command(name = "nexus")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Analytics backend URL (default: http://localhost:8000)
    #[arg(long)]
    server: Option<String>,

    /// Bearer token for the backend
    #[arg(long)]
    token: Option<String>,

    /// Model the agent should use
    #[arg(short, long)]
    model: Option<String>,

    /// Ask a single question and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Analyze an uploaded file
    #[arg(short, long)]
    file: Option<i64>,

    /// Analyze a database connection instead of a file
    #[arg(long, conflicts_with = "file")]
    connection: Option<i64>,

    /// Ask before running each generated query
    #[arg(long)]
    require_approval: bool,

    /// Resume a saved session by ID
    #[arg(long)]
    resume: Option<String>,

    /// List saved sessions
    #[arg(long)]
    sessions: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose);

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();

    // CLI flags take precedence over the file
    let server_url = cfg.server_url(args.server.clone());
    let token = cfg.token(args.token.clone());
    let mut chat_config = cfg.chat_config(args.model.clone());
    if args.require_approval {
        chat_config.capabilities.auto_execute = false;
    }
    if let Err(e) = validate_server_url(&server_url) {
        eprintln!("Error: {}", e);
        eprintln!("Set server_url in the config file (nexus --init-config) or pass --server.");
        std::process::exit(1);
    }
    tracing::debug!("Using server {}", server_url);

    let transport = Arc::new(HttpTransport::new(&server_url).with_token(token.clone()));
    let sessions = Arc::new(HttpSessionService::new(&server_url).with_token(token));
    let chat = Chat::new(chat_config, transport, sessions);

    // List sessions and exit
    if args.sessions {
        if let Err(e) = chat.refresh_sessions().await {
            report_error(&e);
            std::process::exit(1);
        }
        let snapshot = chat.snapshot();
        println!(
            "{}",
            commands::format_sessions(&snapshot.sessions, &snapshot.current.id)
        );
        return Ok(());
    }

    if let Some(ref session_id) = args.resume {
        let loaded = match chat.refresh_sessions().await {
            Ok(()) => chat.select_session(session_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = loaded {
            report_error(&e);
            std::process::exit(1);
        }
        print_transcript(&chat);
    }

    let source = match (args.file, args.connection) {
        (Some(id), _) => Some(DataSourceRef::File(id)),
        (None, Some(id)) => Some(DataSourceRef::Connection(id)),
        (None, None) => None,
    };
    if source.is_some() {
        chat.bind_data_source(source);
    }

    // Non-interactive mode
    if let Some(question) = args.command {
        return run_command(&chat, &question).await;
    }

    run_interactive(&chat).await
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("nexus=debug,nexus_chat=debug,nexus_api=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_command(chat: &Chat, question: &str) -> anyhow::Result<()> {
    let progress = spawn_progress_printer(chat);
    let handle = match chat.submit(question).await {
        Ok(handle) => handle,
        Err(nexus_chat::Error::NoDataSource) => {
            eprintln!("Error: no data source. Pass --file <id> or --connection <id>.");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    let status = wait_turn(chat, handle).await;
    progress.abort();

    match status {
        MessageStatus::PendingApproval => {
            let session_id = chat.snapshot().current.id;
            eprintln!(
                "\nThe query needs approval. Run `nexus --resume {}` and use /approve.",
                session_id
            );
        }
        MessageStatus::Error => std::process::exit(1),
        _ => {}
    }
    Ok(())
}

async fn run_interactive(chat: &Chat) -> anyhow::Result<()> {
    let progress = spawn_progress_printer(chat);

    if std::io::stderr().is_terminal() {
        let snapshot = chat.snapshot();
        match snapshot.data_source {
            Some(source) => eprintln!("nexus ({}) session: {}", source, snapshot.current.id),
            None => eprintln!("nexus (no data source; /file <id> to pick one)"),
        }
        eprintln!("Type /help for commands.");
        eprintln!();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            // EOF
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        // Handle slash commands
        if let Some(command) = commands::parse_command(input) {
            match execute_command(chat, command).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => report_error(&e),
            }
            println!();
            continue;
        }

        match chat.submit(input).await {
            Ok(handle) => {
                wait_turn(chat, handle).await;
            }
            Err(nexus_chat::Error::NoDataSource) => {
                println!("No data source yet. Use /file <id> first.");
            }
            Err(e) => report_error(&e),
        }
        println!();
    }

    progress.abort();
    Ok(())
}

/// Run a slash command. Returns true when the REPL should exit.
async fn execute_command(chat: &Chat, command: CommandResult) -> nexus_chat::Result<bool> {
    match command {
        CommandResult::Message(text) => println!("{}", text),
        CommandResult::Sessions => {
            chat.refresh_sessions().await?;
            let snapshot = chat.snapshot();
            println!(
                "{}",
                commands::format_sessions(&snapshot.sessions, &snapshot.current.id)
            );
        }
        CommandResult::Open(id) => {
            if chat.snapshot().sessions.iter().all(|s| s.id != id) {
                chat.refresh_sessions().await?;
            }
            chat.select_session(&id).await?;
            print_transcript(chat);
        }
        CommandResult::New => {
            chat.new_draft();
            println!("Started a new analysis.");
        }
        CommandResult::Delete(id) => {
            chat.delete_session(&id).await?;
            println!("Deleted session {}.", id);
        }
        CommandResult::File(id) => {
            chat.bind_data_source(Some(DataSourceRef::File(id)));
            println!("Using file #{}.", id);
        }
        CommandResult::Approve(edited) => {
            let Some(message_id) = pending_message_id(chat) else {
                println!("Nothing is waiting for approval.");
                return Ok(false);
            };
            let handle = chat.approve(&message_id, edited.as_deref())?;
            wait_turn(chat, handle).await;
        }
        CommandResult::Reject => match pending_message_id(chat) {
            Some(message_id) => {
                chat.reject(&message_id)?;
                println!("Query rejected.");
            }
            None => println!("Nothing is waiting for approval."),
        },
        CommandResult::Summary => {
            let handle = chat.summarize()?;
            wait_turn(chat, handle).await;
        }
        CommandResult::Exit => return Ok(true),
        CommandResult::Unknown(cmd) => {
            println!("Unknown command: /{}", cmd);
            println!("Type /help for available commands.");
        }
    }
    Ok(false)
}

fn report_error(e: &nexus_chat::Error) {
    eprintln!("Error: {}", e);
    if let nexus_chat::Error::Api(api) = e {
        if api.is_unauthorized() {
            eprintln!("The server rejected the token. Pass --token or set NEXUS_TOKEN.");
        }
    }
}

/// The current session's message paused for approval, if any
fn pending_message_id(chat: &Chat) -> Option<String> {
    chat.snapshot()
        .current
        .messages
        .iter()
        .rev()
        .find(|m| m.status == MessageStatus::PendingApproval)
        .map(|m| m.id.clone())
}

/// Wait for a turn, cancelling it on Ctrl-C, then print the message
async fn wait_turn(chat: &Chat, handle: TurnHandle) -> MessageStatus {
    let session_id = handle.session_id().to_string();
    let message_id = handle.message_id().to_string();

    let wait = handle.wait();
    tokio::pin!(wait);
    let status = tokio::select! {
        status = &mut wait => status,
        _ = tokio::signal::ctrl_c() => {
            chat.cancel();
            wait.await
        }
    };

    if let Some(msg) = chat.message(&session_id, &message_id) {
        println!("{}", render::render_message(&msg));
    }
    status
}

fn print_transcript(chat: &Chat) {
    let session = chat.snapshot().current;
    println!("Session {}: {}", session.id, session.title);
    println!();
    for msg in &session.messages {
        println!("{}", render::render_message(msg));
        println!();
    }
}

/// Print tool activity to stderr while a turn streams
fn spawn_progress_printer(chat: &Chat) -> tokio::task::JoinHandle<()> {
    let mut receiver = chat.subscribe();
    tokio::spawn(async move {
        let mut progress = render::Progress::default();
        loop {
            match receiver.recv().await {
                Ok(ChatEvent::MessageUpdated { message, .. }) => {
                    for line in progress.observe(&message) {
                        eprintln!("{}", line);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Progress printer skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
