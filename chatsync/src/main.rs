//! `chatsync` -- headless client for a `ChatSync` backend.
//!
//! Reads commands from stdin and prints conversation updates to stdout.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/chatsync/config.toml`).
//!
//! ```bash
//! cargo run --bin chatsync -- --server-url ws://127.0.0.1:9000/ws \
//!     --user-id alice --token alice-secret
//! ```
//!
//! Commands: `/open <conversation>`, `/close`, `/resend <client-id>`,
//! `/image <ref> [caption]`, `/typing`, `/who`, `/list`, `/status`, `/quit`.
//! Any other line is sent to the open conversation.

use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use chatsync::config::{CliArgs, ClientConfig};
use chatsync::connection::{ConnectionEvent, DisconnectReason};
use chatsync::session::SessionHost;
use chatsync::sync::store::DeliveryState;
use chatsync::sync::{SyncClient, SyncEvent};
use chatsync::transport::ws::WsBackend;
use chatsync_proto::message::{ClientMessageId, ConversationId};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load configuration: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("chatsync starting");

    let (backend, identity) = match (config.backend(), config.identity()) {
        (Ok(backend), Ok(identity)) => (backend, identity),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut host = SessionHost::new(Arc::new(backend), config.to_sync_config());
    let events = match host.on_login(identity).await {
        Ok(events) => events,
        Err(e) => {
            eprintln!("Could not log in: {e}");
            return ExitCode::FAILURE;
        }
    };
    let Some(client) = host.client().cloned() else {
        return ExitCode::FAILURE;
    };

    println!("Connected as {}. Type /open <conversation> to start.", client.local_user());
    run(&client, events, &config.timestamp_format).await;

    host.on_logout().await;
    tracing::info!("chatsync exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the conversation on
/// stdout. Returns a [`WorkerGuard`] that must be held until shutdown to
/// ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// A parsed line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Open(ConversationId),
    Close,
    Resend(ClientMessageId),
    Image { reference: String, caption: String },
    Typing,
    Who,
    List,
    Status,
    Quit,
    Say(String),
    Invalid(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Say(line.to_string()));
    };
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim();
    let command = match (name, arg) {
        ("open", id) if !id.is_empty() => Command::Open(ConversationId::new(id)),
        ("close", "") => Command::Close,
        ("resend", id) if !id.is_empty() => Command::Resend(ClientMessageId::new(id)),
        ("image", args) if !args.is_empty() => {
            let (reference, caption) = args.split_once(' ').unwrap_or((args, ""));
            Command::Image {
                reference: reference.to_string(),
                caption: caption.trim().to_string(),
            }
        }
        ("typing", "") => Command::Typing,
        ("who", "") => Command::Who,
        ("list", "") => Command::List,
        ("status", "") => Command::Status,
        ("quit" | "exit", "") => Command::Quit,
        _ => Command::Invalid(line.to_string()),
    };
    Some(command)
}

/// Main loop: applies stdin commands and prints sync events until `/quit`
/// or end of input.
async fn run(
    client: &SyncClient<WsBackend>,
    mut events: mpsc::Receiver<SyncEvent>,
    timestamp_format: &str,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut view = ThreadView::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(err = %e, "stdin read failed");
                        break;
                    }
                };
                match parse_command(&line) {
                    Some(Command::Quit) => break,
                    Some(command) => apply(client, command, &mut view),
                    None => {}
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if render_event(client, &event, &mut view, timestamp_format) {
                    break;
                }
            }
        }
    }
}

fn apply(client: &SyncClient<WsBackend>, command: Command, view: &mut ThreadView) {
    match command {
        Command::Open(conversation_id) => {
            println!("-- {conversation_id} --");
            view.reset();
            client.set_active_conversation(Some(conversation_id));
        }
        Command::Close => {
            view.reset();
            client.set_active_conversation(None);
        }
        Command::Resend(client_id) => {
            if let Err(e) = client.resend(&client_id) {
                println!("! {e}");
            }
        }
        Command::Image { reference, caption } => {
            if let Err(e) = client.send(&caption, Some(&reference)) {
                println!("! {e}");
            }
        }
        Command::Say(text) => {
            if let Err(e) = client.send(&text, None) {
                println!("! {e}");
            }
        }
        Command::Typing => {
            if !client.notify_typing() {
                println!("! not connected or no open conversation");
            }
        }
        Command::Who => {
            let online = client.online_users();
            if online.is_empty() {
                println!("* nobody else is online");
            } else {
                let names: Vec<_> = online.iter().map(ToString::to_string).collect();
                println!("* online: {}", names.join(", "));
            }
        }
        Command::List => {
            if !client.refresh_conversations() {
                print_conversations(client);
            }
        }
        Command::Status => {
            let status = client.connection_status();
            println!(
                "* {:?} (retries: {}){}",
                status.state,
                status.retry_count,
                status
                    .last_error
                    .map(|e| format!(", last error: {e}"))
                    .unwrap_or_default()
            );
        }
        Command::Invalid(line) => println!("! unknown command: {line}"),
        Command::Quit => {}
    }
}

/// Print the effect of `event`. Returns true when the session is over.
fn render_event(
    client: &SyncClient<WsBackend>,
    event: &SyncEvent,
    view: &mut ThreadView,
    timestamp_format: &str,
) -> bool {
    match event {
        SyncEvent::MessagesChanged { conversation_id } => {
            if client.active_conversation().as_ref() == Some(conversation_id) {
                view.print_changes(client, timestamp_format);
            }
        }
        SyncEvent::ConnectionChanged(ConnectionEvent::Connecting) => println!("* connecting..."),
        SyncEvent::ConnectionChanged(ConnectionEvent::Connected) => println!("* connected"),
        SyncEvent::ConnectionChanged(ConnectionEvent::Disconnected(reason)) => match reason {
            DisconnectReason::Requested => println!("* disconnected"),
            DisconnectReason::TransportLost(e) => println!("* connection lost: {e}"),
            DisconnectReason::AuthRejected(_) => {}
        },
        SyncEvent::PresenceChanged { user_id } => {
            if let Some(conversation_id) = client.active_conversation()
                && client.is_typing(user_id, &conversation_id)
            {
                println!("* {user_id} is typing...");
            }
        }
        SyncEvent::ConversationsChanged => print_conversations(client),
        SyncEvent::FetchFailed {
            conversation_id,
            reason,
        } => println!("! could not load {conversation_id}: {reason}"),
        SyncEvent::SendFailed {
            client_id, reason, ..
        } => println!("! send {client_id} failed ({reason:?}); /resend {client_id} to retry"),
        SyncEvent::AuthRejected { reason } => {
            println!("! session rejected: {reason}");
            return true;
        }
        SyncEvent::ServerError { reason } => println!("! server: {reason}"),
    }
    false
}

fn print_conversations(client: &SyncClient<WsBackend>) {
    let conversations = client.conversations();
    if conversations.is_empty() {
        println!("* no conversations");
        return;
    }
    for summary in conversations {
        let participants: Vec<_> = summary.participants.iter().map(ToString::to_string).collect();
        println!("* {} ({})", summary.id, participants.join(", "));
    }
}

/// Tracks which messages of the open conversation were already printed.
#[derive(Default)]
struct ThreadView {
    printed: HashMap<String, DeliveryState>,
}

impl ThreadView {
    fn reset(&mut self) {
        self.printed.clear();
    }

    fn print_changes(&mut self, client: &SyncClient<WsBackend>, timestamp_format: &str) {
        for message in client.active_messages() {
            let key = message.key.to_string();
            if self.printed.get(&key) == Some(&message.state) {
                continue;
            }
            let marker = match message.state {
                DeliveryState::Sent => String::new(),
                DeliveryState::Pending => " (sending)".to_string(),
                DeliveryState::Failed => format!(" (failed: /resend {key})"),
            };
            let text = message.body.text.as_deref().unwrap_or_default();
            let image = message
                .body
                .image
                .as_deref()
                .map(|i| format!(" [image: {i}]"))
                .unwrap_or_default();
            println!(
                "[{}] {}: {text}{image}{marker}",
                format_timestamp_ms(message.created_at.as_millis(), timestamp_format),
                message.sender_id,
            );
            self.printed.insert(key, message.state);
        }
    }
}

/// Format an epoch-millisecond timestamp in local time.
fn format_timestamp_ms(ms: u64, format: &str) -> String {
    use chrono::{Local, TimeZone};
    let secs = i64::try_from(ms / 1000).unwrap_or(i64::MAX);
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format(format).to_string(),
        _ => "??:??".to_string(),
    }
}
