//! Plain-text front end: stdin commands in, transcript lines out

use async_stream::stream;
use futures::{Stream, StreamExt};
use sapp_session::{SessionEvent, SessionHandle, SessionPhase, SessionSnapshot, TranscriptEntry};
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::{BroadcastStream, WatchStream, errors::BroadcastStreamRecvError};

/// Commands typed by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Mute,
    Unmute,
    Toggle,
    Retry,
    Status,
    Help,
    Quit,
}

impl FromStr for UserCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mute" | "m" => Ok(UserCommand::Mute),
            "unmute" | "u" => Ok(UserCommand::Unmute),
            "toggle" | "t" | "" => Ok(UserCommand::Toggle),
            "retry" | "r" => Ok(UserCommand::Retry),
            "status" | "s" => Ok(UserCommand::Status),
            "help" | "?" => Ok(UserCommand::Help),
            "quit" | "q" | "exit" => Ok(UserCommand::Quit),
            other => Err(format!("Unknown command '{}'", other)),
        }
    }
}

const HELP: &str = "Commands: mute, unmute, toggle (or empty line), retry, status, quit";

fn stdin_lines() -> impl Stream<Item = String> {
    stream! {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => yield line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }
}

/// Read commands from stdin until `quit` or end of input
pub async fn run_commands(handle: &SessionHandle) -> anyhow::Result<()> {
    eprintln!("{}", HELP);

    let mut lines = std::pin::pin!(stdin_lines());
    while let Some(line) = lines.next().await {
        let command = match line.parse::<UserCommand>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}. {}", e, HELP);
                continue;
            }
        };

        match command {
            UserCommand::Mute => handle.mute()?,
            UserCommand::Unmute => handle.unmute()?,
            UserCommand::Toggle => handle.toggle_mute()?,
            UserCommand::Retry => handle.retry()?,
            UserCommand::Status => println!("{}", status_line(&handle.snapshot())),
            UserCommand::Help => eprintln!("{}", HELP),
            UserCommand::Quit => break,
        }
    }
    Ok(())
}

/// Render the transcript and session events until the engine stops
pub async fn print_session(handle: SessionHandle, json: bool) {
    let mut snapshots = WatchStream::new(handle.watch());
    let mut events = BroadcastStream::new(handle.subscribe());
    drop(handle);

    let mut shown: Option<(u64, String)> = None;
    loop {
        tokio::select! {
            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break };
                if !json {
                    print_snapshot(&snapshot, &mut shown);
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if json {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => tracing::warn!("Failed to encode event: {}", e),
                        }
                    } else if let Some(line) = describe_event(&event) {
                        println!("{}", line);
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                    tracing::warn!("Printer lagged, skipped {} events", n);
                }
                None => break,
            },
        }
    }
}

/// Print the current entry if it changed since the last snapshot
fn print_snapshot(snapshot: &SessionSnapshot, shown: &mut Option<(u64, String)>) {
    let current = &snapshot.transcript.current;
    let key = (current.id, current.text.clone());
    if shown.as_ref() != Some(&key) {
        if !current.is_blank() {
            println!("  {}", format_entry(current));
        }
        *shown = Some(key);
    }
}

pub fn format_entry(entry: &TranscriptEntry) -> String {
    let speaker = match entry.role {
        sapp_session::Role::User => "you",
        sapp_session::Role::Agent => "sapp",
    };
    format!("[{} #{}] {}", speaker, entry.id, entry.text)
}

fn phase_label(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Muted => "muted",
        SessionPhase::Connecting => "connecting",
        SessionPhase::Connected => "listening",
        SessionPhase::Error => "error",
    }
}

/// One line for an event, or `None` for events shown through snapshots
pub fn describe_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::PhaseChanged { phase } => Some(format!("-- {} --", phase_label(*phase))),
        SessionEvent::EntryArchived { entry } => Some(format!("* {}", format_entry(entry))),
        SessionEvent::ActionDispatched { command } => {
            Some(format!("-> robot: {}", command.action_name()))
        }
        SessionEvent::ActionIgnored { action } => {
            Some(format!("-> robot: ignored unsupported action '{}'", action))
        }
        SessionEvent::FrameRejected { .. } => None,
        SessionEvent::Failed { message, hint } => {
            let mut line = format!("!! {} (type 'retry' to reconnect)", message);
            if let Some(hint) = hint {
                line.push_str(&format!("\nHint: {}", hint));
            }
            Some(line)
        }
    }
}

pub fn status_line(snapshot: &SessionSnapshot) -> String {
    let session = &snapshot.session;
    let mut line = format!(
        "status: {}, mic {}",
        phase_label(session.phase),
        if session.is_muted() { "off" } else { "on" }
    );
    if let Some(credentials) = &session.credentials {
        line.push_str(&format!(", room {}", credentials.room));
        if !session.link_up {
            line.push_str(" (waiting for agent)");
        }
    }
    if let Some(error) = &session.last_error {
        line.push_str(&format!(", last error: {}", error));
    }
    line.push_str(&format!(
        ", {} completed entries",
        snapshot.transcript.history.len()
    ));
    line
}
