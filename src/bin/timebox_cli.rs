//! timebox-cli — a thin binary that wires a [`SessionController`] to
//! stdin/stdout for local testing and demonstration.
//!
//! Grounded in the teacher's `bin/mcp.rs` pattern of a small binary that
//! loads config, opens its backing resources, builds one long-lived service
//! object, and serves it over an I/O transport — here stdin/stdout text
//! turns instead of the Model Context Protocol over stdio.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use daybox_core::{
    init_tracing, CalendarCapability, Config, HttpCalendarCapability, InMemoryConstraintStore, InboundMessage, Observer,
    SessionController,
};
use daybox_core::extractors::HttpChatCompletionClient;

const CHANNEL_ID: &str = "cli";
const THREAD_ID: &str = "local";
const USER_ID: &str = "cli-user";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();

    let model_endpoint = url::Url::parse(&config.model_endpoint)?;
    let client = HttpChatCompletionClient::new(model_endpoint, config.model_api_key.clone(), "claude-3-5-sonnet-latest");

    let calendar_url = url::Url::parse(&config.mcp_calendar_url)?;
    let calendar: Arc<dyn CalendarCapability> = Arc::new(HttpCalendarCapability::new(calendar_url));
    let store = Arc::new(InMemoryConstraintStore::new());
    let observer = Observer::new();

    let controller = SessionController::new(client, store, calendar, observer, config);

    println!("timebox-cli: say hello to start a planning session (Ctrl-D to quit).");
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    let reply = controller
        .handle(InboundMessage::Start {
            channel_id: CHANNEL_ID.to_string(),
            thread_id: THREAD_ID.to_string(),
            user_id: USER_ID.to_string(),
        })
        .await;
    print_reply(&mut stdout, &reply)?;

    let mut date_committed = false;
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            break;
        }

        let inbound = route_line(trimmed, date_committed);
        date_committed = true;
        let reply = controller.handle(inbound).await;
        print_reply(&mut stdout, &reply)?;
        if reply.completed {
            break;
        }
    }

    Ok(())
}

/// Maps a raw line of stdin input onto the right [`InboundMessage`] variant.
/// The very first reply after `Start` names the planned day, so it goes
/// through the dedicated `CommitDate` fast path; a handful of later bare
/// keywords reach the explicit stage-action/submit endpoints directly, and
/// everything else is an ordinary conversational turn.
fn route_line(text: &str, date_committed: bool) -> InboundMessage {
    let channel_id = CHANNEL_ID.to_string();
    let thread_id = THREAD_ID.to_string();
    if !date_committed {
        return InboundMessage::CommitDate { channel_id, thread_id, date_text: text.to_string() };
    }
    match text {
        "proceed" | "back" | "redo" | "cancel" | "assist" => {
            InboundMessage::StageAction { channel_id, thread_id, action: text.to_string() }
        }
        "confirm" => InboundMessage::ConfirmSubmit { channel_id, thread_id },
        "cancel-submit" => InboundMessage::CancelSubmit { channel_id, thread_id },
        "undo" => InboundMessage::UndoSubmit { channel_id, thread_id },
        _ => InboundMessage::UserReply { channel_id, thread_id, text: text.to_string() },
    }
}

fn print_reply(stdout: &mut impl Write, reply: &daybox_core::OutboundMessage) -> io::Result<()> {
    writeln!(stdout, "[{}] {}", reply.stage, reply.text)?;
    if let Some(question) = &reply.question {
        writeln!(stdout, "> {question}")?;
    }
    stdout.flush()
}
