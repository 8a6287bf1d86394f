//! External Interface Layer (spec §6): the transport-agnostic inbound and
//! outbound message shapes the Session Controller exchanges with whatever
//! chat surface embeds it (Slack, a CLI, a test harness).

use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Everything an embedding transport can send into a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Open a new thread, replacing any pre-existing session at the same key.
    Start { channel_id: String, thread_id: String, user_id: String },
    /// The first reply in `collect_constraints`: free text naming the day to plan.
    CommitDate { channel_id: String, thread_id: String, date_text: String },
    /// An ordinary conversational turn.
    UserReply { channel_id: String, thread_id: String, text: String },
    /// An explicit UI affordance (a button), pre-resolved to a routing action
    /// (`"proceed"`, `"back"`, `"redo"`, `"cancel"`, `"assist"`) instead of
    /// going through the decision router.
    StageAction { channel_id: String, thread_id: String, action: String },
    ConfirmSubmit { channel_id: String, thread_id: String },
    CancelSubmit { channel_id: String, thread_id: String },
    UndoSubmit { channel_id: String, thread_id: String },
}

impl InboundMessage {
    pub fn channel_id(&self) -> &str {
        match self {
            InboundMessage::Start { channel_id, .. }
            | InboundMessage::CommitDate { channel_id, .. }
            | InboundMessage::UserReply { channel_id, .. }
            | InboundMessage::StageAction { channel_id, .. }
            | InboundMessage::ConfirmSubmit { channel_id, .. }
            | InboundMessage::CancelSubmit { channel_id, .. }
            | InboundMessage::UndoSubmit { channel_id, .. } => channel_id,
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            InboundMessage::Start { thread_id, .. }
            | InboundMessage::CommitDate { thread_id, .. }
            | InboundMessage::UserReply { thread_id, .. }
            | InboundMessage::StageAction { thread_id, .. }
            | InboundMessage::ConfirmSubmit { thread_id, .. }
            | InboundMessage::CancelSubmit { thread_id, .. }
            | InboundMessage::UndoSubmit { thread_id, .. } => thread_id,
        }
    }
}

/// Returned from every `SessionController::handle` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub thread_id: String,
    pub stage: Stage,
    pub text: String,
    pub stage_ready: bool,
    pub completed: bool,
    #[serde(default)]
    pub question: Option<String>,
}
