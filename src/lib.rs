//! `daybox_core`: a conversational day-planning (timeboxing) engine.
//!
//! A five-stage session controller (`CollectConstraints -> CaptureInputs ->
//! Skeleton -> Refine -> ReviewCommit`) turns free-text chat into a typed
//! `Plan`, edits it through a deterministic patch loop, and reconciles it
//! against an external calendar through a reversible sync transaction. A
//! durable constraint store remembers "in general" scheduling rules across
//! sessions.

pub mod calendar;
pub mod config;
pub mod constraint;
pub mod constraint_retriever;
pub mod constraint_store;
pub mod error;
pub mod extractors;
pub mod interface;
pub mod json_recovery;
pub mod observer;
pub mod patch_ops;
pub mod patcher;
pub mod reconcile;
pub mod session;
pub mod stage;
pub mod stage_graph;
pub mod sync;
pub mod time_model;

pub use calendar::{CalendarCapability, HttpCalendarCapability};
pub use config::Config;
pub use constraint::ConstraintRecord;
pub use constraint_store::{ConstraintStore, InMemoryConstraintStore};
pub use error::{PublicError, Result, TimeboxError};
pub use extractors::ChatCompletionClient;
pub use interface::{InboundMessage, OutboundMessage};
pub use observer::Observer;
pub use session::{Session, SessionKey, SessionRegistry};
pub use stage::Stage;
pub use stage_graph::SessionController;
pub use time_model::Plan;

/// Initializes the process-wide `tracing` subscriber from `RUST_LOG`,
/// defaulting to `info`. Safe to call more than once; later calls are
/// no-ops once a global subscriber is installed.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
