//! Session (spec §3): per-thread state for one planning conversation, plus
//! the process-wide session registry.
//!
//! Grounded in the teacher's `dashmap`-backed Glean context cache (ADR-0095):
//! one `Arc<tokio::sync::Mutex<Session>>` per `(channel, thread)`, registered
//! in a `DashMap` so concurrent threads proceed independently while turns
//! within one thread serialize on the per-session mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::calendar::RemoteEvent;
use crate::constraint::ConstraintRecord;
use crate::extractors::StageGateResult;
use crate::patch_ops::Patch;
use crate::stage::Stage;
use crate::sync::SyncTransaction;
use crate::time_model::Plan;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel_id: String,
    pub thread_id: String,
}

impl SessionKey {
    pub fn new(channel_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        SessionKey { channel_id: channel_id.into(), thread_id: thread_id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Active,
    Canceled,
    Completed,
}

/// Frame facts collected in `CollectConstraints` (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameFacts {
    pub date: Option<NaiveDate>,
    pub timezone: Option<String>,
    pub work_window: Option<String>,
    pub sleep_target: Option<String>,
    pub immovables: Vec<String>,
    pub commutes: Vec<String>,
    pub habits: Vec<String>,
}

/// Facts collected in `CaptureInputs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputFacts {
    pub daily_one_thing: Option<String>,
    pub tasks: Vec<String>,
    pub block_plan: Option<String>,
}

/// Per-thread state machine for one planning conversation. Mutated only by
/// its owning turn; background tasks write only into the scratch fields
/// documented below (spec §4.10.3).
pub struct Session {
    pub key: SessionKey,
    pub user_id: String,
    pub debug_log_path: Option<String>,

    pub planned_date: Option<NaiveDate>,
    pub timezone: Option<String>,
    pub stage: Stage,
    pub committed: bool,
    pub completed: bool,
    pub thread_state: ThreadState,

    pub frame_facts: FrameFacts,
    pub input_facts: InputFacts,
    pub last_user_message: String,
    pub background_notes: Vec<String>,

    pub plan: Option<Plan>,
    pub base_snapshot: Option<Plan>,
    /// `(name|start_time)` -> external event id.
    pub event_id_map: HashMap<String, String>,
    pub remote_event_ids_by_index: Vec<String>,
    pub last_sync_transaction: Option<SyncTransaction>,
    pub patch_history: Vec<Patch>,

    pub stage_ready: bool,
    pub stage_missing: Vec<String>,
    pub stage_question: Option<String>,
    pub last_gate_output: HashMap<String, StageGateResult>,
    pub force_stage_rerun: bool,
    pub pending_presenter_blocks: Vec<String>,
    pub last_response_override: Option<String>,

    pub durable_constraints_by_stage: HashMap<String, Vec<ConstraintRecord>>,
    pub durable_constraints_loaded_stages: HashSet<String>,
    pub suppressed_durable_uids: Vec<String>,
    /// Field name -> durable uid for each CollectConstraints field currently
    /// filled in from a saved default rather than the user (spec §4.10.1).
    pub defaulted_durable_uids: HashMap<String, String>,

    pub pending_submit: bool,
    pub prefetched_remote_snapshots: HashMap<NaiveDate, Vec<RemoteEvent>>,

    /// Background tasks keyed by `(stage)` for this session (spec §9:
    /// "explicit task registries keyed by `(session, stage)`", the session
    /// dimension is implicit since each map lives inside its own session).
    pub prefetch_tasks: HashMap<String, JoinHandle<()>>,
}

impl Session {
    pub fn new(key: SessionKey, user_id: impl Into<String>) -> Self {
        Session {
            key,
            user_id: user_id.into(),
            debug_log_path: None,
            planned_date: None,
            timezone: None,
            stage: Stage::CollectConstraints,
            committed: false,
            completed: false,
            thread_state: ThreadState::Active,
            frame_facts: FrameFacts::default(),
            input_facts: InputFacts::default(),
            last_user_message: String::new(),
            background_notes: Vec::new(),
            plan: None,
            base_snapshot: None,
            event_id_map: HashMap::new(),
            remote_event_ids_by_index: Vec::new(),
            last_sync_transaction: None,
            patch_history: Vec::new(),
            stage_ready: false,
            stage_missing: Vec::new(),
            stage_question: None,
            last_gate_output: HashMap::new(),
            force_stage_rerun: false,
            pending_presenter_blocks: Vec::new(),
            last_response_override: None,
            durable_constraints_by_stage: HashMap::new(),
            durable_constraints_loaded_stages: HashSet::new(),
            suppressed_durable_uids: Vec::new(),
            defaulted_durable_uids: HashMap::new(),
            pending_submit: false,
            prefetched_remote_snapshots: HashMap::new(),
            prefetch_tasks: HashMap::new(),
        }
    }

    pub fn advance_stage(&mut self, target: Stage) {
        self.stage = target;
        self.stage_ready = false;
        self.stage_missing.clear();
        self.stage_question = None;
    }
}

/// Process-wide session registry (spec §5: `DashMap<SessionKey, Arc<Mutex<Session>>>`).
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionKey, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry { sessions: Arc::new(DashMap::new()) }
    }

    /// Start replaces any pre-existing session for the same key (spec §6:
    /// "Pre-existing sessions are replaced").
    pub fn start(&self, key: SessionKey, user_id: impl Into<String>) -> Arc<Mutex<Session>> {
        let session = Arc::new(Mutex::new(Session::new(key.clone(), user_id)));
        self.sessions.insert(key, session.clone());
        session
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(key).map(|entry| entry.clone())
    }

    pub fn get_or_start(&self, key: SessionKey, user_id: impl Into<String>) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        self.start(key, user_id)
    }

    pub fn remove(&self, key: &SessionKey) {
        self.sessions.remove(key);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_in_collect_constraints() {
        let session = Session::new(SessionKey::new("c1", "t1"), "u1");
        assert_eq!(session.stage, Stage::CollectConstraints);
        assert!(!session.committed);
        assert!(!session.completed);
    }

    #[tokio::test]
    async fn registry_start_replaces_existing_session() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("c1", "t1");
        let first = registry.start(key.clone(), "u1");
        {
            let mut guard = first.lock().await;
            guard.last_user_message = "hello".into();
        }
        let second = registry.start(key.clone(), "u1");
        let guard = second.lock().await;
        assert_eq!(guard.last_user_message, "");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn get_or_start_reuses_existing_session() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("c1", "t1");
        let first = registry.get_or_start(key.clone(), "u1");
        {
            let mut guard = first.lock().await;
            guard.last_user_message = "hi".into();
        }
        let second = registry.get_or_start(key, "u1");
        assert_eq!(second.lock().await.last_user_message, "hi");
    }
}
