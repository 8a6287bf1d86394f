//! Stage Graph / Session Controller (spec §4.10): the `TurnInit -> Decision
//! -> Transition -> (stage node) -> Presenter` turn pipeline, wired against
//! a [`SessionRegistry`], a durable [`ConstraintStore`], a
//! [`CalendarCapability`], and an [`Observer`].
//!
//! Grounded in the teacher's `scheduler.rs` message-driven dispatch loop for
//! the turn pipeline's shape, and its `state.rs`-style single owning struct
//! for the controller's dependency bundle.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::calendar::CalendarCapability;
use crate::config::{Config, TimeoutTable};
use crate::constraint::{ConstraintRecord, ConstraintSource, ConstraintStatus};
use crate::constraint_retriever::{exclude_suppressed, retrieve_constraints, RoutingContext};
use crate::constraint_store::ConstraintStore;
use crate::error::{Result, TimeboxError};
use crate::extractors::{
    ChatCompletionClient, ConstraintExtractor, ConstraintExtractorInput, ConstraintInterpreterExtractor,
    ConstraintInterpreterInput, Decision, DecisionAction, DecisionExtractor, DecisionInput, Extractor,
    PatchGenerator, PlannedDateExtractor, PlannedDateInput, SkeletonExtractor, SkeletonInput, StageGateExtractor,
    StageGateInput, StageGateResult,
};
use crate::interface::{InboundMessage, OutboundMessage};
use crate::observer::{Observer, UpdateRecord};
use crate::patch_ops::Patch;
use crate::patcher::{apply_patch, ApplyPatchInput};
use crate::session::{Session, SessionKey, SessionRegistry, ThreadState};
use crate::stage::Stage;
use crate::sync::{execute_sync, plan_sync, undo_sync, TransactionStatus};
use crate::time_model::Plan;

/// Bounds concurrent background work per spec §4.10.2/§5: durable prefetch,
/// durable upsert, and extraction each get their own semaphore so one
/// class's backlog never starves another.
pub struct PrefetchCoordinator {
    durable_prefetch: Semaphore,
    durable_upsert: Semaphore,
    extraction: Semaphore,
}

impl PrefetchCoordinator {
    pub fn new(config: &Config) -> Self {
        PrefetchCoordinator {
            durable_prefetch: Semaphore::new(config.durable_prefetch_concurrency),
            durable_upsert: Semaphore::new(config.durable_upsert_concurrency),
            extraction: Semaphore::new(config.extraction_concurrency),
        }
    }
}

fn parse_action(raw: &str) -> DecisionAction {
    match raw {
        "proceed" => DecisionAction::Proceed,
        "back" => DecisionAction::Back,
        "redo" => DecisionAction::Redo,
        "cancel" => DecisionAction::Cancel,
        "assist" => DecisionAction::Assist,
        _ => DecisionAction::ProvideInfo,
    }
}

/// Builds the event-type routing context the retriever needs from whatever
/// the session already knows about the day (spec §4.7).
fn routing_context(session: &Session) -> RoutingContext {
    RoutingContext {
        has_immovables: !session.frame_facts.immovables.is_empty(),
        has_commutes: !session.frame_facts.commutes.is_empty(),
        has_sleep_target: session.frame_facts.sleep_target.is_some(),
        has_habits: !session.frame_facts.habits.is_empty(),
        has_gaps: session.frame_facts.work_window.is_some()
            && (!session.frame_facts.immovables.is_empty() || session.input_facts.block_plan.is_some()),
    }
}

fn facts_to_value(session: &Session) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "planned_date".to_string(),
        session.planned_date.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null),
    );
    map.insert("frame_facts".to_string(), serde_json::to_value(&session.frame_facts).unwrap_or(Value::Null));
    map.insert("input_facts".to_string(), serde_json::to_value(&session.input_facts).unwrap_or(Value::Null));
    if let Some(plan) = &session.plan {
        map.insert("plan".to_string(), serde_json::to_value(plan).unwrap_or(Value::Null));
    }
    map
}

/// The Session Controller: owns no session state itself (that lives in
/// `SessionRegistry`/`Session`), only the shared dependencies every turn
/// needs.
pub struct SessionController<C: ChatCompletionClient + Clone + Send + Sync + 'static> {
    pub registry: SessionRegistry,
    store: Arc<dyn ConstraintStore>,
    calendar: Arc<dyn CalendarCapability>,
    observer: Observer,
    config: Config,
    timeouts: TimeoutTable,
    prefetch: Arc<PrefetchCoordinator>,
    decision: DecisionExtractor<C>,
    stage_gate: StageGateExtractor<C>,
    planned_date: PlannedDateExtractor<C>,
    constraint_interpreter: ConstraintInterpreterExtractor<C>,
    constraint_extractor: ConstraintExtractor<C>,
    patch_generator: PatchGenerator<C>,
    skeleton: SkeletonExtractor<C>,
}

impl<C: ChatCompletionClient + Clone + Send + Sync + 'static> SessionController<C> {
    pub fn new(
        client: C,
        store: Arc<dyn ConstraintStore>,
        calendar: Arc<dyn CalendarCapability>,
        observer: Observer,
        config: Config,
    ) -> Self {
        let prefetch = Arc::new(PrefetchCoordinator::new(&config));
        SessionController {
            registry: SessionRegistry::new(),
            store,
            calendar,
            observer,
            timeouts: TimeoutTable::default(),
            config,
            prefetch,
            decision: DecisionExtractor::new(client.clone()),
            stage_gate: StageGateExtractor::new(client.clone()),
            planned_date: PlannedDateExtractor::new(client.clone()),
            constraint_interpreter: ConstraintInterpreterExtractor::new(client.clone()),
            constraint_extractor: ConstraintExtractor::new(client.clone()),
            patch_generator: PatchGenerator::new(client.clone()),
            skeleton: SkeletonExtractor::new(client),
        }
    }

    /// Transport-agnostic entry point (spec §6).
    pub async fn handle(&self, msg: InboundMessage) -> OutboundMessage {
        let channel_id = msg.channel_id().to_string();
        let thread_id = msg.thread_id().to_string();
        let key = SessionKey::new(channel_id.clone(), thread_id.clone());

        match msg {
            InboundMessage::Start { user_id, .. } => {
                self.registry.start(key, user_id);
                OutboundMessage {
                    channel_id,
                    thread_id,
                    stage: Stage::CollectConstraints,
                    text: "Which day should we plan?".to_string(),
                    stage_ready: false,
                    completed: false,
                    question: None,
                }
            }
            InboundMessage::CommitDate { date_text, .. } => self.handle_commit_date(key, date_text).await,
            InboundMessage::UserReply { text, .. } => self.handle_turn_with_timeout(key, text, None).await,
            InboundMessage::StageAction { action, .. } => {
                self.handle_turn_with_timeout(key, String::new(), Some(parse_action(&action))).await
            }
            InboundMessage::ConfirmSubmit { .. } => self.handle_confirm_submit(key).await,
            InboundMessage::CancelSubmit { .. } => self.handle_cancel_submit(key).await,
            InboundMessage::UndoSubmit { .. } => self.handle_undo_submit(key).await,
        }
    }

    fn missing_session(&self, key: &SessionKey) -> OutboundMessage {
        OutboundMessage {
            channel_id: key.channel_id.clone(),
            thread_id: key.thread_id.clone(),
            stage: Stage::CollectConstraints,
            text: "No active session for this thread — say hello to start one.".to_string(),
            stage_ready: false,
            completed: false,
            question: None,
        }
    }

    async fn handle_commit_date(&self, key: SessionKey, date_text: String) -> OutboundMessage {
        let Some(session_lock) = self.registry.get(&key) else {
            return self.missing_session(&key);
        };
        let mut session = session_lock.lock().await;
        session.last_user_message = date_text.clone();

        let input = PlannedDateInput { user_utterance: &date_text, now: Utc::now(), timezone: "UTC" };
        let outcome = tokio::time::timeout(self.timeouts.planned_date_extractor, self.planned_date.extract(input)).await;

        let text = match outcome {
            Ok(Ok(result)) if result.planned_date.is_some() => {
                let date = result.planned_date.unwrap();
                session.planned_date = Some(date);
                session.timezone = result.timezone.or_else(|| Some("UTC".to_string()));
                session.frame_facts.date = Some(date);
                format!("Planning for {date}. Tell me about your immovables, commutes, sleep target, and habits for that day.")
            }
            Ok(Ok(_)) => "I couldn't pin down a specific day from that — could you name one explicitly (e.g. \"tomorrow\" or a date)?".to_string(),
            Ok(Err(err)) => {
                warn!(error = %err, "planned-date extraction failed");
                "I hit an issue reading that date — could you try rephrasing it?".to_string()
            }
            Err(_) => {
                warn!("planned-date extraction timed out");
                "That took too long to process — could you try again?".to_string()
            }
        };

        OutboundMessage {
            channel_id: key.channel_id,
            thread_id: key.thread_id,
            stage: session.stage,
            text,
            stage_ready: session.planned_date.is_some(),
            completed: false,
            question: None,
        }
    }

    /// The outermost guard named in spec §5: bounds the whole
    /// `TurnInit -> ... -> Presenter` pipeline with `timeouts.graph_turn`.
    /// On expiry the in-flight turn is cancelled and a deterministic
    /// "processing timeout" reply is returned instead of hanging or
    /// propagating a panic; a `graph_turn_timeout` event is logged.
    async fn handle_turn_with_timeout(
        &self,
        key: SessionKey,
        text: String,
        forced_action: Option<DecisionAction>,
    ) -> OutboundMessage {
        let fallback_stage = match self.registry.get(&key) {
            Some(session_lock) => session_lock.lock().await.stage,
            None => Stage::CollectConstraints,
        };
        match tokio::time::timeout(self.timeouts.graph_turn, self.handle_turn(key.clone(), text, forced_action)).await {
            Ok(outbound) => outbound,
            Err(_) => {
                warn!(channel = %key.channel_id, thread = %key.thread_id, event = "graph_turn_timeout", "graph turn timed out");
                OutboundMessage {
                    channel_id: key.channel_id,
                    thread_id: key.thread_id,
                    stage: fallback_stage,
                    text: "That took too long to process — please try again.".to_string(),
                    stage_ready: false,
                    completed: false,
                    question: None,
                }
            }
        }
    }

    /// The core `TurnInit -> Decision -> Transition -> stage node ->
    /// Presenter` pipeline (spec §4.10). Instrumented as one span per turn
    /// so per-session debug logging (spec §4.10.3) and `tracing` output
    /// share the same channel/thread/stage context.
    #[tracing::instrument(skip(self, text, forced_action), fields(channel = %key.channel_id, thread = %key.thread_id))]
    async fn handle_turn(&self, key: SessionKey, text: String, forced_action: Option<DecisionAction>) -> OutboundMessage {
        let Some(session_lock) = self.registry.get(&key) else {
            return self.missing_session(&key);
        };
        let mut session = session_lock.lock().await;

        if !text.is_empty() {
            session.last_user_message = text.clone();
        }
        if session.thread_state != ThreadState::Active {
            return OutboundMessage {
                channel_id: key.channel_id,
                thread_id: key.thread_id,
                stage: session.stage,
                text: "This thread has already finished — start a new one to plan again.".to_string(),
                stage_ready: session.stage_ready,
                completed: session.completed,
                question: None,
            };
        }

        // TurnInit: opportunistically queue a durable constraint interpreter
        // pass so an explicit "in general" rule is captured even if it
        // doesn't change this turn's stage gate outcome.
        if !text.is_empty() {
            self.maybe_extract_durable_constraint(&mut session, &text).await;
        }

        // Decision
        let decision = if let Some(action) = forced_action {
            Decision { action, target_stage: None, note: None }
        } else {
            let input = DecisionInput { stage_id: session.stage.as_str(), stage_ready: session.stage_ready, user_message: &text };
            match tokio::time::timeout(self.timeouts.decision_router, self.decision.extract(input)).await {
                Ok(Ok(decision)) => decision,
                Ok(Err(err)) => {
                    warn!(error = %err, "decision routing failed, defaulting to provide_info");
                    Decision::provide_info("decision router error")
                }
                Err(_) => {
                    warn!("decision routing timed out, defaulting to provide_info");
                    Decision::provide_info("decision router timeout")
                }
            }
        };

        // Transition
        let mut presenter_text: Option<String> = None;
        match decision.action {
            DecisionAction::Cancel => {
                session.thread_state = ThreadState::Canceled;
                session.completed = true;
                presenter_text = Some("Cancelled — this thread is now closed.".to_string());
            }
            DecisionAction::Back => {
                if let Some(previous) = session.stage.previous() {
                    session.advance_stage(previous);
                } else {
                    presenter_text = Some("Already at the first stage.".to_string());
                }
            }
            DecisionAction::Redo => {
                session.force_stage_rerun = true;
            }
            DecisionAction::Proceed => {
                if session.stage_ready {
                    match session.stage.next() {
                        Some(next) => session.advance_stage(next),
                        None => {
                            session.pending_submit = true;
                            presenter_text = Some(
                                "Ready to commit this plan to your calendar — reply confirm to submit, or cancel to hold off."
                                    .to_string(),
                            );
                        }
                    }
                } else {
                    presenter_text = Some(format!(
                        "Not ready to move on yet: {}",
                        session.stage_missing.join("; ")
                    ));
                }
            }
            DecisionAction::ProvideInfo | DecisionAction::Assist => {}
        }

        // Stage node
        if session.thread_state == ThreadState::Active && presenter_text.is_none() {
            self.run_stage_node(&mut session).await;
        }

        let outbound_text = presenter_text
            .or_else(|| session.last_response_override.take())
            .or_else(|| session.stage_question.clone())
            .unwrap_or_else(|| format!("Stage `{}` updated.", session.stage));

        self.publish_update(&session, &text);
        info!(stage = %session.stage, ready = session.stage_ready, action = ?decision.action, "turn complete");
        self.append_debug_log(
            &mut session,
            &format!("action={:?} stage={} ready={} text={:?}", decision.action, session.stage, session.stage_ready, outbound_text),
        )
        .await;

        OutboundMessage {
            channel_id: key.channel_id,
            thread_id: key.thread_id,
            stage: session.stage,
            text: outbound_text,
            stage_ready: session.stage_ready,
            completed: session.completed,
            question: session.stage_question.clone(),
        }
    }

    /// Runs the stage gate for the session's current stage, then whatever
    /// stage-specific work follows a ready/ongoing gate (spec §4.10.1).
    async fn run_stage_node(&self, session: &mut Session) {
        // "Ensure on stage entry" (spec §4.10.2): wait for this stage's
        // durable constraints before running it, but never block forever —
        // on timeout the stage proceeds with whatever was already cached.
        self.ensure_durable_constraints_loaded(session).await;

        let facts = facts_to_value(session);
        let input = StageGateInput { stage_id: session.stage.as_str(), user_message: &session.last_user_message, context_facts: &facts };

        let gate_result = match tokio::time::timeout(self.timeouts.stage_gate, self.stage_gate.extract(input)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(error = %err, stage = %session.stage, "stage gate extraction failed");
                StageGateResult::safe_fallback(session.stage.as_str(), "extractor_error")
            }
            Err(_) => {
                warn!(stage = %session.stage, "stage gate timed out");
                StageGateResult::safe_fallback(session.stage.as_str(), "timeout")
            }
        };

        session.stage_ready = gate_result.ready;
        session.stage_missing = gate_result.missing.clone();
        session.stage_question = gate_result.question.clone();
        session.last_response_override = gate_result.response_message.clone();
        session.last_gate_output.insert(session.stage.as_str().to_string(), gate_result.clone());
        session.force_stage_rerun = false;

        match session.stage {
            Stage::CollectConstraints => {
                self.apply_collect_constraints_defaults(session);
            }
            Stage::Skeleton if session.plan.is_none() && gate_result.ready => {
                self.seed_skeleton(session).await;
            }
            Stage::Refine if session.plan.is_some() && !session.last_user_message.is_empty() => {
                self.refine_plan(session).await;
            }
            _ => {}
        }

        self.spawn_durable_prefetch(session).await;
    }

    /// CollectConstraintsNode durable-default normalization (spec §4.10.1,
    /// §8 scenario 6): if the gate's only missing items are ones a saved
    /// durable default covers (currently: a sleep target), promote the
    /// default into `frame_facts`, mark the gate ready, and reword the
    /// question. An explicit user override of a defaulted field instead
    /// records that field's durable `uid` in `suppressed_durable_uids` so
    /// future passes treat the session value as authoritative.
    fn apply_collect_constraints_defaults(&self, session: &mut Session) {
        if !session.last_user_message.is_empty() {
            let lower = session.last_user_message.to_lowercase();
            if let Some(uid) = session.defaulted_durable_uids.get("sleep_target").cloned() {
                if lower.contains("sleep") {
                    session.suppressed_durable_uids.push(uid);
                    session.defaulted_durable_uids.remove("sleep_target");
                    return;
                }
            }
        }

        if session.stage_ready || session.stage_missing.is_empty() {
            return;
        }

        let stage_key = Stage::CollectConstraints.as_str();
        let defaults = session.durable_constraints_by_stage.get(stage_key).cloned().unwrap_or_default();
        let Some(sleep_default) = defaults.iter().find(|r| r.rule_kind == "sleep_window") else { return };
        if session.suppressed_durable_uids.contains(&sleep_default.uid) {
            return;
        }

        let covers_all_missing = session.stage_missing.iter().all(|item| item.to_lowercase().contains("sleep"));
        if !covers_all_missing {
            return;
        }

        let window_text = sleep_default
            .windows
            .first()
            .map(|w| format!("{} to {}", w.start, w.end))
            .unwrap_or_default();
        session.frame_facts.sleep_target = Some(window_text.clone());
        session.stage_ready = true;
        session.stage_missing.clear();
        session.stage_question =
            Some(format!("Using your saved defaults (sleep {window_text})… reply to override or proceed."));
        session.defaulted_durable_uids.insert("sleep_target".to_string(), sleep_default.uid.clone());
    }

    /// Blocks (bounded by `durable_store_query`) on the current stage's
    /// durable constraints being loaded if they aren't cached yet (spec
    /// §4.10.2 "Ensure on stage entry"). A timeout just leaves the stage to
    /// proceed with whatever was already cached — it never fails the turn.
    async fn ensure_durable_constraints_loaded(&self, session: &mut Session) {
        let stage = session.stage;
        if session.durable_constraints_loaded_stages.contains(stage.as_str()) {
            return;
        }
        if session.planned_date.is_none() {
            return;
        }
        let ctx = routing_context(session);
        if let Err(err) = self.load_durable_constraints(session, stage, &ctx).await {
            warn!(error = %err, stage = %stage, "failed to load durable constraints for current stage");
        }
    }

    /// Renders the Markdown overview and the seed Plan once the Skeleton
    /// gate first reports ready (spec §4.10.1 SkeletonNode): two separate
    /// calls, driven by the session's collected facts rather than a
    /// hard-coded anchor. The Markdown becomes the user-facing presenter
    /// text; the Plan becomes `session.plan`/`session.base_snapshot`.
    async fn seed_skeleton(&self, session: &mut Session) {
        let Some(date) = session.planned_date else { return };
        let tz = session.timezone.clone().unwrap_or_else(|| "UTC".to_string());
        let frame_facts_json = serde_json::to_string(&session.frame_facts).unwrap_or_default();
        let input_facts_json = serde_json::to_string(&session.input_facts).unwrap_or_default();
        let input = SkeletonInput {
            planned_date: date,
            timezone: &tz,
            frame_facts_json: &frame_facts_json,
            input_facts_json: &input_facts_json,
            fallback_block_minutes: self.config.fallback_skeleton_block_minutes,
        };

        match tokio::time::timeout(self.timeouts.skeleton_generator, self.skeleton.render_overview(&input)).await {
            Ok(Ok(markdown)) => session.last_response_override = Some(markdown),
            Ok(Err(err)) => warn!(error = %err, "skeleton overview generation failed"),
            Err(_) => warn!("skeleton overview generation timed out"),
        }

        match tokio::time::timeout(self.timeouts.skeleton_generator, self.skeleton.generate_seed_plan(&input)).await {
            Ok(Ok(plan)) => {
                session.base_snapshot = Some(plan.clone());
                session.plan = Some(plan);
            }
            Ok(Err(err)) => {
                warn!(error = %err, "seed plan generation failed, falling back to a minimal anchor");
                self.seed_fallback_plan(session, date, &tz);
            }
            Err(_) => {
                warn!("seed plan generation timed out, falling back to a minimal anchor");
                self.seed_fallback_plan(session, date, &tz);
            }
        }
    }

    /// A deterministic minimal-anchor Plan used only when the seed-Plan LLM
    /// call itself fails or times out (spec §7 "the system always returns a
    /// reply" — Skeleton must still produce something editable). Sized off
    /// `fallback_skeleton_block_minutes` rather than a hard-coded duration.
    fn seed_fallback_plan(&self, session: &mut Session, date: NaiveDate, tz: &str) {
        use crate::time_model::{EventType, IsoDuration, PlanEvent, Timing};

        let work_start = session
            .frame_facts
            .work_window
            .as_ref()
            .and_then(|w| w.split('-').next())
            .and_then(|s| chrono::NaiveTime::parse_from_str(s.trim(), "%H:%M").ok())
            .unwrap_or_else(|| chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        let anchor = PlanEvent::new(
            "Deep Work",
            "",
            EventType::DeepWork,
            Timing::FixedStart {
                st: work_start,
                dur: IsoDuration::from_minutes(self.config.fallback_skeleton_block_minutes.max(1)),
            },
        );
        if let Ok(anchor) = anchor {
            if let Ok(plan) = Plan::new(vec![anchor], date, tz) {
                session.base_snapshot = Some(plan.clone());
                session.plan = Some(plan);
            }
        }
    }

    /// Runs the patch loop against the user's latest message (spec §4.10.1
    /// RefineNode).
    async fn refine_plan(&self, session: &mut Session) {
        let Some(current_plan) = session.plan.clone() else { return };
        let constraints_table = session
            .durable_constraints_by_stage
            .get(Stage::Refine.as_str())
            .map(|records| {
                records
                    .iter()
                    .map(|r| format!("- {} ({:?})", r.name, r.necessity))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let recent_actions = session.patch_history.iter().map(|_| "patch".to_string()).collect::<Vec<_>>().join(", ");

        let input = ApplyPatchInput {
            current_plan: &current_plan,
            user_message: &session.last_user_message,
            constraints_table: &constraints_table,
            recent_actions_log: &recent_actions,
            max_attempts: None,
        };

        match tokio::time::timeout(self.timeouts.patch_generator, apply_patch(&self.patch_generator, input, None)).await {
            Ok(Ok((new_plan, patch))) => {
                session.plan = Some(new_plan);
                self.append_patch_history(session, patch);
            }
            Ok(Err(err)) => {
                warn!(error = %err, "patch loop exhausted without a valid plan");
                session.last_response_override =
                    Some("I couldn't make that edit without breaking the plan's constraints — could you rephrase it?".to_string());
            }
            Err(_) => {
                warn!("patch loop timed out");
                session.last_response_override = Some("That edit took too long to process — could you try again?".to_string());
            }
        }
    }

    fn append_patch_history(&self, session: &mut Session, patch: Patch) {
        session.patch_history.push(patch);
    }

    /// Opportunistically interprets a user message for a durable "in
    /// general" rule and upserts it, without blocking the turn on the
    /// result (spec §4.8 `QueuedAck` fire-and-forget shape; here modeled
    /// in-line rather than as a literal background task, since the
    /// extraction semaphore already bounds concurrency per turn).
    async fn maybe_extract_durable_constraint(&self, session: &mut Session, text: &str) {
        let permit = self.prefetch.extraction.try_acquire();
        if permit.is_err() {
            return;
        }
        let input = ConstraintInterpreterInput { user_message: text };
        let interpretation = match self.constraint_interpreter.extract(input).await {
            Ok(result) if result.should_extract => result,
            _ => return,
        };

        let Some(date) = session.planned_date else { return };
        let tz = session.timezone.clone().unwrap_or_else(|| "UTC".to_string());
        for base in interpretation.constraints {
            let extractor_input = ConstraintExtractorInput {
                user_utterance: text,
                planned_date: date,
                timezone: &tz,
                stage_id: session.stage.as_str(),
                impacted_event_types: &[],
                suggested_tags: &[],
            };
            let extracted = match self.constraint_extractor.extract(extractor_input).await {
                Ok(extracted) => extracted,
                Err(err) => {
                    warn!(error = %err, "constraint extraction failed");
                    continue;
                }
            };
            let record = ConstraintRecord {
                uid: String::new(),
                name: extracted.name.clone(),
                description: base.description.clone(),
                necessity: base.necessity,
                status: ConstraintStatus::Proposed,
                source: ConstraintSource::User,
                confidence: None,
                scope: interpretation.scope.unwrap_or(crate::constraint::ConstraintScope::Session),
                start_date: interpretation.start_date,
                end_date: interpretation.end_date,
                days_of_week: Vec::new(),
                timezone: Some(tz.clone()),
                recurrence: None,
                ttl_days: None,
                applies_stages: vec![session.stage.as_str().to_string()],
                applies_event_types: extracted.applies_event_types,
                topics: Vec::new(),
                tags: extracted.tags,
                rule_kind: extracted.rule_kind,
                scalar_params: Default::default(),
                windows: Vec::new(),
                supersedes_uids: Vec::new(),
                updated_at: None,
            };
            if let Err(err) = self.store.upsert_constraint(record).await {
                warn!(error = %err, "failed to upsert durable constraint");
            }
        }
    }

    /// Spawns a background prefetch of the next stage's durable constraints
    /// so they're already warm when the user transitions (spec §4.10.2).
    async fn spawn_durable_prefetch(&self, session: &mut Session) {
        let Some(next) = session.stage.next() else { return };
        if session.durable_constraints_loaded_stages.contains(next.as_str()) {
            return;
        }
        let Some(date) = session.planned_date else { return };
        let Ok(_permit) = self.prefetch.durable_prefetch.try_acquire() else { return };
        let ctx = routing_context(session);
        // A real deployment would spawn this onto `tokio::spawn` and stash
        // the `JoinHandle` in `session.prefetch_tasks`; kept inline here so
        // the session lock scope (already held by the caller) doesn't need
        // to be re-acquired from within a detached task.
        match self.fetch_durable_constraints(next, date, &ctx).await {
            Ok(records) => self.cache_durable_constraints(session, next, records),
            Err(err) => warn!(error = %err, stage = %next, "failed to prefetch durable constraints for next stage"),
        }
        session.prefetch_tasks.remove(next.as_str());
    }

    async fn handle_confirm_submit(&self, key: SessionKey) -> OutboundMessage {
        let Some(session_lock) = self.registry.get(&key) else {
            return self.missing_session(&key);
        };
        let mut session = session_lock.lock().await;

        if session.stage != Stage::ReviewCommit || !session.pending_submit {
            return OutboundMessage {
                channel_id: key.channel_id,
                thread_id: key.thread_id,
                stage: session.stage,
                text: "There's nothing staged to confirm right now.".to_string(),
                stage_ready: session.stage_ready,
                completed: session.completed,
                question: None,
            };
        }

        let Some(plan) = session.plan.clone() else {
            return OutboundMessage {
                channel_id: key.channel_id,
                thread_id: key.thread_id,
                stage: session.stage,
                text: "No plan to submit.".to_string(),
                stage_ready: false,
                completed: false,
                question: None,
            };
        };

        let calendar_id = key.channel_id.clone();
        let remote = match tokio::time::timeout(
            self.timeouts.calendar_rpc,
            self.calendar.list_day_events(&calendar_id, plan.date, &plan.tz),
        )
        .await
        {
            Ok(Ok(snapshot)) => snapshot.events,
            _ => Vec::new(),
        };

        let ops = match plan_sync(
            &remote,
            &plan,
            &session.event_id_map,
            Some(&session.remote_event_ids_by_index),
            &calendar_id,
            self.config.fuzzy_reconciliation_tolerance_minutes,
        ) {
            Ok(ops) => ops,
            Err(err) => {
                return OutboundMessage {
                    channel_id: key.channel_id,
                    thread_id: key.thread_id,
                    stage: session.stage,
                    text: format!("Couldn't reconcile the plan against your calendar: {err}"),
                    stage_ready: session.stage_ready,
                    completed: false,
                    question: None,
                };
            }
        };

        let txn = execute_sync(self.calendar.as_ref(), &calendar_id, ops, true).await;
        let status = txn.status;
        session.last_sync_transaction = Some(txn);
        session.pending_submit = false;

        let text = match status {
            TransactionStatus::Committed => {
                session.committed = true;
                session.completed = true;
                session.thread_state = ThreadState::Completed;
                "Plan committed to your calendar.".to_string()
            }
            TransactionStatus::PartialHalted | TransactionStatus::Partial => {
                "Some changes didn't make it to your calendar — say undo to roll back what did apply.".to_string()
            }
            _ => "Submission finished in an unexpected state.".to_string(),
        };

        self.publish_update(&session, "confirm");

        OutboundMessage {
            channel_id: key.channel_id,
            thread_id: key.thread_id,
            stage: session.stage,
            text,
            stage_ready: session.stage_ready,
            completed: session.completed,
            question: None,
        }
    }

    async fn handle_cancel_submit(&self, key: SessionKey) -> OutboundMessage {
        let Some(session_lock) = self.registry.get(&key) else {
            return self.missing_session(&key);
        };
        let mut session = session_lock.lock().await;
        session.pending_submit = false;
        OutboundMessage {
            channel_id: key.channel_id,
            thread_id: key.thread_id,
            stage: session.stage,
            text: "Held off on submitting — keep editing or say confirm when ready.".to_string(),
            stage_ready: session.stage_ready,
            completed: session.completed,
            question: None,
        }
    }

    async fn handle_undo_submit(&self, key: SessionKey) -> OutboundMessage {
        let Some(session_lock) = self.registry.get(&key) else {
            return self.missing_session(&key);
        };
        let mut session = session_lock.lock().await;

        let Some(last_txn) = session.last_sync_transaction.clone() else {
            return OutboundMessage {
                channel_id: key.channel_id,
                thread_id: key.thread_id,
                stage: session.stage,
                text: "Nothing to undo.".to_string(),
                stage_ready: session.stage_ready,
                completed: session.completed,
                question: None,
            };
        };

        let text = match undo_sync(self.calendar.as_ref(), &last_txn).await {
            Ok(undone) => {
                session.last_sync_transaction = Some(undone);
                session.committed = false;
                session.completed = false;
                session.thread_state = ThreadState::Active;
                "Reverted the last submission.".to_string()
            }
            Err(err) => format!("Couldn't undo: {err}"),
        };

        OutboundMessage {
            channel_id: key.channel_id,
            thread_id: key.thread_id,
            stage: session.stage,
            text,
            stage_ready: session.stage_ready,
            completed: session.completed,
            question: None,
        }
    }

    fn publish_update(&self, session: &Session, user_message: &str) {
        self.observer.publish(UpdateRecord {
            thread_ts: session.key.thread_id.clone(),
            channel_id: session.key.channel_id.clone(),
            user_id: session.user_id.clone(),
            user_message: user_message.to_string(),
            constraints: session.durable_constraints_by_stage.values().flatten().cloned().collect(),
            plan: session.plan.clone(),
            actions: vec![format!("stage:{}", session.stage)],
            patch_history: session.patch_history.clone(),
        });
    }

    /// Per-session debug logger (spec §4.10.3: "created on first use and
    /// closed on session completion"). A no-op unless `TIMEBOX_DEBUG_LOG_DIR`
    /// is configured; appends one line per turn to a file scoped to this
    /// session's key, lazily opened the first time a turn touches it.
    async fn append_debug_log(&self, session: &mut Session, line: &str) {
        let Some(dir) = &self.config.debug_log_dir else {
            return;
        };
        if session.debug_log_path.is_none() {
            session.debug_log_path = Some(format!("{dir}/{}_{}.log", session.key.channel_id, session.key.thread_id));
        }
        let path = session.debug_log_path.clone().expect("just set above");

        use tokio::io::AsyncWriteExt;
        let opened = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await;
        match opened {
            Ok(mut file) => {
                if let Err(err) = file.write_all(format!("{line}\n").as_bytes()).await {
                    warn!(error = %err, path = %path, "failed writing session debug log");
                }
            }
            Err(err) => {
                warn!(error = %err, path = %path, "failed opening session debug log");
            }
        }
    }

    /// Pulls durable constraints for `stage` through the retriever and
    /// caches them on the session, honoring any suppressed uids the user
    /// has since declined (spec §4.7, §4.10.1).
    pub async fn load_durable_constraints(&self, session: &mut Session, stage: Stage, ctx: &RoutingContext) -> Result<()> {
        let Some(date) = session.planned_date else {
            return Err(TimeboxError::Validation(crate::error::ValidationError::NoAnchor));
        };
        let _permit = self
            .prefetch
            .durable_prefetch
            .acquire()
            .await
            .map_err(|_| TimeboxError::BackendUnavailable { label: "prefetch".into(), reason: "semaphore closed".into() })?;
        let records = self.fetch_durable_constraints(stage, date, ctx).await?;
        self.cache_durable_constraints(session, stage, records);
        info!(stage = %stage, "loaded durable constraints");
        Ok(())
    }

    /// The bare store query behind both `load_durable_constraints` (blocking
    /// acquire, used to "ensure" the current stage's constraints are ready)
    /// and `spawn_durable_prefetch` (non-blocking `try_acquire`, used to
    /// opportunistically warm the next stage) — factored out so neither path
    /// acquires the prefetch semaphore twice for one query.
    async fn fetch_durable_constraints(&self, stage: Stage, date: NaiveDate, ctx: &RoutingContext) -> Result<Vec<ConstraintRecord>> {
        tokio::time::timeout(self.timeouts.durable_store_query, retrieve_constraints(self.store.as_ref(), stage, date, ctx))
            .await
            .map_err(|_| TimeboxError::BackendTimeout { label: "durable-store-query".into() })?
    }

    fn cache_durable_constraints(&self, session: &mut Session, stage: Stage, records: Vec<ConstraintRecord>) {
        let filtered = exclude_suppressed(records, &session.suppressed_durable_uids);
        session.durable_constraints_by_stage.insert(stage.as_str().to_string(), filtered);
        session.durable_constraints_loaded_stages.insert(stage.as_str().to_string());
    }
}
