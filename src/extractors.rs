//! LLM Extractors (spec §4.8): one `async_trait` per structured-output
//! contract, each rendering a prompt and calling an injected
//! [`ChatCompletionClient`]. Grounded in the teacher's `IntelligenceProvider`
//! async-trait-over-a-model-backend boundary; the JSON-recovery pipeline
//! (`crate::json_recovery`) and schema types here are free of any concrete
//! model wiring so they're fully testable against canned completion strings.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constraint::{ConstraintScope, Necessity};
use crate::error::{Result, TimeboxError};
use crate::json_recovery::recover_and_parse;
use crate::patch_ops::Patch;
use crate::time_model::Plan;

/// The out-of-scope LLM completion boundary. Grounded in the same async
/// `reqwest`-backed request/response idiom as `HttpCalendarCapability`,
/// rather than the teacher's blocking subprocess PTY transport, since the
/// Session Controller's turn pipeline is fully async (see DESIGN.md).
#[async_trait]
pub trait ChatCompletionClient: Send + Sync {
    /// Send a system + user prompt pair with a deadline; return the raw
    /// completion text. Implementations own their own retry/backoff.
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// One schema-enforcing extractor. `In` is the task-specific context bundle;
/// `Out` is the validated schema instance.
#[async_trait]
pub trait Extractor<In: Send + Sync, Out: Send + Sync>: Send + Sync {
    async fn extract(&self, input: In) -> Result<Out>;
}

fn truncate_feedback(message: String, byte_budget: usize) -> String {
    if message.len() <= byte_budget {
        return message;
    }
    let mut end = byte_budget;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}

// ---------------------------------------------------------------------
// Planned-date extractor
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlannedDateResult {
    pub planned_date: Option<NaiveDate>,
    pub confidence: Option<f64>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub explanation: Option<String>,
}

pub struct PlannedDateInput<'a> {
    pub user_utterance: &'a str,
    pub now: DateTime<Utc>,
    pub timezone: &'a str,
}

pub struct PlannedDateExtractor<C: ChatCompletionClient> {
    client: C,
}

impl<C: ChatCompletionClient> PlannedDateExtractor<C> {
    pub fn new(client: C) -> Self {
        PlannedDateExtractor { client }
    }
}

#[async_trait]
impl<C: ChatCompletionClient> Extractor<PlannedDateInput<'_>, PlannedDateResult> for PlannedDateExtractor<C> {
    async fn extract(&self, input: PlannedDateInput<'_>) -> Result<PlannedDateResult> {
        let system = "You infer a single planned date from a user's message. Never invent a date \
            you are not reasonably confident about; when uncertain, return null with low confidence.";
        let user = format!(
            "now={} timezone={} utterance={:?}",
            input.now.to_rfc3339(),
            input.timezone,
            input.user_utterance
        );
        let raw = self.client.complete(system, &user).await?;
        recover_and_parse(&raw)
    }
}

// ---------------------------------------------------------------------
// Constraint interpreter
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintBase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub necessity: Necessity,
    pub rule_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintInterpretation {
    pub should_extract: bool,
    #[serde(default)]
    pub scope: Option<ConstraintScope>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub constraints: Vec<ConstraintBase>,
}

pub struct ConstraintInterpreterInput<'a> {
    pub user_message: &'a str,
}

pub struct ConstraintInterpreterExtractor<C: ChatCompletionClient> {
    client: C,
}

impl<C: ChatCompletionClient> ConstraintInterpreterExtractor<C> {
    pub fn new(client: C) -> Self {
        ConstraintInterpreterExtractor { client }
    }
}

#[async_trait]
impl<C: ChatCompletionClient> Extractor<ConstraintInterpreterInput<'_>, ConstraintInterpretation> for ConstraintInterpreterExtractor<C> {
    async fn extract(&self, input: ConstraintInterpreterInput<'_>) -> Result<ConstraintInterpretation> {
        let system = "Decide whether the message states a durable scheduling rule (\"in general\", \
            \"always\", \"from now on\", an explicit date range). should_extract is true only then.";
        let raw = self.client.complete(system, input.user_message).await?;
        recover_and_parse(&raw)
    }
}

// ---------------------------------------------------------------------
// Stage gate
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageGateResult {
    pub stage_id: String,
    pub ready: bool,
    #[serde(default)]
    pub summary: Vec<String>,
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub facts: serde_json::Map<String, Value>,
    #[serde(default)]
    pub response_message: Option<String>,
}

impl StageGateResult {
    /// The safe-fallback gate output used whenever the stage-gate LLM call
    /// times out or its response can't be parsed (spec §7).
    pub fn safe_fallback(stage_id: &str, missing_reason: &str) -> Self {
        let mut facts = serde_json::Map::new();
        facts.insert("_stage_gate_error".to_string(), Value::String(missing_reason.to_string()));
        StageGateResult {
            stage_id: stage_id.to_string(),
            ready: false,
            summary: Vec::new(),
            missing: vec![missing_reason.to_string()],
            question: Some("We hit a backend issue gathering details for this stage — could you try again?".to_string()),
            facts,
            response_message: None,
        }
    }
}

pub struct StageGateInput<'a> {
    pub stage_id: &'a str,
    pub user_message: &'a str,
    pub context_facts: &'a serde_json::Map<String, Value>,
}

pub struct StageGateExtractor<C: ChatCompletionClient> {
    client: C,
}

impl<C: ChatCompletionClient> StageGateExtractor<C> {
    pub fn new(client: C) -> Self {
        StageGateExtractor { client }
    }
}

#[async_trait]
impl<C: ChatCompletionClient> Extractor<StageGateInput<'_>, StageGateResult> for StageGateExtractor<C> {
    async fn extract(&self, input: StageGateInput<'_>) -> Result<StageGateResult> {
        let system = format!(
            "You are the stage gate for stage `{}`. Decide readiness and extract recognized fact keys \
            for this stage from the conversation so far.",
            input.stage_id
        );
        let user = format!(
            "context={} message={:?}",
            Value::Object(input.context_facts.clone()),
            input.user_message
        );
        let raw = self.client.complete(&system, &user).await?;
        recover_and_parse(&raw)
    }
}

// ---------------------------------------------------------------------
// Decision router
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    ProvideInfo,
    Proceed,
    Back,
    Redo,
    Cancel,
    Assist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default)]
    pub target_stage: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl Decision {
    pub fn provide_info(note: impl Into<String>) -> Self {
        Decision { action: DecisionAction::ProvideInfo, target_stage: None, note: Some(note.into()) }
    }
}

pub struct DecisionInput<'a> {
    pub stage_id: &'a str,
    pub stage_ready: bool,
    pub user_message: &'a str,
}

pub struct DecisionExtractor<C: ChatCompletionClient> {
    client: C,
}

impl<C: ChatCompletionClient> DecisionExtractor<C> {
    pub fn new(client: C) -> Self {
        DecisionExtractor { client }
    }
}

#[async_trait]
impl<C: ChatCompletionClient> Extractor<DecisionInput<'_>, Decision> for DecisionExtractor<C> {
    async fn extract(&self, input: DecisionInput<'_>) -> Result<Decision> {
        if input.user_message.trim().is_empty() {
            return Ok(Decision::provide_info("empty user text"));
        }
        let system = "Classify the user's intent into one routing action: provide_info, proceed, back, \
            redo, cancel, or assist. Base the decision on intent, never on fixed phrases.";
        let user = format!("stage={} ready={} message={:?}", input.stage_id, input.stage_ready, input.user_message);
        let raw = self.client.complete(system, &user).await?;
        recover_and_parse(&raw)
    }
}

// ---------------------------------------------------------------------
// Constraint extractor (full durable record)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedConstraintRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub necessity: Necessity,
    pub scope: ConstraintScope,
    pub rule_kind: String,
    #[serde(default)]
    pub applies_event_types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub struct ConstraintExtractorInput<'a> {
    pub user_utterance: &'a str,
    pub planned_date: NaiveDate,
    pub timezone: &'a str,
    pub stage_id: &'a str,
    pub impacted_event_types: &'a [String],
    pub suggested_tags: &'a [String],
}

pub struct ConstraintExtractor<C: ChatCompletionClient> {
    client: C,
}

impl<C: ChatCompletionClient> ConstraintExtractor<C> {
    pub fn new(client: C) -> Self {
        ConstraintExtractor { client }
    }
}

#[async_trait]
impl<C: ChatCompletionClient> Extractor<ConstraintExtractorInput<'_>, ExtractedConstraintRecord> for ConstraintExtractor<C> {
    async fn extract(&self, input: ConstraintExtractorInput<'_>) -> Result<ExtractedConstraintRecord> {
        let system = "Extract a durable scheduling constraint from the handoff context.";
        let user = format!(
            "planned_date={} timezone={} stage={} impacted_event_types={:?} suggested_tags={:?} utterance={:?}",
            input.planned_date, input.timezone, input.stage_id, input.impacted_event_types, input.suggested_tags, input.user_utterance
        );
        let raw = self.client.complete(system, &user).await?;
        recover_and_parse(&raw)
    }
}

/// Fire-and-forget queueing acknowledgment for tool-invoked constraint
/// extraction (spec §4.8: "returns `{queued: true}` immediately").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueuedAck {
    pub queued: bool,
}

// ---------------------------------------------------------------------
// Patch generator
// ---------------------------------------------------------------------

pub struct PatchGeneratorInput<'a> {
    pub current_plan_json: &'a str,
    pub user_message: &'a str,
    pub constraints_table: &'a str,
    pub recent_actions_log: &'a str,
    pub retry_feedback: Option<&'a str>,
}

pub struct PatchGenerator<C: ChatCompletionClient> {
    client: C,
}

impl<C: ChatCompletionClient> PatchGenerator<C> {
    pub fn new(client: C) -> Self {
        PatchGenerator { client }
    }
}

#[async_trait]
impl<C: ChatCompletionClient> Extractor<PatchGeneratorInput<'_>, Patch> for PatchGenerator<C> {
    async fn extract(&self, input: PatchGeneratorInput<'_>) -> Result<Patch> {
        let system = "Produce a Patch against the current Plan. Prefer fine-grained ops over \
            replace-all. Preserve anchors unless explicitly asked to move them. Background events \
            must use fixed-start or fixed-window timing.";
        let mut user = format!(
            "plan={}\nconstraints={}\nrecent_actions={}\nmessage={:?}",
            input.current_plan_json, input.constraints_table, input.recent_actions_log, input.user_message
        );
        if let Some(feedback) = input.retry_feedback {
            user.push_str(&format!("\nretry_feedback={}", truncate_feedback(feedback.to_string(), 2000)));
        }
        let raw = self.client.complete(system, &user).await?;
        recover_and_parse(&raw)
    }
}

// ---------------------------------------------------------------------
// Skeleton generator
// ---------------------------------------------------------------------

/// Shared context for both SkeletonNode calls (spec §4.10.1): a free-text
/// Markdown overview and a separate, structured seed-`Plan` call.
pub struct SkeletonInput<'a> {
    pub planned_date: NaiveDate,
    pub timezone: &'a str,
    pub frame_facts_json: &'a str,
    pub input_facts_json: &'a str,
    pub fallback_block_minutes: i64,
}

pub struct SkeletonExtractor<C: ChatCompletionClient> {
    client: C,
}

impl<C: ChatCompletionClient> SkeletonExtractor<C> {
    pub fn new(client: C) -> Self {
        SkeletonExtractor { client }
    }

    /// First call: a free-text Markdown overview of the day (spec §4.10.1
    /// "render a Markdown overview using an LLM assistant").
    pub async fn render_overview(&self, input: &SkeletonInput<'_>) -> Result<String> {
        let system = "Write a short Markdown overview of the day's plan skeleton: a few headline \
            sections naming the day's anchors, blocks, and open gaps. No code fences, no JSON.";
        let user = format!(
            "date={} timezone={} frame_facts={} input_facts={}",
            input.planned_date, input.timezone, input.frame_facts_json, input.input_facts_json
        );
        self.client.complete(system, &user).await
    }

    /// Second call: "a separate call that emits a valid Plan" (spec
    /// §4.10.1) — a structured seed `Plan` built from the same facts, not a
    /// hard-coded anchor.
    pub async fn generate_seed_plan(&self, input: &SkeletonInput<'_>) -> Result<Plan> {
        let system = format!(
            "Produce a seed Plan JSON for date {} in timezone {}. Anchor at least one non-background \
            event with fixed-start or fixed-window timing, drawn from the immovables/work-window facts \
            given. When a buffer block has no other guidance, default it to {} minutes.",
            input.planned_date, input.timezone, input.fallback_block_minutes
        );
        let user = format!("frame_facts={} input_facts={}", input.frame_facts_json, input.input_facts_json);
        let raw = self.client.complete(&system, &user).await?;
        recover_and_parse(&raw)
    }
}

// ---------------------------------------------------------------------
// HTTP-backed ChatCompletionClient
// ---------------------------------------------------------------------

/// A minimal Anthropic Messages-API-shaped client, grounded in the same
/// `reqwest` idiom `HttpCalendarCapability` uses for the Calendar Capability
/// boundary. Used by `timebox-cli`; test code uses canned clients instead.
#[derive(Clone)]
pub struct HttpChatCompletionClient {
    client: reqwest::Client,
    endpoint: url::Url,
    api_key: String,
    model: String,
}

impl HttpChatCompletionClient {
    pub fn new(endpoint: url::Url, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        HttpChatCompletionClient { client: reqwest::Client::new(), endpoint, api_key: api_key.into(), model: model.into() }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    content: Vec<ChatContentBlock>,
}

#[derive(Deserialize)]
struct ChatContentBlock {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl ChatCompletionClient for HttpChatCompletionClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            max_tokens: 2048,
            system: system_prompt,
            messages: vec![ChatMessage { role: "user", content: user_prompt }],
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| TimeboxError::BackendUnavailable { label: "chat-completion".into(), reason: e.to_string() })?;

        if !response.status().is_success() {
            return Err(TimeboxError::BackendUnavailable {
                label: "chat-completion".into(),
                reason: format!("status {}", response.status()),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TimeboxError::Parse(format!("malformed chat completion response: {e}")))?;
        Ok(parsed.content.into_iter().map(|block| block.text).collect::<Vec<_>>().join(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CannedClient {
        responses: Mutex<Vec<String>>,
    }

    impl CannedClient {
        fn new(responses: Vec<&str>) -> Self {
            CannedClient { responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()) }
        }
    }

    #[async_trait]
    impl ChatCompletionClient for CannedClient {
        async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| TimeboxError::BackendUnavailable { label: "canned-client".into(), reason: "exhausted".into() })
        }
    }

    #[tokio::test]
    async fn planned_date_extractor_parses_fenced_json() {
        let client = CannedClient::new(vec!["```json\n{\"plannedDate\": \"2026-02-13\", \"confidence\": 0.9}\n```"]);
        let extractor = PlannedDateExtractor::new(client);
        let result = extractor
            .extract(PlannedDateInput { user_utterance: "let's plan tomorrow", now: Utc::now(), timezone: "Europe/Amsterdam" })
            .await
            .unwrap();
        assert_eq!(result.planned_date, NaiveDate::from_ymd_opt(2026, 2, 13));
        assert_eq!(result.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn decision_extractor_short_circuits_on_empty_message() {
        let client = CannedClient::new(vec![]);
        let extractor = DecisionExtractor::new(client);
        let decision = extractor.extract(DecisionInput { stage_id: "refine", stage_ready: false, user_message: "   " }).await.unwrap();
        assert_eq!(decision.action, DecisionAction::ProvideInfo);
    }

    #[tokio::test]
    async fn decision_extractor_recovers_embedded_json() {
        let client = CannedClient::new(vec!["Sure — {\"action\": \"proceed\"} is the right move."]);
        let extractor = DecisionExtractor::new(client);
        let decision = extractor.extract(DecisionInput { stage_id: "skeleton", stage_ready: true, user_message: "looks good" }).await.unwrap();
        assert_eq!(decision.action, DecisionAction::Proceed);
    }

    #[tokio::test]
    async fn constraint_interpreter_parses_should_extract_false() {
        let client = CannedClient::new(vec![r#"{"shouldExtract": false, "constraints": []}"#]);
        let extractor = ConstraintInterpreterExtractor::new(client);
        let result = extractor.extract(ConstraintInterpreterInput { user_message: "move lunch to 1pm today" }).await.unwrap();
        assert!(!result.should_extract);
    }

    #[test]
    fn stage_gate_safe_fallback_is_not_ready() {
        let gate = StageGateResult::safe_fallback("refine", "stage gate timeout");
        assert!(!gate.ready);
        assert_eq!(gate.missing, vec!["stage gate timeout".to_string()]);
    }

    #[test]
    fn truncate_feedback_respects_budget() {
        let long = "x".repeat(3000);
        let truncated = truncate_feedback(long, 10);
        assert!(truncated.len() <= 14);
    }

    #[tokio::test]
    async fn skeleton_extractor_renders_overview_verbatim() {
        let client = CannedClient::new(vec!["## Morning\nDeep work 09:00-11:00\n## Afternoon\nOpen gap"]);
        let extractor = SkeletonExtractor::new(client);
        let input = SkeletonInput {
            planned_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            timezone: "UTC",
            frame_facts_json: "{}",
            input_facts_json: "{}",
            fallback_block_minutes: 30,
        };
        let markdown = extractor.render_overview(&input).await.unwrap();
        assert!(markdown.contains("Deep work"));
    }

    #[tokio::test]
    async fn skeleton_extractor_parses_fenced_seed_plan() {
        let client = CannedClient::new(vec![
            "```json\n{\"events\":[{\"n\":\"Deep Work\",\"d\":\"\",\"t\":\"DW\",\"p\":{\"a\":\"fs\",\"st\":\"09:00:00\",\"dur\":\"PT30M\"}}],\"date\":\"2026-03-02\",\"tz\":\"UTC\"}\n```",
        ]);
        let extractor = SkeletonExtractor::new(client);
        let input = SkeletonInput {
            planned_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            timezone: "UTC",
            frame_facts_json: "{}",
            input_facts_json: "{}",
            fallback_block_minutes: 30,
        };
        let plan = extractor.generate_seed_plan(&input).await.unwrap();
        assert_eq!(plan.events.len(), 1);
        assert_eq!(plan.events[0].name, "Deep Work");
        assert_eq!(plan.tz, "UTC");
    }
}
