//! Patcher (spec §4.9): the plan-edit loop. Renders a prompt, calls the
//! patch extractor, applies the result, and retries with structured
//! validation feedback on failure.

use crate::error::{Result, TimeboxError, ValidationError};
use crate::extractors::{ChatCompletionClient, Extractor, PatchGenerator, PatchGeneratorInput};
use crate::patch_ops::{apply, Patch};
use crate::time_model::Plan;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const FEEDBACK_BYTE_BUDGET: usize = 2000;

/// An externally-supplied post-apply check (e.g. the ReviewCommit summary
/// gate's own invariants); returning `Err` triggers a retry exactly like a
/// Plan/Patch validation failure.
pub trait PlanValidator: Send + Sync {
    fn validate(&self, plan: &Plan) -> std::result::Result<(), String>;
}

/// Loop inputs shared across attempts; `retry_feedback` is the only channel
/// between attempts — no prior-attempt plan leaks into the next prompt.
pub struct ApplyPatchInput<'a> {
    pub current_plan: &'a Plan,
    pub user_message: &'a str,
    pub constraints_table: &'a str,
    pub recent_actions_log: &'a str,
    pub max_attempts: Option<u32>,
}

fn validation_feedback(err: &ValidationError) -> String {
    match err {
        ValidationError::BrokenChain { event_name } => {
            format!("(location={event_name}, type=broken_chain, message=missing anchor for relative timing)")
        }
        ValidationError::Overlap { first, second } => {
            format!("(location={first}->{second}, type=overlap, message={first} overlaps {second})")
        }
        ValidationError::NoAnchor => "(location=plan, type=no_anchor, message=plan has no fixed anchor event)".to_string(),
        ValidationError::BackgroundNotFixed { name } => {
            format!("(location={name}, type=background_not_fixed, message=background events must use fixed timing)")
        }
        ValidationError::NonPositiveDuration { name, duration_s } => {
            format!("(location={name}, type=non_positive_duration, message=duration {duration_s}s is not positive)")
        }
    }
}

fn truncate(message: String, byte_budget: usize) -> String {
    if message.len() <= byte_budget {
        return message;
    }
    let mut end = byte_budget;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}

/// Run the patch loop to completion: `(new_plan, patch)` on success, the
/// last underlying error on exhaustion.
pub async fn apply_patch<C: ChatCompletionClient>(
    generator: &PatchGenerator<C>,
    input: ApplyPatchInput<'_>,
    validator: Option<&dyn PlanValidator>,
) -> Result<(Plan, Patch)> {
    let max_attempts = input.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
    let mut retry_feedback: Option<String> = None;
    let mut last_error: Option<TimeboxError> = None;

    for _attempt in 0..max_attempts {
        let current_plan_json = serde_json::to_string(input.current_plan)
            .map_err(|e| TimeboxError::Parse(format!("failed to serialize current plan: {e}")))?;

        let extractor_input = PatchGeneratorInput {
            current_plan_json: &current_plan_json,
            user_message: input.user_message,
            constraints_table: input.constraints_table,
            recent_actions_log: input.recent_actions_log,
            retry_feedback: retry_feedback.as_deref(),
        };

        let outcome = generator.extract(extractor_input).await.and_then(|patch| {
            apply(input.current_plan, &patch).map(|plan| (plan, patch))
        });

        match outcome {
            Ok((plan, patch)) => {
                if let Some(validator) = validator {
                    if let Err(message) = validator.validate(&plan) {
                        let feedback = truncate(format!("(location=plan, type=validator, message={message})"), FEEDBACK_BYTE_BUDGET);
                        last_error = Some(TimeboxError::Validation(ValidationError::Overlap {
                            first: "validator".to_string(),
                            second: message,
                        }));
                        retry_feedback = Some(feedback);
                        continue;
                    }
                }
                return Ok((plan, patch));
            }
            Err(TimeboxError::Validation(validation_err)) => {
                let feedback = truncate(validation_feedback(&validation_err), FEEDBACK_BYTE_BUDGET);
                retry_feedback = Some(feedback);
                last_error = Some(TimeboxError::Validation(validation_err));
            }
            Err(other) => {
                let feedback = truncate(format!("(location=extractor, type=error, message={other})"), FEEDBACK_BYTE_BUDGET);
                retry_feedback = Some(feedback);
                last_error = Some(other);
            }
        }
    }

    Err(last_error.unwrap_or(TimeboxError::BackendUnavailable {
        label: "patcher".into(),
        reason: "exhausted retries with no recorded error".into(),
    }))
}
