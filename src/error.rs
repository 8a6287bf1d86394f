//! Crate-wide error taxonomy.
//!
//! One data-carrying variant per failure mode (spec §7), plus a
//! retryability classification so callers can decide whether to surface a
//! "safe fallback" or bubble up.

use thiserror::Error;

/// Every failure mode the core can produce.
#[derive(Debug, Error)]
pub enum TimeboxError {
    #[error("could not parse extractor output: {0}")]
    Parse(String),

    #[error("plan/patch validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("backend timed out: {label}")]
    BackendTimeout { label: String },

    #[error("backend unavailable: {label}: {reason}")]
    BackendUnavailable { label: String, reason: String },

    #[error("remote tool reported failure: tool={tool} payload={payload}")]
    Rpc { tool: String, payload: String },

    #[error("index {index} out of range (len={len})")]
    IndexError { index: usize, len: usize },

    #[error("unknown enum value: {field}={value}")]
    UnknownEnum { field: String, value: String },

    #[error("concurrency invariant violated: {0}")]
    ConcurrencyConflict(String),
}

/// Time Model / Patch invariant violations, kept as their own enum so the
/// Patcher can inspect structured detail when building retry feedback.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("event chain is broken: {event_name:?} has no successor to anchor its `bn` timing")]
    BrokenChain { event_name: String },

    #[error("events overlap: {first} ends after {second} starts")]
    Overlap { first: String, second: String },

    #[error("plan has no anchored (fs/fw) non-background event")]
    NoAnchor,

    #[error("background event {name:?} must use fixed-start or fixed-window timing")]
    BackgroundNotFixed { name: String },

    #[error("event duration must be positive: {name:?} has duration {duration_s}s")]
    NonPositiveDuration { name: String, duration_s: i64 },
}

impl TimeboxError {
    /// Whether retrying the same call, unmodified, might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TimeboxError::BackendTimeout { .. } | TimeboxError::Rpc { .. }
        )
    }

    /// A short, user-safe hint for the default "we hit a backend issue" escape hatch.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            TimeboxError::Parse(_) => "retry the request; the model reply could not be parsed",
            TimeboxError::Validation(_) => "the proposed plan change is invalid",
            TimeboxError::BackendTimeout { .. } => "retry in a moment",
            TimeboxError::BackendUnavailable { .. } => "the backend is degraded; try again later",
            TimeboxError::Rpc { .. } => "the remote calendar rejected the request",
            TimeboxError::IndexError { .. } => "the edit referenced an event that no longer exists",
            TimeboxError::UnknownEnum { .. } => "an internal enum value was not recognized",
            TimeboxError::ConcurrencyConflict(_) => "an internal invariant was violated",
        }
    }
}

/// Stable, serializable classification of [`TimeboxError`], independent of the
/// underlying `Display` text, so an interface adapter can report failures to a
/// UI without leaking internal error internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Parse,
    Validation,
    BackendTimeout,
    BackendUnavailable,
    Rpc,
    IndexError,
    UnknownEnum,
    ConcurrencyConflict,
}

/// IPC/UI-safe projection of a [`TimeboxError`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub recovery_hint: String,
}

impl From<&TimeboxError> for PublicError {
    fn from(err: &TimeboxError) -> Self {
        let kind = match err {
            TimeboxError::Parse(_) => ErrorKind::Parse,
            TimeboxError::Validation(_) => ErrorKind::Validation,
            TimeboxError::BackendTimeout { .. } => ErrorKind::BackendTimeout,
            TimeboxError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            TimeboxError::Rpc { .. } => ErrorKind::Rpc,
            TimeboxError::IndexError { .. } => ErrorKind::IndexError,
            TimeboxError::UnknownEnum { .. } => ErrorKind::UnknownEnum,
            TimeboxError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
        };
        PublicError {
            kind,
            message: err.to_string(),
            retryable: err.is_retryable(),
            recovery_hint: err.recovery_hint().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TimeboxError>;
