//! Durable Constraint Record: the content-addressed preference record shared
//! by the Durable Constraint Store, the Constraint Retriever, and the
//! stage-gate normalization logic.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Necessity {
    Must,
    Should,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintStatus {
    Proposed,
    Locked,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintSource {
    User,
    Calendar,
    System,
    Feedback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintScope {
    Session,
    Profile,
    Datespan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mo,
    Tu,
    We,
    Th,
    Fr,
    Sa,
    Su,
}

/// One window in a constraint's rule payload, e.g. `{avoid, 17:00, 23:59}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub kind: String,
    pub start: String,
    pub end: String,
}

/// The durable, content-addressed preference record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintRecord {
    #[serde(default)]
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub description: String,

    pub necessity: Necessity,
    pub status: ConstraintStatus,
    pub source: ConstraintSource,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub scope: ConstraintScope,

    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub days_of_week: Vec<DayOfWeek>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub recurrence: Option<String>,
    #[serde(default)]
    pub ttl_days: Option<u32>,

    #[serde(default)]
    pub applies_stages: Vec<String>,
    #[serde(default)]
    pub applies_event_types: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,

    pub rule_kind: String,
    #[serde(default)]
    pub scalar_params: std::collections::BTreeMap<String, f64>,
    #[serde(default)]
    pub windows: Vec<WindowSpec>,

    #[serde(default)]
    pub supersedes_uids: Vec<String>,

    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The canonical identity tuple used both for `uid` computation and
/// `find_equivalent_constraint`: normalized name, normalized rule kind,
/// sorted windows, sorted days-of-week, and scope. Descriptions and free-form
/// wording are deliberately excluded.
pub fn identity_tuple(record: &ConstraintRecord) -> String {
    let mut windows: Vec<String> = record
        .windows
        .iter()
        .map(|w| format!("{}|{}|{}", normalize_text(&w.kind), w.start, w.end))
        .collect();
    windows.sort();

    let mut days: Vec<DayOfWeek> = record.days_of_week.clone();
    days.sort();

    let scope = match record.scope {
        ConstraintScope::Session => "session",
        ConstraintScope::Profile => "profile",
        ConstraintScope::Datespan => "datespan",
    };

    format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{:?}\u{1f}{}",
        normalize_text(&record.name),
        normalize_text(&record.rule_kind),
        windows.join(","),
        days,
        scope,
    )
}

/// Content hash over [`identity_tuple`]: two records with different
/// descriptions but identical identity tuples produce the same `uid`.
pub fn compute_uid(record: &ConstraintRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity_tuple(record).as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// `start_date <= as_of <= end_date`, with either side open (`None` = unbounded).
pub fn is_active(record: &ConstraintRecord, as_of: NaiveDate) -> bool {
    let after_start = record.start_date.map(|d| d <= as_of).unwrap_or(true);
    let before_end = record.end_date.map(|d| as_of <= d).unwrap_or(true);
    after_start && before_end
}
