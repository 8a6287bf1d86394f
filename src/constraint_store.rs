//! Durable Constraint Store: a backend-agnostic facade over durable
//! preference records, plus an in-memory implementation.
//!
//! The facade is deliberately storage-agnostic (spec §4.3): this crate ships
//! only the in-memory backend, since the Notion/Mem0-backed stores are
//! external collaborators reached over the MCP calendar/notes surface, not
//! something this crate owns.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constraint::{
    compute_uid, identity_tuple, is_active, ConstraintRecord, ConstraintScope, ConstraintStatus,
    Necessity,
};
use crate::error::{Result, TimeboxError};

/// A stage/event-type combination the retriever can rank against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintTypeInfo {
    pub type_id: String,
    pub label: String,
    pub applies_stages: Vec<String>,
    pub applies_event_types: Vec<String>,
    /// Number of currently-active constraints of this rule kind.
    pub count: usize,
}

/// Filters accepted by [`ConstraintStore::query_constraints`] (spec §4.3).
///
/// `as_of` combined with `require_active` drives the activity window check;
/// an `as_of` with `require_active = false` is still used for presentation
/// but does not exclude inactive rows.
#[derive(Debug, Clone, Default)]
pub struct ConstraintFilters {
    pub as_of: Option<NaiveDate>,
    pub stage: Option<String>,
    pub event_types_any: Vec<String>,
    pub statuses_any: Vec<ConstraintStatus>,
    pub scopes_any: Vec<ConstraintScope>,
    pub necessities_any: Vec<Necessity>,
    pub text_query: Option<String>,
    pub tags: Vec<String>,
    pub topics: Vec<String>,
    pub type_ids: Vec<String>,
    pub require_active: bool,
    /// Sort by status descending (locked > proposed > declined) before the
    /// store's default recency ordering.
    pub sort_by_status_desc: bool,
    pub limit: Option<usize>,
}

/// Partial update for [`ConstraintStore::update_constraint`]; only `Some`
/// fields are applied.
#[derive(Debug, Clone, Default)]
pub struct ConstraintPatch {
    pub description: Option<String>,
    pub status: Option<ConstraintStatus>,
    pub confidence: Option<f64>,
    pub tags: Option<Vec<String>>,
}

/// Result of a [`ConstraintStore::dedupe_constraints`] pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupeReport {
    pub groups_examined: usize,
    pub archived_uids: Vec<String>,
    pub kept_uids: Vec<String>,
    pub dry_run: bool,
}

#[async_trait]
pub trait ConstraintStore: Send + Sync {
    async fn query_types(&self, stage: &str, event_types: &[String]) -> Result<Vec<ConstraintTypeInfo>>;

    async fn query_constraints(&self, filters: ConstraintFilters) -> Result<Vec<ConstraintRecord>>;

    async fn get_constraint(&self, uid: &str) -> Result<Option<ConstraintRecord>>;

    /// Idempotent insert: if `record.uid` is empty it is computed from the
    /// identity tuple; inserting a record whose uid already exists overwrites
    /// it in place rather than duplicating it.
    async fn upsert_constraint(&self, record: ConstraintRecord) -> Result<ConstraintRecord>;

    async fn update_constraint(&self, uid: &str, patch: ConstraintPatch) -> Result<Option<ConstraintRecord>>;

    /// Soft-delete: flips status to `declined` rather than removing the row,
    /// so superseded history stays inspectable.
    async fn archive_constraint(&self, uid: &str, reason: Option<String>) -> Result<Option<ConstraintRecord>>;

    /// Archive `old_uid` and upsert `new_record` with `supersedes_uids`
    /// extended to include it.
    async fn supersede_constraint(&self, old_uid: &str, new_record: ConstraintRecord) -> Result<ConstraintRecord>;

    /// Look up a record with the same identity tuple as `candidate`, ignoring
    /// `candidate.uid` itself (it may not have one yet).
    async fn find_equivalent_constraint(&self, candidate: &ConstraintRecord) -> Result<Option<ConstraintRecord>>;

    /// Group all records by identity tuple and keep one canonical record per
    /// group: `locked` beats `proposed` beats `declined`, ties broken by most
    /// recent `updated_at`. Archives the rest. `dry_run` computes the report
    /// without mutating the store.
    async fn dedupe_constraints(&self, dry_run: bool) -> Result<DedupeReport>;

    async fn add_reflection(&self, uid: &str, note: serde_json::Value) -> Result<()>;
}

/// Builds the minimal JSON Patch (RFC 6902-shaped) document between a
/// stored record and what a [`ConstraintPatch`] would change (spec §4.3
/// "JSON-patch builder"), for the wire format a real backend's PATCH
/// request would send. Only fields the patch actually changes get an op.
pub fn build_update_json_patch(current: &ConstraintRecord, patch: &ConstraintPatch) -> serde_json::Value {
    let mut ops: Vec<serde_json::Value> = Vec::new();
    if let Some(description) = &patch.description {
        if description != &current.description {
            ops.push(serde_json::json!({"op": "replace", "path": "/description", "value": description}));
        }
    }
    if let Some(status) = patch.status {
        if status != current.status {
            ops.push(serde_json::json!({"op": "replace", "path": "/status", "value": status}));
        }
    }
    if let Some(confidence) = patch.confidence {
        if Some(confidence) != current.confidence {
            ops.push(serde_json::json!({"op": "replace", "path": "/confidence", "value": confidence}));
        }
    }
    if let Some(tags) = &patch.tags {
        if tags != &current.tags {
            ops.push(serde_json::json!({"op": "replace", "path": "/tags", "value": tags}));
        }
    }
    serde_json::Value::Array(ops)
}

struct Row {
    record: ConstraintRecord,
    reflections: Vec<serde_json::Value>,
}

pub struct InMemoryConstraintStore {
    rows: RwLock<BTreeMap<String, Row>>,
}

impl InMemoryConstraintStore {
    pub fn new() -> Self {
        Self { rows: RwLock::new(BTreeMap::new()) }
    }

    fn status_rank(status: ConstraintStatus) -> u8 {
        match status {
            ConstraintStatus::Locked => 2,
            ConstraintStatus::Proposed => 1,
            ConstraintStatus::Declined => 0,
        }
    }
}

impl Default for InMemoryConstraintStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConstraintStore for InMemoryConstraintStore {
    async fn query_types(&self, stage: &str, event_types: &[String]) -> Result<Vec<ConstraintTypeInfo>> {
        let rows = self.rows.read();
        let mut seen: BTreeMap<String, ConstraintTypeInfo> = BTreeMap::new();
        for row in rows.values() {
            let record = &row.record;
            if record.status == ConstraintStatus::Declined {
                continue;
            }
            let stage_matches = record.applies_stages.is_empty() || record.applies_stages.iter().any(|s| s == stage);
            let type_matches = event_types.is_empty()
                || record.applies_event_types.is_empty()
                || record.applies_event_types.iter().any(|t| event_types.contains(t));
            if stage_matches && type_matches {
                let entry = seen.entry(record.rule_kind.clone()).or_insert_with(|| ConstraintTypeInfo {
                    type_id: record.rule_kind.clone(),
                    label: record.rule_kind.clone(),
                    applies_stages: record.applies_stages.clone(),
                    applies_event_types: record.applies_event_types.clone(),
                    count: 0,
                });
                entry.count += 1;
            }
        }
        let mut out: Vec<ConstraintTypeInfo> = seen.into_values().collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.type_id.cmp(&b.type_id)));
        Ok(out)
    }

    async fn query_constraints(&self, filters: ConstraintFilters) -> Result<Vec<ConstraintRecord>> {
        let rows = self.rows.read();
        let mut out: Vec<ConstraintRecord> = rows
            .values()
            .map(|row| &row.record)
            .filter(|record| {
                if !filters.statuses_any.is_empty() && !filters.statuses_any.contains(&record.status) {
                    return false;
                }
                if !filters.scopes_any.is_empty() && !filters.scopes_any.contains(&record.scope) {
                    return false;
                }
                if !filters.necessities_any.is_empty() && !filters.necessities_any.contains(&record.necessity) {
                    return false;
                }
                if let Some(stage) = &filters.stage {
                    if !record.applies_stages.is_empty() && !record.applies_stages.iter().any(|s| s == stage) {
                        return false;
                    }
                }
                if !filters.event_types_any.is_empty()
                    && !record.applies_event_types.is_empty()
                    && !record
                        .applies_event_types
                        .iter()
                        .any(|t| filters.event_types_any.contains(t))
                {
                    return false;
                }
                if let Some(as_of) = filters.as_of {
                    if filters.require_active && !is_active(record, as_of) {
                        return false;
                    }
                }
                if !filters.tags.is_empty() && !filters.tags.iter().any(|t| record.tags.contains(t)) {
                    return false;
                }
                if !filters.topics.is_empty() && !filters.topics.iter().any(|t| record.topics.contains(t)) {
                    return false;
                }
                if !filters.type_ids.is_empty() && !filters.type_ids.contains(&record.rule_kind) {
                    return false;
                }
                if let Some(query) = &filters.text_query {
                    let query = query.to_lowercase();
                    if !record.name.to_lowercase().contains(&query)
                        && !record.description.to_lowercase().contains(&query)
                    {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        if filters.sort_by_status_desc {
            out.sort_by(|a, b| {
                Self::status_rank(b.status)
                    .cmp(&Self::status_rank(a.status))
                    .then(b.updated_at.cmp(&a.updated_at))
            });
        } else {
            out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        }
        if let Some(limit) = filters.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn get_constraint(&self, uid: &str) -> Result<Option<ConstraintRecord>> {
        Ok(self.rows.read().get(uid).map(|row| row.record.clone()))
    }

    async fn upsert_constraint(&self, mut record: ConstraintRecord) -> Result<ConstraintRecord> {
        if record.uid.is_empty() {
            record.uid = compute_uid(&record);
        }
        record.updated_at = Some(Utc::now());

        let superseded_end = record.start_date.unwrap_or_else(|| Utc::now().date_naive());
        let supersedes = record.supersedes_uids.clone();

        let mut rows = self.rows.write();
        // Additive set union on topics/tags for an existing row; every other
        // field overwrites (spec §4.3).
        if let Some(existing) = rows.get(&record.uid) {
            for topic in &existing.record.topics {
                if !record.topics.contains(topic) {
                    record.topics.push(topic.clone());
                }
            }
            for tag in &existing.record.tags {
                if !record.tags.contains(tag) {
                    record.tags.push(tag.clone());
                }
            }
        }
        let reflections = rows.get(&record.uid).map(|row| row.reflections.clone()).unwrap_or_default();
        rows.insert(record.uid.clone(), Row { record: record.clone(), reflections });

        for old_uid in &supersedes {
            if old_uid == &record.uid {
                continue;
            }
            if let Some(row) = rows.get_mut(old_uid) {
                row.record.status = ConstraintStatus::Declined;
                row.record.end_date = Some(superseded_end);
                row.record.updated_at = Some(Utc::now());
            }
        }

        Ok(record)
    }

    async fn update_constraint(&self, uid: &str, patch: ConstraintPatch) -> Result<Option<ConstraintRecord>> {
        let mut rows = self.rows.write();
        let Some(row) = rows.get_mut(uid) else { return Ok(None) };
        let json_patch = build_update_json_patch(&row.record, &patch);
        if !json_patch.as_array().is_some_and(|ops| ops.is_empty()) {
            debug!(uid = %uid, patch = %json_patch, "applying constraint update");
        }
        if let Some(description) = patch.description {
            row.record.description = description;
        }
        if let Some(status) = patch.status {
            row.record.status = status;
        }
        if let Some(confidence) = patch.confidence {
            row.record.confidence = Some(confidence);
        }
        if let Some(tags) = patch.tags {
            row.record.tags = tags;
        }
        row.record.updated_at = Some(Utc::now());
        Ok(Some(row.record.clone()))
    }

    async fn archive_constraint(&self, uid: &str, reason: Option<String>) -> Result<Option<ConstraintRecord>> {
        self.update_constraint(
            uid,
            ConstraintPatch {
                status: Some(ConstraintStatus::Declined),
                description: reason,
                ..Default::default()
            },
        )
        .await
    }

    async fn supersede_constraint(&self, old_uid: &str, mut new_record: ConstraintRecord) -> Result<ConstraintRecord> {
        self.archive_constraint(old_uid, None).await?;
        if !new_record.supersedes_uids.contains(&old_uid.to_string()) {
            new_record.supersedes_uids.push(old_uid.to_string());
        }
        self.upsert_constraint(new_record).await
    }

    async fn find_equivalent_constraint(&self, candidate: &ConstraintRecord) -> Result<Option<ConstraintRecord>> {
        let target = identity_tuple(candidate);
        let rows = self.rows.read();
        Ok(rows
            .values()
            .map(|row| &row.record)
            .find(|record| identity_tuple(record) == target)
            .cloned())
    }

    async fn dedupe_constraints(&self, dry_run: bool) -> Result<DedupeReport> {
        let mut groups: BTreeMap<String, Vec<ConstraintRecord>> = BTreeMap::new();
        {
            let rows = self.rows.read();
            for row in rows.values() {
                groups.entry(identity_tuple(&row.record)).or_default().push(row.record.clone());
            }
        }

        let mut report = DedupeReport { dry_run, groups_examined: groups.len(), ..Default::default() };

        for (_, mut group) in groups {
            if group.len() < 2 {
                if let Some(only) = group.first() {
                    report.kept_uids.push(only.uid.clone());
                }
                continue;
            }
            group.sort_by(|a, b| {
                Self::status_rank(b.status)
                    .cmp(&Self::status_rank(a.status))
                    .then(b.updated_at.cmp(&a.updated_at))
            });
            let canonical = group[0].uid.clone();
            report.kept_uids.push(canonical.clone());
            for loser in &group[1..] {
                report.archived_uids.push(loser.uid.clone());
                if !dry_run {
                    self.archive_constraint(&loser.uid, Some("merged into duplicate".into())).await?;
                }
            }
        }

        Ok(report)
    }

    async fn add_reflection(&self, uid: &str, note: serde_json::Value) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(uid)
            .ok_or_else(|| TimeboxError::IndexError { index: 0, len: 0 })?;
        row.reflections.push(note);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{ConstraintScope, ConstraintSource, DayOfWeek, Necessity, WindowSpec};

    fn record(name: &str, days: Vec<DayOfWeek>) -> ConstraintRecord {
        ConstraintRecord {
            uid: String::new(),
            name: name.into(),
            description: "initial".into(),
            necessity: Necessity::Should,
            status: ConstraintStatus::Proposed,
            source: ConstraintSource::User,
            confidence: Some(0.7),
            scope: ConstraintScope::Profile,
            start_date: None,
            end_date: None,
            days_of_week: days,
            timezone: None,
            recurrence: None,
            ttl_days: None,
            applies_stages: vec!["refine".into()],
            applies_event_types: vec![],
            topics: vec![],
            tags: vec!["focus".into()],
            rule_kind: "avoid_window".into(),
            scalar_params: Default::default(),
            windows: vec![WindowSpec { kind: "avoid".into(), start: "17:00".into(), end: "23:59".into() }],
            supersedes_uids: vec![],
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_identity() {
        let store = InMemoryConstraintStore::new();
        let a = store.upsert_constraint(record("No calls late", vec![DayOfWeek::Mo])).await.unwrap();
        let b = store.upsert_constraint(record("No calls late", vec![DayOfWeek::Mo])).await.unwrap();
        assert_eq!(a.uid, b.uid);

        let all = store.query_constraints(ConstraintFilters::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn find_equivalent_ignores_description_and_day_order() {
        let store = InMemoryConstraintStore::new();
        let stored = store
            .upsert_constraint(record("No calls late", vec![DayOfWeek::Mo, DayOfWeek::Tu]))
            .await
            .unwrap();

        let mut candidate = record("No calls late", vec![DayOfWeek::Tu, DayOfWeek::Mo]);
        candidate.description = "totally different wording".into();

        let found = store.find_equivalent_constraint(&candidate).await.unwrap().unwrap();
        assert_eq!(found.uid, stored.uid);
        assert_eq!(compute_uid(&candidate), compute_uid(&stored));
    }

    #[tokio::test]
    async fn dedupe_keeps_locked_over_proposed() {
        let store = InMemoryConstraintStore::new();
        let mut proposed = record("No calls late", vec![DayOfWeek::Mo]);
        proposed.uid = "proposed-uid".into();
        proposed.status = ConstraintStatus::Proposed;

        let mut locked = record("No calls late", vec![DayOfWeek::Mo]);
        locked.uid = "locked-uid".into();
        locked.status = ConstraintStatus::Locked;

        store.upsert_constraint(proposed).await.unwrap();
        store.upsert_constraint(locked).await.unwrap();

        let report = store.dedupe_constraints(false).await.unwrap();
        assert_eq!(report.kept_uids, vec!["locked-uid".to_string()]);
        assert_eq!(report.archived_uids, vec!["proposed-uid".to_string()]);

        let archived = store.get_constraint("proposed-uid").await.unwrap().unwrap();
        assert_eq!(archived.status, ConstraintStatus::Declined);
    }

    #[test]
    fn json_patch_builder_is_empty_for_no_changes() {
        let current = record("No calls late", vec![DayOfWeek::Mo]);
        let patch = ConstraintPatch::default();
        let doc = build_update_json_patch(&current, &patch);
        assert_eq!(doc, serde_json::json!([]));
    }

    #[test]
    fn json_patch_builder_emits_only_changed_fields() {
        let current = record("No calls late", vec![DayOfWeek::Mo]);
        let patch = ConstraintPatch {
            description: Some("initial".to_string()), // unchanged
            status: Some(ConstraintStatus::Locked),    // changed
            confidence: None,
            tags: Some(vec!["focus".to_string()]), // unchanged
        };
        let doc = build_update_json_patch(&current, &patch);
        let ops = doc.as_array().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["path"], "/status");
        assert_eq!(ops[0]["value"], "locked");
    }

    #[tokio::test]
    async fn archive_constraint_soft_deletes() {
        let store = InMemoryConstraintStore::new();
        let stored = store.upsert_constraint(record("No calls late", vec![])).await.unwrap();
        let archived = store.archive_constraint(&stored.uid, Some("no longer needed".into())).await.unwrap().unwrap();
        assert_eq!(archived.status, ConstraintStatus::Declined);
        assert_eq!(archived.description, "no longer needed");
    }
}
