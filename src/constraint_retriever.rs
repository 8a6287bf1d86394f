//! Constraint Retriever (spec §4.7): derive a stage-specific query plan
//! against the Durable Constraint Store and fetch the matching records.

use chrono::NaiveDate;

use crate::constraint::{ConstraintRecord, ConstraintScope, ConstraintStatus};
use crate::constraint_store::{ConstraintFilters, ConstraintStore};
use crate::error::Result;
use crate::stage::Stage;

/// The topic tag the Collect-stage special case prefetches against before
/// falling back to the broad event-type-routed query.
pub const STARTUP_PREFETCH_TOPIC: &str = "startup_defaults";

const DEFAULT_MAX_TYPE_IDS: usize = 5;
const DEFAULT_QUERY_LIMIT: usize = 25;

/// Inputs that drive event-type routing; mirrors the subset of `Session`
/// fact caches the retriever actually reads.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub has_immovables: bool,
    pub has_commutes: bool,
    pub has_sleep_target: bool,
    pub has_habits: bool,
    pub has_gaps: bool,
}

/// Derive the event-type codes to route on for a given stage (spec §4.7
/// "Event-type routing"). `DW`/`SW` and `M`/`C`/`R`/`H` are two
/// **independent, overlapping** stage sets, not an if/else — Skeleton,
/// Refine, and ReviewCommit route both at once.
pub fn route_event_types(stage: Stage, ctx: &RoutingContext) -> Vec<String> {
    let mut types = Vec::new();
    if stage.is_startup() {
        types.push("DW".to_string());
        types.push("SW".to_string());
    }
    if stage == Stage::CollectConstraints || stage.is_scheduling() {
        if ctx.has_immovables {
            types.push("M".to_string());
        }
        if ctx.has_commutes {
            types.push("C".to_string());
        }
        if ctx.has_sleep_target {
            types.push("R".to_string());
        }
        if ctx.has_habits {
            types.push("H".to_string());
        }
    }
    if stage.is_scheduling() {
        if ctx.has_gaps {
            types.push("BU".to_string());
            types.push("BG".to_string());
        }
        types.push("PR".to_string());
    }
    types
}

/// Run the full retrieval contract: Collect-stage special case, or the
/// general event-type-routed + type-ranked query.
pub async fn retrieve_constraints(
    store: &dyn ConstraintStore,
    stage: Stage,
    planned_date: NaiveDate,
    ctx: &RoutingContext,
) -> Result<Vec<ConstraintRecord>> {
    if stage == Stage::CollectConstraints {
        let prefetch_filters = ConstraintFilters {
            as_of: Some(planned_date),
            scopes_any: vec![ConstraintScope::Profile, ConstraintScope::Datespan],
            topics: vec![STARTUP_PREFETCH_TOPIC.to_string()],
            statuses_any: vec![ConstraintStatus::Locked, ConstraintStatus::Proposed],
            require_active: true,
            ..Default::default()
        };
        let prefetched = store.query_constraints(prefetch_filters).await?;
        if !prefetched.is_empty() {
            return Ok(dedupe_by_uid(prefetched));
        }
        // Fall back to the broad query below, with no event-type routing.
        let filters = ConstraintFilters {
            as_of: Some(planned_date),
            stage: Some(stage.as_str().to_string()),
            statuses_any: vec![ConstraintStatus::Locked, ConstraintStatus::Proposed],
            require_active: true,
            sort_by_status_desc: true,
            limit: Some(DEFAULT_QUERY_LIMIT),
            ..Default::default()
        };
        return Ok(dedupe_by_uid(store.query_constraints(filters).await?));
    }

    let event_types = route_event_types(stage, ctx);
    let type_infos = store.query_types(stage.as_str(), &event_types).await?;
    let type_ids: Vec<String> = type_infos.into_iter().take(DEFAULT_MAX_TYPE_IDS).map(|t| t.type_id).collect();

    let filters = ConstraintFilters {
        as_of: Some(planned_date),
        stage: Some(stage.as_str().to_string()),
        event_types_any: event_types,
        statuses_any: vec![ConstraintStatus::Locked, ConstraintStatus::Proposed],
        require_active: true,
        type_ids,
        sort_by_status_desc: true,
        limit: Some(DEFAULT_QUERY_LIMIT),
        ..Default::default()
    };
    Ok(dedupe_by_uid(store.query_constraints(filters).await?))
}

fn dedupe_by_uid(records: Vec<ConstraintRecord>) -> Vec<ConstraintRecord> {
    let mut seen = std::collections::HashSet::new();
    records.into_iter().filter(|r| seen.insert(r.uid.clone())).collect()
}

/// Filter out durable records a session has recorded as user-overridden
/// (spec §4.10.1 `suppressed_durable_uids`).
pub fn exclude_suppressed(records: Vec<ConstraintRecord>, suppressed_uids: &[String]) -> Vec<ConstraintRecord> {
    records.into_iter().filter(|r| !suppressed_uids.contains(&r.uid)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{ConstraintSource, Necessity};
    use crate::constraint_store::InMemoryConstraintStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
    }

    fn record(name: &str, rule_kind: &str, scope: ConstraintScope, topics: Vec<String>) -> ConstraintRecord {
        ConstraintRecord {
            uid: String::new(),
            name: name.into(),
            description: String::new(),
            necessity: Necessity::Should,
            status: ConstraintStatus::Locked,
            source: ConstraintSource::User,
            confidence: Some(0.9),
            scope,
            start_date: None,
            end_date: None,
            days_of_week: vec![],
            timezone: None,
            recurrence: None,
            ttl_days: None,
            applies_stages: vec![],
            applies_event_types: vec![],
            topics,
            tags: vec![],
            rule_kind: rule_kind.into(),
            scalar_params: Default::default(),
            windows: vec![],
            supersedes_uids: vec![],
            updated_at: None,
        }
    }

    #[test]
    fn startup_stages_always_route_deep_and_shallow_work() {
        let ctx = RoutingContext::default();
        let types = route_event_types(Stage::CaptureInputs, &ctx);
        assert!(types.contains(&"DW".to_string()));
        assert!(types.contains(&"SW".to_string()));
    }

    #[test]
    fn collect_constraints_stage_has_no_default_routing() {
        let ctx = RoutingContext::default();
        let types = route_event_types(Stage::CollectConstraints, &ctx);
        assert!(types.is_empty());
    }

    #[test]
    fn scheduling_stage_routes_review_and_gap_fillers() {
        let ctx = RoutingContext { has_gaps: true, ..Default::default() };
        let types = route_event_types(Stage::ReviewCommit, &ctx);
        assert!(types.contains(&"PR".to_string()));
        assert!(types.contains(&"BU".to_string()));
        assert!(types.contains(&"BG".to_string()));
    }

    #[test]
    fn scheduling_stage_also_routes_frame_event_types_alongside_deep_and_shallow_work() {
        let ctx = RoutingContext {
            has_immovables: true,
            has_commutes: true,
            has_sleep_target: true,
            has_habits: true,
            has_gaps: false,
        };
        let types = route_event_types(Stage::Refine, &ctx);
        // DW/SW (startup set) and M/C/R/H (frame set) are independent, not
        // mutually exclusive — Refine routes both at once.
        assert!(types.contains(&"DW".to_string()));
        assert!(types.contains(&"SW".to_string()));
        assert!(types.contains(&"M".to_string()));
        assert!(types.contains(&"C".to_string()));
        assert!(types.contains(&"R".to_string()));
        assert!(types.contains(&"H".to_string()));
    }

    #[test]
    fn collect_constraints_routes_frame_event_types_when_context_present() {
        let ctx = RoutingContext { has_immovables: true, has_habits: true, ..Default::default() };
        let types = route_event_types(Stage::CollectConstraints, &ctx);
        assert!(types.contains(&"M".to_string()));
        assert!(types.contains(&"H".to_string()));
        assert!(!types.contains(&"DW".to_string()));
        assert!(!types.contains(&"PR".to_string()));
    }

    #[tokio::test]
    async fn collect_stage_prefers_startup_prefetch_over_broad_query() {
        let store = InMemoryConstraintStore::new();
        store
            .upsert_constraint(record("Sleep target", "sleep_window", ConstraintScope::Profile, vec![STARTUP_PREFETCH_TOPIC.into()]))
            .await
            .unwrap();
        store
            .upsert_constraint(record("Unrelated", "avoid_window", ConstraintScope::Session, vec![]))
            .await
            .unwrap();

        let results = retrieve_constraints(&store, Stage::CollectConstraints, date(), &RoutingContext::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Sleep target");
    }

    #[tokio::test]
    async fn collect_stage_falls_back_to_broad_query_when_prefetch_empty() {
        let store = InMemoryConstraintStore::new();
        store
            .upsert_constraint(record("General rule", "avoid_window", ConstraintScope::Profile, vec![]))
            .await
            .unwrap();

        let results = retrieve_constraints(&store, Stage::CollectConstraints, date(), &RoutingContext::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "General rule");
    }

    #[test]
    fn suppressed_uids_are_excluded() {
        let mut r = record("X", "avoid_window", ConstraintScope::Profile, vec![]);
        r.uid = "abc".into();
        let filtered = exclude_suppressed(vec![r], &["abc".to_string()]);
        assert!(filtered.is_empty());
    }
}
