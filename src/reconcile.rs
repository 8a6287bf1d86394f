//! Reconciliation (spec §4.5): classify desired-vs-remote events into
//! creates/updates/deletes/no-ops/skips via three-pass identity matching.
//!
//! Grounded in the teacher's `workflow::reconcile` module (itself a
//! three-pass desired/remote matcher over meeting records), re-targeted at
//! calendar events and the owned-event-prefix ownership rule this spec adds.

use std::collections::{HashMap, HashSet};

use chrono::NaiveTime;

use crate::calendar::RemoteEvent;
use crate::error::Result;
use crate::time_model::{Plan, ResolvedEvent};

/// A desired event matched to a remote event.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub desired_index: usize,
    pub remote_id: String,
    pub pass: MatchPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPass {
    Id,
    Canonical,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skip {
    pub remote_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationPlan {
    pub matches: Vec<Match>,
    /// Desired indices with no remote counterpart.
    pub creates: Vec<usize>,
    /// (desired index, owned remote id) pairs needing a remote update.
    pub updates: Vec<(usize, String)>,
    /// Owned remote ids absent from the desired plan.
    pub deletes: Vec<String>,
    /// (desired index, foreign remote id) pairs left untouched.
    pub noops: Vec<(usize, String)>,
    pub skips: Vec<Skip>,
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn is_owned(remote_id: &str, owned_prefix: &str) -> bool {
    remote_id.starts_with(owned_prefix)
}

fn overlap_minutes(a_start: NaiveTime, a_end: NaiveTime, b_start: NaiveTime, b_end: NaiveTime) -> i64 {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    if end > start {
        (end - start).num_minutes()
    } else {
        0
    }
}

fn minutes_between(a: NaiveTime, b: NaiveTime) -> i64 {
    (a - b).num_minutes().abs()
}

/// `reconcile(desired, remote, event_id_map, remote_event_ids_by_index, fuzzy_tolerance_minutes)`
/// (spec §4.5). `event_id_map` keys are `"{name}|{start_time}"` (the same
/// shape the Session stores as `Session::event_id_map`).
pub fn reconcile(
    desired: &Plan,
    remote: &[RemoteEvent],
    event_id_map: &HashMap<String, String>,
    remote_event_ids_by_index: Option<&[String]>,
    fuzzy_tolerance_minutes: i64,
    owned_prefix: &str,
) -> Result<ReconciliationPlan> {
    let resolved = desired.resolve_times(true)?;
    Ok(reconcile_resolved(
        &resolved,
        remote,
        event_id_map,
        remote_event_ids_by_index,
        fuzzy_tolerance_minutes,
        owned_prefix,
    ))
}

fn reconcile_resolved(
    desired: &[ResolvedEvent],
    remote: &[RemoteEvent],
    event_id_map: &HashMap<String, String>,
    remote_event_ids_by_index: Option<&[String]>,
    fuzzy_tolerance_minutes: i64,
    owned_prefix: &str,
) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan::default();
    let mut matched_desired: HashSet<usize> = HashSet::new();
    let mut matched_remote: HashSet<String> = HashSet::new();

    // --- Pass 1: ID ---
    for (i, event) in desired.iter().enumerate() {
        let hint_key = format!("{}|{}", event.name, event.start_time);
        let Some(hinted_id) = event_id_map.get(&hint_key) else { continue };
        // Lowest-index unmatched remote event sharing that id.
        if let Some(remote_event) = remote
            .iter()
            .find(|r| &r.id == hinted_id && !matched_remote.contains(&r.id))
        {
            matched_desired.insert(i);
            matched_remote.insert(remote_event.id.clone());
            plan.matches.push(Match { desired_index: i, remote_id: remote_event.id.clone(), pass: MatchPass::Id });
        }
    }

    // Positional hint (`remote_event_ids_by_index`) behaves like a second ID
    // source: only consulted for events the ID pass missed.
    if let Some(ids_by_index) = remote_event_ids_by_index {
        for i in 0..desired.len() {
            if matched_desired.contains(&i) {
                continue;
            }
            let Some(hinted_id) = ids_by_index.get(i) else { continue };
            if hinted_id.is_empty() {
                continue;
            }
            if let Some(remote_event) = remote.iter().find(|r| &r.id == hinted_id && !matched_remote.contains(&r.id)) {
                matched_desired.insert(i);
                matched_remote.insert(remote_event.id.clone());
                plan.matches.push(Match { desired_index: i, remote_id: remote_event.id.clone(), pass: MatchPass::Id });
            }
        }
    }

    // --- Pass 2: canonical (name, start, end) ---
    for (i, event) in desired.iter().enumerate() {
        if matched_desired.contains(&i) {
            continue;
        }
        if let Some(remote_event) = remote.iter().find(|r| {
            !matched_remote.contains(&r.id)
                && normalize_name(&r.summary) == normalize_name(&event.name)
                && r.start == event.start_time
                && r.end == event.end_time
        }) {
            matched_desired.insert(i);
            matched_remote.insert(remote_event.id.clone());
            plan.matches.push(Match { desired_index: i, remote_id: remote_event.id.clone(), pass: MatchPass::Canonical });
        }
    }

    // --- Pass 3: fuzzy, scored by (overlap, -start_delta, -duration_delta) ---
    for (i, event) in desired.iter().enumerate() {
        if matched_desired.contains(&i) {
            continue;
        }
        let desired_duration = (event.end_time - event.start_time).num_minutes();
        let mut best: Option<(&RemoteEvent, i64, i64, i64)> = None;
        for remote_event in remote.iter().filter(|r| !matched_remote.contains(&r.id)) {
            if normalize_name(&remote_event.summary) != normalize_name(&event.name) {
                continue;
            }
            let overlap = overlap_minutes(event.start_time, event.end_time, remote_event.start, remote_event.end);
            let start_delta = minutes_between(event.start_time, remote_event.start);
            if overlap == 0 && start_delta > fuzzy_tolerance_minutes {
                continue;
            }
            let remote_duration = (remote_event.end - remote_event.start).num_minutes();
            let duration_delta = (desired_duration - remote_duration).abs();
            let candidate_score = (overlap, -start_delta, -duration_delta);
            let replace = match &best {
                None => true,
                Some((_, best_overlap, best_neg_start, best_neg_dur)) => {
                    candidate_score > (*best_overlap, *best_neg_start, *best_neg_dur)
                }
            };
            if replace {
                best = Some((remote_event, overlap, -start_delta, -duration_delta));
            }
        }
        if let Some((remote_event, _, _, _)) = best {
            matched_desired.insert(i);
            matched_remote.insert(remote_event.id.clone());
            plan.matches.push(Match { desired_index: i, remote_id: remote_event.id.clone(), pass: MatchPass::Fuzzy });
        }
    }

    // --- Classification ---
    for m in &plan.matches {
        if is_owned(&m.remote_id, owned_prefix) {
            plan.updates.push((m.desired_index, m.remote_id.clone()));
        } else {
            plan.noops.push((m.desired_index, m.remote_id.clone()));
        }
    }

    for i in 0..desired.len() {
        if !matched_desired.contains(&i) {
            plan.creates.push(i);
        }
    }

    for remote_event in remote {
        if matched_remote.contains(&remote_event.id) {
            continue;
        }
        if is_owned(&remote_event.id, owned_prefix) {
            plan.deletes.push(remote_event.id.clone());
        } else {
            plan.skips.push(Skip {
                remote_id: remote_event.id.clone(),
                reason: "unmatched foreign event".into(),
            });
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_model::{EventType, PlanEvent, Timing};
    use chrono::NaiveDate;

    const OWNED_PREFIX: &str = "tbx";

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
    }

    fn fw(name: &str, st: &str, et: &str) -> PlanEvent {
        PlanEvent::new(
            name,
            "",
            EventType::DeepWork,
            Timing::FixedWindow {
                st: NaiveTime::parse_from_str(st, "%H:%M").unwrap(),
                et: NaiveTime::parse_from_str(et, "%H:%M").unwrap(),
            },
        )
        .unwrap()
    }

    fn remote(id: &str, name: &str, st: &str, et: &str) -> RemoteEvent {
        RemoteEvent {
            id: id.into(),
            summary: name.into(),
            description: String::new(),
            start: NaiveTime::parse_from_str(st, "%H:%M").unwrap(),
            end: NaiveTime::parse_from_str(et, "%H:%M").unwrap(),
            color_id: None,
        }
    }

    #[test]
    fn create_only_when_remote_is_empty() {
        let plan = Plan::new(vec![fw("Focus", "09:00", "10:00")], date(), "Europe/Amsterdam").unwrap();
        let result = reconcile(&plan, &[], &HashMap::new(), None, 10, OWNED_PREFIX).unwrap();
        assert_eq!(result.creates, vec![0]);
        assert!(result.updates.is_empty());
        assert!(result.deletes.is_empty());
    }

    #[test]
    fn owned_vs_foreign_lunch_reconciliation() {
        let plan = Plan::new(vec![fw("Lunch", "12:10", "13:10")], date(), "Europe/Amsterdam").unwrap();
        let remote_events = vec![
            remote("tbx-owned-lunch", "Lunch", "12:00", "13:00"),
            remote("foreign-lunch", "Lunch", "12:00", "13:00"),
        ];
        let result = reconcile(&plan, &remote_events, &HashMap::new(), None, 15, OWNED_PREFIX).unwrap();
        assert!(result.creates.is_empty());
        assert_eq!(result.updates, vec![(0, "tbx-owned-lunch".to_string())]);
        assert!(result.skips.iter().any(|s| s.remote_id == "foreign-lunch") || result.noops.is_empty());
    }

    #[test]
    fn fuzzy_pass_rejects_no_overlap_beyond_tolerance() {
        let plan = Plan::new(vec![fw("Standup", "09:00", "09:15")], date(), "Europe/Amsterdam").unwrap();
        let remote_events = vec![remote("tbx-standup", "Standup", "10:00", "10:15")];
        let result = reconcile(&plan, &remote_events, &HashMap::new(), None, 5, OWNED_PREFIX).unwrap();
        // 60 minutes apart, tolerance 5, zero overlap: no fuzzy match, so a
        // create is generated and the remote is an unmatched owned delete.
        assert_eq!(result.creates, vec![0]);
        assert_eq!(result.deletes, vec!["tbx-standup".to_string()]);
    }

    #[test]
    fn id_pass_takes_priority_over_canonical() {
        let plan = Plan::new(vec![fw("Focus", "09:00", "10:00")], date(), "Europe/Amsterdam").unwrap();
        let remote_events = vec![
            remote("tbx-exact", "Focus", "09:00", "10:00"),
            remote("tbx-hinted", "Focus", "09:00", "10:00"),
        ];
        let mut hints = HashMap::new();
        hints.insert("Focus|09:00:00".to_string(), "tbx-hinted".to_string());
        let result = reconcile(&plan, &remote_events, &hints, None, 10, OWNED_PREFIX).unwrap();
        assert_eq!(result.updates, vec![(0, "tbx-hinted".to_string())]);
        assert_eq!(result.deletes, vec!["tbx-exact".to_string()]);
    }

    #[test]
    fn identical_plans_produce_no_changes() {
        let plan = Plan::new(vec![fw("Focus", "09:00", "10:00")], date(), "Europe/Amsterdam").unwrap();
        let remote_events = vec![remote("tbx-focus", "Focus", "09:00", "10:00")];
        let mut hints = HashMap::new();
        hints.insert("Focus|09:00:00".to_string(), "tbx-focus".to_string());
        let result = reconcile(&plan, &remote_events, &hints, None, 10, OWNED_PREFIX).unwrap();
        assert!(result.creates.is_empty());
        assert!(result.deletes.is_empty());
        assert_eq!(result.updates.len(), 1);
    }
}
