//! Sync Engine (spec §4.6): turn a [`ReconciliationPlan`] into an ordered
//! transaction of remote calendar mutations, execute it through a
//! [`CalendarCapability`] with halt-on-first-error semantics, and provide a
//! compensating undo.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::calendar::{CalendarCapability, EventPayload, RemoteEvent};
use crate::error::{Result, TimeboxError};
use crate::reconcile::reconcile;
use crate::time_model::{EventType, Plan};

pub const OWNED_PREFIX: &str = "tbx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// One ordered mutation in a [`SyncTransaction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOp {
    pub kind: OpKind,
    pub tool_name: String,
    pub event_id: String,
    #[serde(default)]
    pub before: Option<EventPayload>,
    #[serde(default)]
    pub after: Option<EventPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub ok: bool,
    pub event_id: String,
    #[serde(default)]
    pub content: Option<EventPayload>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Committed,
    Partial,
    PartialHalted,
    Undone,
    UndoPartial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTransaction {
    pub calendar_id: String,
    pub ops: Vec<SyncOp>,
    pub results: Vec<OpResult>,
    pub status: TransactionStatus,
}

impl SyncTransaction {
    fn pending(calendar_id: impl Into<String>, ops: Vec<SyncOp>) -> Self {
        SyncTransaction {
            calendar_id: calendar_id.into(),
            ops,
            results: Vec::new(),
            status: TransactionStatus::Pending,
        }
    }
}

fn synthesize_owned_id(date: NaiveDate, name: &str, start_iso: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{date}|{name}|{start_iso}|{index}").as_bytes());
    let digest = hasher.finalize();
    format!("{OWNED_PREFIX}{}", &hex::encode(digest)[..20])
}

fn local_iso(date: NaiveDate, time: chrono::NaiveTime) -> String {
    format!("{}", date.and_time(time).format("%Y-%m-%dT%H:%M:%S"))
}

/// Structural fields SYNC diffs to decide whether an `update` op is needed
/// (spec §4.6: "only if at least one of {summary, start, end, description,
/// color} changed").
fn payload_changed(before: &EventPayload, after: &EventPayload) -> bool {
    before.summary != after.summary
        || before.description != after.description
        || before.start != after.start
        || before.end != after.end
        || before.color_id != after.color_id
}

/// `plan_sync(remote, desired, event_id_map, remote_ids_by_index, calendar_id)`.
/// Derives ops in `(creates, updates, deletes)` order so any follow-up undo
/// references can see newly-minted ids.
#[allow(clippy::too_many_arguments)]
pub fn plan_sync(
    remote: &[RemoteEvent],
    desired: &Plan,
    event_id_map: &HashMap<String, String>,
    remote_ids_by_index: Option<&[String]>,
    calendar_id: &str,
    fuzzy_tolerance_minutes: i64,
) -> Result<Vec<SyncOp>> {
    let reconciled = reconcile(desired, remote, event_id_map, remote_ids_by_index, fuzzy_tolerance_minutes, OWNED_PREFIX)?;
    let resolved = desired.resolve_times(true)?;
    let remote_by_id: HashMap<&str, &RemoteEvent> = remote.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut ops = Vec::new();

    for &index in &reconciled.creates {
        let event = &resolved[index];
        let plan_event = &desired.events[index];
        let start_iso = local_iso(desired.date, event.start_time);
        let end_iso = local_iso(desired.date, event.end_time);
        let payload = EventPayload {
            summary: event.name.clone(),
            description: plan_event.description.clone(),
            start: start_iso.clone(),
            end: end_iso,
            time_zone: desired.tz.clone(),
            color_id: event.event_type.color_id().to_string(),
        };
        let event_id = synthesize_owned_id(desired.date, &event.name, &start_iso, index);
        ops.push(SyncOp {
            kind: OpKind::Create,
            tool_name: "create_event".into(),
            event_id,
            before: None,
            after: Some(payload),
        });
    }

    for &(index, ref remote_id) in &reconciled.updates {
        let event = &resolved[index];
        let plan_event = &desired.events[index];
        let after = EventPayload {
            summary: event.name.clone(),
            description: plan_event.description.clone(),
            start: local_iso(desired.date, event.start_time),
            end: local_iso(desired.date, event.end_time),
            time_zone: desired.tz.clone(),
            color_id: event.event_type.color_id().to_string(),
        };
        let before = remote_by_id.get(remote_id.as_str()).map(|r| EventPayload {
            summary: r.summary.clone(),
            description: r.description.clone(),
            start: local_iso(desired.date, r.start),
            end: local_iso(desired.date, r.end),
            time_zone: desired.tz.clone(),
            color_id: r.color_id.clone().unwrap_or_else(|| EventType::Meeting.color_id().to_string()),
        });
        let needs_update = match &before {
            Some(before) => payload_changed(before, &after),
            None => true,
        };
        if !needs_update {
            continue;
        }
        ops.push(SyncOp {
            kind: OpKind::Update,
            tool_name: "update_event".into(),
            event_id: remote_id.clone(),
            before,
            after: Some(after),
        });
    }

    for remote_id in &reconciled.deletes {
        let before = remote_by_id.get(remote_id.as_str()).map(|r| EventPayload {
            summary: r.summary.clone(),
            description: r.description.clone(),
            start: local_iso(desired.date, r.start),
            end: local_iso(desired.date, r.end),
            time_zone: desired.tz.clone(),
            color_id: r.color_id.clone().unwrap_or_else(|| EventType::Meeting.color_id().to_string()),
        });
        ops.push(SyncOp {
            kind: OpKind::Delete,
            tool_name: "delete_event".into(),
            event_id: remote_id.clone(),
            before,
            after: None,
        });
    }

    Ok(ops)
}

/// Execute `ops` through `capability`, halting on the first failure when
/// `halt_on_error` is set. Per-op results are recorded even on failure so
/// `undo_sync` can later tell exactly which ops applied.
pub async fn execute_sync(
    capability: &dyn CalendarCapability,
    calendar_id: &str,
    ops: Vec<SyncOp>,
    halt_on_error: bool,
) -> SyncTransaction {
    let mut txn = SyncTransaction::pending(calendar_id, ops);
    let mut halted = false;

    for op in &txn.ops {
        if halted {
            break;
        }
        let outcome = match op.kind {
            OpKind::Create => {
                let payload = op.after.as_ref().expect("create op always carries `after`");
                capability.create_event(calendar_id, payload).await.map(|e| e.id)
            }
            OpKind::Update => {
                let payload = op.after.as_ref().expect("update op always carries `after`");
                capability.update_event(calendar_id, &op.event_id, payload).await.map(|e| e.id)
            }
            OpKind::Delete => capability.delete_event(calendar_id, &op.event_id).await.map(|_| op.event_id.clone()),
        };

        match outcome {
            Ok(event_id) => {
                txn.results.push(OpResult { ok: true, event_id, content: op.after.clone(), error: None });
            }
            Err(err) => {
                txn.results.push(OpResult { ok: false, event_id: op.event_id.clone(), content: None, error: Some(err.to_string()) });
                if halt_on_error {
                    halted = true;
                }
            }
        }
    }

    txn.status = if halted {
        TransactionStatus::PartialHalted
    } else if txn.results.iter().all(|r| r.ok) {
        TransactionStatus::Committed
    } else {
        TransactionStatus::Partial
    };
    txn
}

/// Compensating undo over the reverse of successfully-executed ops:
/// `create -> delete(id)`, `update -> update(before)`, `delete -> create(before)`.
/// Raises `BackendUnavailable`-style `TimeboxError` ("no guessing which ops
/// applied") when the source transaction's `results` don't line up with its
/// `ops` one-to-one (spec §4.6, §9 Open Question).
pub async fn undo_sync(capability: &dyn CalendarCapability, source: &SyncTransaction) -> Result<SyncTransaction> {
    if source.results.len() != source.ops.len() {
        return Err(TimeboxError::BackendUnavailable {
            label: "sync-undo".into(),
            reason: "source transaction results do not cover every op; cannot infer which ops applied".into(),
        });
    }

    let mut reverse_ops = Vec::new();
    for (op, result) in source.ops.iter().zip(&source.results).rev() {
        if !result.ok {
            continue;
        }
        let reverse = match op.kind {
            OpKind::Create => SyncOp {
                kind: OpKind::Delete,
                tool_name: "delete_event".into(),
                event_id: result.event_id.clone(),
                before: op.after.clone(),
                after: None,
            },
            OpKind::Update => SyncOp {
                kind: OpKind::Update,
                tool_name: "update_event".into(),
                event_id: op.event_id.clone(),
                before: op.after.clone(),
                after: op.before.clone(),
            },
            OpKind::Delete => SyncOp {
                kind: OpKind::Create,
                tool_name: "create_event".into(),
                event_id: op.event_id.clone(),
                before: None,
                after: op.before.clone(),
            },
        };
        reverse_ops.push(reverse);
    }

    let mut txn = execute_sync(capability, &source.calendar_id, reverse_ops, true).await;
    txn.status = if txn.results.iter().all(|r| r.ok) {
        TransactionStatus::Undone
    } else {
        TransactionStatus::UndoPartial
    };
    Ok(txn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_model::{PlanEvent, Timing};
    use async_trait::async_trait;
    use chrono::NaiveTime;
    use parking_lot::Mutex;

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

    struct FakeCapability {
        next_id: Mutex<u32>,
        fail_on: Option<String>,
    }

    impl FakeCapability {
        fn new() -> Self {
            FakeCapability { next_id: Mutex::new(0), fail_on: None }
        }
    }

    #[async_trait]
    impl CalendarCapability for FakeCapability {
        async fn list_day_events(&self, _calendar_id: &str, _local_day: NaiveDate, _tz: &str) -> Result<crate::calendar::DaySnapshot> {
            Ok(Default::default())
        }
        async fn get_event(&self, _calendar_id: &str, _event_id: &str) -> Result<Option<RemoteEvent>> {
            Ok(None)
        }
        async fn create_event(&self, _calendar_id: &str, payload: &EventPayload) -> Result<RemoteEvent> {
            if self.fail_on.as_deref() == Some(payload.summary.as_str()) {
                return Err(TimeboxError::Rpc { tool: "create_event".into(), payload: "boom".into() });
            }
            let mut next = self.next_id.lock();
            *next += 1;
            Ok(RemoteEvent {
                id: format!("fake-{next}"),
                summary: payload.summary.clone(),
                description: payload.description.clone(),
                start: NaiveTime::parse_from_str(&payload.start.split('T').nth(1).unwrap()[..8], "%H:%M:%S").unwrap(),
                end: NaiveTime::parse_from_str(&payload.end.split('T').nth(1).unwrap()[..8], "%H:%M:%S").unwrap(),
                color_id: Some(payload.color_id.clone()),
            })
        }
        async fn update_event(&self, _calendar_id: &str, event_id: &str, payload: &EventPayload) -> Result<RemoteEvent> {
            Ok(RemoteEvent {
                id: event_id.to_string(),
                summary: payload.summary.clone(),
                description: payload.description.clone(),
                start: NaiveTime::parse_from_str(&payload.start.split('T').nth(1).unwrap()[..8], "%H:%M:%S").unwrap(),
                end: NaiveTime::parse_from_str(&payload.end.split('T').nth(1).unwrap()[..8], "%H:%M:%S").unwrap(),
                color_id: Some(payload.color_id.clone()),
            })
        }
        async fn delete_event(&self, _calendar_id: &str, _event_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn create_only_sync_yields_expected_payload() {
        let plan = Plan::new(vec![fw("Focus", "09:00", "10:00")], date(), "Europe/Amsterdam").unwrap();
        let ops = plan_sync(&[], &plan, &HashMap::new(), None, "primary", 10).unwrap();
        assert_eq!(ops.len(), 1);
        let SyncOp { kind, event_id, after, .. } = &ops[0];
        assert_eq!(*kind, OpKind::Create);
        assert!(event_id.starts_with(OWNED_PREFIX));
        let after = after.as_ref().unwrap();
        assert_eq!(after.start, "2026-02-13T09:00:00");
        assert_eq!(after.end, "2026-02-13T10:00:00");
        assert_eq!(after.time_zone, "Europe/Amsterdam");
    }

    #[test]
    fn identical_plans_produce_no_ops() {
        let plan = Plan::new(vec![fw("Focus", "09:00", "10:00")], date(), "Europe/Amsterdam").unwrap();
        let remote_events = vec![RemoteEvent {
            id: format!("{OWNED_PREFIX}focus"),
            summary: "Focus".into(),
            description: String::new(),
            start: NaiveTime::parse_from_str("09:00", "%H:%M").unwrap(),
            end: NaiveTime::parse_from_str("10:00", "%H:%M").unwrap(),
            color_id: Some(EventType::DeepWork.color_id().to_string()),
        }];
        let mut hints = HashMap::new();
        hints.insert("Focus|09:00:00".to_string(), remote_events[0].id.clone());
        let ops = plan_sync(&remote_events, &plan, &hints, None, "primary", 10).unwrap();
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn execute_sync_halts_on_first_error() {
        let plan = Plan::new(
            vec![fw("Good", "09:00", "09:30"), fw("Bad", "10:00", "10:30")],
            date(),
            "Europe/Amsterdam",
        )
        .unwrap();
        let ops = plan_sync(&[], &plan, &HashMap::new(), None, "primary", 10).unwrap();
        assert_eq!(ops.len(), 2);

        let capability = FakeCapability { next_id: Mutex::new(0), fail_on: Some("Bad".to_string()) };
        let txn = execute_sync(&capability, "primary", ops, true).await;
        assert_eq!(txn.status, TransactionStatus::PartialHalted);
        assert_eq!(txn.results.len(), 2);
        assert!(txn.results[0].ok);
        assert!(!txn.results[1].ok);
    }

    #[tokio::test]
    async fn undo_reverses_create_update_delete_in_order() {
        let create_op = SyncOp {
            kind: OpKind::Create,
            tool_name: "create_event".into(),
            event_id: "placeholder".into(),
            before: None,
            after: Some(EventPayload {
                summary: "A".into(),
                description: String::new(),
                start: "2026-02-13T09:00:00".into(),
                end: "2026-02-13T09:30:00".into(),
                time_zone: "Europe/Amsterdam".into(),
                color_id: "9".into(),
            }),
        };
        let update_before = EventPayload {
            summary: "B-old".into(),
            description: String::new(),
            start: "2026-02-13T10:00:00".into(),
            end: "2026-02-13T10:30:00".into(),
            time_zone: "Europe/Amsterdam".into(),
            color_id: "9".into(),
        };
        let update_after = EventPayload { summary: "B-new".into(), ..update_before.clone() };
        let update_op = SyncOp {
            kind: OpKind::Update,
            tool_name: "update_event".into(),
            event_id: "fake-B".into(),
            before: Some(update_before.clone()),
            after: Some(update_after.clone()),
        };
        let delete_before = EventPayload {
            summary: "C".into(),
            description: String::new(),
            start: "2026-02-13T11:00:00".into(),
            end: "2026-02-13T11:30:00".into(),
            time_zone: "Europe/Amsterdam".into(),
            color_id: "9".into(),
        };
        let delete_op = SyncOp {
            kind: OpKind::Delete,
            tool_name: "delete_event".into(),
            event_id: "fake-C".into(),
            before: Some(delete_before.clone()),
            after: None,
        };

        let capability = FakeCapability::new();
        let results = vec![
            OpResult { ok: true, event_id: "fake-1".into(), content: create_op.after.clone(), error: None },
            OpResult { ok: true, event_id: "fake-B".into(), content: update_op.after.clone(), error: None },
            OpResult { ok: true, event_id: "fake-C".into(), content: None, error: None },
        ];
        let source = SyncTransaction {
            calendar_id: "primary".into(),
            ops: vec![create_op, update_op, delete_op],
            results,
            status: TransactionStatus::Committed,
        };

        let undone = undo_sync(&capability, &source).await.unwrap();
        assert_eq!(undone.status, TransactionStatus::Undone);
        assert_eq!(undone.ops.len(), 3);
        // Reverse of [create, update, delete] is [create C, update B-before, delete A].
        assert_eq!(undone.ops[0].kind, OpKind::Create);
        assert_eq!(undone.ops[0].after.as_ref().unwrap().summary, "C");
        assert_eq!(undone.ops[1].kind, OpKind::Update);
        assert_eq!(undone.ops[1].after.as_ref().unwrap().summary, "B-old");
        assert_eq!(undone.ops[2].kind, OpKind::Delete);
        assert_eq!(undone.ops[2].event_id, "fake-1");
    }

    #[tokio::test]
    async fn undo_rejects_incomplete_results() {
        let capability = FakeCapability::new();
        let source = SyncTransaction {
            calendar_id: "primary".into(),
            ops: vec![SyncOp {
                kind: OpKind::Create,
                tool_name: "create_event".into(),
                event_id: "x".into(),
                before: None,
                after: None,
            }],
            results: vec![],
            status: TransactionStatus::PartialHalted,
        };
        let err = undo_sync(&capability, &source).await.unwrap_err();
        assert!(matches!(err, TimeboxError::BackendUnavailable { .. }));
    }
}
