//! Patch Operations: five typed domain ops over a [`Plan`], and a
//! deterministic `apply()`.

use serde::{Deserialize, Serialize};

use crate::error::{TimeboxError, ValidationError};
use crate::time_model::{EventType, Plan, PlanEvent, Timing};

/// Partial field set for [`PatchOp::UpdateEvent`]. Only set fields are merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFields {
    #[serde(rename = "n", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "d", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
}

/// One typed patch operation, tagged on discriminator `op`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum PatchOp {
    /// Replace the entire event list. Reserved for full rebuilds.
    #[serde(rename = "ra")]
    ReplaceAll { events: Vec<PlanEvent> },
    /// Insert one or more events after a given index (`None` = prepend).
    #[serde(rename = "ae")]
    AddEvents {
        events: Vec<PlanEvent>,
        #[serde(skip_serializing_if = "Option::is_none")]
        after: Option<usize>,
    },
    /// Remove the event at index `i`.
    #[serde(rename = "re")]
    RemoveEvent { i: usize },
    /// Merge partial field changes onto the event at index `i`.
    #[serde(rename = "ue")]
    UpdateEvent { i: usize, fields: EventFields },
    /// Move the event at index `fr` to index `to` (clamped to bounds).
    #[serde(rename = "me")]
    MoveEvent { fr: usize, to: usize },
}

/// A sequence of [`PatchOp`]s to apply atomically to a [`Plan`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

/// Apply `patch` to `plan`, returning a new, fully revalidated [`Plan`].
///
/// Indices are bounds-checked per op. `ue` merges only explicitly-set
/// fields. `me` clamps its target index into `[0, len]`. The final plan is
/// revalidated end-to-end; validation errors propagate unchanged so the
/// Patcher can turn them into retry feedback.
pub fn apply(plan: &Plan, patch: &Patch) -> Result<Plan, TimeboxError> {
    let mut events = plan.events.clone();

    for op in &patch.ops {
        match op {
            PatchOp::ReplaceAll { events: new_events } => {
                events = new_events.clone();
            }
            PatchOp::AddEvents { events: new_events, after } => {
                let insert_at = match after {
                    None => 0,
                    Some(idx) => (*idx + 1).min(events.len()),
                };
                for (offset, event) in new_events.iter().cloned().enumerate() {
                    events.insert(insert_at + offset, event);
                }
            }
            PatchOp::RemoveEvent { i } => {
                check_index(*i, events.len())?;
                events.remove(*i);
            }
            PatchOp::UpdateEvent { i, fields } => {
                check_index(*i, events.len())?;
                let event = &mut events[*i];
                if let Some(name) = &fields.name {
                    event.name = name.clone();
                }
                if let Some(description) = &fields.description {
                    event.description = description.clone();
                }
                if let Some(event_type) = fields.event_type {
                    event.event_type = event_type;
                }
                if let Some(timing) = &fields.timing {
                    event.timing = timing.clone();
                }
            }
            PatchOp::MoveEvent { fr, to } => {
                check_index(*fr, events.len())?;
                let clamped_to = (*to).min(events.len().saturating_sub(1));
                let event = events.remove(*fr);
                events.insert(clamped_to, event);
            }
        }
    }

    Plan::new(events, plan.date, plan.tz.clone())
        .map_err(|e: ValidationError| TimeboxError::Validation(e))
}

fn check_index(i: usize, len: usize) -> Result<(), TimeboxError> {
    if i >= len {
        return Err(TimeboxError::IndexError { index: i, len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_model::IsoDuration;
    use chrono::{NaiveDate, NaiveTime};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
    }

    fn meeting(name: &str, st: &str, et: &str) -> PlanEvent {
        PlanEvent::new(
            name,
            "",
            EventType::Meeting,
            Timing::FixedWindow {
                st: NaiveTime::parse_from_str(st, "%H:%M").unwrap(),
                et: NaiveTime::parse_from_str(et, "%H:%M").unwrap(),
            },
        )
        .unwrap()
    }

    fn base_plan() -> Plan {
        Plan::new(vec![meeting("Meeting", "10:00", "11:00")], date(), "Europe/Amsterdam").unwrap()
    }

    #[test]
    fn add_events_inserts_after_given_index() {
        let plan = base_plan();
        let patch = Patch {
            ops: vec![PatchOp::AddEvents {
                events: vec![meeting("Lunch", "12:00", "13:00")],
                after: Some(0),
            }],
        };
        let new_plan = apply(&plan, &patch).unwrap();
        assert_eq!(new_plan.events.len(), 2);
        assert_eq!(new_plan.events[1].name, "Lunch");
    }

    #[test]
    fn add_events_with_no_after_prepends() {
        let plan = base_plan();
        let patch = Patch {
            ops: vec![PatchOp::AddEvents {
                events: vec![meeting("Standup", "09:00", "09:15")],
                after: None,
            }],
        };
        let new_plan = apply(&plan, &patch).unwrap();
        assert_eq!(new_plan.events[0].name, "Standup");
    }

    #[test]
    fn update_event_merges_only_set_fields() {
        let plan = base_plan();
        let patch = Patch {
            ops: vec![PatchOp::UpdateEvent {
                i: 0,
                fields: EventFields {
                    description: Some("moved".into()),
                    ..Default::default()
                },
            }],
        };
        let new_plan = apply(&plan, &patch).unwrap();
        assert_eq!(new_plan.events[0].name, "Meeting");
        assert_eq!(new_plan.events[0].description, "moved");
    }

    #[test]
    fn remove_event_out_of_range_is_index_error() {
        let plan = base_plan();
        let patch = Patch {
            ops: vec![PatchOp::RemoveEvent { i: 5 }],
        };
        let err = apply(&plan, &patch).unwrap_err();
        assert!(matches!(err, TimeboxError::IndexError { index: 5, len: 1 }));
    }

    #[test]
    fn move_event_clamps_target_index() {
        let mut plan = base_plan();
        plan.events.push(meeting("Lunch", "12:00", "13:00"));
        let patch = Patch {
            ops: vec![PatchOp::MoveEvent { fr: 0, to: 99 }],
        };
        let new_plan = apply(&plan, &patch).unwrap();
        assert_eq!(new_plan.events.last().unwrap().name, "Meeting");
    }

    #[test]
    fn apply_revalidates_and_propagates_errors() {
        let plan = base_plan();
        let patch = Patch {
            ops: vec![PatchOp::AddEvents {
                events: vec![meeting("Overlap", "10:30", "11:30")],
                after: Some(0),
            }],
        };
        let err = apply(&plan, &patch).unwrap_err();
        assert!(matches!(
            err,
            TimeboxError::Validation(ValidationError::Overlap { .. })
        ));
    }

    #[test]
    fn replace_all_requires_an_anchor() {
        let plan = base_plan();
        let patch = Patch {
            ops: vec![PatchOp::ReplaceAll { events: vec![] }],
        };
        let err = apply(&plan, &patch).unwrap_err();
        assert!(matches!(
            err,
            TimeboxError::Validation(ValidationError::NoAnchor)
        ));
    }
}
