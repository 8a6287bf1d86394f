//! Time Model: typed plan events, timing variants, and `resolve_times()`.
//!
//! A [`Plan`] is an ordered sequence of [`PlanEvent`]s for one local date and
//! timezone. Events carry a [`Timing`] variant instead of a concrete
//! start/end; [`Plan::resolve_times`] turns the chain into concrete local
//! times via a forward pass (anchors, after-previous) followed by a backward
//! pass (before-next).

use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The nine event-type codes, each mapped to an external calendar color id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "M")]
    Meeting,
    #[serde(rename = "C")]
    Commute,
    #[serde(rename = "DW")]
    DeepWork,
    #[serde(rename = "SW")]
    ShallowWork,
    #[serde(rename = "PR")]
    PlanReview,
    #[serde(rename = "H")]
    Habit,
    #[serde(rename = "R")]
    Regeneration,
    #[serde(rename = "BU")]
    Buffer,
    #[serde(rename = "BG")]
    Background,
}

impl EventType {
    /// Google-Calendar-style color id, matching the reference palette.
    pub fn color_id(self) -> &'static str {
        match self {
            EventType::Meeting => "1",
            EventType::Commute => "8",
            EventType::DeepWork => "9",
            EventType::ShallowWork => "5",
            EventType::PlanReview => "7",
            EventType::Habit => "10",
            EventType::Regeneration => "2",
            EventType::Buffer => "11",
            EventType::Background => "0",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            EventType::Meeting => "M",
            EventType::Commute => "C",
            EventType::DeepWork => "DW",
            EventType::ShallowWork => "SW",
            EventType::PlanReview => "PR",
            EventType::Habit => "H",
            EventType::Regeneration => "R",
            EventType::Buffer => "BU",
            EventType::Background => "BG",
        }
    }
}

/// A short ISO-8601 duration wrapper (`PT30M`, `PT1H30M`, …). Only the
/// hour/minute/second time-designator components are supported — plenty for
/// a single day's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IsoDuration(pub StdDuration);

impl IsoDuration {
    pub fn from_minutes(minutes: i64) -> Self {
        IsoDuration(StdDuration::from_secs((minutes.max(0) as u64) * 60))
    }

    pub fn as_chrono(self) -> chrono::Duration {
        chrono::Duration::from_std(self.0).unwrap_or_default()
    }
}

impl fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_secs = self.0.as_secs();
        let h = total_secs / 3600;
        let m = (total_secs % 3600) / 60;
        let s = total_secs % 60;
        write!(f, "PT")?;
        if h > 0 {
            write!(f, "{h}H")?;
        }
        if m > 0 {
            write!(f, "{m}M")?;
        }
        if s > 0 || (h == 0 && m == 0) {
            write!(f, "{s}S")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for IsoDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("PT")
            .ok_or_else(|| format!("not an ISO-8601 time duration: {s:?}"))?;
        let mut secs: u64 = 0;
        let mut number = String::new();
        for ch in rest.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                number.push(ch);
                continue;
            }
            let value: f64 = number
                .parse()
                .map_err(|_| format!("invalid duration component in {s:?}"))?;
            number.clear();
            secs += match ch {
                'H' => (value * 3600.0) as u64,
                'M' => (value * 60.0) as u64,
                'S' => value as u64,
                other => return Err(format!("unsupported duration designator {other:?} in {s:?}")),
            };
        }
        if !number.is_empty() {
            return Err(format!("trailing number with no designator in {s:?}"));
        }
        Ok(IsoDuration(StdDuration::from_secs(secs)))
    }
}

impl Serialize for IsoDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IsoDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Timing variant, tagged on discriminator `a` to match the wire model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum Timing {
    /// Starts right after the previous event ends.
    #[serde(rename = "ap")]
    AfterPrev { dur: IsoDuration },
    /// Ends right when the next event starts; start is filled by the backward pass.
    #[serde(rename = "bn")]
    BeforeNext { dur: IsoDuration },
    /// Pinned local start time plus a duration.
    #[serde(rename = "fs")]
    FixedStart { st: NaiveTime, dur: IsoDuration },
    /// Pinned local start and end time.
    #[serde(rename = "fw")]
    FixedWindow { st: NaiveTime, et: NaiveTime },
}

impl Timing {
    fn is_fixed(&self) -> bool {
        matches!(self, Timing::FixedStart { .. } | Timing::FixedWindow { .. })
    }
}

/// A single named interval in a [`Plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvent {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "d", default)]
    pub description: String,
    #[serde(rename = "t")]
    pub event_type: EventType,
    #[serde(rename = "p")]
    pub timing: Timing,
}

impl PlanEvent {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        event_type: EventType,
        timing: Timing,
    ) -> Result<Self, ValidationError> {
        let event = PlanEvent {
            name: name.into(),
            description: description.into(),
            event_type,
            timing,
        };
        event.check_background_invariant()?;
        Ok(event)
    }

    fn check_background_invariant(&self) -> Result<(), ValidationError> {
        if self.event_type == EventType::Background && !self.timing.is_fixed() {
            return Err(ValidationError::BackgroundNotFixed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// An ordered sequence of events for one local date and timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub events: Vec<PlanEvent>,
    pub date: NaiveDate,
    /// IANA timezone name, e.g. "Europe/Amsterdam".
    pub tz: String,
}

/// One event's concrete local placement, as emitted by [`Plan::resolve_times`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub index: usize,
    pub name: String,
    pub event_type: EventType,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration: chrono::Duration,
}

impl Plan {
    /// Construct a plan, checking structural invariants eagerly (background
    /// events must use fixed timing; at least one non-background anchor).
    pub fn new(
        events: Vec<PlanEvent>,
        date: NaiveDate,
        tz: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        for event in &events {
            event.check_background_invariant()?;
        }
        let has_anchor = events
            .iter()
            .any(|e| e.event_type != EventType::Background && e.timing.is_fixed());
        if !has_anchor {
            return Err(ValidationError::NoAnchor);
        }
        Ok(Plan {
            events,
            date,
            tz: tz.into(),
        })
    }

    /// Resolve every event to a concrete local start/end time.
    ///
    /// `validate_non_overlap` should be `true` for desired (to-be-submitted)
    /// plans and `false` for remote snapshots, which may legitimately contain
    /// overlapping foreign events that this system does not own.
    pub fn resolve_times(
        &self,
        validate_non_overlap: bool,
    ) -> Result<Vec<ResolvedEvent>, ValidationError> {
        let n = self.events.len();
        let mut start: Vec<Option<NaiveTime>> = vec![None; n];
        let mut end: Vec<Option<NaiveTime>> = vec![None; n];
        let mut duration: Vec<Option<chrono::Duration>> = vec![None; n];

        // Forward pass: resolve fs/fw directly, ap from the previous end.
        let mut cursor: Option<NaiveTime> = None;
        for (i, event) in self.events.iter().enumerate() {
            match &event.timing {
                Timing::FixedStart { st, dur } => {
                    let d = dur.as_chrono();
                    start[i] = Some(*st);
                    end[i] = Some(*st + d);
                    duration[i] = Some(d);
                    cursor = end[i];
                }
                Timing::FixedWindow { st, et } => {
                    start[i] = Some(*st);
                    end[i] = Some(*et);
                    duration[i] = Some(*et - *st);
                    cursor = end[i];
                }
                Timing::AfterPrev { dur } => {
                    let prev_end = cursor.ok_or_else(|| ValidationError::BrokenChain {
                        event_name: event.name.clone(),
                    })?;
                    let d = dur.as_chrono();
                    start[i] = Some(prev_end);
                    end[i] = Some(prev_end + d);
                    duration[i] = Some(d);
                    cursor = end[i];
                }
                Timing::BeforeNext { .. } => {
                    // Resolved in the backward pass below.
                }
            }
        }

        // Backward pass: resolve bn from the following event's start.
        let mut next_start: Option<NaiveTime> = None;
        for i in (0..n).rev() {
            match &self.events[i].timing {
                Timing::BeforeNext { dur } => {
                    let following = next_start.ok_or_else(|| ValidationError::BrokenChain {
                        event_name: self.events[i].name.clone(),
                    })?;
                    let d = dur.as_chrono();
                    end[i] = Some(following);
                    start[i] = Some(following - d);
                    duration[i] = Some(d);
                }
                _ => {}
            }
            next_start = start[i];
        }

        let mut resolved: Vec<ResolvedEvent> = (0..n)
            .map(|i| ResolvedEvent {
                index: i,
                name: self.events[i].name.clone(),
                event_type: self.events[i].event_type,
                start_time: start[i].expect("every event resolved by forward+backward pass"),
                end_time: end[i].expect("every event resolved by forward+backward pass"),
                duration: duration[i].expect("every event resolved by forward+backward pass"),
            })
            .collect();

        for r in &resolved {
            if r.duration <= chrono::Duration::zero() {
                return Err(ValidationError::NonPositiveDuration {
                    name: r.name.clone(),
                    duration_s: r.duration.num_seconds(),
                });
            }
        }

        if validate_non_overlap {
            let mut ordered: Vec<&ResolvedEvent> = resolved
                .iter()
                .filter(|r| r.event_type != EventType::Background)
                .collect();
            // Stable sort: identical start times retain insertion (index) order.
            ordered.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.index.cmp(&b.index)));
            for pair in ordered.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                if a.end_time > b.start_time {
                    return Err(ValidationError::Overlap {
                        first: a.name.clone(),
                        second: b.name.clone(),
                    });
                }
            }
        }

        resolved.sort_by_key(|r| r.index);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fw(name: &str, st: &str, et: &str, et_type: EventType) -> PlanEvent {
        PlanEvent::new(
            name,
            "",
            et_type,
            Timing::FixedWindow {
                st: NaiveTime::parse_from_str(st, "%H:%M").unwrap(),
                et: NaiveTime::parse_from_str(et, "%H:%M").unwrap(),
            },
        )
        .unwrap()
    }

    fn ap(name: &str, minutes: i64, et_type: EventType) -> PlanEvent {
        PlanEvent::new(
            name,
            "",
            et_type,
            Timing::AfterPrev {
                dur: IsoDuration::from_minutes(minutes),
            },
        )
        .unwrap()
    }

    fn bn(name: &str, minutes: i64, et_type: EventType) -> PlanEvent {
        PlanEvent::new(
            name,
            "",
            et_type,
            Timing::BeforeNext {
                dur: IsoDuration::from_minutes(minutes),
            },
        )
        .unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
    }

    #[test]
    fn iso_duration_round_trips() {
        for s in ["PT30M", "PT1H", "PT1H30M", "PT45M"] {
            let parsed: IsoDuration = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn resolve_forward_and_backward_pass() {
        let events = vec![
            fw("Meeting", "10:00", "11:00", EventType::Meeting),
            ap("Debrief", 15, EventType::ShallowWork),
            bn("Prep", 20, EventType::DeepWork),
            fw("Lunch", "12:00", "13:00", EventType::Meeting),
        ];
        let plan = Plan::new(events, date(), "Europe/Amsterdam").unwrap();
        let resolved = plan.resolve_times(true).unwrap();

        assert_eq!(resolved[1].start_time.to_string(), "11:00:00");
        assert_eq!(resolved[1].end_time.to_string(), "11:15:00");
        // bn "Prep" ends at Lunch's start (12:00) and starts 20 min before.
        assert_eq!(resolved[2].end_time.to_string(), "12:00:00");
        assert_eq!(resolved[2].start_time.to_string(), "11:40:00");
    }

    #[test]
    fn broken_chain_without_successor() {
        let events = vec![
            fw("Meeting", "10:00", "11:00", EventType::Meeting),
            bn("Dangling", 10, EventType::DeepWork),
        ];
        let plan = Plan::new(events, date(), "Europe/Amsterdam").unwrap();
        let err = plan.resolve_times(true).unwrap_err();
        assert!(matches!(err, ValidationError::BrokenChain { .. }));
    }

    #[test]
    fn overlap_detected_only_for_non_background() {
        let events = vec![
            fw("Meeting A", "10:00", "11:00", EventType::Meeting),
            fw("Meeting B", "10:30", "11:30", EventType::Meeting),
        ];
        let plan = Plan::new(events, date(), "Europe/Amsterdam").unwrap();
        let err = plan.resolve_times(true).unwrap_err();
        assert!(matches!(err, ValidationError::Overlap { .. }));
    }

    #[test]
    fn background_events_exempt_from_overlap() {
        let events = vec![
            fw("Meeting", "10:00", "11:00", EventType::Meeting),
            fw("Reminder", "10:15", "10:20", EventType::Background),
        ];
        let plan = Plan::new(events, date(), "Europe/Amsterdam").unwrap();
        assert!(plan.resolve_times(true).is_ok());
    }

    #[test]
    fn no_anchor_rejected_at_construction() {
        let events = vec![ap("Floating", 30, EventType::DeepWork)];
        let err = Plan::new(events, date(), "Europe/Amsterdam").unwrap_err();
        assert_eq!(err, ValidationError::NoAnchor);
    }

    #[test]
    fn background_must_use_fixed_timing() {
        let err = PlanEvent::new(
            "Floating BG",
            "",
            EventType::Background,
            Timing::AfterPrev {
                dur: IsoDuration::from_minutes(5),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::BackgroundNotFixed { .. }));
    }

    #[test]
    fn remote_snapshot_tolerates_overlap_when_requested() {
        let events = vec![
            fw("Meeting A", "10:00", "11:00", EventType::Meeting),
            fw("Meeting B", "10:30", "11:30", EventType::Meeting),
        ];
        let plan = Plan::new(events, date(), "Europe/Amsterdam").unwrap();
        assert!(plan.resolve_times(false).is_ok());
    }
}
