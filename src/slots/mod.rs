//! Slot service: free-calendar-slot retrieval and normalization.
//!
//! The CRM's free-slots endpoint answers in several shapes depending on
//! calendar configuration; everything is flattened into a chronological
//! list of `{utc datetime, rep}` pairs. When the upstream does not say
//! which rep owns a slot, the requested rep set is round-robined so every
//! slot downstream still resolves to a deterministic rep.

use crate::crm::{CrmClient, CrmError};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod display;
pub mod routes;

pub use display::{resolve_rep, SlotDisplay};

/// Slots handed to the outbound availability endpoint.
pub const OUTBOUND_BOUND: usize = 15;
/// Slots injected into the voice agent's context.
pub const AI_INJECTION_BOUND: usize = 3;

/// One offerable appointment slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub datetime_utc: DateTime<Utc>,
    pub rep_id: String,
}

/// Outcome of a free-slot query. `Empty` and `ApiError` are distinct on
/// purpose: when reps exist, an errored fetch is a fatal intake condition
/// while an empty one is too, but they notify differently.
#[derive(Debug, Clone)]
pub enum SlotQueryOutcome {
    Slots(Vec<Slot>),
    Empty,
    ApiError(String),
}

/// Query the CRM for free slots of the given reps inside [start, end],
/// normalized, sorted, and truncated to `bound`.
pub async fn fetch_free_slots(
    crm: &CrmClient,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rep_ids: &[String],
    bound: usize,
) -> SlotQueryOutcome {
    let body = match crm.free_slots(start, end, rep_ids).await {
        Ok(body) => body,
        Err(CrmError::NoToken(loc)) => {
            return SlotQueryOutcome::ApiError(format!("no CRM token for location {}", loc));
        }
        Err(e) => return SlotQueryOutcome::ApiError(e.to_string()),
    };

    let mut slots = normalize_slots(&body, rep_ids);
    if slots.is_empty() {
        return SlotQueryOutcome::Empty;
    }

    slots.sort_by_key(|s| s.datetime_utc);
    slots.truncate(bound);
    SlotQueryOutcome::Slots(slots)
}

/// Flatten whichever of the known response shapes arrived:
/// a `{date: {slots: [...]}}` map, `{freeSlots: [...]}`, `{slots: [...]}`,
/// or a bare array of ISO strings.
pub fn normalize_slots(body: &Value, rep_ids: &[String]) -> Vec<Slot> {
    let mut raw: Vec<(DateTime<Utc>, Option<String>)> = Vec::new();

    if let Some(items) = body.as_array() {
        collect_items(items, &mut raw);
    } else if let Some(items) = body["freeSlots"].as_array() {
        collect_items(items, &mut raw);
    } else if let Some(items) = body["slots"].as_array() {
        collect_items(items, &mut raw);
    } else if let Some(map) = body.as_object() {
        // Per-date map: {"2025-03-17": {"slots": ["..."]}, "traceId": "..."}
        for (key, value) in map {
            if key.len() != 10 || !key.starts_with("20") {
                continue;
            }
            if let Some(items) = value["slots"].as_array() {
                collect_items(items, &mut raw);
            }
        }
    }

    assign_reps(raw, rep_ids)
}

fn collect_items(items: &[Value], out: &mut Vec<(DateTime<Utc>, Option<String>)>) {
    for item in items {
        match item {
            Value::String(iso) => {
                if let Some(dt) = parse_iso(iso) {
                    out.push((dt, None));
                } else {
                    warn!("unparseable slot timestamp {:?}", iso);
                }
            }
            Value::Object(obj) => {
                let iso = obj
                    .get("startTime")
                    .or_else(|| obj.get("datetime"))
                    .or_else(|| obj.get("slot"))
                    .and_then(|v| v.as_str());
                let rep = obj
                    .get("userId")
                    .or_else(|| obj.get("assignedUserId"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                if let Some(dt) = iso.and_then(parse_iso) {
                    out.push((dt, rep));
                }
            }
            _ => {}
        }
    }
}

fn parse_iso(iso: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Slots that arrived without a rep get one from the requested set in
/// round-robin order; with no requested set they are dropped.
fn assign_reps(raw: Vec<(DateTime<Utc>, Option<String>)>, rep_ids: &[String]) -> Vec<Slot> {
    let mut round_robin = rep_ids.iter().cycle();
    raw.into_iter()
        .filter_map(|(dt, rep)| {
            let rep_id = match rep {
                Some(r) => r,
                None => round_robin.next()?.clone(),
            };
            Some(Slot {
                datetime_utc: dt,
                rep_id,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalizes_per_date_map_shape() {
        let body = serde_json::json!({
            "2025-03-17": {"slots": ["2025-03-17T09:00:00Z", "2025-03-17T10:00:00Z"]},
            "2025-03-18": {"slots": ["2025-03-18T14:00:00Z"]},
            "traceId": "abc"
        });
        let slots = normalize_slots(&body, &reps(&["u1"]));
        assert_eq!(slots.len(), 3);
        assert!(slots.iter().all(|s| s.rep_id == "u1"));
    }

    #[test]
    fn normalizes_free_slots_and_slots_shapes() {
        for key in ["freeSlots", "slots"] {
            let body = serde_json::json!({key: ["2025-03-17T09:00:00Z"]});
            let slots = normalize_slots(&body, &reps(&["u1"]));
            assert_eq!(slots.len(), 1, "shape {}", key);
        }
    }

    #[test]
    fn normalizes_bare_array_shape() {
        let body = serde_json::json!(["2025-03-17T09:00:00Z", "2025-03-17T11:30:00Z"]);
        let slots = normalize_slots(&body, &reps(&["u1"]));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn keeps_upstream_rep_identity_when_present() {
        let body = serde_json::json!({
            "slots": [
                {"startTime": "2025-03-17T09:00:00Z", "userId": "u9"},
                "2025-03-17T10:00:00Z"
            ]
        });
        let slots = normalize_slots(&body, &reps(&["u1", "u2"]));
        assert_eq!(slots[0].rep_id, "u9");
        // The bare string got the first round-robin rep.
        assert_eq!(slots[1].rep_id, "u1");
    }

    #[test]
    fn round_robin_cycles_requested_reps() {
        let body = serde_json::json!([
            "2025-03-17T09:00:00Z",
            "2025-03-17T10:00:00Z",
            "2025-03-17T11:00:00Z"
        ]);
        let slots = normalize_slots(&body, &reps(&["u1", "u2"]));
        let assigned: Vec<&str> = slots.iter().map(|s| s.rep_id.as_str()).collect();
        assert_eq!(assigned, vec!["u1", "u2", "u1"]);
    }

    #[test]
    fn slots_without_reps_and_no_requested_set_are_dropped() {
        let body = serde_json::json!(["2025-03-17T09:00:00Z"]);
        assert!(normalize_slots(&body, &[]).is_empty());
    }

    #[test]
    fn offset_timestamps_convert_to_utc() {
        let body = serde_json::json!(["2025-03-17T10:00:00+01:00"]);
        let slots = normalize_slots(&body, &reps(&["u1"]));
        assert_eq!(
            slots[0].datetime_utc,
            Utc.with_ymd_and_hms(2025, 3, 17, 9, 0, 0).unwrap()
        );
    }
}
