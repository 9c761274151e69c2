//! Booking coordinator: appointment creation with an alternatives fallback.
//!
//! A booking request names an Italian wall-clock time. When the CRM rejects
//! the slot (usually a conflict), the coordinator looks at the following
//! seven days and returns everything available on the first two days that
//! still have room, so the caller can immediately re-offer.

use crate::shared::state::AppState;
use crate::slots::{normalize_slots, Slot};
use crate::timeloc;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct BookRequest {
    #[serde(rename = "appointmentDate")]
    pub appointment_date: String,
    #[serde(rename = "contactId")]
    pub contact_id: String,
    pub address: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug)]
pub enum BookingOutcome {
    Booked(Value),
    AlternativesAvailable(Vec<Slot>),
    NoAlternatives,
    InvalidDate(String),
}

/// Book the requested slot, falling back to alternatives on rejection.
pub async fn book(state: &Arc<AppState>, request: &BookRequest) -> BookingOutcome {
    let start = match timeloc::parse_italian_datetime(&request.appointment_date) {
        Some(start) => start,
        None => {
            return BookingOutcome::InvalidDate(format!(
                "appointmentDate must be 'DD-MM-YYYY HH:mm' or 'YYYY-MM-DD HH:mm', got {:?}",
                request.appointment_date
            ));
        }
    };

    let address = request
        .address
        .clone()
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| state.config.default_appointment_address.clone());

    match state
        .crm
        .create_appointment(
            &request.contact_id,
            start,
            request.user_id.as_deref(),
            &address,
        )
        .await
    {
        Ok(body) => {
            info!(
                "appointment booked for {} at {} (rep {:?})",
                request.contact_id, start, request.user_id
            );
            BookingOutcome::Booked(body)
        }
        Err(e) => {
            warn!(
                "booking failed for {} at {}: {}; searching alternatives",
                request.contact_id, start, e
            );
            match find_alternatives(state, start, request.user_id.as_deref()).await {
                alts if !alts.is_empty() => BookingOutcome::AlternativesAvailable(alts),
                _ => BookingOutcome::NoAlternatives,
            }
        }
    }
}

/// Free slots from the first two available days within seven days of the
/// failed booking, never earlier than the originally requested time.
async fn find_alternatives(
    state: &Arc<AppState>,
    requested: DateTime<Utc>,
    user_id: Option<&str>,
) -> Vec<Slot> {
    let window_start = requested
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or(requested);
    let window_end = window_start + Duration::days(7);

    let rep_filter: Vec<String> = user_id.map(|u| vec![u.to_string()]).unwrap_or_default();

    let body = match state
        .crm
        .free_slots(window_start, window_end, &rep_filter)
        .await
    {
        Ok(body) => body,
        Err(e) => {
            warn!("alternatives lookup failed: {}", e);
            return Vec::new();
        }
    };

    // Slots with no upstream rep identity fall to the requested rep, or to
    // an unassigned marker when the booking had none.
    let assign: Vec<String> = match user_id {
        Some(u) => vec![u.to_string()],
        None => vec!["unassigned".to_string()],
    };
    let mut slots = normalize_slots(&body, &assign);
    slots.retain(|s| s.datetime_utc >= requested);
    slots.sort_by_key(|s| s.datetime_utc);

    first_two_days(slots)
}

/// Keep every slot from the first two distinct UTC dates.
fn first_two_days(slots: Vec<Slot>) -> Vec<Slot> {
    let mut days: Vec<NaiveDate> = Vec::new();
    let mut kept = Vec::new();
    for slot in slots {
        let day = slot.datetime_utc.date_naive();
        if !days.contains(&day) {
            if days.len() == 2 {
                break;
            }
            days.push(day);
        }
        kept.push(slot);
    }
    kept
}

/// `POST /bookAppointment`
pub async fn book_appointment(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BookRequest>,
) -> impl IntoResponse {
    match book(&state, &request).await {
        BookingOutcome::Booked(body) => {
            (StatusCode::CREATED, Json(json!({"status": "booked", "appointment": body})))
                .into_response()
        }
        BookingOutcome::AlternativesAvailable(slots) => {
            let rendered: Vec<Value> = slots
                .iter()
                .map(|s| {
                    json!({
                        "startTime": s.datetime_utc.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                        "userId": s.rep_id,
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "status": "booking_failed_alternatives_available",
                    "slots": rendered,
                })),
            )
                .into_response()
        }
        BookingOutcome::NoAlternatives => (
            StatusCode::CONFLICT,
            Json(json!({"status": "booking_failed_no_alternatives"})),
        )
            .into_response(),
        BookingOutcome::InvalidDate(message) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    fn slot(day: u32, hour: u32) -> Slot {
        Slot {
            datetime_utc: Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap(),
            rep_id: "u1".into(),
        }
    }

    #[test]
    fn first_two_days_keeps_all_slots_of_those_days() {
        let slots = vec![
            slot(17, 14),
            slot(17, 16),
            slot(18, 9),
            slot(19, 10),
            slot(20, 11),
        ];
        let kept = first_two_days(slots);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].datetime_utc.date_naive().day(), 17);
        assert_eq!(kept[2].datetime_utc.date_naive().day(), 18);
    }

    #[test]
    fn fewer_than_two_days_is_fine() {
        let kept = first_two_days(vec![slot(17, 14)]);
        assert_eq!(kept.len(), 1);
        assert!(first_two_days(Vec::new()).is_empty());
    }
}
