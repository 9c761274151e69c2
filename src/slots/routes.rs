//! Availability endpoints.
//!
//! The outbound variant feeds the lead platform's UI with concrete slots
//! for one service/province pair; the inbound variant renders the next two
//! days as the display string the inbound agent is seeded with.

use super::{fetch_free_slots, SlotDisplay, SlotQueryOutcome, OUTBOUND_BOUND};
use crate::config::Service;
use crate::shared::state::AppState;
use crate::timeloc;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{Duration, NaiveTime, Utc};
use log::error;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct OutboundSlotsQuery {
    #[serde(rename = "Timeframe")]
    pub timeframe: Option<String>,
    #[serde(rename = "AppointmentDate")]
    pub appointment_date: Option<String>,
    pub service: Option<String>,
    pub province: Option<String>,
}

/// `GET /availableSlotsOutbound`
pub async fn available_slots_outbound(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OutboundSlotsQuery>,
) -> impl IntoResponse {
    let Some(service) = query.service.as_deref().and_then(Service::parse) else {
        return bad_request("service field is required");
    };
    let Some(province) = query.province.as_deref().filter(|p| !p.is_empty()) else {
        return bad_request("province is required");
    };
    let Some(date) = query.appointment_date.as_deref().and_then(timeloc::parse_date) else {
        return bad_request("AppointmentDate must be DD-MM-YYYY or YYYY-MM-DD");
    };
    let Some(time) = query
        .timeframe
        .as_deref()
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok())
    else {
        return bad_request("Timeframe must be HH:mm");
    };

    let window_start = timeloc::italian_to_utc(date, time);
    let window_end = window_start + Duration::days(7);

    let rep_ids = match state
        .db()
        .and_then(|mut conn| crate::reps::rep_ids_for(&mut conn, service, province))
    {
        Ok(ids) => ids,
        Err(e) => {
            error!("rep lookup failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "rep lookup failed"})),
            )
                .into_response();
        }
    };

    if rep_ids.is_empty() {
        return bad_request("No sales representatives available");
    }

    match fetch_free_slots(
        state.crm.as_ref(),
        window_start,
        window_end,
        &rep_ids,
        OUTBOUND_BOUND,
    )
    .await
    {
        SlotQueryOutcome::Slots(slots) => {
            let rendered: Vec<serde_json::Value> = slots
                .iter()
                .map(|s| {
                    json!({
                        "startTime": s.datetime_utc.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                        "userId": s.rep_id,
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"slots": rendered}))).into_response()
        }
        SlotQueryOutcome::Empty => (StatusCode::OK, Json(json!({"slots": []}))).into_response(),
        SlotQueryOutcome::ApiError(e) => {
            error!("outbound slot fetch failed: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "slot fetch failed"})),
            )
                .into_response()
        }
    }
}

/// `GET /availableSlotsInbound` — 403 outside operator hours.
pub async fn available_slots_inbound(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = Utc::now();
    if !timeloc::is_operating_hours(now) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "outside operating hours"})),
        )
            .into_response();
    }

    let text = next_two_days_text(&state).await;
    (StatusCode::OK, Json(json!({"availableSlots": text}))).into_response()
}

/// The formatted availability of every active rep for Rome-today and the
/// day after. Degrades to a fixed sentence rather than failing the call.
pub async fn next_two_days_text(state: &Arc<AppState>) -> String {
    let now = Utc::now();
    let today = timeloc::utc_to_italian(now).date_naive();
    let window_end = timeloc::italian_to_utc(
        today + Duration::days(1),
        NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
    );

    let rep_ids = state
        .db()
        .and_then(|mut conn| all_active_rep_ids(&mut conn))
        .unwrap_or_default();

    match fetch_free_slots(state.crm.as_ref(), now, window_end, &rep_ids, OUTBOUND_BOUND).await {
        SlotQueryOutcome::Slots(mut slots) => {
            // Only offer times a rep would actually pick up the visit.
            slots.retain(|s| timeloc::is_within_italian_business(s.datetime_utc));
            if slots.is_empty() {
                return "Nessuna disponibilità nelle prossime 48 ore".to_string();
            }
            SlotDisplay::for_slots(&slots).render(&slots)
        }
        SlotQueryOutcome::Empty => "Nessuna disponibilità nelle prossime 48 ore".to_string(),
        SlotQueryOutcome::ApiError(e) => {
            error!("inbound slot fetch failed: {}", e);
            "Disponibilità non determinata".to_string()
        }
    }
}

fn all_active_rep_ids(conn: &mut diesel::SqliteConnection) -> anyhow::Result<Vec<String>> {
    use crate::shared::schema::sales_reps::dsl::*;
    use diesel::prelude::*;
    Ok(sales_reps
        .filter(active.eq(true))
        .order(id.asc())
        .select(ghl_user_id)
        .load(conn)?)
}

fn bad_request(message: &str) -> axum::response::Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}
