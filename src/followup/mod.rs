//! Follow-up scheduler: deferred re-call intents.
//!
//! An hourly sweep deletes stuck entries, refetches contact data for the
//! due ones, and re-submits them through the intake endpoint exactly as the
//! lead platform would. Permanent rejections (no rep, bad area, missing
//! address or service) delete the follow-up instead of retrying forever.

use crate::config::Service;
use crate::notify::NotifyContext;
use crate::shared::models::{FollowUp, NewFollowUp};
use crate::shared::state::AppState;
use crate::timeloc;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{Duration, Utc};
use diesel::prelude::*;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Rejection bodies that mean "this lead will never enqueue".
const PERMANENT_FAILURES: [&str; 4] = [
    "No sales representatives available",
    "not in right area",
    "Address is required",
    "service field is required",
];

pub fn spawn_follow_up_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        info!("follow-up sweeper started (hourly)");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            run_sweep(&state).await;
        }
    });
}

pub async fn run_sweep(state: &Arc<AppState>) {
    if let Err(e) = cleanup_stuck(state).await {
        error!("follow-up cleanup failed: {}", e);
    }

    let due = match load_due(state) {
        Ok(due) => due,
        Err(e) => {
            error!("follow-up load failed: {}", e);
            return;
        }
    };

    for follow_up in due {
        process_follow_up(state, follow_up).await;
    }
}

/// Remove entries that will never run: more than a day overdue, or overdue
/// for an hour with a recorded failure.
async fn cleanup_stuck(state: &Arc<AppState>) -> anyhow::Result<()> {
    use crate::shared::schema::follow_ups::dsl::*;

    let now = Utc::now();
    let stuck: Vec<FollowUp> = {
        let mut conn = state.db()?;
        follow_ups
            .filter(status.eq("pending"))
            .filter(
                follow_up_at
                    .lt(now - Duration::hours(24))
                    .or(follow_up_at.lt(now - Duration::hours(1)).and(last_error.is_not_null())),
            )
            .load(&mut conn)?
    };

    for entry in stuck {
        {
            let mut conn = state.db()?;
            diesel::delete(follow_ups.filter(id.eq(entry.id))).execute(&mut conn)?;
        }
        warn!(
            "removed stuck follow-up {} for contact {} (due {})",
            entry.id, entry.contact_id, entry.follow_up_at
        );
        state
            .notifier
            .warning(
                "Stuck follow-up removed",
                NotifyContext {
                    contact_id: Some(entry.contact_id.clone()),
                    service: entry.service.clone(),
                    province: entry.province.clone(),
                    detail: Some(format!(
                        "due {}, last error: {}",
                        entry.follow_up_at,
                        entry.last_error.as_deref().unwrap_or("none")
                    )),
                    ..Default::default()
                },
            )
            .await;
    }
    Ok(())
}

fn load_due(state: &Arc<AppState>) -> anyhow::Result<Vec<FollowUp>> {
    use crate::shared::schema::follow_ups::dsl::*;
    let mut conn = state.db()?;
    Ok(follow_ups
        .filter(status.eq("pending"))
        .filter(follow_up_at.le(Utc::now()))
        .order(follow_up_at.asc())
        .load(&mut conn)?)
}

async fn process_follow_up(state: &Arc<AppState>, follow_up: FollowUp) {
    let contact = match state.crm.get_contact(&follow_up.contact_id).await {
        Ok(body) => body,
        Err(e) => {
            warn!("contact fetch failed for follow-up {}: {}", follow_up.id, e);
            record_failure(state, follow_up.id, &format!("contact fetch failed: {}", e));
            return;
        }
    };
    let contact = &contact["contact"];

    let service = follow_up
        .service
        .as_deref()
        .and_then(Service::parse)
        .or_else(|| service_from_contact(contact));

    let province = match &follow_up.province {
        Some(p) if !p.is_empty() => Some(p.clone()),
        _ => last_known_province(state, &follow_up.contact_id).unwrap_or(None),
    };

    let address = contact_address(contact);
    let phone = contact["phone"].as_str().unwrap_or_default();
    let payload = json!({
        "phone": phone,
        "contact_id": follow_up.contact_id,
        "first_name": contact["firstName"].as_str().unwrap_or_default(),
        "full_name": contact["name"]
            .as_str()
            .or_else(|| contact["fullNameLowerCase"].as_str())
            .unwrap_or_default(),
        "email": contact["email"].as_str().unwrap_or_default(),
        "Service": service.map(|s| s.as_str()).unwrap_or_default(),
        "full_address": address,
        // Province travels via the address when already known; the intake
        // resolver will find the code in it.
        "customData": Value::Null,
    });

    let payload = match province {
        Some(p) if !address_mentions_province(&payload, &p) => {
            let mut amended = payload;
            let existing = amended["full_address"].as_str().unwrap_or_default().to_string();
            amended["full_address"] = json!(format!("{} ({})", existing, p).trim().to_string());
            amended
        }
        _ => payload,
    };

    match resubmit(state, &payload).await {
        Ok((status, body)) if status.is_success() => {
            info!("follow-up {} re-enqueued: {}", follow_up.id, body);
            delete_follow_up(state, follow_up.id);
        }
        Ok((status, body)) if status.is_client_error() && is_permanent_failure(&body) => {
            warn!(
                "follow-up {} permanently rejected ({}): {}",
                follow_up.id, status, body
            );
            delete_follow_up(state, follow_up.id);
            state
                .notifier
                .warning(
                    "Follow-up permanently rejected",
                    NotifyContext {
                        contact_id: Some(follow_up.contact_id.clone()),
                        detail: Some(body),
                        ..Default::default()
                    },
                )
                .await;
        }
        Ok((status, body)) => {
            warn!("follow-up {} resubmission failed ({}): {}", follow_up.id, status, body);
            record_failure(state, follow_up.id, &format!("{}: {}", status, body));
        }
        Err(e) => {
            warn!("follow-up {} resubmission errored: {}", follow_up.id, e);
            record_failure(state, follow_up.id, &e);
        }
    }
}

/// Submit through the same HTTP surface the lead platform uses, so the
/// intake validation chain applies unchanged.
async fn resubmit(
    state: &Arc<AppState>,
    payload: &Value,
) -> Result<(reqwest::StatusCode, String), String> {
    let url = format!(
        "http://127.0.0.1:{}/{}/outbound-call",
        state.config.server_port, state.config.outbound_prefix
    );
    let response = reqwest::Client::new()
        .post(&url)
        .timeout(std::time::Duration::from_secs(30))
        .json(payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Ok((status, body))
}

pub fn is_permanent_failure(body: &str) -> bool {
    PERMANENT_FAILURES
        .iter()
        .any(|sentinel| body.to_lowercase().contains(&sentinel.to_lowercase()))
}

/// Service, in priority order: saved column (handled by caller), custom
/// fields, then tags.
fn service_from_contact(contact: &Value) -> Option<Service> {
    if let Some(fields) = contact["customFields"].as_array() {
        for field in fields {
            if let Some(value) = field["value"].as_str() {
                if let Some(service) = Service::parse(value) {
                    return Some(service);
                }
            }
        }
    }
    if let Some(tags) = contact["tags"].as_array() {
        for tag in tags {
            if let Some(service) = tag.as_str().and_then(Service::parse) {
                return Some(service);
            }
        }
    }
    None
}

fn contact_address(contact: &Value) -> String {
    let parts: Vec<&str> = [
        contact["address1"].as_str(),
        contact["city"].as_str(),
        contact["postalCode"].as_str(),
        contact["state"].as_str(),
    ]
    .into_iter()
    .flatten()
    .filter(|s| !s.is_empty())
    .collect();
    parts.join(", ")
}

fn address_mentions_province(payload: &Value, province: &str) -> bool {
    payload["full_address"]
        .as_str()
        .map(|a| a.contains(province))
        .unwrap_or(false)
}

/// Most recent province recorded for this contact across past calls.
fn last_known_province(state: &Arc<AppState>, contact: &str) -> anyhow::Result<Option<String>> {
    use crate::shared::schema::calls::dsl::*;
    let mut conn = state.db()?;
    Ok(calls
        .filter(contact_id.eq(contact))
        .filter(province.is_not_null())
        .order(created_at.desc())
        .select(province)
        .first::<Option<String>>(&mut conn)
        .optional()?
        .flatten())
}

fn delete_follow_up(state: &Arc<AppState>, follow_up_id: i32) {
    use crate::shared::schema::follow_ups::dsl::*;
    if let Ok(mut conn) = state.db() {
        if let Err(e) = diesel::delete(follow_ups.filter(id.eq(follow_up_id))).execute(&mut conn) {
            error!("follow-up {} delete failed: {}", follow_up_id, e);
        }
    }
}

fn record_failure(state: &Arc<AppState>, follow_up_id: i32, reason: &str) {
    use crate::shared::schema::follow_ups::dsl::*;
    if let Ok(mut conn) = state.db() {
        if let Err(e) = diesel::update(follow_ups.filter(id.eq(follow_up_id)))
            .set(last_error.eq(reason))
            .execute(&mut conn)
        {
            error!("follow-up {} failure record failed: {}", follow_up_id, e);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateFollowUpRequest {
    #[serde(rename = "contactId")]
    pub contact_id: String,
    #[serde(rename = "followUpDateTime")]
    pub follow_up_date_time: String,
}

/// `POST /followup` — body: `{contactId, followUpDateTime: "DD-MM-YYYY HH:mm"}`.
pub async fn create_follow_up(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateFollowUpRequest>,
) -> impl IntoResponse {
    let Some(when) = timeloc::parse_italian_datetime(&request.follow_up_date_time) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "followUpDateTime must be 'DD-MM-YYYY HH:mm'"})),
        )
            .into_response();
    };

    use crate::shared::schema::follow_ups::dsl::*;
    let entry = NewFollowUp {
        contact_id: request.contact_id.clone(),
        follow_up_at: when,
        status: "pending".to_string(),
        province: None,
        service: None,
        created_at: Utc::now(),
    };

    let inserted: Result<i32, String> = state.db().map_err(|e| e.to_string()).and_then(|mut conn| {
        diesel::insert_into(follow_ups)
            .values(&entry)
            .returning(id)
            .get_result(&mut conn)
            .map_err(|e| e.to_string())
    });

    match inserted {
        Ok(follow_up_id) => (
            StatusCode::CREATED,
            Json(json!({
                "id": follow_up_id,
                "followUpAtUtc": when.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            })),
        )
            .into_response(),
        Err(e) => {
            error!("follow-up create failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "follow-up create failed"})),
            )
                .into_response()
        }
    }
}

/// `POST /followup/trigger` — run a sweep now.
pub async fn trigger_sweep(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    run_sweep(&state).await;
    (StatusCode::OK, Json(json!({"status": "sweep completed"})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_failure_sentinels_match() {
        assert!(is_permanent_failure(r#"{"error":"No sales representatives available"}"#));
        assert!(is_permanent_failure(r#"{"error":"Contact is not in right area"}"#));
        assert!(is_permanent_failure(r#"{"error":"Address is required"}"#));
        assert!(is_permanent_failure(r#"{"error":"service field is required"}"#));
        assert!(!is_permanent_failure(r#"{"error":"CRM token unavailable"}"#));
    }

    #[test]
    fn service_derives_from_custom_fields_before_tags() {
        let contact = json!({
            "customFields": [{"id": "f1", "value": "Vetrate"}],
            "tags": ["pergole"]
        });
        assert_eq!(service_from_contact(&contact), Some(Service::Vetrate));
    }

    #[test]
    fn service_derives_from_tags_case_insensitively() {
        let contact = json!({"tags": ["lead", "INFISSI"]});
        assert_eq!(service_from_contact(&contact), Some(Service::Infissi));
    }

    #[test]
    fn address_joins_known_parts() {
        let contact = json!({
            "address1": "Via Roma 1",
            "city": "Roma",
            "postalCode": "00100"
        });
        assert_eq!(contact_address(&contact), "Via Roma 1, Roma, 00100");
    }
}
