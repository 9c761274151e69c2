//! Intake endpoint: the lead platform's "place a call" webhook.
//!
//! Validates the payload, resolves the prospect's province, routes to the
//! eligible reps, fetches their availability, and enqueues a dial attempt.
//! Every rejection path returns a distinct status and tells the operators.

use crate::config::Service;
use crate::notify::NotifyContext;
use crate::shared::models::{NewCallQueueEntry, QueueStatus};
use crate::shared::state::AppState;
use crate::slots::{fetch_free_slots, SlotDisplay, SlotQueryOutcome, AI_INJECTION_BOUND};
use crate::telephony::CallOptions;
use crate::timeloc;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{Duration, NaiveTime, Utc};
use diesel::prelude::*;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Injected when availability cannot be fetched for an abrupt-ending retry
/// (the only path allowed to proceed without fresh slots).
const SLOTS_UNAVAILABLE: &str = "Disponibilità non determinata";

#[derive(Debug, Deserialize)]
pub struct OutboundCallRequest {
    pub phone: Option<String>,
    pub contact_id: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "Service")]
    pub service: Option<String>,
    pub full_address: Option<String>,
    #[serde(rename = "customData")]
    pub custom_data: Option<CustomData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CustomData {
    #[serde(rename = "isAbruptEndingRetry", default, deserialize_with = "truthy")]
    pub is_abrupt_ending_retry: bool,
    #[serde(rename = "originalConversationId")]
    pub original_conversation_id: Option<String>,
    #[serde(rename = "pastCallSummary")]
    pub past_call_summary: Option<String>,
}

/// The lead platform sends booleans as real booleans or as "true"/"false".
fn truthy<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// `POST /{outbound}/outbound-call`
pub async fn outbound_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OutboundCallRequest>,
) -> impl IntoResponse {
    let request_id = Uuid::new_v4().to_string();
    let abrupt = request
        .custom_data
        .as_ref()
        .map(|c| c.is_abrupt_ending_retry)
        .unwrap_or(false);

    let base_ctx = NotifyContext {
        request_id: Some(request_id.clone()),
        contact_id: request.contact_id.clone(),
        phone: request.phone.clone(),
        service: request.service.clone(),
        ..Default::default()
    };

    // 1. Service must be present and known.
    let service = match request.service.as_deref().and_then(Service::parse) {
        Some(s) => s,
        None => {
            state
                .notifier
                .warning("Outbound call rejected: service field is required", base_ctx)
                .await;
            return reject(StatusCode::BAD_REQUEST, "service field is required", false);
        }
    };

    // 2. Address is mandatory unless this is an abrupt-ending retry.
    if !abrupt && request.full_address.as_deref().unwrap_or("").trim().is_empty() {
        state
            .notifier
            .warning("Outbound call rejected: Address is required", base_ctx)
            .await;
        return reject(StatusCode::BAD_REQUEST, "Address is required", false);
    }

    // 3. Phone and contact id.
    let (phone, contact_id) = match (
        request.phone.as_deref().filter(|p| !p.trim().is_empty()),
        request.contact_id.as_deref().filter(|c| !c.trim().is_empty()),
    ) {
        (Some(p), Some(c)) => (p.to_string(), c.to_string()),
        _ => {
            state
                .notifier
                .warning("Outbound call rejected: phone and contact_id are required", base_ctx)
                .await;
            return reject(StatusCode::BAD_REQUEST, "phone and contact_id are required", false);
        }
    };

    // 4. A CRM bearer must be obtainable; dropping the call silently here
    //    would lose the lead.
    if let Err(e) = state.crm.valid_bearer().await {
        error!("intake: CRM token unavailable: {}", e);
        state
            .notifier
            .fatal(
                "Outbound call rejected: CRM token unavailable",
                NotifyContext {
                    detail: Some(e.to_string()),
                    ..base_ctx
                },
            )
            .await;
        return reject(StatusCode::INTERNAL_SERVER_ERROR, "CRM token unavailable", true);
    }

    let province = match &request.full_address {
        Some(address) => {
            timeloc::extract_province(address, &state.province_cache, state.llm_ref()).await
        }
        None => None,
    };

    let mut ctx = NotifyContext {
        province: province.clone(),
        ..base_ctx.clone()
    };

    // Routing. Abrupt-ending retries resume a dropped conversation and are
    // exempt from the rep gate.
    let rep_ids: Vec<String> = if abrupt {
        Vec::new()
    } else {
        let province_code = match &province {
            Some(p) => p.clone(),
            None => {
                tag_workflow(&state, &contact_id, state.config.workflow_no_rep.as_deref()).await;
                state
                    .notifier
                    .warning("Outbound call rejected: contact is not in right area", ctx)
                    .await;
                return reject(StatusCode::BAD_REQUEST, "Contact is not in right area", false);
            }
        };

        let reps = match state.db().and_then(|mut conn| {
            crate::reps::rep_ids_for(&mut conn, service, &province_code)
        }) {
            Ok(reps) => reps,
            Err(e) => {
                error!("intake: rep lookup failed: {}", e);
                ctx.detail = Some(e.to_string());
                state.notifier.error("Outbound call rejected: rep lookup failed", ctx).await;
                return reject(StatusCode::INTERNAL_SERVER_ERROR, "rep lookup failed", true);
            }
        };

        if reps.is_empty() {
            tag_workflow(&state, &contact_id, state.config.workflow_no_rep.as_deref()).await;
            state
                .notifier
                .warning("Outbound call rejected: no sales representatives available", ctx)
                .await;
            return reject(StatusCode::BAD_REQUEST, "No sales representatives available", false);
        }
        reps
    };

    // Availability window: tomorrow 08:30 Rome through the 14th day 21:30.
    let now = Utc::now();
    let tomorrow = timeloc::utc_to_italian(now).date_naive() + Duration::days(1);
    let window_start = timeloc::italian_to_utc(tomorrow, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
    let window_end = timeloc::italian_to_utc(
        tomorrow + Duration::days(13),
        NaiveTime::from_hms_opt(21, 30, 0).unwrap(),
    );

    let outcome = fetch_free_slots(
        state.crm.as_ref(),
        window_start,
        window_end,
        &rep_ids,
        AI_INJECTION_BOUND,
    )
    .await;

    let (slots_text, fatal_detail) = match outcome {
        SlotQueryOutcome::Slots(slots) => {
            (SlotDisplay::for_slots(&slots).render(&slots), None)
        }
        SlotQueryOutcome::Empty => (
            SLOTS_UNAVAILABLE.to_string(),
            (!rep_ids.is_empty()).then(|| "slot fetch returned no availability".to_string()),
        ),
        SlotQueryOutcome::ApiError(e) => (
            SLOTS_UNAVAILABLE.to_string(),
            (!rep_ids.is_empty()).then(|| format!("slot fetch failed: {}", e)),
        ),
    };

    // Reps exist but cannot be offered availability. Silently skipping
    // would hide a calendar outage, so fail loudly.
    if let Some(detail) = fatal_detail {
        error!("intake: {}", detail);
        ctx.detail = Some(detail);
        state
            .notifier
            .fatal("Outbound call rejected: reps exist but no availability", ctx)
            .await;
        return reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no availability for assigned sales reps",
            true,
        );
    }

    // Signed URL for the outbound voice agent.
    let signed_url = match state
        .elevenlabs
        .signed_url(&state.config.elevenlabs.agent_id_outbound)
        .await
    {
        Ok(url) => url,
        Err(e) => {
            error!("intake: signed URL fetch failed: {}", e);
            ctx.detail = Some(e.to_string());
            state
                .notifier
                .error("Outbound call rejected: voice agent unavailable", ctx)
                .await;
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "voice agent unavailable", true);
        }
    };

    let custom = request.custom_data.as_ref();
    let options = compose_call_options(
        &state,
        &phone,
        service,
        &contact_id,
        &request.first_name,
        &request.full_name,
        &request.email,
        province.as_deref(),
        abrupt,
        custom.and_then(|c| c.past_call_summary.as_deref()),
        custom.and_then(|c| c.original_conversation_id.as_deref()),
    );

    let entry = NewCallQueueEntry {
        contact_id: contact_id.clone(),
        phone_number: phone.clone(),
        first_name: request.first_name.clone(),
        full_name: request.full_name.clone(),
        email: request.email.clone(),
        service: service.as_str().to_string(),
        province: province.clone(),
        retry_stage: 0,
        status: QueueStatus::Pending.as_str().to_string(),
        scheduled_at: now,
        created_at: now,
        call_options: serde_json::to_string(&options).unwrap_or_else(|_| "{}".to_string()),
        available_slots: Some(slots_text),
        signed_url: Some(signed_url),
        first_attempt_at: Some(now),
    };

    let queue_id = {
        use crate::shared::schema::call_queue::dsl::*;
        let inserted: Result<i32, _> = state.db().map_err(|e| e.to_string()).and_then(|mut conn| {
            diesel::insert_into(call_queue)
                .values(&entry)
                .returning(id)
                .get_result(&mut conn)
                .map_err(|e| e.to_string())
        });
        match inserted {
            Ok(qid) => qid,
            Err(e) => {
                error!("intake: queue insert failed: {}", e);
                ctx.detail = Some(e);
                state.notifier.error("Outbound call enqueue failed", ctx).await;
                return reject(StatusCode::INTERNAL_SERVER_ERROR, "enqueue failed", true);
            }
        }
    };

    // Best effort: the workflow tag must not block the 202.
    tag_workflow(&state, &contact_id, state.config.workflow_call_scheduled.as_deref()).await;

    info!(
        "enqueued call {} for contact {} ({} / {:?})",
        queue_id, contact_id, service, province
    );
    (StatusCode::ACCEPTED, Json(json!({"queueId": queue_id}))).into_response()
}

fn reject(status: StatusCode, message: &str, critical: bool) -> axum::response::Response {
    let mut body = json!({"error": message});
    if critical {
        body["critical"] = json!(true);
    }
    (status, Json(body)).into_response()
}

async fn tag_workflow(state: &Arc<AppState>, contact_id: &str, workflow_id: Option<&str>) {
    let Some(workflow_id) = workflow_id else {
        return;
    };
    if let Err(e) = state.crm.add_to_workflow(contact_id, workflow_id).await {
        warn!("workflow tag {} failed for {}: {}", workflow_id, contact_id, e);
    }
}

/// Compose the Twilio call options stored on the queue row. The TwiML URL
/// carries the per-call custom parameters so the bridge can read them from
/// the stream's start frame.
#[allow(clippy::too_many_arguments)]
pub fn compose_call_options(
    state: &AppState,
    phone: &str,
    service: Service,
    contact_id: &str,
    first_name: &str,
    full_name: &str,
    email: &str,
    province: Option<&str>,
    abrupt: bool,
    past_call_summary: Option<&str>,
    original_conversation_id: Option<&str>,
) -> CallOptions {
    let mut query: Vec<(&str, String)> = vec![
        ("contactId", contact_id.to_string()),
        ("phone", phone.to_string()),
        ("firstName", first_name.to_string()),
        ("fullName", full_name.to_string()),
        ("email", email.to_string()),
        ("service", service.as_str().to_string()),
    ];
    if let Some(p) = province {
        query.push(("province", p.to_string()));
    }
    if abrupt {
        query.push(("isAbruptEndingRetry", "true".to_string()));
        if let Some(summary) = past_call_summary {
            query.push(("pastCallSummary", summary.to_string()));
        }
        if let Some(conv) = original_conversation_id {
            query.push(("originalConversationId", conv.to_string()));
        }
    }

    let query_string = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    CallOptions {
        to: phone.to_string(),
        from: state.config.twilio.from_number(service).to_string(),
        twiml_url: format!(
            "{}?{}",
            state.config.outbound_url("outbound-call-twiml"),
            query_string
        ),
        status_callback: state.config.outbound_url("call-status"),
    }
}
