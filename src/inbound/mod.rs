//! Inbound call handling: answer, bridge to the inbound agent, and track
//! the call in `incoming_calls`.

use crate::bridge;
use crate::shared::models::IncomingCall;
use crate::shared::state::AppState;
use crate::telephony;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Form, Router,
};
use chrono::Utc;
use diesel::prelude::*;
use log::{error, info, warn};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/incoming-call", post(incoming_call))
        .route("/inbound-call-status", post(inbound_call_status))
        .route("/inbound-media-stream", get(inbound_media_stream))
}

#[derive(Debug, Deserialize)]
pub struct IncomingCallParams {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From")]
    pub from: Option<String>,
}

/// `POST /{inbound}/incoming-call` — answer with TwiML bridging the caller
/// to the inbound media stream.
async fn incoming_call(
    State(state): State<Arc<AppState>>,
    Form(params): Form<IncomingCallParams>,
) -> impl IntoResponse {
    let caller = params.from.clone().unwrap_or_default();
    info!("incoming call {} from {}", params.call_sid, caller);

    // Fail fast when the agent cannot be reached: better a busy signal than
    // a silent line.
    if let Err(e) = state
        .elevenlabs
        .signed_url(&state.config.elevenlabs.agent_id_inbound)
        .await
    {
        error!("inbound agent unavailable: {}", e);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/xml")],
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response><Reject /></Response>"
                .to_string(),
        );
    }

    let record = IncomingCall {
        call_sid: params.call_sid.clone(),
        caller_number: caller.clone(),
        status: "ringing".to_string(),
        created_at: Utc::now(),
        conversation_id: None,
        stream_sid: None,
    };
    {
        use crate::shared::schema::incoming_calls::dsl::*;
        match state.db() {
            Ok(mut conn) => {
                if let Err(e) = diesel::replace_into(incoming_calls)
                    .values(&record)
                    .execute(&mut conn)
                {
                    warn!("incoming call persist failed: {}", e);
                }
            }
            Err(e) => warn!("incoming call persist failed: {}", e),
        }
    }

    let stream_url = format!(
        "{}/{}/inbound-media-stream",
        state.config.websocket_base(),
        state.config.inbound_prefix
    );
    let twiml = telephony::bridge_twiml(
        &stream_url,
        &[("callSid", params.call_sid.as_str()), ("callerNumber", caller.as_str())],
    );

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], twiml)
}

/// `POST /{inbound}/inbound-call-status` — always 200.
async fn inbound_call_status(
    State(state): State<Arc<AppState>>,
    Form(params): Form<telephony::StatusCallbackParams>,
) -> impl IntoResponse {
    use crate::shared::schema::incoming_calls::dsl::*;
    if let Ok(mut conn) = state.db() {
        if let Err(e) = diesel::update(incoming_calls.filter(call_sid.eq(&params.call_sid)))
            .set(status.eq(&params.call_status))
            .execute(&mut conn)
        {
            warn!("inbound status update failed for {}: {}", params.call_sid, e);
        }
    }
    StatusCode::OK
}

/// `GET /{inbound}/inbound-media-stream` (WebSocket upgrade)
async fn inbound_media_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge::inbound_bridge(socket, state))
}

/// Availability text the inbound agent is seeded with: Rome-today plus the
/// next day, across every active rep.
pub async fn current_availability_text(state: &Arc<AppState>) -> String {
    crate::slots::routes::next_two_days_text(state).await
}
