//! Outbound call routes: intake, TwiML, status callbacks and the media
//! stream. Mounted under the configurable outbound prefix.

use crate::bridge;
use crate::shared::state::AppState;
use crate::telephony::{self, StatusCallbackParams};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{any, get, post},
    Form, Router,
};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

pub mod intake;
pub mod retry;
pub mod worker;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/outbound-call", post(intake::outbound_call))
        .route("/call-status", post(call_status))
        .route("/outbound-call-twiml", any(outbound_call_twiml))
        .route("/outbound-media-stream", get(outbound_media_stream))
}

/// `POST /{outbound}/call-status` — always 200; Twilio retries anything
/// else and the retry scheduler is idempotent anyway.
async fn call_status(
    State(state): State<Arc<AppState>>,
    Form(params): Form<StatusCallbackParams>,
) -> impl IntoResponse {
    debug!(
        "status callback: {} {} {:?}",
        params.call_sid, params.call_status, params.answered_by
    );
    retry::handle_status_callback(&state, params).await;
    StatusCode::OK
}

/// `ALL /{outbound}/outbound-call-twiml` — the bridge instruction Twilio
/// fetches when the call connects. Query parameters become stream custom
/// parameters readable by the media bridge.
async fn outbound_call_twiml(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let stream_url = format!(
        "{}/{}/outbound-media-stream",
        state.config.websocket_base(),
        state.config.outbound_prefix
    );
    let parameters: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let twiml = telephony::bridge_twiml(&stream_url, &parameters);
    ([(header::CONTENT_TYPE, "text/xml")], twiml)
}

/// `GET /{outbound}/outbound-media-stream` (WebSocket upgrade)
async fn outbound_media_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge::outbound_bridge(socket, state))
}
