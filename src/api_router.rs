//! Route table.
//!
//! Outbound and inbound call routes live under their configurable prefixes;
//! everything else is flat, matching what the external collaborators are
//! configured to call.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::shared::state::AppState;

pub fn configure_routes(state: Arc<AppState>) -> Router {
    let outbound_prefix = format!("/{}", state.config.outbound_prefix);
    let inbound_prefix = format!("/{}", state.config.inbound_prefix);

    Router::new()
        .route("/", get(health_check))
        .nest(&outbound_prefix, crate::outbound::router())
        .nest(&inbound_prefix, crate::inbound::router())
        .route(
            "/availableSlotsOutbound",
            get(crate::slots::routes::available_slots_outbound),
        )
        .route(
            "/availableSlotsInbound",
            get(crate::slots::routes::available_slots_inbound),
        )
        .route("/bookAppointment", post(crate::booking::book_appointment))
        .route(
            "/updateContactAddress",
            post(crate::crm::routes::update_contact_address),
        )
        .route("/followup", post(crate::followup::create_follow_up))
        .route("/followup/trigger", post(crate::followup::trigger_sweep))
        .route("/elevenlabs/webhook", post(crate::postcall::webhook))
        .route("/gohighlevel/auth", get(crate::crm::routes::auth_start))
        .route("/hl/callback", get(crate::crm::routes::auth_callback))
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = state.db().is_ok();

    let status = if db_ok { "healthy" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "service": "callserver",
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_ok
        })),
    )
}
