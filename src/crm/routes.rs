//! OAuth dance for the CRM: a redirect to the marketplace chooser and the
//! callback that exchanges the code and stores the location's tokens.

use crate::shared::state::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect},
    Json,
};
use log::{error, info};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAddressRequest {
    #[serde(rename = "contactId")]
    pub contact_id: String,
    #[serde(rename = "fullAddress")]
    pub full_address: String,
}

/// `POST /updateContactAddress`
pub async fn update_contact_address(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateAddressRequest>,
) -> impl IntoResponse {
    match state
        .crm
        .update_contact(
            &request.contact_id,
            serde_json::json!({"address1": request.full_address}),
        )
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "updated"})),
        )
            .into_response(),
        Err(e) => {
            error!("contact address update failed for {}: {}", request.contact_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// `GET /gohighlevel/auth`
pub async fn auth_start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Redirect::temporary(&state.crm.authorize_url())
}

/// `GET /hl/callback`
pub async fn auth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    if let Some(err) = params.error {
        error!("CRM OAuth callback returned error: {}", err);
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": err})),
        )
            .into_response();
    }

    let code = match params.code {
        Some(code) => code,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "missing authorization code"})),
            )
                .into_response();
        }
    };

    match state.crm.exchange_code(&code).await {
        Ok(location_id) => {
            info!("CRM authorized for location {}", location_id);
            Html(format!(
                "<html><body><h2>Authorization complete</h2>\
                 <p>Location <code>{}</code> is connected. You can close this window.</p>\
                 </body></html>",
                location_id
            ))
            .into_response()
        }
        Err(e) => {
            error!("CRM code exchange failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}
