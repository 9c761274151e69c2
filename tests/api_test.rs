//! End-to-end tests against the HTTP surface, with no external services:
//! everything exercised here fails validation or is served from the
//! embedded database before any outbound call would happen.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tower::util::ServiceExt;

use callserver::api_router::configure_routes;
use callserver::config::{AppConfig, CrmConfig, ElevenLabsConfig, PostCallAnalysisMode, TwilioConfig};
use callserver::shared::db::{open_conn, run_migrations};
use callserver::shared::state::AppState;

fn test_config(db_path: &str, webhook_secret: Option<&str>) -> AppConfig {
    AppConfig {
        twilio: TwilioConfig {
            account_sid: "AC_test".into(),
            auth_token: "token".into(),
            phone_number_infissi: "+390600000001".into(),
            phone_number_vetrate: "+390600000002".into(),
        },
        crm: CrmConfig {
            client_id: "client".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://example.com/hl/callback".into(),
            location_id: "LOC_test".into(),
            calendar_id: "CAL_test".into(),
        },
        elevenlabs: ElevenLabsConfig {
            api_key: "xi_key".into(),
            agent_id_outbound: "agent-out".into(),
            agent_id_inbound: "agent-in".into(),
            webhook_secret: webhook_secret.map(String::from),
        },
        // Unroutable loopback port: notification sends fail fast.
        notifier_webhook_url: "http://127.0.0.1:9/notify".into(),
        public_base_url: "https://example.com".into(),
        outbound_prefix: "outgoing".into(),
        inbound_prefix: "incoming".into(),
        database_path: db_path.to_string(),
        max_active_calls: 3,
        queue_tick_seconds: 10,
        post_call_analysis: PostCallAnalysisMode::Disabled,
        gemini_api_key: None,
        zip_sheet_id: None,
        sheets_api_key: None,
        default_appointment_address: "Da definire con il cliente".into(),
        rep_user_id_infissi: None,
        rep_user_id_vetrate: None,
        rep_user_id_pergole: None,
        workflow_no_rep: None,
        workflow_call_scheduled: None,
        server_port: 0,
    }
}

fn build_app(webhook_secret: Option<&str>) -> (axum::Router, String) {
    let db_path = format!(
        "file:apitest{}?mode=memory&cache=shared",
        uuid::Uuid::new_v4().simple()
    );
    let mut conn = open_conn(&db_path).unwrap();
    run_migrations(&mut conn).unwrap();
    // Keep one connection alive so the shared in-memory database survives
    // the per-request open/close cycle.
    std::mem::forget(conn);

    let state = Arc::new(AppState::new(test_config(&db_path, webhook_secret)));
    (configure_routes(state), db_path)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn health_reports_database_state() {
    let (app, _db) = build_app(None);
    let response = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("\"status\":\"healthy\""));
}

#[tokio::test]
async fn intake_rejects_missing_service_with_sentinel_message() {
    let (app, _db) = build_app(None);
    let payload = serde_json::json!({
        "phone": "+390612345678",
        "contact_id": "C1",
        "full_address": "Via Roma 1, 00100 Roma (RM)"
    });
    let response = app
        .oneshot(
            Request::post("/outgoing/outbound-call")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(body.contains("service field is required"));
}

#[tokio::test]
async fn intake_rejects_missing_address_with_sentinel_message() {
    let (app, _db) = build_app(None);
    let payload = serde_json::json!({
        "phone": "+390612345678",
        "contact_id": "C1",
        "Service": "Infissi"
    });
    let response = app
        .oneshot(
            Request::post("/outgoing/outbound-call")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(body.contains("Address is required"));
}

#[tokio::test]
async fn intake_rejects_missing_phone_or_contact() {
    let (app, _db) = build_app(None);
    let payload = serde_json::json!({
        "Service": "Pergole",
        "full_address": "Via Roma 1, 00100 Roma (RM)"
    });
    let response = app
        .oneshot(
            Request::post("/outgoing/outbound-call")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(body.contains("phone and contact_id"));
}

#[tokio::test]
async fn booking_rejects_malformed_dates_precisely() {
    let (app, _db) = build_app(None);
    let payload = serde_json::json!({
        "appointmentDate": "17/03/2025 alle dieci",
        "contactId": "C1"
    });
    let response = app
        .oneshot(
            Request::post("/bookAppointment")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(body.contains("DD-MM-YYYY HH:mm"));
}

#[tokio::test]
async fn follow_up_creation_parses_italian_wall_clock() {
    let (app, _db) = build_app(None);
    let payload = serde_json::json!({
        "contactId": "C1",
        // Winter date: Rome is UTC+1, so 10:00 becomes 09:00Z.
        "followUpDateTime": "15-01-2026 10:00"
    });
    let response = app
        .oneshot(
            Request::post("/followup")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_string(response).await;
    assert!(body.contains("2026-01-15T09:00:00Z"), "body was {}", body);
}

#[tokio::test]
async fn follow_up_creation_rejects_bad_format() {
    let (app, _db) = build_app(None);
    let payload = serde_json::json!({
        "contactId": "C1",
        "followUpDateTime": "next tuesday"
    });
    let response = app
        .oneshot(
            Request::post("/followup")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn post_call_webhook_requires_a_valid_signature() {
    let (app, _db) = build_app(Some("whsec_test"));
    let body = serde_json::json!({"type": "post_call_transcription", "data": {}}).to_string();

    let response = app
        .oneshot(
            Request::post("/elevenlabs/webhook")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn post_call_webhook_ignores_other_event_types() {
    let (app, _db) = build_app(Some("whsec_test"));
    let body = serde_json::json!({"type": "post_call_audio", "data": {}}).to_string();

    let timestamp = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec_test").unwrap();
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(body.as_bytes());
    let header = format!("t={},v0={}", timestamp, hex::encode(mac.finalize().into_bytes()));

    let response = app
        .oneshot(
            Request::post("/elevenlabs/webhook")
                .header("content-type", "application/json")
                .header("elevenlabs-signature", header)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("ignored"));
}

#[tokio::test]
async fn post_call_webhook_rejects_stale_signatures() {
    let (app, _db) = build_app(Some("whsec_test"));
    let body = serde_json::json!({"type": "post_call_transcription", "data": {}}).to_string();

    // 31 minutes in the past: one past the freshness window.
    let timestamp = Utc::now().timestamp() - 31 * 60;
    let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec_test").unwrap();
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(body.as_bytes());
    let header = format!("t={},v0={}", timestamp, hex::encode(mac.finalize().into_bytes()));

    let response = app
        .oneshot(
            Request::post("/elevenlabs/webhook")
                .header("content-type", "application/json")
                .header("elevenlabs-signature", header)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn outbound_twiml_echoes_custom_parameters() {
    let (app, _db) = build_app(None);
    let response = app
        .oneshot(
            Request::post("/outgoing/outbound-call-twiml?firstName=Anna&service=Infissi")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("<Connect>"));
    assert!(body.contains("wss://example.com/outgoing/outbound-media-stream"));
    assert!(body.contains("name=\"firstName\" value=\"Anna\""));
}

#[tokio::test]
async fn available_slots_outbound_validates_inputs() {
    let (app, _db) = build_app(None);
    let response = app
        .oneshot(
            Request::get("/availableSlotsOutbound?Timeframe=09:00&AppointmentDate=17-03-2025")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(body.contains("service field is required"));
}

#[tokio::test]
async fn inbound_status_callbacks_always_return_ok() {
    let (app, _db) = build_app(None);
    let response = app
        .oneshot(
            Request::post("/incoming/inbound-call-status")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from("CallSid=CA_in&CallStatus=completed"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_callbacks_always_return_ok() {
    let (app, db_path) = build_app(None);

    // No matching call record: the handler logs and still answers 200 so
    // Twilio does not retry forever.
    let response = app
        .oneshot(
            Request::post("/outgoing/call-status")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(
                    "CallSid=CA_unknown&CallStatus=no-answer&To=%2B390612345678",
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    drop(db_path);
}
