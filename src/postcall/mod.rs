//! Post-call pipeline: the signed webhook the voice-AI provider fires
//! after every conversation.
//!
//! Verification happens before anything touches the payload. Only
//! transcription events are acted on: the call record gets its outcome and
//! summary, the CRM contact gets an Italian note, and the transcript is
//! handed to the missed-action analysis in the background.

use crate::notify::NotifyContext;
use crate::shared::state::AppState;
use crate::voiceai::signature::{self, SignatureError};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use diesel::prelude::*;
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

pub mod analysis;

const SIGNATURE_HEADER: &str = "elevenlabs-signature";

/// `POST /elevenlabs/webhook`
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.config.elevenlabs.webhook_secret {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if let Err(e) = signature::verify(secret, header, &body, Utc::now()) {
            let source_ip = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            let user_agent = headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            warn!(
                "post-call webhook rejected ({}) from {} ua {}",
                e, source_ip, user_agent
            );
            state
                .notifier
                .error(
                    "Post-call webhook signature rejected",
                    NotifyContext {
                        detail: Some(format!(
                            "{} — source ip {}, user agent {}",
                            e, source_ip, user_agent
                        )),
                        ..Default::default()
                    },
                )
                .await;
            let message = match e {
                SignatureError::Stale => "signature expired",
                _ => "invalid signature",
            };
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": message}))).into_response();
        }
    } else {
        warn!("post-call webhook accepted WITHOUT signature validation (no secret configured)");
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("post-call webhook body unparseable: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid JSON"}))).into_response();
        }
    };

    if payload["type"].as_str() != Some("post_call_transcription") {
        return (StatusCode::OK, Json(json!({"status": "ignored"}))).into_response();
    }

    process_transcription(&state, &payload).await;
    (StatusCode::OK, Json(json!({"status": "received"}))).into_response()
}

async fn process_transcription(state: &Arc<AppState>, payload: &Value) {
    let data = &payload["data"];
    let conversation_id = data["conversation_id"].as_str().unwrap_or_default().to_string();
    let vars = &data["conversation_initiation_client_data"]["dynamic_variables"];

    let contact_id = vars["contactId"].as_str().unwrap_or_default().to_string();
    let phone = vars["phone"].as_str().unwrap_or_default().to_string();
    let full_name = vars["fullName"].as_str().unwrap_or_default().to_string();
    let service = vars["service"].as_str().unwrap_or_default().to_string();

    let outcome = data["analysis"]["call_successful"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let summary = build_summary(data);

    info!(
        "post-call transcription for conversation {} (contact {:?}): {}",
        conversation_id, contact_id, outcome
    );

    // A contactId equal to the conversation id means no real contact was
    // tracked for this call; skip CRM writes in that case.
    let real_contact = !contact_id.is_empty() && contact_id != conversation_id;
    if real_contact {
        let note = format!(
            "Esito chiamata AI: {}.\nRiassunto: {}\nConversazione: {}",
            italian_outcome(&outcome),
            summary,
            conversation_id
        );
        if let Err(e) = state.crm.add_contact_note(&contact_id, &note).await {
            warn!("post-call note failed for {}: {}", contact_id, e);
        }
    }

    if let Err(e) = update_call_record(state, &conversation_id, &outcome, &summary) {
        warn!(
            "post-call record update failed for conversation {}: {}",
            conversation_id, e
        );
    }

    state
        .notifier
        .info(
            &format!("Call finished: {}", italian_outcome(&outcome)),
            NotifyContext {
                contact_id: real_contact.then(|| contact_id.clone()),
                phone: (!phone.is_empty()).then(|| phone.clone()),
                service: (!service.is_empty()).then(|| service.clone()),
                detail: Some(format!(
                    "{}\n{}",
                    summary,
                    evaluation_summary(data).unwrap_or_default()
                )),
                ..Default::default()
            },
        )
        .await;

    // The analysis pass must not delay the 200 to the provider.
    let transcript_len = data["transcript"].as_array().map(|t| t.len()).unwrap_or(0);
    let should_analyze = matches!(outcome.as_str(), "success" | "partial")
        && real_contact
        && transcript_len > 0;
    if should_analyze {
        let state = state.clone();
        let payload = payload.clone();
        let name = full_name;
        tokio::spawn(async move {
            analysis::run(&state, &payload, &contact_id, &name).await;
        });
    }
}

fn build_summary(data: &Value) -> String {
    if let Some(summary) = data["analysis"]["transcript_summary"].as_str() {
        if !summary.trim().is_empty() {
            return summary.trim().to_string();
        }
    }

    let transcript = data["transcript"].as_array();
    match transcript {
        Some(turns) if !turns.is_empty() => {
            let agent = turns
                .iter()
                .filter(|t| t["role"].as_str() == Some("agent"))
                .count();
            format!(
                "Conversazione di {} messaggi ({} dell'agente, {} del cliente)",
                turns.len(),
                agent,
                turns.len() - agent
            )
        }
        _ => "Nessuna trascrizione disponibile".to_string(),
    }
}

fn italian_outcome(outcome: &str) -> &str {
    match outcome {
        "success" => "positivo",
        "partial" => "parziale",
        "failure" => "negativo",
        other => other,
    }
}

fn evaluation_summary(data: &Value) -> Option<String> {
    let results = data["analysis"]["evaluation_criteria_results"].as_object()?;
    let lines: Vec<String> = results
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v["result"].as_str().unwrap_or("?")))
        .collect();
    (!lines.is_empty()).then(|| lines.join(", "))
}

fn update_call_record(
    state: &Arc<AppState>,
    conversation: &str,
    outcome: &str,
    summary: &str,
) -> anyhow::Result<()> {
    use crate::shared::schema::calls::dsl::*;
    let mut conn = state.db()?;
    diesel::update(calls.filter(conversation_id.eq(conversation)))
        .set((
            status.eq(format!("completed-{}", outcome)),
            transcript_summary.eq(summary),
        ))
        .execute(&mut conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_prefers_analysis_text() {
        let data = json!({
            "analysis": {"transcript_summary": " Il cliente vuole un preventivo. "},
            "transcript": [{"role": "agent", "message": "ciao"}]
        });
        assert_eq!(build_summary(&data), "Il cliente vuole un preventivo.");
    }

    #[test]
    fn summary_falls_back_to_turn_counts() {
        let data = json!({
            "analysis": {},
            "transcript": [
                {"role": "agent", "message": "pronto"},
                {"role": "user", "message": "sì"},
                {"role": "agent", "message": "perfetto"}
            ]
        });
        assert_eq!(
            build_summary(&data),
            "Conversazione di 3 messaggi (2 dell'agente, 1 del cliente)"
        );
    }

    #[test]
    fn summary_handles_missing_transcript() {
        assert_eq!(build_summary(&json!({})), "Nessuna trascrizione disponibile");
    }

    #[test]
    fn outcomes_render_in_italian() {
        assert_eq!(italian_outcome("success"), "positivo");
        assert_eq!(italian_outcome("partial"), "parziale");
        assert_eq!(italian_outcome("failure"), "negativo");
        assert_eq!(italian_outcome("unknown"), "unknown");
    }

    #[test]
    fn evaluation_summary_lists_criteria() {
        let data = json!({
            "analysis": {
                "evaluation_criteria_results": {
                    "politeness": {"result": "success"},
                    "booking_attempted": {"result": "failure"}
                }
            }
        });
        let rendered = evaluation_summary(&data).unwrap();
        assert!(rendered.contains("politeness: success"));
        assert!(rendered.contains("booking_attempted: failure"));
    }
}
