//! Missed-action analysis: a second look at the transcript.
//!
//! The live agent sometimes agrees to something without doing it (books
//! verbally but never calls the tool, promises a callback, hears a new
//! address). A constrained LLM pass finds those gaps and the recovery code
//! executes them: booking retroactively, scheduling a follow-up, updating
//! the contact.

use crate::booking::{self, BookRequest, BookingOutcome};
use crate::config::{PostCallAnalysisMode, Service};
use crate::notify::NotifyContext;
use crate::shared::models::NewFollowUp;
use crate::shared::state::AppState;
use crate::slots::{fetch_free_slots, SlotQueryOutcome};
use crate::timeloc;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use log::{error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

const MAX_LLM_RETRIES: u32 = 3;

pub async fn run(state: &Arc<AppState>, payload: &Value, contact_id: &str, full_name: &str) {
    let result = match state.config.post_call_analysis {
        PostCallAnalysisMode::Disabled => return,
        PostCallAnalysisMode::Mock => {
            info!("post-call analysis running in mock mode");
            mock_analysis()
        }
        PostCallAnalysisMode::Enabled => {
            let Some(llm) = state.llm_ref() else {
                error!("post-call analysis enabled but no LLM client available");
                return;
            };
            let transcript = render_transcript(&payload["data"]["transcript"]);
            let used_tools = used_tool_names(&payload["data"]["transcript"]);
            let prompt = build_prompt(&transcript, &used_tools, full_name);

            let mut attempt = 0;
            loop {
                match llm.generate_json(&prompt, &analysis_schema()).await {
                    Ok(result) => break result,
                    Err(e) if attempt + 1 < MAX_LLM_RETRIES => {
                        attempt += 1;
                        let backoff = std::time::Duration::from_secs(1u64 << attempt);
                        warn!(
                            "analysis attempt {} failed ({}), retrying in {:?}",
                            attempt, e, backoff
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => {
                        error!("post-call analysis failed after {} attempts: {}", MAX_LLM_RETRIES, e);
                        return;
                    }
                }
            }
        }
    };

    execute_recovery(state, payload, contact_id, &result).await;
}

/// Carry out whatever the analysis found, in priority order: the missed
/// appointment first, then the follow-up, then contact enrichment.
async fn execute_recovery(
    state: &Arc<AppState>,
    payload: &Value,
    contact_id: &str,
    result: &Value,
) {
    let used_tools = used_tool_names(&payload["data"]["transcript"]);
    let already_booked = used_tools.iter().any(|t| t == "book_appointment");

    let vars = &payload["data"]["conversation_initiation_client_data"]["dynamic_variables"];
    let service = vars["service"].as_str().and_then(Service::parse);
    let province = vars["province"].as_str().unwrap_or_default().to_string();

    let mut booked_here = false;

    if result["needsAppointment"].as_bool() == Some(true) && !already_booked {
        booked_here = book_earliest_slot(state, contact_id, service, &province).await;
        if !booked_here {
            // No bookable slot: fall back to a follow-up a day out.
            schedule_follow_up(state, contact_id, 24, service, &province, "no slots for missed appointment");
        }
    }

    if !booked_here && !already_booked && result["needsFollowUp"].as_bool() == Some(true) {
        let hours = match result["followUpDetails"]["suggestedDelay"].as_str() {
            Some("48h") => 48,
            Some("1week") => 168,
            _ => 24,
        };
        let reason = result["followUpDetails"]["reasoning"]
            .as_str()
            .unwrap_or("analysis suggested a follow-up")
            .to_string();
        schedule_follow_up(state, contact_id, hours, service, &province, &reason);
    }

    if result["needsContactUpdate"].as_bool() == Some(true) {
        let details = &result["contactUpdateDetails"];
        if let Some(address) = details["newAddress"].as_str().filter(|a| !a.trim().is_empty()) {
            if let Err(e) = state
                .crm
                .update_contact(contact_id, json!({"address1": address}))
                .await
            {
                warn!("contact address update failed for {}: {}", contact_id, e);
            }
        }
        let mut notes = Vec::new();
        if let Some(n) = details["additionalNotes"].as_str().filter(|n| !n.trim().is_empty()) {
            notes.push(n.to_string());
        }
        if let Some(sd) = details["serviceDetails"].as_str().filter(|s| !s.trim().is_empty()) {
            notes.push(format!("Dettagli servizio: {}", sd));
        }
        if !notes.is_empty() {
            if let Err(e) = state.crm.add_contact_note(contact_id, &notes.join("\n")).await {
                warn!("contact note from analysis failed for {}: {}", contact_id, e);
            }
        }
    }
}

/// Book the earliest available slot for the contact's routing pair.
async fn book_earliest_slot(
    state: &Arc<AppState>,
    contact_id: &str,
    service: Option<Service>,
    province: &str,
) -> bool {
    let Some(service) = service else { return false };
    if province.is_empty() {
        return false;
    }

    let rep_ids = state
        .db()
        .and_then(|mut conn| crate::reps::rep_ids_for(&mut conn, service, province))
        .unwrap_or_default();
    if rep_ids.is_empty() {
        return false;
    }

    let now = Utc::now();
    let outcome = fetch_free_slots(state.crm.as_ref(), now, now + Duration::days(7), &rep_ids, 1).await;
    let slot = match outcome {
        SlotQueryOutcome::Slots(slots) if !slots.is_empty() => slots[0].clone(),
        _ => return false,
    };

    let rome = timeloc::utc_to_italian(slot.datetime_utc);
    let request = BookRequest {
        appointment_date: rome.format("%d-%m-%Y %H:%M").to_string(),
        contact_id: contact_id.to_string(),
        address: None,
        user_id: Some(slot.rep_id.clone()),
    };

    match booking::book(state, &request).await {
        BookingOutcome::Booked(_) => {
            info!(
                "missed appointment recovered for {} at {}",
                contact_id, request.appointment_date
            );
            state
                .notifier
                .info(
                    "Missed appointment booked from transcript analysis",
                    NotifyContext {
                        contact_id: Some(contact_id.to_string()),
                        service: Some(service.as_str().to_string()),
                        province: Some(province.to_string()),
                        detail: Some(request.appointment_date.clone()),
                        ..Default::default()
                    },
                )
                .await;
            true
        }
        _ => false,
    }
}

fn schedule_follow_up(
    state: &Arc<AppState>,
    contact: &str,
    hours: i64,
    service: Option<Service>,
    province: &str,
    reason: &str,
) {
    use crate::shared::schema::follow_ups;

    let entry = NewFollowUp {
        contact_id: contact.to_string(),
        follow_up_at: Utc::now() + Duration::hours(hours),
        status: "pending".to_string(),
        province: (!province.is_empty()).then(|| province.to_string()),
        service: service.map(|s| s.as_str().to_string()),
        created_at: Utc::now(),
    };

    match state.db() {
        Ok(mut conn) => match diesel::insert_into(follow_ups::table).values(&entry).execute(&mut conn) {
            Ok(_) => info!("follow-up in {}h scheduled for {} ({})", hours, contact, reason),
            Err(e) => error!("follow-up insert failed for {}: {}", contact, e),
        },
        Err(e) => error!("follow-up insert failed for {}: {}", contact, e),
    }
}

fn render_transcript(transcript: &Value) -> String {
    transcript
        .as_array()
        .map(|turns| {
            turns
                .iter()
                .filter_map(|t| {
                    let role = t["role"].as_str()?;
                    let message = t["message"].as_str()?;
                    Some(format!("{}: {}", role, message))
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Tool names the live agent already invoked; used to avoid double-booking.
pub fn used_tool_names(transcript: &Value) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(turns) = transcript.as_array() {
        for turn in turns {
            if let Some(calls) = turn["tool_calls"].as_array() {
                for call in calls {
                    if let Some(name) = call["tool_name"].as_str().or_else(|| call["name"].as_str())
                    {
                        names.push(name.to_string());
                    }
                }
            }
        }
    }
    names
}

fn build_prompt(transcript: &str, used_tools: &[String], full_name: &str) -> String {
    format!(
        "Analizza questa trascrizione di una chiamata di vendita con {}.\n\
         Strumenti già usati dall'agente durante la chiamata: {}.\n\
         Individua azioni promesse ma non eseguite: un appuntamento concordato \
         a voce ma mai prenotato, una richiesta di essere richiamato, un nuovo \
         indirizzo o dettagli sul servizio comunicati dal cliente.\n\n\
         Trascrizione:\n{}",
        if full_name.is_empty() { "il cliente" } else { full_name },
        if used_tools.is_empty() { "nessuno".to_string() } else { used_tools.join(", ") },
        transcript
    )
}

fn analysis_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "needsAppointment": {"type": "boolean"},
            "appointmentDetails": {
                "type": "object",
                "properties": {
                    "date": {"type": "string"},
                    "time": {"type": "string"},
                    "notes": {"type": "string"}
                }
            },
            "needsFollowUp": {"type": "boolean"},
            "followUpDetails": {
                "type": "object",
                "properties": {
                    "suggestedDelay": {"type": "string", "enum": ["24h", "48h", "1week"]},
                    "reasoning": {"type": "string"}
                }
            },
            "needsContactUpdate": {"type": "boolean"},
            "contactUpdateDetails": {
                "type": "object",
                "properties": {
                    "newAddress": {"type": "string"},
                    "additionalNotes": {"type": "string"},
                    "serviceDetails": {"type": "string"}
                }
            },
            "overallAssessment": {"type": "string"}
        },
        "required": ["needsAppointment", "needsFollowUp", "needsContactUpdate", "overallAssessment"]
    })
}

fn mock_analysis() -> Value {
    json!({
        "needsAppointment": false,
        "needsFollowUp": false,
        "needsContactUpdate": false,
        "overallAssessment": "mock analysis: no actions detected"
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_used_tool_names() {
        let transcript = json!([
            {"role": "agent", "message": "un attimo", "tool_calls": [{"tool_name": "book_appointment"}]},
            {"role": "user", "message": "ok"},
            {"role": "agent", "message": "fatto", "tool_calls": [{"name": "end_call"}]}
        ]);
        assert_eq!(used_tool_names(&transcript), vec!["book_appointment", "end_call"]);
    }

    #[test]
    fn renders_transcript_lines() {
        let transcript = json!([
            {"role": "agent", "message": "pronto"},
            {"role": "user", "message": "sì, mi dica"}
        ]);
        assert_eq!(render_transcript(&transcript), "agent: pronto\nuser: sì, mi dica");
    }

    #[test]
    fn prompt_mentions_used_tools() {
        let prompt = build_prompt("agent: ciao", &["book_appointment".to_string()], "Anna Rossi");
        assert!(prompt.contains("book_appointment"));
        assert!(prompt.contains("Anna Rossi"));
    }

    #[test]
    fn schema_requires_the_three_flags() {
        let schema = analysis_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(required.contains(&"needsAppointment"));
        assert!(required.contains(&"needsFollowUp"));
        assert!(required.contains(&"needsContactUpdate"));
    }
}
