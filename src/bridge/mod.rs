//! Media bridge: the per-call pump between Twilio and the voice agent.
//!
//! Each live call owns two sockets: the Twilio media stream (a WebSocket
//! Twilio opens against us) and the agent conversation socket (one we open
//! with a signed URL). A single select loop drives both directions, so
//! ordering between audio, interruptions and function calls is explicit.

use crate::booking::{self, BookRequest, BookingOutcome};
use crate::notify::NotifyContext;
use crate::shared::models::CallRecord;
use crate::shared::state::AppState;
use crate::slots::resolve_rep;
use crate::timeloc;
use crate::voiceai::{
    function_call_response, pong_message, user_audio_message, AiMessage, ConversationInitiation,
    FunctionCall,
};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use diesel::prelude::*;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_tungstenite::{connect_async, tungstenite::Message as AiWsMessage};

/// Frames Twilio sends over the media stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
pub enum TwilioFrame {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "start")]
    Start { start: StartFrame },
    #[serde(rename = "media")]
    Media { media: MediaPayload },
    #[serde(rename = "mark")]
    Mark,
    #[serde(rename = "stop")]
    Stop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct StartFrame {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid")]
    pub call_sid: String,
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

pub fn media_frame(stream_sid: &str, payload: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": {"payload": payload},
    })
    .to_string()
}

pub fn clear_frame(stream_sid: &str) -> String {
    json!({"event": "clear", "streamSid": stream_sid}).to_string()
}

/// Outbound media stream: bridge a placed call to the outbound agent.
pub async fn outbound_bridge(socket: WebSocket, state: Arc<AppState>) {
    let (tw_tx, mut tw_rx) = socket.split();

    let start = match wait_for_start(&mut tw_rx).await {
        Some(start) => start,
        None => {
            warn!("media stream closed before start frame");
            return;
        }
    };
    info!(
        "outbound media stream started: call {} stream {}",
        start.call_sid, start.stream_sid
    );

    let record = load_call_record(&state, &start.call_sid);
    if let Err(e) = mark_stream_started(&state, &start.call_sid, &start.stream_sid) {
        warn!("stream start update failed for {}: {}", start.call_sid, e);
    }

    // Prefer the signed URL minted at enqueue; fall back to a fresh one.
    let signed_url = match record.as_ref().and_then(|r| r.signed_url.clone()) {
        Some(url) => url,
        None => match state
            .elevenlabs
            .signed_url(&state.config.elevenlabs.agent_id_outbound)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                error!("signed URL fetch failed for {}: {}", start.call_sid, e);
                notify_bridge_failure(&state, &start, "signed URL unavailable", &e.to_string()).await;
                return;
            }
        },
    };

    let initiation = outbound_initiation(&start.custom_parameters, record.as_ref(), Utc::now());
    let contact_id = start
        .custom_parameters
        .get("contactId")
        .cloned()
        .unwrap_or_else(|| record.as_ref().map(|r| r.contact_id.clone()).unwrap_or_default());
    let slot_text = record
        .as_ref()
        .and_then(|r| r.available_slots.clone())
        .or_else(|| start.custom_parameters.get("availableSlots").cloned());

    run_bridge(
        state,
        BridgeSession {
            start,
            signed_url,
            initiation,
            contact_id,
            slot_text,
            inbound: false,
        },
        tw_tx,
        tw_rx,
    )
    .await;
}

/// Inbound media stream: bridge an answered incoming call to the inbound
/// agent, seeded with the next 48 hours of availability.
pub async fn inbound_bridge(socket: WebSocket, state: Arc<AppState>) {
    let (tw_tx, mut tw_rx) = socket.split();

    let start = match wait_for_start(&mut tw_rx).await {
        Some(start) => start,
        None => return,
    };
    info!(
        "inbound media stream started: call {} stream {}",
        start.call_sid, start.stream_sid
    );

    if let Err(e) = mark_incoming_stream(&state, &start.call_sid, &start.stream_sid) {
        warn!("incoming stream update failed for {}: {}", start.call_sid, e);
    }

    let signed_url = match state
        .elevenlabs
        .signed_url(&state.config.elevenlabs.agent_id_inbound)
        .await
    {
        Ok(url) => url,
        Err(e) => {
            error!("inbound signed URL fetch failed: {}", e);
            notify_bridge_failure(&state, &start, "signed URL unavailable", &e.to_string()).await;
            return;
        }
    };

    let availability = crate::inbound::current_availability_text(&state).await;
    let caller = start
        .custom_parameters
        .get("callerNumber")
        .cloned()
        .unwrap_or_default();
    let initiation = inbound_initiation(&caller, &availability, Utc::now());

    run_bridge(
        state,
        BridgeSession {
            start,
            signed_url,
            initiation,
            contact_id: String::new(),
            slot_text: Some(availability),
            inbound: true,
        },
        tw_tx,
        tw_rx,
    )
    .await;
}

struct BridgeSession {
    start: StartFrame,
    signed_url: String,
    initiation: ConversationInitiation,
    contact_id: String,
    slot_text: Option<String>,
    inbound: bool,
}

async fn run_bridge(
    state: Arc<AppState>,
    session: BridgeSession,
    mut tw_tx: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut tw_rx: futures_util::stream::SplitStream<WebSocket>,
) {
    let (ai_stream, _) = match connect_async(&session.signed_url).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(
                "agent socket connect failed for {}: {}",
                session.start.call_sid, e
            );
            notify_bridge_failure(&state, &session.start, "agent socket connect failed", &e.to_string())
                .await;
            return;
        }
    };
    let (mut ai_tx, mut ai_rx) = ai_stream.split();

    let init_payload = match serde_json::to_string(&session.initiation) {
        Ok(payload) => payload,
        Err(e) => {
            error!("initiation serialization failed: {}", e);
            return;
        }
    };
    if let Err(e) = ai_tx.send(AiWsMessage::Text(init_payload)).await {
        error!("initiation send failed for {}: {}", session.start.call_sid, e);
        return;
    }

    let stream_sid = session.start.stream_sid.clone();
    let call_sid = session.start.call_sid.clone();

    loop {
        tokio::select! {
            frame = tw_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<TwilioFrame>(&text) {
                            Ok(TwilioFrame::Media { media }) => {
                                let message = user_audio_message(&media.payload).to_string();
                                if ai_tx.send(AiWsMessage::Text(message)).await.is_err() {
                                    warn!("agent socket gone, ending bridge for {}", call_sid);
                                    break;
                                }
                            }
                            Ok(TwilioFrame::Stop) => {
                                info!("stop frame received for {}", call_sid);
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => warn!("unparseable media frame: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("telephony socket closed for {}", call_sid);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("telephony socket error for {}: {}", call_sid, e);
                        break;
                    }
                }
            }
            message = ai_rx.next() => {
                match message {
                    Some(Ok(AiWsMessage::Text(text))) => {
                        match serde_json::from_str::<AiMessage>(&text) {
                            Ok(AiMessage::Audio { audio_event }) => {
                                let frame = media_frame(&stream_sid, &audio_event.audio_base_64);
                                if tw_tx.send(WsMessage::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(AiMessage::Interruption) => {
                                // The caller spoke over the agent: flush
                                // Twilio's buffered audio.
                                let frame = clear_frame(&stream_sid);
                                if tw_tx.send(WsMessage::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(AiMessage::Ping { ping_event }) => {
                                let pong = pong_message(ping_event.event_id).to_string();
                                if ai_tx.send(AiWsMessage::Text(pong)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(AiMessage::ConversationInitiationMetadata {
                                conversation_initiation_metadata_event,
                            }) => {
                                let conv = conversation_initiation_metadata_event.conversation_id;
                                if let Err(e) = persist_conversation_id(
                                    &state,
                                    &call_sid,
                                    &conv,
                                    session.inbound,
                                ) {
                                    warn!("conversation id persist failed: {}", e);
                                }
                            }
                            Ok(AiMessage::FunctionCall { function_call }) => {
                                let response = handle_function_call(
                                    &state,
                                    function_call,
                                    &session.contact_id,
                                    session.slot_text.as_deref(),
                                )
                                .await;
                                if ai_tx.send(AiWsMessage::Text(response.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(AiMessage::Unknown) => {}
                            Err(e) => warn!("unparseable agent message: {}", e),
                        }
                    }
                    Some(Ok(AiWsMessage::Close(frame))) => {
                        if let Some(frame) = &frame {
                            let code = u16::from(frame.code);
                            // 1000 and 1005 are orderly; anything else is a
                            // mid-call agent failure worth waking someone.
                            if code != 1000 && code != 1005 {
                                warn!(
                                    "agent socket closed abnormally for {}: {} {:?}",
                                    call_sid, code, frame.reason
                                );
                                state
                                    .notifier
                                    .error(
                                        "Voice agent socket closed abnormally",
                                        NotifyContext {
                                            call_sid: Some(call_sid.clone()),
                                            contact_id: Some(session.contact_id.clone()),
                                            detail: Some(format!(
                                                "close code {}, reason {:?}",
                                                code, frame.reason
                                            )),
                                            ..Default::default()
                                        },
                                    )
                                    .await;
                            }
                        }
                        break;
                    }
                    None => {
                        info!("agent socket ended for {}", call_sid);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("agent socket error for {}: {}", call_sid, e);
                        break;
                    }
                }
            }
        }
    }

    // Orderly teardown: whichever side is still up gets closed; late sends
    // above already bail out on error instead of writing to a dead socket.
    let _ = ai_tx.send(AiWsMessage::Close(None)).await;
    let _ = tw_tx.send(WsMessage::Close(None)).await;

    if let Err(e) = mark_stream_ended(&state, &call_sid, session.inbound) {
        warn!("stream end update failed for {}: {}", call_sid, e);
    }
    info!("bridge ended for {}", call_sid);
}

async fn wait_for_start(
    tw_rx: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<StartFrame> {
    while let Some(frame) = tw_rx.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<TwilioFrame>(&text) {
                Ok(TwilioFrame::Start { start }) => return Some(start),
                Ok(TwilioFrame::Stop) => return None,
                _ => {}
            },
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

/// Dynamic variables for an outbound conversation. Identity comes from the
/// stream parameters, availability and province from the call record.
pub fn outbound_initiation(
    params: &HashMap<String, String>,
    record: Option<&CallRecord>,
    now: chrono::DateTime<Utc>,
) -> ConversationInitiation {
    let get = |key: &str| params.get(key).cloned().unwrap_or_default();
    let service = get("service");
    let business_name = crate::config::Service::parse(&service)
        .map(|s| s.business_name().to_string())
        .unwrap_or_default();

    let mut vars = Map::new();
    vars.insert("firstName".into(), Value::String(get("firstName")));
    vars.insert("fullName".into(), Value::String(get("fullName")));
    vars.insert("email".into(), Value::String(get("email")));
    vars.insert("phone".into(), Value::String(get("phone")));
    vars.insert("contactId".into(), Value::String(get("contactId")));
    vars.insert(
        "now".into(),
        Value::String(timeloc::now_italian_display(now)),
    );
    vars.insert(
        "availableSlots".into(),
        Value::String(
            record
                .and_then(|r| r.available_slots.clone())
                .unwrap_or_else(|| get("availableSlots")),
        ),
    );
    vars.insert("service".into(), Value::String(service));
    vars.insert("businessName".into(), Value::String(business_name));
    vars.insert(
        "province".into(),
        Value::String(
            record
                .and_then(|r| r.province.clone())
                .unwrap_or_else(|| get("province")),
        ),
    );

    let abrupt = params
        .get("isAbruptEndingRetry")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if abrupt {
        vars.insert("pastCallSummary".into(), Value::String(get("pastCallSummary")));
        vars.insert(
            "originalConversationId".into(),
            Value::String(get("originalConversationId")),
        );
        let first_name = get("firstName");
        let greeting = if first_name.is_empty() {
            "Pronto? Era caduta la linea, mi senti?".to_string()
        } else {
            format!("Pronto {}? Era caduta la linea, mi senti?", first_name)
        };
        ConversationInitiation::new(vars).with_first_message(greeting)
    } else {
        ConversationInitiation::new(vars)
    }
}

/// The smaller inbound variable set.
pub fn inbound_initiation(
    caller: &str,
    availability: &str,
    now: chrono::DateTime<Utc>,
) -> ConversationInitiation {
    let mut vars = Map::new();
    vars.insert("callerIdentifier".into(), Value::String(caller.to_string()));
    vars.insert(
        "nowDate".into(),
        Value::String(timeloc::now_italian_display(now)),
    );
    vars.insert(
        "availableSlots".into(),
        Value::String(availability.to_string()),
    );
    ConversationInitiation::new(vars)
}

/// `book_appointment` invoked from inside the conversation. The chosen time
/// is resolved back against the slot display contract to find the rep.
async fn handle_function_call(
    state: &Arc<AppState>,
    function_call: FunctionCall,
    contact_id: &str,
    slot_text: Option<&str>,
) -> Value {
    let call_id = function_call.call_id.as_deref();

    if function_call.name != "book_appointment" {
        warn!("unsupported function call {:?}", function_call.name);
        return function_call_response(
            call_id,
            false,
            &format!("Funzione non supportata: {}", function_call.name),
        );
    }

    let chosen = function_call.arguments["appointmentDate"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    if chosen.is_empty() {
        return function_call_response(call_id, false, "appointmentDate mancante");
    }

    let user_id = slot_text.and_then(|text| resolve_rep(&chosen, text));
    if user_id.is_none() {
        info!("no rep resolved for chosen slot {:?}", chosen);
    }

    let request = BookRequest {
        appointment_date: strip_letter_suffix(&chosen),
        contact_id: contact_id.to_string(),
        address: function_call.arguments["address"].as_str().map(String::from),
        user_id,
    };

    match booking::book(state, &request).await {
        BookingOutcome::Booked(_) => function_call_response(
            call_id,
            true,
            &format!("Appuntamento confermato per {}", request.appointment_date),
        ),
        BookingOutcome::AlternativesAvailable(slots) => {
            let options: Vec<String> = slots
                .iter()
                .take(6)
                .map(|s| {
                    let rome = timeloc::utc_to_italian(s.datetime_utc);
                    rome.format("%d-%m-%Y %H:%M").to_string()
                })
                .collect();
            function_call_response(
                call_id,
                false,
                &format!(
                    "Orario non disponibile. Alternative: {}",
                    options.join(", ")
                ),
            )
        }
        BookingOutcome::NoAlternatives => function_call_response(
            call_id,
            false,
            "Nessuna disponibilità nei prossimi giorni, serve un follow-up",
        ),
        BookingOutcome::InvalidDate(message) => function_call_response(call_id, false, &message),
    }
}

/// "17-03-2025 10:00 (B)" -> "17-03-2025 10:00"
fn strip_letter_suffix(chosen: &str) -> String {
    let trimmed = chosen.trim();
    if let Some(idx) = trimmed.rfind('(') {
        if trimmed.ends_with(')') {
            return trimmed[..idx].trim_end().to_string();
        }
    }
    trimmed.to_string()
}

fn load_call_record(state: &Arc<AppState>, sid: &str) -> Option<CallRecord> {
    use crate::shared::schema::calls::dsl::*;
    let mut conn = state.db().ok()?;
    calls
        .filter(call_sid.eq(sid))
        .first::<CallRecord>(&mut conn)
        .optional()
        .ok()
        .flatten()
}

fn mark_stream_started(state: &Arc<AppState>, sid: &str, stream: &str) -> anyhow::Result<()> {
    use crate::shared::schema::calls::dsl::*;
    let mut conn = state.db()?;
    diesel::update(calls.filter(call_sid.eq(sid)))
        .set((stream_sid.eq(stream), status.eq("in-progress")))
        .execute(&mut conn)?;
    Ok(())
}

fn mark_incoming_stream(state: &Arc<AppState>, sid: &str, stream: &str) -> anyhow::Result<()> {
    use crate::shared::schema::incoming_calls::dsl::*;
    let mut conn = state.db()?;
    diesel::update(incoming_calls.filter(call_sid.eq(sid)))
        .set((stream_sid.eq(stream), status.eq("in-progress")))
        .execute(&mut conn)?;
    Ok(())
}

fn persist_conversation_id(
    state: &Arc<AppState>,
    sid: &str,
    conversation: &str,
    inbound: bool,
) -> anyhow::Result<()> {
    let mut conn = state.db()?;
    if inbound {
        use crate::shared::schema::incoming_calls::dsl::*;
        diesel::update(incoming_calls.filter(call_sid.eq(sid)))
            .set(conversation_id.eq(conversation))
            .execute(&mut conn)?;
    } else {
        use crate::shared::schema::calls::dsl::*;
        diesel::update(calls.filter(call_sid.eq(sid)))
            .set(conversation_id.eq(conversation))
            .execute(&mut conn)?;
    }
    Ok(())
}

fn mark_stream_ended(state: &Arc<AppState>, sid: &str, inbound: bool) -> anyhow::Result<()> {
    let mut conn = state.db()?;
    if inbound {
        use crate::shared::schema::incoming_calls::dsl::*;
        diesel::update(incoming_calls.filter(call_sid.eq(sid)))
            .set(status.eq("completed"))
            .execute(&mut conn)?;
    } else {
        use crate::shared::schema::calls::dsl::*;
        diesel::update(calls.filter(call_sid.eq(sid)).filter(status.eq("in-progress")))
            .set(status.eq("completed"))
            .execute(&mut conn)?;
    }
    Ok(())
}

async fn notify_bridge_failure(state: &Arc<AppState>, start: &StartFrame, title: &str, detail: &str) {
    state
        .notifier
        .error(
            title,
            NotifyContext {
                call_sid: Some(start.call_sid.clone()),
                detail: Some(detail.to_string()),
                ..Default::default()
            },
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_start_frame_with_custom_parameters() {
        let raw = r#"{
            "event": "start",
            "start": {
                "streamSid": "MZ1",
                "callSid": "CA1",
                "customParameters": {"firstName": "Anna", "service": "Infissi"}
            }
        }"#;
        match serde_json::from_str::<TwilioFrame>(raw).unwrap() {
            TwilioFrame::Start { start } => {
                assert_eq!(start.stream_sid, "MZ1");
                assert_eq!(start.call_sid, "CA1");
                assert_eq!(start.custom_parameters["firstName"], "Anna");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn parses_media_and_stop_frames() {
        let media = r#"{"event":"media","streamSid":"MZ1","media":{"payload":"AAAA"}}"#;
        assert!(matches!(
            serde_json::from_str::<TwilioFrame>(media).unwrap(),
            TwilioFrame::Media { .. }
        ));
        let stop = r#"{"event":"stop","streamSid":"MZ1"}"#;
        assert!(matches!(
            serde_json::from_str::<TwilioFrame>(stop).unwrap(),
            TwilioFrame::Stop
        ));
    }

    #[test]
    fn media_frame_shape_matches_twilio_contract() {
        let frame: Value = serde_json::from_str(&media_frame("MZ1", "AAAA")).unwrap();
        assert_eq!(frame["event"], "media");
        assert_eq!(frame["streamSid"], "MZ1");
        assert_eq!(frame["media"]["payload"], "AAAA");
    }

    #[test]
    fn clear_frame_targets_the_stream() {
        let frame: Value = serde_json::from_str(&clear_frame("MZ9")).unwrap();
        assert_eq!(frame["event"], "clear");
        assert_eq!(frame["streamSid"], "MZ9");
    }

    #[test]
    fn outbound_variables_include_business_name() {
        let mut params = HashMap::new();
        params.insert("firstName".to_string(), "Anna".to_string());
        params.insert("service".to_string(), "Vetrate".to_string());
        params.insert("contactId".to_string(), "C1".to_string());

        let now = Utc.with_ymd_and_hms(2025, 3, 17, 9, 0, 0).unwrap();
        let initiation = outbound_initiation(&params, None, now);
        let rendered = serde_json::to_value(&initiation).unwrap();
        assert_eq!(rendered["dynamic_variables"]["businessName"], "UNICOVETRATE");
        assert_eq!(rendered["dynamic_variables"]["firstName"], "Anna");
        assert!(rendered.get("conversation_config_override").is_none());
    }

    #[test]
    fn abrupt_retry_overrides_first_message() {
        let mut params = HashMap::new();
        params.insert("firstName".to_string(), "Anna".to_string());
        params.insert("service".to_string(), "Infissi".to_string());
        params.insert("isAbruptEndingRetry".to_string(), "true".to_string());
        params.insert("pastCallSummary".to_string(), "stava scegliendo l'orario".to_string());
        params.insert("originalConversationId".to_string(), "conv1".to_string());

        let now = Utc.with_ymd_and_hms(2025, 3, 17, 9, 0, 0).unwrap();
        let rendered = serde_json::to_value(outbound_initiation(&params, None, now)).unwrap();
        assert_eq!(
            rendered["conversation_config_override"]["agent"]["first_message"],
            "Pronto Anna? Era caduta la linea, mi senti?"
        );
        assert_eq!(
            rendered["dynamic_variables"]["pastCallSummary"],
            "stava scegliendo l'orario"
        );
        assert_eq!(rendered["dynamic_variables"]["originalConversationId"], "conv1");
    }

    #[test]
    fn inbound_variables_are_the_small_set() {
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 9, 0, 0).unwrap();
        let rendered =
            serde_json::to_value(inbound_initiation("+3906555", "slots here", now)).unwrap();
        let vars = rendered["dynamic_variables"].as_object().unwrap();
        assert_eq!(vars.len(), 3);
        assert_eq!(vars["callerIdentifier"], "+3906555");
        assert_eq!(vars["availableSlots"], "slots here");
    }

    #[test]
    fn letter_suffix_is_stripped_for_booking() {
        assert_eq!(strip_letter_suffix("17-03-2025 10:00 (B)"), "17-03-2025 10:00");
        assert_eq!(strip_letter_suffix("17-03-2025 10:00"), "17-03-2025 10:00");
        assert_eq!(strip_letter_suffix("10:00 (A)"), "10:00");
    }
}
