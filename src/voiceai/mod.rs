//! ElevenLabs conversational-AI client.
//!
//! Three surfaces: the signed-URL endpoint that authorizes one WebSocket
//! session per call, the typed messages flowing over that socket, and the
//! signature scheme of the post-call webhook.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub mod signature;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub enum ElevenLabsError {
    NetworkError(String),
    ApiError(u16, String),
    ParseError(String),
}

impl std::fmt::Display for ElevenLabsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkError(e) => write!(f, "ElevenLabs network error: {}", e),
            Self::ApiError(status, body) => write!(f, "ElevenLabs API error {}: {}", status, body),
            Self::ParseError(e) => write!(f, "ElevenLabs parse error: {}", e),
        }
    }
}

impl std::error::Error for ElevenLabsError {}

pub struct ElevenLabsClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl ElevenLabsClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http_client: Client::new(),
            api_key,
            base_url: "https://api.elevenlabs.io".to_string(),
        }
    }

    /// Short-lived wss:// URL authorizing one conversation session against
    /// the given agent.
    pub async fn signed_url(&self, agent_id: &str) -> Result<String, ElevenLabsError> {
        let url = format!(
            "{}/v1/convai/conversation/get-signed-url?agent_id={}",
            self.base_url,
            urlencoding::encode(agent_id)
        );

        let response = self
            .http_client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ElevenLabsError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ElevenLabsError::ApiError(status.as_u16(), body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ElevenLabsError::ParseError(e.to_string()))?;

        body["signed_url"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ElevenLabsError::ParseError("response missing signed_url".into()))
    }
}

/// Messages the agent sends over the conversation socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AiMessage {
    #[serde(rename = "conversation_initiation_metadata")]
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: MetadataEvent,
    },
    #[serde(rename = "audio")]
    Audio { audio_event: AudioEvent },
    #[serde(rename = "interruption")]
    Interruption,
    #[serde(rename = "ping")]
    Ping { ping_event: PingEvent },
    #[serde(rename = "function_call")]
    FunctionCall { function_call: FunctionCall },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct MetadataEvent {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
}

#[derive(Debug, Deserialize)]
pub struct PingEvent {
    pub event_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub arguments: Value,
}

/// One caller-audio chunk toward the agent.
pub fn user_audio_message(payload_base64: &str) -> Value {
    serde_json::json!({
        "type": "user_audio",
        "user_audio_chunk": payload_base64,
    })
}

pub fn pong_message(event_id: i64) -> Value {
    serde_json::json!({"type": "pong", "event_id": event_id})
}

pub fn function_call_response(call_id: Option<&str>, success: bool, result: &str) -> Value {
    serde_json::json!({
        "type": "function_call_response",
        "call_id": call_id,
        "success": success,
        "result": result,
    })
}

/// The single initiation message sent when the socket opens, carrying the
/// per-call dynamic variables and optional overrides.
#[derive(Debug, Serialize)]
pub struct ConversationInitiation {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub dynamic_variables: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_config_override: Option<ConversationConfigOverride>,
}

#[derive(Debug, Serialize)]
pub struct ConversationConfigOverride {
    pub agent: AgentOverride,
}

#[derive(Debug, Serialize)]
pub struct AgentOverride {
    pub first_message: String,
}

impl ConversationInitiation {
    pub fn new(dynamic_variables: Map<String, Value>) -> Self {
        Self {
            message_type: "conversation_initiation_client_data",
            dynamic_variables,
            conversation_config_override: None,
        }
    }

    pub fn with_first_message(mut self, first_message: String) -> Self {
        self.conversation_config_override = Some(ConversationConfigOverride {
            agent: AgentOverride { first_message },
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_audio_message() {
        let raw = r#"{"type":"audio","audio_event":{"audio_base_64":"AAAA","event_id":7}}"#;
        match serde_json::from_str::<AiMessage>(raw).unwrap() {
            AiMessage::Audio { audio_event } => assert_eq!(audio_event.audio_base_64, "AAAA"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_ping_and_builds_pong() {
        let raw = r#"{"type":"ping","ping_event":{"event_id":42}}"#;
        match serde_json::from_str::<AiMessage>(raw).unwrap() {
            AiMessage::Ping { ping_event } => {
                let pong = pong_message(ping_event.event_id);
                assert_eq!(pong["type"], "pong");
                assert_eq!(pong["event_id"], 42);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_function_call_with_arguments() {
        let raw = r#"{"type":"function_call","function_call":{"name":"book_appointment","call_id":"fc1","arguments":{"appointmentDate":"17-03-2025 10:00"}}}"#;
        match serde_json::from_str::<AiMessage>(raw).unwrap() {
            AiMessage::FunctionCall { function_call } => {
                assert_eq!(function_call.name, "book_appointment");
                assert_eq!(function_call.arguments["appointmentDate"], "17-03-2025 10:00");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_message_types_do_not_fail() {
        let raw = r#"{"type":"internal_tentative_agent_response","text":"..."}"#;
        assert!(matches!(
            serde_json::from_str::<AiMessage>(raw).unwrap(),
            AiMessage::Unknown
        ));
    }

    #[test]
    fn initiation_serializes_overrides_only_when_set() {
        let mut vars = Map::new();
        vars.insert("firstName".into(), Value::String("Anna".into()));

        let plain = ConversationInitiation::new(vars.clone());
        let rendered = serde_json::to_value(&plain).unwrap();
        assert_eq!(rendered["type"], "conversation_initiation_client_data");
        assert!(rendered.get("conversation_config_override").is_none());

        let with_override = ConversationInitiation::new(vars)
            .with_first_message("Pronto Anna? Era caduta la linea, mi senti?".into());
        let rendered = serde_json::to_value(&with_override).unwrap();
        assert_eq!(
            rendered["conversation_config_override"]["agent"]["first_message"],
            "Pronto Anna? Era caduta la linea, mi senti?"
        );
    }
}
