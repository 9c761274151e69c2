//! Twilio voice-call client.
//!
//! Covers the slice of the Calls API the pipeline needs: creating outbound
//! calls with machine detection, counting live calls for admission control,
//! and hanging up a call the moment a machine answers. Also renders the
//! TwiML that bridges a call to our media WebSocket.

use crate::config::TwilioConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// AnsweredBy values that mean a machine picked up.
pub const MACHINE_TOKENS: [&str; 6] = [
    "machine_start",
    "fax",
    "machine_beep",
    "machine_end_silence",
    "machine_end_other",
    "machine_end_beep",
];

pub fn is_machine(answered_by: &str) -> bool {
    MACHINE_TOKENS.contains(&answered_by)
}

/// Parameters for one outbound call, composed at enqueue time and stored
/// as the queue row's opaque options blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOptions {
    pub to: String,
    pub from: String,
    /// Full TwiML URL including the per-call custom parameters.
    pub twiml_url: String,
    pub status_callback: String,
}

/// Status callback form fields Twilio posts back to us.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusCallbackParams {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
    #[serde(rename = "AnsweredBy")]
    pub answered_by: Option<String>,
    #[serde(rename = "To")]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallResponse {
    pub sid: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioApiError {
    pub code: i32,
    pub message: String,
    pub status: i32,
}

#[derive(Debug, Clone)]
pub enum TwilioError {
    NetworkError(String),
    ApiError(TwilioApiError),
    ParseError(String),
}

impl std::fmt::Display for TwilioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkError(e) => write!(f, "Network error: {}", e),
            Self::ApiError(e) => write!(f, "Twilio API error {}: {}", e.code, e.message),
            Self::ParseError(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for TwilioError {}

pub struct TwilioClient {
    config: TwilioConfig,
    http_client: Client,
    base_url: String,
}

impl TwilioClient {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            http_client: Client::new(),
            base_url: "https://api.twilio.com/2010-04-01".to_string(),
        }
    }

    /// Place an outbound call with answering-machine detection enabled.
    /// Returns once Twilio has assigned a call sid.
    pub async fn create_call(&self, options: &CallOptions) -> Result<CallResponse, TwilioError> {
        let url = format!(
            "{}/Accounts/{}/Calls.json",
            self.base_url, self.config.account_sid
        );

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("To", options.to.clone());
        params.insert("From", options.from.clone());
        params.insert("Url", options.twiml_url.clone());
        params.insert("StatusCallback", options.status_callback.clone());
        params.insert(
            "StatusCallbackEvent",
            "initiated ringing answered completed".to_string(),
        );
        params.insert("MachineDetection", "Enable".to_string());

        let response = self
            .http_client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .timeout(REQUEST_TIMEOUT)
            .form(&params)
            .send()
            .await
            .map_err(|e| TwilioError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let error: TwilioApiError = response.json().await.unwrap_or_else(|_| TwilioApiError {
                code: 0,
                message: "Unknown error".to_string(),
                status: 500,
            });
            return Err(TwilioError::ApiError(error));
        }

        response
            .json()
            .await
            .map_err(|e| TwilioError::ParseError(e.to_string()))
    }

    /// Number of calls currently occupying a line: queued, ringing or
    /// in progress. Drives the worker's admission control.
    pub async fn active_call_count(&self) -> Result<i64, TwilioError> {
        let mut total = 0i64;
        for status in ["queued", "ringing", "in-progress"] {
            total += self.count_calls_with_status(status).await?;
        }
        Ok(total)
    }

    async fn count_calls_with_status(&self, status: &str) -> Result<i64, TwilioError> {
        let url = format!(
            "{}/Accounts/{}/Calls.json?Status={}&PageSize=100",
            self.base_url, self.config.account_sid, status
        );

        let response = self
            .http_client
            .get(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| TwilioError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let error: TwilioApiError = response.json().await.unwrap_or_else(|_| TwilioApiError {
                code: 0,
                message: "Failed to list calls".to_string(),
                status: 500,
            });
            return Err(TwilioError::ApiError(error));
        }

        let body: CallListResponse = response
            .json()
            .await
            .map_err(|e| TwilioError::ParseError(e.to_string()))?;

        Ok(body.calls.len() as i64)
    }

    /// Terminate a live call (used when machine detection fires mid-call).
    pub async fn hangup_call(&self, call_sid: &str) -> Result<(), TwilioError> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.base_url, self.config.account_sid, call_sid
        );

        let response = self
            .http_client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .timeout(REQUEST_TIMEOUT)
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|e| TwilioError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let error: TwilioApiError = response.json().await.unwrap_or_else(|_| TwilioApiError {
                code: 0,
                message: "Failed to update call".to_string(),
                status: 500,
            });
            return Err(TwilioError::ApiError(error));
        }

        Ok(())
    }
}

/// TwiML that bridges a call to a media-stream WebSocket, forwarding the
/// given custom parameters into the stream's `start` frame.
pub fn bridge_twiml(stream_url: &str, parameters: &[(&str, &str)]) -> String {
    let mut twiml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>\n  <Connect>\n");
    twiml.push_str(&format!("    <Stream url=\"{}\">\n", escape_xml(stream_url)));
    for (name, value) in parameters {
        twiml.push_str(&format!(
            "      <Parameter name=\"{}\" value=\"{}\" />\n",
            escape_xml(name),
            escape_xml(value)
        ));
    }
    twiml.push_str("    </Stream>\n  </Connect>\n</Response>");
    twiml
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[derive(Debug, Deserialize)]
struct CallListResponse {
    calls: Vec<CallSummary>,
}

#[derive(Debug, Deserialize)]
struct CallSummary {
    #[allow(dead_code)]
    sid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_tokens_cover_amd_outcomes() {
        for token in MACHINE_TOKENS {
            assert!(is_machine(token));
        }
        assert!(!is_machine("human"));
        assert!(!is_machine("unknown"));
    }

    #[test]
    fn bridge_twiml_carries_parameters() {
        let xml = bridge_twiml(
            "wss://example.com/outgoing/outbound-media-stream",
            &[("firstName", "Anna"), ("service", "Infissi")],
        );
        assert!(xml.contains("<Connect>"));
        assert!(xml.contains("wss://example.com/outgoing/outbound-media-stream"));
        assert!(xml.contains("<Parameter name=\"firstName\" value=\"Anna\" />"));
        assert!(xml.contains("<Parameter name=\"service\" value=\"Infissi\" />"));
    }

    #[test]
    fn twiml_escapes_reserved_characters() {
        let xml = bridge_twiml("wss://x/y?a=1&b=2", &[("fullName", "Lo \"Zio\" <A&B>")]);
        assert!(xml.contains("a=1&amp;b=2"));
        assert!(xml.contains("Lo &quot;Zio&quot; &lt;A&amp;B&gt;"));
    }

    #[test]
    fn call_options_round_trip_as_json() {
        let options = CallOptions {
            to: "+390612345678".into(),
            from: "+390698765432".into(),
            twiml_url: "https://example.com/outgoing/outbound-call-twiml?contactId=C1".into(),
            status_callback: "https://example.com/outgoing/call-status".into(),
        };
        let blob = serde_json::to_string(&options).unwrap();
        let back: CallOptions = serde_json::from_str(&blob).unwrap();
        assert_eq!(back.to, options.to);
        assert_eq!(back.twiml_url, options.twiml_url);
    }
}
