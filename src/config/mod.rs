//! Process configuration.
//!
//! Everything the orchestrator needs is read once at startup from the
//! environment. Required variables abort the process with a clear message;
//! optional ones fall back to the documented defaults.

use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three services the pipeline sells appointments for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    Infissi,
    Vetrate,
    Pergole,
}

impl Service {
    pub fn parse(s: &str) -> Option<Service> {
        match s.trim().to_lowercase().as_str() {
            "infissi" => Some(Service::Infissi),
            "vetrate" => Some(Service::Vetrate),
            "pergole" => Some(Service::Pergole),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Infissi => "Infissi",
            Service::Vetrate => "Vetrate",
            Service::Pergole => "Pergole",
        }
    }

    /// Brand the voice agent introduces itself with.
    pub fn business_name(&self) -> &'static str {
        match self {
            Service::Infissi => "Ristrutturiamolo",
            Service::Vetrate | Service::Pergole => "UNICOVETRATE",
        }
    }

}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number_infissi: String,
    pub phone_number_vetrate: String,
}

impl TwilioConfig {
    /// Caller-id used when dialing out for a given service.
    pub fn from_number(&self, service: Service) -> &str {
        match service {
            Service::Infissi => &self.phone_number_infissi,
            Service::Vetrate | Service::Pergole => &self.phone_number_vetrate,
        }
    }
}

#[derive(Clone)]
pub struct CrmConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub location_id: String,
    pub calendar_id: String,
}

#[derive(Clone)]
pub struct ElevenLabsConfig {
    pub api_key: String,
    pub agent_id_outbound: String,
    pub agent_id_inbound: String,
    /// Absent secret skips post-call signature validation (warned at boot).
    pub webhook_secret: Option<String>,
}

#[derive(Clone)]
pub struct AppConfig {
    pub twilio: TwilioConfig,
    pub crm: CrmConfig,
    pub elevenlabs: ElevenLabsConfig,
    pub notifier_webhook_url: String,
    pub public_base_url: String,
    pub outbound_prefix: String,
    pub inbound_prefix: String,
    pub database_path: String,
    pub max_active_calls: i64,
    pub queue_tick_seconds: u64,
    pub post_call_analysis: PostCallAnalysisMode,
    pub gemini_api_key: Option<String>,
    pub zip_sheet_id: Option<String>,
    pub sheets_api_key: Option<String>,
    pub default_appointment_address: String,
    pub rep_user_id_infissi: Option<String>,
    pub rep_user_id_vetrate: Option<String>,
    pub rep_user_id_pergole: Option<String>,
    pub workflow_no_rep: Option<String>,
    pub workflow_call_scheduled: Option<String>,
    pub server_port: u16,
}

/// Whether the transcript analysis pass runs after each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCallAnalysisMode {
    Enabled,
    Disabled,
    /// Canned output for local testing. Must be asked for explicitly.
    Mock,
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {}", key))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> Result<AppConfig> {
        let twilio = TwilioConfig {
            account_sid: required("TWILIO_ACCOUNT_SID")?,
            auth_token: required("TWILIO_AUTH_TOKEN")?,
            phone_number_infissi: required("TWILIO_PHONE_NUMBER_INFISSI")?,
            phone_number_vetrate: required("TWILIO_PHONE_NUMBER_VETRATE")?,
        };

        let crm = CrmConfig {
            client_id: required("GHL_CLIENT_ID")?,
            client_secret: required("GHL_CLIENT_SECRET")?,
            redirect_uri: required("GHL_REDIRECT_URI")?,
            location_id: required("GHL_LOCATION_ID")?,
            calendar_id: required("GHL_CALENDAR_ID")?,
        };

        let webhook_secret = optional("ELEVENLABS_WEBHOOK_SECRET");
        if webhook_secret.is_none() {
            warn!("ELEVENLABS_WEBHOOK_SECRET not set: post-call webhook signatures will NOT be validated");
        }

        let elevenlabs = ElevenLabsConfig {
            api_key: required("ELEVENLABS_API_KEY")?,
            agent_id_outbound: required("ELEVENLABS_AGENT_ID_OUTBOUND")?,
            agent_id_inbound: required("ELEVENLABS_AGENT_ID_INBOUND")?,
            webhook_secret,
        };

        let post_call_analysis = match optional("ENABLE_POST_CALL_ANALYSIS").as_deref() {
            None | Some("false") | Some("0") => PostCallAnalysisMode::Disabled,
            Some("mock") => PostCallAnalysisMode::Mock,
            Some("true") | Some("1") => PostCallAnalysisMode::Enabled,
            Some(other) => bail!(
                "ENABLE_POST_CALL_ANALYSIS must be true, false or mock (got {:?})",
                other
            ),
        };

        let gemini_api_key = optional("GEMINI_API_KEY");
        if post_call_analysis == PostCallAnalysisMode::Enabled && gemini_api_key.is_none() {
            bail!("ENABLE_POST_CALL_ANALYSIS=true requires GEMINI_API_KEY (use mode 'mock' for canned output)");
        }

        let max_active_calls = optional("MAX_ACTIVE_CALLS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        // The worker never ticks faster than every 5 seconds.
        let queue_tick_seconds = optional("QUEUE_TICK_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10)
            .max(5);

        Ok(AppConfig {
            twilio,
            crm,
            elevenlabs,
            notifier_webhook_url: required("NOTIFIER_WEBHOOK_URL")?,
            public_base_url: required("PUBLIC_BASE_URL")?,
            outbound_prefix: required("OUTBOUND_ROUTE_PREFIX")?.trim_matches('/').to_string(),
            inbound_prefix: required("INBOUND_ROUTE_PREFIX")?.trim_matches('/').to_string(),
            database_path: optional("DATABASE_PATH").unwrap_or_else(|| "./callserver.db".to_string()),
            max_active_calls,
            queue_tick_seconds,
            post_call_analysis,
            gemini_api_key,
            zip_sheet_id: optional("ZIP_PROVINCE_SHEET_ID"),
            sheets_api_key: optional("SHEETS_API_KEY"),
            default_appointment_address: optional("DEFAULT_APPOINTMENT_ADDRESS")
                .unwrap_or_else(|| "Da definire con il cliente".to_string()),
            rep_user_id_infissi: optional("REP_USER_ID_INFISSI"),
            rep_user_id_vetrate: optional("REP_USER_ID_VETRATE"),
            rep_user_id_pergole: optional("REP_USER_ID_PERGOLE"),
            workflow_no_rep: optional("WORKFLOW_ID_NO_SALES_REP"),
            workflow_call_scheduled: optional("WORKFLOW_ID_CALL_SCHEDULED"),
            server_port: optional("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080),
        })
    }

    /// Public callback URL under the outbound route prefix.
    pub fn outbound_url(&self, tail: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, self.outbound_prefix, tail)
    }

    /// ws(s):// form of the public base URL for media-stream TwiML.
    pub fn websocket_base(&self) -> String {
        self.public_base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_parsing_is_case_insensitive() {
        assert_eq!(Service::parse("infissi"), Some(Service::Infissi));
        assert_eq!(Service::parse("VETRATE"), Some(Service::Vetrate));
        assert_eq!(Service::parse(" Pergole "), Some(Service::Pergole));
        assert_eq!(Service::parse("tende"), None);
    }

    #[test]
    fn business_name_follows_service() {
        assert_eq!(Service::Infissi.business_name(), "Ristrutturiamolo");
        assert_eq!(Service::Vetrate.business_name(), "UNICOVETRATE");
        assert_eq!(Service::Pergole.business_name(), "UNICOVETRATE");
    }
}
