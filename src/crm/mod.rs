//! GoHighLevel CRM client.
//!
//! The pipeline's system of record for contacts, calendars and workflows.
//! Tokens are per-location OAuth bearers persisted in `crm_tokens` and
//! refreshed on demand; callers only ever ask for "a valid bearer".

use crate::config::CrmConfig;
use crate::shared::db::open_conn;
use crate::shared::models::CrmToken;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};

pub mod routes;

const API_VERSION: &str = "2021-07-28";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);
/// Refresh a little before the platform would reject the bearer.
const EXPIRY_MARGIN_SECONDS: i64 = 120;

#[derive(Debug, Clone)]
pub enum CrmError {
    /// No stored token for the location; the OAuth dance has not run.
    NoToken(String),
    NetworkError(String),
    ApiError(u16, String),
    ParseError(String),
}

impl std::fmt::Display for CrmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoToken(loc) => write!(f, "no CRM token stored for location {}", loc),
            Self::NetworkError(e) => write!(f, "CRM network error: {}", e),
            Self::ApiError(status, body) => write!(f, "CRM API error {}: {}", status, body),
            Self::ParseError(e) => write!(f, "CRM parse error: {}", e),
        }
    }
}

impl std::error::Error for CrmError {}

pub struct CrmClient {
    http_client: Client,
    config: CrmConfig,
    database_path: String,
    base_url: String,
}

impl CrmClient {
    pub fn new(config: CrmConfig, database_path: String) -> Self {
        Self {
            http_client: Client::new(),
            config,
            database_path,
            base_url: "https://services.leadconnectorhq.com".to_string(),
        }
    }

    /// Authorize URL for the OAuth dance start.
    pub fn authorize_url(&self) -> String {
        let scopes = "calendars.readonly calendars/events.write contacts.readonly \
                      contacts.write workflows.readonly";
        format!(
            "https://marketplace.gohighlevel.com/oauth/chooselocation?response_type=code&client_id={}&redirect_uri={}&scope={}",
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(scopes)
        )
    }

    /// Exchange an authorization code and persist the resulting tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<String, CrmError> {
        let body = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
                ("redirect_uri", &self.config.redirect_uri),
            ])
            .await?;

        let location_id = body["locationId"]
            .as_str()
            .unwrap_or(&self.config.location_id)
            .to_string();
        self.store_tokens(&location_id, &body)?;
        info!("CRM tokens stored for location {}", location_id);
        Ok(location_id)
    }

    /// A bearer guaranteed to be accepted by the CRM, refreshing first when
    /// the stored one is at or past its expiry margin.
    pub async fn valid_bearer(&self) -> Result<String, CrmError> {
        let location_id = self.config.location_id.clone();
        let token = self
            .load_token(&location_id)?
            .ok_or_else(|| CrmError::NoToken(location_id.clone()))?;

        if token.expires_at > Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECONDS) {
            return Ok(token.access_token);
        }

        warn!("CRM token for {} expired, refreshing", location_id);
        let body = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &token.refresh_token),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ])
            .await?;

        self.store_tokens(&location_id, &body)?;
        body["access_token"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CrmError::ParseError("token response missing access_token".into()))
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<Value, CrmError> {
        let response = self
            .http_client
            .post(format!("{}/oauth/token", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .form(form)
            .send()
            .await
            .map_err(|e| CrmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::ApiError(status.as_u16(), body));
        }

        response
            .json()
            .await
            .map_err(|e| CrmError::ParseError(e.to_string()))
    }

    fn load_token(&self, location: &str) -> Result<Option<CrmToken>, CrmError> {
        use crate::shared::schema::crm_tokens::dsl::*;
        let mut conn =
            open_conn(&self.database_path).map_err(|e| CrmError::NetworkError(e.to_string()))?;
        crm_tokens
            .filter(location_id.eq(location))
            .first::<CrmToken>(&mut conn)
            .optional()
            .map_err(|e| CrmError::ParseError(e.to_string()))
    }

    fn store_tokens(&self, location: &str, body: &Value) -> Result<(), CrmError> {
        use crate::shared::schema::crm_tokens::dsl::*;

        let access = body["access_token"]
            .as_str()
            .ok_or_else(|| CrmError::ParseError("token response missing access_token".into()))?;
        let refresh = body["refresh_token"].as_str().unwrap_or_default();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

        let token = CrmToken {
            location_id: location.to_string(),
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
            updated_at: Utc::now(),
        };

        let mut conn =
            open_conn(&self.database_path).map_err(|e| CrmError::NetworkError(e.to_string()))?;
        diesel::replace_into(crm_tokens)
            .values(&token)
            .execute(&mut conn)
            .map_err(|e| CrmError::ParseError(e.to_string()))?;
        Ok(())
    }

    /// Free calendar slots in [start, end] filtered to the given rep user
    /// ids. Returns the raw response body: the upstream shape varies and is
    /// normalized by the slot service.
    pub async fn free_slots(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        user_ids: &[String],
    ) -> Result<Value, CrmError> {
        let bearer = self.valid_bearer().await?;

        let mut url = format!(
            "{}/calendars/{}/free-slots?startDate={}&endDate={}",
            self.base_url,
            self.config.calendar_id,
            start.timestamp_millis(),
            end.timestamp_millis()
        );
        if !user_ids.is_empty() {
            url.push_str(&format!("&userIds={}", urlencoding::encode(&user_ids.join(","))));
        }

        self.get_json(&url, &bearer).await
    }

    /// Book an appointment. Non-2xx responses surface as ApiError so the
    /// booking coordinator can run its alternatives fallback.
    pub async fn create_appointment(
        &self,
        contact_id: &str,
        start: DateTime<Utc>,
        user_id: Option<&str>,
        address: &str,
    ) -> Result<Value, CrmError> {
        let bearer = self.valid_bearer().await?;

        let mut body = json!({
            "calendarId": self.config.calendar_id,
            "locationId": self.config.location_id,
            "contactId": contact_id,
            "startTime": start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "meetingLocationType": "address",
            "locationType": "Address",
            "address": address,
            "appointmentStatus": "confirmed",
        });
        if let Some(uid) = user_id {
            body["assignedUserId"] = json!(uid);
        }

        let response = self
            .http_client
            .post(format!("{}/calendars/events/appointments", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&bearer)
            .header("Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| CrmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::ApiError(status.as_u16(), body));
        }

        response
            .json()
            .await
            .map_err(|e| CrmError::ParseError(e.to_string()))
    }

    pub async fn get_contact(&self, contact_id: &str) -> Result<Value, CrmError> {
        let bearer = self.valid_bearer().await?;
        let url = format!("{}/contacts/{}", self.base_url, contact_id);
        self.get_json(&url, &bearer).await
    }

    /// Partial contact update (address, custom fields, ...).
    pub async fn update_contact(&self, contact_id: &str, fields: Value) -> Result<(), CrmError> {
        let bearer = self.valid_bearer().await?;

        let response = self
            .http_client
            .put(format!("{}/contacts/{}", self.base_url, contact_id))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&bearer)
            .header("Version", API_VERSION)
            .json(&fields)
            .send()
            .await
            .map_err(|e| CrmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::ApiError(status.as_u16(), body));
        }
        Ok(())
    }

    pub async fn add_contact_note(&self, contact_id: &str, note: &str) -> Result<(), CrmError> {
        let bearer = self.valid_bearer().await?;

        let response = self
            .http_client
            .post(format!("{}/contacts/{}/notes", self.base_url, contact_id))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&bearer)
            .header("Version", API_VERSION)
            .json(&json!({"body": note}))
            .send()
            .await
            .map_err(|e| CrmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::ApiError(status.as_u16(), body));
        }
        Ok(())
    }

    pub async fn add_to_workflow(&self, contact_id: &str, workflow_id: &str) -> Result<(), CrmError> {
        let bearer = self.valid_bearer().await?;

        let response = self
            .http_client
            .post(format!(
                "{}/contacts/{}/workflow/{}",
                self.base_url, contact_id, workflow_id
            ))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&bearer)
            .header("Version", API_VERSION)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| CrmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::ApiError(status.as_u16(), body));
        }
        Ok(())
    }

    async fn get_json(&self, url: &str, bearer: &str) -> Result<Value, CrmError> {
        let response = self
            .http_client
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(bearer)
            .header("Version", API_VERSION)
            .send()
            .await
            .map_err(|e| CrmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::ApiError(status.as_u16(), body));
        }

        response
            .json()
            .await
            .map_err(|e| CrmError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CrmConfig {
        CrmConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://example.com/hl/callback".into(),
            location_id: "LOC1".into(),
            calendar_id: "CAL1".into(),
        }
    }

    #[test]
    fn authorize_url_carries_client_and_redirect() {
        let client = CrmClient::new(test_config(), ":memory:".into());
        let url = client.authorize_url();
        assert!(url.contains("client_id=cid"));
        assert!(url.contains(&urlencoding::encode("https://example.com/hl/callback").to_string()));
    }

    #[tokio::test]
    async fn missing_token_is_reported_as_no_token() {
        // Fresh in-memory database: migrations run, no token rows.
        let path = format!("file:crmtest{}?mode=memory&cache=shared", std::process::id());
        let mut conn = open_conn(&path).unwrap();
        crate::shared::db::run_migrations(&mut conn).unwrap();

        let client = CrmClient::new(test_config(), path);
        match client.valid_bearer().await {
            Err(CrmError::NoToken(loc)) => assert_eq!(loc, "LOC1"),
            other => panic!("expected NoToken, got {:?}", other.map(|_| "ok")),
        }
        drop(conn);
    }
}
