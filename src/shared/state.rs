//! Shared application state: the composition root's output.
//!
//! Every provider client is constructed once here and injected through
//! `Arc<AppState>`; handlers never reach for the environment themselves.

use crate::config::AppConfig;
use crate::crm::CrmClient;
use crate::llm::GeminiClient;
use crate::notify::Notifier;
use crate::telephony::TwilioClient;
use crate::timeloc::ProvinceCache;
use crate::voiceai::ElevenLabsClient;
use anyhow::Result;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub crm: Arc<CrmClient>,
    pub twilio: Arc<TwilioClient>,
    pub elevenlabs: Arc<ElevenLabsClient>,
    pub llm: Option<Arc<GeminiClient>>,
    pub notifier: Notifier,
    pub province_cache: Arc<ProvinceCache>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let crm = Arc::new(CrmClient::new(
            config.crm.clone(),
            config.database_path.clone(),
        ));
        let twilio = Arc::new(TwilioClient::new(config.twilio.clone()));
        let elevenlabs = Arc::new(ElevenLabsClient::new(config.elevenlabs.api_key.clone()));
        let llm = config
            .gemini_api_key
            .clone()
            .map(|key| Arc::new(GeminiClient::new(key)));
        let notifier = Notifier::new(config.notifier_webhook_url.clone());
        let province_cache = Arc::new(ProvinceCache::new(
            config.zip_sheet_id.clone(),
            config.sheets_api_key.clone(),
        ));

        Self {
            config,
            crm,
            twilio,
            elevenlabs,
            llm,
            notifier,
            province_cache,
        }
    }

    /// Short-lived connection to the embedded store.
    pub fn db(&self) -> Result<SqliteConnection> {
        super::db::open_conn(&self.config.database_path)
    }

    pub fn llm_ref(&self) -> Option<&GeminiClient> {
        self.llm.as_deref()
    }
}
