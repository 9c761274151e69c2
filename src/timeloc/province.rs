//! Province resolution from free-form Italian addresses.
//!
//! Three strategies, cheapest first: a direct two-letter code in the text,
//! a postal-code lookup against a spreadsheet-backed mapping, and finally a
//! small LLM completion validated against the known code set.

use crate::llm::GeminiClient;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// The 110 two-letter Italian province codes, historical Sardinian
/// provinces included. Every extraction result is validated against this.
pub static PROVINCE_CODES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "AG", "AL", "AN", "AO", "AP", "AQ", "AR", "AT", "AV", "BA",
        "BG", "BI", "BL", "BN", "BO", "BR", "BS", "BT", "BZ", "CA",
        "CB", "CE", "CH", "CI", "CL", "CN", "CO", "CR", "CS", "CT",
        "CZ", "EN", "FC", "FE", "FG", "FI", "FM", "FR", "GE", "GO",
        "GR", "IM", "IS", "KR", "LC", "LE", "LI", "LO", "LT", "LU",
        "MB", "MC", "ME", "MI", "MN", "MO", "MS", "MT", "NA", "NO",
        "NU", "OG", "OR", "OT", "PA", "PC", "PD", "PE", "PG", "PI",
        "PN", "PO", "PR", "PT", "PU", "PV", "PZ", "RA", "RC", "RE",
        "RG", "RI", "RM", "RN", "RO", "SA", "SI", "SO", "SP", "SR",
        "SS", "SV", "TA", "TE", "TN", "TO", "TP", "TR", "TS", "TV",
        "UD", "VA", "VB", "VC", "VE", "VI", "VR", "VS", "VT", "VV",
    ]
    .into_iter()
    .collect()
});

static DIRECT_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-Z]{2})\b").unwrap());
static ZIP_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{5})\b").unwrap());

/// Addresses the lead platform fills in when no real address exists yet.
static PLACEHOLDERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)follow-?up call",
        r"(?i)address tbd",
        r"(?i)to be determined",
        r"(?i)da definire",
        r"(?i)indirizzo mancante",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SHEET_TIMEOUT: Duration = Duration::from_secs(15);

/// Process-wide ZIP→province mapping with a 24h TTL. Concurrent refreshers
/// may fetch twice; last write wins and both results are equivalent.
pub struct ProvinceCache {
    client: Client,
    sheet_id: Option<String>,
    api_key: Option<String>,
    cached: RwLock<Option<CachedMap>>,
}

struct CachedMap {
    fetched_at: Instant,
    map: Arc<HashMap<String, String>>,
}

impl ProvinceCache {
    pub fn new(sheet_id: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            sheet_id,
            api_key,
            cached: RwLock::new(None),
        }
    }

    /// ZIP→province lookup. Returns None when the mapping is unavailable or
    /// the ZIP is unknown.
    pub async fn lookup_zip(&self, zip: &str) -> Option<String> {
        let map = self.mapping().await?;
        map.get(zip).cloned()
    }

    async fn mapping(&self) -> Option<Arc<HashMap<String, String>>> {
        {
            let guard = self.cached.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < CACHE_TTL {
                    return Some(cached.map.clone());
                }
            }
        }

        match self.fetch_sheet().await {
            Ok(map) => {
                let map = Arc::new(map);
                let mut guard = self.cached.write().await;
                *guard = Some(CachedMap {
                    fetched_at: Instant::now(),
                    map: map.clone(),
                });
                Some(map)
            }
            Err(e) => {
                warn!("ZIP mapping refresh failed: {}", e);
                // Serve the stale copy if we have one.
                let guard = self.cached.read().await;
                guard.as_ref().map(|c| c.map.clone())
            }
        }
    }

    async fn fetch_sheet(&self) -> Result<HashMap<String, String>, String> {
        let (sheet_id, api_key) = match (&self.sheet_id, &self.api_key) {
            (Some(s), Some(k)) => (s, k),
            _ => return Err("ZIP sheet not configured".to_string()),
        };

        let url = format!(
            "https://sheets.googleapis.com/v4/spreadsheets/{}/values/A:B?key={}",
            sheet_id, api_key
        );

        let response = self
            .client
            .get(&url)
            .timeout(SHEET_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("sheet fetch returned {}", response.status()));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        let mut map = HashMap::new();
        if let Some(rows) = body["values"].as_array() {
            for row in rows {
                let zip = row.get(0).and_then(|v| v.as_str()).unwrap_or("").trim();
                let prov = row
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_uppercase();
                if zip.len() == 5 && PROVINCE_CODES.contains(prov.as_str()) {
                    map.insert(zip.to_string(), prov);
                }
            }
        }
        info!("ZIP mapping refreshed: {} entries", map.len());
        Ok(map)
    }
}

fn is_placeholder(address: &str) -> bool {
    PLACEHOLDERS.iter().any(|re| re.is_match(address))
}

/// Direct two-letter code with a word boundary, e.g. "Via Roma 1 (RM)".
fn direct_code(address: &str) -> Option<String> {
    DIRECT_CODE
        .captures_iter(address)
        .map(|c| c[1].to_string())
        .find(|code| PROVINCE_CODES.contains(code.as_str()))
}

/// Resolve the province for a prospect address. Returns a validated
/// two-letter code or None when nothing credible was found.
pub async fn extract_province(
    address: &str,
    cache: &ProvinceCache,
    llm: Option<&GeminiClient>,
) -> Option<String> {
    let address = address.trim();
    if address.is_empty() || is_placeholder(address) {
        debug!("address is empty or placeholder, province unknown");
        return None;
    }

    if let Some(code) = direct_code(address) {
        return Some(code);
    }

    for zip in ZIP_CODE.captures_iter(address).map(|c| c[1].to_string()) {
        if let Some(prov) = cache.lookup_zip(&zip).await {
            return Some(prov);
        }
    }

    let llm = llm?;
    let prompt = format!(
        "Rispondi solo con la sigla di due lettere della provincia italiana \
         per questo indirizzo, senza altro testo: {}",
        address
    );
    match llm.generate_text(&prompt, 0.1, 10).await {
        Ok(answer) => {
            let code = answer.trim().to_uppercase();
            if PROVINCE_CODES.contains(code.as_str()) {
                info!("province {} resolved via LLM for address {:?}", code, address);
                Some(code)
            } else {
                warn!("LLM returned invalid province {:?}", answer);
                None
            }
        }
        Err(e) => {
            warn!("LLM province fallback failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_set_has_exactly_110_members() {
        assert_eq!(PROVINCE_CODES.len(), 110);
    }

    #[test]
    fn direct_code_respects_word_boundaries() {
        assert_eq!(direct_code("Via Roma 1, 00100 Roma (RM)"), Some("RM".into()));
        assert_eq!(direct_code("Corso Milano, MI"), Some("MI".into()));
        // Lowercase words never match, even when they spell a code.
        assert_eq!(direct_code("strada al mare"), None);
        // Embedded pairs are not codes.
        assert_eq!(direct_code("CAMPO"), None);
    }

    #[test]
    fn placeholders_short_circuit() {
        assert!(is_placeholder("Follow-up Call"));
        assert!(is_placeholder("address TBD"));
        assert!(is_placeholder("Da definire con il cliente"));
        assert!(!is_placeholder("Via Garibaldi 4, Latina"));
    }

    #[tokio::test]
    async fn unconfigured_cache_yields_none() {
        let cache = ProvinceCache::new(None, None);
        assert_eq!(cache.lookup_zip("00100").await, None);
    }

    #[tokio::test]
    async fn extraction_prefers_direct_code_over_zip() {
        let cache = ProvinceCache::new(None, None);
        let got = extract_province("Via Appia 10, 04100 Latina (LT)", &cache, None).await;
        assert_eq!(got, Some("LT".to_string()));
    }

    #[tokio::test]
    async fn placeholder_never_reaches_lookups() {
        let cache = ProvinceCache::new(None, None);
        assert_eq!(extract_province("follow-up call", &cache, None).await, None);
    }
}
