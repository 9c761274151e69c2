//! Text-LLM client (Gemini generateContent API).
//!
//! Two callers: the province fallback in address parsing (tiny, temperature
//! pinned low) and the post-call transcript analysis (strict JSON output).

use log::warn;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Clone)]
pub enum LlmError {
    NetworkError(String),
    ApiError(u16, String),
    ParseError(String),
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkError(e) => write!(f, "LLM network error: {}", e),
            Self::ApiError(status, body) => write!(f, "LLM API error {}: {}", status, body),
            Self::ParseError(e) => write!(f, "LLM parse error: {}", e),
        }
    }
}

impl std::error::Error for LlmError {}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Plain text completion.
    pub async fn generate_text(
        &self,
        prompt: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_output_tokens,
            }
        });

        let result = self.post_generate(&body).await?;
        extract_text(&result)
    }

    /// JSON-schema-constrained completion. The model is forced to emit a
    /// document matching `schema`; the parsed value is returned as-is.
    pub async fn generate_json(&self, prompt: &str, schema: &Value) -> Result<Value, LlmError> {
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 1024,
                "responseMimeType": "application/json",
                "responseSchema": schema,
            }
        });

        let result = self.post_generate(&body).await?;
        let text = extract_text(&result)?;
        serde_json::from_str(&text).map_err(|e| {
            warn!("LLM returned non-JSON despite schema: {}", text);
            LlmError::ParseError(e.to_string())
        })
    }

    async fn post_generate(&self, body: &Value) -> Result<Value, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError(status.as_u16(), body));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))
    }
}

fn extract_text(result: &Value) -> Result<String, LlmError> {
    result["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| LlmError::ParseError("no text candidate in response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_candidate_text() {
        let result = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "  RM\n"}]}}]
        });
        assert_eq!(extract_text(&result).unwrap(), "RM");
    }

    #[test]
    fn missing_candidate_is_parse_error() {
        let result = serde_json::json!({"candidates": []});
        assert!(matches!(
            extract_text(&result),
            Err(LlmError::ParseError(_))
        ));
    }
}
