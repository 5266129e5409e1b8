use std::{sync::OnceLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    config::{resolve_secret, GeminiConfig, LanguageModelConfig},
    error::{ConfigurationError, LlmError},
    model::truncate_chars,
};

/// Single-turn request to a language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// System instruction.
    pub system: String,
    /// User message.
    pub user: String,
    /// Ask the model for a JSON response body.
    pub json: bool,
}

impl Prompt {
    /// Plain-text prompt.
    #[must_use]
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json: false,
        }
    }

    /// Requests JSON output.
    #[must_use]
    pub fn expect_json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Text completion seam used by query generation and adjudication.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model name for logs.
    fn name(&self) -> &str;

    /// Completes `prompt`, returning the raw text of the first candidate.
    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError>;
}

/// Google Gemini `generateContent` client.
pub struct GeminiModel {
    client: Client,
    config: GeminiConfig,
    api_key: String,
}

impl std::fmt::Debug for GeminiModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiModel")
            .field("model", &self.config.model)
            .field("endpoint", &self.config.endpoint)
            .finish_non_exhaustive()
    }
}

impl GeminiModel {
    /// Creates a client with an explicit key.
    pub fn new(config: GeminiConfig, api_key: impl Into<String>) -> Result<Self, ConfigurationError> {
        let client = Client::builder()
            .user_agent("veracity-verification/0.1")
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| ConfigurationError::Client {
                component: "gemini".into(),
                detail: err.to_string(),
            })?;
        Ok(Self {
            client,
            config,
            api_key: api_key.into(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }

    fn body(&self, prompt: &Prompt) -> Value {
        let mut generation = json!({ "temperature": self.config.temperature });
        if prompt.json {
            generation["responseMimeType"] = json!("application/json");
        }
        json!({
            "systemInstruction": { "parts": [{ "text": prompt.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt.user }] }],
            "generationConfig": generation,
        })
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let response = self
            .client
            .post(self.url())
            .query(&[("key", self.api_key.as_str())])
            .json(&self.body(prompt))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout(self.config.timeout_ms)
                } else {
                    LlmError::Transport(err.without_url().to_string())
                }
            })?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: truncate_chars(&body, 300),
            });
        }
        let payload: GeminiResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Transport(err.without_url().to_string()))?;
        payload.text().ok_or(LlmError::EmptyResponse)
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiResponse {
    fn text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text = content
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect::<String>();
        (!text.trim().is_empty()).then_some(text)
    }
}

/// Builds the configured model, or `None` when no model is configured.
pub fn build_language_model(
    config: &LanguageModelConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<GeminiModel>, ConfigurationError> {
    match config {
        LanguageModelConfig::Gemini(gemini) => {
            let key = resolve_secret(lookup, "gemini", &gemini.api_key_env)?;
            GeminiModel::new(gemini.clone(), key).map(Some)
        }
        LanguageModelConfig::None => Ok(None),
    }
}

fn fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").unwrap_or_else(|_| unreachable!())
    })
}

/// Parses the first JSON object in `raw`, tolerating code fences and prose around it.
#[must_use]
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let candidate = fence_pattern()
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map_or(trimmed, |m| m.as_str());
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }
    let start = candidate.find('{')?;
    let end = candidate.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&candidate[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let raw = "Here you go:\n```json\n{\"result\": \"SUPPORTED\", \"confidence\": 90}\n```";
        let value = extract_json_object(raw).unwrap();
        assert_eq!(value["result"], "SUPPORTED");
    }

    #[test]
    fn extracts_embedded_object() {
        let value = extract_json_object("verdict follows {\"result\": \"REFUTED\"} end").unwrap();
        assert_eq!(value["result"], "REFUTED");
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("[1, 2]").is_none());
    }

    #[test]
    fn gemini_body_requests_json_when_asked() {
        let config: GeminiConfig = toml::from_str("").unwrap();
        let model = GeminiModel::new(config, "key").unwrap();
        let body = model.body(&Prompt::new("sys", "user").expect_json());
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "user");
        assert!(model.url().ends_with("/models/gemini-2.0-flash:generateContent"));
    }

    #[test]
    fn gemini_response_joins_parts() {
        let payload: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "text": "a" }, { "text": "b" }] } }]
        }))
        .unwrap();
        assert_eq!(payload.text().as_deref(), Some("ab"));
        let empty: GeminiResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert!(empty.text().is_none());
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let config = LanguageModelConfig::Gemini(toml::from_str("").unwrap());
        let err = build_language_model(&config, &|_| None).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingSecret { .. }));
        assert!(build_language_model(&LanguageModelConfig::None, &|_| None)
            .unwrap()
            .is_none());
    }
}
