use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{http_client, send_json, ProviderPayload, SearchProvider};
use crate::{
    config::ExaSearchConfig,
    error::{ConfigurationError, ProviderError},
    model::{Evidence, MAX_SNIPPET_CHARS},
};

/// Exa search client.
pub struct ExaSearchProvider {
    client: Client,
    config: ExaSearchConfig,
    api_key: String,
}

impl ExaSearchProvider {
    /// Creates the client.
    pub fn new(config: ExaSearchConfig, api_key: impl Into<String>) -> Result<Self, ConfigurationError> {
        Ok(Self {
            client: http_client("exa")?,
            config,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for ExaSearchProvider {
    fn name(&self) -> &str {
        "exa"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<ProviderPayload, ProviderError> {
        let request = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&json!({
                "query": query,
                "numResults": limit.max(1),
                "type": self.config.search_type,
                "contents": { "text": { "maxCharacters": MAX_SNIPPET_CHARS } },
            }));
        let body: ExaResponse = send_json(self.name(), request).await?;
        Ok(ProviderPayload::Exa(body))
    }
}

/// Exa response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExaResponse {
    /// Ranked results.
    #[serde(default)]
    pub results: Vec<ExaResult>,
}

/// One Exa result.
#[derive(Debug, Clone, Deserialize)]
pub struct ExaResult {
    /// Result URL.
    #[serde(default)]
    pub url: String,
    /// Page title.
    #[serde(default)]
    pub title: Option<String>,
    /// Page text.
    #[serde(default)]
    pub text: Option<String>,
}

impl ExaResponse {
    pub(crate) fn into_evidence(self) -> Vec<Evidence> {
        self.results
            .into_iter()
            .map(|result| {
                Evidence::new(
                    result.url,
                    result.title.unwrap_or_default(),
                    result.text.unwrap_or_default(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_results() {
        let body: ExaResponse = serde_json::from_str(
            r#"{"requestId": "r1", "results": [
                {"url": "https://a.example/x", "title": null, "text": "body text", "score": 0.4}
            ]}"#,
        )
        .unwrap();
        let evidence = body.into_evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].title, "");
        assert_eq!(evidence[0].snippet, "body text");
    }
}
