use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{http_client, send_json, ProviderPayload, SearchProvider};
use crate::{
    config::TavilySearchConfig,
    error::{ConfigurationError, ProviderError},
    model::Evidence,
};

/// Tavily search client.
pub struct TavilySearchProvider {
    client: Client,
    config: TavilySearchConfig,
    api_key: String,
}

impl TavilySearchProvider {
    /// Creates the client.
    pub fn new(config: TavilySearchConfig, api_key: impl Into<String>) -> Result<Self, ConfigurationError> {
        Ok(Self {
            client: http_client("tavily")?,
            config,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for TavilySearchProvider {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<ProviderPayload, ProviderError> {
        let mut body = json!({
            "query": query,
            "max_results": limit.max(1),
            "topic": "general",
        });
        if self.config.include_raw_content {
            body["include_raw_content"] = json!("markdown");
        }
        let request = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        let body: TavilyResponse = send_json(self.name(), request).await?;
        Ok(ProviderPayload::Tavily(body))
    }
}

/// Tavily response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TavilyResponse {
    /// Ranked results.
    #[serde(default)]
    pub results: Vec<TavilyResult>,
}

/// One Tavily result.
#[derive(Debug, Clone, Deserialize)]
pub struct TavilyResult {
    /// Result URL.
    #[serde(default)]
    pub url: String,
    /// Page title.
    #[serde(default)]
    pub title: String,
    /// Extracted summary.
    #[serde(default)]
    pub content: String,
    /// Full page content, when requested.
    #[serde(default)]
    pub raw_content: Option<String>,
}

impl TavilyResponse {
    pub(crate) fn into_evidence(self) -> Vec<Evidence> {
        self.results
            .into_iter()
            .map(|result| {
                let text = result
                    .raw_content
                    .filter(|raw| !raw.trim().is_empty())
                    .unwrap_or(result.content);
                Evidence::new(result.url, result.title, text)
            })
            .collect()
    }
}
