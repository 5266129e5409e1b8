use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{http_client, send_json, ProviderPayload, SearchProvider};
use crate::{
    config::GoogleSearchConfig,
    error::{ConfigurationError, ProviderError},
    model::Evidence,
};

/// Custom Search returns at most ten items per page.
const MAX_PAGE: usize = 10;

/// Google Programmable Search client.
pub struct GoogleSearchProvider {
    client: Client,
    config: GoogleSearchConfig,
    api_key: String,
    cse_id: String,
}

impl GoogleSearchProvider {
    /// Creates the client.
    pub fn new(
        config: GoogleSearchConfig,
        api_key: impl Into<String>,
        cse_id: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            client: http_client("google")?,
            config,
            api_key: api_key.into(),
            cse_id: cse_id.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for GoogleSearchProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<ProviderPayload, ProviderError> {
        let num = limit.clamp(1, MAX_PAGE).to_string();
        let request = self.client.get(&self.config.endpoint).query(&[
            ("key", self.api_key.as_str()),
            ("cx", self.cse_id.as_str()),
            ("q", query),
            ("num", num.as_str()),
        ]);
        let body: GoogleResponse = send_json(self.name(), request).await?;
        Ok(ProviderPayload::Google(body))
    }
}

/// Custom Search JSON API response. `items` is absent when nothing matched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleResponse {
    /// Result items.
    #[serde(default)]
    pub items: Vec<GoogleItem>,
}

/// One Custom Search result.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleItem {
    /// Result URL.
    #[serde(default)]
    pub link: String,
    /// Page title.
    #[serde(default)]
    pub title: Option<String>,
    /// Search snippet.
    #[serde(default)]
    pub snippet: Option<String>,
}

impl GoogleResponse {
    pub(crate) fn into_evidence(self) -> Vec<Evidence> {
        self.items
            .into_iter()
            .map(|item| {
                Evidence::new(
                    item.link,
                    item.title.unwrap_or_default(),
                    item.snippet.unwrap_or_default(),
                )
            })
            .collect()
    }
}
