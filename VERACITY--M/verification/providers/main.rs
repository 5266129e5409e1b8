use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

/// Exa search adapter.
pub mod exa;
/// Google Custom Search adapter.
pub mod google;
/// Offline corpus provider.
pub mod loopback;
/// Tavily search adapter.
pub mod tavily;

use crate::{
    config::{resolve_secret, SearchConfig, SearchProviderConfig},
    error::{ConfigurationError, ProviderError},
    model::Evidence,
};
use exa::{ExaResponse, ExaSearchProvider};
use google::{GoogleResponse, GoogleSearchProvider};
use loopback::LoopbackSearchProvider;
use tavily::{TavilyResponse, TavilySearchProvider};

/// Provider-specific response, resolved into evidence once by the retriever.
#[derive(Debug, Clone)]
pub enum ProviderPayload {
    /// Custom Search JSON API body.
    Google(GoogleResponse),
    /// Tavily body.
    Tavily(TavilyResponse),
    /// Exa body.
    Exa(ExaResponse),
    /// Already-shaped evidence.
    Evidence(Vec<Evidence>),
}

impl ProviderPayload {
    /// Converts the payload into evidence items in provider order.
    #[must_use]
    pub fn into_evidence(self) -> Vec<Evidence> {
        match self {
            Self::Google(body) => body.into_evidence(),
            Self::Tavily(body) => body.into_evidence(),
            Self::Exa(body) => body.into_evidence(),
            Self::Evidence(items) => items,
        }
    }
}

/// Search backend queried by the retriever.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Provider name used for tagging and logs.
    fn name(&self) -> &str;

    /// Runs `query`, asking for at most `limit` results.
    async fn search(&self, query: &str, limit: usize) -> Result<ProviderPayload, ProviderError>;
}

/// Builds the configured provider, resolving its secrets through `lookup`.
pub fn build_provider(
    config: &SearchConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Arc<dyn SearchProvider>, ConfigurationError> {
    let provider: Arc<dyn SearchProvider> = match &config.provider {
        SearchProviderConfig::Google(google) => {
            let api_key = resolve_secret(lookup, "google", &google.api_key_env)?;
            let cse_id = resolve_secret(lookup, "google", &google.cse_id_env)?;
            Arc::new(GoogleSearchProvider::new(google.clone(), api_key, cse_id)?)
        }
        SearchProviderConfig::Tavily(tavily) => {
            let api_key = resolve_secret(lookup, "tavily", &tavily.api_key_env)?;
            Arc::new(TavilySearchProvider::new(tavily.clone(), api_key)?)
        }
        SearchProviderConfig::Exa(exa) => {
            let api_key = resolve_secret(lookup, "exa", &exa.api_key_env)?;
            Arc::new(ExaSearchProvider::new(exa.clone(), api_key)?)
        }
        SearchProviderConfig::Loopback(loopback) => {
            let provider = match &loopback.corpus_path {
                Some(path) => LoopbackSearchProvider::from_file(path).map_err(|err| {
                    ConfigurationError::Client {
                        component: "loopback".into(),
                        detail: format!("{err:#}"),
                    }
                })?,
                None => LoopbackSearchProvider::default(),
            };
            Arc::new(provider)
        }
    };
    Ok(provider)
}

pub(crate) fn http_client(component: &str) -> Result<Client, ConfigurationError> {
    Client::builder()
        .user_agent("veracity-verification/0.1")
        .build()
        .map_err(|err| ConfigurationError::Client {
            component: component.into(),
            detail: err.to_string(),
        })
}

/// Sends `request` and decodes a JSON body, mapping failures onto [`ProviderError`].
pub(crate) async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: RequestBuilder,
) -> Result<T, ProviderError> {
    let response = request.send().await.map_err(|err| {
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: provider.into(),
                after_ms: 0,
            }
        } else {
            ProviderError::Transport {
                provider: provider.into(),
                detail: err.without_url().to_string(),
            }
        }
    })?;
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::Quota {
            provider: provider.into(),
        });
    }
    if !status.is_success() {
        return Err(ProviderError::Status {
            provider: provider.into(),
            status: status.as_u16(),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ProviderError::Transport {
            provider: provider.into(),
            detail: err.without_url().to_string(),
        })?;
    serde_json::from_slice(&bytes).map_err(|err| ProviderError::Malformed {
        provider: provider.into(),
        detail: err.to_string(),
    })
}
