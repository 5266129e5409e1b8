use std::{sync::Arc, time::Duration};

use serde_json::json;
use shared_logging::LogLevel;
use tokio::time::{sleep, timeout};

use crate::{
    config::SearchConfig,
    error::ProviderError,
    model::{dedupe_by_url, host_of, Evidence, SourceReliability},
    providers::SearchProvider,
    telemetry::VerificationTelemetry,
};

/// Retrieval bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieverSettings {
    /// Snippets kept per query.
    pub max_results: usize,
    /// Deadline for one provider call.
    pub timeout: Duration,
    /// Extra attempts after a retryable failure.
    pub retries: u32,
    /// Backoff step; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
    /// Upper bound on `site:` clauses.
    pub max_bias_domains: usize,
}

impl RetrieverSettings {
    /// Delay before retry `attempt`, saturating instead of overflowing.
    #[must_use]
    pub const fn backoff_before(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }

    /// Settings from the search section.
    #[must_use]
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            max_results: config.max_results.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
            retries: config.retries,
            backoff: Duration::from_millis(config.backoff_ms),
            max_bias_domains: config.max_bias_domains,
        }
    }
}

impl Default for RetrieverSettings {
    fn default() -> Self {
        Self {
            max_results: 5,
            timeout: Duration::from_secs(8),
            retries: 2,
            backoff: Duration::from_millis(250),
            max_bias_domains: 10,
        }
    }
}

/// Normalized allow-list of trusted domains, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedDomains {
    domains: Vec<String>,
}

impl TrustedDomains {
    /// Normalizes entries: scheme, `www.` and paths are stripped, duplicates dropped.
    #[must_use]
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for raw in domains {
            let domain = normalize_domain(raw.as_ref());
            if !domain.is_empty() && !normalized.contains(&domain) {
                normalized.push(domain);
            }
        }
        Self {
            domains: normalized,
        }
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Domains in order.
    #[must_use]
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// True when the URL host equals a trusted domain or is a subdomain of one.
    #[must_use]
    pub fn is_trusted(&self, url: &str) -> bool {
        host_of(url).is_some_and(|host| {
            self.domains.iter().any(|domain| {
                host == *domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            })
        })
    }

    /// Reliability tag for `url`.
    #[must_use]
    pub fn reliability(&self, url: &str) -> SourceReliability {
        if self.is_trusted(url) {
            SourceReliability::Trusted
        } else {
            SourceReliability::Unverified
        }
    }

    /// `site:a OR site:b` over at most `max` domains.
    #[must_use]
    pub fn site_clause(&self, max: usize) -> Option<String> {
        let clause = self
            .domains
            .iter()
            .take(max)
            .map(|domain| format!("site:{domain}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        (!clause.is_empty()).then_some(clause)
    }

    /// Soft-biased query: the original query OR a trusted-site clause.
    #[must_use]
    pub fn bias(&self, query: &str, max: usize) -> Option<String> {
        self.site_clause(max)
            .map(|clause| format!("{query} OR ({clause})"))
    }
}

fn normalize_domain(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let host = without_scheme.split('/').next().unwrap_or_default();
    host.strip_prefix("www.")
        .unwrap_or(host)
        .trim_matches('.')
        .to_string()
}

/// Queries the configured provider and shapes results into evidence.
///
/// Never fails: provider errors are retried, logged and collapsed into an
/// empty result.
#[derive(Clone)]
pub struct EvidenceRetriever {
    provider: Arc<dyn SearchProvider>,
    trusted: TrustedDomains,
    settings: RetrieverSettings,
    telemetry: Option<VerificationTelemetry>,
}

impl std::fmt::Debug for EvidenceRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceRetriever")
            .field("provider", &self.provider.name())
            .field("trusted", &self.trusted.domains.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl EvidenceRetriever {
    /// Retriever with default settings and no trusted domains.
    #[must_use]
    pub fn new(provider: Arc<dyn SearchProvider>) -> Self {
        Self {
            provider,
            trusted: TrustedDomains::default(),
            settings: RetrieverSettings::default(),
            telemetry: None,
        }
    }

    /// Sets the trusted-domain list used for biasing and tagging.
    #[must_use]
    pub fn with_trusted(mut self, trusted: TrustedDomains) -> Self {
        self.trusted = trusted;
        self
    }

    /// Overrides retrieval bounds.
    #[must_use]
    pub fn with_settings(mut self, settings: RetrieverSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<VerificationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Name of the backing provider.
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Retrieves at most `max_results` evidence items for `query`.
    pub async fn retrieve(&self, query: &str) -> Vec<Evidence> {
        let query = query.trim();
        if query.is_empty() {
            self.log(LogLevel::Warn, "verification.retrieve.empty_query", json!({}));
            return Vec::new();
        }
        if let Some(biased) = self.trusted.bias(query, self.settings.max_bias_domains) {
            let evidence = self.resolve(self.attempt(&biased).await);
            if !evidence.is_empty() {
                self.log_batch(query, &evidence, true);
                return evidence;
            }
            self.log(
                LogLevel::Info,
                "verification.retrieve.bias_fallback",
                json!({ "query": query }),
            );
        }
        let evidence = self.resolve(self.attempt(query).await);
        self.log_batch(query, &evidence, false);
        evidence
    }

    async fn attempt(&self, query: &str) -> Vec<Evidence> {
        let provider = self.provider.name();
        let after_ms = u64::try_from(self.settings.timeout.as_millis()).unwrap_or(u64::MAX);
        let mut last_error = None;
        for attempt in 0..=self.settings.retries {
            if attempt > 0 {
                sleep(self.settings.backoff_before(attempt)).await;
            }
            let outcome = timeout(
                self.settings.timeout,
                self.provider.search(query, self.settings.max_results),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Timeout {
                    provider: provider.to_string(),
                    after_ms,
                })
            });
            match outcome {
                Ok(payload) => return payload.into_evidence(),
                Err(err) => {
                    self.log(
                        LogLevel::Debug,
                        "verification.retrieve.attempt_failed",
                        json!({
                            "provider": provider,
                            "attempt": attempt + 1,
                            "error": err.to_string(),
                        }),
                    );
                    let retryable = err.is_retryable();
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        self.log(
            LogLevel::Warn,
            "verification.retrieve.failed",
            json!({
                "provider": provider,
                "query": query,
                "error": last_error.map(|err| err.to_string()),
            }),
        );
        Vec::new()
    }

    fn resolve(&self, raw: Vec<Evidence>) -> Vec<Evidence> {
        let provider = self.provider.name();
        let mut evidence = dedupe_by_url(raw.into_iter().map(|item| {
            let reliability = self.trusted.reliability(&item.url);
            item.with_reliability(reliability).with_provider(provider)
        }));
        evidence.truncate(self.settings.max_results);
        evidence
    }

    fn log_batch(&self, query: &str, evidence: &[Evidence], biased: bool) {
        self.log(
            LogLevel::Info,
            "verification.retrieve.batch",
            json!({
                "query": query,
                "biased": biased,
                "count": evidence.len(),
                "sources": evidence.iter().map(|e| e.url.as_str()).collect::<Vec<_>>(),
            }),
        );
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        providers::ProviderPayload,
        test_support::{fast_settings, ScriptedProvider, SlowProvider},
    };

    fn hit(url: &str) -> Evidence {
        Evidence::new(url, "title", "snippet")
    }

    #[test]
    fn trusted_domains_normalize_and_match_subdomains() {
        let trusted = TrustedDomains::new(["https://www.Reuters.com/", "apnews.com", "reuters.com"]);
        assert_eq!(trusted.domains(), ["reuters.com", "apnews.com"]);
        assert!(trusted.is_trusted("https://www.reuters.com/world"));
        assert!(trusted.is_trusted("https://apnews.com/article/1"));
        assert!(!trusted.is_trusted("https://notreuters.com/x"));
        assert!(!trusted.is_trusted("not a url"));
    }

    #[test]
    fn backoff_grows_linearly_and_saturates() {
        let settings = fast_settings();
        assert_eq!(settings.backoff_before(3), Duration::from_millis(3));
        let huge = RetrieverSettings {
            backoff: Duration::MAX,
            ..fast_settings()
        };
        assert_eq!(huge.backoff_before(2), Duration::MAX);
    }

    #[test]
    fn site_clause_is_bounded() {
        let trusted = TrustedDomains::new((0..15).map(|i| format!("d{i}.example")));
        let clause = trusted.site_clause(10).unwrap();
        assert_eq!(clause.matches("site:").count(), 10);
        assert_eq!(
            TrustedDomains::new(["a.example"]).bias("q", 10).as_deref(),
            Some("q OR (site:a.example)")
        );
        assert!(TrustedDomains::default().bias("q", 10).is_none());
    }

    #[tokio::test]
    async fn biased_query_falls_back_to_plain_query() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(ProviderPayload::Evidence(Vec::new())),
            Ok(ProviderPayload::Evidence(vec![hit("https://blog.example/post")])),
        ]));
        let retriever = EvidenceRetriever::new(provider.clone())
            .with_trusted(TrustedDomains::new(["reuters.com"]))
            .with_settings(fast_settings());
        let evidence = retriever.retrieve("moon landing").await;
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].reliability, SourceReliability::Unverified);
        assert_eq!(
            provider.calls(),
            vec!["moon landing OR (site:reuters.com)", "moon landing"]
        );
    }

    #[tokio::test]
    async fn resolves_tags_and_truncates() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(ProviderPayload::Evidence(vec![
            hit("https://www.reuters.com/a"),
            hit(""),
            hit("https://www.reuters.com/a"),
            hit("https://b.example"),
            hit("https://c.example"),
        ]))]));
        let settings = RetrieverSettings {
            max_results: 2,
            ..fast_settings()
        };
        let retriever = EvidenceRetriever::new(provider)
            .with_trusted(TrustedDomains::new(["reuters.com"]))
            .with_settings(settings);
        let evidence = retriever.retrieve("query").await;
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].reliability, SourceReliability::Trusted);
        assert_eq!(evidence[0].provider, "scripted");
        assert_eq!(evidence[1].url, "https://b.example");
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Quota {
                provider: "scripted".into(),
            }),
            Ok(ProviderPayload::Evidence(vec![hit("https://a.example")])),
        ]));
        let retriever = EvidenceRetriever::new(provider.clone()).with_settings(fast_settings());
        assert_eq!(retriever.retrieve("query").await.len(), 1);
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Status {
            provider: "scripted".into(),
            status: 403,
        })]));
        let retriever = EvidenceRetriever::new(provider.clone()).with_settings(fast_settings());
        assert!(retriever.retrieve("query").await.is_empty());
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn timeouts_degrade_to_empty() {
        let retriever = EvidenceRetriever::new(Arc::new(SlowProvider::new(Duration::from_secs(5))))
            .with_settings(fast_settings());
        assert!(retriever.retrieve("query").await.is_empty());
    }

    #[tokio::test]
    async fn empty_query_skips_provider() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let retriever = EvidenceRetriever::new(provider.clone());
        assert!(retriever.retrieve("   ").await.is_empty());
        assert!(provider.calls().is_empty());
    }
}
