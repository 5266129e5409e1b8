use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use shared_logging::{LogLevel, RotationPolicy};

use crate::error::ConfigurationError;

/// Top-level configuration document. Read-only once a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VeracityConfig {
    /// Search provider and retrieval settings. Required.
    #[serde(default)]
    pub search: Option<SearchConfig>,
    /// Language model backing query generation and adjudication.
    #[serde(default)]
    pub language_model: LanguageModelConfig,
    /// Per-claim loop bounds.
    #[serde(default)]
    pub search_loop: SearchLoopConfig,
    /// Fan-out settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Log and event sinks.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(skip)]
    source_dir: PathBuf,
}

impl VeracityConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml_str(&raw, source_dir).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a TOML document; relative paths resolve against `source_dir`.
    pub fn from_toml_str(raw: &str, source_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.source_dir = source_dir.into();
        config.resolve_paths();
        config.validate()?;
        Ok(config)
    }

    /// Loopback search with the deterministic offline adjudicator.
    #[must_use]
    pub fn offline() -> Self {
        Self::offline_with_corpus(None)
    }

    /// Offline configuration searching the JSON corpus at `corpus_path`.
    #[must_use]
    pub fn offline_with_corpus(corpus_path: Option<PathBuf>) -> Self {
        Self {
            search: Some(SearchConfig::new(SearchProviderConfig::Loopback(
                LoopbackSearchConfig { corpus_path },
            ))),
            language_model: LanguageModelConfig::None,
            search_loop: SearchLoopConfig::default(),
            dispatch: DispatchConfig::default(),
            telemetry: TelemetryConfig::default(),
            source_dir: PathBuf::from("."),
        }
    }

    /// Replaces the search section.
    #[must_use]
    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = Some(search);
        self
    }

    /// Search section, or the fatal startup error when missing.
    pub fn search(&self) -> Result<&SearchConfig, ConfigurationError> {
        self.search
            .as_ref()
            .ok_or(ConfigurationError::MissingSearchProvider)
    }

    /// Checks every bound.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let search = self.search()?;
        check(
            "search.max_results",
            (1..=50).contains(&search.max_results),
            "must be between 1 and 50",
        )?;
        check("search.timeout_ms", search.timeout_ms > 0, "must be positive")?;
        check("search.retries", search.retries <= 5, "must be at most 5")?;
        check(
            "search.backoff_ms",
            search.backoff_ms <= MAX_BACKOFF_MS,
            "must be at most 60000",
        )?;
        check(
            "search.max_bias_domains",
            search.max_bias_domains <= 32,
            "must be at most 32",
        )?;
        check(
            "search_loop.max_iterations",
            (1..=10).contains(&self.search_loop.max_iterations),
            "must be between 1 and 10",
        )?;
        check(
            "search_loop.early_stop_confidence",
            self.search_loop.early_stop_confidence <= 100,
            "must be at most 100",
        )?;
        check(
            "search_loop.adjudication_timeout_ms",
            self.search_loop.adjudication_timeout_ms > 0,
            "must be positive",
        )?;
        check(
            "search_loop.query_timeout_ms",
            self.search_loop.query_timeout_ms > 0,
            "must be positive",
        )?;
        check(
            "dispatch.max_concurrent_claims",
            self.dispatch.max_concurrent_claims > 0,
            "must be positive",
        )?;
        if let LanguageModelConfig::Gemini(gemini) = &self.language_model {
            check(
                "language_model.temperature",
                (0.0..=2.0).contains(&gemini.temperature),
                "must be between 0.0 and 2.0",
            )?;
            check(
                "language_model.timeout_ms",
                gemini.timeout_ms > 0,
                "must be positive",
            )?;
        }
        Ok(())
    }

    /// Trusted domains from the inline list followed by the sources file, if any.
    pub fn trusted_domains(&self) -> Result<Vec<String>> {
        let Some(search) = &self.search else {
            return Ok(Vec::new());
        };
        let mut domains = search.trusted_domains.clone();
        if let Some(path) = &search.trusted_sources_path {
            domains.extend(load_trusted_sources(path)?);
        }
        Ok(domains)
    }

    /// Resolves a path relative to the configuration file.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        let candidate = candidate.as_ref();
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.source_dir.join(candidate)
        }
    }

    fn resolve_paths(&mut self) {
        let base = self.source_dir.clone();
        let rebase = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        if let Some(search) = &mut self.search {
            if let Some(path) = &mut search.trusted_sources_path {
                rebase(path);
            }
            if let SearchProviderConfig::Loopback(loopback) = &mut search.provider {
                if let Some(path) = &mut loopback.corpus_path {
                    rebase(path);
                }
            }
        }
        if let Some(path) = &mut self.telemetry.log_path {
            rebase(path);
        }
        if let Some(path) = &mut self.telemetry.event_log {
            rebase(path);
        }
    }
}

const MAX_BACKOFF_MS: u64 = 60_000;

fn check(field: &str, ok: bool, detail: &str) -> Result<(), ConfigurationError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidValue {
            field: field.into(),
            detail: detail.into(),
        })
    }
}

/// Reads a `{"group": ["domain", ...]}` file, keeping group and domain order.
/// A missing file yields no domains.
pub fn load_trusted_sources(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading trusted sources {}", path.display()))?;
    let groups: IndexMap<String, Vec<String>> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing trusted sources {}", path.display()))?;
    Ok(groups.into_values().flatten().collect())
}

/// Reads a secret through `lookup`; blank or placeholder values count as missing.
pub fn resolve_secret(
    lookup: &dyn Fn(&str) -> Option<String>,
    component: &str,
    var: &str,
) -> Result<String, ConfigurationError> {
    lookup(var)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && !value.contains("..."))
        .ok_or_else(|| ConfigurationError::MissingSecret {
            component: component.into(),
            var: var.into(),
        })
}

/// Process environment lookup.
#[must_use]
pub fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Retrieval settings plus the selected provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Provider selection.
    #[serde(flatten)]
    pub provider: SearchProviderConfig,
    /// Maximum snippets kept per query.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Per-call deadline.
    #[serde(default = "default_search_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after a retryable failure.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Linear backoff step between attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Upper bound on `site:` clauses appended for reliability biasing.
    #[serde(default = "default_max_bias_domains")]
    pub max_bias_domains: usize,
    /// Trusted domains listed inline.
    #[serde(default)]
    pub trusted_domains: Vec<String>,
    /// JSON file mapping groups to trusted domains.
    #[serde(default)]
    pub trusted_sources_path: Option<PathBuf>,
}

impl SearchConfig {
    /// Settings with defaults for the given provider.
    #[must_use]
    pub fn new(provider: SearchProviderConfig) -> Self {
        Self {
            provider,
            max_results: default_max_results(),
            timeout_ms: default_search_timeout_ms(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            max_bias_domains: default_max_bias_domains(),
            trusted_domains: Vec::new(),
            trusted_sources_path: None,
        }
    }
}

/// Supported search providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SearchProviderConfig {
    /// Google Programmable Search (Custom Search JSON API).
    Google(GoogleSearchConfig),
    /// Tavily search API.
    Tavily(TavilySearchConfig),
    /// Exa search API.
    Exa(ExaSearchConfig),
    /// Offline provider.
    Loopback(LoopbackSearchConfig),
}

impl SearchProviderConfig {
    /// Provider name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Google(_) => "google",
            Self::Tavily(_) => "tavily",
            Self::Exa(_) => "exa",
            Self::Loopback(_) => "loopback",
        }
    }
}

/// Google Custom Search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleSearchConfig {
    /// Variable holding the API key.
    #[serde(default = "default_google_key_env")]
    pub api_key_env: String,
    /// Variable holding the search engine id.
    #[serde(default = "default_google_cse_env")]
    pub cse_id_env: String,
    /// API endpoint.
    #[serde(default = "default_google_endpoint")]
    pub endpoint: String,
}

/// Tavily settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TavilySearchConfig {
    /// Variable holding the API key.
    #[serde(default = "default_tavily_key_env")]
    pub api_key_env: String,
    /// API endpoint.
    #[serde(default = "default_tavily_endpoint")]
    pub endpoint: String,
    /// Ask for full page content instead of the summary snippet.
    #[serde(default)]
    pub include_raw_content: bool,
}

/// Exa settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExaSearchConfig {
    /// Variable holding the API key.
    #[serde(default = "default_exa_key_env")]
    pub api_key_env: String,
    /// API endpoint.
    #[serde(default = "default_exa_endpoint")]
    pub endpoint: String,
    /// Exa search type (`neural`, `keyword`, `auto`).
    #[serde(default = "default_exa_type")]
    pub search_type: String,
}

/// Offline provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopbackSearchConfig {
    /// JSON array of `{url, title, snippet}` documents to search.
    #[serde(default)]
    pub corpus_path: Option<PathBuf>,
}

/// Language model selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LanguageModelConfig {
    /// Google Gemini `generateContent`.
    Gemini(GeminiConfig),
    /// No model: template queries and term-overlap adjudication.
    #[default]
    None,
}

impl LanguageModelConfig {
    /// Backend name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Gemini(_) => "gemini",
            Self::None => "none",
        }
    }
}

/// Gemini settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Model name.
    #[serde(default = "default_gemini_model")]
    pub model: String,
    /// Variable holding the API key.
    #[serde(default = "default_gemini_key_env")]
    pub api_key_env: String,
    /// API base URL.
    #[serde(default = "default_gemini_endpoint")]
    pub endpoint: String,
    /// Per-call deadline.
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: f32,
}

/// Search loop bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchLoopConfig {
    /// Hard ceiling on search iterations per claim.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Provisional confidence that ends the search early.
    #[serde(default = "default_early_stop_confidence")]
    pub early_stop_confidence: u8,
    /// Distinct sources that end the search when pre-evaluation is off.
    #[serde(default = "default_sufficient_evidence")]
    pub sufficient_evidence: usize,
    /// Run the adjudicator after every retrieval.
    #[serde(default = "default_true")]
    pub pre_evaluate: bool,
    /// Deadline for one adjudication attempt.
    #[serde(default = "default_adjudication_timeout_ms")]
    pub adjudication_timeout_ms: u64,
    /// Deadline for one model-backed query generation.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for SearchLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            early_stop_confidence: default_early_stop_confidence(),
            sufficient_evidence: default_sufficient_evidence(),
            pre_evaluate: default_true(),
            adjudication_timeout_ms: default_adjudication_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

/// Fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Claims verified at the same time.
    #[serde(default = "default_max_concurrent_claims")]
    pub max_concurrent_claims: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_claims: default_max_concurrent_claims(),
        }
    }
}

/// Log and event sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// JSON-lines log file.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON-lines progress event file.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    /// Minimum level written to the log.
    #[serde(default = "default_min_level")]
    pub min_level: LogLevel,
    /// Rotate the log past this size.
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,
    /// Rotated files kept.
    #[serde(default = "default_backups")]
    pub backups: usize,
}

impl TelemetryConfig {
    /// Rotation policy for the log file.
    #[must_use]
    pub const fn rotation(&self) -> RotationPolicy {
        RotationPolicy {
            max_bytes: self.rotate_bytes,
            max_backups: self.backups,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            event_log: None,
            min_level: default_min_level(),
            rotate_bytes: default_rotate_bytes(),
            backups: default_backups(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_max_results() -> usize {
    5
}

const fn default_search_timeout_ms() -> u64 {
    8_000
}

const fn default_retries() -> u32 {
    2
}

const fn default_backoff_ms() -> u64 {
    250
}

const fn default_max_bias_domains() -> usize {
    10
}

const fn default_max_iterations() -> usize {
    3
}

const fn default_early_stop_confidence() -> u8 {
    80
}

const fn default_sufficient_evidence() -> usize {
    6
}

const fn default_adjudication_timeout_ms() -> u64 {
    30_000
}

const fn default_query_timeout_ms() -> u64 {
    15_000
}

const fn default_max_concurrent_claims() -> usize {
    8
}

const fn default_llm_timeout_ms() -> u64 {
    20_000
}

const fn default_min_level() -> LogLevel {
    LogLevel::Info
}

const fn default_rotate_bytes() -> u64 {
    10 * 1024 * 1024
}

const fn default_backups() -> usize {
    5
}

fn default_google_key_env() -> String {
    "GOOGLE_SEARCH_API_KEY".into()
}

fn default_google_cse_env() -> String {
    "GOOGLE_CSE_ID".into()
}

fn default_google_endpoint() -> String {
    "https://www.googleapis.com/customsearch/v1".into()
}

fn default_tavily_key_env() -> String {
    "TAVILY_API_KEY".into()
}

fn default_tavily_endpoint() -> String {
    "https://api.tavily.com/search".into()
}

fn default_exa_key_env() -> String {
    "EXA_API_KEY".into()
}

fn default_exa_endpoint() -> String {
    "https://api.exa.ai/search".into()
}

fn default_exa_type() -> String {
    "neural".into()
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash".into()
}

fn default_gemini_key_env() -> String {
    "GOOGLE_API_KEY".into()
}

fn default_gemini_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_and_normalizes_document() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("veracity.toml");
        fs::write(
            &config_path,
            r#"
[search]
kind = "google"
max_results = 4
trusted_domains = ["reuters.com"]
trusted_sources_path = "reliable_sources.json"

[language_model]
kind = "gemini"
model = "gemini-2.0-flash"

[search_loop]
max_iterations = 2

[telemetry]
log_path = "logs/claims.log"
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("reliable_sources.json"),
            r#"{"news": ["apnews.com", "bbc.co.uk"], "science": ["nature.com"]}"#,
        )
        .unwrap();
        let config = VeracityConfig::load(&config_path).unwrap();
        let search = config.search().unwrap();
        assert_eq!(search.max_results, 4);
        assert_eq!(search.retries, 2);
        assert!(matches!(search.provider, SearchProviderConfig::Google(_)));
        assert!(search.trusted_sources_path.as_ref().unwrap().is_absolute());
        assert!(config.telemetry.log_path.as_ref().unwrap().is_absolute());
        assert_eq!(config.search_loop.max_iterations, 2);
        assert!(config.search_loop.pre_evaluate);
        let domains = config.trusted_domains().unwrap();
        assert_eq!(
            domains,
            vec!["reuters.com", "apnews.com", "bbc.co.uk", "nature.com"]
        );
    }

    #[test]
    fn missing_search_section_is_a_configuration_error() {
        let err = VeracityConfig::from_toml_str("[dispatch]\nmax_concurrent_claims = 2\n", ".")
            .unwrap_err();
        let config_err = err.downcast_ref::<ConfigurationError>().unwrap();
        assert_eq!(config_err, &ConfigurationError::MissingSearchProvider);
    }

    #[test]
    fn rejects_out_of_range_iterations() {
        let err = VeracityConfig::from_toml_str(
            "[search]\nkind = \"loopback\"\n\n[search_loop]\nmax_iterations = 0\n",
            ".",
        )
        .unwrap_err();
        assert!(err.to_string().contains("search_loop.max_iterations"));
    }

    #[test]
    fn secrets_reject_placeholders() {
        let lookup = |var: &str| match var {
            "GOOD" => Some("abc123".to_string()),
            "PLACEHOLDER" => Some("sk-...".to_string()),
            _ => None,
        };
        assert_eq!(resolve_secret(&lookup, "google", "GOOD").unwrap(), "abc123");
        assert!(resolve_secret(&lookup, "google", "PLACEHOLDER").is_err());
        assert!(matches!(
            resolve_secret(&lookup, "google", "ABSENT"),
            Err(ConfigurationError::MissingSecret { .. })
        ));
    }

    #[test]
    fn trusted_sources_keep_file_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reliable_sources.json");
        fs::write(
            &path,
            r#"{"news": ["reuters.com"], "science": ["nasa.gov"], "academic": ["jstor.org"]}"#,
        )
        .unwrap();
        assert_eq!(
            load_trusted_sources(&path).unwrap(),
            vec!["reuters.com", "nasa.gov", "jstor.org"]
        );
    }

    #[test]
    fn rejects_unbounded_backoff() {
        let err = VeracityConfig::from_toml_str(
            "[search]\nkind = \"loopback\"\nbackoff_ms = 3600000\n",
            ".",
        )
        .unwrap_err();
        assert!(err.to_string().contains("search.backoff_ms"));
    }

    #[test]
    fn offline_constructors_set_search_section() {
        let config = VeracityConfig::offline_with_corpus(Some(PathBuf::from("/data/corpus.json")));
        config.validate().unwrap();
        assert!(matches!(
            &config.search().unwrap().provider,
            SearchProviderConfig::Loopback(LoopbackSearchConfig { corpus_path: Some(path) })
                if path == Path::new("/data/corpus.json")
        ));
        assert!(matches!(config.language_model, LanguageModelConfig::None));

        let mut search = SearchConfig::new(SearchProviderConfig::Loopback(
            LoopbackSearchConfig::default(),
        ));
        search.max_results = 3;
        let config = VeracityConfig::offline().with_search(search);
        assert_eq!(config.search().unwrap().max_results, 3);
    }

    #[test]
    fn missing_trusted_sources_file_is_empty() {
        let domains = load_trusted_sources(Path::new("/nonexistent/reliable_sources.json")).unwrap();
        assert!(domains.is_empty());
    }
}
