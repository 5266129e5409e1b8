use std::{collections::HashSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum snippet length (in characters) retained per evidence item.
pub const MAX_SNIPPET_CHARS: usize = 2_000;

/// Atomic factual assertion supplied by the claim extractor. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    id: String,
    text: String,
}

impl Claim {
    /// Creates a claim.
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    /// Stable identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Whether a source belongs to the configured trusted-domain allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceReliability {
    /// Host matches a trusted domain.
    Trusted,
    /// Anything else.
    #[default]
    Unverified,
}

/// Retrieved snippet bearing on a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Source URL.
    pub url: String,
    /// Page title, possibly empty.
    pub title: String,
    /// Snippet text, at most [`MAX_SNIPPET_CHARS`] characters.
    pub snippet: String,
    /// Reliability tag.
    #[serde(default)]
    pub reliability: SourceReliability,
    /// Name of the provider that returned the snippet.
    #[serde(default)]
    pub provider: String,
}

impl Evidence {
    /// Creates an unverified evidence item, truncating the snippet.
    #[must_use]
    pub fn new(url: impl Into<String>, title: impl Into<String>, snippet: impl AsRef<str>) -> Self {
        Self {
            url: url.into().trim().to_string(),
            title: title.into().trim().to_string(),
            snippet: truncate_chars(snippet.as_ref().trim(), MAX_SNIPPET_CHARS),
            reliability: SourceReliability::Unverified,
            provider: String::new(),
        }
    }

    /// Sets the reliability tag.
    #[must_use]
    pub fn with_reliability(mut self, reliability: SourceReliability) -> Self {
        self.reliability = reliability;
        self
    }

    /// Sets the provider name.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Host portion of the URL, lower-cased.
    #[must_use]
    pub fn domain(&self) -> Option<String> {
        host_of(&self.url)
    }
}

/// Outcome of adjudicating one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictResult {
    /// Evidence supports the claim.
    Supported,
    /// Evidence contradicts the claim.
    Refuted,
    /// Evidence is missing, mixed or could not be evaluated.
    Insufficient,
}

impl VerdictResult {
    /// Upper-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Supported => "SUPPORTED",
            Self::Refuted => "REFUTED",
            Self::Insufficient => "INSUFFICIENT",
        }
    }
}

impl fmt::Display for VerdictResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for VerdictResult {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw
            .trim()
            .to_ascii_uppercase()
            .replace(' ', "_")
            .replace('-', "_");
        match normalized.as_str() {
            "SUPPORTED" | "SUPPORTS" | "TRUE" | "VERIFIED" => Ok(Self::Supported),
            "REFUTED" | "REFUTES" | "FALSE" | "CONTRADICTED" => Ok(Self::Refuted),
            "INSUFFICIENT" | "INSUFFICIENT_EVIDENCE" | "NOT_ENOUGH_INFO" | "UNVERIFIABLE"
            | "MIXED" => Ok(Self::Insufficient),
            _ => Err(format!("unknown verdict label '{}'", raw.trim())),
        }
    }
}

/// Terminal adjudication for one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Id of the adjudicated claim.
    pub claim_id: String,
    /// Text of the adjudicated claim.
    pub claim_text: String,
    /// Outcome.
    pub result: VerdictResult,
    /// Explanation referencing the cited evidence.
    pub reasoning: String,
    /// Cited subset of the accumulated evidence, unique by URL.
    pub cited: Vec<Evidence>,
    /// Confidence in `[0, 100]`.
    pub confidence: u8,
    /// Search iterations completed before adjudication.
    #[serde(default)]
    pub iterations: usize,
    /// Set when the verdict came from a failure or cancellation path.
    #[serde(default)]
    pub degraded: bool,
}

impl Verdict {
    /// Creates a verdict, clamping the confidence into `[0, 100]`.
    #[must_use]
    pub fn new(
        claim: &Claim,
        result: VerdictResult,
        reasoning: impl Into<String>,
        cited: Vec<Evidence>,
        confidence: f64,
    ) -> Self {
        Self {
            claim_id: claim.id().to_string(),
            claim_text: claim.text().to_string(),
            result,
            reasoning: reasoning.into(),
            cited,
            confidence: clamp_confidence(confidence),
            iterations: 0,
            degraded: false,
        }
    }

    /// `Insufficient` verdict with no citations.
    #[must_use]
    pub fn insufficient(claim: &Claim, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self::new(
            claim,
            VerdictResult::Insufficient,
            reasoning,
            Vec::new(),
            confidence,
        )
    }

    /// Marks the verdict as produced by a failure path.
    #[must_use]
    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    /// Cited URLs in citation order.
    #[must_use]
    pub fn cited_urls(&self) -> Vec<&str> {
        self.cited.iter().map(|e| e.url.as_str()).collect()
    }
}

/// Per-claim mutable record owned by exactly one search loop.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimVerificationState {
    /// Claim under verification.
    pub claim: Claim,
    /// Query of the current iteration.
    pub query: Option<String>,
    /// Every query issued so far, in order.
    pub queries: Vec<String>,
    /// Evidence accumulated across iterations (never replaced).
    pub evidence: Vec<Evidence>,
    /// Zero-based index of the current iteration.
    pub iteration: usize,
    /// Retrievals completed so far.
    pub retrievals: usize,
    /// Result of the latest pre-evaluation pass, if enabled.
    pub provisional: Option<Verdict>,
    /// Source URLs seen, in first-seen order, for observability.
    pub sources_seen: Vec<String>,
    /// Terminal verdict once evaluated.
    pub verdict: Option<Verdict>,
}

impl ClaimVerificationState {
    /// Fresh state for a claim.
    #[must_use]
    pub fn new(claim: Claim) -> Self {
        Self {
            claim,
            query: None,
            queries: Vec::new(),
            evidence: Vec::new(),
            iteration: 0,
            retrievals: 0,
            provisional: None,
            sources_seen: Vec::new(),
            verdict: None,
        }
    }

    /// Sets the current query and records it in the history.
    pub fn record_query(&mut self, query: String) {
        self.queries.push(query.clone());
        self.query = Some(query);
    }

    /// True when `query` was already issued (case-insensitive).
    #[must_use]
    pub fn has_issued(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        self.queries
            .iter()
            .any(|issued| issued.trim().to_lowercase() == needle)
    }

    /// Appends a retrieval batch; returns how many URLs were new to this claim.
    pub fn absorb(&mut self, batch: Vec<Evidence>) -> usize {
        let mut fresh = 0;
        for item in &batch {
            if !item.url.is_empty() && !self.sources_seen.contains(&item.url) {
                self.sources_seen.push(item.url.clone());
                fresh += 1;
            }
        }
        self.evidence.extend(batch);
        fresh
    }

    /// Number of distinct evidence URLs accumulated.
    #[must_use]
    pub fn unique_evidence_count(&self) -> usize {
        self.sources_seen.len()
    }
}

/// Document-level verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverallVerdict {
    /// Supported claims outnumber refuted ones.
    #[serde(rename = "Likely True")]
    LikelyTrue,
    /// Refuted claims outnumber supported ones.
    #[serde(rename = "Likely False")]
    LikelyFalse,
    /// Supported and refuted counts tie.
    #[serde(rename = "Insufficient Evidence")]
    InsufficientEvidence,
    /// No verdicts at all.
    #[serde(rename = "Unknown")]
    Unknown,
}

impl OverallVerdict {
    /// Display label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::LikelyTrue => "Likely True",
            Self::LikelyFalse => "Likely False",
            Self::InsufficientEvidence => "Insufficient Evidence",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for OverallVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Source entry attached to a report, unique by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSource {
    /// `source-N`, numbered from 1.
    pub id: String,
    /// Title.
    pub title: String,
    /// URL.
    pub url: String,
    /// Host of the URL or `unknown`.
    pub domain: String,
    /// Whether the host is on the trusted list.
    pub is_reliable: bool,
}

/// Claim/verdict pair in the shape reused by narrative generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictDigest {
    /// Claim text.
    pub claim_text: String,
    /// Outcome.
    pub result: VerdictResult,
    /// Reasoning.
    pub reasoning: String,
    /// Cited URLs.
    pub sources: Vec<String>,
}

/// Aggregated outcome for a claim batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactCheckReport {
    /// Claims in the batch.
    pub claims: Vec<Claim>,
    /// One verdict per claim.
    pub verdicts: Vec<Verdict>,
    /// Majority verdict.
    pub overall_verdict: OverallVerdict,
    /// Confidence of the overall verdict.
    pub overall_confidence: u8,
    /// Cited sources across all claims, unique by URL.
    pub sources: Vec<ReportSource>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Combined reasoning.
    pub summary: String,
}

impl FactCheckReport {
    /// Plain-text rendering used by simple presentation layers.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "{}\nConfidence: {}%\n\n{}",
            self.overall_verdict, self.overall_confidence, self.summary
        );
        if !self.sources.is_empty() {
            out.push_str(&format!(
                "\n\nSources verified: {} sources",
                self.sources.len()
            ));
        }
        out
    }

    /// Stable `{claim text, result, reasoning, sources}` list.
    #[must_use]
    pub fn digest(&self) -> Vec<VerdictDigest> {
        self.verdicts
            .iter()
            .map(|verdict| VerdictDigest {
                claim_text: verdict.claim_text.clone(),
                result: verdict.result,
                reasoning: verdict.reasoning.clone(),
                sources: verdict.cited.iter().map(|e| e.url.clone()).collect(),
            })
            .collect()
    }
}

/// Clamps a confidence score into `[0, 100]`; NaN maps to 0.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn clamp_confidence(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

/// Lower-cased host of a URL, if it parses.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
        .filter(|host| !host.is_empty())
}

/// Keeps the first item per non-empty URL, preserving order.
#[must_use]
pub fn dedupe_by_url(items: impl IntoIterator<Item = Evidence>) -> Vec<Evidence> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.url.is_empty() && seen.insert(item.url.clone()))
        .collect()
}

/// Truncates on a character boundary.
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
