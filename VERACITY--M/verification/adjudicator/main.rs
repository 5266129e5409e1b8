use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::time::timeout;

/// Model-backed adjudication.
pub mod llm;
/// Offline term-overlap adjudication.
pub mod overlap;

pub use llm::LlmAdjudicator;
pub use overlap::TermOverlapAdjudicator;

use crate::{
    error::AdjudicationError,
    model::{dedupe_by_url, Claim, Evidence, Verdict, VerdictResult},
    telemetry::VerificationTelemetry,
};

/// Highest confidence allowed for a verdict reached without evidence.
pub const NO_EVIDENCE_MAX_CONFIDENCE: u8 = 50;

/// Produces a verdict for a claim from the accumulated evidence.
#[async_trait]
pub trait Adjudicator: Send + Sync {
    /// Adjudicator name for logs.
    fn name(&self) -> &str;

    /// Evaluates `claim` against `evidence`. Empty evidence must not be an error.
    async fn evaluate(&self, claim: &Claim, evidence: &[Evidence]) -> Result<Verdict, AdjudicationError>;
}

/// Wraps an adjudicator with a deadline, a single retry and verdict
/// normalization. Always yields a verdict.
#[derive(Clone)]
pub struct GuardedAdjudicator {
    inner: Arc<dyn Adjudicator>,
    timeout: Duration,
    telemetry: Option<VerificationTelemetry>,
}

impl std::fmt::Debug for GuardedAdjudicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedAdjudicator")
            .field("inner", &self.inner.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GuardedAdjudicator {
    /// Guards `inner` with a per-attempt deadline.
    #[must_use]
    pub fn new(inner: Arc<dyn Adjudicator>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<VerificationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Evaluates with one retry; repeated failure yields a degraded `Insufficient` verdict.
    pub async fn evaluate(&self, claim: &Claim, evidence: &[Evidence]) -> Verdict {
        let after_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let mut last_error = None;
        for attempt in 1..=2 {
            let outcome = timeout(self.timeout, self.inner.evaluate(claim, evidence))
                .await
                .unwrap_or_else(|_| Err(AdjudicationError::Timeout(after_ms)));
            match outcome {
                Ok(verdict) => return normalize(claim, evidence, verdict),
                Err(err) => {
                    if let Some(tel) = &self.telemetry {
                        let _ = tel.log(
                            LogLevel::Warn,
                            "verification.adjudicate.failed",
                            json!({
                                "claim_id": claim.id(),
                                "adjudicator": self.inner.name(),
                                "attempt": attempt,
                                "error": err.to_string(),
                            }),
                        );
                    }
                    last_error = Some(err);
                }
            }
        }
        let detail = last_error.map_or_else(String::new, |err| format!(": {err}"));
        Verdict::insufficient(
            claim,
            format!("Unable to evaluate the evidence after a retry{detail}."),
            0.0,
        )
        .degraded()
    }
}

/// Binds the verdict to `claim`, restricts citations to evidence URLs and
/// caps zero-evidence verdicts.
fn normalize(claim: &Claim, evidence: &[Evidence], verdict: Verdict) -> Verdict {
    let pool: HashMap<&str, &Evidence> = evidence
        .iter()
        .filter(|item| !item.url.is_empty())
        .rev()
        .map(|item| (item.url.as_str(), item))
        .collect();
    let cited = dedupe_by_url(
        verdict
            .cited
            .iter()
            .filter_map(|item| pool.get(item.url.as_str()).map(|known| (*known).clone())),
    );
    let mut normalized = Verdict {
        claim_id: claim.id().to_string(),
        claim_text: claim.text().to_string(),
        result: verdict.result,
        reasoning: verdict.reasoning.trim().to_string(),
        cited,
        confidence: verdict.confidence.min(100),
        iterations: verdict.iterations,
        degraded: verdict.degraded,
    };
    if pool.is_empty() {
        if normalized.result == VerdictResult::Supported {
            normalized.result = VerdictResult::Insufficient;
        }
        normalized.confidence = normalized.confidence.min(NO_EVIDENCE_MAX_CONFIDENCE);
    }
    if normalized.reasoning.is_empty() {
        normalized.reasoning = format!(
            "Verdict {} based on {} cited source(s).",
            normalized.result,
            normalized.cited.len()
        );
    }
    normalized
}

/// Lists evidence for prompts and reasoning strings.
pub(crate) fn describe_sources(evidence: &[Evidence]) -> String {
    evidence
        .iter()
        .map(|item| item.domain().unwrap_or_else(|| item.url.clone()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FlakyAdjudicator, SlowAdjudicator, StaticAdjudicator};

    fn evidence() -> Vec<Evidence> {
        vec![
            Evidence::new("https://a.example/1", "A", "alpha"),
            Evidence::new("https://b.example/1", "B", "beta"),
            Evidence::new("https://a.example/1", "A again", "alpha"),
        ]
    }

    #[tokio::test]
    async fn citations_are_restricted_and_deduplicated() {
        let claim = Claim::new("c1", "claim");
        let raw = Verdict::new(
            &Claim::new("other", "other"),
            VerdictResult::Supported,
            "  supported by A  ",
            vec![
                Evidence::new("https://a.example/1", "A", ""),
                Evidence::new("https://invented.example", "X", ""),
                Evidence::new("https://a.example/1", "A", ""),
            ],
            91.0,
        );
        let guarded = GuardedAdjudicator::new(
            Arc::new(StaticAdjudicator::new(raw)),
            Duration::from_secs(1),
        );
        let verdict = guarded.evaluate(&claim, &evidence()).await;
        assert_eq!(verdict.claim_id, "c1");
        assert_eq!(verdict.cited_urls(), vec!["https://a.example/1"]);
        assert_eq!(verdict.cited[0].title, "A");
        assert_eq!(verdict.reasoning, "supported by A");
        assert_eq!(verdict.confidence, 91);
    }

    #[tokio::test]
    async fn zero_evidence_is_capped() {
        let claim = Claim::new("c1", "claim");
        let raw = Verdict::new(&claim, VerdictResult::Supported, "", Vec::new(), 95.0);
        let guarded = GuardedAdjudicator::new(
            Arc::new(StaticAdjudicator::new(raw)),
            Duration::from_secs(1),
        );
        let verdict = guarded.evaluate(&claim, &[]).await;
        assert_eq!(verdict.result, VerdictResult::Insufficient);
        assert!(verdict.confidence <= NO_EVIDENCE_MAX_CONFIDENCE);
        assert!(!verdict.reasoning.is_empty());
    }

    #[tokio::test]
    async fn retries_once_then_succeeds() {
        let claim = Claim::new("c1", "claim");
        let flaky = Arc::new(FlakyAdjudicator::new(1));
        let guarded = GuardedAdjudicator::new(flaky.clone(), Duration::from_secs(1));
        let verdict = guarded.evaluate(&claim, &evidence()).await;
        assert!(!verdict.degraded);
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn repeated_failure_yields_degraded_insufficient() {
        let claim = Claim::new("c1", "claim");
        let flaky = Arc::new(FlakyAdjudicator::new(5));
        let guarded = GuardedAdjudicator::new(flaky.clone(), Duration::from_secs(1));
        let verdict = guarded.evaluate(&claim, &evidence()).await;
        assert_eq!(verdict.result, VerdictResult::Insufficient);
        assert!(verdict.degraded);
        assert!(verdict.reasoning.contains("malformed"));
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn slow_adjudicator_times_out_twice_then_degrades() {
        let claim = Claim::new("c1", "claim");
        let slow = Arc::new(SlowAdjudicator::new(Duration::from_secs(5)));
        let guarded = GuardedAdjudicator::new(slow.clone(), Duration::from_millis(20));
        let started = std::time::Instant::now();
        let verdict = guarded.evaluate(&claim, &evidence()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(slow.calls(), 2);
        assert_eq!(verdict.result, VerdictResult::Insufficient);
        assert_eq!(verdict.confidence, 0);
        assert!(verdict.degraded);
        assert!(verdict.reasoning.contains("timed out after 20 ms"));
    }
}
