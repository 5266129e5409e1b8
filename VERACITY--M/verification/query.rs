use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::time::timeout;

use crate::{
    error::VerificationError,
    llm::{LanguageModel, Prompt},
    model::{truncate_chars, Claim, ClaimVerificationState},
    telemetry::VerificationTelemetry,
    text::{normalize_whitespace, significant_terms},
};

const REFINEMENTS: &[&str] = &[
    "fact check",
    "evidence study",
    "debunked OR confirmed",
    "official statistics",
    "expert analysis",
];

const MAX_KEYWORDS: usize = 8;
const MAX_GAP_TERMS: usize = 5;
const MAX_QUERY_CHARS: usize = 256;

/// Produces the search query for one iteration of a claim's loop.
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    /// Query for `iteration` (zero-based). Later iterations must differ from
    /// every query already recorded in `state`.
    async fn generate(
        &self,
        claim: &Claim,
        iteration: usize,
        state: &ClaimVerificationState,
    ) -> Result<String, VerificationError>;
}

/// Deterministic keyword and refinement-suffix queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateQueryGenerator;

impl TemplateQueryGenerator {
    /// Creates the generator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn compose(claim: &Claim, iteration: usize, state: &ClaimVerificationState) -> Option<String> {
        let text = normalize_whitespace(claim.text());
        if text.is_empty() {
            return None;
        }
        if iteration == 0 {
            return Some(text);
        }
        let claim_terms = significant_terms(&text);
        let mut parts = if claim_terms.is_empty() {
            vec![text]
        } else {
            claim_terms.iter().take(MAX_KEYWORDS).cloned().collect()
        };
        if let Some(provisional) = &state.provisional {
            parts.extend(
                significant_terms(&provisional.reasoning)
                    .into_iter()
                    .filter(|term| !claim_terms.contains(term))
                    .take(MAX_GAP_TERMS),
            );
        }
        parts.push(REFINEMENTS[(iteration - 1) % REFINEMENTS.len()].to_string());
        Some(parts.join(" "))
    }
}

#[async_trait]
impl QueryGenerator for TemplateQueryGenerator {
    async fn generate(
        &self,
        claim: &Claim,
        iteration: usize,
        state: &ClaimVerificationState,
    ) -> Result<String, VerificationError> {
        let base = Self::compose(claim, iteration, state)
            .ok_or_else(|| VerificationError::QueryGeneration("claim text is empty".into()))?;
        Ok(make_unique(base, state))
    }
}

fn make_unique(base: String, state: &ClaimVerificationState) -> String {
    if !state.has_issued(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{base} {n}"))
        .find(|candidate| !state.has_issued(candidate))
        .unwrap_or(base)
}

/// Model-written queries with a deterministic fallback. Never fails for a
/// non-empty claim.
pub struct LlmQueryGenerator {
    model: Arc<dyn LanguageModel>,
    fallback: TemplateQueryGenerator,
    timeout: Duration,
    telemetry: Option<VerificationTelemetry>,
}

impl LlmQueryGenerator {
    /// Creates the generator with a per-call deadline.
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model,
            fallback: TemplateQueryGenerator::new(),
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

    fn prompt(claim: &Claim, iteration: usize, state: &ClaimVerificationState) -> Prompt {
        let mut user = format!("Claim: {}\n", claim.text());
        if !state.queries.is_empty() {
            user.push_str("Queries already tried (do not repeat):\n");
            for query in &state.queries {
                user.push_str(&format!("- {query}\n"));
            }
        }
        if let Some(provisional) = &state.provisional {
            user.push_str(&format!(
                "Assessment so far ({}, confidence {}): {}\n",
                provisional.result, provisional.confidence, provisional.reasoning
            ));
            user.push_str("Target what is still missing or ambiguous.\n");
        }
        user.push_str(&format!(
            "Write search query number {} for this claim.",
            iteration + 1
        ));
        Prompt::new(
            "You write concise web search queries that find evidence to verify or refute \
             a factual claim. Reply with the query only, on one line, without quotes.",
            user,
        )
    }

    fn fallback_reason(&self, claim: &Claim, iteration: usize, reason: &str) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Warn,
                "verification.query.fallback",
                json!({
                    "claim_id": claim.id(),
                    "iteration": iteration,
                    "model": self.model.name(),
                    "reason": reason,
                }),
            );
        }
    }
}

fn clean_model_query(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let unquoted = line
        .trim_start_matches(|c: char| matches!(c, '"' | '\'' | '`'))
        .trim_end_matches(|c: char| matches!(c, '"' | '\'' | '`'));
    let unlabeled = unquoted
        .strip_prefix("Query:")
        .or_else(|| unquoted.strip_prefix("query:"))
        .unwrap_or(unquoted);
    truncate_chars(&normalize_whitespace(unlabeled), MAX_QUERY_CHARS)
}

#[async_trait]
impl QueryGenerator for LlmQueryGenerator {
    async fn generate(
        &self,
        claim: &Claim,
        iteration: usize,
        state: &ClaimVerificationState,
    ) -> Result<String, VerificationError> {
        let prompt = Self::prompt(claim, iteration, state);
        match timeout(self.timeout, self.model.complete(&prompt)).await {
            Ok(Ok(raw)) => {
                let query = clean_model_query(&raw);
                if query.is_empty() {
                    self.fallback_reason(claim, iteration, "empty query");
                } else if state.has_issued(&query) {
                    self.fallback_reason(claim, iteration, "duplicate query");
                } else {
                    return Ok(query);
                }
            }
            Ok(Err(err)) => self.fallback_reason(claim, iteration, &err.to_string()),
            Err(_) => self.fallback_reason(claim, iteration, "timeout"),
        }
        self.fallback.generate(claim, iteration, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::LlmError,
        model::{Verdict, VerdictResult},
        telemetry::VerificationTelemetry,
        test_support::{ScriptedModel, SlowModel},
    };
    use tempfile::tempdir;

    fn claim() -> Claim {
        Claim::new("c1", "The Great Wall of China is visible from space")
    }

    #[tokio::test]
    async fn first_iteration_uses_claim_text() {
        let claim = Claim::new("c1", "  The Great Wall \n of China  ");
        let state = ClaimVerificationState::new(claim.clone());
        let query = TemplateQueryGenerator::new()
            .generate(&claim, 0, &state)
            .await
            .unwrap();
        assert_eq!(query, "The Great Wall of China");
    }

    #[tokio::test]
    async fn later_iterations_never_repeat() {
        let generator = TemplateQueryGenerator::new();
        let claim = claim();
        let mut state = ClaimVerificationState::new(claim.clone());
        for iteration in 0..12 {
            let query = generator.generate(&claim, iteration, &state).await.unwrap();
            assert!(!state.has_issued(&query), "repeated {query}");
            state.record_query(query);
        }
    }

    #[tokio::test]
    async fn gap_terms_come_from_provisional_reasoning() {
        let claim = claim();
        let mut state = ClaimVerificationState::new(claim.clone());
        state.provisional = Some(Verdict::new(
            &claim,
            VerdictResult::Insufficient,
            "Sources disagree about astronaut observations from orbit",
            Vec::new(),
            40.0,
        ));
        let query = TemplateQueryGenerator::new()
            .generate(&claim, 1, &state)
            .await
            .unwrap();
        assert!(query.contains("astronaut"));
        assert!(query.ends_with("fact check"));
    }

    #[tokio::test]
    async fn empty_claim_is_an_error() {
        let claim = Claim::new("c1", "   ");
        let state = ClaimVerificationState::new(claim.clone());
        let err = TemplateQueryGenerator::new()
            .generate(&claim, 0, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::QueryGeneration(_)));
    }

    #[tokio::test]
    async fn model_query_is_cleaned() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            "\"Great Wall visible from orbit astronauts\"\n".to_string()
        )]));
        let generator = LlmQueryGenerator::new(model, Duration::from_secs(1));
        let claim = claim();
        let state = ClaimVerificationState::new(claim.clone());
        let query = generator.generate(&claim, 0, &state).await.unwrap();
        assert_eq!(query, "Great Wall visible from orbit astronauts");
    }

    #[tokio::test]
    async fn falls_back_on_error_or_duplicate() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::EmptyResponse),
            Ok("great wall".to_string()),
        ]));
        let generator = LlmQueryGenerator::new(model, Duration::from_secs(1));
        let claim = claim();
        let mut state = ClaimVerificationState::new(claim.clone());
        let first = generator.generate(&claim, 0, &state).await.unwrap();
        assert_eq!(first, "The Great Wall of China is visible from space");
        state.record_query(first);
        state.record_query("great wall".into());
        let second = generator.generate(&claim, 1, &state).await.unwrap();
        assert!(second.ends_with("fact check"));
    }

    #[tokio::test]
    async fn slow_model_falls_back_to_template_query() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("verification.log");
        let telemetry = VerificationTelemetry::builder("verification")
            .log_path(&log_path)
            .build()
            .unwrap();
        let generator = LlmQueryGenerator::new(
            Arc::new(SlowModel::new(Duration::from_secs(5))),
            Duration::from_millis(20),
        )
        .with_telemetry(Some(telemetry));
        let claim = claim();
        let state = ClaimVerificationState::new(claim.clone());
        let started = std::time::Instant::now();
        let query = generator.generate(&claim, 0, &state).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        let template = TemplateQueryGenerator::new()
            .generate(&claim, 0, &state)
            .await
            .unwrap();
        assert_eq!(query, template);
        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(content.contains("verification.query.fallback"));
        assert!(content.contains("timeout"));
    }
}
