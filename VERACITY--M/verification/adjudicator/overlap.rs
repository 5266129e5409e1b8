use async_trait::async_trait;

use super::{describe_sources, Adjudicator};
use crate::{
    error::AdjudicationError,
    model::{Claim, Evidence, Verdict, VerdictResult},
    text::{significant_terms, tokens},
};

const REFUTATION_CUES: &[&str] = &[
    "false",
    "hoax",
    "debunked",
    "myth",
    "misleading",
    "incorrect",
    "untrue",
    "fake",
    "disproven",
    "fabricated",
    "baseless",
    "misconception",
];

/// Deterministic adjudicator scoring claim/snippet term overlap and
/// refutation cue words. Used offline and when no model is configured.
#[derive(Debug, Clone, Copy)]
pub struct TermOverlapAdjudicator {
    relevance_threshold: f64,
}

impl TermOverlapAdjudicator {
    /// Requires half of the claim's terms in a snippet for it to count.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            relevance_threshold: 0.5,
        }
    }

    /// Overrides the share of claim terms a snippet must contain.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.relevance_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[allow(clippy::cast_precision_loss)]
    fn overlap(claim_terms: &[String], item: &Evidence) -> f64 {
        if claim_terms.is_empty() {
            return 0.0;
        }
        let haystack = significant_terms(&format!("{} {}", item.title, item.snippet));
        let hits = claim_terms
            .iter()
            .filter(|term| haystack.contains(term))
            .count();
        hits as f64 / claim_terms.len() as f64
    }

    fn refutes(item: &Evidence) -> bool {
        tokens(&format!("{} {}", item.title, item.snippet))
            .iter()
            .any(|token| REFUTATION_CUES.contains(&token.as_str()))
    }
}

impl Default for TermOverlapAdjudicator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adjudicator for TermOverlapAdjudicator {
    fn name(&self) -> &str {
        "term-overlap"
    }

    #[allow(clippy::cast_precision_loss)]
    async fn evaluate(&self, claim: &Claim, evidence: &[Evidence]) -> Result<Verdict, AdjudicationError> {
        if evidence.is_empty() {
            return Ok(Verdict::insufficient(
                claim,
                "No evidence was retrieved for this claim.",
                20.0,
            ));
        }
        let claim_terms = significant_terms(claim.text());
        let (refuting, supporting): (Vec<&Evidence>, Vec<&Evidence>) = evidence
            .iter()
            .filter(|item| Self::overlap(&claim_terms, item) >= self.relevance_threshold)
            .partition(|item| Self::refutes(item));
        let support = supporting.len();
        let refute = refuting.len();
        let verdict = if support == 0 && refute == 0 {
            Verdict::insufficient(
                claim,
                format!(
                    "None of the {} retrieved sources address the claim directly.",
                    evidence.len()
                ),
                25.0,
            )
        } else if support > refute {
            let cited = supporting.into_iter().cloned().collect::<Vec<_>>();
            let reasoning = format!(
                "{support} relevant source(s) agree with the claim ({}); {refute} dispute it.",
                describe_sources(&cited)
            );
            let confidence = 50.0 + 10.0 * support as f64 - 10.0 * refute as f64;
            Verdict::new(claim, VerdictResult::Supported, reasoning, cited, confidence.min(90.0))
        } else if refute > support {
            let cited = refuting.into_iter().cloned().collect::<Vec<_>>();
            let reasoning = format!(
                "{refute} relevant source(s) describe the claim as false or misleading ({}); \
                 {support} agree with it.",
                describe_sources(&cited)
            );
            let confidence = 50.0 + 10.0 * refute as f64 - 10.0 * support as f64;
            Verdict::new(claim, VerdictResult::Refuted, reasoning, cited, confidence.min(90.0))
        } else {
            let cited = supporting
                .into_iter()
                .chain(refuting)
                .cloned()
                .collect::<Vec<_>>();
            let reasoning = format!(
                "Relevant sources conflict: {support} agree and {refute} dispute the claim ({}).",
                describe_sources(&cited)
            );
            Verdict::new(claim, VerdictResult::Insufficient, reasoning, cited, 40.0)
        };
        Ok(verdict)
    }
}
