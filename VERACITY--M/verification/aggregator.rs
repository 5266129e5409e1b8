use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    model::{
        Claim, FactCheckReport, OverallVerdict, ReportSource, SourceReliability, Verdict,
        VerdictResult,
    },
    retriever::TrustedDomains,
    telemetry::VerificationTelemetry,
};

/// Summary used when no verdict carries reasoning.
pub const FALLBACK_SUMMARY: &str = "Analysis completed based on available evidence.";

const MIN_MAJORITY_CONFIDENCE: usize = 60;
const MAX_MAJORITY_CONFIDENCE: usize = 85;
const UNDECIDED_CONFIDENCE: u8 = 50;

/// Folds per-claim verdicts into a document-level report. Total: never fails.
#[derive(Debug, Clone, Default)]
pub struct ReportAggregator {
    trusted: TrustedDomains,
    telemetry: Option<VerificationTelemetry>,
}

impl ReportAggregator {
    /// Aggregator without a trusted-domain list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks sources on these domains as reliable.
    #[must_use]
    pub fn with_trusted(mut self, trusted: TrustedDomains) -> Self {
        self.trusted = trusted;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<VerificationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Builds the report for `claims` from `verdicts`.
    #[must_use]
    pub fn aggregate(&self, claims: &[Claim], verdicts: &[Verdict]) -> FactCheckReport {
        let verdicts = self.reconcile(claims, verdicts);
        let (overall_verdict, overall_confidence) = overall(&verdicts, claims.len());
        let sources = self.collect_sources(&verdicts);
        let reasonings = verdicts
            .iter()
            .map(|verdict| verdict.reasoning.trim())
            .filter(|reasoning| !reasoning.is_empty())
            .collect::<Vec<_>>();
        let summary = if reasonings.is_empty() {
            FALLBACK_SUMMARY.to_string()
        } else {
            reasonings.join(" ")
        };
        self.log(
            LogLevel::Info,
            "verification.report.aggregated",
            json!({
                "claims": claims.len(),
                "verdicts": verdicts.len(),
                "overall_verdict": overall_verdict,
                "confidence": overall_confidence,
                "sources": sources.len(),
            }),
        );
        FactCheckReport {
            claims: claims.to_vec(),
            verdicts,
            overall_verdict,
            overall_confidence,
            sources,
            timestamp: Utc::now(),
            summary,
        }
    }

    /// One verdict per known claim id, first wins, in verdict order.
    fn reconcile(&self, claims: &[Claim], verdicts: &[Verdict]) -> Vec<Verdict> {
        let known = claims.iter().map(Claim::id).collect::<HashSet<_>>();
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(verdicts.len());
        for verdict in verdicts {
            if !known.contains(verdict.claim_id.as_str()) {
                self.log(
                    LogLevel::Warn,
                    "verification.report.unknown_claim",
                    json!({ "claim_id": verdict.claim_id }),
                );
                continue;
            }
            if seen.insert(verdict.claim_id.as_str()) {
                kept.push(verdict.clone());
            } else {
                self.log(
                    LogLevel::Warn,
                    "verification.report.duplicate_verdict",
                    json!({ "claim_id": verdict.claim_id }),
                );
            }
        }
        if kept.len() < claims.len() {
            self.log(
                LogLevel::Warn,
                "verification.report.missing_verdicts",
                json!({ "claims": claims.len(), "verdicts": kept.len() }),
            );
        }
        kept
    }

    fn collect_sources(&self, verdicts: &[Verdict]) -> Vec<ReportSource> {
        let mut seen = HashSet::new();
        let mut sources = Vec::new();
        for evidence in verdicts.iter().flat_map(|verdict| verdict.cited.iter()) {
            if evidence.url.is_empty() || !seen.insert(evidence.url.as_str()) {
                continue;
            }
            sources.push(ReportSource {
                id: format!("source-{}", sources.len() + 1),
                title: evidence.title.clone(),
                url: evidence.url.clone(),
                domain: evidence.domain().unwrap_or_else(|| "unknown".into()),
                is_reliable: evidence.reliability == SourceReliability::Trusted
                    || self.trusted.is_trusted(&evidence.url),
            });
        }
        sources
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

/// Majority vote over supported and refuted counts. The winning share is
/// taken over every claim, so claims left without a verdict dilute it.
fn overall(verdicts: &[Verdict], claims: usize) -> (OverallVerdict, u8) {
    if verdicts.is_empty() {
        return (OverallVerdict::Unknown, UNDECIDED_CONFIDENCE);
    }
    let supported = count(verdicts, VerdictResult::Supported);
    let refuted = count(verdicts, VerdictResult::Refuted);
    let total = claims.max(verdicts.len());
    match supported.cmp(&refuted) {
        std::cmp::Ordering::Greater => (
            OverallVerdict::LikelyTrue,
            majority_confidence(supported, total),
        ),
        std::cmp::Ordering::Less => (
            OverallVerdict::LikelyFalse,
            majority_confidence(refuted, total),
        ),
        std::cmp::Ordering::Equal => (OverallVerdict::InsufficientEvidence, UNDECIDED_CONFIDENCE),
    }
}

fn count(verdicts: &[Verdict], result: VerdictResult) -> usize {
    verdicts
        .iter()
        .filter(|verdict| verdict.result == result)
        .count()
}

fn majority_confidence(winning: usize, total: usize) -> u8 {
    let share = winning * 100 / total.max(1);
    let bounded = share.clamp(MIN_MAJORITY_CONFIDENCE, MAX_MAJORITY_CONFIDENCE);
    u8::try_from(bounded).unwrap_or(UNDECIDED_CONFIDENCE)
}
