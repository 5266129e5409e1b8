use serde::{Deserialize, Serialize};

use crate::{
    config::SearchLoopConfig,
    model::{ClaimVerificationState, VerdictResult},
};

/// Outcome of a continuation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Run another search iteration.
    Continue,
    /// Proceed to evaluation.
    Stop,
}

/// Decides whether a claim's search loop runs another iteration.
///
/// Implementations must be deterministic in the state they are given.
pub trait ContinuationPolicy: Send + Sync {
    /// Inspects the per-claim state after a retrieval.
    fn decide(&self, state: &ClaimVerificationState) -> Decision;
}

/// Stops at an iteration cap, on a confident provisional verdict, or once
/// enough distinct sources were collected without pre-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedContinuationPolicy {
    max_iterations: usize,
    early_stop_confidence: u8,
    sufficient_evidence: usize,
}

impl BoundedContinuationPolicy {
    /// Creates a policy; `max_iterations` is raised to at least one.
    #[must_use]
    pub fn new(max_iterations: usize, early_stop_confidence: u8, sufficient_evidence: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            early_stop_confidence: early_stop_confidence.min(100),
            sufficient_evidence: sufficient_evidence.max(1),
        }
    }

    /// Policy matching the loop section of the configuration.
    #[must_use]
    pub fn from_config(config: &SearchLoopConfig) -> Self {
        Self::new(
            config.max_iterations,
            config.early_stop_confidence,
            config.sufficient_evidence,
        )
    }

    /// Iteration cap.
    #[must_use]
    pub const fn max_iterations(&self) -> usize {
        self.max_iterations
    }
}

impl Default for BoundedContinuationPolicy {
    fn default() -> Self {
        Self::from_config(&SearchLoopConfig::default())
    }
}

impl ContinuationPolicy for BoundedContinuationPolicy {
    fn decide(&self, state: &ClaimVerificationState) -> Decision {
        if state.retrievals >= self.max_iterations {
            return Decision::Stop;
        }
        match &state.provisional {
            Some(provisional)
                if provisional.result != VerdictResult::Insufficient
                    && provisional.confidence >= self.early_stop_confidence =>
            {
                Decision::Stop
            }
            None if state.unique_evidence_count() >= self.sufficient_evidence => Decision::Stop,
            _ => Decision::Continue,
        }
    }
}
