//! Hand-written stand-ins for providers, models and adjudicators.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    adjudicator::{overlap::TermOverlapAdjudicator, Adjudicator},
    continuation::{ContinuationPolicy, Decision},
    error::{AdjudicationError, LlmError, ProviderError, VerificationError},
    llm::{LanguageModel, Prompt},
    model::{Claim, ClaimVerificationState, Evidence, Verdict},
    providers::{ProviderPayload, SearchProvider},
    query::{QueryGenerator, TemplateQueryGenerator},
    retriever::{EvidenceRetriever, RetrieverSettings},
};

/// Retriever bounds suited to tests: short deadline, near-zero backoff.
pub fn fast_settings() -> RetrieverSettings {
    RetrieverSettings {
        max_results: 5,
        timeout: Duration::from_millis(100),
        retries: 2,
        backoff: Duration::from_millis(1),
        max_bias_domains: 10,
    }
}

pub fn fast_retriever(provider: Arc<dyn SearchProvider>) -> EvidenceRetriever {
    EvidenceRetriever::new(provider).with_settings(fast_settings())
}

/// Replays queued responses, then serves `default` evidence.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ProviderPayload, ProviderError>>>,
    default: Vec<Evidence>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<ProviderPayload, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            default: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, default: Vec<Evidence>) -> Self {
        self.default = default;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SearchProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn search(&self, query: &str, _limit: usize) -> Result<ProviderPayload, ProviderError> {
        self.calls.lock().push(query.to_string());
        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| Ok(ProviderPayload::Evidence(self.default.clone())))
    }
}

/// Serves evidence keyed by a word in the query; fails for queries containing `fail_on`.
pub struct KeyedProvider {
    fail_on: String,
    evidence: Vec<Evidence>,
}

impl KeyedProvider {
    pub fn new(fail_on: impl Into<String>, evidence: Vec<Evidence>) -> Self {
        Self {
            fail_on: fail_on.into(),
            evidence,
        }
    }
}

#[async_trait]
impl SearchProvider for KeyedProvider {
    fn name(&self) -> &str {
        "keyed"
    }

    async fn search(&self, query: &str, _limit: usize) -> Result<ProviderPayload, ProviderError> {
        if query.to_lowercase().contains(&self.fail_on) {
            return Err(ProviderError::Transport {
                provider: "keyed".into(),
                detail: "connection reset".into(),
            });
        }
        Ok(ProviderPayload::Evidence(self.evidence.clone()))
    }
}

/// Sleeps past any reasonable deadline; counts the searches it started.
pub struct SlowProvider {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<ProviderPayload, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ProviderPayload::Evidence(Vec::new()))
    }
}

/// Replays queued completions and records prompts.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
        self.prompts.lock().push(prompt.clone());
        let next = self.responses.lock().pop_front();
        next.unwrap_or(Err(LlmError::EmptyResponse))
    }
}

/// Answers with a fixed query after `delay`.
pub struct SlowModel {
    delay: Duration,
}

impl SlowModel {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl LanguageModel for SlowModel {
    fn name(&self) -> &str {
        "slow-model"
    }

    async fn complete(&self, _prompt: &Prompt) -> Result<String, LlmError> {
        tokio::time::sleep(self.delay).await;
        Ok("late model query".into())
    }
}

/// Returns the same verdict, rebound to the evaluated claim.
pub struct StaticAdjudicator {
    verdict: Verdict,
}

impl StaticAdjudicator {
    pub fn new(verdict: Verdict) -> Self {
        Self { verdict }
    }
}

#[async_trait]
impl Adjudicator for StaticAdjudicator {
    fn name(&self) -> &str {
        "static"
    }

    async fn evaluate(&self, _claim: &Claim, _evidence: &[Evidence]) -> Result<Verdict, AdjudicationError> {
        Ok(self.verdict.clone())
    }
}

/// Defers to term overlap after `delay`; counts its calls.
pub struct SlowAdjudicator {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowAdjudicator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adjudicator for SlowAdjudicator {
    fn name(&self) -> &str {
        "slow"
    }

    async fn evaluate(&self, claim: &Claim, evidence: &[Evidence]) -> Result<Verdict, AdjudicationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        TermOverlapAdjudicator::new().evaluate(claim, evidence).await
    }
}

/// Fails the first `failures` calls with malformed output, then defers to term overlap.
pub struct FlakyAdjudicator {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyAdjudicator {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adjudicator for FlakyAdjudicator {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn evaluate(&self, claim: &Claim, evidence: &[Evidence]) -> Result<Verdict, AdjudicationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(AdjudicationError::Malformed(format!("scripted failure {call}")));
        }
        TermOverlapAdjudicator::new().evaluate(claim, evidence).await
    }
}

/// Panics for one claim id; term overlap for the rest.
pub struct PanickingAdjudicator {
    claim_id: String,
}

impl PanickingAdjudicator {
    pub fn new(claim_id: impl Into<String>) -> Self {
        Self {
            claim_id: claim_id.into(),
        }
    }
}

#[async_trait]
impl Adjudicator for PanickingAdjudicator {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn evaluate(&self, claim: &Claim, evidence: &[Evidence]) -> Result<Verdict, AdjudicationError> {
        assert!(claim.id() != self.claim_id, "adjudicator exploded on {}", claim.id());
        TermOverlapAdjudicator::new().evaluate(claim, evidence).await
    }
}

/// Fails query generation for one claim id.
pub struct FailingQueryGenerator {
    claim_id: String,
}

impl FailingQueryGenerator {
    pub fn new(claim_id: impl Into<String>) -> Self {
        Self {
            claim_id: claim_id.into(),
        }
    }
}

#[async_trait]
impl QueryGenerator for FailingQueryGenerator {
    async fn generate(
        &self,
        claim: &Claim,
        iteration: usize,
        state: &ClaimVerificationState,
    ) -> Result<String, VerificationError> {
        if claim.id() == self.claim_id {
            return Err(VerificationError::QueryGeneration("generator offline".into()));
        }
        TemplateQueryGenerator::new().generate(claim, iteration, state).await
    }
}

/// Never stops on its own.
pub struct AlwaysContinue;

impl ContinuationPolicy for AlwaysContinue {
    fn decide(&self, _state: &ClaimVerificationState) -> Decision {
        Decision::Continue
    }
}
