use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    adjudicator::GuardedAdjudicator,
    cancel::CancellationToken,
    continuation::{ContinuationPolicy, Decision},
    error::VerificationError,
    model::{dedupe_by_url, Claim, ClaimVerificationState, Evidence, Verdict},
    query::QueryGenerator,
    retriever::EvidenceRetriever,
    telemetry::{VerificationEvent, VerificationTelemetry},
};

/// States of the per-claim search loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Produce the next query.
    GenerateQuery,
    /// Run the query and accumulate evidence.
    RetrieveEvidence,
    /// Ask the continuation policy.
    DecideContinuation,
    /// Adjudicate the accumulated evidence. Terminal.
    Evaluate,
    /// Stopped by the caller. Terminal.
    Cancelled,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::GenerateQuery => "generate_query",
            Self::RetrieveEvidence => "retrieve_evidence",
            Self::DecideContinuation => "decide_continuation",
            Self::Evaluate => "evaluate",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopTransition {
    /// Claim id.
    pub claim_id: String,
    /// Previous state.
    pub from: LoopState,
    /// Next state.
    pub to: LoopState,
    /// Iteration at the time of the transition.
    pub iteration: usize,
    /// Evidence items accumulated so far.
    pub evidence: usize,
}

/// Callback invoked on every loop transition.
pub trait LoopObserver: Send + Sync {
    /// Called after `from` completes and before `to` runs.
    fn on_transition(
        &self,
        claim: &Claim,
        from: LoopState,
        to: LoopState,
        state: &ClaimVerificationState,
    );
}

/// Observer keeping every transition in memory.
#[derive(Debug, Default)]
pub struct TransitionLog {
    entries: Mutex<Vec<LoopTransition>>,
}

impl TransitionLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All transitions in arrival order.
    #[must_use]
    pub fn transitions(&self) -> Vec<LoopTransition> {
        self.entries.lock().clone()
    }

    /// Transitions of one claim in order.
    #[must_use]
    pub fn for_claim(&self, claim_id: &str) -> Vec<LoopTransition> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.claim_id == claim_id)
            .cloned()
            .collect()
    }
}

impl LoopObserver for TransitionLog {
    fn on_transition(
        &self,
        claim: &Claim,
        from: LoopState,
        to: LoopState,
        state: &ClaimVerificationState,
    ) {
        self.entries.lock().push(LoopTransition {
            claim_id: claim.id().to_string(),
            from,
            to,
            iteration: state.iteration,
            evidence: state.evidence.len(),
        });
    }
}

/// Iterative search for one claim: generate a query, retrieve, decide, and
/// finally adjudicate the accumulated evidence.
#[derive(Clone)]
pub struct EvidenceSearchLoop {
    retriever: Arc<EvidenceRetriever>,
    generator: Arc<dyn QueryGenerator>,
    policy: Arc<dyn ContinuationPolicy>,
    adjudicator: Arc<GuardedAdjudicator>,
    max_iterations: usize,
    pre_evaluate: bool,
    observers: Vec<Arc<dyn LoopObserver>>,
    telemetry: Option<VerificationTelemetry>,
}

impl fmt::Debug for EvidenceSearchLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceSearchLoop")
            .field("retriever", &self.retriever)
            .field("adjudicator", &self.adjudicator)
            .field("max_iterations", &self.max_iterations)
            .field("pre_evaluate", &self.pre_evaluate)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl EvidenceSearchLoop {
    /// Loop with a three-iteration ceiling and pre-evaluation enabled.
    #[must_use]
    pub fn new(
        retriever: Arc<EvidenceRetriever>,
        generator: Arc<dyn QueryGenerator>,
        policy: Arc<dyn ContinuationPolicy>,
        adjudicator: Arc<GuardedAdjudicator>,
    ) -> Self {
        Self {
            retriever,
            generator,
            policy,
            adjudicator,
            max_iterations: 3,
            pre_evaluate: true,
            observers: Vec::new(),
            telemetry: None,
        }
    }

    /// Hard ceiling on retrievals, applied regardless of the policy.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Toggles adjudication after each retrieval.
    #[must_use]
    pub fn with_pre_evaluate(mut self, pre_evaluate: bool) -> Self {
        self.pre_evaluate = pre_evaluate;
        self
    }

    /// Registers a transition observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<VerificationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Runs the loop to a verdict.
    pub async fn run(
        &self,
        claim: Claim,
        cancel: &CancellationToken,
    ) -> Result<Verdict, VerificationError> {
        self.drive(claim, cancel)
            .await?
            .verdict
            .ok_or_else(|| VerificationError::Aborted("search loop ended without a verdict".into()))
    }

    /// Runs the loop and returns the final per-claim state.
    pub async fn drive(
        &self,
        claim: Claim,
        cancel: &CancellationToken,
    ) -> Result<ClaimVerificationState, VerificationError> {
        let mut state = ClaimVerificationState::new(claim);
        let mut current = LoopState::GenerateQuery;
        loop {
            if cancel.is_cancelled() {
                self.transition(current, LoopState::Cancelled, &state);
                state.verdict = Some(self.cancelled_verdict(&state));
                return Ok(state);
            }
            let next = match current {
                LoopState::GenerateQuery => {
                    let query = tokio::select! {
                        query = self.generator.generate(&state.claim, state.iteration, &state) => query?,
                        () = cancel.cancelled() => continue,
                    };
                    self.emit(VerificationEvent::QueryIssued {
                        claim_id: state.claim.id().to_string(),
                        iteration: state.iteration,
                        query: query.clone(),
                    })
                    .await;
                    state.record_query(query);
                    LoopState::RetrieveEvidence
                }
                LoopState::RetrieveEvidence => {
                    let query = state.query.clone().unwrap_or_default();
                    let batch = tokio::select! {
                        batch = self.retriever.retrieve(&query) => batch,
                        () = cancel.cancelled() => continue,
                    };
                    self.record_batch(&mut state, batch).await;
                    if self.pre_evaluate {
                        let provisional = tokio::select! {
                            provisional = self.evaluate(&state) => provisional,
                            () = cancel.cancelled() => continue,
                        };
                        state.provisional = Some(provisional);
                    }
                    LoopState::DecideContinuation
                }
                LoopState::DecideContinuation => {
                    let decision = if state.retrievals >= self.max_iterations {
                        Decision::Stop
                    } else {
                        self.policy.decide(&state)
                    };
                    self.emit(VerificationEvent::ContinuationDecided {
                        claim_id: state.claim.id().to_string(),
                        iteration: state.iteration,
                        decision,
                    })
                    .await;
                    match decision {
                        Decision::Continue => {
                            state.iteration += 1;
                            LoopState::GenerateQuery
                        }
                        Decision::Stop => LoopState::Evaluate,
                    }
                }
                LoopState::Evaluate => {
                    let verdict = tokio::select! {
                        verdict = self.conclude(&state) => verdict,
                        () = cancel.cancelled() => continue,
                    };
                    self.emit(VerificationEvent::VerdictReached {
                        claim_id: verdict.claim_id.clone(),
                        result: verdict.result,
                        confidence: verdict.confidence,
                        cited: verdict.cited.len(),
                        degraded: verdict.degraded,
                    })
                    .await;
                    self.log(
                        LogLevel::Info,
                        "verification.loop.verdict",
                        json!({
                            "claim_id": verdict.claim_id,
                            "result": verdict.result,
                            "confidence": verdict.confidence,
                            "iterations": verdict.iterations,
                            "queries": state.queries,
                        }),
                    );
                    state.verdict = Some(verdict);
                    return Ok(state);
                }
                LoopState::Cancelled => {
                    state.verdict = Some(self.cancelled_verdict(&state));
                    return Ok(state);
                }
            };
            self.transition(current, next, &state);
            current = next;
        }
    }

    /// Adjudicates the evidence accumulated in `state`.
    pub async fn evaluate(&self, state: &ClaimVerificationState) -> Verdict {
        let mut verdict = self
            .adjudicator
            .evaluate(&state.claim, &state.evidence)
            .await;
        verdict.iterations = state.retrievals;
        verdict
    }

    async fn conclude(&self, state: &ClaimVerificationState) -> Verdict {
        // The provisional verdict already covers the full evidence set.
        match &state.provisional {
            Some(provisional) if !provisional.degraded => provisional.clone(),
            _ => self.evaluate(state).await,
        }
    }

    async fn record_batch(&self, state: &mut ClaimVerificationState, batch: Vec<Evidence>) {
        let count = batch.len();
        let sources = batch.iter().map(|item| item.url.clone()).collect::<Vec<_>>();
        state.retrievals += 1;
        let fresh = state.absorb(batch);
        self.log(
            LogLevel::Info,
            "verification.loop.retrieved",
            json!({
                "claim_id": state.claim.id(),
                "iteration": state.iteration,
                "count": count,
                "fresh": fresh,
                "sources": sources,
            }),
        );
        self.emit(VerificationEvent::EvidenceRetrieved {
            claim_id: state.claim.id().to_string(),
            iteration: state.iteration,
            count,
            total_unique: state.unique_evidence_count(),
            sources,
        })
        .await;
    }

    fn cancelled_verdict(&self, state: &ClaimVerificationState) -> Verdict {
        self.log(
            LogLevel::Warn,
            "verification.loop.cancelled",
            json!({ "claim_id": state.claim.id(), "retrievals": state.retrievals }),
        );
        let cited = dedupe_by_url(state.evidence.iter().cloned());
        let mut verdict = Verdict::insufficient(
            &state.claim,
            format!(
                "Verification was cancelled after {} search iteration(s); {} source(s) were gathered but not evaluated.",
                state.retrievals,
                cited.len()
            ),
            0.0,
        )
        .degraded();
        verdict.cited = cited;
        verdict.iterations = state.retrievals;
        verdict
    }

    fn transition(&self, from: LoopState, to: LoopState, state: &ClaimVerificationState) {
        for observer in &self.observers {
            observer.on_transition(&state.claim, from, to, state);
        }
        self.log(
            LogLevel::Debug,
            "verification.loop.transition",
            json!({
                "claim_id": state.claim.id(),
                "from": from,
                "to": to,
                "iteration": state.iteration,
            }),
        );
    }

    async fn emit(&self, event: VerificationEvent) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.emit(&event).await;
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        adjudicator::TermOverlapAdjudicator,
        continuation::BoundedContinuationPolicy,
        model::VerdictResult,
        providers::ProviderPayload,
        query::TemplateQueryGenerator,
        test_support::{
            fast_retriever, AlwaysContinue, ScriptedProvider, SlowAdjudicator, SlowProvider,
            StaticAdjudicator,
        },
    };
    use shared_event_bus::MemoryEventBus;

    fn search_loop(provider: Arc<ScriptedProvider>) -> EvidenceSearchLoop {
        EvidenceSearchLoop::new(
            Arc::new(fast_retriever(provider)),
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(BoundedContinuationPolicy::new(3, 80, 6)),
            Arc::new(GuardedAdjudicator::new(
                Arc::new(TermOverlapAdjudicator::new()),
                Duration::from_secs(1),
            )),
        )
    }

    fn paris_hits() -> Vec<Evidence> {
        vec![
            Evidence::new("https://a.example/1", "Eiffel Tower", "The Eiffel Tower is located in Paris."),
            Evidence::new("https://b.example/1", "Paris", "Paris is home to the Eiffel Tower."),
        ]
    }

    #[tokio::test]
    async fn zero_evidence_yields_low_confidence_verdict() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let verdict = search_loop(provider.clone())
            .run(Claim::new("c1", "Atlantis sank in 9600 BC"), &CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(verdict.result, VerdictResult::Supported);
        assert!(verdict.confidence <= 50);
        assert_eq!(verdict.iterations, 3);
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn always_continue_policy_still_terminates() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let log = Arc::new(TransitionLog::new());
        let search = EvidenceSearchLoop::new(
            Arc::new(fast_retriever(provider.clone())),
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(AlwaysContinue),
            Arc::new(GuardedAdjudicator::new(
                Arc::new(TermOverlapAdjudicator::new()),
                Duration::from_secs(1),
            )),
        )
        .with_max_iterations(2)
        .with_observer(log.clone());
        let verdict = search
            .run(Claim::new("c1", "claim text"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict.iterations, 2);
        assert_eq!(provider.calls().len(), 2);
        let last = log.transitions().last().cloned().unwrap();
        assert_eq!(
            (last.from, last.to),
            (LoopState::DecideContinuation, LoopState::Evaluate)
        );
    }

    #[tokio::test]
    async fn duplicate_urls_across_iterations_are_cited_once() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![Ok(ProviderPayload::Evidence(vec![paris_hits()[0].clone()]))])
                .with_default(paris_hits()),
        );
        let search = search_loop(provider.clone())
            .with_pre_evaluate(false)
            .with_max_iterations(2);
        let state = search
            .drive(
                Claim::new("c1", "The Eiffel Tower is located in Paris"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(state.evidence.len(), 3);
        assert_eq!(state.unique_evidence_count(), 2);
        let verdict = state.verdict.unwrap();
        assert_eq!(verdict.result, VerdictResult::Supported);
        assert_eq!(
            verdict.cited_urls(),
            vec!["https://a.example/1", "https://b.example/1"]
        );
    }

    #[tokio::test]
    async fn confident_provisional_verdict_stops_early() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_default(paris_hits()));
        let claim = Claim::new("c1", "The Eiffel Tower is located in Paris");
        let confident = Verdict::new(
            &claim,
            VerdictResult::Supported,
            "two sources",
            paris_hits(),
            92.0,
        );
        let search = EvidenceSearchLoop::new(
            Arc::new(fast_retriever(provider.clone())),
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(BoundedContinuationPolicy::new(3, 80, 6)),
            Arc::new(GuardedAdjudicator::new(
                Arc::new(StaticAdjudicator::new(confident)),
                Duration::from_secs(1),
            )),
        );
        let verdict = search.run(claim, &CancellationToken::new()).await.unwrap();
        assert_eq!(verdict.result, VerdictResult::Supported);
        assert_eq!(verdict.iterations, 1);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn evaluation_is_idempotent() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_default(paris_hits()));
        let search = search_loop(provider);
        let state = search
            .drive(
                Claim::new("c1", "The Eiffel Tower is located in Paris"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let first = search.evaluate(&state).await;
        let second = search.evaluate(&state).await;
        assert_eq!(first, second);
        assert_eq!(state.verdict.unwrap(), first);
    }

    #[tokio::test]
    async fn emits_progress_events() {
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = VerificationTelemetry::builder("verification")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_default(paris_hits()));
        let search = search_loop(provider).with_telemetry(Some(telemetry));
        search
            .run(
                Claim::new("c1", "The Eiffel Tower is located in Paris"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!bus.events_of_type("verification.query_issued").is_empty());
        assert!(!bus.events_of_type("verification.evidence_retrieved").is_empty());
        assert!(!bus.events_of_type("verification.continuation_decided").is_empty());
        assert_eq!(bus.events_of_type("verification.verdict_reached").len(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_retrieval() {
        let cancel = CancellationToken::new();
        let search = EvidenceSearchLoop::new(
            Arc::new(
                EvidenceRetriever::new(Arc::new(SlowProvider::new(Duration::from_secs(30)))),
            ),
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(BoundedContinuationPolicy::default()),
            Arc::new(GuardedAdjudicator::new(
                Arc::new(TermOverlapAdjudicator::new()),
                Duration::from_secs(1),
            )),
        );
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let verdict = tokio::time::timeout(
            Duration::from_secs(5),
            search.run(Claim::new("c1", "slow claim"), &cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(verdict.degraded);
        assert_eq!(verdict.result, VerdictResult::Insufficient);
        assert!(verdict.reasoning.contains("cancelled"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_adjudication() {
        for pre_evaluate in [true, false] {
            let cancel = CancellationToken::new();
            let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_default(paris_hits()));
            let adjudicator = Arc::new(SlowAdjudicator::new(Duration::from_secs(30)));
            let search = EvidenceSearchLoop::new(
                Arc::new(fast_retriever(provider)),
                Arc::new(TemplateQueryGenerator::new()),
                Arc::new(BoundedContinuationPolicy::new(1, 80, 6)),
                Arc::new(GuardedAdjudicator::new(adjudicator.clone(), Duration::from_secs(60))),
            )
            .with_pre_evaluate(pre_evaluate);
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trigger.cancel();
            });
            let verdict = tokio::time::timeout(
                Duration::from_secs(5),
                search.run(Claim::new("c1", "The Eiffel Tower is located in Paris"), &cancel),
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(adjudicator.calls(), 1);
            assert!(verdict.degraded);
            assert_eq!(verdict.result, VerdictResult::Insufficient);
            assert!(verdict.reasoning.contains("cancelled"));
            assert_eq!(verdict.cited.len(), 2);
        }
    }
}
