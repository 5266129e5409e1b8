use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};

use crate::{
    cancel::CancellationToken,
    error::VerificationError,
    model::{Claim, Verdict},
    search_loop::EvidenceSearchLoop,
    telemetry::{VerificationEvent, VerificationTelemetry},
};

/// Fans claims out to independent search loops and waits for every verdict.
/// Dropping a dispatch in flight aborts its outstanding claim tasks.
#[derive(Debug, Clone)]
pub struct VerificationDispatcher {
    search_loop: Arc<EvidenceSearchLoop>,
    max_concurrent: usize,
    telemetry: Option<VerificationTelemetry>,
}

impl VerificationDispatcher {
    /// Dispatcher running at most eight claims at a time.
    #[must_use]
    pub fn new(search_loop: EvidenceSearchLoop) -> Self {
        Self {
            search_loop: Arc::new(search_loop),
            max_concurrent: 8,
            telemetry: None,
        }
    }

    /// Bounds the number of claims verified at once.
    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<VerificationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Verifies every claim; one verdict per claim, in input order.
    pub async fn dispatch(&self, claims: &[Claim]) -> Vec<Verdict> {
        self.dispatch_with_cancel(claims, &CancellationToken::new())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), observing a caller-owned cancel signal.
    pub async fn dispatch_with_cancel(
        &self,
        claims: &[Claim],
        cancel: &CancellationToken,
    ) -> Vec<Verdict> {
        if claims.is_empty() {
            return Vec::new();
        }
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        for (position, claim) in claims.iter().enumerate() {
            self.emit(VerificationEvent::ClaimDispatched {
                claim_id: claim.id().to_string(),
                claim_text: claim.text().to_string(),
                position,
                batch_size: claims.len(),
            })
            .await;
            let search_loop = Arc::clone(&self.search_loop);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let claim = claim.clone();
            let run = async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|err| VerificationError::Aborted(err.to_string()))?;
                search_loop.run(claim, &cancel).await
            };
            tasks.spawn(async move { (position, AssertUnwindSafe(run).catch_unwind().await) });
        }
        let mut slots = std::iter::repeat_with(|| None)
            .take(claims.len())
            .collect::<Vec<Option<Verdict>>>();
        while let Some(joined) = tasks.join_next().await {
            let (position, outcome) = match joined {
                Ok(tagged) => tagged,
                Err(join_err) => {
                    self.log(
                        LogLevel::Warn,
                        "verification.dispatch.task_lost",
                        json!({ "error": describe_join_error(&join_err) }),
                    );
                    continue;
                }
            };
            let claim = &claims[position];
            slots[position] = Some(match outcome {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(err)) => self.degraded(claim, &err.to_string()),
                Err(_) => self.degraded(claim, "verification task panicked"),
            });
        }
        let verdicts = claims
            .iter()
            .zip(slots)
            .map(|(claim, slot)| {
                slot.unwrap_or_else(|| self.degraded(claim, "verification task was cancelled"))
            })
            .collect::<Vec<_>>();
        let degraded = verdicts.iter().filter(|verdict| verdict.degraded).count();
        self.log(
            LogLevel::Info,
            "verification.dispatch.completed",
            json!({ "claims": claims.len(), "degraded": degraded }),
        );
        self.emit(VerificationEvent::DispatchCompleted {
            claims: claims.len(),
            degraded,
        })
        .await;
        verdicts
    }

    fn degraded(&self, claim: &Claim, reason: &str) -> Verdict {
        self.log(
            LogLevel::Error,
            "verification.dispatch.claim_failed",
            json!({ "claim_id": claim.id(), "error": reason }),
        );
        Verdict::insufficient(
            claim,
            format!("Verification could not be completed: {reason}."),
            0.0,
        )
        .degraded()
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

fn describe_join_error(err: &JoinError) -> String {
    if err.is_panic() {
        "verification task panicked".into()
    } else {
        "verification task was cancelled".into()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        adjudicator::{Adjudicator, GuardedAdjudicator, TermOverlapAdjudicator},
        continuation::BoundedContinuationPolicy,
        model::{Evidence, VerdictResult},
        providers::SearchProvider,
        query::{QueryGenerator, TemplateQueryGenerator},
        test_support::{
            fast_retriever, FailingQueryGenerator, KeyedProvider, PanickingAdjudicator,
            ScriptedProvider, SlowProvider,
        },
    };
    use shared_event_bus::MemoryEventBus;

    fn hits() -> Vec<Evidence> {
        vec![
            Evidence::new("https://a.example/1", "Eiffel Tower", "The Eiffel Tower is located in Paris."),
            Evidence::new("https://b.example/1", "Mount Everest", "Mount Everest is the highest mountain."),
        ]
    }

    fn dispatcher_with(
        provider: Arc<dyn SearchProvider>,
        generator: Arc<dyn QueryGenerator>,
        adjudicator: Arc<dyn Adjudicator>,
    ) -> VerificationDispatcher {
        VerificationDispatcher::new(EvidenceSearchLoop::new(
            Arc::new(fast_retriever(provider)),
            generator,
            Arc::new(BoundedContinuationPolicy::new(2, 80, 6)),
            Arc::new(GuardedAdjudicator::new(adjudicator, Duration::from_secs(1))),
        ))
    }

    fn default_dispatcher() -> VerificationDispatcher {
        dispatcher_with(
            Arc::new(ScriptedProvider::new(Vec::new()).with_default(hits())),
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(TermOverlapAdjudicator::new()),
        )
    }

    fn claims() -> Vec<Claim> {
        vec![
            Claim::new("a", "Mount Everest is the highest mountain"),
            Claim::new("b", "The Eiffel Tower is located in Paris"),
        ]
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        assert!(default_dispatcher().dispatch(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn preserves_input_order_under_bounded_concurrency() {
        let claims = (0..6)
            .map(|i| Claim::new(format!("c{i}"), format!("The Eiffel Tower claim {i}")))
            .collect::<Vec<_>>();
        let verdicts = default_dispatcher()
            .with_max_concurrent(2)
            .dispatch(&claims)
            .await;
        let ids = verdicts
            .iter()
            .map(|verdict| verdict.claim_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["c0", "c1", "c2", "c3", "c4", "c5"]);
    }

    #[tokio::test]
    async fn loop_error_is_isolated_to_its_claim() {
        let baseline = default_dispatcher().dispatch(&claims()[1..]).await;
        let dispatcher = dispatcher_with(
            Arc::new(ScriptedProvider::new(Vec::new()).with_default(hits())),
            Arc::new(FailingQueryGenerator::new("a")),
            Arc::new(TermOverlapAdjudicator::new()),
        );
        let verdicts = dispatcher.dispatch(&claims()).await;
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].result, VerdictResult::Insufficient);
        assert!(verdicts[0].degraded);
        assert!(verdicts[0].reasoning.contains("generator offline"));
        assert_eq!(verdicts[1], baseline[0]);
    }

    #[tokio::test]
    async fn panicking_task_is_isolated() {
        let dispatcher = dispatcher_with(
            Arc::new(ScriptedProvider::new(Vec::new()).with_default(hits())),
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(PanickingAdjudicator::new("a")),
        );
        let verdicts = dispatcher.dispatch(&claims()).await;
        assert!(verdicts[0].degraded);
        assert!(verdicts[0].reasoning.contains("panicked"));
        assert_eq!(verdicts[1].result, VerdictResult::Supported);
        assert!(!verdicts[1].degraded);
    }

    #[tokio::test]
    async fn provider_failure_for_one_claim_leaves_siblings_unchanged() {
        let provider: Arc<dyn SearchProvider> = Arc::new(KeyedProvider::new("everest", hits()));
        let alone = dispatcher_with(
            provider.clone(),
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(TermOverlapAdjudicator::new()),
        )
        .dispatch(&claims()[1..])
        .await;
        let together = dispatcher_with(
            provider,
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(TermOverlapAdjudicator::new()),
        )
        .dispatch(&claims())
        .await;
        assert_eq!(together[0].result, VerdictResult::Insufficient);
        assert!(together[0].confidence <= 50);
        assert_eq!(together[1], alone[0]);
    }

    #[tokio::test]
    async fn cancelled_dispatch_returns_degraded_verdicts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let verdicts = default_dispatcher()
            .dispatch_with_cancel(&claims(), &cancel)
            .await;
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts.iter().all(|verdict| verdict.degraded));
    }

    #[tokio::test]
    async fn dropping_dispatch_stops_outstanding_claims() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(20)));
        let dispatcher = dispatcher_with(
            provider.clone(),
            Arc::new(TemplateQueryGenerator::new()),
            Arc::new(TermOverlapAdjudicator::new()),
        )
        .with_max_concurrent(1);
        let claims = (0..4)
            .map(|i| Claim::new(format!("c{i}"), format!("The Eiffel Tower claim {i}")))
            .collect::<Vec<_>>();
        let outcome =
            tokio::time::timeout(Duration::from_millis(5), dispatcher.dispatch(&claims)).await;
        assert!(outcome.is_err());
        let calls_at_drop = provider.calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(provider.calls(), calls_at_drop);
    }

    #[tokio::test]
    async fn emits_dispatch_events() {
        let bus = Arc::new(MemoryEventBus::new(128));
        let telemetry = VerificationTelemetry::builder("verification")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        default_dispatcher()
            .with_telemetry(Some(telemetry))
            .dispatch(&claims())
            .await;
        assert_eq!(bus.events_of_type("verification.claim_dispatched").len(), 2);
        let completed = bus.events_of_type("verification.dispatch_completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].payload["claims"], 2);
    }
}
