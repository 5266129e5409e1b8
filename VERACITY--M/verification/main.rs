use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::json;
use shared_event_bus::{EventPublisher, FanoutPublisher, FileEventPublisher};
use shared_logging::LogLevel;

use crate::{
    adjudicator::{Adjudicator, GuardedAdjudicator, LlmAdjudicator, TermOverlapAdjudicator},
    aggregator::ReportAggregator,
    cancel::CancellationToken,
    config::{env_lookup, VeracityConfig},
    continuation::BoundedContinuationPolicy,
    dispatcher::VerificationDispatcher,
    llm::{build_language_model, LanguageModel},
    model::{Claim, FactCheckReport},
    providers::build_provider,
    query::{LlmQueryGenerator, QueryGenerator, TemplateQueryGenerator},
    retriever::{EvidenceRetriever, RetrieverSettings, TrustedDomains},
    search_loop::EvidenceSearchLoop,
    telemetry::{VerificationEvent, VerificationTelemetry},
};

/// Verifies claim batches end to end: dispatch, per-claim search loops, aggregation.
#[derive(Debug)]
pub struct VerificationRuntime {
    config: VeracityConfig,
    dispatcher: VerificationDispatcher,
    aggregator: ReportAggregator,
    telemetry: Option<VerificationTelemetry>,
}

impl VerificationRuntime {
    /// Builds the runtime from configuration, reading secrets from the environment.
    pub fn from_config(config: VeracityConfig) -> Result<Self> {
        Self::from_config_with(config, &env_lookup, None)
    }

    /// Builds the runtime with an explicit secret lookup. Events go to the
    /// configured event log and to `publisher`, when given.
    pub fn from_config_with(
        config: VeracityConfig,
        lookup: &dyn Fn(&str) -> Option<String>,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Result<Self> {
        config.validate()?;
        let telemetry = build_telemetry(&config, publisher)?;
        let search = config.search()?;

        let provider = build_provider(search, lookup)?;
        let trusted = TrustedDomains::new(config.trusted_domains()?);
        let retriever = EvidenceRetriever::new(provider)
            .with_trusted(trusted.clone())
            .with_settings(RetrieverSettings::from_config(search))
            .with_telemetry(telemetry.clone());

        let loop_config = &config.search_loop;
        let (generator, adjudicator): (Arc<dyn QueryGenerator>, Arc<dyn Adjudicator>) =
            match build_language_model(&config.language_model, lookup)? {
                Some(model) => {
                    let model: Arc<dyn LanguageModel> = Arc::new(model);
                    let generator = LlmQueryGenerator::new(
                        Arc::clone(&model),
                        Duration::from_millis(loop_config.query_timeout_ms),
                    )
                    .with_telemetry(telemetry.clone());
                    (Arc::new(generator), Arc::new(LlmAdjudicator::new(model)))
                }
                None => (
                    Arc::new(TemplateQueryGenerator::new()),
                    Arc::new(TermOverlapAdjudicator::new()),
                ),
            };
        let guarded = GuardedAdjudicator::new(
            adjudicator,
            Duration::from_millis(loop_config.adjudication_timeout_ms),
        )
        .with_telemetry(telemetry.clone());

        let search_loop = EvidenceSearchLoop::new(
            Arc::new(retriever),
            generator,
            Arc::new(BoundedContinuationPolicy::from_config(loop_config)),
            Arc::new(guarded),
        )
        .with_max_iterations(loop_config.max_iterations)
        .with_pre_evaluate(loop_config.pre_evaluate)
        .with_telemetry(telemetry.clone());
        let dispatcher = VerificationDispatcher::new(search_loop)
            .with_max_concurrent(config.dispatch.max_concurrent_claims)
            .with_telemetry(telemetry.clone());
        let aggregator = ReportAggregator::new()
            .with_trusted(trusted)
            .with_telemetry(telemetry.clone());

        if let Some(tel) = &telemetry {
            let _ = tel.log(
                LogLevel::Info,
                "verification.runtime.ready",
                json!({
                    "provider": search.provider.name(),
                    "language_model": config.language_model.name(),
                    "max_iterations": loop_config.max_iterations,
                    "max_concurrent_claims": config.dispatch.max_concurrent_claims,
                }),
            );
        }
        Ok(Self::from_parts(config, dispatcher, aggregator, telemetry))
    }

    /// Assembles a runtime from prebuilt components.
    #[must_use]
    pub const fn from_parts(
        config: VeracityConfig,
        dispatcher: VerificationDispatcher,
        aggregator: ReportAggregator,
        telemetry: Option<VerificationTelemetry>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            aggregator,
            telemetry,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &VeracityConfig {
        &self.config
    }

    /// Verifies `claims` and aggregates the report.
    pub async fn verify(&self, claims: &[Claim]) -> FactCheckReport {
        self.verify_with_cancel(claims, &CancellationToken::new())
            .await
    }

    /// Like [`verify`](Self::verify); cancelled claims get degraded verdicts.
    pub async fn verify_with_cancel(
        &self,
        claims: &[Claim],
        cancel: &CancellationToken,
    ) -> FactCheckReport {
        let verdicts = self.dispatcher.dispatch_with_cancel(claims, cancel).await;
        let report = self.aggregator.aggregate(claims, &verdicts);
        if let Some(tel) = &self.telemetry {
            let _ = tel
                .emit(&VerificationEvent::ReportAggregated {
                    overall_verdict: report.overall_verdict,
                    confidence: report.overall_confidence,
                    sources: report.sources.len(),
                })
                .await;
        }
        report
    }
}

fn build_telemetry(
    config: &VeracityConfig,
    publisher: Option<Arc<dyn EventPublisher>>,
) -> Result<Option<VerificationTelemetry>> {
    let settings = &config.telemetry;
    let file = match &settings.event_log {
        Some(path) => Some(Arc::new(FileEventPublisher::new(path)?) as Arc<dyn EventPublisher>),
        None => None,
    };
    let publisher: Option<Arc<dyn EventPublisher>> = match (file, publisher) {
        (Some(file), Some(extra)) => Some(Arc::new(FanoutPublisher::new(vec![file, extra]))),
        (file, extra) => file.or(extra),
    };
    if settings.log_path.is_none() && publisher.is_none() {
        return Ok(None);
    }
    let mut builder = VerificationTelemetry::builder("verification")
        .min_level(settings.min_level)
        .rotation(settings.rotation());
    if let Some(path) = &settings.log_path {
        builder = builder.log_path(path);
    }
    if let Some(publisher) = publisher {
        builder = builder.event_publisher(publisher);
    }
    builder
        .build()
        .map(Some)
        .context("initialising verification telemetry")
}
