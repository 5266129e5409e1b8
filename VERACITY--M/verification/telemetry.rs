use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, RotationPolicy};

use crate::{
    continuation::Decision,
    model::{OverallVerdict, VerdictResult},
};

/// Discrete progress events emitted at each major transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationEvent {
    /// A claim was handed to its search loop.
    ClaimDispatched {
        /// Claim id.
        claim_id: String,
        /// Claim text.
        claim_text: String,
        /// Position in the batch.
        position: usize,
        /// Batch size.
        batch_size: usize,
    },
    /// A search query was issued.
    QueryIssued {
        /// Claim id.
        claim_id: String,
        /// Zero-based iteration.
        iteration: usize,
        /// Query text.
        query: String,
    },
    /// A retrieval finished.
    EvidenceRetrieved {
        /// Claim id.
        claim_id: String,
        /// Zero-based iteration.
        iteration: usize,
        /// Snippets returned by this retrieval.
        count: usize,
        /// Distinct URLs accumulated so far.
        total_unique: usize,
        /// URLs returned by this retrieval.
        sources: Vec<String>,
    },
    /// The continuation policy decided.
    ContinuationDecided {
        /// Claim id.
        claim_id: String,
        /// Zero-based iteration.
        iteration: usize,
        /// Decision taken.
        decision: Decision,
    },
    /// A claim reached its terminal verdict.
    VerdictReached {
        /// Claim id.
        claim_id: String,
        /// Outcome.
        result: VerdictResult,
        /// Confidence.
        confidence: u8,
        /// Number of cited sources.
        cited: usize,
        /// Whether the verdict came from a failure path.
        degraded: bool,
    },
    /// Every dispatched claim produced a verdict.
    DispatchCompleted {
        /// Claims in the batch.
        claims: usize,
        /// Verdicts that came from failure paths.
        degraded: usize,
    },
    /// The report was aggregated.
    ReportAggregated {
        /// Overall verdict.
        overall_verdict: OverallVerdict,
        /// Overall confidence.
        confidence: u8,
        /// Distinct sources attached.
        sources: usize,
    },
}

impl VerificationEvent {
    /// Snake-case event kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ClaimDispatched { .. } => "claim_dispatched",
            Self::QueryIssued { .. } => "query_issued",
            Self::EvidenceRetrieved { .. } => "evidence_retrieved",
            Self::ContinuationDecided { .. } => "continuation_decided",
            Self::VerdictReached { .. } => "verdict_reached",
            Self::DispatchCompleted { .. } => "dispatch_completed",
            Self::ReportAggregated { .. } => "report_aggregated",
        }
    }

    /// Event type published on the bus (`verification.<kind>`).
    #[must_use]
    pub fn event_type(&self) -> String {
        format!("verification.{}", self.kind())
    }
}

/// Builder configuring telemetry for verification runs.
pub struct VerificationTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    rotation: RotationPolicy,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl VerificationTelemetryBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            rotation: RotationPolicy::default(),
            event_publisher: None,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the minimum level written to the log.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Overrides log rotation.
    #[must_use]
    pub fn rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    /// Assigns the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<VerificationTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_options(path, self.min_level, self.rotation)?),
            None => None,
        };
        Ok(VerificationTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the loop, dispatcher and aggregator.
#[derive(Clone)]
pub struct VerificationTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for VerificationTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger.is_some())
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl VerificationTelemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> VerificationTelemetryBuilder {
        VerificationTelemetryBuilder::new(module)
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes a progress event through the configured sink.
    pub async fn emit(&self, event: &VerificationEvent) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            let record = EventRecord::new(
                &self.inner.module,
                event.event_type(),
                serde_json::to_value(event)?,
            );
            publisher.publish(record).await?;
        }
        Ok(())
    }
}
