#![deny(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! Claim verification engine: per-claim evidence search loops, concurrent
//! dispatch with failure isolation, and document-level report aggregation.

/// Claims, evidence, verdicts and reports.
#[path = "../model.rs"]
pub mod model;

/// Error taxonomy for providers, adjudication, configuration and dispatch.
#[path = "../error.rs"]
pub mod error;

/// Term extraction shared by query generation and offline adjudication.
#[path = "../text.rs"]
pub mod text;

/// Caller-owned cancellation signal.
#[path = "../cancel.rs"]
pub mod cancel;

/// Structured logs and progress events.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// TOML configuration and secret resolution.
#[path = "../config.rs"]
pub mod config;

/// Language model seam and the Gemini client.
#[path = "../llm.rs"]
pub mod llm;

/// Search provider adapters.
#[path = "../providers/main.rs"]
pub mod providers;

/// Evidence retrieval with timeouts, retries and reliability biasing.
#[path = "../retriever.rs"]
pub mod retriever;

/// Search query generation.
#[path = "../query.rs"]
pub mod query;

/// Bounded continue/stop decisions.
#[path = "../continuation.rs"]
pub mod continuation;

/// Verdict production.
#[path = "../adjudicator/main.rs"]
pub mod adjudicator;

/// Per-claim evidence search state machine.
#[path = "../search_loop.rs"]
pub mod search_loop;

/// Fan-out/fan-in over claim batches.
#[path = "../dispatcher.rs"]
pub mod dispatcher;

/// Document-level report aggregation.
#[path = "../aggregator.rs"]
pub mod aggregator;

/// Runtime wiring configuration to the engine.
#[path = "../main.rs"]
pub mod runtime;

#[cfg(test)]
#[path = "../test_support.rs"]
pub(crate) mod test_support;

pub use adjudicator::{Adjudicator, GuardedAdjudicator, LlmAdjudicator, TermOverlapAdjudicator};
pub use aggregator::ReportAggregator;
pub use cancel::CancellationToken;
pub use config::VeracityConfig;
pub use continuation::{BoundedContinuationPolicy, ContinuationPolicy, Decision};
pub use dispatcher::VerificationDispatcher;
pub use error::{
    AdjudicationError, ConfigurationError, LlmError, ProviderError, VerificationError,
};
pub use llm::{GeminiModel, LanguageModel, Prompt};
pub use model::{
    Claim, ClaimVerificationState, Evidence, FactCheckReport, OverallVerdict, ReportSource,
    SourceReliability, Verdict, VerdictDigest, VerdictResult,
};
pub use providers::{ProviderPayload, SearchProvider};
pub use query::{LlmQueryGenerator, QueryGenerator, TemplateQueryGenerator};
pub use retriever::{EvidenceRetriever, RetrieverSettings, TrustedDomains};
pub use runtime::VerificationRuntime;
pub use search_loop::{EvidenceSearchLoop, LoopObserver, LoopState, LoopTransition, TransitionLog};
pub use telemetry::{VerificationEvent, VerificationTelemetry, VerificationTelemetryBuilder};
