use thiserror::Error;

/// Failures at the search provider boundary. Absorbed by the retriever.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The call exceeded its deadline.
    #[error("{provider} timed out after {after_ms} ms")]
    Timeout {
        /// Provider name.
        provider: String,
        /// Deadline in milliseconds.
        after_ms: u64,
    },
    /// Rate limit or quota exhausted.
    #[error("{provider} quota exceeded")]
    Quota {
        /// Provider name.
        provider: String,
    },
    /// Non-success HTTP status.
    #[error("{provider} returned HTTP {status}")]
    Status {
        /// Provider name.
        provider: String,
        /// Status code.
        status: u16,
    },
    /// Network or client failure.
    #[error("{provider} transport error: {detail}")]
    Transport {
        /// Provider name.
        provider: String,
        /// Error text.
        detail: String,
    },
    /// Response body did not have the expected shape.
    #[error("{provider} returned a malformed response: {detail}")]
    Malformed {
        /// Provider name.
        provider: String,
        /// Decoder error text.
        detail: String,
    },
}

impl ProviderError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Quota { .. } | Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Malformed { .. } => false,
        }
    }
}

/// Failures calling a language model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// The call exceeded its deadline.
    #[error("language model timed out after {0} ms")]
    Timeout(u64),
    /// Network or client failure.
    #[error("language model transport error: {0}")]
    Transport(String),
    /// Non-success HTTP status.
    #[error("language model returned HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },
    /// The response held no text candidate.
    #[error("language model returned no content")]
    EmptyResponse,
}

/// Failures producing a verdict. Absorbed by the guarded adjudicator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdjudicationError {
    /// The adjudication call exceeded its deadline.
    #[error("adjudication timed out after {0} ms")]
    Timeout(u64),
    /// Structured output could not be parsed.
    #[error("malformed adjudication output: {0}")]
    Malformed(String),
    /// The backing model failed.
    #[error(transparent)]
    Model(#[from] LlmError),
}

/// Startup failures. The only class that is not recovered locally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// No `[search]` section was configured.
    #[error("no search provider configured; add a [search] section")]
    MissingSearchProvider,
    /// A required secret is not present in the environment.
    #[error("{component} requires environment variable {var}")]
    MissingSecret {
        /// Component needing the secret.
        component: String,
        /// Variable name.
        var: String,
    },
    /// A numeric bound is out of range.
    #[error("invalid value for {field}: {detail}")]
    InvalidValue {
        /// Dotted field path.
        field: String,
        /// Explanation.
        detail: String,
    },
    /// A provider client could not be constructed.
    #[error("failed to initialise {component}: {detail}")]
    Client {
        /// Component name.
        component: String,
        /// Error text.
        detail: String,
    },
}

/// Per-claim pipeline failures, converted to degraded verdicts by the dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// The query generator produced no usable query.
    #[error("query generation failed: {0}")]
    QueryGeneration(String),
    /// The claim's task ended abnormally.
    #[error("verification task aborted: {0}")]
    Aborted(String),
}
