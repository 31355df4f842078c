/// Why a single dispatch did not succeed.
///
/// Transports report failures through this tagged variant so retry predicates
/// never have to inspect transport-specific error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FailureKind {
    /// No response was obtained: connection refused, timeout, reset, offline.
    #[error("network error: {0}")]
    Network(String),
    /// A response was obtained with a non-success status code.
    #[error("http status {0}")]
    HttpStatus(u16),
    /// Anything else the transport could not classify.
    #[error("{0}")]
    Other(String),
}

impl FailureKind {
    /// Builds a network-class failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Builds an unclassified failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Returns the HTTP status carried by this failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus(status) => Some(*status),
            _ => None,
        }
    }
}

/// Coarse classification of a failed dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// No response obtained.
    Transport,
    /// Server-class, timeout or rate-limit status (`>= 500`, 408, 429 or 0).
    Server(u16),
    /// Any other 4xx status.
    Client(u16),
    /// Neither of the above.
    Other,
}

impl ErrorClass {
    /// Classifies a status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            0 | 408 | 429 => Self::Server(status),
            500..=u16::MAX => Self::Server(status),
            400..=499 => Self::Client(status),
            _ => Self::Other,
        }
    }

    /// Whether the default policy retries this class.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport | Self::Server(_))
    }
}

/// Terminal failure delivered to a caller whose request was queued.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// The request failed on every allowed attempt.
    #[error("request to {url} failed after {attempts} retries: {cause}")]
    RetriesExhausted {
        /// Original request URL.
        url: String,
        /// Number of retries performed.
        attempts: u32,
        /// Last observed failure.
        cause: FailureKind,
    },
    /// The pending request was discarded by `clear_pending_requests` or `stop`.
    #[error("pending request was cleared")]
    Cleared,
    /// A failure the policy does not retry and that carried no response.
    #[error("request to {url} failed: {cause}")]
    Failed {
        /// Original request URL.
        url: String,
        /// The failure that ended the request.
        cause: FailureKind,
    },
}

impl RetryError {
    /// Whether the request was discarded by intentional teardown.
    pub fn is_cleared(&self) -> bool {
        matches!(self, Self::Cleared)
    }

    /// Whether the request ran out of retries.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// Error type for engine lifecycle and configuration.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `start` was called outside of a tokio runtime.
    #[error("no tokio runtime available to run the retry loop")]
    NoRuntime,
    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}
