//! Unified error handling for sengate.
//!
//! One error type shared across all crates. Connection-establishment
//! failures carry their own variants because they drive different
//! backoff decisions; everything that happens inside a running poll
//! cycle is recovered at the cycle boundary and never terminates the
//! scheduler.

/// Unified error type for sengate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Operation attempted while a backend connection is not ready.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A required datum was absent from a backend read.
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Device identity is missing its serial number or IP address.
    #[error("Incomplete device identity: {0}")]
    IncompleteIdentity(String),

    /// Connection establishment exceeded its time ceiling.
    #[error("Connect timeout: {0}")]
    ConnectTimeout(String),

    /// The backend actively refused the connection.
    #[error("Connection refused: {0}")]
    ConnectRefused(String),

    /// Retry attempts or cumulative retry time exhausted.
    #[error("Retry budget exceeded: {0}")]
    RetryBudgetExceeded(String),

    /// Legacy text decode could not be completed.
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// The bus rejected or could not complete a publish.
    #[error("Publish failure: {0}")]
    PublishFailure(String),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key-value store errors not covered by a more specific kind.
    #[error("Store error: {0}")]
    Store(String),

    /// Bus errors not covered by a more specific kind.
    #[error("Bus error: {0}")]
    Bus(String),

    /// JSON (de)serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether this error should halt a connect-retry loop immediately.
    pub fn is_fatal_for_retry(&self) -> bool {
        matches!(
            self,
            Error::ConnectRefused(_) | Error::RetryBudgetExceeded(_)
        )
    }

    /// Whether this is a readiness error (backend not connected).
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Error::NotConnected(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result alias using the unified error type.
pub type Result<T> = std::result::Result<T, Error>;
