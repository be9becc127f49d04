use thiserror::Error;

/// Crate-wide error type.
///
/// Expected pipeline outcomes (risk rejections, idempotency duplicates) are
/// modeled as return values, not errors; these variants cover malformed
/// input, unavailable collaborators, and I/O failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or inconsistent input rejected at construction.
    #[error("validation error: {0}")]
    Validation(String),

    /// A broker or data connector is not connected.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// A broker adapter exists but cannot service the request.
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Transient I/O failure; candidate for retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Configuration failed validation; the previous config stays active.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Reconciliation found a critical divergence; escalates to kill-switch.
    #[error("critical reconciliation divergence: {0}")]
    ReconciliationCritical(String),

    #[error("storage error: {0}")]
    Storage(#[from] polars::error::PolarsError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// True when the error is worth retrying through the retry handler.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Io(_))
    }
}
