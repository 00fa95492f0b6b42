//! Relay error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while routing danmaku events.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid subscription rule or router configuration. Rejected
    /// synchronously; never leaves partial state behind.
    #[error("Config error: {0}")]
    Config(String),

    /// An upstream connection could not be established or maintained.
    #[error("Connect error: {0}")]
    Connect(String),

    /// An outbound delivery failed for one destination.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// The shared counter store backing the rate limiter is unreachable.
    #[error("Rate limiter unavailable: {0}")]
    LimiterUnavailable(String),

    /// Source adapter error.
    #[error(transparent)]
    Danmu(#[from] danmu::DanmuError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connect error.
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a delivery error.
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
