//! Error types surfaced by the broker and the cascade controller.

use crate::cascade::TierAttempt;
use chrono::{DateTime, Utc};

/// Stable error codes for the layer that maps errors to status codes.
pub mod error_codes {
    pub const QUOTA_EXCEEDED: &str = "QUOTA_EXCEEDED";
    pub const QUEUE_FULL: &str = "QUEUE_FULL";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const SESSION_ACTIVE: &str = "SESSION_ACTIVE";
    pub const SHUTDOWN: &str = "SHUTDOWN";
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    pub const INVALID_URL: &str = "INVALID_URL";
    pub const ALL_TIERS_FAILED: &str = "ALL_TIERS_FAILED";
}

/// Errors from the browser-session broker.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Monthly cost-unit quota is spent. Not retryable this period.
    #[error("Monthly browser quota exceeded: {used}/{quota} units used, resets at {resets_at}")]
    QuotaExceeded {
        used: u64,
        quota: u64,
        resets_at: DateTime<Utc>,
    },

    #[error("Browser session queue is full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    #[error("Timed out after {waited_ms}ms waiting for a browser session slot")]
    Timeout { waited_ms: u64 },

    #[error("Browser session already active: {0}")]
    SessionActive(String),

    #[error("Resource broker is shutting down")]
    Shutdown,

    /// Connecting to the provisioning service failed.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        use error_codes::*;
        match self {
            BrokerError::QuotaExceeded { .. } => QUOTA_EXCEEDED,
            BrokerError::QueueFull { .. } => QUEUE_FULL,
            BrokerError::Timeout { .. } => TIMEOUT,
            BrokerError::SessionActive(_) => SESSION_ACTIVE,
            BrokerError::Shutdown => SHUTDOWN,
            BrokerError::Connection(_) => CONNECTION_ERROR,
        }
    }

    /// Transient errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::QueueFull { .. } | BrokerError::Timeout { .. } | BrokerError::Connection(_)
        )
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors returned from `TierCascadeController::fetch`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Every tier in the cascade failed. `message` is the last failure.
    #[error("All render tiers failed: {message}")]
    AllTiersFailed {
        message: String,
        attempts: Vec<TierAttempt>,
    },
}

impl FetchError {
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => error_codes::INVALID_URL,
            FetchError::AllTiersFailed { .. } => error_codes::ALL_TIERS_FAILED,
        }
    }

    /// Attempt provenance, empty when nothing was attempted.
    pub fn attempts(&self) -> &[TierAttempt] {
        match self {
            FetchError::AllTiersFailed { attempts, .. } => attempts,
            FetchError::InvalidUrl(_) => &[],
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
