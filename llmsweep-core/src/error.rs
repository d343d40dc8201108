//! Error types for the llmsweep core.
//!
//! Errors are split along how far they propagate: configuration errors abort
//! the whole sweep, provisioning and health errors abort a single server
//! group, trial errors are recorded and the sweep moves on, and cleanup errors
//! are logged and never raised past the session guard.

use crate::provider::ResourceHandle;
use crate::server::{ServerEvent, ServerState};

/// Top-level error type for sweep operations.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Provisioning error: {0}")]
    Provision(String),

    #[error("Server start failed: {0}")]
    ServerStart(String),

    #[error("Server did not become healthy within {timeout_secs}s: {detail}")]
    HealthTimeout { timeout_secs: u64, detail: String },

    #[error("Trial execution error: {0}")]
    TrialExecution(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Illegal server transition from {from} on {event}")]
    IllegalTransition { from: ServerState, event: ServerEvent },

    #[error("Cloud API error: {message}")]
    Api { message: String, transient: bool },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl SweepError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn provision(msg: impl Into<String>) -> Self {
        Self::Provision(msg.into())
    }

    pub fn server_start(msg: impl Into<String>) -> Self {
        Self::ServerStart(msg.into())
    }

    pub fn trial(msg: impl Into<String>) -> Self {
        Self::TrialExecution(msg.into())
    }

    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    pub fn api(msg: impl Into<String>, transient: bool) -> Self {
        Self::Api {
            message: msg.into(),
            transient,
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Rate limits, server-side API faults, dropped connections and request
    /// timeouts are transient. Authentication, quota and validation failures
    /// are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { transient, .. } => *transient,
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e
                        .status()
                        .is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            Self::Timeout(_) | Self::Connection(_) => true,
            _ => false,
        }
    }
}

/// Result alias for sweep operations.
pub type Result<T> = std::result::Result<T, SweepError>;

/// Error returned by [`crate::provider::ResourceProvider::acquire`].
///
/// When acquisition fails after something billable was already created (for
/// example a cloud instance that never became reachable) the handle to it is
/// carried in `partial` so the caller can release it.
#[derive(Debug)]
pub struct AcquireFailure {
    pub error: SweepError,
    pub partial: Option<ResourceHandle>,
}

impl AcquireFailure {
    pub fn with_partial(error: SweepError, partial: ResourceHandle) -> Self {
        Self {
            error,
            partial: Some(partial),
        }
    }
}

impl From<SweepError> for AcquireFailure {
    fn from(error: SweepError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

impl std::fmt::Display for AcquireFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.partial {
            Some(handle) => write!(f, "{} (partial resource {})", self.error, handle.describe()),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for AcquireFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
