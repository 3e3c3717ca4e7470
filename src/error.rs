//! Error taxonomy for the orchestrator.
//!
//! Engine failures arrive as free text ([`EngineFailure`]) and are mapped onto
//! the closed [`ErrorKind`] set by [`crate::classify`]. Everything the
//! presentation layer sees is an [`OrchestratorError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidTargetIp,
    TestAlreadyRunning,
    RateLimitExceeded,
    DurationTooLong,
    CooldownActive,
    ResourceLimitExceeded,
    DeadMansSwitchTriggered,
    NetworkError,
    InternalError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidTargetIp => "invalid target ip",
            ErrorKind::TestAlreadyRunning => "test already running",
            ErrorKind::RateLimitExceeded => "rate limit exceeded",
            ErrorKind::DurationTooLong => "duration too long",
            ErrorKind::CooldownActive => "cooldown active",
            ErrorKind::ResourceLimitExceeded => "resource limit exceeded",
            ErrorKind::DeadMansSwitchTriggered => "dead man's switch triggered",
            ErrorKind::NetworkError => "network error",
            ErrorKind::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

/// A typed error with the original human-readable message attached.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct OrchestratorError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OrchestratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an engine failure. Transport failures that match no phrase
    /// are reported as network errors rather than internal ones.
    pub fn from_engine(failure: &EngineFailure) -> Self {
        let kind = match failure {
            EngineFailure::Rejected(msg) => crate::classify::classify(msg),
            EngineFailure::Transport(msg) => match crate::classify::classify(msg) {
                ErrorKind::InternalError => ErrorKind::NetworkError,
                other => other,
            },
        };
        Self::new(kind, failure.message())
    }
}

/// Raw failure reported by an engine call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineFailure {
    /// The engine understood the request and refused it. Never retried.
    #[error("engine rejected request: {0}")]
    Rejected(String),
    /// The request may not have reached the engine. Eligible for retry.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl EngineFailure {
    pub fn message(&self) -> &str {
        match self {
            EngineFailure::Rejected(m) | EngineFailure::Transport(m) => m,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineFailure::Transport(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineFailure>;
pub type Result<T> = std::result::Result<T, OrchestratorError>;
