//! Typed, retrying wrapper around an [`ExecutionEngine`].
//!
//! Call policy:
//! - `start`, `stop`, `status`, `metrics`, `current_session`: bounded retry
//!   on transport failures ([`retry::with_retry`]).
//! - `validate_target`: single attempt, for immediate feedback.
//! - `keepalive`: single attempt, failures logged and swallowed.
//!
//! Every failure leaves this module as an [`OrchestratorError`].

pub mod retry;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::engine::{EngineEvent, ExecutionEngine};
use crate::error::{OrchestratorError, Result};
use crate::model::{SessionMetrics, TestConfiguration, TestSession, TestStatus};

pub use retry::RetryPolicy;

/// Cloneable handle to the engine with the call policy applied.
#[derive(Clone)]
pub struct EngineClient {
    engine: Arc<dyn ExecutionEngine>,
    retry: RetryPolicy,
}

impl EngineClient {
    pub fn new(engine: Arc<dyn ExecutionEngine>, retry: RetryPolicy) -> Self {
        Self { engine, retry }
    }

    pub async fn validate_target(&self, ip: &str) -> Result<bool> {
        self.engine
            .validate_target(ip)
            .await
            .map_err(|e| OrchestratorError::from_engine(&e))
    }

    pub async fn start(&self, config: &TestConfiguration) -> Result<String> {
        retry::with_retry(&self.retry, "start", move || self.engine.start(config))
            .await
            .map_err(|e| OrchestratorError::from_engine(&e))
    }

    pub async fn stop(&self) -> Result<()> {
        retry::with_retry(&self.retry, "stop", move || self.engine.stop())
            .await
            .map_err(|e| OrchestratorError::from_engine(&e))
    }

    pub async fn status(&self) -> Result<TestStatus> {
        retry::with_retry(&self.retry, "status", move || self.engine.status())
            .await
            .map_err(|e| OrchestratorError::from_engine(&e))
    }

    pub async fn metrics(&self) -> Result<SessionMetrics> {
        retry::with_retry(&self.retry, "metrics", move || self.engine.metrics())
            .await
            .map(SessionMetrics::sanitized)
            .map_err(|e| OrchestratorError::from_engine(&e))
    }

    pub async fn current_session(&self) -> Result<Option<TestSession>> {
        retry::with_retry(&self.retry, "current_session", move || self.engine.current_session())
            .await
            .map_err(|e| OrchestratorError::from_engine(&e))
    }

    /// Best-effort liveness signal. Returns whether the beat was delivered.
    pub async fn keepalive(&self) -> bool {
        match self.engine.keepalive().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "keepalive not delivered");
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.subscribe()
    }
}
