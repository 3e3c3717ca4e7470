//! Contract with the job-execution engine.
//!
//! The orchestrator never generates load itself. It drives an engine through
//! the request/response operations of [`ExecutionEngine`] and listens to the
//! engine's push channel for [`EngineEvent`]s. [`local::LocalEngine`] is an
//! in-process implementation used by the binary and the integration tests.

pub mod local;
#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::EngineResult;
use crate::model::{SessionMetrics, TestConfiguration, TestSession, TestStatus};

/// Payload delivered on the engine's push channel.
///
/// Delivery is at-least-once and ordered no more strongly than emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub metrics: SessionMetrics,
    pub status: TestStatus,
}

/// Request/response operations exposed by an execution engine.
#[async_trait::async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Whether `ip` is an acceptable target.
    async fn validate_target(&self, ip: &str) -> EngineResult<bool>;

    /// Start a job, returning the engine-assigned session id.
    async fn start(&self, config: &TestConfiguration) -> EngineResult<String>;

    /// Stop the current job, if any.
    async fn stop(&self) -> EngineResult<()>;

    async fn status(&self) -> EngineResult<TestStatus>;

    async fn metrics(&self) -> EngineResult<SessionMetrics>;

    async fn current_session(&self) -> EngineResult<Option<TestSession>>;

    /// Liveness signal for the engine's dead man's switch.
    async fn keepalive(&self) -> EngineResult<()>;

    /// Open a new subscription to the push channel.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
