//! Minimal engine double for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::broadcast;

use super::{EngineEvent, ExecutionEngine};
use crate::error::{EngineFailure, EngineResult};
use crate::model::{SessionMetrics, TestConfiguration, TestSession, TestStatus};

/// Counts calls and pushes whatever events the test sends through `events`.
pub struct TestEngine {
    pub keepalives: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub fail_keepalive: AtomicBool,
    pub fail_stop: AtomicBool,
    pub events: broadcast::Sender<EngineEvent>,
}

impl Default for TestEngine {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            keepalives: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            fail_keepalive: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            events,
        }
    }
}

#[async_trait::async_trait]
impl ExecutionEngine for TestEngine {
    async fn validate_target(&self, _ip: &str) -> EngineResult<bool> {
        Ok(true)
    }

    async fn start(&self, _config: &TestConfiguration) -> EngineResult<String> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("test-{n}"))
    }

    async fn stop(&self) -> EngineResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(EngineFailure::Transport("connection refused".into()));
        }
        Ok(())
    }

    async fn status(&self) -> EngineResult<TestStatus> {
        Ok(TestStatus::Idle)
    }

    async fn metrics(&self) -> EngineResult<SessionMetrics> {
        Ok(SessionMetrics::default())
    }

    async fn current_session(&self) -> EngineResult<Option<TestSession>> {
        Ok(None)
    }

    async fn keepalive(&self) -> EngineResult<()> {
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        if self.fail_keepalive.load(Ordering::SeqCst) {
            return Err(EngineFailure::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
