//! Scripted engine double shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use stresswarden::config::StresswardenConfig;
use stresswarden::engine::{EngineEvent, ExecutionEngine};
use stresswarden::error::{EngineFailure, EngineResult};
use stresswarden::model::{
    Intensity, SafetyConfirmation, SessionMetrics, TestConfiguration, TestKind, TestSession,
    TestStatus,
};
use stresswarden::storage::{KvStore, MemoryStore};
use stresswarden::Orchestrator;

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ValidateTarget(String),
    Start(TestConfiguration),
    Stop,
    Status,
    Metrics,
    CurrentSession,
    Keepalive,
}

/// Engine whose responses are scripted per call and whose calls are recorded.
///
/// Unscripted `start` calls succeed with `abc-123`; unscripted `stop` calls
/// succeed.
pub struct FakeEngine {
    calls: Mutex<Vec<Call>>,
    start_script: Mutex<VecDeque<EngineResult<String>>>,
    stop_script: Mutex<VecDeque<EngineResult<()>>>,
    start_delay: Mutex<Option<Duration>>,
    stop_delay: Mutex<Option<Duration>>,
    remote: Mutex<(TestStatus, SessionMetrics, Option<TestSession>)>,
    events: broadcast::Sender<EngineEvent>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            start_script: Mutex::new(VecDeque::new()),
            stop_script: Mutex::new(VecDeque::new()),
            start_delay: Mutex::new(None),
            stop_delay: Mutex::new(None),
            remote: Mutex::new((TestStatus::Idle, SessionMetrics::default(), None)),
            events,
        })
    }

    pub fn script_start(&self, outcome: EngineResult<String>) {
        self.start_script.lock().unwrap().push_back(outcome);
    }

    pub fn script_stop(&self, outcome: EngineResult<()>) {
        self.stop_script.lock().unwrap().push_back(outcome);
    }

    /// Hold every `start` response for `delay`.
    pub fn delay_start(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    /// Hold every `stop` response for `delay`.
    pub fn delay_stop(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_remote(&self, status: TestStatus, metrics: SessionMetrics, session: Option<TestSession>) {
        *self.remote.lock().unwrap() = (status, metrics, session);
    }

    pub fn push(&self, status: TestStatus, metrics: SessionMetrics) {
        self.events.send(EngineEvent { metrics, status }).unwrap();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn starts(&self) -> usize {
        self.count(|c| matches!(c, Call::Start(_)))
    }

    pub fn stops(&self) -> usize {
        self.count(|c| matches!(c, Call::Stop))
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl ExecutionEngine for FakeEngine {
    async fn validate_target(&self, ip: &str) -> EngineResult<bool> {
        self.record(Call::ValidateTarget(ip.to_string()));
        Ok(true)
    }

    async fn start(&self, config: &TestConfiguration) -> EngineResult<String> {
        self.record(Call::Start(config.clone()));
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.start_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok("abc-123".to_string()))
    }

    async fn stop(&self) -> EngineResult<()> {
        self.record(Call::Stop);
        let delay = *self.stop_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.stop_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn status(&self) -> EngineResult<TestStatus> {
        self.record(Call::Status);
        Ok(self.remote.lock().unwrap().0)
    }

    async fn metrics(&self) -> EngineResult<SessionMetrics> {
        self.record(Call::Metrics);
        Ok(self.remote.lock().unwrap().1.clone())
    }

    async fn current_session(&self) -> EngineResult<Option<TestSession>> {
        self.record(Call::CurrentSession);
        Ok(self.remote.lock().unwrap().2.clone())
    }

    async fn keepalive(&self) -> EngineResult<()> {
        self.record(Call::Keepalive);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

pub fn transport(msg: &str) -> EngineFailure {
    EngineFailure::Transport(msg.to_string())
}

pub fn config(target: &str, duration: i64) -> TestConfiguration {
    TestConfiguration {
        target_ip: target.to_string(),
        test_type: TestKind::PingFlood,
        intensity: Intensity::Medium,
        duration_seconds: duration,
    }
}

pub fn metrics(sent: u32, received: u32) -> SessionMetrics {
    SessionMetrics {
        packets_sent: sent,
        packets_received: received,
        latency_ms: 1.5,
        ..SessionMetrics::default()
    }
}

pub async fn orchestrator(engine: &Arc<FakeEngine>) -> Orchestrator {
    orchestrator_with(engine, Arc::new(MemoryStore::default())).await
}

pub async fn orchestrator_with(engine: &Arc<FakeEngine>, kv: Arc<dyn KvStore>) -> Orchestrator {
    Orchestrator::new(engine.clone(), &StresswardenConfig::default(), kv).await
}

/// An orchestrator that already holds consent.
pub async fn confirmed(engine: &Arc<FakeEngine>) -> Orchestrator {
    let orch = orchestrator(engine).await;
    orch.confirm_safety(SafetyConfirmation::all()).await.unwrap();
    orch
}

/// Wait until `pred` holds for the published state.
pub async fn wait_for(orch: &Orchestrator, pred: impl Fn(&stresswarden::state::OrchestratorState) -> bool) {
    let mut rx = orch.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("state condition not reached");
}
