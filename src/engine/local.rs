//! In-process execution engine.
//!
//! Enforces the engine-side policy (private targets, rate and duration caps,
//! one test at a time, per-target cooldown, dead man's switch) and simulates
//! probe results. No packets are sent: each tick draws a latency sample and a
//! loss outcome, which is enough to exercise the full control loop.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EngineEvent, ExecutionEngine};
use crate::config::EngineConfig;
use crate::error::{EngineFailure, EngineResult};
use crate::model::{now_millis, SessionMetrics, TestConfiguration, TestKind, TestSession, TestStatus};
use crate::safety::is_private_ipv4;

/// Capacity of the push channel; slow subscribers observe `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Circuit breaker: after this many packets, stop if fewer than 10% came back.
const CIRCUIT_BREAKER_MIN_SENT: u32 = 100;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct EngineState {
    current: Option<TestSession>,
    metrics: SessionMetrics,
    last_keepalive: Instant,
    cooldowns: HashMap<String, Instant>,
    cancel_tx: Option<watch::Sender<bool>>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            current: None,
            metrics: SessionMetrics::default(),
            last_keepalive: Instant::now(),
            cooldowns: HashMap::new(),
            cancel_tx: None,
        }
    }
}

impl EngineState {
    fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.status == TestStatus::Running)
    }

    /// Store live metrics for `test_id`. Refused once the session is no
    /// longer current and running, so a stopped run cannot publish again.
    fn record_metrics(&mut self, test_id: &str, metrics: &SessionMetrics) -> bool {
        if !self.is_running() || self.current.as_ref().is_some_and(|s| s.test_id != test_id) {
            return false;
        }
        self.metrics = metrics.clone();
        true
    }

    /// Move the current session to a terminal status, if it is still the
    /// session identified by `test_id` and still running.
    fn finish(&mut self, test_id: &str, status: TestStatus, error: Option<String>) -> bool {
        let metrics = self.metrics.clone();
        match self.current.as_mut() {
            Some(session) if session.test_id == test_id && session.status == TestStatus::Running => {
                session.status = status;
                session.end_time = Some(now_millis());
                session.final_metrics = Some(metrics);
                session.error_message = error;
                self.cancel_tx = None;
                true
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// LocalEngine
// ---------------------------------------------------------------------------

/// Simulated engine running jobs as Tokio tasks in this process.
#[derive(Clone)]
pub struct LocalEngine {
    state: Arc<RwLock<EngineState>>,
    events: broadcast::Sender<EngineEvent>,
    config: EngineConfig,
}

impl LocalEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(EngineState::default())),
            events,
            config,
        }
    }

    fn check_config(&self, config: &TestConfiguration, state: &EngineState) -> EngineResult<()> {
        let ip: Ipv4Addr = config
            .target_ip
            .parse()
            .map_err(|_| EngineFailure::Rejected("Target IP is not in a private network range".into()))?;
        if !is_private_ipv4(&ip) {
            return Err(EngineFailure::Rejected(
                "Target IP is not in a private network range".into(),
            ));
        }

        if config.intensity.packets_per_second() > self.config.max_packets_per_second {
            return Err(EngineFailure::Rejected(format!(
                "Rate limit exceeded. Maximum {} pps allowed",
                self.config.max_packets_per_second
            )));
        }

        if config.duration_seconds > self.config.max_duration_seconds as i64 {
            return Err(EngineFailure::Rejected(format!(
                "Test duration too long. Maximum {} seconds allowed",
                self.config.max_duration_seconds
            )));
        }
        if config.duration_seconds <= 0 {
            return Err(EngineFailure::Rejected(
                "Test duration must be positive".into(),
            ));
        }

        if state.is_running() {
            return Err(EngineFailure::Rejected(
                "Test already running. Only one test allowed at a time".into(),
            ));
        }

        if let Some(last) = state.cooldowns.get(&config.target_ip) {
            let cooldown = Duration::from_secs(self.config.cooldown_seconds);
            let elapsed = last.elapsed();
            if elapsed < cooldown {
                let remaining = (cooldown - elapsed).as_secs().max(1);
                return Err(EngineFailure::Rejected(format!(
                    "Cooldown period active. Wait {} seconds before testing this target again",
                    remaining
                )));
            }
        }

        Ok(())
    }

    fn publish(&self, metrics: SessionMetrics, status: TestStatus) {
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(EngineEvent { metrics, status });
    }
}

#[async_trait::async_trait]
impl ExecutionEngine for LocalEngine {
    async fn validate_target(&self, ip: &str) -> EngineResult<bool> {
        Ok(ip.parse::<Ipv4Addr>().is_ok_and(|ip| is_private_ipv4(&ip)))
    }

    async fn start(&self, config: &TestConfiguration) -> EngineResult<String> {
        let (test_id, cancel_rx) = {
            let mut state = self.state.write().await;
            self.check_config(config, &state)?;

            let test_id = Uuid::new_v4().to_string();
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let now = Instant::now();

            state.current = Some(TestSession::started(test_id.clone(), config));
            state.metrics = SessionMetrics::default();
            state.last_keepalive = now;
            state.cooldowns.insert(config.target_ip.clone(), now);
            state.cancel_tx = Some(cancel_tx);
            (test_id, cancel_rx)
        };

        let engine = self.clone();
        let run_id = test_id.clone();
        let run_config = config.clone();
        tokio::spawn(async move {
            engine.run_loop(run_id, run_config, cancel_rx).await;
        });

        info!(test_id = %test_id, target = %config.target_ip, kind = %config.test_type, "local engine started test");
        Ok(test_id)
    }

    async fn stop(&self) -> EngineResult<()> {
        let finished = {
            let mut state = self.state.write().await;
            if let Some(tx) = state.cancel_tx.take() {
                let _ = tx.send(true);
            }
            let id = state.current.as_ref().map(|s| s.test_id.clone());
            let stopped = match id {
                Some(id) => state.finish(&id, TestStatus::Completed, None),
                None => false,
            };
            stopped.then(|| state.metrics.clone())
        };

        if let Some(metrics) = finished {
            info!("local engine stopped test on request");
            self.publish(metrics, TestStatus::Completed);
        }
        Ok(())
    }

    async fn status(&self) -> EngineResult<TestStatus> {
        let state = self.state.read().await;
        Ok(state
            .current
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(TestStatus::Idle))
    }

    async fn metrics(&self) -> EngineResult<SessionMetrics> {
        Ok(self.state.read().await.metrics.clone())
    }

    async fn current_session(&self) -> EngineResult<Option<TestSession>> {
        Ok(self.state.read().await.current.clone())
    }

    async fn keepalive(&self) -> EngineResult<()> {
        self.state.write().await.last_keepalive = Instant::now();
        debug!("dead man's switch confirmed");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

/// Why a run ended without being cancelled.
enum RunEnd {
    Elapsed,
    CircuitBreaker,
    DeadMansSwitch,
}

impl LocalEngine {
    async fn run_loop(
        &self,
        test_id: String,
        config: TestConfiguration,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let pps = config.intensity.packets_per_second().max(1);
        let mut ticker = tokio::time::interval(Duration::from_millis(1000 / pps as u64));
        let publish_every = Duration::from_millis(self.config.metrics_interval_ms.max(1));
        let dead_mans_switch = Duration::from_secs(self.config.dead_mans_switch_seconds);
        let deadline = Duration::from_secs(config.duration_seconds.max(0) as u64);

        let started = Instant::now();
        let mut last_publish = started;
        let mut tally = Tally::default();

        let end = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if started.elapsed() >= deadline {
                        break RunEnd::Elapsed;
                    }

                    {
                        let state = self.state.read().await;
                        if state.last_keepalive.elapsed() > dead_mans_switch {
                            break RunEnd::DeadMansSwitch;
                        }
                    }

                    tally.record(simulate_probe(config.test_type));

                    if last_publish.elapsed() >= publish_every {
                        last_publish = Instant::now();
                        let metrics = tally.metrics(config.test_type, started.elapsed());
                        if !self.state.write().await.record_metrics(&test_id, &metrics) {
                            return;
                        }
                        self.publish(metrics, TestStatus::Running);
                    }

                    if tally.sent > CIRCUIT_BREAKER_MIN_SENT
                        && (tally.received as f64 / tally.sent as f64) < 0.1
                    {
                        break RunEnd::CircuitBreaker;
                    }
                }
                changed = cancel_rx.changed() => {
                    // Sender dropped or cancel signalled: stop() already finalized.
                    if changed.is_err() || *cancel_rx.borrow() {
                        debug!(test_id = %test_id, "run loop cancelled");
                        return;
                    }
                }
            }
        };

        let (status, error) = match end {
            RunEnd::Elapsed => (TestStatus::Completed, None),
            RunEnd::CircuitBreaker => {
                warn!(test_id = %test_id, "circuit breaker triggered - high packet loss detected");
                (TestStatus::Completed, None)
            }
            RunEnd::DeadMansSwitch => {
                warn!(test_id = %test_id, "dead man's switch triggered");
                (
                    TestStatus::Failed,
                    Some("Dead man's switch triggered - UI confirmation required".to_string()),
                )
            }
        };

        let metrics = tally.metrics(config.test_type, started.elapsed());
        let finished = {
            let mut state = self.state.write().await;
            state.metrics = metrics.clone();
            state.finish(&test_id, status, error)
        };
        if finished {
            info!(
                test_id = %test_id,
                sent = metrics.packets_sent,
                received = metrics.packets_received,
                %status,
                "local engine test finished"
            );
            self.publish(metrics, status);
        }
    }
}

/// One simulated probe: `Some(latency_ms)` on reply, `None` on loss.
fn simulate_probe(kind: TestKind) -> Option<f64> {
    let mut rng = rand::thread_rng();
    let loss_rate = match kind {
        TestKind::PacketLoss => 0.05,
        TestKind::PingFlood => 0.02,
        TestKind::BandwidthTest | TestKind::LatencyTest => 0.01,
    };
    if rng.gen_bool(loss_rate) {
        None
    } else {
        Some(rng.gen_range(0.2..2.5))
    }
}

#[derive(Default)]
struct Tally {
    sent: u32,
    received: u32,
    latencies: Vec<f64>,
}

impl Tally {
    fn record(&mut self, outcome: Option<f64>) {
        self.sent += 1;
        if let Some(latency) = outcome {
            self.received += 1;
            self.latencies.push(latency);
        }
    }

    fn metrics(&self, kind: TestKind, elapsed: Duration) -> SessionMetrics {
        let mut m = SessionMetrics {
            packets_sent: self.sent,
            packets_received: self.received,
            ..SessionMetrics::default()
        };

        if self.sent > 0 {
            m.packet_loss_percentage =
                (self.sent - self.received) as f64 / self.sent as f64 * 100.0;
        }

        if !self.latencies.is_empty() {
            let n = self.latencies.len() as f64;
            let mean = self.latencies.iter().sum::<f64>() / n;
            let variance = self.latencies.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            m.latency_ms = mean;
            m.jitter_ms = variance.sqrt();
        }

        let payload_bytes = match kind {
            TestKind::BandwidthTest => 1400.0,
            _ => 64.0,
        };
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            m.throughput_mbps = self.received as f64 * payload_bytes * 8.0 / secs / 1_000_000.0;
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::Intensity;

    fn config(target: &str, duration: i64) -> TestConfiguration {
        TestConfiguration {
            target_ip: target.to_string(),
            test_type: TestKind::LatencyTest,
            intensity: Intensity::Low,
            duration_seconds: duration,
        }
    }

    fn kind_of(err: EngineFailure) -> ErrorKind {
        crate::error::OrchestratorError::from_engine(&err).kind
    }

    #[tokio::test]
    async fn test_validate_target() {
        let engine = LocalEngine::new(EngineConfig::default());
        assert!(engine.validate_target("192.168.1.1").await.unwrap());
        assert!(!engine.validate_target("8.8.8.8").await.unwrap());
        assert!(!engine.validate_target("invalid").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_classifiable() {
        let engine = LocalEngine::new(EngineConfig::default());

        let err = engine.start(&config("8.8.8.8", 10)).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::InvalidTargetIp);

        let err = engine.start(&config("10.0.0.1", 301)).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::DurationTooLong);

        engine.start(&config("10.0.0.1", 10)).await.unwrap();
        let err = engine.start(&config("10.0.0.2", 10)).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::TestAlreadyRunning);

        engine.stop().await.unwrap();
        let err = engine.start(&config("10.0.0.1", 10)).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::CooldownActive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rejection() {
        let engine = LocalEngine::new(EngineConfig {
            max_packets_per_second: 20,
            ..EngineConfig::default()
        });
        let mut cfg = config("10.0.0.1", 10);
        cfg.intensity = Intensity::High;
        let err = engine.start(&cfg).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::RateLimitExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_completes_session_and_publishes() {
        let engine = LocalEngine::new(EngineConfig::default());
        let mut events = engine.subscribe();

        let id = engine.start(&config("192.168.1.10", 30)).await.unwrap();
        assert_eq!(engine.status().await.unwrap(), TestStatus::Running);

        engine.stop().await.unwrap();
        let session = engine.current_session().await.unwrap().unwrap();
        assert_eq!(session.test_id, id);
        assert_eq!(session.status, TestStatus::Completed);
        assert!(session.final_metrics.is_some());

        let mut last = None;
        while let Ok(ev) = events.try_recv() {
            last = Some(ev);
        }
        assert_eq!(last.unwrap().status, TestStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_run_cannot_overwrite_metrics() {
        let engine = LocalEngine::new(EngineConfig::default());
        let id = engine.start(&config("192.168.1.10", 30)).await.unwrap();
        engine.stop().await.unwrap();

        let mut state = engine.state.write().await;
        let late = SessionMetrics {
            packets_sent: 999,
            ..SessionMetrics::default()
        };
        assert!(!state.record_metrics(&id, &late));
        assert_ne!(state.metrics.packets_sent, 999);
        assert!(!state.record_metrics("other", &late));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_running_event_after_stop() {
        let engine = LocalEngine::new(EngineConfig {
            metrics_interval_ms: 1,
            ..EngineConfig::default()
        });
        let mut events = engine.subscribe();
        engine.start(&config("192.168.1.10", 30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            seen.push(ev.status);
        }
        assert_eq!(seen.last(), Some(&TestStatus::Completed));
        assert_eq!(seen.iter().filter(|s| s.is_terminal()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_after_duration() {
        let engine = LocalEngine::new(EngineConfig::default());
        engine.start(&config("10.1.2.3", 2)).await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            engine.keepalive().await.unwrap();
        }

        let session = engine.current_session().await.unwrap().unwrap();
        assert_eq!(session.status, TestStatus::Completed);
        let metrics = session.final_metrics.unwrap();
        assert!(metrics.packets_sent > 0);
        assert!(metrics.packet_loss_percentage >= 0.0 && metrics.packet_loss_percentage <= 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_mans_switch_fails_run() {
        let engine = LocalEngine::new(EngineConfig {
            dead_mans_switch_seconds: 2,
            ..EngineConfig::default()
        });
        engine.start(&config("172.16.0.9", 60)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;

        let session = engine.current_session().await.unwrap().unwrap();
        assert_eq!(session.status, TestStatus::Failed);
        assert!(session
            .error_message
            .unwrap()
            .contains("Dead man's switch"));
    }
}
