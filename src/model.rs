//! Shared data model: test configuration, metrics, sessions and consent.
//!
//! These types double as the wire shapes exchanged with the execution engine,
//! so field names follow the engine's JSON (`target_ip`, `latency_ms`, ...).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Test configuration
// ---------------------------------------------------------------------------

/// The kind of load a session generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestKind {
    PingFlood,
    BandwidthTest,
    LatencyTest,
    PacketLoss,
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestKind::PingFlood => write!(f, "ping-flood"),
            TestKind::BandwidthTest => write!(f, "bandwidth"),
            TestKind::LatencyTest => write!(f, "latency"),
            TestKind::PacketLoss => write!(f, "packet-loss"),
        }
    }
}

/// Coarse rate selector; each level maps to a fixed packet rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl Intensity {
    pub fn packets_per_second(&self) -> u32 {
        match self {
            Intensity::Low => 10,
            Intensity::Medium => 50,
            Intensity::High => 100,
        }
    }
}

/// Parameters of a single stress test, as submitted to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub target_ip: String,
    pub test_type: TestKind,
    pub intensity: Intensity,
    /// Signed so that out-of-range input survives long enough to be reported.
    pub duration_seconds: i64,
}

// ---------------------------------------------------------------------------
// Status and metrics
// ---------------------------------------------------------------------------

/// Lifecycle status of a session (and of the orchestrator as a whole).
///
/// `Paused` is reserved: the engine may report it, but no local transition
/// leads to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TestStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TestStatus {
    /// Completed and Failed are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestStatus::Completed | TestStatus::Failed)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestStatus::Idle => "idle",
            TestStatus::Running => "running",
            TestStatus::Paused => "paused",
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time measurements for the running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub latency_ms: f64,
    /// Always within `[0, 100]`.
    pub packet_loss_percentage: f64,
    pub throughput_mbps: f64,
    pub jitter_ms: f64,
    pub packets_sent: u32,
    pub packets_received: u32,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            packet_loss_percentage: 0.0,
            throughput_mbps: 0.0,
            jitter_ms: 0.0,
            packets_sent: 0,
            packets_received: 0,
            timestamp: now_millis(),
        }
    }
}

impl SessionMetrics {
    /// Clamp values the engine is not trusted to keep in range.
    pub fn sanitized(mut self) -> Self {
        if !self.packet_loss_percentage.is_finite() {
            self.packet_loss_percentage = 0.0;
        }
        self.packet_loss_percentage = self.packet_loss_percentage.clamp(0.0, 100.0);
        for v in [
            &mut self.latency_ms,
            &mut self.throughput_mbps,
            &mut self.jitter_ms,
        ] {
            if !v.is_finite() || *v < 0.0 {
                *v = 0.0;
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// One bounded execution of a configured job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSession {
    /// Engine-assigned identity.
    pub test_id: String,
    pub target_ip: String,
    pub test_type: TestKind,
    pub intensity: Intensity,
    pub duration_seconds: i64,
    /// Unix epoch milliseconds.
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub final_metrics: Option<SessionMetrics>,
    pub status: TestStatus,
    pub error_message: Option<String>,
}

impl TestSession {
    /// A freshly started session for `config`.
    pub fn started(test_id: String, config: &TestConfiguration) -> Self {
        Self {
            test_id,
            target_ip: config.target_ip.clone(),
            test_type: config.test_type,
            intensity: config.intensity,
            duration_seconds: config.duration_seconds,
            start_time: now_millis(),
            end_time: None,
            final_metrics: None,
            status: TestStatus::Running,
            error_message: None,
        }
    }

    pub fn config(&self) -> TestConfiguration {
        TestConfiguration {
            target_ip: self.target_ip.clone(),
            test_type: self.test_type,
            intensity: self.intensity,
            duration_seconds: self.duration_seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Consent
// ---------------------------------------------------------------------------

/// The operator's acknowledgements required before any test may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetyConfirmation {
    /// The operator owns or administers the target network.
    pub owns_target_network: bool,
    /// The operator has authorization to load-test the target.
    pub has_authorization: bool,
    /// The operator understands the test may degrade the network.
    pub understands_impact: bool,
    /// The operator accepts the enforced rate and duration limits.
    pub accepts_limits: bool,
    /// The operator will stay present and monitor the test.
    pub will_monitor: bool,
}

impl SafetyConfirmation {
    pub fn all() -> Self {
        Self {
            owns_target_network: true,
            has_authorization: true,
            understands_impact: true,
            accepts_limits: true,
            will_monitor: true,
        }
    }

    /// Confirmed only when every acknowledgement is given.
    pub fn is_confirmed(&self) -> bool {
        self.owns_target_network
            && self.has_authorization
            && self.understands_impact
            && self.accepts_limits
            && self.will_monitor
    }
}

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
