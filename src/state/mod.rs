//! Session state: the single owner of session, metrics and history.
//!
//! The pure reducer lives in [`machine`]: it consumes [`Transition`]s and
//! returns [`Effect`]s without touching Tokio, storage or the engine. The
//! async shell in [`store`] serializes transitions, executes the effects and
//! publishes a snapshot after every step.

pub mod machine;
pub mod store;

use serde::Serialize;

use crate::engine::EngineEvent;
use crate::error::OrchestratorError;
use crate::model::{SessionMetrics, TestSession, TestStatus};

pub use machine::SessionMachine;
pub use store::StateStore;

/// Observable aggregate handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorState {
    pub current_session: Option<TestSession>,
    pub status: TestStatus,
    pub metrics: SessionMetrics,
    /// Terminal sessions, most recent first.
    pub history: Vec<TestSession>,
    /// Last policy or engine error; cleared explicitly.
    pub error: Option<OrchestratorError>,
    pub safety_confirmed: bool,
    pub is_loading: bool,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            current_session: None,
            status: TestStatus::Idle,
            metrics: SessionMetrics::default(),
            history: Vec::new(),
            error: None,
            safety_confirmed: false,
            is_loading: false,
        }
    }
}

/// Every way the state may change.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Restore persisted history and consent at startup.
    Hydrate {
        history: Vec<TestSession>,
        safety_confirmed: bool,
    },
    /// The operator gave every safety acknowledgement.
    SafetyConfirmed,
    /// A request was refused before or by the engine.
    Rejected(OrchestratorError),
    /// Claim the single start slot.
    StartRequested,
    /// The engine accepted a start issued under `generation`.
    StartSucceeded {
        generation: u64,
        session: TestSession,
    },
    /// The start issued under `generation` failed.
    StartFailed {
        generation: u64,
        error: OrchestratorError,
    },
    StopRequested,
    StopSucceeded,
    StopFailed(OrchestratorError),
    /// An emergency stop is under way; terminal reports no longer archive.
    EmergencyRequested,
    /// Local abort; the remote stop outcome does not matter.
    EmergencyStopped,
    /// One event from the engine's push channel.
    PushEvent(EngineEvent),
    /// Batched result of the three status reads.
    Refreshed {
        status: TestStatus,
        metrics: SessionMetrics,
        session: Option<TestSession>,
    },
    ClearError,
    /// Back to idle. History and consent survive.
    Reset,
}

/// Work the shell must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ArmKeepalive,
    DisarmKeepalive,
    PersistHistory(Vec<TestSession>),
    PersistSafety(bool),
    /// The caller owns the start slot and should issue the remote start.
    IssueStart { generation: u64 },
    /// A start landed after a reset; stop it on the engine.
    AbandonRemoteSession { test_id: String },
}
