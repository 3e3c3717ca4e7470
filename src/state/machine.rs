//! Pure session state machine.
//!
//! ```text
//! Idle --StartSucceeded--> Running --StopSucceeded--------> Completed
//!                                  --PushEvent(terminal)---> Completed | Failed
//! any  --Reset | EmergencyStopped--> Idle
//! ```
//!
//! `Paused` is accepted from the engine but no transition enters it locally.
//! Terminal states are absorbing: later events fold metrics only.
//! A session dropped by an emergency stop is never adopted again; a refresh
//! that still finds it on the engine re-issues the stop instead.
//!
//! Invariants upheld by every transition:
//! - an `ArmKeepalive` effect is emitted only on entering `Running`, and every
//!   exit from `Running` emits `DisarmKeepalive`;
//! - `history` is most-recent-first and never exceeds `history_capacity`;
//! - `history` and `safety_confirmed` survive `Reset`.
//!
//! `Orchestrator::shutdown` halts the timer without a transition; the state
//! is not observed after teardown.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use super::{Effect, OrchestratorState, Transition};
use crate::error::{ErrorKind, OrchestratorError};
use crate::model::{now_millis, SessionMetrics, TestSession, TestStatus};
use crate::safety;

/// Reducer state plus the fencing generation for in-flight starts.
#[derive(Debug)]
pub struct SessionMachine {
    state: OrchestratorState,
    /// Bumped by every reset; a start issued under an older generation is stale.
    generation: u64,
    start_in_flight: bool,
    /// Set between `EmergencyRequested` and the reset that follows.
    aborting: bool,
    /// Remote sessions dropped by an emergency stop, most recent last.
    abandoned: VecDeque<String>,
    history_capacity: usize,
}

/// How many emergency-abandoned session ids are remembered.
const ABANDONED_CAPACITY: usize = 16;

impl SessionMachine {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            state: OrchestratorState::default(),
            generation: 0,
            start_in_flight: false,
            aborting: false,
            abandoned: VecDeque::new(),
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Apply one transition and return the effects it requires.
    pub fn apply(&mut self, transition: Transition) -> Vec<Effect> {
        match transition {
            Transition::Hydrate {
                mut history,
                safety_confirmed,
            } => {
                history.truncate(self.history_capacity);
                self.state.history = history;
                self.state.safety_confirmed = safety_confirmed;
                Vec::new()
            }

            Transition::SafetyConfirmed => {
                self.state.safety_confirmed = true;
                self.state.error = None;
                vec![Effect::PersistSafety(true)]
            }

            Transition::Rejected(error) => {
                self.state.is_loading = false;
                self.state.error = Some(error);
                Vec::new()
            }

            Transition::StartRequested => self.start_requested(),

            Transition::StartSucceeded {
                generation,
                session,
            } => self.start_succeeded(generation, session),

            Transition::StartFailed { generation, error } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "dropping stale start failure");
                    return Vec::new();
                }
                self.start_in_flight = false;
                self.state.is_loading = false;
                self.state.error = Some(error);
                Vec::new()
            }

            Transition::StopRequested => {
                self.state.is_loading = true;
                Vec::new()
            }

            Transition::StopSucceeded => {
                self.state.is_loading = false;
                let metrics = self.state.metrics.clone();
                let mut effects = self.finish_session(TestStatus::Completed, metrics, None);
                // Stop is authoritative for the timer even without a session.
                if !effects.contains(&Effect::DisarmKeepalive) {
                    effects.push(Effect::DisarmKeepalive);
                }
                effects
            }

            Transition::StopFailed(error) => {
                self.state.is_loading = false;
                self.state.error = Some(error);
                Vec::new()
            }

            Transition::EmergencyRequested => {
                self.aborting = true;
                self.state.is_loading = true;
                Vec::new()
            }

            Transition::EmergencyStopped => {
                if let Some(test_id) = self.state.current_session.as_ref().map(|s| s.test_id.clone()) {
                    warn!(%test_id, "session abandoned by emergency stop");
                    self.abandon(test_id);
                }
                self.reset()
            }

            Transition::PushEvent(event) => self.fold(event.status, event.metrics, None),

            Transition::Refreshed {
                status,
                metrics,
                session,
            } => self.refreshed(status, metrics, session),

            Transition::ClearError => {
                self.state.error = None;
                Vec::new()
            }

            Transition::Reset => self.reset(),
        }
    }

    fn start_requested(&mut self) -> Vec<Effect> {
        if self.start_in_flight {
            self.state.error = Some(OrchestratorError::new(
                ErrorKind::TestAlreadyRunning,
                "A start request is already in flight",
            ));
            return Vec::new();
        }
        let check = safety::can_start(self.state.status);
        if !check.allowed {
            self.state.error = Some(OrchestratorError::new(
                ErrorKind::TestAlreadyRunning,
                check.reason.unwrap_or_default(),
            ));
            return Vec::new();
        }

        self.start_in_flight = true;
        self.state.is_loading = true;
        self.state.error = None;
        vec![Effect::IssueStart {
            generation: self.generation,
        }]
    }

    fn start_succeeded(&mut self, generation: u64, session: TestSession) -> Vec<Effect> {
        if generation != self.generation || self.aborting || self.state.status != TestStatus::Idle {
            warn!(
                test_id = %session.test_id,
                generation,
                current = self.generation,
                aborting = self.aborting,
                "start response arrived after reset, abandoning remote session"
            );
            if self.aborting {
                self.abandon(session.test_id.clone());
            }
            return vec![Effect::AbandonRemoteSession {
                test_id: session.test_id,
            }];
        }
        self.start_in_flight = false;
        self.state.is_loading = false;
        self.state.error = None;
        self.state.metrics = SessionMetrics::default();
        self.enter_running(session)
    }

    fn enter_running(&mut self, mut session: TestSession) -> Vec<Effect> {
        session.status = TestStatus::Running;
        info!(test_id = %session.test_id, target = %session.target_ip, "session running");
        self.state.current_session = Some(session);
        self.state.status = TestStatus::Running;
        vec![Effect::ArmKeepalive]
    }

    /// Move the running session to a terminal status and archive it.
    fn finish_session(
        &mut self,
        status: TestStatus,
        final_metrics: SessionMetrics,
        error: Option<String>,
    ) -> Vec<Effect> {
        let Some(session) = self.state.current_session.as_mut() else {
            return Vec::new();
        };
        if session.status.is_terminal() {
            return Vec::new();
        }

        session.status = status;
        session.end_time = Some(now_millis());
        session.final_metrics = Some(final_metrics);
        if error.is_some() {
            session.error_message = error;
        }
        let archived = session.clone();
        info!(test_id = %archived.test_id, %status, "session finished");

        self.state.status = status;
        self.state.history.insert(0, archived);
        self.state.history.truncate(self.history_capacity);

        vec![
            Effect::DisarmKeepalive,
            Effect::PersistHistory(self.state.history.clone()),
        ]
    }

    /// Fold a status/metrics pair reported by the engine.
    fn fold(
        &mut self,
        status: TestStatus,
        metrics: SessionMetrics,
        error: Option<String>,
    ) -> Vec<Effect> {
        let metrics = metrics.sanitized();
        self.state.metrics = metrics.clone();

        let local = self.state.current_session.as_ref().map(|s| s.status);
        match local {
            Some(TestStatus::Running) if status.is_terminal() && self.aborting => {
                debug!(reported = %status, "emergency stop pending; not archiving");
                Vec::new()
            }
            Some(TestStatus::Running) if status.is_terminal() => {
                self.finish_session(status, metrics, error)
            }
            Some(current) if current != status => {
                debug!(local = %current, reported = %status, "ignoring reported status");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn refreshed(
        &mut self,
        status: TestStatus,
        metrics: SessionMetrics,
        remote: Option<TestSession>,
    ) -> Vec<Effect> {
        let local_id = self.state.current_session.as_ref().map(|s| s.test_id.clone());

        match (local_id, remote) {
            (Some(local_id), Some(remote)) if remote.test_id == local_id => {
                let final_metrics = remote.final_metrics.clone().unwrap_or(metrics);
                self.fold(remote.status, final_metrics, remote.error_message)
            }
            (Some(local_id), remote) => {
                if let Some(remote) = &remote {
                    warn!(local = %local_id, remote = %remote.test_id, "engine reports a different session");
                }
                self.state.metrics = metrics.sanitized();
                Vec::new()
            }
            (None, Some(remote))
                if remote.status == TestStatus::Running && self.abandoned.contains(&remote.test_id) =>
            {
                warn!(test_id = %remote.test_id, "abandoned session still running; stopping again");
                self.state.metrics = metrics.sanitized();
                vec![Effect::AbandonRemoteSession {
                    test_id: remote.test_id,
                }]
            }
            (None, Some(remote))
                if remote.status == TestStatus::Running
                    && self.state.status == TestStatus::Idle
                    && !self.aborting
                    && !self.start_in_flight =>
            {
                // The engine is running a job this process did not start
                // (e.g. after a restart); track it so the keepalive covers it.
                self.state.metrics = metrics.sanitized();
                self.enter_running(remote)
            }
            (None, _) => {
                self.state.metrics = metrics.sanitized();
                if status != self.state.status {
                    debug!(reported = %status, "no local session; status not adopted");
                }
                Vec::new()
            }
        }
    }

    fn abandon(&mut self, test_id: String) {
        if self.abandoned.contains(&test_id) {
            return;
        }
        if self.abandoned.len() == ABANDONED_CAPACITY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(test_id);
    }

    fn reset(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.start_in_flight = false;
        self.aborting = false;
        self.state.current_session = None;
        self.state.status = TestStatus::Idle;
        self.state.metrics = SessionMetrics::default();
        self.state.error = None;
        self.state.is_loading = false;
        vec![Effect::DisarmKeepalive]
    }
}
