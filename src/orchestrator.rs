//! The orchestrator: the one object the presentation layer talks to.
//!
//! Built once by the composition root ([`Orchestrator::new`]) and shared by
//! reference. Every public operation records its failure in the observable
//! state's error field as well as returning it, so a caller that ignores the
//! `Result` still leaves the state consistent.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::client::{EngineClient, RetryPolicy};
use crate::config::StresswardenConfig;
use crate::engine::ExecutionEngine;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::ingest::EventIngestion;
use crate::keepalive::Keepalive;
use crate::model::{SafetyConfirmation, TestConfiguration, TestSession};
use crate::safety;
use crate::state::{Effect, OrchestratorState, SessionMachine, StateStore, Transition};
use crate::storage::{KvStore, Persistence};

pub struct Orchestrator {
    client: EngineClient,
    store: Arc<StateStore>,
    ingest: EventIngestion,
}

impl Orchestrator {
    /// Wire the components, restore persisted state and subscribe to the
    /// engine's push channel. Must be called inside a Tokio runtime.
    pub async fn new(
        engine: Arc<dyn ExecutionEngine>,
        config: &StresswardenConfig,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let client = EngineClient::new(engine, RetryPolicy::from_config(&config.retry));
        let persistence = Persistence::new(kv);

        // 1. Restore history and consent
        let history = persistence.load_history();
        let safety_confirmed = persistence.load_safety_confirmed();
        info!(
            sessions = history.len(),
            safety_confirmed, "restored orchestrator state"
        );

        // 2. State store with keepalive
        let keepalive = Keepalive::new(client.clone(), config.keepalive.period());
        let store = Arc::new(StateStore::new(
            SessionMachine::new(config.history.capacity),
            keepalive,
            persistence,
            client.clone(),
        ));
        store
            .dispatch(Transition::Hydrate {
                history,
                safety_confirmed,
            })
            .await;

        // 3. Push channel
        let ingest = EventIngestion::new(client.clone(), store.clone());
        ingest.subscribe();

        Self {
            client,
            store,
            ingest,
        }
    }

    // ---- Queries ----

    pub fn state(&self) -> OrchestratorState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.store.subscribe()
    }

    pub fn keepalive_armed(&self) -> bool {
        self.store.keepalive_armed()
    }

    /// Ask the engine whether it accepts `ip` as a target. Single attempt.
    pub async fn validate_target(&self, ip: &str) -> Result<bool> {
        self.client.validate_target(ip).await
    }

    // ---- Operations ----

    /// Record the operator's consent. Every acknowledgement must be given.
    pub async fn confirm_safety(&self, confirmation: SafetyConfirmation) -> Result<()> {
        if !confirmation.is_confirmed() {
            return self
                .reject(OrchestratorError::new(
                    ErrorKind::InternalError,
                    safety::MSG_CONSENT_INCOMPLETE,
                ))
                .await;
        }
        self.store.dispatch(Transition::SafetyConfirmed).await;
        info!("safety confirmation recorded");
        Ok(())
    }

    /// Start a test. Policy failures are refused before any remote call.
    #[instrument(skip_all, fields(target = %config.target_ip, kind = %config.test_type))]
    pub async fn start_test(&self, config: TestConfiguration) -> Result<TestSession> {
        let state = self.store.snapshot();

        // 1. Consent
        if !state.safety_confirmed {
            return self
                .reject(OrchestratorError::new(
                    ErrorKind::InternalError,
                    safety::MSG_CONSENT_REQUIRED,
                ))
                .await;
        }

        // 2. Configuration
        if let Some(error) = safety::violations_error(&safety::validate(&config)) {
            return self.reject(error).await;
        }

        // 3. Lifecycle
        let check = safety::can_start(state.status);
        if !check.allowed {
            let reason = check.reason.unwrap_or_default();
            return self
                .reject(OrchestratorError::new(ErrorKind::TestAlreadyRunning, reason))
                .await;
        }

        // 4. Claim the start slot; the machine re-checks under its lock.
        let effects = self.store.dispatch(Transition::StartRequested).await;
        let Some(generation) = effects.iter().find_map(|e| match e {
            Effect::IssueStart { generation } => Some(*generation),
            _ => None,
        }) else {
            return Err(self.current_error(ErrorKind::TestAlreadyRunning));
        };

        // 5. Remote validation, then start
        match self.client.validate_target(&config.target_ip).await {
            Ok(true) => {}
            Ok(false) => {
                let error = OrchestratorError::new(
                    ErrorKind::InvalidTargetIp,
                    "Engine refused the target address",
                );
                return self.start_failed(generation, error).await;
            }
            Err(error) => return self.start_failed(generation, error).await,
        }

        let test_id = match self.client.start(&config).await {
            Ok(id) => id,
            Err(error) => return self.start_failed(generation, error).await,
        };

        let session = TestSession::started(test_id, &config);
        self.store
            .dispatch(Transition::StartSucceeded {
                generation,
                session: session.clone(),
            })
            .await;

        let adopted = self
            .store
            .snapshot()
            .current_session
            .is_some_and(|s| s.test_id == session.test_id);
        if !adopted {
            // Reset landed while the start was in flight.
            return Err(OrchestratorError::new(
                ErrorKind::InternalError,
                "Start completed after the session was reset; remote test stopped",
            ));
        }

        info!(test_id = %session.test_id, "test started");
        Ok(session)
    }

    /// Stop the running test and archive it as completed.
    #[instrument(skip_all)]
    pub async fn stop_test(&self) -> Result<()> {
        self.store.dispatch(Transition::StopRequested).await;
        match self.client.stop().await {
            Ok(()) => {
                self.store.dispatch(Transition::StopSucceeded).await;
                info!("test stopped");
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "stop failed");
                self.store.dispatch(Transition::StopFailed(error.clone())).await;
                Err(error)
            }
        }
    }

    /// Best-effort remote stop, then an unconditional local reset to idle.
    /// Never fails; the engine's own watchdog covers a lost stop.
    #[instrument(skip_all)]
    pub async fn emergency_stop(&self) {
        warn!("emergency stop requested");
        self.store.dispatch(Transition::EmergencyRequested).await;
        if let Err(error) = self.client.stop().await {
            warn!(error = %error, "remote stop failed during emergency stop");
        }
        self.store.dispatch(Transition::EmergencyStopped).await;
    }

    /// Read status, metrics and the current session concurrently and apply
    /// them as one batch.
    pub async fn refresh_status(&self) -> Result<()> {
        let (status, metrics, session) = tokio::join!(
            self.client.status(),
            self.client.metrics(),
            self.client.current_session()
        );

        match (status, metrics, session) {
            (Ok(status), Ok(metrics), Ok(session)) => {
                self.store
                    .dispatch(Transition::Refreshed {
                        status,
                        metrics,
                        session,
                    })
                    .await;
                Ok(())
            }
            (Err(error), _, _) | (_, Err(error), _) | (_, _, Err(error)) => self.reject(error).await,
        }
    }

    pub async fn clear_error(&self) {
        self.store.dispatch(Transition::ClearError).await;
    }

    /// Dismiss the current session and return to idle.
    pub async fn reset(&self) {
        self.store.dispatch(Transition::Reset).await;
    }

    /// Tear down background tasks. The published state is left as is, so a
    /// running session still reads `Running` with the keepalive halted; the
    /// engine's dead man's switch ends it. Only call this when the
    /// orchestrator is being discarded.
    pub fn shutdown(&self) {
        self.ingest.unsubscribe();
        self.store.halt_keepalive();
        info!("orchestrator shut down");
    }

    // ---- Helpers ----

    async fn reject<T>(&self, error: OrchestratorError) -> Result<T> {
        warn!(kind = %error.kind, message = %error.message, "request rejected");
        self.store.dispatch(Transition::Rejected(error.clone())).await;
        Err(error)
    }

    async fn start_failed<T>(&self, generation: u64, error: OrchestratorError) -> Result<T> {
        warn!(kind = %error.kind, message = %error.message, "start failed");
        self.store
            .dispatch(Transition::StartFailed {
                generation,
                error: error.clone(),
            })
            .await;
        Err(error)
    }

    fn current_error(&self, fallback: ErrorKind) -> OrchestratorError {
        self.store
            .snapshot()
            .error
            .unwrap_or_else(|| OrchestratorError::new(fallback, "Start refused"))
    }
}
