//! Async shell around [`SessionMachine`].
//!
//! Transitions are serialized by one async mutex. Keepalive and persistence
//! effects run while the lock is held, so no reader can observe `Running`
//! without an armed timer (or the reverse). Each step ends by publishing a
//! fresh snapshot on a `watch` channel.

use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::{Effect, OrchestratorState, SessionMachine, Transition};
use crate::client::EngineClient;
use crate::keepalive::Keepalive;
use crate::storage::Persistence;

pub struct StateStore {
    machine: Mutex<SessionMachine>,
    snapshot: watch::Sender<OrchestratorState>,
    keepalive: Keepalive,
    persistence: Persistence,
    client: EngineClient,
}

impl StateStore {
    pub fn new(
        machine: SessionMachine,
        keepalive: Keepalive,
        persistence: Persistence,
        client: EngineClient,
    ) -> Self {
        let (snapshot, _) = watch::channel(machine.state().clone());
        Self {
            machine: Mutex::new(machine),
            snapshot,
            keepalive,
            persistence,
            client,
        }
    }

    /// Apply `transition`, execute its side effects and publish the result.
    ///
    /// Returns the effects the caller must act on itself (`IssueStart`).
    pub async fn dispatch(&self, transition: Transition) -> Vec<Effect> {
        let mut machine = self.machine.lock().await;
        let effects = machine.apply(transition);

        let mut deferred = Vec::new();
        for effect in effects {
            match effect {
                Effect::ArmKeepalive => self.keepalive.arm(),
                Effect::DisarmKeepalive => {
                    self.keepalive.disarm();
                }
                Effect::PersistHistory(history) => self.persistence.save_history(&history).await,
                Effect::PersistSafety(confirmed) => {
                    self.persistence.save_safety_confirmed(confirmed).await
                }
                Effect::AbandonRemoteSession { test_id } => {
                    let client = self.client.clone();
                    tokio::spawn(async move {
                        match client.stop().await {
                            Ok(()) => debug!(%test_id, "stopped abandoned session"),
                            Err(e) => warn!(%test_id, error = %e, "failed to stop abandoned session"),
                        }
                    });
                }
                issue @ Effect::IssueStart { .. } => deferred.push(issue),
            }
        }

        self.snapshot.send_replace(machine.state().clone());
        deferred
    }

    pub fn snapshot(&self) -> OrchestratorState {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.snapshot.subscribe()
    }

    pub fn keepalive_armed(&self) -> bool {
        self.keepalive.is_armed()
    }

    /// Stop the keepalive timer without a state transition.
    pub fn halt_keepalive(&self) {
        self.keepalive.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RetryPolicy;
    use crate::engine::testing::TestEngine;
    use crate::model::{Intensity, TestConfiguration, TestKind, TestSession, TestStatus};
    use crate::storage::{persistence::HISTORY_KEY, KvStore, MemoryStore};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn store(engine: &Arc<TestEngine>, kv: Arc<MemoryStore>) -> StateStore {
        let client = EngineClient::new(engine.clone(), RetryPolicy::single());
        let keepalive = Keepalive::new(client.clone(), Duration::from_secs(15));
        StateStore::new(SessionMachine::new(100), keepalive, Persistence::new(kv), client)
    }

    fn session(id: &str) -> TestSession {
        let config = TestConfiguration {
            target_ip: "192.168.1.10".into(),
            test_type: TestKind::PingFlood,
            intensity: Intensity::Low,
            duration_seconds: 30,
        };
        TestSession::started(id.into(), &config)
    }

    #[tokio::test]
    async fn test_keepalive_follows_running() {
        let engine = Arc::new(TestEngine::default());
        let kv = Arc::new(MemoryStore::default());
        let store = store(&engine, kv.clone());

        let effects = store.dispatch(Transition::StartRequested).await;
        let generation = match effects.as_slice() {
            [Effect::IssueStart { generation }] => *generation,
            other => panic!("unexpected effects {other:?}"),
        };
        assert!(!store.keepalive_armed());

        store
            .dispatch(Transition::StartSucceeded {
                generation,
                session: session("abc-123"),
            })
            .await;
        assert!(store.keepalive_armed());
        assert_eq!(store.snapshot().status, TestStatus::Running);

        store.dispatch(Transition::StopSucceeded).await;
        assert!(!store.keepalive_armed());
        assert!(kv.get(HISTORY_KEY).unwrap().unwrap().contains("abc-123"));
    }

    #[tokio::test]
    async fn test_subscribers_see_every_step() {
        let engine = Arc::new(TestEngine::default());
        let store = store(&engine, Arc::new(MemoryStore::default()));
        let mut rx = store.subscribe();

        store.dispatch(Transition::SafetyConfirmed).await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().safety_confirmed);
    }

    #[tokio::test]
    async fn test_stale_start_is_stopped_on_engine() {
        let engine = Arc::new(TestEngine::default());
        let store = store(&engine, Arc::new(MemoryStore::default()));

        store.dispatch(Transition::StartRequested).await;
        store.dispatch(Transition::Reset).await;
        store
            .dispatch(Transition::StartSucceeded {
                generation: 0,
                session: session("late"),
            })
            .await;

        // Let the detached stop run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        assert!(!store.keepalive_armed());
        assert!(store.snapshot().current_session.is_none());
    }
}
