//! Push-channel ingestion.
//!
//! Owns the one live subscription to the engine's event channel and forwards
//! every event, in arrival order, to the state store as a `PushEvent`.
//! A terminal event for the tracked session is first enriched with the
//! engine's session snapshot so the failure reason reaches history.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::EngineClient;
use crate::engine::EngineEvent;
use crate::state::{StateStore, Transition};

pub struct EventIngestion {
    client: EngineClient,
    store: Arc<StateStore>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventIngestion {
    pub fn new(client: EngineClient, store: Arc<StateStore>) -> Self {
        Self {
            client,
            store,
            handle: Mutex::new(None),
        }
    }

    /// Open a subscription, tearing down any previous one first.
    pub fn subscribe(&self) {
        let mut slot = self.slot();
        if let Some(previous) = slot.take() {
            previous.abort();
            debug!("replaced push subscription");
        }
        let events = self.client.subscribe();
        *slot = Some(tokio::spawn(pump(events, self.client.clone(), self.store.clone())));
        info!("subscribed to engine events");
    }

    pub fn unsubscribe(&self) -> bool {
        match self.slot().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.slot().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for EventIngestion {
    fn drop(&mut self) {
        if let Some(handle) = self.slot().take() {
            handle.abort();
        }
    }
}

async fn pump(
    mut events: broadcast::Receiver<EngineEvent>,
    client: EngineClient,
    store: Arc<StateStore>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let transition = enrich(event, &client, &store).await;
                store.dispatch(transition).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged; dropped events");
            }
            Err(RecvError::Closed) => {
                info!("engine event channel closed");
                return;
            }
        }
    }
}

async fn enrich(event: EngineEvent, client: &EngineClient, store: &StateStore) -> Transition {
    if !event.status.is_terminal() {
        return Transition::PushEvent(event);
    }
    let Some(local_id) = store.snapshot().current_session.map(|s| s.test_id) else {
        return Transition::PushEvent(event);
    };

    match client.current_session().await {
        Ok(Some(remote)) if remote.test_id == local_id && remote.status == event.status => {
            Transition::Refreshed {
                status: event.status,
                metrics: event.metrics,
                session: Some(remote),
            }
        }
        Ok(_) => Transition::PushEvent(event),
        Err(e) => {
            debug!(error = %e, "session snapshot unavailable for terminal event");
            Transition::PushEvent(event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RetryPolicy;
    use crate::engine::testing::TestEngine;
    use crate::keepalive::Keepalive;
    use crate::model::{SessionMetrics, TestStatus};
    use crate::state::SessionMachine;
    use crate::storage::{MemoryStore, Persistence};
    use std::time::Duration;

    fn wire(engine: &Arc<TestEngine>) -> (EventIngestion, Arc<StateStore>) {
        let client = EngineClient::new(engine.clone(), RetryPolicy::single());
        let store = Arc::new(StateStore::new(
            SessionMachine::new(100),
            Keepalive::new(client.clone(), Duration::from_secs(15)),
            Persistence::new(Arc::new(MemoryStore::default())),
            client.clone(),
        ));
        (EventIngestion::new(client, store.clone()), store)
    }

    fn event(sent: u32) -> EngineEvent {
        EngineEvent {
            status: TestStatus::Idle,
            metrics: SessionMetrics {
                packets_sent: sent,
                ..SessionMetrics::default()
            },
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_events_fold_into_state() {
        let engine = Arc::new(TestEngine::default());
        let (ingest, store) = wire(&engine);
        let mut rx = store.subscribe();

        ingest.subscribe();
        engine.events.send(event(12)).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().metrics.packets_sent, 12);
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_one_receiver() {
        let engine = Arc::new(TestEngine::default());
        let (ingest, _store) = wire(&engine);

        ingest.subscribe();
        ingest.subscribe();
        ingest.subscribe();
        settle().await;

        // Aborted pumps drop their receivers.
        assert_eq!(engine.events.receiver_count(), 1);
        assert!(ingest.is_subscribed());

        assert!(ingest.unsubscribe());
        settle().await;
        assert_eq!(engine.events.receiver_count(), 0);
        assert!(!ingest.unsubscribe());
    }
}
