//! History and consent persistence over a [`KvStore`].
//!
//! Loading never fails: a missing, unreadable or corrupt value is logged and
//! read as empty history / no consent. Saving is logged on failure and
//! otherwise ignored.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::KvStore;
use crate::model::TestSession;

pub const HISTORY_KEY: &str = "stress_test_history";
pub const SAFETY_KEY: &str = "stress_test_safety_confirmed";

#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn KvStore>,
}

impl Persistence {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn load_history(&self) -> Vec<TestSession> {
        match self.store.get(HISTORY_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "stored history is corrupt, starting empty");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "failed to load history, starting empty");
                Vec::new()
            }
        }
    }

    pub fn load_safety_confirmed(&self) -> bool {
        match self.store.get(SAFETY_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "stored consent flag is corrupt, treating as unconfirmed");
                false
            }),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "failed to load consent flag, treating as unconfirmed");
                false
            }
        }
    }

    pub async fn save_history(&self, history: &[TestSession]) {
        match serde_json::to_string(history) {
            Ok(raw) => self.put(HISTORY_KEY, raw).await,
            Err(e) => error!(error = %e, "failed to serialize history"),
        }
    }

    pub async fn save_safety_confirmed(&self, confirmed: bool) {
        self.put(SAFETY_KEY, confirmed.to_string()).await;
    }

    async fn put(&self, key: &'static str, value: String) {
        let store = self.store.clone();
        let outcome = tokio::task::spawn_blocking(move || store.put(key, &value)).await;
        match outcome {
            Ok(Ok(())) => debug!(key, "persisted"),
            Ok(Err(e)) => error!(key, error = %e, "failed to persist"),
            Err(e) => error!(key, error = %e, "persistence task failed"),
        }
    }
}
