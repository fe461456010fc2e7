use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenVerifier;
use crate::db::SqliteStore;
use crate::error::{ChatError, StoreError};
use crate::presence::{GroupPresenceIndex, LifecycleLocks};
use crate::store::{GroupDirectory, MessageStore, UserDirectory};
use crate::ws::broadcast::Dispatcher;
use crate::ws::ConnectionRegistry;

/// Runtime knobs taken from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Deadline for every store call.
    pub store_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(5000),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Live connection per user
    pub connections: Arc<ConnectionRegistry>,
    /// Online members per group
    pub presence: Arc<GroupPresenceIndex>,
    pub dispatcher: Dispatcher,
    pub users: Arc<dyn UserDirectory>,
    pub groups: Arc<dyn GroupDirectory>,
    pub messages: Arc<dyn MessageStore>,
    /// Handshake token check
    pub verifier: Arc<dyn TokenVerifier>,
    /// Serialises connect/disconnect/membership changes per user
    pub lifecycle: Arc<LifecycleLocks>,
    pub settings: Settings,
}

impl AppState {
    /// State backed by one SQLite store for all three collaborators.
    pub fn new(store: SqliteStore, verifier: Arc<dyn TokenVerifier>, settings: Settings) -> Self {
        let store = Arc::new(store);
        Self::with_stores(store.clone(), store.clone(), store, verifier, settings)
    }

    pub fn with_stores(
        users: Arc<dyn UserDirectory>,
        groups: Arc<dyn GroupDirectory>,
        messages: Arc<dyn MessageStore>,
        verifier: Arc<dyn TokenVerifier>,
        settings: Settings,
    ) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(GroupPresenceIndex::new());
        let dispatcher = Dispatcher::new(connections.clone(), presence.clone());
        Self {
            connections,
            presence,
            dispatcher,
            users,
            groups,
            messages,
            verifier,
            lifecycle: Arc::new(LifecycleLocks::new()),
            settings,
        }
    }

    /// Run a synchronous store operation on the blocking pool under the store
    /// deadline. A timeout is a write failure: the caller must not assume the
    /// operation took effect, and must not assume it did not.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, ChatError>
    where
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::task::spawn_blocking(op);
        match tokio::time::timeout(self.settings.store_timeout, task).await {
            Ok(Ok(result)) => result.map_err(ChatError::from),
            Ok(Err(e)) => Err(ChatError::Persistence(format!("store task failed: {e}"))),
            Err(_) => Err(ChatError::Persistence("store call timed out".to_string())),
        }
    }
}
