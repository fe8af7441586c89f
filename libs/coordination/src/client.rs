//! Process-wide handle to the coordination store.
//!
//! A [`StoreClient`] is a cheap, cloneable handle shared read-only by every
//! registrar and resolver. Most processes build exactly one through
//! [`init_default`]; initialization is serialized so concurrent first callers
//! never dial the store twice. Components take the handle explicitly, and
//! fall back to [`default_client`] only when built with `from_default`.

use std::sync::Arc;

use config::DiscoveryConfig;
use parking_lot::{RwLock, const_rwlock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::store::{CoordinationStore, EtcdStore};

static DEFAULT_CLIENT: RwLock<Option<StoreClient>> = const_rwlock(None);
static INIT_LOCK: Mutex<()> = Mutex::const_new(());

/// Handle to the coordination store plus the config it was built from.
#[derive(Debug, Clone)]
pub struct StoreClient {
    store: Arc<dyn CoordinationStore>,
    config: Arc<DiscoveryConfig>,
}

impl StoreClient {
    /// Connect to the etcd endpoints named in `config`.
    pub async fn connect(config: DiscoveryConfig) -> CoordinationResult<Self> {
        let store = EtcdStore::connect(&config).await?;
        Ok(Self::from_store(store, config))
    }

    /// Wrap an already constructed store.
    pub fn from_store<S: CoordinationStore>(store: S, config: DiscoveryConfig) -> Self {
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &dyn CoordinationStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Close the underlying connection. Every clone of this handle is
    /// affected.
    pub async fn close(&self) -> CoordinationResult<()> {
        self.store.close().await
    }

    fn same_as(&self, other: &StoreClient) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }
}

/// Connect the process-wide client if it isn't already, returning it.
///
/// Concurrent callers wait for the first one; a later call with a different
/// config gets the existing client back.
pub async fn init_default(config: DiscoveryConfig) -> CoordinationResult<StoreClient> {
    let _guard = INIT_LOCK.lock().await;
    if let Some(client) = DEFAULT_CLIENT.read().clone() {
        debug!("default coordination client already initialized");
        return Ok(client);
    }
    let client = StoreClient::connect(config).await?;
    *DEFAULT_CLIENT.write() = Some(client.clone());
    info!("default coordination client initialized");
    Ok(client)
}

/// Install an already built client as the process-wide default, unless one
/// is already set. Returns the client that ends up installed.
pub async fn install_default(client: StoreClient) -> StoreClient {
    let _guard = INIT_LOCK.lock().await;
    let mut slot = DEFAULT_CLIENT.write();
    match slot.as_ref() {
        Some(existing) => existing.clone(),
        None => {
            *slot = Some(client.clone());
            client
        }
    }
}

/// The process-wide client.
pub fn default_client() -> CoordinationResult<StoreClient> {
    DEFAULT_CLIENT
        .read()
        .clone()
        .ok_or(CoordinationError::NotInitialized)
}

/// Close the process-wide client. The slot is cleared only if closing
/// succeeds; closing when nothing is initialized is a no-op.
pub async fn close_default() -> CoordinationResult<()> {
    let _guard = INIT_LOCK.lock().await;
    let Some(client) = DEFAULT_CLIENT.read().clone() else {
        return Ok(());
    };
    if let Err(err) = client.close().await {
        warn!(?err, "failed to close default coordination client");
        return Err(err);
    }
    let mut slot = DEFAULT_CLIENT.write();
    if slot.as_ref().is_some_and(|c| c.same_as(&client)) {
        *slot = None;
    }
    info!("default coordination client closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    // the default slot is process-global, so everything touching it lives
    // in one test
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_default_client_lifecycle() {
        assert!(matches!(
            default_client(),
            Err(CoordinationError::NotInitialized)
        ));
        // nothing to close yet
        close_default().await.unwrap();

        let first = StoreClient::from_store(MemoryStore::new(), DiscoveryConfig::default());
        let installed = install_default(first.clone()).await;
        assert!(installed.same_as(&first));

        // a second install keeps the first client
        let second = StoreClient::from_store(MemoryStore::new(), DiscoveryConfig::default());
        let installed = install_default(second.clone()).await;
        assert!(installed.same_as(&first));
        assert!(!installed.same_as(&second));

        // init_default doesn't dial when a client exists
        let got = init_default(DiscoveryConfig::default()).await.unwrap();
        assert!(got.same_as(&first));
        assert!(default_client().unwrap().same_as(&first));

        close_default().await.unwrap();
        assert!(matches!(
            default_client(),
            Err(CoordinationError::NotInitialized)
        ));
        assert!(matches!(
            first.store().get("/x").await,
            Err(CoordinationError::Closed)
        ));

        // racing first users all end up with one client
        let candidates = (0..8)
            .map(|_| StoreClient::from_store(MemoryStore::new(), DiscoveryConfig::default()))
            .collect::<Vec<_>>();
        let tasks = candidates
            .iter()
            .cloned()
            .map(|client| tokio::spawn(install_default(client)))
            .collect::<Vec<_>>();
        let mut installed = Vec::with_capacity(tasks.len());
        for task in tasks {
            installed.push(task.await.unwrap());
        }
        let winner = default_client().unwrap();
        assert!(installed.iter().all(|c| c.same_as(&winner)));
        assert_eq!(candidates.iter().filter(|c| c.same_as(&winner)).count(), 1);
        close_default().await.unwrap();
    }

    #[tokio::test]
    async fn test_handles_share_store() {
        let store = MemoryStore::new();
        let client = StoreClient::from_store(store.clone(), DiscoveryConfig::default());
        let clone = client.clone();
        clone.store().put("/services/a/1", "x:1", None).await.unwrap();
        assert_eq!(store.value("/services/a/1").as_deref(), Some("x:1"));
        assert!(client.same_as(&clone));
    }
}
