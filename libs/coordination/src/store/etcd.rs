//! etcd v3 backend.
//!
//! Wraps `etcd-client`. The client is cheap to clone; every call clones it
//! because the client API takes `&mut self`. Closing drops the shared handle,
//! so the connection goes away once in-flight calls and open streams finish.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::DiscoveryConfig;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions, WatchStream, Watcher,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{KeyValue, LeaseId, PrefixSnapshot, WatchEvent, WatchEventKind};
use crate::store::{CoordinationStore, LeaseKeepAlive, WatchSession};

/// Coordination store backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Arc<Mutex<Option<Client>>>,
    endpoints: Vec<String>,
}

impl EtcdStore {
    /// Dial the configured endpoints.
    ///
    /// The connection is checked with a status call inside the dial timeout
    /// so DNS, dial and auth failures surface here rather than on first use.
    pub async fn connect(cfg: &DiscoveryConfig) -> CoordinationResult<Self> {
        let mut opts = ConnectOptions::new().with_connect_timeout(cfg.dial_timeout());
        if let Some(timeout) = cfg.request_timeout() {
            opts = opts.with_timeout(timeout);
        }
        if let Some(creds) = cfg.credentials() {
            opts = opts.with_user(creds.username.clone(), creds.password.clone());
        }

        info!(endpoints = ?cfg.endpoints(), dial_timeout = ?cfg.dial_timeout(), "connecting to etcd");

        let dial = async {
            let mut client = Client::connect(cfg.endpoints(), Some(opts))
                .await
                .map_err(|e| CoordinationError::Connect(format!("failed to create etcd client: {e}")))?;
            client
                .status()
                .await
                .map_err(|e| CoordinationError::Connect(format!("etcd status check failed: {e}")))?;
            Ok::<_, CoordinationError>(client)
        };
        let client = tokio::time::timeout(cfg.dial_timeout(), dial)
            .await
            .map_err(|_| {
                CoordinationError::Connect(format!(
                    "dialing {:?} timed out after {:?}",
                    cfg.endpoints(),
                    cfg.dial_timeout()
                ))
            })??;

        info!(endpoints = ?cfg.endpoints(), "etcd connection established");
        Ok(Self::from_client(client, cfg.endpoints().to_vec()))
    }

    fn from_client(client: Client, endpoints: Vec<String>) -> Self {
        Self {
            client: Arc::new(Mutex::new(Some(client))),
            endpoints,
        }
    }

    fn client(&self) -> CoordinationResult<Client> {
        self.client.lock().clone().ok_or(CoordinationError::Closed)
    }
}

impl fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdStore")
            .field("endpoints", &self.endpoints)
            .field("closed", &self.client.lock().is_none())
            .finish_non_exhaustive()
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    // etcd leases have one second granularity
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl: Duration) -> CoordinationResult<LeaseId> {
        let resp = self
            .client()?
            .lease_grant(ttl_secs(ttl), None)
            .await
            .map_err(|e| CoordinationError::Lease(format!("failed to create lease: {e}")))?;
        Ok(LeaseId(resp.id()))
    }

    async fn keep_alive(&self, lease: LeaseId) -> CoordinationResult<Box<dyn LeaseKeepAlive>> {
        let (keeper, stream) = self
            .client()?
            .lease_keep_alive(lease.0)
            .await
            .map_err(|e| CoordinationError::KeepAlive(format!("failed to setup keepalive: {e}")))?;
        Ok(Box::new(EtcdKeepAlive {
            lease,
            keeper,
            stream,
        }))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> CoordinationResult<()> {
        self.client()?
            .lease_revoke(lease.0)
            .await
            .map_err(|e| CoordinationError::Lease(format!("failed to revoke lease {lease}: {e}")))?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> CoordinationResult<()> {
        let opts = lease.map(|lease| PutOptions::new().with_lease(lease.0));
        self.client()?
            .put(key, value, opts)
            .await
            .map_err(|e| CoordinationError::Write(format!("put failed for key '{key}': {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CoordinationResult<Option<KeyValue>> {
        let resp = self
            .client()?
            .get(key, None)
            .await
            .map_err(|e| CoordinationError::Read(format!("get failed for key '{key}': {e}")))?;
        Ok(resp.kvs().first().map(to_key_value))
    }

    async fn get_prefix(&self, prefix: &str) -> CoordinationResult<PrefixSnapshot> {
        let resp = self
            .client()?
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| {
                CoordinationError::Read(format!("prefix read failed for '{prefix}': {e}"))
            })?;
        Ok(PrefixSnapshot {
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
            entries: resp.kvs().iter().map(to_key_value).collect(),
        })
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        self.client()?
            .delete(key, None)
            .await
            .map_err(|e| CoordinationError::Write(format!("delete failed for key '{key}': {e}")))?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> CoordinationResult<Box<dyn WatchSession>> {
        let mut opts = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            opts = opts.with_start_revision(start_revision);
        }
        let (watcher, stream) = self
            .client()?
            .watch(prefix, Some(opts))
            .await
            .map_err(|e| CoordinationError::Watch(format!("failed to watch '{prefix}': {e}")))?;
        debug!(prefix, start_revision, watch_id = watcher.watch_id(), "etcd watch opened");
        Ok(Box::new(EtcdWatch {
            prefix: prefix.to_owned(),
            watcher,
            stream,
            pending: VecDeque::new(),
            cancelled: false,
        }))
    }

    async fn close(&self) -> CoordinationResult<()> {
        // in-flight calls hold their own clone and finish on their own
        if self.client.lock().take().is_some() {
            info!(endpoints = ?self.endpoints, "etcd client closed");
        }
        Ok(())
    }
}

struct EtcdKeepAlive {
    lease: LeaseId,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

impl fmt::Debug for EtcdKeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdKeepAlive")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LeaseKeepAlive for EtcdKeepAlive {
    async fn renew(&mut self) -> CoordinationResult<Option<Duration>> {
        self.keeper.keep_alive().await.map_err(|e| {
            CoordinationError::KeepAlive(format!("keepalive send failed for lease {}: {e}", self.lease))
        })?;
        match self.stream.message().await {
            // a zero TTL is how etcd reports an expired or revoked lease
            Ok(Some(resp)) if resp.ttl() > 0 => {
                Ok(Some(Duration::from_secs(resp.ttl().unsigned_abs())))
            }
            Ok(_) => Ok(None),
            Err(e) => Err(CoordinationError::KeepAlive(format!(
                "keepalive receive failed for lease {}: {e}",
                self.lease
            ))),
        }
    }
}

struct EtcdWatch {
    prefix: String,
    watcher: Watcher,
    stream: WatchStream,
    pending: VecDeque<WatchEvent>,
    cancelled: bool,
}

impl fmt::Debug for EtcdWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdWatch")
            .field("prefix", &self.prefix)
            .field("pending", &self.pending.len())
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WatchSession for EtcdWatch {
    async fn next_event(&mut self) -> CoordinationResult<Option<WatchEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let resp = match self.stream.message().await {
                Ok(Some(resp)) => resp,
                Ok(None) => return Ok(None),
                Err(e) => {
                    return Err(CoordinationError::Watch(format!(
                        "watch on '{}' failed: {e}",
                        self.prefix
                    )));
                }
            };
            if resp.compact_revision() > 0 {
                return Err(CoordinationError::Watch(format!(
                    "watch on '{}' fell behind compaction at revision {}",
                    self.prefix,
                    resp.compact_revision()
                )));
            }
            if resp.canceled() {
                return Err(CoordinationError::Watch(format!(
                    "watch on '{}' canceled by server: {}",
                    self.prefix,
                    resp.cancel_reason()
                )));
            }
            // created/progress responses carry no events
            for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                self.pending.push_back(WatchEvent {
                    kind: match event.event_type() {
                        EventType::Put => WatchEventKind::Put,
                        EventType::Delete => WatchEventKind::Delete,
                    },
                    key: String::from_utf8_lossy(kv.key()).into_owned(),
                    revision: kv.mod_revision(),
                });
            }
        }
    }

    async fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Err(err) = self.watcher.cancel().await {
            debug!(prefix = %self.prefix, %err, "etcd watch cancel failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_floor() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(5)), 5);
        assert_eq!(ttl_secs(Duration::from_millis(5_900)), 5);
    }

    #[tokio::test]
    async fn test_close_releases_client() {
        // connecting without credentials does not dial
        let client = Client::connect(["127.0.0.1:1"], None).await.unwrap();
        let store = EtcdStore::from_client(client, vec!["127.0.0.1:1".into()]);
        let clone = store.clone();

        store.close().await.unwrap();
        assert!(store.client.lock().is_none());
        assert!(matches!(clone.get("/a").await, Err(CoordinationError::Closed)));
        assert!(matches!(
            clone.grant_lease(Duration::from_secs(5)).await,
            Err(CoordinationError::Closed)
        ));
        // idempotent
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_connect_error() {
        let cfg = DiscoveryConfig::default()
            .with_endpoints(["127.0.0.1:1"])
            .with_lease_ttl(Duration::from_secs(5));
        match EtcdStore::connect(&cfg).await {
            Err(err) => assert!(matches!(err, CoordinationError::Connect(_)), "{err}"),
            Ok(store) => panic!("expected connect failure, got {store:?}"),
        }
    }
}
