//! Load-balanced connections that follow a service's registrations.
//!
//! [`Discovery::get_connection`] starts a [`Resolver`] for the service and
//! feeds each address set it pushes into a `tonic` balance channel, as
//! `Change::Insert` / `Change::Remove` against the previous set. The channel
//! is usable immediately, even before any instance is registered, and keeps
//! following membership until the connection is closed or dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tonic::transport::{Channel, Endpoint};
use tower::discover::Change;
use tracing::{debug, info, warn};

use crate::client::{StoreClient, default_client};
use crate::error::{CoordinationError, CoordinationResult};
use crate::models::AddressSet;
use crate::resolver::{AddressSink, Resolver, ResolverState};

/// scheme used to name discovery targets
pub const TARGET_SCHEME: &str = "etcd";
/// pending endpoint changes buffered for the balance channel
const BALANCE_BUFFER: usize = 1024;

/// Hands out connections to services by name.
#[derive(Debug, Clone)]
pub struct Discovery {
    client: StoreClient,
}

impl Discovery {
    pub fn new(client: StoreClient) -> Self {
        Self { client }
    }

    /// Build on the process-wide client.
    pub fn from_default() -> CoordinationResult<Self> {
        Ok(Self::new(default_client()?))
    }

    /// Connect to `service`, balancing requests across its registered
    /// instances. Must be called from within a tokio runtime.
    pub fn get_connection(&self, service: &str) -> CoordinationResult<Connection> {
        let target = format!("{TARGET_SCHEME}:///{service}");
        let (channel, tx) = Channel::balance_channel::<String>(BALANCE_BUFFER);
        let current = Arc::new(Mutex::new(AddressSet::new()));
        let sink = BalanceSink {
            target: target.clone(),
            tx,
            connect_timeout: self.client.config().dial_timeout(),
            request_timeout: self.client.config().request_timeout(),
            current: current.clone(),
        };
        let resolver = Resolver::start(self.client.clone(), service, sink)?;
        info!(%target, "connection created");
        Ok(Connection {
            target,
            channel,
            current,
            resolver,
        })
    }
}

/// A balanced channel plus the resolver keeping it up to date. Dropping the
/// connection stops the resolver.
#[derive(Debug)]
pub struct Connection {
    target: String,
    channel: Channel,
    current: Arc<Mutex<AddressSet>>,
    resolver: Resolver,
}

impl Connection {
    /// The channel to build clients on. Clones share the same balancer.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// `etcd:///<service>`
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The address set last applied to the balancer.
    pub async fn addresses(&self) -> AddressSet {
        self.current.lock().await.clone()
    }

    pub fn resolver_state(&self) -> ResolverState {
        self.resolver.state()
    }

    /// Force the resolver to reload the service's address set.
    pub fn resolve_now(&self) {
        self.resolver.resolve_now();
    }

    /// Stop following membership. Requests on existing clones of the
    /// channel keep using the last known endpoints.
    pub async fn close(&self) {
        self.resolver.close().await;
        debug!(target = %self.target, "connection closed");
    }
}

#[derive(Debug)]
struct BalanceSink {
    target: String,
    tx: mpsc::Sender<Change<String, Endpoint>>,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    current: Arc<Mutex<AddressSet>>,
}

impl BalanceSink {
    fn endpoint(&self, addr: &str) -> Option<Endpoint> {
        match Endpoint::from_shared(format!("http://{addr}")) {
            Ok(endpoint) => {
                let endpoint = endpoint.connect_timeout(self.connect_timeout);
                Some(match self.request_timeout {
                    Some(timeout) => endpoint.timeout(timeout),
                    None => endpoint,
                })
            }
            Err(err) => {
                warn!(?err, target = %self.target, addr, "skipping invalid address");
                None
            }
        }
    }

    async fn send(&self, change: Change<String, Endpoint>) -> CoordinationResult<()> {
        self.tx
            .send(change)
            .await
            .map_err(|_| CoordinationError::Push(format!("balancer for {} is gone", self.target)))
    }
}

#[async_trait]
impl AddressSink for BalanceSink {
    async fn update(&self, addresses: AddressSet) -> CoordinationResult<()> {
        let mut current = self.current.lock().await;
        // insert before removing so a replaced instance never leaves the
        // balancer empty
        for addr in addresses.added_since(&current) {
            if let Some(endpoint) = self.endpoint(addr) {
                self.send(Change::Insert(addr.to_owned(), endpoint)).await?;
                debug!(target = %self.target, addr, "endpoint added");
            }
        }
        for addr in addresses.removed_since(&current) {
            self.send(Change::Remove(addr.to_owned())).await?;
            debug!(target = %self.target, addr, "endpoint removed");
        }
        *current = addresses;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use config::DiscoveryConfig;

    use super::*;
    use crate::store::{CoordinationStore, MemoryStore};

    fn sink(tx: mpsc::Sender<Change<String, Endpoint>>) -> BalanceSink {
        BalanceSink {
            target: "etcd:///svc".into(),
            tx,
            connect_timeout: Duration::from_secs(1),
            request_timeout: None,
            current: Arc::default(),
        }
    }

    fn describe(change: Change<String, Endpoint>) -> String {
        match change {
            Change::Insert(key, _) => format!("+{key}"),
            Change::Remove(key) => format!("-{key}"),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Change<String, Endpoint>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(describe(change));
        }
        out
    }

    fn set(addrs: &[&str]) -> AddressSet {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    #[tokio::test]
    async fn test_sink_diffs_address_sets() {
        let (tx, mut rx) = mpsc::channel(16);
        let sink = sink(tx);

        sink.update(set(&["10.0.0.1:9000"])).await.unwrap();
        assert_eq!(drain(&mut rx), ["+10.0.0.1:9000"]);

        sink.update(set(&["10.0.0.1:9000", "10.0.0.2:9000"]))
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), ["+10.0.0.2:9000"]);

        // a replacement is inserted before the old address goes away
        sink.update(set(&["10.0.0.2:9000", "10.0.0.3:9000"]))
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            ["+10.0.0.3:9000", "-10.0.0.1:9000"]
        );

        // the same set again changes nothing
        sink.update(set(&["10.0.0.2:9000", "10.0.0.3:9000"]))
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        sink.update(AddressSet::new()).await.unwrap();
        assert_eq!(drain(&mut rx), ["-10.0.0.2:9000", "-10.0.0.3:9000"]);
    }

    #[tokio::test]
    async fn test_sink_skips_invalid_addresses() {
        let (tx, mut rx) = mpsc::channel(16);
        let sink = sink(tx);
        sink.update(set(&["not a host", "10.0.0.1:9000"]))
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), ["+10.0.0.1:9000"]);
    }

    #[tokio::test]
    async fn test_sink_fails_once_balancer_is_gone() {
        let (tx, rx) = mpsc::channel(16);
        let sink = sink(tx);
        drop(rx);
        assert!(matches!(
            sink.update(set(&["10.0.0.1:9000"])).await,
            Err(CoordinationError::Push(_))
        ));
        // nothing was applied, so the next attempt diffs from scratch
        assert!(sink.current.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_is_live_without_instances() {
        let store = MemoryStore::new();
        let discovery = Discovery::new(StoreClient::from_store(
            store.clone(),
            DiscoveryConfig::default(),
        ));
        let conn = discovery.get_connection("svc").unwrap();
        assert_eq!(conn.target(), "etcd:///svc");
        let _channel = conn.channel();
        assert!(conn.addresses().await.is_empty());

        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        conn.resolve_now();
        for _ in 0..50 {
            if !conn.addresses().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(conn.addresses().await, set(&["a:1"]));
        conn.close().await;
        assert_eq!(conn.resolver_state(), ResolverState::Stopped);
        // idempotent
        conn.close().await;
    }

    #[tokio::test]
    async fn test_invalid_service_rejected() {
        let discovery = Discovery::new(StoreClient::from_store(
            MemoryStore::new(),
            DiscoveryConfig::default(),
        ));
        assert!(matches!(
            discovery.get_connection("bad/name"),
            Err(CoordinationError::Config(_))
        ));
    }
}
