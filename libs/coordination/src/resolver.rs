//! Watch-driven address resolution for one service.
//!
//! A [`Resolver`] runs a single background task per service name:
//!
//! ```text
//! Loading ──read ok, push ok──▶ Watching ──any event / watch error──▶ Loading
//!    ▲  │                           │
//!    └──┘ read or push failed,      └──close()──▶ Stopped
//!         wait backoff
//! ```
//!
//! Every change under the service prefix triggers a full re-read of the
//! prefix, so consumers only ever see complete address sets, in the order
//! the store produced them. The watch starts at the revision right after the
//! snapshot so nothing written between the read and the watch is missed.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::StoreClient;
use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::service_prefix;
use crate::metrics;
use crate::models::AddressSet;

/// pending address sets buffered for a `resolve` consumer
const UPDATE_BUFFER: usize = 16;

/// Receives every address set a resolver produces.
#[async_trait]
pub trait AddressSink: Send + Sync + 'static {
    /// Replace the consumer's view with `addresses`. An error makes the
    /// resolver back off and reload.
    async fn update(&self, addresses: AddressSet) -> CoordinationResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Loading,
    Watching,
    Stopped,
}

/// Handle to a running resolver task. Dropping it cancels the task.
#[derive(Debug)]
pub struct Resolver {
    service: String,
    token: CancellationToken,
    refresh: Arc<Notify>,
    state: watch::Receiver<ResolverState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Resolver {
    /// Start resolving `service`, pushing each address set into `sink`.
    pub fn start<S: AddressSink>(
        client: StoreClient,
        service: &str,
        sink: S,
    ) -> CoordinationResult<Self> {
        let prefix = service_prefix(service)?;
        let token = CancellationToken::new();
        let refresh = Arc::new(Notify::new());
        let (state_tx, state) = watch::channel(ResolverState::Loading);
        let backoff = client.config().retry_backoff();

        let task = tokio::spawn(
            ResolverLoop {
                client,
                service: service.to_owned(),
                prefix,
                backoff,
                sink,
                token: token.clone(),
                refresh: Arc::clone(&refresh),
                state: state_tx,
            }
            .run(),
        );
        info!(service, "resolver started");

        Ok(Self {
            service: service.to_owned(),
            token,
            refresh,
            state,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> ResolverState {
        *self.state.borrow()
    }

    /// Wait until the resolver reaches `state`. Returns immediately if the
    /// resolver stopped first.
    pub async fn wait_for(&self, state: ResolverState) -> ResolverState {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state || *s == ResolverState::Stopped)
            .await
            .map_or(ResolverState::Stopped, |current| *current)
    }

    /// Drop the current watch and reload the address set.
    pub fn resolve_now(&self) {
        trace!(service = %self.service, "refresh requested");
        self.refresh.notify_one();
    }

    /// Stop the resolver and wait for its task to exit. Safe to call more
    /// than once and from any state.
    pub async fn close(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(?err, service = %self.service, "resolver task failed");
            }
            info!(service = %self.service, "resolver stopped");
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct ResolverLoop<S> {
    client: StoreClient,
    service: String,
    prefix: String,
    backoff: Duration,
    sink: S,
    token: CancellationToken,
    refresh: Arc<Notify>,
    state: watch::Sender<ResolverState>,
}

impl<S: AddressSink> ResolverLoop<S> {
    async fn run(self) {
        metrics::ACTIVE_RESOLVERS.inc();
        loop {
            self.state.send_replace(ResolverState::Loading);
            let Some(revision) = self.load().await else {
                break;
            };
            self.state.send_replace(ResolverState::Watching);
            if !self.watch(revision).await {
                break;
            }
        }
        self.state.send_replace(ResolverState::Stopped);
        metrics::ACTIVE_RESOLVERS.dec();
    }

    /// Read the prefix and push it until both succeed. Returns the revision
    /// of the pushed snapshot, or `None` once cancelled.
    async fn load(&self) -> Option<i64> {
        let store = self.client.store();
        loop {
            let snapshot = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                snapshot = store.get_prefix(&self.prefix) => snapshot,
            };
            match snapshot {
                Ok(snapshot) => {
                    let addresses = AddressSet::from_snapshot(&snapshot);
                    let shown = addresses.to_string();
                    let pushed = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => return None,
                        pushed = self.sink.update(addresses) => pushed,
                    };
                    match pushed {
                        Ok(()) => {
                            metrics::RESOLVER_PUSHES.inc();
                            debug!(
                                service = %self.service,
                                revision = snapshot.revision,
                                addresses = %shown,
                                "pushed address set"
                            );
                            return Some(snapshot.revision);
                        }
                        Err(err) => {
                            metrics::RESOLVER_ERRORS.with_label_values(&["push"]).inc();
                            warn!(?err, service = %self.service, "failed to update address set");
                        }
                    }
                }
                Err(err) => {
                    metrics::RESOLVER_ERRORS.with_label_values(&["read"]).inc();
                    warn!(?err, service = %self.service, "failed to read service prefix");
                }
            }
            if !self.backoff().await {
                return None;
            }
        }
    }

    /// Watch the prefix from `revision + 1` until something changes. Returns
    /// false once cancelled.
    async fn watch(&self, revision: i64) -> bool {
        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return false,
            opened = self.client.store().watch_prefix(&self.prefix, revision + 1) => opened,
        };
        let mut session = match opened {
            Ok(session) => session,
            Err(err) => {
                metrics::RESOLVER_ERRORS.with_label_values(&["watch"]).inc();
                warn!(?err, service = %self.service, "failed to open watch");
                return self.backoff().await;
            }
        };

        let reason = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            _ = self.refresh.notified() => Some("refresh requested"),
            event = session.next_event() => Some(match event {
                Ok(Some(event)) => {
                    trace!(service = %self.service, key = %event.key, kind = ?event.kind, revision = event.revision, "watch event");
                    "change observed"
                }
                Ok(None) => {
                    metrics::RESOLVER_ERRORS.with_label_values(&["watch"]).inc();
                    debug!(service = %self.service, "watch closed");
                    "watch closed"
                }
                Err(err) => {
                    metrics::RESOLVER_ERRORS.with_label_values(&["watch"]).inc();
                    warn!(?err, service = %self.service, "watch failed");
                    "watch failed"
                }
            }),
        };
        session.cancel().await;

        match reason {
            Some(reason) => {
                debug!(service = %self.service, reason, "reloading address set");
                true
            }
            None => false,
        }
    }

    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }
}

/// Stream of address sets produced by [`resolve`].
#[derive(Debug)]
pub struct AddressUpdates {
    rx: ReceiverStream<AddressSet>,
}

impl AddressUpdates {
    /// Next address set, or `None` once the resolver has stopped.
    pub async fn next(&mut self) -> Option<AddressSet> {
        self.rx.next().await
    }
}

impl Stream for AddressUpdates {
    type Item = AddressSet;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

#[derive(Debug)]
struct ChannelSink {
    tx: mpsc::Sender<AddressSet>,
}

#[async_trait]
impl AddressSink for ChannelSink {
    async fn update(&self, addresses: AddressSet) -> CoordinationResult<()> {
        self.tx
            .send(addresses)
            .await
            .map_err(|_| CoordinationError::Push("address set receiver dropped".into()))
    }
}

/// Resolve `service`, returning the stream of address sets and the resolver
/// that feeds it. Close the resolver to end the stream.
pub fn resolve(
    client: StoreClient,
    service: &str,
) -> CoordinationResult<(AddressUpdates, Resolver)> {
    let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
    let resolver = Resolver::start(client, service, ChannelSink { tx })?;
    Ok((
        AddressUpdates {
            rx: ReceiverStream::new(rx),
        },
        resolver,
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use config::DiscoveryConfig;

    use super::*;
    use crate::store::{CoordinationStore, MemoryStore};

    fn client(store: &MemoryStore) -> StoreClient {
        StoreClient::from_store(store.clone(), DiscoveryConfig::default())
    }

    fn set(addrs: &[&str]) -> AddressSet {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    async fn next(updates: &mut AddressUpdates) -> AddressSet {
        tokio::time::timeout(Duration::from_secs(30), updates.next())
            .await
            .expect("timed out waiting for address set")
            .expect("resolver stopped")
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_push_then_watching() {
        let store = MemoryStore::new();
        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        store.put("/services/other/i1", "z:1", None).await.unwrap();

        let (mut updates, resolver) = resolve(client(&store), "svc").unwrap();
        assert_eq!(next(&mut updates).await, set(&["a:1"]));
        assert_eq!(
            resolver.wait_for(ResolverState::Watching).await,
            ResolverState::Watching
        );
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_service_pushes_empty_set() {
        let store = MemoryStore::new();
        let (mut updates, resolver) = resolve(client(&store), "svc").unwrap();
        assert!(next(&mut updates).await.is_empty());
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_refresh_on_every_change() {
        let store = MemoryStore::new();
        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        let (mut updates, resolver) = resolve(client(&store), "svc").unwrap();
        assert_eq!(next(&mut updates).await, set(&["a:1"]));
        resolver.wait_for(ResolverState::Watching).await;

        store.put("/services/svc/i2", "b:1", None).await.unwrap();
        assert_eq!(next(&mut updates).await, set(&["a:1", "b:1"]));

        store.delete("/services/svc/i1").await.unwrap();
        assert_eq!(next(&mut updates).await, set(&["b:1"]));
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_between_read_and_watch_is_seen() {
        let store = MemoryStore::new();
        let (mut updates, resolver) = resolve(client(&store), "svc").unwrap();
        assert!(next(&mut updates).await.is_empty());
        // written before the resolver gets to open its watch
        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        assert_eq!(next(&mut updates).await, set(&["a:1"]));
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_retried_after_backoff() {
        let store = MemoryStore::new();
        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        store.set_unavailable(true);

        let (mut updates, resolver) = resolve(client(&store), "svc").unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(resolver.state(), ResolverState::Loading);
        assert!(
            tokio::time::timeout(Duration::from_millis(10), updates.next())
                .await
                .is_err()
        );

        store.set_unavailable(false);
        assert_eq!(next(&mut updates).await, set(&["a:1"]));
        resolver.close().await;
    }

    #[derive(Debug, Default)]
    struct FlakySink {
        failures: AtomicUsize,
        seen: Mutex<Vec<AddressSet>>,
    }

    #[async_trait]
    impl AddressSink for Arc<FlakySink> {
        async fn update(&self, addresses: AddressSet) -> CoordinationResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CoordinationError::Push("not ready".into()));
            }
            self.seen.lock().push(addresses);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_failure_retried() {
        let store = MemoryStore::new();
        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        let sink = Arc::new(FlakySink {
            failures: AtomicUsize::new(2),
            ..Default::default()
        });
        let resolver = Resolver::start(client(&store), "svc", Arc::clone(&sink)).unwrap();

        resolver.wait_for(ResolverState::Watching).await;
        assert_eq!(sink.failures.load(Ordering::SeqCst), 0);
        assert_eq!(*sink.seen.lock(), vec![set(&["a:1"])]);
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_survives_watch_disconnect() {
        let store = MemoryStore::new();
        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        let (mut updates, resolver) = resolve(client(&store), "svc").unwrap();
        assert_eq!(next(&mut updates).await, set(&["a:1"]));
        resolver.wait_for(ResolverState::Watching).await;

        store.disconnect_watches();
        // a disconnect is handled like a change
        assert_eq!(next(&mut updates).await, set(&["a:1"]));
        resolver.wait_for(ResolverState::Watching).await;

        store.put("/services/svc/i2", "b:1", None).await.unwrap();
        assert_eq!(next(&mut updates).await, set(&["a:1", "b:1"]));
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_now_reloads() {
        let store = MemoryStore::new();
        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        let (mut updates, resolver) = resolve(client(&store), "svc").unwrap();
        assert_eq!(next(&mut updates).await, set(&["a:1"]));
        resolver.wait_for(ResolverState::Watching).await;

        resolver.resolve_now();
        assert_eq!(next(&mut updates).await, set(&["a:1"]));
        resolver.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_ends_stream() {
        let store = MemoryStore::new();
        let (mut updates, resolver) = resolve(client(&store), "svc").unwrap();
        next(&mut updates).await;

        resolver.close().await;
        assert_eq!(resolver.state(), ResolverState::Stopped);
        resolver.close().await;

        store.put("/services/svc/i1", "a:1", None).await.unwrap();
        assert_eq!(updates.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_loading() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let (_updates, resolver) = resolve(client(&store), "svc").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        resolver.close().await;
        assert_eq!(resolver.state(), ResolverState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_service_name() {
        let store = MemoryStore::new();
        assert!(matches!(
            resolve(client(&store), ""),
            Err(CoordinationError::Config(_))
        ));
        assert!(matches!(
            resolve(client(&store), "a/b"),
            Err(CoordinationError::Config(_))
        ));
    }
}
