//! In-process coordination store.
//!
//! Keeps the semantics the registrar and resolver depend on: revisions,
//! leases that expire on a timer unless renewed, keys deleted with their
//! lease, and prefix watches that can start from an earlier revision. Used by
//! the tests and by `svcd --memory`.
//!
//! Faults can be injected to exercise the retry paths: the whole store can be
//! made unavailable, writes can be rejected, and open watches can be reset.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{KeyValue, LeaseId, PrefixSnapshot, WatchEvent, WatchEventKind};
use crate::store::{CoordinationStore, LeaseKeepAlive, WatchSession};

/// Number of past events kept for watches that start at an old revision.
const HISTORY_LIMIT: usize = 4096;
/// Broadcast capacity; a watcher that falls this far behind gets reset.
const EVENT_CAPACITY: usize = 1024;

/// In-process [`CoordinationStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    resets: watch::Sender<u64>,
    unavailable: AtomicBool,
    reject_writes: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    revision: i64,
    next_lease: i64,
    data: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: VecDeque<WatchEvent>,
    closed: bool,
}

#[derive(Debug)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (resets, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_lease: 1,
                    ..State::default()
                }),
                events,
                resets,
                unavailable: AtomicBool::new(false),
                reject_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Make every call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make key writes fail while reads, leases and watches keep working.
    pub fn set_reject_writes(&self, reject: bool) {
        self.inner.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Terminate every open watch with an error, as a dropped stream would.
    pub fn disconnect_watches(&self) {
        self.inner.resets.send_modify(|epoch| *epoch += 1);
    }

    /// Current value of `key`, bypassing fault injection.
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.state.lock().data.get(key).map(|e| e.value.clone())
    }

    /// Keys under `prefix`, bypassing fault injection.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Whether `lease` is still alive.
    pub fn has_lease(&self, lease: LeaseId) -> bool {
        self.inner.state.lock().leases.contains_key(&lease)
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    fn check(&self, err: fn(String) -> CoordinationError) -> CoordinationResult<()> {
        if self.inner.state.lock().closed {
            return Err(CoordinationError::Closed);
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(err("memory store unavailable".into()));
        }
        Ok(())
    }

    fn spawn_expiry(&self, lease: LeaseId) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(expire_lease(weak, lease));
    }
}

impl Inner {
    /// Apply a change: bump the revision, record it and tell the watchers.
    /// Must be called with the state lock held.
    fn emit(&self, state: &mut State, kind: WatchEventKind, key: &str) {
        state.revision += 1;
        let event = WatchEvent {
            kind,
            key: key.to_owned(),
            revision: state.revision,
        };
        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn remove_key(&self, state: &mut State, key: &str) -> bool {
        let Some(entry) = state.data.remove(key) else {
            return false;
        };
        if let Some(lease) = entry.lease {
            if let Some(lease) = state.leases.get_mut(&lease) {
                lease.keys.remove(key);
            }
        }
        self.emit(state, WatchEventKind::Delete, key);
        true
    }

    fn drop_lease(&self, state: &mut State, lease: LeaseId) -> bool {
        let Some(entry) = state.leases.remove(&lease) else {
            return false;
        };
        for key in entry.keys {
            if state.data.get(&key).is_some_and(|e| e.lease == Some(lease)) {
                state.data.remove(&key);
                self.emit(state, WatchEventKind::Delete, &key);
            }
        }
        true
    }
}

async fn expire_lease(weak: Weak<Inner>, lease: LeaseId) {
    loop {
        let deadline = {
            let Some(inner) = weak.upgrade() else { return };
            let state = inner.state.lock();
            match state.leases.get(&lease) {
                Some(entry) => entry.deadline,
                None => return,
            }
        };
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = weak.upgrade() else { return };
        let mut state = inner.state.lock();
        let due = match state.leases.get(&lease) {
            Some(entry) => entry.deadline <= Instant::now(),
            None => return,
        };
        // otherwise it was renewed while we slept
        if due {
            debug!(%lease, "memory store lease expired");
            inner.drop_lease(&mut state, lease);
            return;
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> CoordinationResult<LeaseId> {
        self.check(CoordinationError::Lease)?;
        let lease = {
            let mut state = self.inner.state.lock();
            let lease = LeaseId(state.next_lease);
            state.next_lease += 1;
            state.leases.insert(
                lease,
                LeaseEntry {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            lease
        };
        self.spawn_expiry(lease);
        trace!(%lease, ?ttl, "memory store lease granted");
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> CoordinationResult<Box<dyn LeaseKeepAlive>> {
        self.check(CoordinationError::KeepAlive)?;
        if !self.has_lease(lease) {
            return Err(CoordinationError::KeepAlive(format!(
                "lease {lease} not found"
            )));
        }
        Ok(Box::new(MemoryKeepAlive {
            store: self.clone(),
            lease,
        }))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> CoordinationResult<()> {
        self.check(CoordinationError::Lease)?;
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if inner.drop_lease(&mut state, lease) {
            Ok(())
        } else {
            Err(CoordinationError::Lease(format!("lease {lease} not found")))
        }
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> CoordinationResult<()> {
        self.check(CoordinationError::Write)?;
        if self.inner.reject_writes.load(Ordering::SeqCst) {
            return Err(CoordinationError::Write(format!(
                "put rejected for key '{key}'"
            )));
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if let Some(lease) = lease {
            let entry = state.leases.get_mut(&lease).ok_or_else(|| {
                CoordinationError::Write(format!("requested lease {lease} not found"))
            })?;
            entry.keys.insert(key.to_owned());
        }
        let previous = state.data.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                lease,
            },
        );
        if let Some(old) = previous.and_then(|e| e.lease).filter(|old| Some(*old) != lease) {
            if let Some(old) = state.leases.get_mut(&old) {
                old.keys.remove(key);
            }
        }
        inner.emit(&mut state, WatchEventKind::Put, key);
        Ok(())
    }

    async fn get(&self, key: &str) -> CoordinationResult<Option<KeyValue>> {
        self.check(CoordinationError::Read)?;
        Ok(self.value(key).map(|value| KeyValue {
            key: key.to_owned(),
            value: value.into_bytes(),
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> CoordinationResult<PrefixSnapshot> {
        self.check(CoordinationError::Read)?;
        let state = self.inner.state.lock();
        Ok(PrefixSnapshot {
            revision: state.revision,
            entries: state
                .data
                .range(prefix.to_owned()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| KeyValue {
                    key: k.clone(),
                    value: e.value.clone().into_bytes(),
                })
                .collect(),
        })
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        self.check(CoordinationError::Write)?;
        if self.inner.reject_writes.load(Ordering::SeqCst) {
            return Err(CoordinationError::Write(format!(
                "delete rejected for key '{key}'"
            )));
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        inner.remove_key(&mut state, key);
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> CoordinationResult<Box<dyn WatchSession>> {
        self.check(CoordinationError::Watch)?;
        let state = self.inner.state.lock();
        if start_revision > 0 {
            if let Some(oldest) = state.history.front() {
                if start_revision < oldest.revision {
                    return Err(CoordinationError::Watch(format!(
                        "revision {start_revision} has been compacted"
                    )));
                }
            }
        }
        // subscribe under the lock so nothing slips between replay and live events
        let events = self.inner.events.subscribe();
        let resets = self.inner.resets.subscribe();
        let replay = state
            .history
            .iter()
            .filter(|e| e.revision >= start_revision && e.key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(Box::new(MemoryWatch {
            prefix: prefix.to_owned(),
            start_revision,
            replay,
            events,
            resets,
            cancelled: false,
        }))
    }

    async fn close(&self) -> CoordinationResult<()> {
        self.inner.state.lock().closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryKeepAlive {
    store: MemoryStore,
    lease: LeaseId,
}

#[async_trait]
impl LeaseKeepAlive for MemoryKeepAlive {
    async fn renew(&mut self) -> CoordinationResult<Option<Duration>> {
        match self.store.check(CoordinationError::KeepAlive) {
            Err(CoordinationError::Closed) => return Ok(None),
            other => other?,
        }
        let mut state = self.store.inner.state.lock();
        let now = Instant::now();
        match state.leases.get_mut(&self.lease) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + entry.ttl;
                Ok(Some(entry.ttl))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug)]
struct MemoryWatch {
    prefix: String,
    start_revision: i64,
    replay: VecDeque<WatchEvent>,
    events: broadcast::Receiver<WatchEvent>,
    resets: watch::Receiver<u64>,
    cancelled: bool,
}

#[async_trait]
impl WatchSession for MemoryWatch {
    async fn next_event(&mut self) -> CoordinationResult<Option<WatchEvent>> {
        if self.cancelled {
            return Ok(None);
        }
        if let Some(event) = self.replay.pop_front() {
            return Ok(Some(event));
        }
        loop {
            tokio::select! {
                changed = self.resets.changed() => {
                    return match changed {
                        Ok(()) => Err(CoordinationError::Watch(format!(
                            "watch on '{}' reset",
                            self.prefix
                        ))),
                        Err(_) => Ok(None),
                    };
                }
                event = self.events.recv() => match event {
                    Ok(event) if event.revision >= self.start_revision && event.key.starts_with(&self.prefix) => {
                        return Ok(Some(event));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Err(CoordinationError::Watch(format!(
                            "watch on '{}' lagged by {n} events",
                            self.prefix
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
            }
        }
    }

    async fn cancel(&mut self) {
        self.cancelled = true;
        self.replay.clear();
    }
}
