//! Abstract coordination store interface.
//!
//! The registrar and resolver only ever talk to a [`CoordinationStore`]; the
//! etcd backend is the production implementation and [`MemoryStore`] is an
//! in-process store with the same lease and watch semantics.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoordinationResult;
use crate::models::{KeyValue, LeaseId, PrefixSnapshot, WatchEvent};

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Key/value store with leases and prefix watches.
///
/// Implementations must be safe to share between every registrar and
/// resolver in the process.
#[async_trait]
pub trait CoordinationStore: Send + Sync + Debug + 'static {
    /// Grant a lease that expires after `ttl` unless renewed.
    async fn grant_lease(&self, ttl: Duration) -> CoordinationResult<LeaseId>;

    /// Open a keepalive stream for `lease`.
    async fn keep_alive(&self, lease: LeaseId) -> CoordinationResult<Box<dyn LeaseKeepAlive>>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> CoordinationResult<()>;

    /// Write `key`, optionally bound to `lease`.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> CoordinationResult<()>;

    /// Read a single key.
    async fn get(&self, key: &str) -> CoordinationResult<Option<KeyValue>>;

    /// Read every key under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> CoordinationResult<PrefixSnapshot>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> CoordinationResult<()>;

    /// Subscribe to changes under `prefix`, starting at `start_revision`
    /// (inclusive) so nothing after a previous read is missed.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> CoordinationResult<Box<dyn WatchSession>>;

    /// Release this store's handle on the underlying connection. Calls made
    /// after close, through any clone, fail with `CoordinationError::Closed`.
    /// Calls already in flight and streams already open keep their own
    /// reference and run to completion; the connection itself is torn down
    /// once the last of them is dropped. Closing twice is a no-op.
    async fn close(&self) -> CoordinationResult<()>;
}

/// Keepalive stream for one lease.
#[async_trait]
pub trait LeaseKeepAlive: Send + Debug {
    /// Send one keepalive and wait for its response.
    ///
    /// `Ok(Some(ttl))` means the lease is alive with `ttl` remaining,
    /// `Ok(None)` means the lease is gone or the stream closed.
    async fn renew(&mut self) -> CoordinationResult<Option<Duration>>;
}

/// A cancellable subscription to changes under a prefix.
#[async_trait]
pub trait WatchSession: Send + Debug {
    /// Wait for the next change. `Ok(None)` means the stream ended.
    async fn next_event(&mut self) -> CoordinationResult<Option<WatchEvent>>;

    /// Tear the subscription down. Safe to call more than once.
    async fn cancel(&mut self);
}
