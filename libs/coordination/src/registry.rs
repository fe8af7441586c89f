//! Lease-backed service registration.
//!
//! Registering an instance grants a lease, opens a keepalive stream for it,
//! starts a renewal task, and finally writes
//! `/services/<service>/<instance>` → `<host>:<port>` bound to the lease. The
//! record lives exactly as long as the lease: if the process stops renewing,
//! the store deletes it once the TTL runs out.
//!
//! Renewal tasks are owned by the [`Registrar`]. [`Registrar::shutdown`]
//! deregisters everything and joins the tasks; dropping the registrar stops
//! renewing, so its records disappear one TTL later.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{StoreClient, default_client};
use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::ServiceKey;
use crate::metrics;
use crate::models::{LeaseId, ServiceRecord};
use crate::store::LeaseKeepAlive;

/// store leases are granted in whole seconds
const MIN_TTL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Registration {
    record: ServiceRecord,
    token: CancellationToken,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Registers service instances and keeps their leases alive.
#[derive(Debug)]
pub struct Registrar {
    client: StoreClient,
    token: CancellationToken,
    registrations: Mutex<HashMap<ServiceKey, Registration>>,
}

impl Registrar {
    pub fn new(client: StoreClient) -> Self {
        Self {
            client,
            token: CancellationToken::new(),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Build a registrar on the process-wide client.
    pub fn from_default() -> CoordinationResult<Self> {
        Ok(Self::new(default_client()?))
    }

    /// Register with the configured lease TTL.
    pub async fn register_default_ttl(
        &self,
        service: &str,
        instance: &str,
        address: &str,
    ) -> CoordinationResult<ServiceRecord> {
        let ttl = self.client.config().lease_ttl();
        self.register(service, instance, address, ttl).await
    }

    /// Register `instance` of `service` at `address`.
    ///
    /// Returns once the record has been written. Any store failure along the
    /// way is returned and leaves no live lease behind. Registering a key
    /// that is already registered replaces it.
    pub async fn register(
        &self,
        service: &str,
        instance: &str,
        address: &str,
        ttl: Duration,
    ) -> CoordinationResult<ServiceRecord> {
        let key = ServiceKey::new(service, instance)?;
        if address.trim().is_empty() {
            return Err(CoordinationError::Config(format!(
                "address for {key} must not be empty"
            )));
        }
        if ttl < MIN_TTL {
            return Err(CoordinationError::Config(format!(
                "lease TTL for {key} must be at least {MIN_TTL:?}, got {ttl:?}"
            )));
        }
        if self.token.is_cancelled() {
            return Err(CoordinationError::Closed);
        }
        let store = self.client.store();

        let lease = store.grant_lease(ttl).await.inspect_err(|err| {
            metrics::REGISTRATION_FAILURES.with_label_values(&["lease"]).inc();
            warn!(?err, %key, "failed to create lease");
        })?;

        let keepalive = match store.keep_alive(lease).await {
            Ok(keepalive) => keepalive,
            Err(err) => {
                metrics::REGISTRATION_FAILURES.with_label_values(&["keepalive"]).inc();
                warn!(?err, %key, %lease, "failed to setup keepalive");
                self.revoke_orphan(&key, lease).await;
                return Err(err);
            }
        };

        let token = self.token.child_token();
        let alive = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(renew_lease(
            self.client.clone(),
            key.clone(),
            lease,
            ttl,
            keepalive,
            token.clone(),
            Arc::clone(&alive),
        ));

        if let Err(err) = store.put(&key.path(), address, Some(lease)).await {
            metrics::REGISTRATION_FAILURES.with_label_values(&["write"]).inc();
            warn!(?err, %key, %lease, "failed to register service");
            token.cancel();
            if let Err(err) = task.await {
                warn!(?err, %key, "renewal task failed");
            }
            self.revoke_orphan(&key, lease).await;
            return Err(err);
        }

        let record = ServiceRecord {
            key: key.clone(),
            address: address.to_owned(),
            lease,
        };
        let previous = self.registrations.lock().insert(
            key.clone(),
            Registration {
                record: record.clone(),
                token,
                alive,
                task,
            },
        );
        if let Some(previous) = previous {
            // the key now belongs to the new lease, the old one just expires
            debug!(%key, old_lease = %previous.record.lease, "replacing existing registration");
            previous.token.cancel();
        }

        metrics::REGISTRATIONS.inc();
        info!(%key, address, %lease, ?ttl, "service registered successfully");
        Ok(record)
    }

    /// Delete the record for `instance` of `service` and stop renewing its
    /// lease. Deleting a record that doesn't exist is not an error.
    pub async fn deregister(&self, service: &str, instance: &str) -> CoordinationResult<()> {
        let key = ServiceKey::new(service, instance)?;
        self.client
            .store()
            .delete(&key.path())
            .await
            .inspect_err(|err| warn!(?err, %key, "failed to deregister service"))?;

        let removed = self.registrations.lock().remove(&key);
        if let Some(registration) = removed {
            registration.token.cancel();
            if let Err(err) = registration.task.await {
                warn!(?err, %key, "renewal task failed");
            }
        }
        metrics::DEREGISTRATIONS.inc();
        info!(%key, "service deregistered");
        Ok(())
    }

    /// Whether `instance` of `service` is registered here and its lease is
    /// still being renewed.
    pub fn is_registered(&self, service: &str, instance: &str) -> bool {
        let Ok(key) = ServiceKey::new(service, instance) else {
            return false;
        };
        self.registrations
            .lock()
            .get(&key)
            .is_some_and(|r| r.alive.load(Ordering::Acquire))
    }

    /// Records registered through this registrar whose leases are still
    /// being renewed.
    pub fn registrations(&self) -> Vec<ServiceRecord> {
        let mut records = self
            .registrations
            .lock()
            .values()
            .filter(|r| r.alive.load(Ordering::Acquire))
            .map(|r| r.record.clone())
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Deregister every instance, stop all renewal tasks and wait for them.
    /// Later calls to `register` fail with `Closed`.
    pub async fn shutdown(&self) {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        self.token.cancel();
        for (key, registration) in registrations {
            match self.client.store().delete(&key.path()).await {
                Ok(()) => {
                    metrics::DEREGISTRATIONS.inc();
                    info!(%key, "service deregistered on shutdown");
                }
                Err(err) => warn!(?err, %key, "failed to deregister on shutdown"),
            }
            if let Err(err) = registration.task.await {
                warn!(?err, %key, "renewal task failed");
            }
        }
    }

    async fn revoke_orphan(&self, key: &ServiceKey, lease: LeaseId) {
        match self.client.store().revoke_lease(lease).await {
            Ok(()) => debug!(%key, %lease, "revoked lease of failed registration"),
            // it expires on its own once nothing renews it
            Err(err) => warn!(?err, %key, %lease, "failed to revoke lease of failed registration"),
        }
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Renew `lease` until cancelled or until the store reports it gone.
///
/// A keepalive error is retried on the next tick with a fresh stream; once a
/// whole TTL has passed without a successful renewal the store has already
/// dropped the lease and the registration is lost.
async fn renew_lease(
    client: StoreClient,
    key: ServiceKey,
    lease: LeaseId,
    ttl: Duration,
    mut keepalive: Box<dyn LeaseKeepAlive>,
    token: CancellationToken,
    alive: Arc<AtomicBool>,
) {
    metrics::ACTIVE_REGISTRATIONS.inc();
    let mut ticker = tokio::time::interval(client.config().keepalive_interval(ttl));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_renewed = Instant::now();
    let mut stream_broken = false;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(%key, %lease, "service registry context canceled");
                break;
            }
            _ = ticker.tick() => {}
        }

        if stream_broken {
            match client.store().keep_alive(lease).await {
                Ok(fresh) => {
                    keepalive = fresh;
                    stream_broken = false;
                }
                Err(err) => debug!(?err, %key, %lease, "failed to reopen keepalive stream"),
            }
        }

        let renewed = if stream_broken {
            None
        } else {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(%key, %lease, "service registry context canceled");
                    break;
                }
                renewed = keepalive.renew() => Some(renewed),
            }
        };

        match renewed {
            Some(Ok(Some(remaining))) => {
                metrics::LEASE_RENEWALS.inc();
                last_renewed = Instant::now();
                trace!(%key, %lease, ?remaining, "lease renewed");
                continue;
            }
            Some(Ok(None)) => {
                metrics::LEASES_LOST.inc();
                warn!(%key, %lease, "keepalive channel closed, registration lost");
                break;
            }
            Some(Err(err)) => {
                metrics::LEASE_RENEWAL_ERRORS.inc();
                warn!(?err, %key, %lease, "lease keepalive failed");
                stream_broken = true;
            }
            None => metrics::LEASE_RENEWAL_ERRORS.inc(),
        }

        if last_renewed.elapsed() >= ttl {
            metrics::LEASES_LOST.inc();
            warn!(%key, %lease, ?ttl, "lease not renewed within its TTL, registration lost");
            break;
        }
    }

    alive.store(false, Ordering::Release);
    metrics::ACTIVE_REGISTRATIONS.dec();
}
