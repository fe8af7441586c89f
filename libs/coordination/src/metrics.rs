//! Registration and discovery metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
//! Registration failures are fatal (`.unwrap()`): a duplicate metric name is
//! a programming error that should surface at startup.
#![allow(missing_docs)]

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// process uptime, refreshed when metrics are scraped
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "process uptime (seconds)").unwrap();

    /// successful registrations
    pub static ref REGISTRATIONS: IntCounter = register_int_counter!(
        "discovery_registrations",
        "count of service instances registered"
    ).unwrap();

    /// registrations that failed, by the step that failed
    pub static ref REGISTRATION_FAILURES: IntCounterVec = register_int_counter_vec!(
        "discovery_registration_failures",
        "count of failed registrations by stage",
        &["stage"]
    ).unwrap();

    /// explicit deregistrations
    pub static ref DEREGISTRATIONS: IntCounter = register_int_counter!(
        "discovery_deregistrations",
        "count of service instances deregistered"
    ).unwrap();

    /// keepalive responses received
    pub static ref LEASE_RENEWALS: IntCounter = register_int_counter!(
        "discovery_lease_renewals",
        "count of lease keepalive responses received"
    ).unwrap();

    /// keepalive failures that were retried
    pub static ref LEASE_RENEWAL_ERRORS: IntCounter = register_int_counter!(
        "discovery_lease_renewal_errors",
        "count of keepalive attempts that failed"
    ).unwrap();

    /// leases the store reported as gone while we were still renewing
    pub static ref LEASES_LOST: IntCounter = register_int_counter!(
        "discovery_leases_lost",
        "count of registrations lost to lease expiry"
    ).unwrap();

    /// leases currently being renewed
    pub static ref ACTIVE_REGISTRATIONS: IntGauge = register_int_gauge!(
        "discovery_active_registrations",
        "count of registrations with a running keepalive loop"
    ).unwrap();

    /// address sets pushed to consumers
    pub static ref RESOLVER_PUSHES: IntCounter = register_int_counter!(
        "discovery_resolver_pushes",
        "count of address sets pushed by resolvers"
    ).unwrap();

    /// resolver errors absorbed and retried, by kind
    pub static ref RESOLVER_ERRORS: IntCounterVec = register_int_counter_vec!(
        "discovery_resolver_errors",
        "count of resolver errors by kind",
        &["kind"]
    ).unwrap();

    /// resolvers with a running watch loop
    pub static ref ACTIVE_RESOLVERS: IntGauge = register_int_gauge!(
        "discovery_active_resolvers",
        "count of running resolvers"
    ).unwrap();
}
