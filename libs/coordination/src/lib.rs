//! # coordination
//!
//! Dynamic service registration and discovery over a coordination store
//! (etcd v3, or the in-process [`MemoryStore`]).
//!
//! This library provides:
//! - **Store abstraction** with leases, prefix reads and prefix watches, and
//!   an etcd backend plus an in-memory backend for tests and demos.
//! - **Client handle** shared by every component, with an optional
//!   process-wide default.
//! - **Registrar** that publishes `/services/<service>/<instance>` records
//!   bound to a lease and keeps the lease alive.
//! - **Resolver** that turns a service prefix into a stream of complete
//!   address sets, reloading on every change.
//! - **Discovery** that binds a resolver to a load-balanced `tonic` channel.
//!
//! ## Design Principles
//!
//! - A record exists only while its lease does; a crashed instance
//!   disappears within one TTL.
//! - Resolvers always push full address sets, never deltas.
//! - Background work belongs to an owner and stops when the owner closes.

pub mod client;
pub mod discovery;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod resolver;
pub mod store;

// Re-export key types for convenient access
pub use client::{StoreClient, close_default, default_client, init_default, install_default};
pub use discovery::{Connection, Discovery};
pub use error::{CoordinationError, CoordinationResult};
pub use keys::{SERVICES_ROOT, ServiceKey, service_prefix};
pub use models::{AddressSet, LeaseId, ServiceRecord};
pub use registry::Registrar;
pub use resolver::{AddressSink, AddressUpdates, Resolver, ResolverState, resolve};
pub use store::{CoordinationStore, EtcdStore, MemoryStore};
