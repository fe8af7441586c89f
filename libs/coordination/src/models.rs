//! Data carried between the store, the registrar and the resolver.

use std::collections::BTreeSet;
use std::fmt;

use tracing::warn;

use crate::keys::ServiceKey;

/// Opaque handle to a lease granted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One registered instance, as written by the registrar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub address: String,
    pub lease: LeaseId,
}

/// A raw key/value pair read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Everything under a prefix at one store revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSnapshot {
    /// store revision the read was served at
    pub revision: i64,
    pub entries: Vec<KeyValue>,
}

/// The kind of change a watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    pub revision: i64,
}

/// The set of reachable addresses for one service at a point in time.
///
/// Order is irrelevant; a `BTreeSet` keeps equality and iteration stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet(BTreeSet<String>);

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a set from a prefix read. Values that are empty or not UTF-8
    /// can't be dialed and are skipped.
    pub fn from_snapshot(snapshot: &PrefixSnapshot) -> Self {
        let mut set = BTreeSet::new();
        for kv in &snapshot.entries {
            match std::str::from_utf8(&kv.value) {
                Ok(addr) if !addr.trim().is_empty() => {
                    set.insert(addr.trim().to_owned());
                }
                Ok(_) => warn!(key = %kv.key, "skipping empty service address"),
                Err(err) => warn!(key = %kv.key, %err, "skipping non utf-8 service address"),
            }
        }
        Self(set)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.0.contains(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Addresses in `self` that are missing from `prev`.
    pub fn added_since<'a>(&'a self, prev: &'a AddressSet) -> impl Iterator<Item = &'a str> {
        self.0.difference(&prev.0).map(String::as_str)
    }

    /// Addresses in `prev` that are gone from `self`.
    pub fn removed_since<'a>(&'a self, prev: &'a AddressSet) -> impl Iterator<Item = &'a str> {
        prev.0.difference(&self.0).map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for AddressSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{addr}")?;
        }
        write!(f, "}}")
    }
}
