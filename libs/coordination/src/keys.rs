//! Key layout for service records in the coordination store.
//!
//! `"/services/<service>/<instance>"` → `"<host>:<port>"`. Independently
//! deployed components read and write this layout, so it must not change.

use std::fmt;

use crate::error::{CoordinationError, CoordinationResult};

/// Root under which every service record lives.
pub const SERVICES_ROOT: &str = "/services/";

/// Uniquely identifies one registered instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    service: String,
    instance: String,
}

impl ServiceKey {
    /// Build a key, rejecting components that would break the layout.
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> CoordinationResult<Self> {
        let service = service.into();
        let instance = instance.into();
        validate_component("service name", &service)?;
        validate_component("instance id", &instance)?;
        Ok(Self { service, instance })
    }

    /// Parse a full store key back into its components.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(SERVICES_ROOT)?;
        let (service, instance) = rest.split_once('/')?;
        Self::new(service, instance).ok()
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The store key this instance's record is written under.
    pub fn path(&self) -> String {
        format!("{SERVICES_ROOT}{}/{}", self.service, self.instance)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.instance)
    }
}

/// The prefix watched for a logical service. The trailing `/` keeps
/// `svc` from matching `svc-other`.
pub fn service_prefix(service: &str) -> CoordinationResult<String> {
    validate_component("service name", service)?;
    Ok(format!("{SERVICES_ROOT}{service}/"))
}

fn validate_component(what: &str, value: &str) -> CoordinationResult<()> {
    if value.is_empty() {
        return Err(CoordinationError::Config(format!("{what} must not be empty")));
    }
    if value.contains('/') {
        return Err(CoordinationError::Config(format!(
            "{what} '{value}' must not contain '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_path() {
        let key = ServiceKey::new("greeter-service", "instance-1234").unwrap();
        assert_eq!(key.path(), "/services/greeter-service/instance-1234");
        assert_eq!(key.to_string(), "greeter-service/instance-1234");
    }

    #[test]
    fn test_prefix() {
        assert_eq!(service_prefix("svc").unwrap(), "/services/svc/");
        let key = ServiceKey::new("svc", "i1").unwrap();
        assert!(key.path().starts_with(&service_prefix("svc").unwrap()));
        assert!(!key.path().starts_with(&service_prefix("sv").unwrap()));
    }

    #[test]
    fn test_parse_round_trip() {
        let key = ServiceKey::parse("/services/svc/i1").unwrap();
        assert_eq!(key.service(), "svc");
        assert_eq!(key.instance(), "i1");
        assert!(ServiceKey::parse("/services/svc").is_none());
        assert!(ServiceKey::parse("/services/svc/a/b").is_none());
        assert!(ServiceKey::parse("/other/svc/i1").is_none());
    }

    #[test]
    fn test_rejects_bad_components() {
        assert!(matches!(
            ServiceKey::new("", "i1"),
            Err(CoordinationError::Config(_))
        ));
        assert!(ServiceKey::new("svc", "").is_err());
        assert!(ServiceKey::new("a/b", "i1").is_err());
        assert!(ServiceKey::new("svc", "i/1").is_err());
        assert!(service_prefix("").is_err());
    }
}
