//! The member record advertised by each server in a set.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A host and port a service can be reached at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Advertised health of a member. Strings this version does not know
/// decode as `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    #[default]
    Alive,
    Starting,
    Stopping,
    Stopped,
    Warning,
    #[serde(other)]
    Unknown,
}

/// One registered server: its primary endpoint, named auxiliary endpoints,
/// status and optional shard id.
///
/// Equality is content equality, so two members advertising the same
/// endpoints compare equal even though they are distinct registrations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_endpoint: Endpoint,
    #[serde(default)]
    pub additional_endpoints: BTreeMap<String, Endpoint>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<u32>,
}

impl ServiceInstance {
    /// An alive member with no auxiliary endpoints and no shard.
    pub fn new(service_endpoint: impl Into<Endpoint>) -> Self {
        Self {
            service_endpoint: service_endpoint.into(),
            additional_endpoints: BTreeMap::new(),
            status: Status::Alive,
            shard: None,
        }
    }

    /// Build the record a `join` advertises.
    pub fn from_addrs(
        endpoint: SocketAddr,
        additional: &HashMap<String, SocketAddr>,
        shard: Option<u32>,
    ) -> Self {
        Self {
            additional_endpoints: additional
                .iter()
                .map(|(name, addr)| (name.clone(), Endpoint::from(*addr)))
                .collect(),
            shard,
            ..Self::new(endpoint)
        }
    }

    pub fn with_additional(mut self, name: impl Into<String>, endpoint: impl Into<Endpoint>) -> Self {
        self.additional_endpoints.insert(name.into(), endpoint.into());
        self
    }

    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shard = Some(shard);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn endpoint_from_socket_addr() {
        let endpoint = Endpoint::from(addr("10.0.0.1:9000"));
        assert_eq!(endpoint, Endpoint::new("10.0.0.1", 9000));
        assert_eq!(endpoint.to_string(), "10.0.0.1:9000");
    }

    #[test]
    fn ipv6_endpoint_display_is_bracketed() {
        let endpoint = Endpoint::from(addr("[::1]:8080"));
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.to_string(), "[::1]:8080");
    }

    #[test]
    fn from_addrs_collects_additional_endpoints() {
        let mut additional = HashMap::new();
        additional.insert("admin".to_string(), addr("10.0.0.1:9001"));
        let instance = ServiceInstance::from_addrs(addr("10.0.0.1:9000"), &additional, Some(2));

        assert_eq!(instance.status, Status::Alive);
        assert_eq!(instance.shard, Some(2));
        assert_eq!(
            instance.additional_endpoints.get("admin"),
            Some(&Endpoint::new("10.0.0.1", 9001))
        );
    }

    #[test]
    fn equality_is_by_content() {
        let a = ServiceInstance::new(addr("10.0.0.1:9000")).with_shard(0);
        let b = ServiceInstance::new(addr("10.0.0.1:9000")).with_shard(0);
        let c = ServiceInstance::new(addr("10.0.0.1:9000")).with_shard(1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }
}
