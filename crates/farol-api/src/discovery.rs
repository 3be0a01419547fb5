// Discovery API models
// This file defines the announced endpoint payload and its identity helpers

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// One announced (service name, network address) pair.
///
/// Immutable once announced; identity is the full
/// (service name, host, port) triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discoverable {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

impl Discoverable {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
        }
    }

    /// Endpoint key used as the ephemeral node name under the service path.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse the announced address, when the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok()
    }
}

impl std::fmt::Display for Discoverable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.service_name, self.host, self.port)
    }
}

/// Event delivered to discovery listeners when a service's endpoint set changes.
#[derive(Clone, Debug)]
pub struct DiscoveryEvent {
    pub service_name: String,
    pub endpoints: Vec<Discoverable>,
}
