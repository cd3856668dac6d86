//! Container-runtime daemon seam.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use vxlan_types::{IpPrefix, MacAddress};

use crate::error::{DriverError, DriverResult};

/// One IPAM pool with a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamEntry {
    pub subnet: IpPrefix,
    pub gateway: IpAddr,
}

impl IpamEntry {
    /// Builds an entry from raw IPAM strings.
    ///
    /// `gateway` may be a bare address (network inspect) or a CIDR
    /// (network create request). Entries missing either part yield `None`.
    pub fn from_parts(subnet: &str, gateway: &str) -> DriverResult<Option<Self>> {
        let subnet = subnet.trim();
        let gateway = gateway.trim();
        if subnet.is_empty() || gateway.is_empty() {
            return Ok(None);
        }

        let subnet: IpPrefix = subnet
            .parse()
            .map_err(|e: vxlan_types::ParseError| {
                DriverError::invalid_option("Subnet", subnet, e.to_string())
            })?;

        let bare = gateway.split_once('/').map_or(gateway, |(addr, _)| addr);
        let gateway: IpAddr = bare
            .parse()
            .map_err(|_| DriverError::invalid_option("Gateway", gateway, "not an IP address"))?;

        if subnet.is_ipv4() != gateway.is_ipv4() {
            return Err(DriverError::invalid_option(
                "Gateway",
                gateway.to_string(),
                format!("address family does not match subnet {}", subnet),
            ));
        }

        Ok(Some(IpamEntry { subnet, gateway }))
    }

    /// The gateway address with the subnet's prefix length, e.g. `10.1.0.1/24`.
    pub fn gateway_cidr(&self) -> IpPrefix {
        self.subnet
            .with_address(self.gateway)
            .unwrap_or_else(|| IpPrefix::host(self.gateway))
    }
}

/// A network as the daemon sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkResource {
    pub id: String,
    pub name: String,
    pub driver: String,
    /// Flat driver options.
    pub options: HashMap<String, String>,
    pub ipam: Vec<IpamEntry>,
}

/// A container and the names of the networks it is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub networks: Vec<String>,
}

impl ContainerSummary {
    pub fn references(&self, network_name: &str) -> bool {
        self.networks.iter().any(|n| n == network_name)
    }
}

/// Where a container's endpoint on one network lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEndpoint {
    /// Path of the container's network namespace.
    pub sandbox_key: String,
    /// MAC address of the container's interface on the network.
    pub mac: Option<MacAddress>,
}

/// A container was connected to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConnectEvent {
    pub network_id: String,
    pub container_id: String,
}

/// Client for the container-runtime daemon.
///
/// Every failure is reported as
/// [`DriverError::DaemonApi`](crate::DriverError::DaemonApi).
#[async_trait]
pub trait DaemonClient: Send + Sync {
    async fn inspect_network(&self, id: &str) -> DriverResult<NetworkResource>;

    /// Lists every network the daemon knows about, across drivers.
    async fn list_networks(&self) -> DriverResult<Vec<NetworkResource>>;

    async fn list_containers(&self) -> DriverResult<Vec<ContainerSummary>>;

    /// Resolves the sandbox and interface MAC of `container` on `network`.
    async fn container_endpoint(
        &self,
        container: &str,
        network: &str,
    ) -> DriverResult<ContainerEndpoint>;

    /// Subscribes to network connect events. The stream ends when the
    /// daemon closes it.
    fn network_connect_events(&self) -> BoxStream<'static, DriverResult<NetworkConnectEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ipam_entry_bare_gateway() {
        let entry = IpamEntry::from_parts("10.1.0.0/24", "10.1.0.1")
            .unwrap()
            .unwrap();
        assert_eq!(entry.gateway, "10.1.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(entry.gateway_cidr().to_string(), "10.1.0.1/24");
    }

    #[test]
    fn test_ipam_entry_cidr_gateway() {
        let entry = IpamEntry::from_parts("fd00:1::/64", "fd00:1::1/64")
            .unwrap()
            .unwrap();
        assert_eq!(entry.gateway_cidr().to_string(), "fd00:1::1/64");
    }

    #[test]
    fn test_ipam_entry_incomplete() {
        assert_eq!(IpamEntry::from_parts("10.1.0.0/24", "").unwrap(), None);
        assert_eq!(IpamEntry::from_parts("", "10.1.0.1").unwrap(), None);
    }

    #[test]
    fn test_ipam_entry_invalid() {
        assert!(IpamEntry::from_parts("10.1.0.0", "10.1.0.1").is_err());
        assert!(IpamEntry::from_parts("10.1.0.0/24", "gateway").is_err());
        assert!(IpamEntry::from_parts("10.1.0.0/24", "fd00::1").is_err());
    }

    #[test]
    fn test_container_references() {
        let c = ContainerSummary {
            id: "c1".into(),
            networks: vec!["bridge".into(), "overlay1".into()],
        };
        assert!(c.references("overlay1"));
        assert!(!c.references("overlay2"));
    }
}
