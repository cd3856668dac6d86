//! Test fixtures for networks, IPAM data and option bags

use std::collections::HashMap;
use vxlan_common::{IpamEntry, NetworkResource};

/// Driver kind the fixtures register networks under.
pub const DRIVER_NAME: &str = "vxlan";

/// Pads `prefix` with zeros to a 64-character daemon-style ID.
pub fn long_id(prefix: &str) -> String {
    format!("{:0<64}", prefix)
}

/// Builds a flat option bag.
pub fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Builds the nested option object a network create request carries.
pub fn generic_options(pairs: &[(&str, &str)]) -> serde_json::Value {
    let inner: serde_json::Map<String, serde_json::Value> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    serde_json::json!({ "com.docker.network.generic": inner })
}

/// Builds an IPAM entry, panicking on malformed input.
pub fn ipam(subnet: &str, gateway: &str) -> IpamEntry {
    IpamEntry::from_parts(subnet, gateway)
        .ok()
        .flatten()
        .unwrap_or_else(|| panic!("bad IPAM fixture {} {}", subnet, gateway))
}

/// Builder for a [`NetworkResource`] registered with the fake daemon.
#[derive(Debug, Clone)]
pub struct NetworkFixture {
    network: NetworkResource,
}

impl NetworkFixture {
    /// A network of this driver with no options or IPAM data.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            network: NetworkResource {
                id: id.into(),
                name: name.into(),
                driver: DRIVER_NAME.to_string(),
                options: HashMap::new(),
                ipam: Vec::new(),
            },
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.network.driver = driver.into();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.network.options.insert(key.into(), value.into());
        self
    }

    pub fn with_options(mut self, pairs: &[(&str, &str)]) -> Self {
        self.network.options.extend(options(pairs));
        self
    }

    pub fn with_ipam(mut self, subnet: &str, gateway: &str) -> Self {
        self.network.ipam.push(ipam(subnet, gateway));
        self
    }

    pub fn build(self) -> NetworkResource {
        self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_long_id() {
        let id = long_id("abcdef012345");
        assert_eq!(id.len(), 64);
        assert!(id.starts_with("abcdef012345"));
    }

    #[test]
    fn test_network_fixture() {
        let net = NetworkFixture::new("n1", "net1")
            .with_option("VxlanId", "100")
            .with_ipam("10.1.0.0/24", "10.1.0.1")
            .build();
        assert_eq!(net.driver, "vxlan");
        assert_eq!(net.options.get("VxlanId").map(String::as_str), Some("100"));
        assert_eq!(net.ipam[0].gateway_cidr().to_string(), "10.1.0.1/24");
    }

    #[test]
    fn test_generic_options() {
        let v = generic_options(&[("TTL", "5")]);
        assert_eq!(v["com.docker.network.generic"]["TTL"], "5");
    }
}
