//! Daemon-issued identifiers and the interface names derived from them.
//!
//! Device names are never persisted. Every name is recomputed from the
//! identifier, so the same ID always maps to the same device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a Linux interface name, including the NUL terminator.
pub const IFNAMSIZ: usize = 16;

/// Number of network ID characters used in default device names.
const NETWORK_ID_PREFIX_LEN: usize = 12;

/// Number of endpoint ID characters used in endpoint device names.
const ENDPOINT_ID_PREFIX_LEN: usize = 7;

/// Prefix of the default VXLAN device name.
pub(crate) const VXLAN_PREFIX: &str = "vx_";

/// Prefix of the default bridge device name.
pub(crate) const BRIDGE_PREFIX: &str = "br_";

/// Prefix of single-tier endpoint devices.
pub(crate) const MACVLAN_PREFIX: &str = "macvlan_";

/// Prefix of the host side of a dual-tier endpoint veth pair.
pub(crate) const VETH_HOST_PREFIX: &str = "veth_";

/// Prefix of the container side of a dual-tier endpoint veth pair.
pub(crate) const VETH_PEER_PREFIX: &str = "vethc_";

/// Returns the first `n` characters of `s`, or all of it when shorter.
fn leading(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Network identifier assigned by the container-runtime daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Self {
        NetworkId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the 12-character short form used by the daemon's CLI.
    pub fn short(&self) -> &str {
        leading(&self.0, NETWORK_ID_PREFIX_LEN)
    }

    /// Default VXLAN device name: `vx_<id12>`.
    pub fn vxlan_name(&self) -> String {
        format!("{}{}", VXLAN_PREFIX, self.short())
    }

    /// Default bridge device name: `br_<id12>`.
    pub fn bridge_name(&self) -> String {
        format!("{}{}", BRIDGE_PREFIX, self.short())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(s: &str) -> Self {
        NetworkId::new(s)
    }
}

impl From<String> for NetworkId {
    fn from(s: String) -> Self {
        NetworkId(s)
    }
}

/// Endpoint identifier assigned by the container-runtime daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        EndpointId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        leading(&self.0, ENDPOINT_ID_PREFIX_LEN)
    }

    /// Single-tier endpoint device: `macvlan_<ep7>`.
    pub fn macvlan_name(&self) -> String {
        format!("{}{}", MACVLAN_PREFIX, self.short())
    }

    /// Host side of the dual-tier veth pair: `veth_<ep7>`.
    pub fn veth_host_name(&self) -> String {
        format!("{}{}", VETH_HOST_PREFIX, self.short())
    }

    /// Container side of the dual-tier veth pair: `vethc_<ep7>`.
    pub fn veth_peer_name(&self) -> String {
        format!("{}{}", VETH_PEER_PREFIX, self.short())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        EndpointId::new(s)
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        EndpointId(s)
    }
}
