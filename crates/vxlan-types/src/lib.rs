//! Value types shared by the VXLAN network driver crates.
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`IpPrefix`]: an interface address in CIDR notation
//! - [`NetworkId`] / [`EndpointId`]: daemon-issued identifiers and the
//!   device names derived from them

mod id;
mod ip;
mod mac;

pub use id::{EndpointId, NetworkId, IFNAMSIZ};
pub use ip::IpPrefix;
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),
}
