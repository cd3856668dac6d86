//! CIDR prefixes carried in IPAM data and applied to gateway devices.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An address together with a prefix length, e.g. `10.1.0.1/24`.
///
/// The address is kept as given: `10.1.0.1/24` is a gateway address on the
/// `10.1.0.0/24` network, not the network itself. Use [`IpPrefix::network`]
/// to obtain the masked form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is larger than the address
    /// family allows (32 for IPv4, 128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = max_prefix_len(&address);
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len, max_len, address
            )));
        }
        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    /// A single-host prefix (/32 or /128).
    pub fn host(address: IpAddr) -> Self {
        IpPrefix {
            prefix_len: max_prefix_len(&address),
            address,
        }
    }

    pub const fn address(&self) -> IpAddr {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns the prefix with all host bits cleared.
    pub fn network(&self) -> IpPrefix {
        let address = match self.address {
            IpAddr::V4(v4) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        IpPrefix {
            address,
            prefix_len: self.prefix_len,
        }
    }

    /// Returns `addr` with this prefix's length, when the families match.
    pub fn with_address(&self, addr: IpAddr) -> Option<IpPrefix> {
        if addr.is_ipv4() != self.address.is_ipv4() {
            return None;
        }
        Some(IpPrefix {
            address: addr,
            prefix_len: self.prefix_len,
        })
    }

    /// Returns true if `addr` falls inside this prefix's network.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match self.with_address(addr) {
            Some(candidate) => candidate.network() == self.network(),
            None => false,
        }
    }
}

fn max_prefix_len(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;

        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> String {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_display() {
        let p: IpPrefix = "10.1.0.1/24".parse().unwrap();
        assert_eq!(p.address(), "10.1.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(p.prefix_len(), 24);
        assert!(p.is_ipv4());
        assert_eq!(p.to_string(), "10.1.0.1/24");

        let p6: IpPrefix = "fd00::1/64".parse().unwrap();
        assert!(p6.is_ipv6());
        assert_eq!(p6.to_string(), "fd00::1/64");
    }

    #[test]
    fn test_invalid_prefix() {
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("fd00::/129".parse::<IpPrefix>().is_err());
        assert!("bogus/24".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_network() {
        let p: IpPrefix = "10.1.2.3/16".parse().unwrap();
        assert_eq!(p.network().to_string(), "10.1.0.0/16");

        let all: IpPrefix = "10.1.2.3/0".parse().unwrap();
        assert_eq!(all.network().to_string(), "0.0.0.0/0");

        let p6: IpPrefix = "fd00:1:2:3::9/48".parse().unwrap();
        assert_eq!(p6.network().to_string(), "fd00:1:2::/48");
    }

    #[test]
    fn test_with_address_and_contains() {
        let subnet: IpPrefix = "10.1.0.0/24".parse().unwrap();
        let gw = subnet.with_address("10.1.0.1".parse().unwrap()).unwrap();
        assert_eq!(gw.to_string(), "10.1.0.1/24");

        assert!(subnet.contains("10.1.0.200".parse().unwrap()));
        assert!(!subnet.contains("10.1.1.1".parse().unwrap()));
        assert!(subnet.with_address("fd00::1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_host() {
        let h = IpPrefix::host("192.0.2.7".parse().unwrap());
        assert_eq!(h.to_string(), "192.0.2.7/32");
    }
}
