//! ARP filtering seam.

use async_trait::async_trait;
use std::net::Ipv4Addr;

use crate::error::DriverResult;

/// Installs and removes the pair of rules that keep a gateway's ARP traffic
/// from crossing the tunnel device.
///
/// The pair is:
/// - drop ARP replies sourced from `gateway` leaving through `device`
/// - drop ARP requests for `gateway` arriving through `device`
#[async_trait]
pub trait ArpFirewall: Send + Sync {
    /// Installs both rules. Installing an already present pair is a no-op.
    async fn block_gateway_arp(&self, device: &str, gateway: Ipv4Addr) -> DriverResult<()>;

    /// Removes both rules. Absent rules are not an error.
    async fn unblock_gateway_arp(&self, device: &str, gateway: Ipv4Addr) -> DriverResult<()>;
}
