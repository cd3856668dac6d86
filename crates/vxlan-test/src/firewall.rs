//! Recording ARP firewall.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use vxlan_common::{ArpFirewall, DriverError, DriverResult};

/// Keeps the set of (device, gateway) pairs whose ARP traffic is blocked.
#[derive(Debug, Default)]
pub struct FakeFirewall {
    rules: Mutex<BTreeSet<(String, Ipv4Addr)>>,
    failing: AtomicBool,
}

impl FakeFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent install fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_blocked(&self, device: &str, gateway: Ipv4Addr) -> bool {
        self.rules.lock().contains(&(device.to_string(), gateway))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }
}

#[async_trait]
impl ArpFirewall for FakeFirewall {
    async fn block_gateway_arp(&self, device: &str, gateway: Ipv4Addr) -> DriverResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DriverError::firewall_rule(
                format!("-A OUTPUT -o {} --arp-ip-src {}", device, gateway),
                "ebtables: command not found",
            ));
        }
        self.rules.lock().insert((device.to_string(), gateway));
        Ok(())
    }

    async fn unblock_gateway_arp(&self, device: &str, gateway: Ipv4Addr) -> DriverResult<()> {
        self.rules.lock().remove(&(device.to_string(), gateway));
        Ok(())
    }
}
