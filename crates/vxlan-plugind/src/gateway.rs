//! Gateway address assignment and gateway ARP blocking.
//!
//! In single-tier mode the gateway addresses go on a helper macvlan
//! `gwmvl_<vxlan ifindex>` on top of the VXLAN device, since macvlan
//! children cannot reach an address held by their parent. In dual-tier mode
//! they go on the bridge.

use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info};
use vxlan_common::{DriverResult, IpamEntry, Link, LinkSpec, LinkSpecKind};

use crate::config::{DriverConfig, Scope};
use crate::context::DriverContext;
use crate::options::LinkConfig;
use crate::provisioner::Rollback;

/// Prefix of the gateway helper macvlan.
pub const GATEWAY_HELPER_PREFIX: &str = "gwmvl_";

pub fn helper_name(vxlan_index: u32) -> String {
    format!("{}{}", GATEWAY_HELPER_PREFIX, vxlan_index)
}

/// Gateway helpers are the one kind of slave device that does not keep a
/// network's devices alive.
pub fn is_gateway_helper(name: &str) -> bool {
    name.starts_with(GATEWAY_HELPER_PREFIX)
}

/// The gateway handed to endpoints: the first IPv4 gateway, else the first
/// IPv6 one.
pub fn select_gateway(ipam: &[IpamEntry]) -> Option<IpAddr> {
    ipam.iter()
        .find(|e| e.gateway.is_ipv4())
        .or_else(|| ipam.first())
        .map(|e| e.gateway)
}

/// IPv4 gateways, the only ones ARP rules apply to.
pub fn ipv4_gateways(ipam: &[IpamEntry]) -> Vec<Ipv4Addr> {
    let mut gateways: Vec<Ipv4Addr> = ipam
        .iter()
        .filter_map(|e| match e.gateway {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect();
    gateways.sort();
    gateways.dedup();
    gateways
}

pub fn assignment_active(config: &DriverConfig, link: &LinkConfig) -> bool {
    config.scope == Scope::Local
        || config.local_gateway
        || (config.global_gateway && link.global_gateway)
}

pub fn arp_blocking_active(config: &DriverConfig, link: &LinkConfig) -> bool {
    config.block_gateway_arp && link.block_gateway_arp
}

/// Puts every gateway address on the gateway device and returns its name.
///
/// IPv6 addresses are applied before IPv4 ones.
pub(crate) async fn assign(
    ctx: &DriverContext,
    vxlan: &Link,
    bridge: Option<&Link>,
    ipam: &[IpamEntry],
    rollback: &mut Rollback,
) -> DriverResult<Option<String>> {
    if ipam.is_empty() {
        return Ok(None);
    }

    let device = match bridge {
        Some(bridge) => bridge.name.clone(),
        None => {
            let name = helper_name(vxlan.index);
            if ctx.links.link_by_name(&name).await?.is_none() {
                let spec = LinkSpec::new(
                    name.as_str(),
                    LinkSpecKind::Macvlan {
                        parent: vxlan.name.clone(),
                    },
                );
                ctx.links.link_add(&spec).await?;
                rollback.created(&name);
                debug!(device = %name, "Created gateway helper");
            }
            name
        }
    };

    let (v4, v6): (Vec<&IpamEntry>, Vec<&IpamEntry>) =
        ipam.iter().partition(|e| e.gateway.is_ipv4());
    for entry in v6.into_iter().chain(v4) {
        ctx.links.addr_replace(&device, entry.gateway_cidr()).await?;
    }
    ctx.links.link_set_up(&device).await?;

    info!(device = %device, "Assigned gateway addresses");
    Ok(Some(device))
}

/// Installs the ARP rules for every IPv4 gateway on the VXLAN device.
pub(crate) async fn block_arp(
    ctx: &DriverContext,
    vxlan: &str,
    ipam: &[IpamEntry],
    rollback: &mut Rollback,
) -> DriverResult<Vec<Ipv4Addr>> {
    let gateways = ipv4_gateways(ipam);
    for gw in &gateways {
        ctx.firewall.block_gateway_arp(vxlan, *gw).await?;
        rollback.blocked(vxlan, *gw);
    }
    Ok(gateways)
}
