//! Idempotent provisioning of a network's VXLAN device (and bridge), plus
//! teardown.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use vxlan_common::{
    DriverError, DriverResult, Link, LinkKind, LinkSpec, LinkSpecKind, NetworkResource, VtepRef,
};
use vxlan_types::NetworkId;

use crate::context::DriverContext;
use crate::gateway;
use crate::options::{DeviceConfig, LinkConfig};
use crate::state::{NetworkLock, NetworkState};

/// What a failed provisioning call has to undo.
#[derive(Debug, Default)]
pub(crate) struct Rollback {
    created: Vec<String>,
    blocked: Vec<(String, Ipv4Addr)>,
}

impl Rollback {
    pub(crate) fn created(&mut self, name: &str) {
        self.created.push(name.to_string());
    }

    pub(crate) fn blocked(&mut self, device: &str, gateway: Ipv4Addr) {
        self.blocked.push((device.to_string(), gateway));
    }

    /// Undoes everything in reverse order. Failures are logged.
    async fn undo(self, ctx: &DriverContext) {
        for (device, gw) in self.blocked.into_iter().rev() {
            if let Err(e) = ctx.firewall.unblock_gateway_arp(&device, gw).await {
                warn!(device = %device, gateway = %gw, error = %e, "Rollback: failed to remove ARP rules");
            }
        }
        for name in self.created.into_iter().rev() {
            match ctx.links.link_del(&name).await {
                Ok(()) => debug!(device = %name, "Rollback: deleted device"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(device = %name, error = %e, "Rollback: failed to delete device"),
            }
        }
    }
}

/// Ensures the network's devices exist, inspecting the daemon for its
/// configuration when it is not provisioned yet.
pub async fn ensure(ctx: &DriverContext, id: &NetworkId) -> DriverResult<Arc<NetworkState>> {
    let lock = ctx.networks.lock(id).await;
    ensure_locked(ctx, &lock, None).await
}

/// Like [`ensure`], for a network whose description is already at hand.
pub async fn ensure_network(
    ctx: &DriverContext,
    network: &NetworkResource,
) -> DriverResult<Arc<NetworkState>> {
    let id = NetworkId::new(network.id.as_str());
    let lock = ctx.networks.lock(&id).await;
    ensure_locked(ctx, &lock, Some(network)).await
}

/// Ensures the network's devices exist. The caller holds the network lock.
#[instrument(skip(ctx, lock, known), fields(network = %lock.id()))]
pub(crate) async fn ensure_locked(
    ctx: &DriverContext,
    lock: &NetworkLock<'_>,
    known: Option<&NetworkResource>,
) -> DriverResult<Arc<NetworkState>> {
    if let Some(state) = lock.state() {
        return Ok(state);
    }

    let network = match known {
        Some(network) => network.clone(),
        None => ctx.daemon.inspect_network(lock.id().as_str()).await?,
    };
    if !ctx.is_own_driver(&network.driver) {
        return Err(DriverError::not_overlay(lock.id().as_str(), network.driver));
    }
    let config = LinkConfig::parse(lock.id(), &network.options)?;

    let mut rollback = Rollback::default();
    match provision(ctx, lock.id(), &network, config, &mut rollback).await {
        Ok(state) => {
            info!(
                vxlan = %state.vxlan.name,
                bridge = state.bridge.as_ref().map(|b| b.name.as_str()).unwrap_or("-"),
                "Network provisioned"
            );
            Ok(lock.insert(state))
        }
        Err(e) => {
            warn!(error = %e, "Provisioning failed, rolling back");
            rollback.undo(ctx).await;
            Err(e)
        }
    }
}

async fn provision(
    ctx: &DriverContext,
    id: &NetworkId,
    network: &NetworkResource,
    config: LinkConfig,
    rollback: &mut Rollback,
) -> DriverResult<NetworkState> {
    // One listing serves every lookup of this pass; the network lock keeps
    // our own devices from appearing behind it.
    let links = ctx.links.link_list().await?;

    let bridge = match &config.bridge {
        Some(dev) => {
            Some(ensure_device(ctx, &links, dev, LinkSpecKind::Bridge, rollback).await?)
        }
        None => None,
    };

    let vtep = resolve_vtep(ctx, &links, &config)?;
    let mut vxlan = ensure_device(
        ctx,
        &links,
        &config.vxlan,
        LinkSpecKind::Vxlan(config.vxlan_attrs(vtep)),
        rollback,
    )
    .await?;

    if let Some(bridge) = &bridge {
        if vxlan.master_index != Some(bridge.index) {
            ctx.links.link_set_master(&vxlan.name, &bridge.name).await?;
            vxlan.master_index = Some(bridge.index);
        }
        ctx.links.link_set_up(&bridge.name).await?;
    }
    ctx.links.link_set_up(&vxlan.name).await?;

    let gateway_device = if gateway::assignment_active(&ctx.config, &config) {
        gateway::assign(ctx, &vxlan, bridge.as_ref(), &network.ipam, rollback).await?
    } else {
        None
    };

    let blocked_gateways = if gateway::arp_blocking_active(&ctx.config, &config) {
        gateway::block_arp(ctx, &vxlan.name, &network.ipam, rollback).await?
    } else {
        Vec::new()
    };

    Ok(NetworkState {
        id: id.clone(),
        name: network.name.clone(),
        config,
        vxlan,
        bridge,
        gateway_device,
        gateway: gateway::select_gateway(&network.ipam),
        ipam: network.ipam.clone(),
        blocked_gateways,
    })
}

/// Adopts the device if it already exists, otherwise creates it and applies
/// the attributes the kernel only takes after creation.
async fn ensure_device(
    ctx: &DriverContext,
    links: &[Link],
    dev: &DeviceConfig,
    kind: LinkSpecKind,
    rollback: &mut Rollback,
) -> DriverResult<Link> {
    let expected = match &kind {
        LinkSpecKind::Vxlan(_) => LinkKind::Vxlan,
        LinkSpecKind::Bridge => LinkKind::Bridge,
        LinkSpecKind::Macvlan { .. } => LinkKind::Macvlan,
        LinkSpecKind::Veth { .. } => LinkKind::Veth,
    };

    if let Some(link) = find_link(links, &dev.name) {
        if link.kind != expected {
            return Err(DriverError::kernel_link(
                format!("adopt {}", dev.name),
                format!("existing device is {:?}, expected {:?}", link.kind, expected),
            ));
        }
        debug!(device = %dev.name, "Adopting existing device");
        return Ok(link.clone());
    }

    let spec = LinkSpec::new(dev.name.as_str(), kind).with_tx_queue_len(dev.tx_queue_len);
    let mut link = ctx.links.link_add(&spec).await?;
    rollback.created(&dev.name);

    if let Some(mac) = dev.hardware_addr {
        ctx.links.link_set_hardware_addr(&dev.name, mac).await?;
        link.mac = Some(mac);
    }
    if let Some(mtu) = dev.mtu {
        ctx.links.link_set_mtu(&dev.name, mtu).await?;
        link.mtu = Some(mtu);
    }

    info!(device = %dev.name, index = link.index, "Created device");
    Ok(link)
}

fn resolve_vtep(
    ctx: &DriverContext,
    links: &[Link],
    config: &LinkConfig,
) -> DriverResult<Option<VtepRef>> {
    let Some(name) = config.effective_vtep(ctx.config.vtep_dev.as_deref()) else {
        return Ok(None);
    };
    let link = find_link(links, name).ok_or_else(|| DriverError::device_not_found(name))?;
    Ok(Some(VtepRef {
        name: link.name.clone(),
        index: link.index,
    }))
}

fn find_link<'a>(links: &'a [Link], name: &str) -> Option<&'a Link> {
    links.iter().find(|l| l.name == name)
}

/// The devices and rules that belong to one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    /// VXLAN device name, which the ARP rules match on.
    pub vxlan: String,
    /// Devices to delete, in deletion order: gateway helper, VXLAN device,
    /// bridge.
    pub devices: Vec<String>,
    pub blocked_gateways: Vec<Ipv4Addr>,
}

impl Teardown {
    pub fn from_state(state: &NetworkState) -> Self {
        let helper = state
            .gateway_device
            .clone()
            .filter(|d| gateway::is_gateway_helper(d));
        Self {
            vxlan: state.vxlan.name.clone(),
            devices: helper
                .into_iter()
                .chain(std::iter::once(state.vxlan.name.clone()))
                .chain(state.bridge.as_ref().map(|b| b.name.clone()))
                .collect(),
            blocked_gateways: state.blocked_gateways.clone(),
        }
    }
}

/// Works out what to tear down for a network: from its state, else from the
/// daemon's view, else from the default names.
///
/// Without state, names are resolved against `links` and only devices of the
/// kind this driver creates are kept, so a host device that happens to carry
/// a configured name is never deleted.
pub(crate) async fn teardown_plan(
    ctx: &DriverContext,
    lock: &NetworkLock<'_>,
    links: &[Link],
) -> Teardown {
    if let Some(state) = lock.state() {
        return Teardown::from_state(&state);
    }

    let id = lock.id();
    let (config, ipam) = match ctx.daemon.inspect_network(id.as_str()).await {
        Ok(network) => (
            LinkConfig::parse(id, &network.options).unwrap_or_else(|e| {
                warn!(network = %id, error = %e, "Ignoring unparsable options for teardown");
                LinkConfig::defaults(id)
            }),
            network.ipam,
        ),
        Err(e) => {
            debug!(network = %id, error = %e, "Network unknown to daemon, using default names");
            (LinkConfig::defaults(id), Vec::new())
        }
    };

    let vxlan = owned_link(links, &config.vxlan.name, LinkKind::Vxlan);
    let foreign_vxlan = vxlan.is_none() && find_link(links, &config.vxlan.name).is_some();
    let helper = vxlan.and_then(|vx| {
        let helper = gateway::helper_name(vx.index);
        find_link(links, &helper)
            .filter(|l| l.kind == LinkKind::Macvlan && l.parent_index == Some(vx.index))
            .map(|_| helper)
    });
    let bridge = config
        .bridge
        .as_ref()
        .and_then(|b| owned_link(links, &b.name, LinkKind::Bridge));

    let blocked_gateways =
        if !foreign_vxlan && gateway::arp_blocking_active(&ctx.config, &config) {
            gateway::ipv4_gateways(&ipam)
        } else {
            Vec::new()
        };

    Teardown {
        vxlan: config.vxlan.name.clone(),
        devices: helper
            .into_iter()
            .chain(vxlan.map(|l| l.name.clone()))
            .chain(bridge.map(|l| l.name.clone()))
            .collect(),
        blocked_gateways,
    }
}

/// The device called `name`, if it exists and is of `kind`.
fn owned_link<'a>(links: &'a [Link], name: &str, kind: LinkKind) -> Option<&'a Link> {
    match find_link(links, name) {
        Some(link) if link.kind == kind => Some(link),
        Some(link) => {
            warn!(device = %name, kind = ?link.kind, "Leaving foreign device in place");
            None
        }
        None => None,
    }
}

/// Removes ARP rules, the gateway helper, the VXLAN device and the bridge.
/// Absent devices count as removed. Returns the first error after trying
/// every step.
pub(crate) async fn remove_devices(ctx: &DriverContext, plan: &Teardown) -> DriverResult<()> {
    let mut first_err = None;

    for gw in &plan.blocked_gateways {
        if let Err(e) = ctx.firewall.unblock_gateway_arp(&plan.vxlan, *gw).await {
            first_err.get_or_insert(e);
        }
    }

    for name in &plan.devices {
        match ctx.links.link_del(name).await {
            Ok(()) => info!(device = %name, "Deleted device"),
            Err(e) if e.is_not_found() => debug!(device = %name, "Device already absent"),
            Err(e) => {
                warn!(device = %name, error = %e, "Failed to delete device");
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, Scope};
    use pretty_assertions::assert_eq;
    use vxlan_common::LinkOps;
    use vxlan_test::{long_id, FakeDaemon, FakeFirewall, FakeKernel, KernelOp, NetworkFixture};

    struct Harness {
        ctx: Arc<DriverContext>,
        kernel: Arc<FakeKernel>,
        daemon: Arc<FakeDaemon>,
        firewall: Arc<FakeFirewall>,
    }

    fn harness(config: DriverConfig) -> Harness {
        let kernel = Arc::new(FakeKernel::with_nic("eth0"));
        let daemon = Arc::new(FakeDaemon::new());
        let firewall = Arc::new(FakeFirewall::new());
        let ctx = DriverContext::new(config, kernel.clone(), daemon.clone(), firewall.clone());
        Harness {
            ctx,
            kernel,
            daemon,
            firewall,
        }
    }

    fn global() -> DriverConfig {
        DriverConfig {
            scope: Scope::Global,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_creates_vxlan_with_attributes() {
        let h = harness(global());
        let id = long_id("abcdef012345");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_options(&[
                    ("VxlanId", "100"),
                    ("vxlanMTU", "1400"),
                    ("vxlanHardwareAddr", "0a:00:00:00:00:01"),
                ])
                .build(),
        );

        let state = ensure(&h.ctx, &NetworkId::new(id.as_str())).await.unwrap();
        assert_eq!(state.vxlan.name, "vx_abcdef012345");
        assert_eq!(state.name, "blue");

        let link = h.kernel.link("vx_abcdef012345").unwrap();
        assert_eq!(link.mtu, Some(1400));
        assert_eq!(link.mac.map(|m| m.to_string()), Some("0a:00:00:00:00:01".to_string()));
        assert!(h.kernel.is_up("vx_abcdef012345"));
        assert_eq!(h.kernel.added_specs()[0].vxlan_attrs().map(|a| a.vni), Some(100));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let h = harness(global());
        let id = long_id("abcdef012345");
        h.daemon.add_network(NetworkFixture::new(&id, "blue").build());
        let nid = NetworkId::new(id.as_str());

        ensure(&h.ctx, &nid).await.unwrap();
        ensure(&h.ctx, &nid).await.unwrap();
        assert_eq!(h.kernel.count_kind(&LinkKind::Vxlan), 1);
        assert_eq!(h.kernel.added_specs().len(), 1);
    }

    #[tokio::test]
    async fn test_adopts_existing_device_without_state() {
        let h = harness(global());
        let id = long_id("abcdef012345");
        h.daemon.add_network(NetworkFixture::new(&id, "blue").build());
        let nid = NetworkId::new(id.as_str());

        ensure(&h.ctx, &nid).await.unwrap();
        // Forget the state, as after a restart
        h.ctx.networks.lock(&nid).await.remove();

        ensure(&h.ctx, &nid).await.unwrap();
        assert_eq!(h.kernel.added_specs().len(), 1);
    }

    #[tokio::test]
    async fn test_refuses_to_adopt_foreign_device() {
        let h = harness(global());
        let id = long_id("abcdef012345");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_option("vxlanName", "eth0")
                .build(),
        );
        let err = ensure(&h.ctx, &NetworkId::new(id.as_str())).await.unwrap_err();
        assert!(matches!(err, DriverError::KernelLink { .. }));
        assert!(h.kernel.exists("eth0"));
    }

    #[tokio::test]
    async fn test_wrong_driver() {
        let h = harness(global());
        h.daemon
            .add_network(NetworkFixture::new("n1", "plain").with_driver("bridge").build());
        let err = ensure(&h.ctx, &NetworkId::new("n1")).await.unwrap_err();
        assert!(matches!(err, DriverError::NotOverlayNetwork { .. }));
        assert!(h.kernel.added_specs().is_empty());
    }

    #[tokio::test]
    async fn test_dual_tier_enslaves_vxlan() {
        let h = harness(global());
        let id = long_id("abcdef012345");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_option("bridgeMTU", "1450")
                .build(),
        );

        let state = ensure(&h.ctx, &NetworkId::new(id.as_str())).await.unwrap();
        assert_eq!(state.bridge.as_ref().map(|b| b.name.as_str()), Some("br_abcdef012345"));
        assert_eq!(
            h.kernel.master_of("vx_abcdef012345").as_deref(),
            Some("br_abcdef012345")
        );
        assert!(h.kernel.is_up("br_abcdef012345"));
        assert_eq!(h.kernel.link("br_abcdef012345").unwrap().mtu, Some(1450));

        // Bridge is created before the VXLAN device
        let specs = h.kernel.added_specs();
        assert_eq!(specs[0].kind, LinkSpecKind::Bridge);
    }

    #[tokio::test]
    async fn test_missing_vtep_is_device_not_found() {
        let h = harness(global());
        h.daemon.add_network(
            NetworkFixture::new("n1", "blue")
                .with_option("VtepDev", "eth9")
                .build(),
        );
        let err = ensure(&h.ctx, &NetworkId::new("n1")).await.unwrap_err();
        assert_eq!(err, DriverError::device_not_found("eth9"));
    }

    #[tokio::test]
    async fn test_rollback_on_gateway_failure() {
        let h = harness(DriverConfig::default());
        let id = long_id("abcdef012345");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_ipam("10.1.0.0/24", "10.1.0.1")
                .build(),
        );
        // vx is index 2, so its helper is gwmvl_2
        h.kernel.fail_on(KernelOp::AddrReplace, "gwmvl_2");

        let err = ensure(&h.ctx, &NetworkId::new(id.as_str())).await.unwrap_err();
        assert!(matches!(err, DriverError::KernelLink { .. }));
        assert!(!h.kernel.exists("vx_abcdef012345"));
        assert!(!h.kernel.exists("gwmvl_2"));
        assert!(h.ctx.networks.is_empty());
        assert_eq!(h.ctx.networks.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_on_firewall_failure() {
        let h = harness(DriverConfig {
            block_gateway_arp: true,
            ..global()
        });
        h.firewall.set_failing(true);
        let id = long_id("abcdef012345");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_option("blockGatewayArp", "true")
                .with_ipam("10.1.0.0/24", "10.1.0.1")
                .build(),
        );

        let err = ensure(&h.ctx, &NetworkId::new(id.as_str())).await.unwrap_err();
        assert!(matches!(err, DriverError::FirewallRule { .. }));
        assert!(!h.kernel.exists("vx_abcdef012345"));
    }

    #[tokio::test]
    async fn test_existing_devices_survive_rollback() {
        let h = harness(global());
        let id = long_id("abcdef012345");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_option("bridgeName", "br_shared")
                .build(),
        );
        h.kernel
            .link_add(&LinkSpec::new("br_shared", LinkSpecKind::Bridge))
            .await
            .unwrap();
        h.kernel.fail_on(KernelOp::SetUp, "vx_abcdef012345");

        assert!(ensure(&h.ctx, &NetworkId::new(id.as_str())).await.is_err());
        assert!(h.kernel.exists("br_shared"));
        assert!(!h.kernel.exists("vx_abcdef012345"));
    }

    #[tokio::test]
    async fn test_teardown_plan_without_state() {
        let h = harness(global());
        let nid = NetworkId::new(long_id("abcdef012345"));
        let lock = h.ctx.networks.lock(&nid).await;
        let links = h.kernel.link_list().await.unwrap();
        let plan = teardown_plan(&h.ctx, &lock, &links).await;
        assert_eq!(
            plan,
            Teardown {
                vxlan: "vx_abcdef012345".to_string(),
                devices: Vec::new(),
                blocked_gateways: Vec::new(),
            }
        );
        remove_devices(&h.ctx, &plan).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_plan_finds_leftover_devices() {
        let h = harness(DriverConfig::default());
        let id = long_id("abcdef012345");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_ipam("10.1.0.0/24", "10.1.0.1")
                .build(),
        );
        let nid = NetworkId::new(id.as_str());
        ensure(&h.ctx, &nid).await.unwrap();
        let lock = h.ctx.networks.lock(&nid).await;
        lock.remove();

        let links = h.kernel.link_list().await.unwrap();
        let plan = teardown_plan(&h.ctx, &lock, &links).await;
        assert_eq!(plan.devices, vec!["gwmvl_2", "vx_abcdef012345"]);
    }

    #[tokio::test]
    async fn test_teardown_plan_skips_foreign_devices() {
        let h = harness(global());
        let id = long_id("abcdef012345");
        h.kernel.add_nic("br_host");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_options(&[("vxlanName", "eth0"), ("bridgeName", "br_host")])
                .build(),
        );
        let nid = NetworkId::new(id.as_str());
        assert!(ensure(&h.ctx, &nid).await.is_err());

        let lock = h.ctx.networks.lock(&nid).await;
        let links = h.kernel.link_list().await.unwrap();
        let plan = teardown_plan(&h.ctx, &lock, &links).await;
        assert!(plan.devices.is_empty());

        remove_devices(&h.ctx, &plan).await.unwrap();
        assert!(h.kernel.exists("eth0"));
        assert!(h.kernel.exists("br_host"));
        assert!(h.kernel.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_lists_devices_once_per_pass() {
        let h = harness(global());
        let id = long_id("abcdef012345");
        h.daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_options(&[("VtepDev", "eth0"), ("bridgeName", "br_blue")])
                .build(),
        );
        let nid = NetworkId::new(id.as_str());

        let before = h.kernel.lookups();
        ensure(&h.ctx, &nid).await.unwrap();
        assert_eq!(h.kernel.lookups() - before, 1);
    }
}
