//! Per-endpoint devices: created at Join, deleted at Leave.
//!
//! Single-tier networks give each endpoint a bridge-mode macvlan on top of
//! the VXLAN device. Dual-tier networks give it a veth pair whose host side
//! is enslaved to the bridge.

use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use vxlan_common::{DriverError, DriverResult, LinkSpec, LinkSpecKind};
use vxlan_types::{EndpointId, NetworkId};

use crate::context::DriverContext;
use crate::provisioner;
use crate::reclaim;
use crate::state::NetworkState;

/// What Join hands back to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    /// Device the daemon moves into the sandbox.
    pub interface_name: String,
    pub gateway: Option<IpAddr>,
}

#[instrument(skip(ctx), fields(network = %network, endpoint = %endpoint))]
pub async fn join(
    ctx: &DriverContext,
    network: &NetworkId,
    endpoint: &EndpointId,
) -> DriverResult<JoinInfo> {
    // Held until the endpoint device exists, so a concurrent reclaim sees it.
    let lock = ctx.networks.lock(network).await;
    let state = provisioner::ensure_locked(ctx, &lock, None).await?;

    let interface_name = match &state.bridge {
        Some(bridge) => create_veth(ctx, &state, &bridge.name, endpoint).await?,
        None => create_macvlan(ctx, &state, endpoint).await?,
    };

    info!(interface = %interface_name, "Endpoint joined");
    Ok(JoinInfo {
        interface_name,
        gateway: state.gateway,
    })
}

async fn create_macvlan(
    ctx: &DriverContext,
    state: &NetworkState,
    endpoint: &EndpointId,
) -> DriverResult<String> {
    let name = endpoint.macvlan_name();
    let spec = LinkSpec::new(
        name.as_str(),
        LinkSpecKind::Macvlan {
            parent: state.vxlan.name.clone(),
        },
    );
    ctx.links.link_add(&spec).await?;
    Ok(name)
}

async fn create_veth(
    ctx: &DriverContext,
    state: &NetworkState,
    bridge: &str,
    endpoint: &EndpointId,
) -> DriverResult<String> {
    let host = endpoint.veth_host_name();
    let peer = endpoint.veth_peer_name();
    let spec = LinkSpec::new(
        host.as_str(),
        LinkSpecKind::Veth {
            peer_name: peer.clone(),
        },
    );
    ctx.links.link_add(&spec).await?;

    if let Err(e) = attach_veth(ctx, &host, &peer, bridge, state.vxlan.mtu).await {
        warn!(device = %host, error = %e, "Failed to attach veth, deleting it");
        if let Err(del) = ctx.links.link_del(&host).await {
            if !del.is_not_found() {
                warn!(device = %host, error = %del, "Failed to delete veth");
            }
        }
        return Err(e);
    }
    Ok(peer)
}

async fn attach_veth(
    ctx: &DriverContext,
    host: &str,
    peer: &str,
    bridge: &str,
    mtu: Option<u32>,
) -> DriverResult<()> {
    if let Some(mtu) = mtu {
        ctx.links.link_set_mtu(host, mtu).await?;
        ctx.links.link_set_mtu(peer, mtu).await?;
    }
    ctx.links.link_set_master(host, bridge).await?;
    ctx.links.link_set_up(host).await
}

/// Deletes the endpoint's device and schedules reclamation of the network.
#[instrument(skip(ctx), fields(network = %network, endpoint = %endpoint))]
pub async fn leave(
    ctx: &Arc<DriverContext>,
    network: &NetworkId,
    endpoint: &EndpointId,
) -> DriverResult<()> {
    remove_device(ctx, endpoint).await?;
    reclaim::spawn_reclaim(ctx, network.clone());
    Ok(())
}

/// Deletes whichever endpoint device exists. An absent device is success.
///
/// # Errors
///
/// [`DriverError::NotASlaveDevice`] if a device with the endpoint's name
/// has neither master nor parent.
pub(crate) async fn remove_device(ctx: &DriverContext, endpoint: &EndpointId) -> DriverResult<()> {
    for name in [endpoint.macvlan_name(), endpoint.veth_host_name()] {
        let Some(link) = ctx.links.link_by_name(&name).await? else {
            continue;
        };
        if !link.is_slave() {
            return Err(DriverError::not_a_slave(name));
        }
        match ctx.links.link_del(&name).await {
            Ok(()) => info!(device = %name, "Deleted endpoint device"),
            Err(e) if e.is_not_found() => debug!(device = %name, "Endpoint device already gone"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, Scope};
    use pretty_assertions::assert_eq;
    use vxlan_common::LinkKind;
    use vxlan_test::{long_id, FakeDaemon, FakeFirewall, FakeKernel, KernelOp, NetworkFixture};

    fn setup(network: vxlan_common::NetworkResource) -> (Arc<DriverContext>, Arc<FakeKernel>) {
        let kernel = Arc::new(FakeKernel::with_nic("eth0"));
        let daemon = Arc::new(FakeDaemon::new());
        daemon.add_network(network);
        let config = DriverConfig {
            scope: Scope::Global,
            ..Default::default()
        };
        let ctx = DriverContext::new(config, kernel.clone(), daemon, Arc::new(FakeFirewall::new()));
        (ctx, kernel)
    }

    #[tokio::test]
    async fn test_join_single_tier() {
        let id = long_id("abcdef012345");
        let (ctx, kernel) = setup(
            NetworkFixture::new(&id, "blue")
                .with_ipam("10.1.0.0/24", "10.1.0.1")
                .build(),
        );
        let ep = EndpointId::new(long_id("1234567feed"));

        let info = join(&ctx, &NetworkId::new(id.as_str()), &ep).await.unwrap();
        assert_eq!(info.interface_name, "macvlan_1234567");
        assert_eq!(info.gateway, Some("10.1.0.1".parse().unwrap()));

        let vx = kernel.link("vx_abcdef012345").unwrap();
        let mv = kernel.link("macvlan_1234567").unwrap();
        assert_eq!(mv.kind, LinkKind::Macvlan);
        assert_eq!(mv.parent_index, Some(vx.index));
    }

    #[tokio::test]
    async fn test_join_dual_tier() {
        let id = long_id("abcdef012345");
        let (ctx, kernel) = setup(
            NetworkFixture::new(&id, "blue")
                .with_options(&[("bridgeName", "br_blue"), ("vxlanMTU", "1450")])
                .build(),
        );
        let ep = EndpointId::new(long_id("1234567feed"));

        let info = join(&ctx, &NetworkId::new(id.as_str()), &ep).await.unwrap();
        assert_eq!(info.interface_name, "vethc_1234567");
        assert_eq!(info.gateway, None);
        assert_eq!(kernel.master_of("veth_1234567").as_deref(), Some("br_blue"));
        assert!(kernel.is_up("veth_1234567"));
        assert_eq!(kernel.link("vethc_1234567").unwrap().mtu, Some(1450));
    }

    #[tokio::test]
    async fn test_failed_veth_attach_is_undone() {
        let id = long_id("abcdef012345");
        let (ctx, kernel) = setup(
            NetworkFixture::new(&id, "blue")
                .with_option("bridgeName", "br_blue")
                .build(),
        );
        kernel.fail_on(KernelOp::SetMaster, "veth_1234567");
        let ep = EndpointId::new(long_id("1234567feed"));

        assert!(join(&ctx, &NetworkId::new(id.as_str()), &ep).await.is_err());
        assert!(!kernel.exists("veth_1234567"));
        assert!(!kernel.exists("vethc_1234567"));
        // Network devices stay provisioned
        assert!(kernel.exists("vx_abcdef012345"));
    }

    #[tokio::test]
    async fn test_remove_device_refuses_primary() {
        let (ctx, kernel) = setup(NetworkFixture::new("n1", "blue").build());
        kernel.add_nic("macvlan_1234567");
        let ep = EndpointId::new(long_id("1234567feed"));

        let err = remove_device(&ctx, &ep).await.unwrap_err();
        assert_eq!(err, DriverError::not_a_slave("macvlan_1234567"));
        assert!(kernel.exists("macvlan_1234567"));
    }

    #[tokio::test]
    async fn test_remove_absent_device() {
        let (ctx, kernel) = setup(NetworkFixture::new("n1", "blue").build());
        let ep = EndpointId::new(long_id("1234567feed"));
        remove_device(&ctx, &ep).await.unwrap();
        assert!(kernel.deleted().is_empty());
    }
}
