//! Installs static gateway neighbour entries in containers joining a
//! network whose gateway ARP is blocked.

use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vxlan_common::{DriverResult, NetworkConnectEvent};
use vxlan_types::NetworkId;

use crate::context::DriverContext;
use crate::options::LinkConfig;
use crate::provisioner;

pub struct ArpWatcher {
    ctx: Arc<DriverContext>,
}

impl ArpWatcher {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    /// The watcher for `ctx`, or `None` unless global gateways are enabled.
    pub fn for_context(ctx: &Arc<DriverContext>) -> Option<Self> {
        ctx.config
            .global_gateway
            .then(|| Self::new(Arc::clone(ctx)))
    }

    /// Follows connect events until shutdown, resubscribing after the
    /// poll interval whenever the feed ends.
    pub async fn run(self) {
        info!("Starting gateway ARP watcher");
        let shutdown = self.ctx.shutdown.clone();
        loop {
            let mut events = self.ctx.daemon.network_connect_events();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Gateway ARP watcher shutting down");
                        return;
                    }
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            if let Err(e) = self.handle(&event).await {
                                warn!(
                                    network = %event.network_id,
                                    container = %event.container_id,
                                    error = %e,
                                    "Failed to install gateway neighbour entry"
                                );
                            }
                        }
                        Some(Err(e)) => warn!(error = %e, "Event stream error"),
                        None => break,
                    }
                }
            }

            debug!("Event stream ended, resubscribing");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }
        }
    }

    /// Returns true if an entry was installed.
    pub async fn handle(&self, event: &NetworkConnectEvent) -> DriverResult<bool> {
        let ctx = &self.ctx;
        let network = ctx.daemon.inspect_network(&event.network_id).await?;
        if !ctx.is_own_driver(&network.driver) {
            return Ok(false);
        }
        let id = NetworkId::new(network.id.as_str());
        let config = LinkConfig::parse(&id, &network.options)?;
        if !config.global_gateway {
            return Ok(false);
        }

        let state = provisioner::ensure_network(ctx, &network).await?;
        let (Some(gateway), Some(device)) = (state.gateway, state.gateway_device.as_deref()) else {
            return Ok(false);
        };
        let Some(gateway_mac) = ctx.links.link_by_name(device).await?.and_then(|l| l.mac) else {
            return Ok(false);
        };

        let endpoint = ctx
            .daemon
            .container_endpoint(&event.container_id, &network.name)
            .await?;
        let Some(container_mac) = endpoint.mac else {
            return Ok(false);
        };
        let links = ctx.links.netns_links(&endpoint.sandbox_key).await?;
        let Some(iface) = links.iter().find(|l| l.mac == Some(container_mac)) else {
            debug!(sandbox = %endpoint.sandbox_key, mac = %container_mac, "No matching interface in sandbox");
            return Ok(false);
        };

        ctx.links
            .netns_neigh_replace(&endpoint.sandbox_key, &iface.name, gateway, gateway_mac)
            .await?;
        info!(
            network = %id,
            container = %event.container_id,
            interface = %iface.name,
            gateway = %gateway,
            "Installed gateway neighbour entry"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, Scope};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use vxlan_common::{ContainerEndpoint, Link, LinkKind};
    use vxlan_test::{long_id, FakeDaemon, FakeFirewall, FakeKernel, NetworkFixture};

    const CONTAINER_MAC: &str = "02:42:0a:01:00:05";

    fn setup() -> (Arc<DriverContext>, Arc<FakeKernel>, Arc<FakeDaemon>, String) {
        let kernel = Arc::new(FakeKernel::with_nic("eth0"));
        let daemon = Arc::new(FakeDaemon::new());
        let id = long_id("abcdef012345");
        daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_option("globalGateway", "true")
                .with_ipam("10.1.0.0/24", "10.1.0.1")
                .build(),
        );
        daemon.set_endpoint(
            "c1",
            "blue",
            ContainerEndpoint {
                sandbox_key: "/var/run/docker/netns/c1".into(),
                mac: CONTAINER_MAC.parse().ok(),
            },
        );
        kernel.add_netns(
            "/var/run/docker/netns/c1",
            vec![Link {
                index: 14,
                name: "eth0".into(),
                kind: LinkKind::Macvlan,
                master_index: None,
                parent_index: None,
                mac: CONTAINER_MAC.parse().ok(),
                mtu: Some(1500),
            }],
        );
        let config = DriverConfig {
            scope: Scope::Global,
            global_gateway: true,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let ctx = DriverContext::new(config, kernel.clone(), daemon.clone(), Arc::new(FakeFirewall::new()));
        (ctx, kernel, daemon, id)
    }

    #[tokio::test]
    async fn test_installs_gateway_entry() {
        let (ctx, kernel, _, id) = setup();
        let watcher = ArpWatcher::new(ctx);
        let installed = watcher
            .handle(&NetworkConnectEvent {
                network_id: id,
                container_id: "c1".into(),
            })
            .await
            .unwrap();
        assert!(installed);

        let helper = kernel.link("gwmvl_2").unwrap();
        let neighbors = kernel.neighbors();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].device, "eth0");
        assert_eq!(neighbors[0].ip, "10.1.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(Some(neighbors[0].mac), helper.mac);
    }

    #[tokio::test]
    async fn test_ignores_other_drivers() {
        let (ctx, kernel, daemon, _) = setup();
        daemon.add_network(NetworkFixture::new("n2", "plain").with_driver("bridge").build());
        let watcher = ArpWatcher::new(ctx);
        let installed = watcher
            .handle(&NetworkConnectEvent {
                network_id: "n2".into(),
                container_id: "c1".into(),
            })
            .await
            .unwrap();
        assert!(!installed);
        assert!(kernel.neighbors().is_empty());
    }

    #[tokio::test]
    async fn test_run_follows_events_until_shutdown() {
        let (ctx, kernel, daemon, id) = setup();
        let watcher = ArpWatcher::for_context(&ctx).unwrap();
        let handle = tokio::spawn(watcher.run());

        while daemon.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        daemon.emit_connect(&id, "c1");
        for _ in 0..100 {
            if !kernel.neighbors().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(kernel.neighbors().len(), 1);

        ctx.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_disabled_without_global_gateway() {
        let ctx = DriverContext::new(
            DriverConfig::default(),
            Arc::new(FakeKernel::new()),
            Arc::new(FakeDaemon::new()),
            Arc::new(FakeFirewall::new()),
        );
        assert!(ArpWatcher::for_context(&ctx).is_none());
    }
}
