//! The network driver's lifecycle operations.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use vxlan_common::{DriverResult, IpamEntry, NetworkResource};
use vxlan_types::{EndpointId, NetworkId};

use crate::arp_watcher::ArpWatcher;
use crate::config::Scope;
use crate::context::DriverContext;
use crate::discovery::NetworkDiscovery;
use crate::endpoint::{self, JoinInfo};
use crate::options::LinkConfig;
use crate::provisioner::{self, Teardown};
use crate::reclaim;

#[derive(Debug, Clone)]
pub struct Driver {
    ctx: Arc<DriverContext>,
}

impl Driver {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    pub fn capabilities(&self) -> Scope {
        self.ctx.config.scope
    }

    /// Validates the options. Under `allow_empty` the network is provisioned
    /// right away from the request, which the daemon does not know yet.
    #[instrument(skip(self, options, ipam), fields(network = %id))]
    pub async fn create_network(
        &self,
        id: &NetworkId,
        options: HashMap<String, String>,
        ipam: Vec<IpamEntry>,
    ) -> DriverResult<()> {
        LinkConfig::parse(id, &options)?;
        if !self.ctx.config.allow_empty {
            return Ok(());
        }

        let network = NetworkResource {
            id: id.as_str().to_string(),
            name: String::new(),
            driver: self.ctx.config.driver_name.clone(),
            options,
            ipam,
        };
        provisioner::ensure_network(&self.ctx, &network).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(network = %id))]
    pub async fn delete_network(&self, id: &NetworkId) -> DriverResult<()> {
        let lock = self.ctx.networks.lock(id).await;
        let links = self.ctx.links.link_list().await?;
        let plan = provisioner::teardown_plan(&self.ctx, &lock, &links).await;
        provisioner::remove_devices(&self.ctx, &plan).await?;
        lock.remove();
        info!(vxlan = %plan.vxlan, "Network deleted");
        Ok(())
    }

    /// Provisions the network's devices. The daemon keeps the endpoint's
    /// address and MAC, so there is nothing to hand back.
    #[instrument(skip(self), fields(network = %network, endpoint = %endpoint))]
    pub async fn create_endpoint(
        &self,
        network: &NetworkId,
        endpoint: &EndpointId,
    ) -> DriverResult<()> {
        provisioner::ensure(&self.ctx, network).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(network = %network, endpoint = %endpoint))]
    pub async fn delete_endpoint(
        &self,
        network: &NetworkId,
        endpoint: &EndpointId,
    ) -> DriverResult<()> {
        endpoint::remove_device(&self.ctx, endpoint).await?;
        reclaim::spawn_reclaim(&self.ctx, network.clone());
        Ok(())
    }

    pub fn endpoint_info(
        &self,
        _network: &NetworkId,
        _endpoint: &EndpointId,
    ) -> HashMap<String, String> {
        HashMap::new()
    }

    pub async fn join(&self, network: &NetworkId, endpoint: &EndpointId) -> DriverResult<JoinInfo> {
        endpoint::join(&self.ctx, network, endpoint).await
    }

    pub async fn leave(&self, network: &NetworkId, endpoint: &EndpointId) -> DriverResult<()> {
        endpoint::leave(&self.ctx, network, endpoint).await
    }

    /// Starts the discovery poller and the gateway ARP watcher, when their
    /// policies enable them.
    pub fn spawn_background(&self) {
        if let Some(poller) = NetworkDiscovery::poller(&self.ctx) {
            self.ctx.tasks.spawn(poller.run());
        }
        if let Some(watcher) = ArpWatcher::for_context(&self.ctx) {
            self.ctx.tasks.spawn(watcher.run());
        }
    }

    /// Stops background work, waits for in-flight reclamation and, unless
    /// told to keep them, deletes every tracked network's devices.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;

        if self.ctx.config.no_remove_device {
            info!(networks = self.ctx.networks.len(), "Leaving devices in place");
            return;
        }
        for id in self.ctx.networks.ids() {
            let lock = self.ctx.networks.lock(&id).await;
            let Some(state) = lock.state() else {
                continue;
            };
            let plan = Teardown::from_state(&state);
            match provisioner::remove_devices(&self.ctx, &plan).await {
                Ok(()) => info!(network = %id, "Removed network devices"),
                Err(e) => warn!(network = %id, error = %e, "Failed to remove network devices"),
            }
            lock.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use pretty_assertions::assert_eq;
    use vxlan_common::DriverError;
    use vxlan_test::{long_id, options, FakeDaemon, FakeFirewall, FakeKernel, NetworkFixture};

    fn driver(config: DriverConfig) -> (Driver, Arc<FakeKernel>, Arc<FakeDaemon>) {
        let kernel = Arc::new(FakeKernel::with_nic("eth0"));
        let daemon = Arc::new(FakeDaemon::new());
        let ctx = DriverContext::new(config, kernel.clone(), daemon.clone(), Arc::new(FakeFirewall::new()));
        (Driver::new(ctx), kernel, daemon)
    }

    fn global() -> DriverConfig {
        DriverConfig {
            scope: Scope::Global,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_network_validates_only() {
        let (driver, kernel, _) = driver(global());
        let id = NetworkId::new(long_id("abcdef012345"));

        driver
            .create_network(&id, options(&[("VxlanId", "100")]), Vec::new())
            .await
            .unwrap();
        assert!(!kernel.exists("vx_abcdef012345"));

        let err = driver
            .create_network(&id, options(&[("TTL", "not-a-number")]), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidOption { .. }));
    }

    #[tokio::test]
    async fn test_create_network_provisions_under_allow_empty() {
        let (driver, kernel, _) = driver(DriverConfig {
            allow_empty: true,
            ..global()
        });
        let id = NetworkId::new(long_id("abcdef012345"));
        driver.create_network(&id, HashMap::new(), Vec::new()).await.unwrap();
        assert!(kernel.exists("vx_abcdef012345"));
    }

    #[tokio::test]
    async fn test_delete_network_is_idempotent() {
        let (driver, kernel, daemon) = driver(global());
        let id = long_id("abcdef012345");
        daemon.add_network(NetworkFixture::new(&id, "blue").build());
        let id = NetworkId::new(id);

        driver
            .create_endpoint(&id, &EndpointId::new("ep1"))
            .await
            .unwrap();
        assert!(kernel.exists("vx_abcdef012345"));

        driver.delete_network(&id).await.unwrap();
        assert!(!kernel.exists("vx_abcdef012345"));
        driver.delete_network(&id).await.unwrap();
        assert!(driver.context().networks.is_empty());
    }

    #[tokio::test]
    async fn test_delete_network_leaves_foreign_device() {
        let (driver, kernel, daemon) = driver(global());
        let id = long_id("abcdef012345");
        daemon.add_network(
            NetworkFixture::new(&id, "blue")
                .with_option("vxlanName", "eth0")
                .build(),
        );
        let id = NetworkId::new(id);

        let err = driver
            .create_endpoint(&id, &EndpointId::new("ep1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::KernelLink { .. }));

        driver.delete_network(&id).await.unwrap();
        assert!(kernel.exists("eth0"));
        assert!(kernel.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_removes_devices() {
        let (driver, kernel, daemon) = driver(global());
        let id = long_id("abcdef012345");
        daemon.add_network(NetworkFixture::new(&id, "blue").build());
        driver
            .create_endpoint(&NetworkId::new(id), &EndpointId::new("ep1"))
            .await
            .unwrap();

        driver.shutdown().await;
        assert!(!kernel.exists("vx_abcdef012345"));
        assert!(driver.context().shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_devices() {
        let (driver, kernel, daemon) = driver(DriverConfig {
            no_remove_device: true,
            ..global()
        });
        let id = long_id("abcdef012345");
        daemon.add_network(NetworkFixture::new(&id, "blue").build());
        driver
            .create_endpoint(&NetworkId::new(id), &EndpointId::new("ep1"))
            .await
            .unwrap();

        driver.shutdown().await;
        assert!(kernel.exists("vx_abcdef012345"));
    }

    #[test]
    fn test_endpoint_info_is_empty() {
        let (driver, _, _) = driver(global());
        assert_eq!(
            driver.endpoint_info(&NetworkId::new("n1"), &EndpointId::new("ep1")),
            HashMap::new()
        );
    }
}
