//! Materializes networks of this driver that other hosts created, before
//! any local endpoint joins them.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use vxlan_common::{DriverResult, NetworkResource};

use crate::context::DriverContext;
use crate::provisioner;
use crate::reconcile::{Reconcile, ReconcileLoop};

/// Desired: the daemon's networks of this driver. Actual: the networks
/// provisioned locally.
pub struct NetworkDiscovery {
    ctx: Arc<DriverContext>,
}

impl NetworkDiscovery {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    /// The poller for `ctx`, or `None` unless the driver keeps empty
    /// networks resident.
    pub fn poller(ctx: &Arc<DriverContext>) -> Option<ReconcileLoop<Self>> {
        if !ctx.config.allow_empty {
            return None;
        }
        Some(ReconcileLoop::new(
            Self::new(Arc::clone(ctx)),
            ctx.config.poll_interval,
            ctx.shutdown.child_token(),
        ))
    }
}

#[async_trait]
impl Reconcile for NetworkDiscovery {
    type Item = NetworkResource;

    fn key(&self, item: &NetworkResource) -> String {
        item.id.clone()
    }

    async fn desired(&self) -> DriverResult<Vec<NetworkResource>> {
        let networks = self.ctx.daemon.list_networks().await?;
        Ok(networks
            .into_iter()
            .filter(|n| self.ctx.is_own_driver(&n.driver))
            .collect())
    }

    async fn actual(&self) -> DriverResult<HashSet<String>> {
        Ok(self
            .ctx
            .networks
            .ids()
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect())
    }

    async fn create(&self, item: &NetworkResource) -> DriverResult<()> {
        provisioner::ensure_network(&self.ctx, item).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, Scope};
    use crate::reconcile::reconcile_once;
    use pretty_assertions::assert_eq;
    use vxlan_test::{long_id, FakeDaemon, FakeFirewall, FakeKernel, NetworkFixture};

    fn context(allow_empty: bool) -> (Arc<DriverContext>, Arc<FakeKernel>, Arc<FakeDaemon>) {
        let kernel = Arc::new(FakeKernel::with_nic("eth0"));
        let daemon = Arc::new(FakeDaemon::new());
        let config = DriverConfig {
            scope: Scope::Global,
            allow_empty,
            ..Default::default()
        };
        let ctx = DriverContext::new(config, kernel.clone(), daemon.clone(), Arc::new(FakeFirewall::new()));
        (ctx, kernel, daemon)
    }

    #[test]
    fn test_poller_requires_allow_empty() {
        let (ctx, _, _) = context(false);
        assert!(NetworkDiscovery::poller(&ctx).is_none());
        let (ctx, _, _) = context(true);
        assert!(NetworkDiscovery::poller(&ctx).is_some());
    }

    #[tokio::test]
    async fn test_provisions_own_networks_only() {
        let (ctx, kernel, daemon) = context(true);
        daemon.add_network(NetworkFixture::new(long_id("abcdef012345"), "blue").build());
        daemon.add_network(
            NetworkFixture::new(long_id("bbbbbb012345"), "plain")
                .with_driver("bridge")
                .build(),
        );

        let discovery = NetworkDiscovery::new(Arc::clone(&ctx));
        let stats = reconcile_once(&discovery).await.unwrap();
        assert_eq!(stats.desired, 1);
        assert_eq!(stats.created, 1);
        assert!(kernel.exists("vx_abcdef012345"));
        assert!(!kernel.exists("vx_bbbbbb012345"));

        let stats = reconcile_once(&discovery).await.unwrap();
        assert_eq!(stats.created, 0);
    }

    #[tokio::test]
    async fn test_daemon_outage_aborts_pass() {
        let (ctx, _, daemon) = context(true);
        daemon.set_unavailable(true);
        let discovery = NetworkDiscovery::new(ctx);
        assert!(reconcile_once(&discovery).await.is_err());
    }
}
