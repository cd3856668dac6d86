//! The process-wide driver context.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vxlan_common::{ArpFirewall, DaemonClient, LinkOps};

use crate::config::DriverConfig;
use crate::state::NetworkTable;

/// Everything a lifecycle handler or background loop needs, built once at
/// startup and shared behind an `Arc`.
pub struct DriverContext {
    pub config: DriverConfig,
    pub links: Arc<dyn LinkOps>,
    pub daemon: Arc<dyn DaemonClient>,
    pub firewall: Arc<dyn ArpFirewall>,
    pub networks: NetworkTable,
    /// Cancelled on process interrupt; background loops watch it.
    pub shutdown: CancellationToken,
    /// Background reclamation tasks.
    pub tasks: TaskTracker,
}

impl DriverContext {
    pub fn new(
        config: DriverConfig,
        links: Arc<dyn LinkOps>,
        daemon: Arc<dyn DaemonClient>,
        firewall: Arc<dyn ArpFirewall>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            links,
            daemon,
            firewall,
            networks: NetworkTable::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Returns true if `driver` is the driver kind this plugin serves.
    pub fn is_own_driver(&self, driver: &str) -> bool {
        driver == self.config.driver_name
    }
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("config", &self.config)
            .field("networks", &self.networks.len())
            .finish_non_exhaustive()
    }
}
