//! VXLAN overlay network driver.
//!
//! The driver materializes a VXLAN device per network (and optionally a
//! bridge), gives each endpoint a macvlan or veth device, assigns gateway
//! addresses and deletes a network's devices once nothing uses them.
//!
//! - [`options`]: per-network option parsing into [`LinkConfig`]
//! - [`provisioner`]: idempotent device provisioning with rollback
//! - [`gateway`]: gateway addresses and gateway ARP rules
//! - [`endpoint`]: per-endpoint devices at Join and Leave
//! - [`reclaim`]: deletion of unused network devices
//! - [`discovery`] and [`arp_watcher`]: the background loops
//! - [`driver`] and [`api`]: the lifecycle surface and its wire protocol
//! - [`ip_links`], [`ebtables`], [`docker`]: production collaborators

pub mod api;
pub mod arp_watcher;
pub mod commands;
pub mod config;
pub mod context;
pub mod discovery;
pub mod docker;
pub mod driver;
pub mod ebtables;
pub mod endpoint;
pub mod gateway;
pub mod ip_links;
pub mod options;
pub mod provisioner;
pub mod reclaim;
pub mod reconcile;
pub mod state;

pub use config::{DriverConfig, Scope};
pub use context::DriverContext;
pub use driver::Driver;
pub use endpoint::JoinInfo;
pub use options::LinkConfig;
pub use reclaim::ReclaimOutcome;
pub use state::{NetworkState, NetworkTable};
