//! Test infrastructure for the VXLAN network driver
//!
//! Provides:
//! - [`FakeKernel`]: an in-memory device table implementing `LinkOps`
//! - [`FakeDaemon`]: a scriptable container-runtime daemon
//! - [`FakeFirewall`]: records installed ARP rules
//! - fixtures for networks, IPAM data and option bags

mod daemon;
pub mod fixtures;
mod firewall;
mod kernel;

pub use daemon::FakeDaemon;
pub use firewall::FakeFirewall;
pub use fixtures::*;
pub use kernel::{FakeKernel, KernelOp, NeighborEntry};
