//! Shared infrastructure for the VXLAN network driver.
//!
//! - [`error`]: the driver error taxonomy and shell failures
//! - [`shell`]: quoted shell command execution
//! - [`kernel`]: the [`LinkOps`] seam over the kernel network-device subsystem
//! - [`daemon`]: the [`DaemonClient`] seam over the container-runtime daemon
//! - [`firewall`]: the [`ArpFirewall`] seam over the ARP filtering tool
//!
//! Production implementations of the three seams live in the daemon crate;
//! in-memory fakes live in `vxlan-test`.
//!
//! # Example
//!
//! ```ignore
//! use vxlan_common::shell::{self, shellquote, IP_CMD};
//!
//! let cmd = format!("{} link set {} up", IP_CMD, shellquote("vx_abcdef012345"));
//! shell::exec_or_throw(&cmd).await?;
//! ```

pub mod daemon;
pub mod error;
pub mod firewall;
pub mod kernel;
pub mod shell;

pub use daemon::{
    ContainerEndpoint, ContainerSummary, DaemonClient, IpamEntry, NetworkConnectEvent,
    NetworkResource,
};
pub use error::{DriverError, DriverResult, ShellError, ShellResult};
pub use firewall::ArpFirewall;
pub use kernel::{Link, LinkKind, LinkOps, LinkSpec, LinkSpecKind, VtepRef, VxlanAttrs};
