//! Kernel network-device seam.
//!
//! [`LinkOps`] is the narrow set of device operations the driver needs.
//! Devices are addressed by name; indices are reported back in [`Link`] so
//! callers can compare master and parent relationships.

use async_trait::async_trait;
use std::net::IpAddr;
use vxlan_types::{IpPrefix, MacAddress};

use crate::error::DriverResult;

/// The kind of an existing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Vxlan,
    Bridge,
    Macvlan,
    Veth,
    /// Any other kind (physical NICs, loopback, ...), with the kernel's name for it.
    Other(String),
}

impl LinkKind {
    /// Maps the kernel's `info_kind` string to a [`LinkKind`].
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "vxlan" => LinkKind::Vxlan,
            "bridge" => LinkKind::Bridge,
            "macvlan" => LinkKind::Macvlan,
            "veth" => LinkKind::Veth,
            other => LinkKind::Other(other.to_string()),
        }
    }
}

/// A device as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    /// Index of the bridge this device is enslaved to.
    pub master_index: Option<u32>,
    /// Index of the lower device (macvlan parent, veth peer).
    pub parent_index: Option<u32>,
    pub mac: Option<MacAddress>,
    pub mtu: Option<u32>,
}

impl Link {
    /// A device is a slave when it has either a master or a parent.
    pub fn is_slave(&self) -> bool {
        self.master_index.is_some() || self.parent_index.is_some()
    }

    /// Returns true if this device hangs off the device with `index`.
    pub fn is_attached_to(&self, index: u32) -> bool {
        self.master_index == Some(index) || self.parent_index == Some(index)
    }
}

/// The tunnel-endpoint device a VXLAN device sends through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtepRef {
    pub name: String,
    pub index: u32,
}

/// VXLAN attributes. Unset fields are left to the kernel default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VxlanAttrs {
    pub vni: u32,
    pub vtep: Option<VtepRef>,
    pub src_addr: Option<IpAddr>,
    pub group: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub tos: Option<u8>,
    pub learning: Option<bool>,
    pub proxy: Option<bool>,
    pub rsc: Option<bool>,
    pub l2miss: Option<bool>,
    pub l3miss: Option<bool>,
    pub no_age: Option<bool>,
    pub gbp: Option<bool>,
    /// FDB ageing timeout in seconds.
    pub age: Option<u32>,
    /// Maximum number of FDB entries.
    pub limit: Option<u32>,
    pub port: Option<u16>,
    /// Source UDP port range (low, high).
    pub port_range: Option<(u16, u16)>,
}

/// What kind of device to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecKind {
    Vxlan(VxlanAttrs),
    Bridge,
    /// Bridge-mode macvlan on top of `parent`.
    Macvlan { parent: String },
    /// Veth pair; the new device is one end, `peer_name` the other.
    Veth { peer_name: String },
}

/// A device to create.
///
/// Hardware address and MTU are not part of the spec: the kernel refuses
/// some of them at creation time for VXLAN devices, so they are applied
/// with [`LinkOps::link_set_hardware_addr`] and [`LinkOps::link_set_mtu`]
/// after the add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub name: String,
    pub tx_queue_len: Option<u32>,
    pub kind: LinkSpecKind,
}

impl LinkSpec {
    pub fn new(name: impl Into<String>, kind: LinkSpecKind) -> Self {
        Self {
            name: name.into(),
            tx_queue_len: None,
            kind,
        }
    }

    pub fn with_tx_queue_len(mut self, tx_queue_len: Option<u32>) -> Self {
        self.tx_queue_len = tx_queue_len;
        self
    }

    pub fn vxlan_attrs(&self) -> Option<&VxlanAttrs> {
        match &self.kind {
            LinkSpecKind::Vxlan(attrs) => Some(attrs),
            _ => None,
        }
    }
}

/// Operations on the kernel network-device subsystem.
///
/// `link_del` on an absent device returns
/// [`DriverError::DeviceNotFound`](crate::DriverError::DeviceNotFound);
/// every other failure is a
/// [`DriverError::KernelLink`](crate::DriverError::KernelLink).
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Lists every device in the host namespace.
    async fn link_list(&self) -> DriverResult<Vec<Link>>;

    /// Looks a device up by name, `None` if it does not exist.
    async fn link_by_name(&self, name: &str) -> DriverResult<Option<Link>>;

    /// Creates a device and returns it as the kernel reports it.
    async fn link_add(&self, spec: &LinkSpec) -> DriverResult<Link>;

    async fn link_del(&self, name: &str) -> DriverResult<()>;

    async fn link_set_up(&self, name: &str) -> DriverResult<()>;

    async fn link_set_master(&self, name: &str, master: &str) -> DriverResult<()>;

    async fn link_set_hardware_addr(&self, name: &str, mac: MacAddress) -> DriverResult<()>;

    async fn link_set_mtu(&self, name: &str, mtu: u32) -> DriverResult<()>;

    /// Assigns `addr` to the device, replacing an identical address.
    async fn addr_replace(&self, name: &str, addr: IpPrefix) -> DriverResult<()>;

    /// Lists the devices inside the network namespace at `sandbox`.
    async fn netns_links(&self, sandbox: &str) -> DriverResult<Vec<Link>>;

    /// Installs a permanent neighbour entry inside the namespace at `sandbox`.
    async fn netns_neigh_replace(
        &self,
        sandbox: &str,
        device: &str,
        ip: IpAddr,
        mac: MacAddress,
    ) -> DriverResult<()>;
}
