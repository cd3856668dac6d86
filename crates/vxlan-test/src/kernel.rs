//! In-memory kernel device table.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use vxlan_common::{DriverError, DriverResult, Link, LinkKind, LinkOps, LinkSpec, LinkSpecKind};
use vxlan_types::{IpPrefix, MacAddress};

/// Operations that can be made to fail with [`FakeKernel::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelOp {
    Add,
    Del,
    SetUp,
    SetMaster,
    SetHardwareAddr,
    SetMtu,
    AddrReplace,
}

/// A neighbour entry installed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub sandbox: String,
    pub device: String,
    pub ip: IpAddr,
    pub mac: MacAddress,
}

#[derive(Debug, Clone)]
struct FakeLink {
    link: Link,
    up: bool,
    addrs: Vec<IpPrefix>,
}

#[derive(Debug, Default)]
struct KernelState {
    links: BTreeMap<String, FakeLink>,
    next_index: u32,
    added: Vec<LinkSpec>,
    deleted: Vec<String>,
    failures: HashSet<(KernelOp, String)>,
    netns: HashMap<String, Vec<Link>>,
    neighbors: Vec<NeighborEntry>,
    lookups: usize,
}

impl KernelState {
    fn index_of(&self, name: &str) -> Option<u32> {
        self.links.get(name).map(|l| l.link.index)
    }

    fn name_of(&self, index: u32) -> Option<String> {
        self.links
            .values()
            .find(|l| l.link.index == index)
            .map(|l| l.link.name.clone())
    }

    fn check(&self, op: KernelOp, name: &str) -> DriverResult<()> {
        if self.failures.contains(&(op, name.to_string())) {
            return Err(DriverError::kernel_link(
                format!("{:?} {}", op, name),
                "injected failure",
            ));
        }
        Ok(())
    }

    fn get_mut(&mut self, name: &str) -> DriverResult<&mut FakeLink> {
        self.links
            .get_mut(name)
            .ok_or_else(|| DriverError::device_not_found(name))
    }

    fn insert(&mut self, name: &str, kind: LinkKind) -> u32 {
        self.next_index += 1;
        let index = self.next_index;
        let [hi, lo] = u16::try_from(index).unwrap_or(u16::MAX).to_be_bytes();
        self.links.insert(
            name.to_string(),
            FakeLink {
                link: Link {
                    index,
                    name: name.to_string(),
                    kind,
                    master_index: None,
                    parent_index: None,
                    mac: Some(MacAddress::new([0x02, 0, 0, 0, hi, lo])),
                    mtu: Some(1500),
                },
                up: false,
                addrs: Vec::new(),
            },
        );
        index
    }

    /// Removes a device and whatever the kernel removes along with it:
    /// macvlans on top of it and its veth peer. Bridge slaves are released.
    fn remove(&mut self, name: &str) {
        let Some(removed) = self.links.remove(name) else {
            return;
        };
        let index = removed.link.index;

        let dependents: Vec<String> = self
            .links
            .values()
            .filter(|l| {
                l.link.parent_index == Some(index)
                    && matches!(l.link.kind, LinkKind::Macvlan | LinkKind::Veth)
            })
            .map(|l| l.link.name.clone())
            .collect();
        for dep in dependents {
            self.remove(&dep);
        }

        for l in self.links.values_mut() {
            if l.link.master_index == Some(index) {
                l.link.master_index = None;
            }
        }
    }
}

/// An in-memory stand-in for the kernel network-device subsystem.
///
/// Indices are allocated from 1 upwards. Every new device gets a locally
/// administered MAC derived from its index and an MTU of 1500.
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<KernelState>,
    add_delay: Mutex<Option<Duration>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a kernel that already has a physical NIC called `name`.
    pub fn with_nic(name: &str) -> Self {
        let kernel = Self::new();
        kernel.add_nic(name);
        kernel
    }

    /// Adds a physical NIC and returns its index.
    pub fn add_nic(&self, name: &str) -> u32 {
        let mut state = self.state.lock();
        let index = state.insert(name, LinkKind::Other("device".to_string()));
        if let Some(l) = state.links.get_mut(name) {
            l.up = true;
        }
        index
    }

    /// Adds a device enslaved to `master` (e.g. a veth left by another host
    /// process).
    pub fn add_slave(&self, name: &str, master: &str) -> u32 {
        let mut state = self.state.lock();
        let master_index = state.index_of(master);
        let index = state.insert(name, LinkKind::Veth);
        if let Some(l) = state.links.get_mut(name) {
            l.link.master_index = master_index;
        }
        index
    }

    /// Adds a macvlan on top of `parent`.
    pub fn add_macvlan(&self, name: &str, parent: &str) -> u32 {
        let mut state = self.state.lock();
        let parent_index = state.index_of(parent);
        let index = state.insert(name, LinkKind::Macvlan);
        if let Some(l) = state.links.get_mut(name) {
            l.link.parent_index = parent_index;
        }
        index
    }

    /// Removes a device behind the driver's back, as another host process
    /// would.
    pub fn remove_link(&self, name: &str) {
        self.state.lock().remove(name);
    }

    /// Makes `op` on the device `name` fail with a kernel error.
    pub fn fail_on(&self, op: KernelOp, name: &str) {
        self.state.lock().failures.insert((op, name.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Delays every `link_add` so concurrent callers overlap.
    pub fn set_add_delay(&self, delay: Duration) {
        *self.add_delay.lock() = Some(delay);
    }

    /// Registers the devices visible inside a sandbox.
    pub fn add_netns(&self, sandbox: &str, links: Vec<Link>) {
        self.state.lock().netns.insert(sandbox.to_string(), links);
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        self.state.lock().links.get(name).map(|l| l.link.clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.state.lock().links.get(name).is_some_and(|l| l.up)
    }

    pub fn addresses(&self, name: &str) -> Vec<IpPrefix> {
        self.state
            .lock()
            .links
            .get(name)
            .map(|l| l.addrs.clone())
            .unwrap_or_default()
    }

    /// Name of the bridge `name` is enslaved to.
    pub fn master_of(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        let index = state.links.get(name)?.link.master_index?;
        state.name_of(index)
    }

    pub fn count_kind(&self, kind: &LinkKind) -> usize {
        self.state
            .lock()
            .links
            .values()
            .filter(|l| &l.link.kind == kind)
            .count()
    }

    pub fn link_names(&self) -> Vec<String> {
        self.state.lock().links.keys().cloned().collect()
    }

    /// Every spec passed to a successful `link_add`, in order.
    pub fn added_specs(&self) -> Vec<LinkSpec> {
        self.state.lock().added.clone()
    }

    /// Every device name passed to a successful `link_del`, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn neighbors(&self) -> Vec<NeighborEntry> {
        self.state.lock().neighbors.clone()
    }

    /// Number of `link_list` and `link_by_name` calls so far.
    pub fn lookups(&self) -> usize {
        self.state.lock().lookups
    }
}

#[async_trait]
impl LinkOps for FakeKernel {
    async fn link_list(&self) -> DriverResult<Vec<Link>> {
        let mut state = self.state.lock();
        state.lookups += 1;
        Ok(state.links.values().map(|l| l.link.clone()).collect())
    }

    async fn link_by_name(&self, name: &str) -> DriverResult<Option<Link>> {
        let mut state = self.state.lock();
        state.lookups += 1;
        Ok(state.links.get(name).map(|l| l.link.clone()))
    }

    async fn link_add(&self, spec: &LinkSpec) -> DriverResult<Link> {
        let delay = *self.add_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.check(KernelOp::Add, &spec.name)?;
        if state.links.contains_key(&spec.name) {
            return Err(DriverError::kernel_link(
                format!("link add {}", spec.name),
                "RTNETLINK answers: File exists",
            ));
        }

        let (kind, parent) = match &spec.kind {
            LinkSpecKind::Vxlan(attrs) => (LinkKind::Vxlan, attrs.vtep.as_ref().map(|v| v.index)),
            LinkSpecKind::Bridge => (LinkKind::Bridge, None),
            LinkSpecKind::Macvlan { parent } => {
                let index = state
                    .index_of(parent)
                    .ok_or_else(|| DriverError::device_not_found(parent.clone()))?;
                (LinkKind::Macvlan, Some(index))
            }
            LinkSpecKind::Veth { peer_name } => {
                if state.links.contains_key(peer_name) {
                    return Err(DriverError::kernel_link(
                        format!("link add {}", spec.name),
                        "RTNETLINK answers: File exists",
                    ));
                }
                (LinkKind::Veth, None)
            }
        };

        let index = state.insert(&spec.name, kind);
        if let LinkSpecKind::Veth { peer_name } = &spec.kind {
            let peer_index = state.insert(peer_name, LinkKind::Veth);
            if let Some(peer) = state.links.get_mut(peer_name) {
                peer.link.parent_index = Some(index);
            }
            if let Some(own) = state.links.get_mut(&spec.name) {
                own.link.parent_index = Some(peer_index);
            }
        } else if let Some(own) = state.links.get_mut(&spec.name) {
            own.link.parent_index = parent;
        }

        state.added.push(spec.clone());
        let link = state.get_mut(&spec.name)?.link.clone();
        Ok(link)
    }

    async fn link_del(&self, name: &str) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.check(KernelOp::Del, name)?;
        if !state.links.contains_key(name) {
            return Err(DriverError::device_not_found(name));
        }
        state.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn link_set_up(&self, name: &str) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.check(KernelOp::SetUp, name)?;
        state.get_mut(name)?.up = true;
        Ok(())
    }

    async fn link_set_master(&self, name: &str, master: &str) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.check(KernelOp::SetMaster, name)?;
        let master_index = state
            .index_of(master)
            .ok_or_else(|| DriverError::device_not_found(master))?;
        state.get_mut(name)?.link.master_index = Some(master_index);
        Ok(())
    }

    async fn link_set_hardware_addr(&self, name: &str, mac: MacAddress) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.check(KernelOp::SetHardwareAddr, name)?;
        state.get_mut(name)?.link.mac = Some(mac);
        Ok(())
    }

    async fn link_set_mtu(&self, name: &str, mtu: u32) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.check(KernelOp::SetMtu, name)?;
        state.get_mut(name)?.link.mtu = Some(mtu);
        Ok(())
    }

    async fn addr_replace(&self, name: &str, addr: IpPrefix) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.check(KernelOp::AddrReplace, name)?;
        let link = state.get_mut(name)?;
        if !link.addrs.contains(&addr) {
            link.addrs.push(addr);
        }
        Ok(())
    }

    async fn netns_links(&self, sandbox: &str) -> DriverResult<Vec<Link>> {
        self.state
            .lock()
            .netns
            .get(sandbox)
            .cloned()
            .ok_or_else(|| {
                DriverError::kernel_link(
                    format!("netns {}", sandbox),
                    "No such file or directory",
                )
            })
    }

    async fn netns_neigh_replace(
        &self,
        sandbox: &str,
        device: &str,
        ip: IpAddr,
        mac: MacAddress,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        if !state.netns.contains_key(sandbox) {
            return Err(DriverError::kernel_link(
                format!("netns {}", sandbox),
                "No such file or directory",
            ));
        }
        let entry = NeighborEntry {
            sandbox: sandbox.to_string(),
            device: device.to_string(),
            ip,
            mac,
        };
        state
            .neighbors
            .retain(|n| !(n.sandbox == entry.sandbox && n.device == entry.device && n.ip == ip));
        state.neighbors.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_add_and_delete() {
        let kernel = FakeKernel::with_nic("eth0");
        let link = kernel
            .link_add(&LinkSpec::new("br0", LinkSpecKind::Bridge))
            .await
            .unwrap();
        assert_eq!(link.index, 2);
        assert_eq!(link.kind, LinkKind::Bridge);

        kernel.link_del("br0").await.unwrap();
        assert!(!kernel.exists("br0"));
        assert!(kernel.link_del("br0").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_add_fails() {
        let kernel = FakeKernel::new();
        let spec = LinkSpec::new("br0", LinkSpecKind::Bridge);
        kernel.link_add(&spec).await.unwrap();
        assert!(kernel.link_add(&spec).await.is_err());
        assert_eq!(kernel.added_specs().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_parent_removes_macvlans() {
        let kernel = FakeKernel::with_nic("eth0");
        kernel.add_macvlan("mv0", "eth0");
        kernel.add_slave("veth0", "eth0");

        kernel.link_del("eth0").await.unwrap();
        assert!(!kernel.exists("mv0"));
        assert_eq!(kernel.link("veth0").unwrap().master_index, None);
    }

    #[tokio::test]
    async fn test_veth_pair() {
        let kernel = FakeKernel::new();
        kernel
            .link_add(&LinkSpec::new(
                "veth_a",
                LinkSpecKind::Veth {
                    peer_name: "vethc_a".to_string(),
                },
            ))
            .await
            .unwrap();
        assert!(kernel.exists("vethc_a"));
        kernel.link_del("veth_a").await.unwrap();
        assert!(!kernel.exists("vethc_a"));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let kernel = FakeKernel::with_nic("eth0");
        kernel.fail_on(KernelOp::SetUp, "eth0");
        assert!(kernel.link_set_up("eth0").await.is_err());
        kernel.clear_failures();
        assert!(kernel.link_set_up("eth0").await.is_ok());
    }
}
