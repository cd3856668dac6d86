//! Per-network state and the per-network lock that guards it.
//!
//! [`NetworkTable`] hands out a [`NetworkLock`] per network ID. Provisioning,
//! endpoint binding and reclamation all run under that lock, and the only
//! way to insert or remove a [`NetworkState`] is through it. The lock entry
//! is created on first reference and dropped again once no state remains
//! and nobody else holds or waits for it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use vxlan_common::{IpamEntry, Link};
use vxlan_types::NetworkId;

use crate::options::LinkConfig;

/// What the driver knows about one provisioned network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub id: NetworkId,
    /// Daemon-side network name, empty when provisioned from a create
    /// request before the daemon knew the network.
    pub name: String,
    pub config: LinkConfig,
    pub vxlan: Link,
    pub bridge: Option<Link>,
    /// Device holding the gateway addresses (helper macvlan or bridge).
    pub gateway_device: Option<String>,
    pub ipam: Vec<IpamEntry>,
    /// The single gateway handed to endpoints at Join.
    pub gateway: Option<IpAddr>,
    /// Gateways whose ARP traffic is blocked on the VXLAN device.
    pub blocked_gateways: Vec<Ipv4Addr>,
}

/// Shared table of provisioned networks.
#[derive(Debug, Default)]
pub struct NetworkTable {
    states: DashMap<NetworkId, Arc<NetworkState>>,
    locks: Mutex<HashMap<NetworkId, Arc<tokio::sync::Mutex<()>>>>,
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the per-network lock, waiting for any current holder.
    pub async fn lock(&self, id: &NetworkId) -> NetworkLock<'_> {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        NetworkLock {
            table: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    pub fn get(&self, id: &NetworkId) -> Option<Arc<NetworkState>> {
        self.states.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn contains(&self, id: &NetworkId) -> bool {
        self.states.contains_key(id)
    }

    pub fn ids(&self) -> Vec<NetworkId> {
        self.states.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Number of live per-network lock entries.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Exclusive access to one network's state.
#[derive(Debug)]
pub struct NetworkLock<'a> {
    table: &'a NetworkTable,
    id: NetworkId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NetworkLock<'_> {
    pub fn id(&self) -> &NetworkId {
        &self.id
    }

    pub fn state(&self) -> Option<Arc<NetworkState>> {
        self.table.get(&self.id)
    }

    pub fn insert(&self, state: NetworkState) -> Arc<NetworkState> {
        let state = Arc::new(state);
        self.table.states.insert(self.id.clone(), Arc::clone(&state));
        state
    }

    pub fn remove(&self) -> Option<Arc<NetworkState>> {
        self.table.states.remove(&self.id).map(|(_, s)| s)
    }
}

impl Drop for NetworkLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.table.locks.lock();
        let idle = locks
            .get(&self.id)
            .is_some_and(|m| Arc::strong_count(m) == 1);
        if idle && !self.table.states.contains_key(&self.id) {
            locks.remove(&self.id);
        }
    }
}
