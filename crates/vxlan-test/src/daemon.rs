//! Scriptable container-runtime daemon.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use vxlan_common::{
    ContainerEndpoint, ContainerSummary, DaemonClient, DriverError, DriverResult,
    NetworkConnectEvent, NetworkResource,
};

/// An in-memory daemon: networks, containers and a connect event feed.
///
/// Setting [`FakeDaemon::set_unavailable`] makes every call fail with a
/// daemon API error, as if the socket were gone.
pub struct FakeDaemon {
    networks: Mutex<BTreeMap<String, NetworkResource>>,
    containers: Mutex<Vec<ContainerSummary>>,
    endpoints: Mutex<HashMap<(String, String), ContainerEndpoint>>,
    events: broadcast::Sender<NetworkConnectEvent>,
    unavailable: AtomicBool,
    list_calls: AtomicUsize,
}

impl Default for FakeDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDaemon {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            networks: Mutex::new(BTreeMap::new()),
            containers: Mutex::new(Vec::new()),
            endpoints: Mutex::new(HashMap::new()),
            events,
            unavailable: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Adds or replaces a network.
    pub fn add_network(&self, network: NetworkResource) {
        self.networks.lock().insert(network.id.clone(), network);
    }

    pub fn remove_network(&self, id: &str) {
        self.networks.lock().remove(id);
    }

    /// Adds a container attached to the named networks.
    pub fn add_container(&self, id: &str, networks: &[&str]) {
        self.containers.lock().push(ContainerSummary {
            id: id.to_string(),
            networks: networks.iter().map(|n| n.to_string()).collect(),
        });
    }

    pub fn remove_container(&self, id: &str) {
        self.containers.lock().retain(|c| c.id != id);
    }

    /// Registers the endpoint `container_endpoint` returns for a
    /// container/network pair.
    pub fn set_endpoint(&self, container: &str, network: &str, endpoint: ContainerEndpoint) {
        self.endpoints
            .lock()
            .insert((container.to_string(), network.to_string()), endpoint);
    }

    /// Delivers a connect event to current subscribers.
    pub fn emit_connect(&self, network_id: &str, container_id: &str) {
        let _ = self.events.send(NetworkConnectEvent {
            network_id: network_id.to_string(),
            container_id: container_id.to_string(),
        });
    }

    /// Number of live event subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `list_networks` calls so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &str) -> DriverResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DriverError::daemon_api(
                operation,
                "Cannot connect to the Docker daemon",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DaemonClient for FakeDaemon {
    async fn inspect_network(&self, id: &str) -> DriverResult<NetworkResource> {
        self.check("network inspect")?;
        self.networks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::daemon_api("network inspect", format!("network {} not found", id)))
    }

    async fn list_networks(&self) -> DriverResult<Vec<NetworkResource>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check("network list")?;
        Ok(self.networks.lock().values().cloned().collect())
    }

    async fn list_containers(&self) -> DriverResult<Vec<ContainerSummary>> {
        self.check("container list")?;
        Ok(self.containers.lock().clone())
    }

    async fn container_endpoint(
        &self,
        container: &str,
        network: &str,
    ) -> DriverResult<ContainerEndpoint> {
        self.check("container inspect")?;
        self.endpoints
            .lock()
            .get(&(container.to_string(), network.to_string()))
            .cloned()
            .ok_or_else(|| {
                DriverError::daemon_api(
                    "container inspect",
                    format!("container {} has no endpoint on {}", container, network),
                )
            })
    }

    fn network_connect_events(&self) -> BoxStream<'static, DriverResult<NetworkConnectEvent>> {
        let rx = self.events.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
