//! Container-runtime daemon client over the local Docker socket.

use async_trait::async_trait;
use bollard::models::{EventMessage, EventMessageTypeEnum, Network};
use bollard::query_parameters::{
    EventsOptions, InspectContainerOptions, InspectNetworkOptions, ListContainersOptions,
    ListNetworksOptions,
};
use bollard::Docker;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};
use vxlan_common::{
    ContainerEndpoint, ContainerSummary, DaemonClient, DriverError, DriverResult, IpamEntry,
    NetworkConnectEvent, NetworkResource,
};

/// Buffered connect events between the daemon stream and the watcher.
const EVENT_BUFFER: usize = 64;

/// [`DaemonClient`] backed by `bollard`.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient").finish_non_exhaustive()
    }
}

impl DockerClient {
    /// Connects using the platform defaults (`DOCKER_HOST` or
    /// `/var/run/docker.sock`).
    pub fn connect() -> DriverResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::daemon_api("connect", e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Converts a daemon network, skipping IPAM pools without a gateway.
fn network_resource(net: Network) -> NetworkResource {
    let id = net.id.unwrap_or_default();
    let ipam = net
        .ipam
        .and_then(|ipam| ipam.config)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|cfg| {
            let subnet = cfg.subnet.unwrap_or_default();
            let gateway = cfg.gateway.unwrap_or_default();
            match IpamEntry::from_parts(&subnet, &gateway) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(network = %id, error = %e, "Ignoring malformed IPAM config");
                    None
                }
            }
        })
        .collect();

    NetworkResource {
        name: net.name.unwrap_or_default(),
        driver: net.driver.unwrap_or_default(),
        options: net.options.unwrap_or_default(),
        ipam,
        id,
    }
}

/// Picks network connect events out of the daemon's event feed.
fn connect_event(msg: EventMessage) -> Option<NetworkConnectEvent> {
    if msg.typ != Some(EventMessageTypeEnum::NETWORK) || msg.action.as_deref() != Some("connect")
    {
        return None;
    }
    let actor = msg.actor?;
    let container_id = actor.attributes.and_then(|mut a| a.remove("container"))?;
    Some(NetworkConnectEvent {
        network_id: actor.id?,
        container_id,
    })
}

#[async_trait]
impl DaemonClient for DockerClient {
    async fn inspect_network(&self, id: &str) -> DriverResult<NetworkResource> {
        self.docker
            .inspect_network(id, None::<InspectNetworkOptions>)
            .await
            .map(network_resource)
            .map_err(|e| DriverError::daemon_api("network inspect", e.to_string()))
    }

    async fn list_networks(&self) -> DriverResult<Vec<NetworkResource>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(|e| DriverError::daemon_api("network list", e.to_string()))?;
        Ok(networks.into_iter().map(network_resource).collect())
    }

    async fn list_containers(&self) -> DriverResult<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(None::<ListContainersOptions>)
            .await
            .map_err(|e| DriverError::daemon_api("container list", e.to_string()))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                networks: c
                    .network_settings
                    .and_then(|s| s.networks)
                    .map(|n| n.into_keys().collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn container_endpoint(
        &self,
        container: &str,
        network: &str,
    ) -> DriverResult<ContainerEndpoint> {
        let info = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| DriverError::daemon_api("container inspect", e.to_string()))?;

        let settings = info.network_settings.ok_or_else(|| {
            DriverError::daemon_api("container inspect", "no network settings")
        })?;
        let sandbox_key = settings
            .sandbox_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| DriverError::daemon_api("container inspect", "no sandbox key"))?;

        // Endpoints are keyed by network name; match the ID as well
        let mac = settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .find(|(name, ep)| name == network || ep.network_id.as_deref() == Some(network))
            .and_then(|(_, ep)| ep.mac_address)
            .and_then(|m| m.parse().ok());

        Ok(ContainerEndpoint { sandbox_key, mac })
    }

    fn network_connect_events(&self) -> BoxStream<'static, DriverResult<NetworkConnectEvent>> {
        let docker = self.docker.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let mut events = docker.events(None::<EventsOptions>);
            while let Some(item) = events.next().await {
                let forwarded = match item {
                    Ok(msg) => match connect_event(msg) {
                        Some(event) => Ok(event),
                        None => continue,
                    },
                    Err(e) => Err(DriverError::daemon_api("events", e.to_string())),
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
            debug!("Daemon event stream closed");
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EventActor, Ipam, IpamConfig};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_network_resource_conversion() {
        let net = Network {
            id: Some("n1".to_string()),
            name: Some("blue".to_string()),
            driver: Some("vxlan".to_string()),
            options: Some(HashMap::from([("VxlanId".to_string(), "42".to_string())])),
            ipam: Some(Ipam {
                config: Some(vec![
                    IpamConfig {
                        subnet: Some("10.1.0.0/24".to_string()),
                        gateway: Some("10.1.0.1".to_string()),
                        ..Default::default()
                    },
                    IpamConfig {
                        subnet: Some("10.2.0.0/24".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let res = network_resource(net);
        assert_eq!(res.id, "n1");
        assert_eq!(res.name, "blue");
        assert_eq!(res.driver, "vxlan");
        assert_eq!(res.options.get("VxlanId").map(String::as_str), Some("42"));
        assert_eq!(res.ipam.len(), 1);
        assert_eq!(res.ipam[0].gateway_cidr().to_string(), "10.1.0.1/24");
    }

    #[test]
    fn test_connect_event_filter() {
        let msg = |typ, action: &str| EventMessage {
            typ: Some(typ),
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some("n1".to_string()),
                attributes: Some(HashMap::from([(
                    "container".to_string(),
                    "c1".to_string(),
                )])),
            }),
            ..Default::default()
        };

        assert_eq!(
            connect_event(msg(EventMessageTypeEnum::NETWORK, "connect")),
            Some(NetworkConnectEvent {
                network_id: "n1".to_string(),
                container_id: "c1".to_string(),
            })
        );
        assert_eq!(
            connect_event(msg(EventMessageTypeEnum::NETWORK, "disconnect")),
            None
        );
        assert_eq!(
            connect_event(msg(EventMessageTypeEnum::CONTAINER, "connect")),
            None
        );
    }
}
