//! Kernel device operations through iproute2.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;
use vxlan_common::{DriverError, DriverResult, Link, LinkKind, LinkOps, LinkSpec, ShellError};
use vxlan_types::{IpPrefix, MacAddress};

use crate::commands::*;

/// One entry of `ip -d -j link show`.
#[derive(Debug, Deserialize)]
struct IpLinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    link_index: Option<u32>,
    #[serde(default)]
    link_netnsid: Option<i32>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    linkinfo: Option<LinkInfoJson>,
}

#[derive(Debug, Deserialize)]
struct LinkInfoJson {
    #[serde(default)]
    info_kind: Option<String>,
}

/// Parses `ip -j link show` output, resolving master and lower device names
/// against the same listing.
fn parse_links(json: &str) -> DriverResult<Vec<Link>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<IpLinkJson> = serde_json::from_str(json)
        .map_err(|e| DriverError::kernel_link("parse link list", e.to_string()))?;

    let by_name: HashMap<&str, u32> = raw.iter().map(|l| (l.ifname.as_str(), l.ifindex)).collect();

    Ok(raw
        .iter()
        .map(|l| Link {
            index: l.ifindex,
            name: l.ifname.clone(),
            kind: l
                .linkinfo
                .as_ref()
                .and_then(|i| i.info_kind.as_deref())
                .map(LinkKind::from_kind)
                .unwrap_or_else(|| LinkKind::Other("device".to_string())),
            master_index: l.master.as_deref().and_then(|m| by_name.get(m).copied()),
            parent_index: local_parent(l, &by_name),
            mac: l.address.as_deref().and_then(|a| a.parse().ok()),
            mtu: l.mtu,
        })
        .collect())
}

/// Index of the lower device, if it lives in this namespace.
///
/// `link_netnsid` marks a peer in another namespace (the container end of a
/// veth), whose index means nothing here.
fn local_parent(l: &IpLinkJson, by_name: &HashMap<&str, u32>) -> Option<u32> {
    if l.link_netnsid.is_some() {
        return None;
    }
    l.link
        .as_deref()
        .and_then(|p| by_name.get(p).copied())
        .or(l.link_index)
}

fn is_missing_device(output: &str) -> bool {
    output.contains("Cannot find device") || output.contains("does not exist")
}

/// [`LinkOps`] backed by the `ip` command.
#[derive(Debug, Default)]
pub struct IpLinks {
    runner: CommandRunner,
}

impl IpLinks {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn new_mock() -> Self {
        Self {
            runner: CommandRunner::new_mock(),
        }
    }

    #[cfg(test)]
    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    /// Runs a command that acts on the device `name`.
    async fn run_on(&self, name: &str, cmd: &str) -> DriverResult<String> {
        self.runner.run(cmd).await.map_err(|e| match &e {
            ShellError::CommandFailed { output, .. } if is_missing_device(output) => {
                DriverError::device_not_found(name)
            }
            _ => DriverError::kernel_link(cmd, e.output().to_string()),
        })
    }
}

#[async_trait]
impl LinkOps for IpLinks {
    async fn link_list(&self) -> DriverResult<Vec<Link>> {
        let cmd = build_link_show_cmd();
        let out = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| DriverError::kernel_link(&cmd, e.to_string()))?;
        parse_links(&out)
    }

    async fn link_by_name(&self, name: &str) -> DriverResult<Option<Link>> {
        // Master and lower device names only resolve against the full listing
        Ok(self.link_list().await?.into_iter().find(|l| l.name == name))
    }

    async fn link_add(&self, spec: &LinkSpec) -> DriverResult<Link> {
        let cmd = build_link_add_cmd(spec);
        debug!(device = %spec.name, "Adding link");
        self.runner.run(&cmd).await.map_err(|e| match &e {
            ShellError::CommandFailed { output, .. } if is_missing_device(output) => {
                DriverError::device_not_found(&spec.name)
            }
            _ => DriverError::kernel_link(&cmd, e.output().to_string()),
        })?;

        self.link_by_name(&spec.name)
            .await?
            .ok_or_else(|| DriverError::device_not_found(&spec.name))
    }

    async fn link_del(&self, name: &str) -> DriverResult<()> {
        self.run_on(name, &build_link_del_cmd(name)).await.map(|_| ())
    }

    async fn link_set_up(&self, name: &str) -> DriverResult<()> {
        self.run_on(name, &build_link_set_up_cmd(name)).await.map(|_| ())
    }

    async fn link_set_master(&self, name: &str, master: &str) -> DriverResult<()> {
        self.run_on(name, &build_link_set_master_cmd(name, master))
            .await
            .map(|_| ())
    }

    async fn link_set_hardware_addr(&self, name: &str, mac: MacAddress) -> DriverResult<()> {
        self.run_on(name, &build_link_set_address_cmd(name, mac))
            .await
            .map(|_| ())
    }

    async fn link_set_mtu(&self, name: &str, mtu: u32) -> DriverResult<()> {
        self.run_on(name, &build_link_set_mtu_cmd(name, mtu))
            .await
            .map(|_| ())
    }

    async fn addr_replace(&self, name: &str, addr: IpPrefix) -> DriverResult<()> {
        self.run_on(name, &build_addr_replace_cmd(name, addr))
            .await
            .map(|_| ())
    }

    async fn netns_links(&self, sandbox: &str) -> DriverResult<Vec<Link>> {
        let cmd = build_netns_link_show_cmd(sandbox);
        let out = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| DriverError::kernel_link(&cmd, e.to_string()))?;
        parse_links(&out)
    }

    async fn netns_neigh_replace(
        &self,
        sandbox: &str,
        device: &str,
        ip: IpAddr,
        mac: MacAddress,
    ) -> DriverResult<()> {
        let cmd = build_netns_neigh_replace_cmd(sandbox, device, ip, mac);
        self.runner
            .run(&cmd)
            .await
            .map(|_| ())
            .map_err(|e| DriverError::kernel_link(&cmd, e.to_string()))
    }
}
