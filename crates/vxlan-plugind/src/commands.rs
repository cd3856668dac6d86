//! Shell command builders for device, neighbour and ARP-rule operations

use std::net::{IpAddr, Ipv4Addr};
use vxlan_common::shell::{self, shellquote, EBTABLES_CMD, IP_CMD, NSENTER_CMD};
use vxlan_common::{LinkSpec, LinkSpecKind, ShellResult, VxlanAttrs};
use vxlan_types::{IpPrefix, MacAddress};

#[cfg(test)]
use parking_lot::Mutex;
#[cfg(test)]
use std::collections::VecDeque;

/// Build device listing command (`-d` for link kinds, `-j` for JSON)
pub fn build_link_show_cmd() -> String {
    format!("{} -d -j link show", IP_CMD)
}

fn push_flag(cmd: &mut String, flag: &str, value: Option<bool>) {
    match value {
        Some(true) => {
            cmd.push(' ');
            cmd.push_str(flag);
        }
        Some(false) => {
            cmd.push_str(" no");
            cmd.push_str(flag);
        }
        None => {}
    }
}

fn push_vxlan_attrs(cmd: &mut String, attrs: &VxlanAttrs) {
    cmd.push_str(&format!(" type vxlan id {}", attrs.vni));
    if let Some(vtep) = &attrs.vtep {
        cmd.push_str(&format!(" dev {}", shellquote(&vtep.name)));
    }
    if let Some(src) = attrs.src_addr {
        cmd.push_str(&format!(" local {}", src));
    }
    if let Some(group) = attrs.group {
        cmd.push_str(&format!(" group {}", group));
    }
    if let Some(ttl) = attrs.ttl {
        cmd.push_str(&format!(" ttl {}", ttl));
    }
    if let Some(tos) = attrs.tos {
        cmd.push_str(&format!(" tos {}", tos));
    }
    if let Some(port) = attrs.port {
        cmd.push_str(&format!(" dstport {}", port));
    }
    if let Some((low, high)) = attrs.port_range {
        cmd.push_str(&format!(" srcport {} {}", low, high));
    }
    push_flag(cmd, "learning", attrs.learning);
    push_flag(cmd, "proxy", attrs.proxy);
    push_flag(cmd, "rsc", attrs.rsc);
    push_flag(cmd, "l2miss", attrs.l2miss);
    push_flag(cmd, "l3miss", attrs.l3miss);
    if attrs.no_age == Some(true) {
        cmd.push_str(" ageing 0");
    } else if let Some(age) = attrs.age {
        cmd.push_str(&format!(" ageing {}", age));
    }
    if let Some(limit) = attrs.limit {
        cmd.push_str(&format!(" maxaddress {}", limit));
    }
    if attrs.gbp == Some(true) {
        cmd.push_str(" gbp");
    }
}

/// Build device creation command
///
/// # Arguments
///
/// * `spec` - Device name, kind and creation-time attributes. VXLAN
///   attributes left unset are omitted so the kernel defaults apply.
///
/// # Returns
///
/// `ip link add NAME [link PARENT] [txqueuelen N] type KIND ...`. MAC and MTU
/// are not part of it; they are set afterwards.
pub fn build_link_add_cmd(spec: &LinkSpec) -> String {
    let mut cmd = format!("{} link add {}", IP_CMD, shellquote(&spec.name));
    if let LinkSpecKind::Macvlan { parent } = &spec.kind {
        cmd.push_str(&format!(" link {}", shellquote(parent)));
    }
    if let Some(qlen) = spec.tx_queue_len {
        cmd.push_str(&format!(" txqueuelen {}", qlen));
    }
    match &spec.kind {
        LinkSpecKind::Vxlan(attrs) => push_vxlan_attrs(&mut cmd, attrs),
        LinkSpecKind::Bridge => cmd.push_str(" type bridge"),
        LinkSpecKind::Macvlan { .. } => cmd.push_str(" type macvlan mode bridge"),
        LinkSpecKind::Veth { peer_name } => {
            cmd.push_str(&format!(" type veth peer name {}", shellquote(peer_name)))
        }
    }
    cmd
}

/// Build device deletion command
pub fn build_link_del_cmd(name: &str) -> String {
    format!("{} link del {}", IP_CMD, shellquote(name))
}

/// Build admin up command
pub fn build_link_set_up_cmd(name: &str) -> String {
    format!("{} link set {} up", IP_CMD, shellquote(name))
}

/// Build enslave command
///
/// # Arguments
///
/// * `name` - Device to enslave (VXLAN device or host veth end)
/// * `master` - The bridge it joins
pub fn build_link_set_master_cmd(name: &str, master: &str) -> String {
    format!(
        "{} link set {} master {}",
        IP_CMD,
        shellquote(name),
        shellquote(master)
    )
}

pub fn build_link_set_address_cmd(name: &str, mac: MacAddress) -> String {
    format!("{} link set {} address {}", IP_CMD, shellquote(name), mac)
}

pub fn build_link_set_mtu_cmd(name: &str, mtu: u32) -> String {
    format!("{} link set {} mtu {}", IP_CMD, shellquote(name), mtu)
}

/// Build address assignment command (replace keeps it idempotent)
///
/// # Arguments
///
/// * `name` - The gateway device: the bridge, or the `gwmvl_` helper
/// * `addr` - Gateway address with the subnet's prefix length
pub fn build_addr_replace_cmd(name: &str, addr: IpPrefix) -> String {
    format!("{} addr replace {} dev {}", IP_CMD, addr, shellquote(name))
}

fn nsenter_prefix(sandbox: &str) -> String {
    format!("{} --net={}", NSENTER_CMD, shellquote(sandbox))
}

/// Build device listing command inside a container namespace
pub fn build_netns_link_show_cmd(sandbox: &str) -> String {
    format!("{} {} -j link show", nsenter_prefix(sandbox), IP_CMD)
}

/// Build permanent neighbour entry command inside a container namespace
///
/// # Arguments
///
/// * `sandbox` - Path of the container's network namespace, as reported by
///   the daemon
/// * `device` - Container interface that reaches the gateway
/// * `ip` - Gateway address
/// * `mac` - MAC the gateway answers with on this host
///
/// # Returns
///
/// An `nsenter --net=... ip neigh replace` line. `replace` lets the watcher
/// rerun it for every connect event.
pub fn build_netns_neigh_replace_cmd(
    sandbox: &str,
    device: &str,
    ip: IpAddr,
    mac: MacAddress,
) -> String {
    format!(
        "{} {} neigh replace {} lladdr {} dev {} nud permanent",
        nsenter_prefix(sandbox),
        IP_CMD,
        ip,
        mac,
        shellquote(device)
    )
}

/// Rule dropping ARP replies from `gateway` leaving through `device`
pub fn arp_reply_rule(device: &str, gateway: Ipv4Addr) -> String {
    format!(
        "OUTPUT -p ARP -o {} --arp-opcode 2 --arp-ip-src {} -j DROP",
        shellquote(device),
        gateway
    )
}

/// Rule dropping ARP requests for `gateway` arriving through `device`
pub fn arp_request_rule(device: &str, gateway: Ipv4Addr) -> String {
    format!(
        "INPUT -p ARP -i {} --arp-opcode 1 --arp-ip-dst {} -j DROP",
        shellquote(device),
        gateway
    )
}

/// Build ebtables append command
pub fn build_ebtables_append_cmd(rule: &str) -> String {
    format!("{} -A {}", EBTABLES_CMD, rule)
}

/// Build ebtables delete command
pub fn build_ebtables_delete_cmd(rule: &str) -> String {
    format!("{} -D {}", EBTABLES_CMD, rule)
}

/// Runs built commands, or captures them in mock mode.
#[derive(Debug, Default)]
pub struct CommandRunner {
    #[cfg(test)]
    mock: Option<MockShell>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MockShell {
    captured: Mutex<Vec<String>>,
    responses: Mutex<VecDeque<ShellResult<String>>>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(&self, cmd: &str) -> ShellResult<String> {
        #[cfg(test)]
        if let Some(mock) = &self.mock {
            mock.captured.lock().push(cmd.to_string());
            return mock.responses.lock().pop_front().unwrap_or(Ok(String::new()));
        }

        shell::exec_or_throw(cmd).await
    }
}

#[cfg(test)]
impl CommandRunner {
    pub fn new_mock() -> Self {
        Self {
            mock: Some(MockShell::default()),
        }
    }

    /// Queues the stdout of the next command.
    pub fn push_output(&self, stdout: &str) {
        if let Some(mock) = &self.mock {
            mock.responses.lock().push_back(Ok(stdout.to_string()));
        }
    }

    /// Queues a failure of the next command.
    pub fn push_failure(&self, exit_code: i32, output: &str) {
        if let Some(mock) = &self.mock {
            mock.responses
                .lock()
                .push_back(Err(vxlan_common::ShellError::CommandFailed {
                    command: String::new(),
                    exit_code,
                    output: output.to_string(),
                }));
        }
    }

    pub fn captured_commands(&self) -> Vec<String> {
        self.mock
            .as_ref()
            .map(|m| m.captured.lock().clone())
            .unwrap_or_default()
    }
}
