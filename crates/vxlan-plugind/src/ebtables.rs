//! ARP filtering through ebtables.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use tracing::{debug, info};
use vxlan_common::{ArpFirewall, DriverError, DriverResult};

use crate::commands::*;

/// [`ArpFirewall`] backed by the `ebtables` command.
#[derive(Debug, Default)]
pub struct Ebtables {
    runner: CommandRunner,
}

impl Ebtables {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn new_mock() -> Self {
        Self {
            runner: CommandRunner::new_mock(),
        }
    }

    /// Deletes `rule` if present; a missing rule is not an error.
    async fn delete_rule(&self, rule: &str) {
        if let Err(e) = self.runner.run(&build_ebtables_delete_cmd(rule)).await {
            debug!(rule = %rule, error = %e, "Rule not removed");
        }
    }

    async fn append_rule(&self, rule: &str) -> DriverResult<()> {
        // At most one copy of each rule
        self.delete_rule(rule).await;
        self.runner
            .run(&build_ebtables_append_cmd(rule))
            .await
            .map(|_| ())
            .map_err(|e| DriverError::firewall_rule(rule, e.output().to_string()))
    }
}

#[async_trait]
impl ArpFirewall for Ebtables {
    async fn block_gateway_arp(&self, device: &str, gateway: Ipv4Addr) -> DriverResult<()> {
        self.append_rule(&arp_reply_rule(device, gateway)).await?;
        self.append_rule(&arp_request_rule(device, gateway)).await?;
        info!(device = %device, gateway = %gateway, "Blocked gateway ARP on tunnel device");
        Ok(())
    }

    async fn unblock_gateway_arp(&self, device: &str, gateway: Ipv4Addr) -> DriverResult<()> {
        self.delete_rule(&arp_reply_rule(device, gateway)).await;
        self.delete_rule(&arp_request_rule(device, gateway)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn gw() -> Ipv4Addr {
        "10.1.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_block_deletes_then_appends() {
        let fw = Ebtables::new_mock();
        // The leading deletes fail because the rules are not there yet
        fw.runner.push_failure(255, "Sorry, rule does not exist.");
        fw.runner.push_output("");
        fw.runner.push_failure(255, "Sorry, rule does not exist.");
        fw.runner.push_output("");

        fw.block_gateway_arp("vx0", gw()).await.unwrap();

        let cmds = fw.runner.captured_commands();
        assert_eq!(cmds.len(), 4);
        assert!(cmds[0].starts_with("/sbin/ebtables -D OUTPUT"));
        assert!(cmds[1].starts_with("/sbin/ebtables -A OUTPUT"));
        assert!(cmds[1].contains("--arp-opcode 2 --arp-ip-src 10.1.0.1"));
        assert!(cmds[2].starts_with("/sbin/ebtables -D INPUT"));
        assert!(cmds[3].contains("--arp-opcode 1 --arp-ip-dst 10.1.0.1"));
    }

    #[tokio::test]
    async fn test_append_failure_is_firewall_error() {
        let fw = Ebtables::new_mock();
        fw.runner.push_output("");
        fw.runner.push_failure(127, "ebtables: not found");

        match fw.block_gateway_arp("vx0", gw()).await {
            Err(DriverError::FirewallRule { rule, message }) => {
                assert!(rule.starts_with("OUTPUT -p ARP"));
                assert_eq!(message, "ebtables: not found");
            }
            other => panic!("expected FirewallRule, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unblock_ignores_missing_rules() {
        let fw = Ebtables::new_mock();
        fw.runner.push_failure(255, "Sorry, rule does not exist.");
        fw.runner.push_failure(255, "Sorry, rule does not exist.");
        fw.unblock_gateway_arp("vx0", gw()).await.unwrap();
        assert_eq!(fw.runner.captured_commands().len(), 2);
    }
}
