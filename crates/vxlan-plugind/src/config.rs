//! Process-lifetime driver configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default plugin socket the daemon discovers drivers through.
pub const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/vxlan.sock";

/// Default driver kind this plugin answers for.
pub const DEFAULT_DRIVER_NAME: &str = "vxlan";

/// Default Discovery Poller interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Whether a network's state is confined to one host or shared across a
/// cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    Local,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Scope::Local),
            "global" => Ok(Scope::Global),
            other => Err(format!(
                "invalid scope {:?}: expected \"local\" or \"global\"",
                other
            )),
        }
    }
}

/// Driver-wide configuration, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub scope: Scope,
    /// Tunnel-endpoint device used when a network does not name one.
    pub vtep_dev: Option<String>,
    /// Keep devices resident without endpoints, and provision networks
    /// created elsewhere ahead of any local endpoint.
    pub allow_empty: bool,
    pub local_gateway: bool,
    pub global_gateway: bool,
    pub block_gateway_arp: bool,
    /// Leave devices in place when the process exits.
    pub no_remove_device: bool,
    pub driver_name: String,
    pub poll_interval: Duration,
    pub socket_path: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            scope: Scope::default(),
            vtep_dev: None,
            allow_empty: false,
            local_gateway: false,
            global_gateway: false,
            block_gateway_arp: false,
            no_remove_device: false,
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scope_parse() {
        assert_eq!("local".parse::<Scope>(), Ok(Scope::Local));
        assert_eq!("global".parse::<Scope>(), Ok(Scope::Global));
        assert!("swarm".parse::<Scope>().is_err());
        assert_eq!(Scope::Local.to_string(), "local");
    }

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.scope, Scope::Local);
        assert_eq!(config.driver_name, "vxlan");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(!config.allow_empty);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }
}
