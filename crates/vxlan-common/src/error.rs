//! Error types for driver operations.
//!
//! [`DriverError`] is what every lifecycle operation returns to its caller.
//! [`ShellError`] is produced by the [`shell`](crate::shell) layer and mapped
//! by the collaborator implementations into a kernel or firewall error.

use std::io;
use thiserror::Error;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Result type alias for shell execution.
pub type ShellResult<T> = Result<T, ShellError>;

/// Errors surfaced by the network driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The daemon reports a different driver for the referenced network.
    #[error("network {network} is not an overlay network of this driver (driver: {driver})")]
    NotOverlayNetwork {
        /// The network ID.
        network: String,
        /// The driver the daemon reported.
        driver: String,
    },

    /// An option value could not be coerced to its type.
    #[error("invalid option {key}={value:?}: {reason}")]
    InvalidOption {
        /// The option key.
        key: String,
        /// The raw option value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An operation that needs an existing device found none.
    #[error("device {name} not found")]
    DeviceNotFound {
        /// The device name.
        name: String,
    },

    /// Refused to delete a device with neither a master nor a parent.
    #[error("device {name} is not a slave device, refusing to delete it")]
    NotASlaveDevice {
        /// The device name.
        name: String,
    },

    /// Talking to the container-runtime daemon failed.
    #[error("daemon API call failed: {operation}: {message}")]
    DaemonApi {
        /// The API operation (e.g. "network inspect").
        operation: String,
        /// Error message.
        message: String,
    },

    /// A device create, modify or delete failed.
    #[error("kernel link operation failed: {operation}: {message}")]
    KernelLink {
        /// The operation that failed (e.g. "link add vx_0123456789ab").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Installing an ARP filtering rule failed.
    #[error("firewall rule failed: {rule}: {message}")]
    FirewallRule {
        /// The rule that failed.
        rule: String,
        /// Error message.
        message: String,
    },
}

impl DriverError {
    pub fn not_overlay(network: impl Into<String>, driver: impl Into<String>) -> Self {
        Self::NotOverlayNetwork {
            network: network.into(),
            driver: driver.into(),
        }
    }

    pub fn invalid_option(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn device_not_found(name: impl Into<String>) -> Self {
        Self::DeviceNotFound { name: name.into() }
    }

    pub fn not_a_slave(name: impl Into<String>) -> Self {
        Self::NotASlaveDevice { name: name.into() }
    }

    pub fn daemon_api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DaemonApi {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn kernel_link(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::KernelLink {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn firewall_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FirewallRule {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Returns true for [`DriverError::DeviceNotFound`]. Delete paths treat
    /// this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::DeviceNotFound { .. })
    }
}

/// Failures of a shell command.
#[derive(Debug, Error)]
pub enum ShellError {
    /// The command could not be spawned.
    #[error("Failed to execute shell command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command returned a non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },
}

impl ShellError {
    pub fn command(&self) -> &str {
        match self {
            ShellError::Spawn { command, .. } | ShellError::CommandFailed { command, .. } => {
                command
            }
        }
    }

    /// The command's output, empty for spawn failures.
    pub fn output(&self) -> &str {
        match self {
            ShellError::Spawn { .. } => "",
            ShellError::CommandFailed { output, .. } => output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_display() {
        let err = DriverError::not_overlay("abc", "bridge");
        assert_eq!(
            err.to_string(),
            "network abc is not an overlay network of this driver (driver: bridge)"
        );

        let err = DriverError::invalid_option("TTL", "not-a-number", "invalid digit");
        assert_eq!(
            err.to_string(),
            "invalid option TTL=\"not-a-number\": invalid digit"
        );
    }

    #[test]
    fn test_is_not_found() {
        assert!(DriverError::device_not_found("vx_abc").is_not_found());
        assert!(!DriverError::not_a_slave("eth0").is_not_found());
        assert!(!DriverError::kernel_link("link add", "exists").is_not_found());
    }

    #[test]
    fn test_shell_error_accessors() {
        let err = ShellError::CommandFailed {
            command: "/sbin/ip link del \"vx_abc\"".to_string(),
            exit_code: 1,
            output: "Cannot find device \"vx_abc\"".to_string(),
        };
        assert_eq!(err.command(), "/sbin/ip link del \"vx_abc\"");
        assert!(err.output().contains("Cannot find device"));
        assert!(err.to_string().contains("exit code 1"));
    }
}
