//! Shell command execution for the iproute2, ebtables and nsenter tools.
//!
//! Every argument that comes from outside the driver (device names from
//! options, sandbox paths from the daemon) goes through [`shellquote`]
//! before it is spliced into a command line.

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{ShellError, ShellResult};

/// Path to the `ip` command.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `ebtables` command for ARP filtering.
pub const EBTABLES_CMD: &str = "/sbin/ebtables";

/// Path to `nsenter`, used to run `ip` inside a container's network namespace.
pub const NSENTER_CMD: &str = "/usr/bin/nsenter";

/// Characters with special meaning inside double quotes: $ ` " \ and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Wraps `s` in double quotes, escaping the characters the shell would
/// otherwise interpret.
///
/// ```
/// use vxlan_common::shell::shellquote;
///
/// assert_eq!(shellquote("vx_abcdef012345"), "\"vx_abcdef012345\"");
/// assert_eq!(shellquote("x$(reboot)"), "\"x\\$(reboot)\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// What a finished command printed, trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts a non-zero exit into [`ShellError::CommandFailed`].
    ///
    /// The error carries stderr when there is any, else stdout: iproute2
    /// reports "Cannot find device" on stderr and callers match on it.
    pub fn into_stdout(self, cmd: &str) -> ShellResult<String> {
        if self.success() {
            return Ok(self.stdout);
        }
        let output = if self.stderr.is_empty() {
            self.stdout
        } else {
            self.stderr
        };
        Err(ShellError::CommandFailed {
            command: cmd.to_string(),
            exit_code: self.exit_code,
            output,
        })
    }
}

/// Runs `cmd` through `/bin/sh -c`.
///
/// # Arguments
///
/// * `cmd` - A complete command line whose external arguments are already
///   quoted with [`shellquote`]
///
/// # Returns
///
/// The exit code and trimmed output. A non-zero exit is not an error here;
/// only a failure to spawn the shell returns `Err`.
pub async fn exec(cmd: &str) -> ShellResult<CommandOutput> {
    tracing::debug!(command = %cmd, "Running");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ShellError::Spawn {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    if !result.success() {
        tracing::debug!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command exited non-zero"
        );
    }
    Ok(result)
}

/// Runs `cmd` and returns its stdout, failing on a non-zero exit.
///
/// # Arguments
///
/// * `cmd` - The command line, as for [`exec`]
///
/// # Returns
///
/// Trimmed stdout, or [`ShellError::CommandFailed`] with the tool's
/// diagnostic when it exits non-zero.
pub async fn exec_or_throw(cmd: &str) -> ShellResult<String> {
    exec(cmd).await?.into_stdout(cmd)
}
