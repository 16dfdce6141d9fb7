//! Single execution choke point for every kernel mutation.
//!
//! All chain, anchor, policy-route and sysctl commands in this crate go
//! through [`ShellOps`], so dry-run drivers, audit logging and test doubles
//! only ever have one seam to replace.
//!
//! Production code uses [`RealShellOps`].
//! Tests use a stateful mock (see `mocks` module).

use async_trait::async_trait;
use tokio::process::Command;

/// Whether a failing command is worth a log line.
///
/// Idempotent cleanup (deleting something already absent) produces benign
/// failures that would otherwise flood the log.
#[derive(Debug, Clone, Copy)]
pub enum Logs {
    Print,
    Suppress,
}

/// Abstraction over subshell execution of rule-mutation commands.
#[async_trait]
pub trait ShellOps: Send + Sync {
    /// Run `command` through `sh -c` and return its exit status.
    /// A spawn failure maps to a negative status.
    async fn bash(&self, command: &str, logs: Logs) -> i32;

    /// Run `command` through `sh -c` and return its trimmed stdout, or
    /// `None` when the command failed.
    async fn bash_output(&self, command: &str) -> Option<String>;
}

/// Production [`ShellOps`] that executes real commands.
#[derive(Clone, Default)]
pub struct RealShellOps;

#[async_trait]
impl ShellOps for RealShellOps {
    async fn bash(&self, command: &str, logs: Logs) -> i32 {
        match Command::new("sh").arg("-c").arg(command).output().await {
            Ok(output) => {
                let code = output.status.code().unwrap_or(-1);
                if code != 0 && matches!(logs, Logs::Print) {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    tracing::warn!(command, code, %stderr, "command failed");
                }
                code
            }
            Err(error) => {
                if matches!(logs, Logs::Print) {
                    tracing::warn!(command, %error, "failed to spawn command");
                }
                -1
            }
        }
    }

    async fn bash_output(&self, command: &str) -> Option<String> {
        match Command::new("sh").arg("-c").arg(command).output().await {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(command, code = output.status.code(), %stderr, "command failed");
                None
            }
            Err(error) => {
                tracing::warn!(command, %error, "failed to spawn command");
                None
            }
        }
    }
}
