//! Shell command executor.
//!
//! Runs `line` through the requested shell with `-c`, captures combined
//! stdout and stderr, and reports the outcome through the delivery queue as
//! a completion notice.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_delivery::DeliveryQueue;
use tether_types::{CommandFinish, CommandRef, INTERNAL_SHELL};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatcher::{report_finish, CommandExecutor};

/// Shell used when the command does not name one.
const DEFAULT_SHELL: &str = "sh";

/// Executes commands as child processes of the agent.
pub struct ShellExecutor {
    queue: Arc<DeliveryQueue>,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(queue: Arc<DeliveryQueue>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    /// Run the command and describe the outcome. Never fails.
    pub async fn run(&self, command: &CommandRef) -> (bool, String) {
        if command.shell == INTERNAL_SHELL {
            return (
                false,
                format!("unsupported internal command: {}", command.line.trim()),
            );
        }
        if !command.user.is_empty() || !command.group.is_empty() {
            debug!(
                command = %command.id,
                user = %command.user,
                group = %command.group,
                "running as the agent's own user"
            );
        }

        let shell = if command.shell.is_empty() {
            DEFAULT_SHELL
        } else {
            command.shell.as_str()
        };

        let mut child = Command::new(shell);
        child
            .arg("-c")
            .arg(&command.line)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, child.output()).await {
            Err(_) => (
                false,
                format!("command timed out after {}s", self.timeout.as_secs()),
            ),
            Ok(Err(e)) => (false, format!("failed to start {shell}: {e}")),
            Ok(Ok(output)) => {
                let mut result = String::from_utf8_lossy(&output.stdout).into_owned();
                result.push_str(&String::from_utf8_lossy(&output.stderr));
                (output.status.success(), result)
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: CommandRef) {
        let started = Instant::now();
        let (success, result) = self.run(&command).await;
        let elapsed = started.elapsed();

        if success {
            info!(command = %command.id, elapsed = ?elapsed, "command finished");
        } else {
            warn!(command = %command.id, elapsed = ?elapsed, "command failed");
        }

        report_finish(
            &self.queue,
            &command.id,
            &CommandFinish {
                success,
                result,
                elapsed_time: elapsed.as_secs_f64(),
            },
        );
    }
}
