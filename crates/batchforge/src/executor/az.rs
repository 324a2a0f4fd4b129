// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Azure CLI executor.
//!
//! Spawns the `az` binary once per command with captured stdio. The child
//! is killed when a command exceeds the configured timeout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CloudCommand, CommandExecutor, CommandOutcome};
use crate::log::ExecutionLog;

/// Executor that shells out to the Azure CLI.
pub struct AzCliExecutor {
    binary: String,
    timeout: Duration,
    log: ExecutionLog,
}

impl AzCliExecutor {
    /// Create an executor for `binary` with a per-command timeout.
    pub fn new(binary: impl Into<String>, timeout: Duration, log: ExecutionLog) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            log,
        }
    }

    async fn run(&self, command: &CloudCommand) -> CommandOutcome {
        let start = Instant::now();

        let mut cmd = Command::new(&self.binary);
        cmd.args(command.args())
            .env("AZURE_CORE_NO_COLOR", "true")
            .env("AZURE_CORE_ONLY_SHOW_ERRORS", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutcome {
                    succeeded: false,
                    output: String::new(),
                    error: Some(format!("failed to start '{}': {}", self.binary, e)),
                    exit_code: None,
                    duration: start.elapsed(),
                };
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            // Dropping the wait future drops the child, which kills it.
            Err(_) => {
                warn!(
                    command = %command,
                    timeout_secs = self.timeout.as_secs(),
                    "Command timed out, killed"
                );
                CommandOutcome {
                    succeeded: false,
                    output: String::new(),
                    error: Some(format!("timed out after {}s", self.timeout.as_secs())),
                    exit_code: None,
                    duration: start.elapsed(),
                }
            }
            Ok(Err(e)) => CommandOutcome {
                succeeded: false,
                output: String::new(),
                error: Some(format!("failed to wait for '{}': {}", self.binary, e)),
                exit_code: None,
                duration: start.elapsed(),
            },
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let succeeded = output.status.success();
                CommandOutcome {
                    succeeded,
                    output: stdout,
                    error: if succeeded || stderr.is_empty() {
                        None
                    } else {
                        Some(stderr)
                    },
                    exit_code: output.status.code(),
                    duration: start.elapsed(),
                }
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for AzCliExecutor {
    fn executor_type(&self) -> &'static str {
        "az"
    }

    async fn execute(&self, command: &CloudCommand) -> CommandOutcome {
        debug!(command = %command, "Executing");
        let outcome = self.run(command).await;
        debug!(
            command = %command,
            succeeded = outcome.succeeded,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration.as_millis() as u64,
            "Command finished"
        );
        self.log.command(
            command.description(),
            outcome.succeeded,
            outcome.error.as_deref(),
        );
        outcome
    }
}
