// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor trait definitions.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::CloudCommand;
use crate::error::{Error, Result};

/// Result of one external command. Failure is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Whether the command exited successfully.
    pub succeeded: bool,
    /// Captured standard output.
    pub output: String,
    /// Error text (stderr, spawn failure or timeout) for failed commands.
    pub error: Option<String>,
    /// Exit code, when the process ran to completion.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the command.
    pub duration: Duration,
}

impl CommandOutcome {
    /// A successful outcome with the given stdout.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            output: output.into(),
            error: None,
            exit_code: Some(0),
            duration: Duration::ZERO,
        }
    }

    /// A successful outcome whose stdout is the given JSON document.
    pub fn success_json(value: &Value) -> Self {
        Self::success(value.to_string())
    }

    /// A failed outcome with the given error text.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            output: String::new(),
            error: Some(error.into()),
            exit_code: Some(1),
            duration: Duration::ZERO,
        }
    }

    /// A failed outcome shaped like the provider's "not found" diagnostic.
    pub fn not_found(resource: &str) -> Self {
        Self::failure(format!(
            "ERROR: (ResourceNotFound) The Resource '{}' was not found.",
            resource
        ))
    }

    /// Parse stdout as JSON. Empty output parses as `null`.
    pub fn parse_json(&self) -> Result<Value> {
        if self.output.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&self.output)?)
    }

    /// Error text, falling back to stdout and then a generic message.
    pub fn error_text(&self) -> String {
        self.error
            .clone()
            .filter(|e| !e.trim().is_empty())
            .or_else(|| Some(self.output.clone()).filter(|o| !o.trim().is_empty()))
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "no output".to_string(),
            })
    }

    /// Convert a failed outcome into [`Error::Command`].
    pub fn into_result(self, command: &CloudCommand) -> Result<Self> {
        if self.succeeded {
            Ok(self)
        } else {
            Err(Error::command(command.description(), self.error_text()))
        }
    }
}

/// Trait for command executors.
///
/// Executors are responsible for running one cloud CLI command and reporting
/// its outcome, and for writing one log line per invocation. They do not
/// interpret output and never decide whether a failure is fatal.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Executor type identifier (e.g., "az", "mock")
    fn executor_type(&self) -> &'static str;

    /// Run a command to completion and report its outcome.
    async fn execute(&self, command: &CloudCommand) -> CommandOutcome;

    /// Run a command and turn a failed outcome into an error.
    async fn execute_checked(&self, command: &CloudCommand) -> Result<CommandOutcome> {
        self.execute(command).await.into_result(command)
    }

    /// Run a command and parse its JSON output, failing on a failed outcome.
    async fn execute_json(&self, command: &CloudCommand) -> Result<Value> {
        self.execute_checked(command).await?.parse_json()
    }
}
