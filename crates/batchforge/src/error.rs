// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for batchforge.

use std::time::Duration;

use thiserror::Error;

/// Process exit code for a failed step or timed out wait.
pub const EXIT_STEP_FAILURE: u8 = 1;
/// Process exit code for a precondition, validation or configuration failure.
pub const EXIT_PRECONDITION: u8 = 2;
/// Process exit code for a missing or invalid metadata hand-off.
pub const EXIT_HANDOFF: u8 = 3;

/// Provisioning errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading or validation failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A pre-flight requirement is not met (CLI missing, not logged in, SKU or quota).
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// An external command returned a failure result.
    #[error("{description} failed: {message}")]
    Command {
        /// Human readable description of the command.
        description: String,
        /// Error text reported by the command.
        message: String,
    },

    /// A resource could not be described for a reason other than "not found".
    #[error("Failed to describe {resource}: {message}")]
    Probe {
        /// Display form of the resource reference.
        resource: String,
        /// Error text reported by the describe command.
        message: String,
    },

    /// A resource reached a terminal failure state.
    #[error("{resource} reached state {state}")]
    FailedState {
        /// Display form of the resource reference.
        resource: String,
        /// Observed terminal state.
        state: String,
    },

    /// A wait or step exceeded its deadline.
    #[error("Timed out after {}s waiting for {what}", .waited.as_secs())]
    Timeout {
        /// What was being waited on.
        what: String,
        /// How long the wait lasted.
        waited: Duration,
    },

    /// The image metadata hand-off is missing or invalid.
    #[error("Metadata hand-off error: {0}")]
    Handoff(#[from] crate::metadata::HandoffError),

    /// The start task could not be assembled.
    #[error("Start task error: {0}")]
    StartTask(#[from] crate::start_task::StartTaskError),

    /// A step needs a value an earlier step should have produced.
    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a command failure from a description and error text.
    pub fn command(description: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            description: description.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Precondition(_) => EXIT_PRECONDITION,
            Self::Handoff(_) => EXIT_HANDOFF,
            _ => EXIT_STEP_FAILURE,
        }
    }

    /// Whether the driver may attempt the step again.
    ///
    /// Only command failures are retried; precondition, hand-off and
    /// terminal-state errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Command { .. })
    }
}

/// Result type using batchforge Error.
pub type Result<T> = std::result::Result<T, Error>;
