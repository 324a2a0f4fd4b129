// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock executor for testing.
//!
//! Responds to commands from scripted rules matched by argument prefix,
//! falling back to an optional handler, and records every call.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CloudCommand, CommandExecutor, CommandOutcome};
use crate::log::ExecutionLog;

type Handler = Box<dyn Fn(&CloudCommand) -> CommandOutcome + Send + Sync>;

#[derive(Debug)]
struct Rule {
    prefix: Vec<String>,
    responses: VecDeque<CommandOutcome>,
}

impl Rule {
    fn matches(&self, command: &CloudCommand) -> bool {
        let prefix: Vec<&str> = self.prefix.iter().map(String::as_str).collect();
        command.starts_with(&prefix)
    }

    /// Pop the next response, keeping the last one for repeated calls.
    fn next(&mut self) -> Option<CommandOutcome> {
        if self.responses.len() > 1 {
            self.responses.pop_front()
        } else {
            self.responses.front().cloned()
        }
    }
}

/// Mock executor for testing.
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    handler: Option<Handler>,
    calls: Mutex<Vec<CloudCommand>>,
    /// If true, unmatched commands fail instead of succeeding with `{}`
    pub strict: bool,
    log: ExecutionLog,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    /// Create a mock where unmatched commands succeed with `{}`.
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            handler: None,
            calls: Mutex::new(Vec::new()),
            strict: false,
            log: ExecutionLog::console_only(),
        }
    }

    /// Create a mock where unmatched commands fail.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    /// Create a mock that answers unmatched commands with `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CloudCommand) -> CommandOutcome + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::new()
        }
    }

    /// Write command lines to `log` as well.
    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = log;
        self
    }

    /// Always answer commands starting with `prefix` with `outcome`.
    ///
    /// Rules added later take precedence over earlier ones.
    pub fn on(&self, prefix: &[&str], outcome: CommandOutcome) -> &Self {
        self.on_sequence(prefix, vec![outcome])
    }

    /// Answer commands starting with `prefix` with `outcomes` in order,
    /// repeating the last one once the sequence is exhausted.
    pub fn on_sequence(&self, prefix: &[&str], outcomes: Vec<CommandOutcome>) -> &Self {
        self.lock_rules().push(Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            responses: outcomes.into(),
        });
        self
    }

    /// All commands executed so far.
    pub fn calls(&self) -> Vec<CloudCommand> {
        self.lock_calls().clone()
    }

    /// Number of executed commands starting with `prefix`.
    pub fn call_count(&self, prefix: &[&str]) -> usize {
        self.lock_calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Whether any executed command starts with `prefix`.
    pub fn was_called(&self, prefix: &[&str]) -> bool {
        self.call_count(prefix) > 0
    }

    /// Forget recorded calls (rules are kept).
    pub fn clear_calls(&self) {
        self.lock_calls().clear();
    }

    fn lock_rules(&self) -> std::sync::MutexGuard<'_, Vec<Rule>> {
        self.rules.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<CloudCommand>> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn respond(&self, command: &CloudCommand) -> CommandOutcome {
        let scripted = {
            let mut rules = self.lock_rules();
            rules
                .iter_mut()
                .rev()
                .find(|r| r.matches(command))
                .and_then(Rule::next)
        };
        if let Some(outcome) = scripted {
            return outcome;
        }
        if let Some(handler) = &self.handler {
            return handler(command);
        }
        if self.strict {
            CommandOutcome::failure(format!("no scripted response for: {}", command))
        } else {
            CommandOutcome::success("{}")
        }
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    fn executor_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, command: &CloudCommand) -> CommandOutcome {
        self.lock_calls().push(command.clone());
        let outcome = self.respond(command);
        self.log.command(
            command.description(),
            outcome.succeeded,
            outcome.error.as_deref(),
        );
        outcome
    }
}
