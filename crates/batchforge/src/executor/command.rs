// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud CLI command values.

use std::fmt;

/// One invocation of the cloud CLI: a description for the log and the
/// argument vector passed to the binary verbatim (no shell involved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCommand {
    description: String,
    args: Vec<String>,
    secret_flags: Vec<String>,
}

impl CloudCommand {
    /// Create a command from its description and leading arguments.
    pub fn new<I, S>(description: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            description: description.into(),
            args: args.into_iter().map(Into::into).collect(),
            secret_flags: Vec::new(),
        }
    }

    /// Append a positional argument or bare flag.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `flag value`.
    pub fn opt(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.into());
        self
    }

    /// Append `flag value` when a value is present.
    pub fn opt_if(self, flag: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.opt(flag, v),
            None => self,
        }
    }

    /// Append `flag value`, masking the value when the command is displayed.
    pub fn secret_opt(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.secret_flags.push(flag.to_string());
        self.opt(flag, value)
    }

    /// Request JSON output.
    pub fn json(self) -> Self {
        self.opt("--output", "json")
    }

    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Argument vector.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether the arguments start with the given prefix.
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        prefix.len() <= self.args.len() && prefix.iter().zip(&self.args).all(|(p, a)| p == a)
    }

    /// Value following `flag`, if present.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Whether a bare flag is present.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

impl fmt::Display for CloudCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("az")?;
        let mut masked = false;
        for arg in &self.args {
            if std::mem::take(&mut masked) {
                f.write_str(" ***")?;
                continue;
            }
            masked = self.secret_flags.contains(arg);
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_lookup() {
        let cmd = CloudCommand::new("Create VM", ["vm", "create"])
            .opt("--resource-group", "rg")
            .opt("--name", "vm1")
            .opt_if("--zone", None::<String>)
            .arg("--no-wait")
            .json();

        assert_eq!(cmd.description(), "Create VM");
        assert!(cmd.starts_with(&["vm", "create"]));
        assert!(!cmd.starts_with(&["vm", "show"]));
        assert_eq!(cmd.value_of("--name"), Some("vm1"));
        assert_eq!(cmd.value_of("--zone"), None);
        assert!(cmd.has_flag("--no-wait"));
        assert_eq!(
            cmd.to_string(),
            "az vm create --resource-group rg --name vm1 --no-wait --output json"
        );
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let cmd = CloudCommand::new("Show account", ["account", "show"]).opt("--query", "a b");
        assert_eq!(cmd.to_string(), "az account show --query \"a b\"");
    }

    #[test]
    fn test_secret_values_are_masked() {
        let cmd = CloudCommand::new("Run script", ["vm", "run-command", "invoke"])
            .secret_opt("--scripts", "docker login -p hunter2")
            .opt("--name", "vm1");
        assert_eq!(
            cmd.to_string(),
            "az vm run-command invoke --scripts *** --name vm1"
        );
        assert_eq!(cmd.value_of("--scripts"), Some("docker login -p hunter2"));
    }
}
