// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool start task assembly.
//!
//! The start task is built from named fragments selected by the OS and GPU
//! flags. Fragments are validated individually and joined with `&&`, so the
//! first failing fragment fails the start task and Batch marks the node
//! unusable instead of scheduling work on it.

use std::fmt;

use crate::config::{Config, OsFamily, OsImage};

/// Retry budget of the GPU-visibility check.
const GPU_CHECK_RETRIES: u32 = 30;
const GPU_CHECK_DELAY_SECS: u32 = 10;

/// Start task assembly errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StartTaskError {
    /// The task has no fragments.
    #[error("start task has no commands")]
    Empty,
    /// A fragment is blank.
    #[error("fragment '{0}' is empty")]
    EmptyFragment(String),
    /// A fragment spans several lines.
    #[error("fragment '{0}' contains a line break")]
    Multiline(String),
}

/// Quote `value` as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fragment {
    label: String,
    command: String,
}

/// Validated start task command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTaskCommand {
    labels: Vec<String>,
    script: String,
}

impl StartTaskCommand {
    /// Command line submitted to Batch.
    pub fn command_line(&self) -> String {
        format!("/bin/bash -c {}", shell_quote(&self.script))
    }

    /// Unquoted script body.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Labels of the fragments, in execution order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl fmt::Display for StartTaskCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Builder for [`StartTaskCommand`].
#[derive(Debug, Clone, Default)]
pub struct StartTaskBuilder {
    fragments: Vec<Fragment>,
}

impl StartTaskBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start task for the node OS and GPU flag in `config`.
    pub fn for_config(config: &Config) -> Self {
        let mut builder = Self::new()
            .step("strict-mode", "set -euo pipefail")
            .container_runtime(&config.os);
        if config.gpu {
            builder = builder.gpu_toolkit(&config.os).gpu_visibility_check();
        }
        builder.step("done", "echo batchforge-start-task-complete")
    }

    /// Append a labelled fragment.
    pub fn step(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.fragments.push(Fragment {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Install, enable and start a container runtime if none is present.
    pub fn container_runtime(self, os: &OsImage) -> Self {
        match os.family {
            OsFamily::Ubuntu => self.step(
                "container-runtime",
                "(command -v docker >/dev/null 2>&1 || (export DEBIAN_FRONTEND=noninteractive; apt-get update -y && apt-get install -y docker.io)) && systemctl enable --now docker",
            ),
            OsFamily::AlmaLinux => self.step(
                "container-runtime",
                "(command -v docker >/dev/null 2>&1 || (dnf install -y dnf-plugins-core && dnf config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo && dnf install -y docker-ce docker-ce-cli containerd.io)) && systemctl enable --now docker",
            ),
        }
    }

    /// Install the NVIDIA container toolkit and wire it into the runtime.
    pub fn gpu_toolkit(self, os: &OsImage) -> Self {
        let install = match os.family {
            OsFamily::Ubuntu => {
                "(dpkg -s nvidia-container-toolkit >/dev/null 2>&1 || (curl -fsSL https://nvidia.github.io/libnvidia-container/gpgkey | gpg --dearmor --yes -o /usr/share/keyrings/nvidia-container-toolkit-keyring.gpg && curl -fsSL https://nvidia.github.io/libnvidia-container/stable/deb/nvidia-container-toolkit.list | sed \"s#deb https://#deb [signed-by=/usr/share/keyrings/nvidia-container-toolkit-keyring.gpg] https://#g\" > /etc/apt/sources.list.d/nvidia-container-toolkit.list && apt-get update -y && apt-get install -y nvidia-container-toolkit))"
            }
            OsFamily::AlmaLinux => {
                "(rpm -q nvidia-container-toolkit >/dev/null 2>&1 || (curl -fsSL https://nvidia.github.io/libnvidia-container/stable/rpm/nvidia-container-toolkit.repo -o /etc/yum.repos.d/nvidia-container-toolkit.repo && dnf install -y nvidia-container-toolkit))"
            }
        };
        self.step("gpu-container-toolkit", install).step(
            "gpu-runtime-config",
            "nvidia-ctk runtime configure --runtime=docker && systemctl restart docker",
        )
    }

    /// Block until the GPU is visible to the driver, bounded by a retry budget.
    pub fn gpu_visibility_check(self) -> Self {
        self.step(
            "gpu-visibility",
            format!(
                "for i in $(seq 1 {retries}); do nvidia-smi -L && break; if [ \"$i\" -eq {retries} ]; then echo \"GPU not visible\" >&2; exit 1; fi; sleep {delay}; done",
                retries = GPU_CHECK_RETRIES,
                delay = GPU_CHECK_DELAY_SECS
            ),
        )
    }

    /// Validate fragments and produce the command.
    pub fn build(self) -> Result<StartTaskCommand, StartTaskError> {
        if self.fragments.is_empty() {
            return Err(StartTaskError::Empty);
        }
        for fragment in &self.fragments {
            if fragment.command.trim().is_empty() {
                return Err(StartTaskError::EmptyFragment(fragment.label.clone()));
            }
            if fragment.command.contains(['\n', '\r']) {
                return Err(StartTaskError::Multiline(fragment.label.clone()));
            }
        }

        // `set` must not be chained with `&&` or later failures would be masked.
        let mut parts = Vec::with_capacity(self.fragments.len());
        let mut prelude = Vec::new();
        for fragment in &self.fragments {
            if fragment.command.trim_start().starts_with("set ") {
                prelude.push(fragment.command.trim().to_string());
            } else {
                parts.push(fragment.command.trim().to_string());
            }
        }
        let body = parts.join(" && ");
        let script = if prelude.is_empty() {
            body
        } else {
            format!("{}; {}", prelude.join("; "), body)
        };

        Ok(StartTaskCommand {
            labels: self.fragments.into_iter().map(|f| f.label).collect(),
            script,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(gpu: bool, family: OsFamily, version: &str) -> Config {
        Config::builder().gpu(gpu).os(family, version).build().unwrap()
    }

    #[test]
    fn test_cpu_ubuntu_has_no_gpu_fragments() {
        let task = StartTaskBuilder::for_config(&config(false, OsFamily::Ubuntu, "22.04"))
            .build()
            .unwrap();
        let line = task.command_line();

        assert!(line.contains("docker.io"));
        assert!(!line.contains("nvidia"));
        assert!(!line.contains("nvidia-smi"));
        assert_eq!(task.labels(), ["strict-mode", "container-runtime", "done"]);
    }

    #[test]
    fn test_gpu_installs_toolkit_and_waits_for_gpu_last() {
        let task = StartTaskBuilder::for_config(&config(true, OsFamily::Ubuntu, "22.04"))
            .build()
            .unwrap();
        let script = task.script();

        let runtime = script.find("docker.io").unwrap();
        let toolkit = script.find("apt-get install -y nvidia-container-toolkit").unwrap();
        let check = script.find("nvidia-smi -L").unwrap();
        let done = script.find("batchforge-start-task-complete").unwrap();
        assert!(runtime < toolkit && toolkit < check && check < done);
        assert!(script.contains("nvidia-ctk runtime configure --runtime=docker"));
    }

    #[test]
    fn test_almalinux_uses_dnf() {
        let task = StartTaskBuilder::for_config(&config(true, OsFamily::AlmaLinux, "9"))
            .build()
            .unwrap();
        assert!(task.script().contains("dnf install -y docker-ce"));
        assert!(task.script().contains("dnf install -y nvidia-container-toolkit"));
        assert!(!task.script().contains("apt-get"));
    }

    #[test]
    fn test_strict_mode_is_prelude() {
        let task = StartTaskBuilder::new()
            .step("strict", "set -e")
            .step("a", "true")
            .step("b", "echo hi")
            .build()
            .unwrap();
        assert_eq!(task.script(), "set -e; true && echo hi");
    }

    #[test]
    fn test_single_quotes_are_escaped() {
        let task = StartTaskBuilder::new()
            .step("say", "echo 'hi'")
            .build()
            .unwrap();
        assert_eq!(task.command_line(), r#"/bin/bash -c 'echo '\''hi'\'''"#);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(reboot); `id`"), "'$(reboot); `id`'");
    }

    #[test]
    fn test_validation() {
        assert_eq!(StartTaskBuilder::new().build(), Err(StartTaskError::Empty));
        assert_eq!(
            StartTaskBuilder::new().step("blank", "  ").build(),
            Err(StartTaskError::EmptyFragment("blank".into()))
        );
        assert_eq!(
            StartTaskBuilder::new().step("two", "a\nb").build(),
            Err(StartTaskError::Multiline("two".into()))
        );
    }
}
