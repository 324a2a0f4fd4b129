// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution log.
//!
//! Every external command and every step transition is written as one
//! human-readable line to an append-only file named after the invocation's
//! start timestamp, and mirrored to the console through `tracing`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Normal progress
    Info,
    /// Something was skipped or needs attention
    Warn,
    /// A command or step failed
    Error,
}

impl Level {
    fn tag(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

struct Inner {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

/// Append-only log of one invocation. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionLog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ExecutionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLog")
            .field("run_id", &self.inner.run_id)
            .field("path", &self.inner.path)
            .finish()
    }
}

impl ExecutionLog {
    /// Create `batchforge_<YYYYMMDD_HHMMSS>.log` in `dir` and append to it.
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        let started_at = Utc::now();
        std::fs::create_dir_all(dir)?;
        let name = format!(
            "batchforge_{}.log",
            started_at.with_timezone(&Local).format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let log = Self {
            inner: Arc::new(Inner {
                run_id: Uuid::new_v4(),
                started_at,
                path: Some(path),
                file: Some(Mutex::new(file)),
            }),
        };
        log.write_line(
            Level::Info,
            &format!("run {} started at {}", log.run_id(), started_at.to_rfc3339()),
        );
        Ok(log)
    }

    /// A log that only emits tracing events (tests, dry runs).
    pub fn console_only() -> Self {
        Self {
            inner: Arc::new(Inner {
                run_id: Uuid::new_v4(),
                started_at: Utc::now(),
                path: None,
                file: None,
            }),
        }
    }

    /// Identifier of this invocation.
    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// When this invocation started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Path of the log file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Record the outcome of one external command.
    pub fn command(&self, description: &str, succeeded: bool, detail: Option<&str>) {
        if succeeded {
            info!(command = %description, "Command succeeded");
            self.write_line(Level::Info, &format!("OK     {}", description));
        } else {
            let detail = detail.unwrap_or("no error output");
            warn!(command = %description, error = %detail, "Command failed");
            self.write_line(
                Level::Error,
                &format!("FAILED {}: {}", description, first_line(detail)),
            );
        }
    }

    /// Record a step transition or other driver event.
    pub fn event(&self, level: Level, message: &str) {
        match level {
            Level::Info => info!("{}", message),
            Level::Warn => warn!("{}", message),
            Level::Error => error!("{}", message),
        }
        self.write_line(level, message);
    }

    fn write_line(&self, level: Level, message: &str) {
        let Some(file) = &self.inner.file else {
            return;
        };
        let line = format!(
            "{} [{}] [{}] {}\n",
            Utc::now().to_rfc3339(),
            &self.inner.run_id.to_string()[..8],
            level.tag(),
            message
        );
        // A poisoned lock only means another writer panicked mid-line.
        let mut guard = match file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = guard.write_all(line.as_bytes()) {
            warn!(error = %e, "Failed to append to execution log");
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(text)
}
