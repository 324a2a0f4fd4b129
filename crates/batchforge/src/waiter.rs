// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-interval polling with a deadline.
//!
//! The check runs immediately; if it is not yet satisfied the waiter sleeps
//! for the poll interval and checks again. The last sleep is clipped so the
//! final check happens exactly at the deadline. There is no backoff and no
//! cancellation: a wait ends when the check is satisfied or the deadline
//! passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Outcome of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The check returned a value. The value may still describe a terminal
    /// failure state; the caller decides.
    Reached(T),
    /// The deadline passed first.
    TimedOut {
        /// Time spent waiting.
        elapsed: Duration,
    },
}

impl<T> WaitOutcome<T> {
    /// Convert `TimedOut` into [`Error::Timeout`].
    pub fn or_timeout(self, what: impl Into<String>) -> Result<T> {
        match self {
            Self::Reached(value) => Ok(value),
            Self::TimedOut { elapsed } => Err(Error::Timeout {
                what: what.into(),
                waited: elapsed,
            }),
        }
    }
}

/// Blocking poll-until-state primitive.
#[derive(Debug, Clone, Copy)]
pub struct PollingWaiter {
    interval: Duration,
}

impl PollingWaiter {
    /// Create a waiter with a fixed poll interval.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Poll interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `check` until it returns `Some` or `deadline` elapses.
    ///
    /// An error from `check` ends the wait immediately.
    pub async fn wait_until<T, F, Fut>(
        &self,
        what: &str,
        deadline: Duration,
        mut check: F,
    ) -> Result<WaitOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let start = Instant::now();
        let mut polls: u32 = 0;
        loop {
            polls += 1;
            if let Some(value) = check().await? {
                debug!(what, polls, elapsed_secs = start.elapsed().as_secs(), "Wait satisfied");
                return Ok(WaitOutcome::Reached(value));
            }

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                debug!(what, polls, elapsed_secs = elapsed.as_secs(), "Wait timed out");
                return Ok(WaitOutcome::TimedOut { elapsed });
            }

            let nap = self.interval.min(deadline - elapsed);
            debug!(what, polls, next_poll_secs = nap.as_secs(), "Still waiting");
            tokio::time::sleep(nap).await;
        }
    }
}
