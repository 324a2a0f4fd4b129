// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command execution backends.
//!
//! Every interaction with the cloud provider goes through a
//! [`CommandExecutor`]. Executors never fail: a command that cannot be
//! spawned, exits non-zero or exceeds its timeout yields an unsuccessful
//! [`CommandOutcome`] and the caller decides whether that is fatal.

pub mod az;
mod command;
pub mod mock;
mod traits;

pub use az::AzCliExecutor;
pub use command::CloudCommand;
pub use mock::MockExecutor;
pub use traits::*;
