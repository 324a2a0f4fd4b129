// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! batchforge - VM image and Batch pool provisioning
//!
//! This crate drives the Azure CLI to build a reusable VM image (optionally
//! with the NVIDIA driver and a preloaded worker container) into a shared
//! image gallery, and to create a Batch pool that boots from that image.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  CLI (--mode, overrides)  →  Config (defaults + env + overrides) │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     OrchestrationDriver                          │
//! │   ProvisioningPlan: image │ pool │ validate                      │
//! │   step: precondition → run → verify   (fail fast, no rollback)   │
//! └──────────────────────────────────────────────────────────────────┘
//!          │                     │                     │
//!          ▼                     ▼                     ▼
//! ┌────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │ ResourceProbe  │   │  PollingWaiter   │   │  ExecutionLog    │
//! │ (exists/state) │   │ (fixed interval) │   │ (append-only)    │
//! └────────────────┘   └──────────────────┘   └──────────────────┘
//!          │
//!          ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │          CommandExecutor: AzCliExecutor │ MockExecutor           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modes
//!
//! | Mode | Plans |
//! |------|-------|
//! | `full` | image, then pool (sharing in-memory state) |
//! | `image-only` | image; writes `image_metadata.json` |
//! | `pool-only` | pool; reads `image_metadata.json` or `--image-id` |
//! | `validate-only` | provider registration, VM size, GPU quota |
//! | `dry-run` | prints the plan and pool document, runs nothing |
//!
//! # Idempotence
//!
//! Every create step probes its target first and is skipped when the
//! resource already exists, so re-running after a partial failure resumes
//! where the previous run stopped. Concurrent invocations against the same
//! resource names are not safe and must be serialized by the caller.
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | A step failed or timed out |
//! | 2 | Precondition, validation or configuration failure |
//! | 3 | Image metadata hand-off missing or invalid |

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod log;
pub mod metadata;
pub mod plan;
pub mod pool_spec;
pub mod probe;
pub mod start_task;
pub mod waiter;

pub use config::Config;
pub use driver::{OrchestrationDriver, PlanFailure, RunReport, StepState};
pub use error::{Error, Result};
pub use executor::{AzCliExecutor, CloudCommand, CommandExecutor, CommandOutcome, MockExecutor};
pub use log::ExecutionLog;
pub use metadata::{ExecutionMetadata, HandoffError, PoolMetadata};
pub use plan::{ProvisioningPlan, RunState};
pub use probe::{ResourceHandle, ResourceKind, ResourceProbe, ResourceRef};
pub use waiter::{PollingWaiter, WaitOutcome};
