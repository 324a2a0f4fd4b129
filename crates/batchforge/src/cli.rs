// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command line interface.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{Config, OsFamily, Overrides};
use crate::plan::{ProvisioningPlan, image_plan, pool_plan, validate_plan};

/// What the invocation provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Image plan, then pool plan
    Full,
    /// Image plan only; writes image_metadata.json
    ImageOnly,
    /// Pool plan only; reads image_metadata.json or --image-id
    PoolOnly,
    /// Read-only checks of providers, VM size and GPU quota
    ValidateOnly,
    /// Print the validation, image and pool plans and the rendered pool
    /// document without calling the cloud
    DryRun,
}

impl Mode {
    /// Plans this mode runs, in order. Dry-run returns the validation checks
    /// followed by the plans a full run would execute.
    pub fn plans(&self, config: &Config) -> Vec<ProvisioningPlan> {
        match self {
            Self::Full => vec![image_plan(config), pool_plan(config)],
            Self::DryRun => vec![validate_plan(config), image_plan(config), pool_plan(config)],
            Self::ImageOnly => vec![image_plan(config)],
            Self::PoolOnly => vec![pool_plan(config)],
            Self::ValidateOnly => vec![validate_plan(config)],
        }
    }
}

/// Provision a VM image and a Batch pool that boots from it.
#[derive(Debug, Parser)]
#[command(name = "batchforge", version, long_about = None)]
pub struct Cli {
    /// Plan selection
    #[arg(long, value_enum, default_value_t = Mode::Full)]
    pub mode: Mode,

    /// Pool identifier
    #[arg(long)]
    pub pool_id: Option<String>,

    /// VM size for the build VM and pool nodes
    #[arg(long)]
    pub vm_size: Option<String>,

    /// Dedicated node count
    #[arg(long)]
    pub node_count: Option<u32>,

    /// Gallery image version resource id (pool stage without image_metadata.json)
    #[arg(long)]
    pub image_id: Option<String>,

    /// Build a GPU image and pool
    #[arg(long, conflicts_with = "cpu")]
    pub gpu: bool,

    /// Build a CPU-only image and pool
    #[arg(long)]
    pub cpu: bool,

    /// Base OS family
    #[arg(long, value_parser = parse_os)]
    pub os: Option<OsFamily>,

    /// Base OS version, e.g. 22.04 or 9
    #[arg(long)]
    pub os_version: Option<String>,

    /// Resource group
    #[arg(long)]
    pub resource_group: Option<String>,

    /// Azure region
    #[arg(long)]
    pub region: Option<String>,

    /// Directory for metadata files and the execution log
    #[arg(long, env = "BATCHFORGE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Do not register missing resource providers during validation
    #[arg(long)]
    pub no_auto_register: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_os(value: &str) -> Result<OsFamily, String> {
    value.parse().map_err(|e: crate::config::ConfigError| e.to_string())
}

impl Cli {
    /// Configuration overrides carried by the flags.
    pub fn overrides(&self) -> Overrides {
        let gpu = match (self.gpu, self.cpu) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        Overrides {
            resource_group: self.resource_group.clone(),
            region: self.region.clone(),
            os_family: self.os,
            os_version: self.os_version.clone(),
            gpu,
            vm_size: self.vm_size.clone(),
            pool_id: self.pool_id.clone(),
            node_count: self.node_count,
            image_id: self.image_id.clone(),
            auto_register_providers: self.no_auto_register.then_some(false),
            state_dir: self.state_dir.clone(),
        }
    }
}
