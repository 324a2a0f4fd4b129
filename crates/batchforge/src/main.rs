// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! batchforge - VM image and Batch pool provisioning CLI
//!
//! Resolves configuration, selects the plans for `--mode` and runs them
//! through the Azure CLI, one step at a time.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use uuid::Uuid;

use batchforge::cli::{Cli, Mode};
use batchforge::config::{Config, ConfigBuilder};
use batchforge::error::EXIT_PRECONDITION;
use batchforge::metadata::ExecutionMetadata;
use batchforge::plan::RunState;
use batchforge::pool_spec::PoolSpecification;
use batchforge::start_task::StartTaskBuilder;
use batchforge::{AzCliExecutor, ExecutionLog, OrchestrationDriver};

const DRY_RUN_IMAGE_ID: &str = "<image-id-from-image-stage>";

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "batchforge=debug"
    } else {
        "batchforge=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = match ConfigBuilder::from_env().and_then(|b| b.apply(cli.overrides()).build()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_PRECONDITION);
        }
    };

    if cli.mode == Mode::DryRun {
        return match dry_run(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::from(e.downcast_ref::<batchforge::Error>().map_or(1, |e| e.exit_code()))
            }
        };
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cli.mode, config))
}

async fn run(mode: Mode, config: Config) -> ExitCode {
    let log = match ExecutionLog::create(&config.state_dir) {
        Ok(log) => log,
        Err(e) => {
            warn!(
                state_dir = %config.state_dir.display(),
                "Cannot create execution log file, logging to console only: {}", e
            );
            ExecutionLog::console_only()
        }
    };

    info!(
        run_id = %log.run_id(),
        mode = ?mode,
        resource_group = %config.resource_group,
        region = %config.region,
        os = %config.os,
        gpu = config.gpu,
        vm_size = %config.vm_size,
        "Starting batchforge"
    );
    if let Some(path) = log.path() {
        info!(path = %path.display(), "Execution log");
    }

    let config = Arc::new(config);
    let executor = Arc::new(AzCliExecutor::new(
        config.az_binary.clone(),
        config.timeouts.command,
        log.clone(),
    ));
    let driver = OrchestrationDriver::new(config.clone(), executor, log);
    let plans = mode.plans(&config);
    let mut state = RunState::new();

    match driver.run_all(&plans, &mut state).await {
        Ok(report) => {
            println!("{}", report.summary());
            if let Some(metadata) = &state.image_metadata {
                info!(image_id = %metadata.image_id, "Image ready");
            }
            if state.pool_spec.is_some() {
                info!(pool_id = %config.pool_id, "Pool ready");
            }
            info!("batchforge finished");
            ExitCode::SUCCESS
        }
        Err(failure) => {
            println!("{}", failure.report.summary());
            error!(
                plan = failure.plan,
                step = failure.step,
                "{}",
                failure.error
            );
            ExitCode::from(failure.exit_code())
        }
    }
}

/// Print the validation checks and what a full run would do, without calling
/// the cloud.
fn dry_run(config: &Config) -> anyhow::Result<()> {
    for plan in Mode::DryRun.plans(config) {
        println!("{} plan:", plan.name());
        for (i, step) in plan.steps().iter().enumerate() {
            println!(
                "  {:>2}. {:<24} timeout {}s{}",
                i + 1,
                step.name(),
                step.timeout().as_secs(),
                if step.is_retryable() { ", retryable" } else { "" }
            );
        }
    }

    let start_task = StartTaskBuilder::for_config(config)
        .build()
        .map_err(batchforge::Error::from)?;
    println!("\nstart task fragments: {}", start_task.labels().join(", "));

    let image_id = config
        .image_id_override
        .clone()
        .unwrap_or_else(|| DRY_RUN_IMAGE_ID.to_string());
    let metadata = ExecutionMetadata::for_image(config, image_id, Uuid::nil());
    let spec = PoolSpecification::render(config, &metadata, &start_task);
    println!("\npool specification:\n{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}
