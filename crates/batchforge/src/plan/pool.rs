// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool plan: image hand-off → Batch account → pool.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::preflight::{PreflightCli, PreflightLogin};
use super::{
    EnsureResource, Precondition, ProvisioningPlan, ProvisioningStep, StepAction, StepContext,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::CloudCommand;
use crate::log::Level;
use crate::metadata::{ExecutionMetadata, PoolMetadata, write_json};
use crate::pool_spec::PoolSpecification;
use crate::probe::{Probed, ResourceHandle, ResourceRef};
use crate::start_task::StartTaskBuilder;

/// Build the pool plan for `config`.
pub fn pool_plan(config: &Config) -> ProvisioningPlan {
    let t = &config.timeouts;

    ProvisioningPlan::new("pool")
        .step(ProvisioningStep::new("preflight-cli", t.command, PreflightCli))
        .step(ProvisioningStep::new("preflight-login", t.command, PreflightLogin))
        .step(ProvisioningStep::new("load-image-metadata", t.command, LoadImageMetadata))
        .step(ProvisioningStep::new("batch-account", t.command, batch_account()).retryable())
        .step(ProvisioningStep::new("batch-login", t.command, BatchLogin).retryable())
        .step(ProvisioningStep::new("render-pool-spec", t.command, RenderPoolSpec))
        .step(ProvisioningStep::new("pool", t.command + t.pool_ready, Pool))
        .step(ProvisioningStep::new("save-pool-metadata", t.command, SavePoolMetadata))
}

fn account_name<'a>(config: &'a Config, metadata: Option<&'a ExecutionMetadata>) -> &'a str {
    metadata
        .map(|m| m.batch_account.as_str())
        .unwrap_or(&config.batch_account)
}

fn pool_ref(cx: &StepContext<'_>) -> ResourceRef {
    ResourceRef::Pool {
        account: cx.batch_account().to_string(),
        id: cx.config.pool_id.clone(),
    }
}

/// Resolve the image to boot: this run's image, `--image-id`, or the
/// persisted hand-off record.
pub struct LoadImageMetadata;

#[async_trait]
impl StepAction for LoadImageMetadata {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        Ok(match &cx.state.image_metadata {
            Some(m) => Precondition::skip(format!("using image {} built in this run", m.image_id)),
            None => Precondition::Run,
        })
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let metadata = match &config.image_id_override {
            Some(image_id) => {
                cx.note(Level::Info, format!("Using image id from command line: {}", image_id));
                ExecutionMetadata::for_image(config, image_id.clone(), cx.log.run_id())
            }
            None => {
                let path = config.image_metadata_path();
                let metadata = ExecutionMetadata::load(&path).await?;
                cx.note(
                    Level::Info,
                    format!("Loaded image {} from {}", metadata.image_id, path.display()),
                );
                metadata
            }
        };

        if metadata.gpu.is_some_and(|gpu| gpu != config.gpu) {
            cx.note(
                Level::Warn,
                format!(
                    "Image {} was built with gpu={} but the pool is configured with gpu={}",
                    metadata.image_id,
                    !config.gpu,
                    config.gpu
                ),
            );
        }
        if metadata.node_agent_sku_id != config.os.node_agent_sku_id() {
            cx.note(
                Level::Warn,
                format!(
                    "Image node agent {} differs from configured OS {}",
                    metadata.node_agent_sku_id, config.os
                ),
            );
        }

        cx.state.image_metadata = Some(metadata);
        Ok(())
    }
}

fn batch_account() -> EnsureResource {
    EnsureResource::new(
        |config, state| ResourceRef::BatchAccount {
            resource_group: config.resource_group.clone(),
            name: account_name(config, state.image_metadata.as_ref()).to_string(),
        },
        |config, state| {
            let name = account_name(config, state.image_metadata.as_ref());
            CloudCommand::new(format!("Create Batch account {}", name), ["batch", "account", "create"])
                .opt("--resource-group", &config.resource_group)
                .opt("--name", name)
                .opt("--location", &config.region)
                .json()
        },
    )
}

/// `az batch account login`: point pool commands at the account.
pub struct BatchLogin;

#[async_trait]
impl StepAction for BatchLogin {
    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let account = cx.batch_account();
        let command = CloudCommand::new(
            format!("Log in to Batch account {}", account),
            ["batch", "account", "login"],
        )
        .opt("--resource-group", &cx.config.resource_group)
        .opt("--name", account);
        cx.run(&command).await?;
        Ok(())
    }
}

/// Build the start task and pool document and write `pool-config.json`.
pub struct RenderPoolSpec;

#[async_trait]
impl StepAction for RenderPoolSpec {
    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let metadata = cx.state.image_metadata.as_ref().ok_or_else(|| {
            Error::MissingPrerequisite("image metadata has not been loaded".into())
        })?;
        let start_task = StartTaskBuilder::for_config(config).build()?;
        let spec = PoolSpecification::render(config, metadata, &start_task);

        let path = config.pool_spec_path();
        write_json(&path, &spec).await?;
        cx.note(
            Level::Info,
            format!(
                "Pool specification written to {} (start task: {})",
                path.display(),
                start_task.labels().join(", ")
            ),
        );
        cx.state.pool_spec = Some(spec);
        Ok(())
    }
}

/// Batch pool from the rendered specification; waits for steady allocation.
pub struct Pool;

#[async_trait]
impl StepAction for Pool {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        let pool = pool_ref(cx);
        let handle = match cx.describe(&pool).await? {
            Probed::Found(handle) => handle,
            Probed::NotFound => return Ok(Precondition::Run),
        };
        ensure_no_resize_errors(&pool, &handle)?;

        if let Some(vm_size) = handle.details.get("vmSize").and_then(Value::as_str) {
            if !vm_size.eq_ignore_ascii_case(&cx.config.vm_size) {
                cx.note(
                    Level::Warn,
                    format!(
                        "Existing pool {} uses {} (configured {}); pools are not updated in place",
                        pool, vm_size, cx.config.vm_size
                    ),
                );
            }
        }

        Ok(if is_steady(&handle) {
            Precondition::skip(format!("pool {} already exists", pool))
        } else {
            Precondition::in_progress(format!("pool {} exists, waiting for allocation", pool))
        })
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let pool = pool_ref(cx);
        let path = cx.config.pool_spec_path();
        let command = CloudCommand::new(format!("Create pool {}", pool), ["batch", "pool", "create"])
            .opt("--account-name", cx.batch_account())
            .opt("--json-file", path.display().to_string());
        cx.run(&command).await?;
        Ok(())
    }

    async fn verify(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let pool = pool_ref(cx);
        let resource = &pool;
        let probe = cx.probe;
        let what = format!("pool {} to reach steady allocation", pool);
        let outcome = cx
            .waiter
            .wait_until(&what, cx.config.timeouts.pool_ready, move || async move {
                match probe.describe(resource).await? {
                    Probed::Found(handle) => {
                        ensure_no_resize_errors(resource, &handle)?;
                        Ok(is_steady(&handle).then_some(handle))
                    }
                    Probed::NotFound => Ok(None),
                }
            })
            .await?;
        let handle = outcome.or_timeout(what)?;
        cx.state.record(handle);
        Ok(())
    }
}

fn is_steady(handle: &ResourceHandle) -> bool {
    handle
        .state
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("steady"))
}

fn ensure_no_resize_errors(pool: &ResourceRef, handle: &ResourceHandle) -> Result<()> {
    let errors = handle
        .details
        .get("resizeErrors")
        .and_then(Value::as_array)
        .filter(|e| !e.is_empty());
    let Some(errors) = errors else {
        return Ok(());
    };
    let summary = errors
        .iter()
        .map(|e| {
            let code = e.get("code").and_then(Value::as_str).unwrap_or("Unknown");
            match e.get("message").and_then(Value::as_str) {
                Some(message) => format!("{}: {}", code, message),
                None => code.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("; ");
    Err(Error::FailedState {
        resource: format!("{} {}", pool.kind(), pool),
        state: format!("resize error ({})", summary),
    })
}

/// Persist the pool record for job-submission callers.
pub struct SavePoolMetadata;

#[async_trait]
impl StepAction for SavePoolMetadata {
    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let metadata = cx.state.image_metadata.as_ref().ok_or_else(|| {
            Error::MissingPrerequisite("image metadata has not been loaded".into())
        })?;
        let record = PoolMetadata {
            pool_id: config.pool_id.clone(),
            batch_account: cx.batch_account().to_string(),
            resource_group: config.resource_group.clone(),
            region: config.region.clone(),
            vm_size: config.vm_size.clone(),
            node_count: config.node_count,
            image_id: metadata.image_id.clone(),
            node_agent_sku_id: metadata.node_agent_sku_id.clone(),
            gpu: config.gpu,
            run_id: cx.log.run_id(),
            created_at: Utc::now(),
        };
        let path = config.pool_metadata_path();
        record.save(&path).await?;
        cx.note(Level::Info, format!("Pool metadata written to {}", path.display()));
        Ok(())
    }
}
