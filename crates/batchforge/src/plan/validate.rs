// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation plan: read-only checks that the subscription can host the
//! configured image build and pool. Nothing is created, except that missing
//! resource providers are registered when auto-registration is enabled.

use async_trait::async_trait;
use serde_json::Value;

use super::preflight::{PreflightCli, PreflightLogin};
use super::{Precondition, ProvisioningPlan, ProvisioningStep, StepAction, StepContext, VmSkuInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::CloudCommand;
use crate::log::Level;

/// Providers every plan needs.
pub const REQUIRED_PROVIDERS: [&str; 2] = ["Microsoft.Compute", "Microsoft.Batch"];
/// Provider needed when a container image is built.
pub const REGISTRY_PROVIDER: &str = "Microsoft.ContainerRegistry";

/// Quota families of known GPU series, keyed by series letters and the
/// suffix that follows the vCPU count in the size name.
const GPU_FAMILIES: &[(&str, &str, &str)] = &[
    ("NC", "as_T4_v3", "standardNCASv3_T4Family"),
    ("NC", "s_v3", "standardNCSv3Family"),
    ("NC", "s_v2", "standardNCSv2Family"),
    ("NC", "ads_A100_v4", "StandardNCADSA100v4Family"),
    ("NC", "ads_H100_v5", "standardNCadsH100v5Family"),
    ("ND", "asr_v4", "standardNDASv4_A100Family"),
    ("ND", "s_v2", "standardNDSv2Family"),
    ("NV", "s_v3", "standardNVSv3Family"),
    ("NV", "as_v4", "standardNVASv4Family"),
    ("NV", "ads_A10_v5", "StandardNVADSA10v5Family"),
];

/// Build the validation plan for `config`.
pub fn validate_plan(config: &Config) -> ProvisioningPlan {
    let t = &config.timeouts;

    ProvisioningPlan::new("validate")
        .step(ProvisioningStep::new("preflight-cli", t.command, PreflightCli))
        .step(ProvisioningStep::new("preflight-login", t.command, PreflightLogin))
        .step(ProvisioningStep::new(
            "provider-registration",
            t.command + t.provider_registration,
            ProviderRegistration,
        ))
        .step(ProvisioningStep::new("vm-size-availability", t.command, VmSizeAvailability))
        .step_if(config.gpu, || {
            ProvisioningStep::new("gpu-quota", t.command, GpuQuota)
        })
}

/// Split a size name into series letters, vCPU count and suffix:
/// "Standard_NC4as_T4_v3" → ("NC", 4, "as_T4_v3").
pub fn parse_vm_size(size: &str) -> Option<(&str, u32, &str)> {
    let name = size
        .strip_prefix("Standard_")
        .or_else(|| size.strip_prefix("standard_"))
        .unwrap_or(size);
    let digits_at = name.find(|c: char| c.is_ascii_digit())?;
    let series = &name[..digits_at];
    let rest = &name[digits_at..];
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let vcpus = rest[..digits_end].parse().ok()?;
    if series.is_empty() {
        return None;
    }
    Some((series, vcpus, &rest[digits_end..]))
}

/// Quota family of a known GPU size.
pub fn gpu_quota_family(size: &str) -> Option<&'static str> {
    let (series, _, suffix) = parse_vm_size(size)?;
    GPU_FAMILIES
        .iter()
        .find(|(s, x, _)| s.eq_ignore_ascii_case(series) && x.eq_ignore_ascii_case(suffix))
        .map(|(_, _, family)| *family)
}

/// Resource providers are registered (registering them if allowed).
pub struct ProviderRegistration;

fn providers(config: &Config) -> Vec<&'static str> {
    let mut providers = REQUIRED_PROVIDERS.to_vec();
    if config.container.is_some() {
        providers.push(REGISTRY_PROVIDER);
    }
    providers
}

async fn registration_state(cx: &StepContext<'_>, namespace: &str) -> Result<String> {
    let command = CloudCommand::new(
        format!("Read registration of provider {}", namespace),
        ["provider", "show"],
    )
    .opt("--namespace", namespace)
    .json();
    let provider = cx.run_json(&command).await?;
    Ok(provider
        .get("registrationState")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string())
}

#[async_trait]
impl StepAction for ProviderRegistration {
    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        for namespace in providers(config) {
            let state = registration_state(cx, namespace).await?;
            if state.eq_ignore_ascii_case("Registered") {
                continue;
            }
            if !config.auto_register_providers {
                return Err(Error::Precondition(format!(
                    "resource provider {} is {} (run 'az provider register --namespace {}')",
                    namespace, state, namespace
                )));
            }

            cx.note(
                Level::Warn,
                format!("Provider {} is {}, registering", namespace, state),
            );
            let command = CloudCommand::new(
                format!("Register provider {}", namespace),
                ["provider", "register"],
            )
            .opt("--namespace", namespace);
            cx.run(&command).await?;

            let shared: &StepContext<'_> = cx;
            let what = format!("provider {} to register", namespace);
            let outcome = shared
                .waiter
                .wait_until(&what, config.timeouts.provider_registration, move || async move {
                    let state = registration_state(shared, namespace).await?;
                    Ok(state.eq_ignore_ascii_case("Registered").then_some(()))
                })
                .await?;
            outcome.or_timeout(what)?;
        }
        Ok(())
    }
}

/// The configured VM size is offered, unrestricted, in the region.
pub struct VmSizeAvailability;

#[async_trait]
impl StepAction for VmSizeAvailability {
    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let command = CloudCommand::new(
            format!("List SKUs of {} in {}", config.vm_size, config.region),
            ["vm", "list-skus"],
        )
        .opt("--location", &config.region)
        .opt("--size", &config.vm_size)
        .opt("--resource-type", "virtualMachines")
        .json();
        let skus = cx.run_json(&command).await?;

        let sku = skus
            .as_array()
            .into_iter()
            .flatten()
            .find(|s| {
                s.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|n| n.eq_ignore_ascii_case(&config.vm_size))
            })
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "VM size {} is not offered in {}",
                    config.vm_size, config.region
                ))
            })?;

        if let Some(restriction) = sku
            .get("restrictions")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
        {
            let reason = restriction
                .get("reasonCode")
                .and_then(Value::as_str)
                .unwrap_or("restricted");
            return Err(Error::Precondition(format!(
                "VM size {} is restricted in {} ({})",
                config.vm_size, config.region, reason
            )));
        }

        let vcpus = sku
            .get("capabilities")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|c| c.get("name").and_then(Value::as_str) == Some("vCPUs"))
            .and_then(|c| c.get("value").and_then(Value::as_str))
            .and_then(|v| v.parse().ok());
        let family = sku
            .get("family")
            .and_then(Value::as_str)
            .map(str::to_string);

        cx.note(
            Level::Info,
            format!("VM size {} is available in {}", config.vm_size, config.region),
        );
        cx.state.vm_sku = Some(VmSkuInfo {
            name: config.vm_size.clone(),
            family,
            vcpus,
        });
        Ok(())
    }
}

/// Enough GPU vCPU quota remains for the build VM or the pool, whichever
/// needs more.
pub struct GpuQuota;

fn as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl StepAction for GpuQuota {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        Ok(match gpu_quota_family(&cx.config.vm_size) {
            Some(_) => Precondition::Run,
            None => {
                cx.note(
                    Level::Warn,
                    format!(
                        "No known quota family for {}; skipping GPU quota check",
                        cx.config.vm_size
                    ),
                );
                Precondition::skip(format!("unknown GPU family for {}", cx.config.vm_size))
            }
        })
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let Some(family) = gpu_quota_family(&config.vm_size) else {
            return Ok(());
        };
        let per_vm = cx
            .state
            .vm_sku
            .as_ref()
            .and_then(|s| s.vcpus)
            .or_else(|| parse_vm_size(&config.vm_size).map(|(_, v, _)| v))
            .unwrap_or(0);
        let required = u64::from(per_vm) * u64::from(config.node_count.max(1));

        let command = CloudCommand::new(
            format!("List compute usage in {}", config.region),
            ["vm", "list-usage"],
        )
        .opt("--location", &config.region)
        .json();
        let usage = cx.run_json(&command).await?;

        let entry = usage.as_array().into_iter().flatten().find(|u| {
            u.get("name")
                .and_then(|n| n.get("value"))
                .and_then(Value::as_str)
                .is_some_and(|v| v.eq_ignore_ascii_case(family))
        });
        let (used, limit) = match entry {
            Some(e) => (
                as_u64(e.get("currentValue")).unwrap_or(0),
                as_u64(e.get("limit")).unwrap_or(0),
            ),
            None => (0, 0),
        };
        let available = limit.saturating_sub(used);

        if available < required {
            return Err(Error::Precondition(format!(
                "insufficient {} quota in {}: need {} vCPUs, {} available (limit {}, in use {})",
                family, config.region, required, available, limit, used
            )));
        }
        cx.note(
            Level::Info,
            format!(
                "GPU quota {}: {} of {} vCPUs available, {} required",
                family, available, limit, required
            ),
        );
        Ok(())
    }
}
