// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image plan: build VM → driver → container preload → capture into gallery.
//!
//! The VM stage (build VM through generalize) is skipped entirely once the
//! target image version is published, so a second run never touches a VM
//! that has already been captured.

use async_trait::async_trait;
use serde_json::Value;

use super::preflight::{PreflightCli, PreflightLogin};
use super::{
    EnsureResource, Precondition, ProvisioningPlan, ProvisioningStep, StepAction, StepContext,
    ensure_not_failed, image_version_ref, wait_for_provisioning,
};
use crate::config::{Config, ContainerBuild};
use crate::error::{Error, Result};
use crate::executor::CloudCommand;
use crate::log::Level;
use crate::metadata::ExecutionMetadata;
use crate::probe::{Probed, ResourceKind, ResourceRef};
use crate::start_task::{StartTaskBuilder, shell_quote};

/// Name of the GPU driver VM extension.
pub const GPU_DRIVER_EXTENSION: &str = "NvidiaGpuDriverLinux";
/// Publisher of the GPU driver VM extension.
pub const GPU_DRIVER_PUBLISHER: &str = "Microsoft.HpcCompute";

const PRELOAD_MARKER: &str = "batchforge-preload-ok";

/// Build the image plan for `config`.
pub fn image_plan(config: &Config) -> ProvisioningPlan {
    let t = &config.timeouts;
    let container = config.container.is_some();

    ProvisioningPlan::new("image")
        .step(ProvisioningStep::new("preflight-cli", t.command, PreflightCli))
        .step(ProvisioningStep::new("preflight-login", t.command, PreflightLogin))
        .step(ProvisioningStep::new("resource-group", t.command, resource_group()).retryable())
        .step(ProvisioningStep::new("build-vm", t.command + t.vm_ready, BuildVm))
        .step_if(config.gpu, || {
            ProvisioningStep::new("gpu-driver", t.command + t.driver_install, GpuDriver)
        })
        .step_if(container, || {
            ProvisioningStep::new("container-registry", t.command, ContainerRegistry).retryable()
        })
        .step_if(container, || {
            ProvisioningStep::new("container-image", t.command, ContainerImage).retryable()
        })
        .step_if(container, || {
            ProvisioningStep::new("preload-container-image", t.command * 2, PreloadContainerImage)
                .retryable()
        })
        .step(ProvisioningStep::new("deallocate-vm", t.command + t.vm_ready, DeallocateVm))
        .step(ProvisioningStep::new("generalize-vm", t.command + t.vm_ready, GeneralizeVm))
        .step(ProvisioningStep::new("gallery", t.command, gallery()).retryable())
        .step(ProvisioningStep::new("image-definition", t.command, image_definition()).retryable())
        .step(ProvisioningStep::new("image-version", t.command + t.image_version, ImageVersion))
        .step(ProvisioningStep::new("save-image-metadata", t.command, SaveImageMetadata))
}

fn vm_ref(config: &Config) -> ResourceRef {
    ResourceRef::Vm {
        resource_group: config.resource_group.clone(),
        name: config.vm_name.clone(),
    }
}

fn already_captured() -> Precondition {
    Precondition::skip("image version already published")
}

fn resource_group() -> EnsureResource {
    EnsureResource::new(
        |config, _| ResourceRef::ResourceGroup {
            name: config.resource_group.clone(),
        },
        |config, _| {
            CloudCommand::new(
                format!("Create resource group {}", config.resource_group),
                ["group", "create"],
            )
            .opt("--name", &config.resource_group)
            .opt("--location", &config.region)
            .json()
        },
    )
}

/// Build VM from the marketplace image; waits until it is running.
pub struct BuildVm;

#[async_trait]
impl StepAction for BuildVm {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        if cx.image_published().await? {
            return Ok(already_captured());
        }
        let vm = vm_ref(cx.config);
        match cx.describe(&vm).await? {
            Probed::Found(handle) => {
                ensure_not_failed(&vm, &handle)?;
                Ok(Precondition::skip(format!("VM {} already exists", vm)))
            }
            Probed::NotFound => Ok(Precondition::Run),
        }
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let command = CloudCommand::new(format!("Create build VM {}", config.vm_name), ["vm", "create"])
            .opt("--resource-group", &config.resource_group)
            .opt("--name", &config.vm_name)
            .opt("--location", &config.region)
            .opt("--image", config.os.marketplace_urn())
            .opt("--size", &config.vm_size)
            .opt("--admin-username", &config.admin_username)
            .arg("--generate-ssh-keys")
            .opt("--public-ip-sku", "Standard")
            .json();
        cx.run(&command).await?;
        // Refresh the handle so later steps see the ARM id.
        cx.describe(&vm_ref(config)).await?;
        Ok(())
    }

    async fn verify(&self, cx: &mut StepContext<'_>) -> Result<()> {
        wait_for_power_state(cx, "running").await
    }
}

async fn wait_for_power_state(cx: &StepContext<'_>, state: &str) -> Result<()> {
    let config = cx.config;
    let probe = cx.probe;
    let (rg, vm) = (config.resource_group.as_str(), config.vm_name.as_str());
    let what = format!("VM {} to be {}", vm, state);
    let outcome = cx
        .waiter
        .wait_until(&what, config.timeouts.vm_ready, move || async move {
            let view = probe.vm_instance_view(rg, vm).await?;
            Ok(view.is_power_state(state).then_some(()))
        })
        .await?;
    outcome.or_timeout(what)
}

/// NVIDIA driver extension on the build VM.
pub struct GpuDriver;

fn driver_ref(config: &Config) -> ResourceRef {
    ResourceRef::VmExtension {
        resource_group: config.resource_group.clone(),
        vm: config.vm_name.clone(),
        name: GPU_DRIVER_EXTENSION.to_string(),
    }
}

#[async_trait]
impl StepAction for GpuDriver {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        if cx.image_published().await? {
            return Ok(already_captured());
        }
        let extension = driver_ref(cx.config);
        match cx.describe(&extension).await? {
            Probed::Found(handle) if handle.is_succeeded() => {
                Ok(Precondition::skip("GPU driver extension already installed"))
            }
            Probed::Found(handle) if handle.is_transitioning() => {
                Ok(Precondition::in_progress("GPU driver installation already in progress"))
            }
            Probed::Found(handle) => {
                ensure_not_failed(&extension, &handle)?;
                Ok(Precondition::Run)
            }
            Probed::NotFound => Ok(Precondition::Run),
        }
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let command = CloudCommand::new(
            format!("Install GPU driver extension on {}", config.vm_name),
            ["vm", "extension", "set"],
        )
        .opt("--resource-group", &config.resource_group)
        .opt("--vm-name", &config.vm_name)
        .opt("--name", GPU_DRIVER_EXTENSION)
        .opt("--publisher", GPU_DRIVER_PUBLISHER)
        .arg("--no-wait");
        cx.run(&command).await?;
        Ok(())
    }

    async fn verify(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let extension = driver_ref(cx.config);
        let deadline = cx.config.timeouts.driver_install;
        let handle = wait_for_provisioning(cx, &extension, deadline).await?;
        cx.state.record(handle);
        Ok(())
    }
}

/// Container registry for the worker image.
pub struct ContainerRegistry;

#[async_trait]
impl StepAction for ContainerRegistry {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        if cx.image_published().await? {
            return Ok(already_captured());
        }
        registry().precondition(cx).await
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        registry().run(cx).await
    }

    async fn verify(&self, cx: &mut StepContext<'_>) -> Result<()> {
        registry().verify(cx).await
    }
}

fn registry() -> EnsureResource {
    EnsureResource::new(
        |config, _| ResourceRef::Registry {
            resource_group: config.resource_group.clone(),
            name: config
                .container
                .as_ref()
                .map(|c| c.registry.clone())
                .unwrap_or_default(),
        },
        |config, _| {
            let name = config
                .container
                .as_ref()
                .map(|c| c.registry.as_str())
                .unwrap_or_default();
            CloudCommand::new(format!("Create container registry {}", name), ["acr", "create"])
                .opt("--resource-group", &config.resource_group)
                .opt("--name", name)
                .opt("--location", &config.region)
                .opt("--sku", "Basic")
                .json()
        },
    )
}

fn container_settings(config: &Config) -> Result<&ContainerBuild> {
    config
        .container
        .as_ref()
        .ok_or_else(|| Error::MissingPrerequisite("container build is not configured".into()))
}

/// `az acr build` of the worker image; skipped when the tag exists.
pub struct ContainerImage;

#[async_trait]
impl StepAction for ContainerImage {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        if cx.image_published().await? {
            return Ok(already_captured());
        }
        let container = container_settings(cx.config)?;
        let image = ResourceRef::ContainerImage {
            registry: container.registry.clone(),
            repository: container.repository().to_string(),
            tag: container.tag().to_string(),
        };
        Ok(match cx.describe(&image).await? {
            Probed::Found(_) => {
                Precondition::skip(format!("{} already pushed", container.image_ref()))
            }
            Probed::NotFound => Precondition::Run,
        })
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let container = container_settings(cx.config)?;
        let command = CloudCommand::new(
            format!("Build container image {}", container.image_ref()),
            ["acr", "build"],
        )
        .opt("--registry", &container.registry)
        .opt("--image", &container.image)
        .opt("--file", &container.dockerfile)
        .arg(container.context.display().to_string());
        cx.run(&command).await?;
        Ok(())
    }
}

/// Pull the worker image onto the build VM so it ships inside the image.
pub struct PreloadContainerImage;

#[async_trait]
impl StepAction for PreloadContainerImage {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        if cx.image_published().await? {
            return Ok(already_captured());
        }
        Ok(Precondition::Run)
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let container = container_settings(config)?;

        let credentials = cx
            .run_json(
                &CloudCommand::new(
                    format!("Read credentials of registry {}", container.registry),
                    ["acr", "credential", "show"],
                )
                .opt("--name", &container.registry)
                .json(),
            )
            .await?;
        let username = credentials.get("username").and_then(Value::as_str);
        let password = credentials
            .get("passwords")
            .and_then(Value::as_array)
            .and_then(|p| p.first())
            .and_then(|p| p.get("value"))
            .and_then(Value::as_str);
        let (Some(username), Some(password)) = (username, password) else {
            return Err(Error::MissingPrerequisite(format!(
                "registry {} returned no admin credentials; enable the admin user",
                container.registry
            )));
        };

        let script = StartTaskBuilder::new()
            .container_runtime(&config.os)
            .step(
                "registry-login",
                format!(
                    "printf '%s' {} | docker login {} --username {} --password-stdin",
                    shell_quote(password),
                    container.login_server(),
                    shell_quote(username)
                ),
            )
            .step("pull", format!("docker pull {}", container.image_ref()))
            .step("marker", format!("echo {}", PRELOAD_MARKER))
            .build()?;

        let command = CloudCommand::new(
            format!("Preload {} on {}", container.image_ref(), config.vm_name),
            ["vm", "run-command", "invoke"],
        )
        .opt("--resource-group", &config.resource_group)
        .opt("--name", &config.vm_name)
        .opt("--command-id", "RunShellScript")
        .secret_opt("--scripts", script.script())
        .json();
        let result = cx.run_json(&command).await?;

        // run-command reports success even when the script fails; the
        // script's own output carries the verdict.
        let message = result
            .get("value")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|v| v.get("message").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        if !message.contains(PRELOAD_MARKER) {
            return Err(Error::command(command.description(), message));
        }
        Ok(())
    }
}

/// Stop and deallocate the build VM before capture.
pub struct DeallocateVm;

#[async_trait]
impl StepAction for DeallocateVm {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        if cx.image_published().await? {
            return Ok(already_captured());
        }
        let config = cx.config;
        let view = cx
            .probe
            .vm_instance_view(&config.resource_group, &config.vm_name)
            .await?;
        Ok(if view.is_power_state("deallocated") {
            Precondition::skip(format!("VM {} already deallocated", config.vm_name))
        } else {
            Precondition::Run
        })
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let command = CloudCommand::new(
            format!("Deallocate VM {}", config.vm_name),
            ["vm", "deallocate"],
        )
        .opt("--resource-group", &config.resource_group)
        .opt("--name", &config.vm_name)
        .arg("--no-wait");
        cx.run(&command).await?;
        Ok(())
    }

    async fn verify(&self, cx: &mut StepContext<'_>) -> Result<()> {
        wait_for_power_state(cx, "deallocated").await
    }
}

/// Mark the deallocated VM as generalized.
pub struct GeneralizeVm;

#[async_trait]
impl StepAction for GeneralizeVm {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        if cx.image_published().await? {
            return Ok(already_captured());
        }
        let config = cx.config;
        let view = cx
            .probe
            .vm_instance_view(&config.resource_group, &config.vm_name)
            .await?;
        Ok(if view.generalized {
            Precondition::skip(format!("VM {} already generalized", config.vm_name))
        } else {
            Precondition::Run
        })
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let command = CloudCommand::new(
            format!("Generalize VM {}", config.vm_name),
            ["vm", "generalize"],
        )
        .opt("--resource-group", &config.resource_group)
        .opt("--name", &config.vm_name);
        cx.run(&command).await?;
        Ok(())
    }

    async fn verify(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let view = cx
            .probe
            .vm_instance_view(&config.resource_group, &config.vm_name)
            .await?;
        if view.generalized {
            Ok(())
        } else {
            Err(Error::FailedState {
                resource: format!("VM {}", vm_ref(config)),
                state: "not generalized after generalize".into(),
            })
        }
    }
}

fn gallery() -> EnsureResource {
    EnsureResource::new(
        |config, _| ResourceRef::Gallery {
            resource_group: config.resource_group.clone(),
            name: config.gallery_name.clone(),
        },
        |config, _| {
            CloudCommand::new(
                format!("Create gallery {}", config.gallery_name),
                ["sig", "create"],
            )
            .opt("--resource-group", &config.resource_group)
            .opt("--gallery-name", &config.gallery_name)
            .opt("--location", &config.region)
            .json()
        },
    )
}

fn image_definition() -> EnsureResource {
    EnsureResource::new(
        |config, _| ResourceRef::ImageDefinition {
            resource_group: config.resource_group.clone(),
            gallery: config.gallery_name.clone(),
            name: config.image_definition.clone(),
        },
        |config, _| {
            CloudCommand::new(
                format!("Create image definition {}", config.image_definition),
                ["sig", "image-definition", "create"],
            )
            .opt("--resource-group", &config.resource_group)
            .opt("--gallery-name", &config.gallery_name)
            .opt("--gallery-image-definition", &config.image_definition)
            .opt("--publisher", &config.image_publisher)
            .opt("--offer", &config.image_offer)
            .opt("--sku", &config.image_sku)
            .opt("--os-type", "Linux")
            .opt("--os-state", "Generalized")
            .opt("--hyper-v-generation", "V2")
            .opt("--location", &config.region)
            .json()
        },
    )
}

/// Capture the generalized VM as a gallery image version.
pub struct ImageVersion;

#[async_trait]
impl StepAction for ImageVersion {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        let version = image_version_ref(cx.config);
        match cx.describe(&version).await? {
            Probed::Found(handle) if handle.is_succeeded() => {
                cx.state.image_published = Some(true);
                Ok(Precondition::skip(format!("image version {} already published", version)))
            }
            Probed::Found(handle) if handle.is_transitioning() => Ok(Precondition::in_progress(
                format!("image version {} creation already in progress", version),
            )),
            Probed::Found(handle) => {
                ensure_not_failed(&version, &handle)?;
                Ok(Precondition::Run)
            }
            Probed::NotFound => Ok(Precondition::Run),
        }
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let vm = vm_ref(config);
        let recorded = cx.state.handle(ResourceKind::Vm).map(|h| h.id.clone());
        let vm_id = match recorded {
            Some(id) => id,
            None => match cx.describe(&vm).await? {
                Probed::Found(handle) => handle.id,
                Probed::NotFound => {
                    return Err(Error::MissingPrerequisite(format!(
                        "build VM {} does not exist; cannot capture image",
                        vm
                    )));
                }
            },
        };
        let command = CloudCommand::new(
            format!("Create image version {}", config.image_version),
            ["sig", "image-version", "create"],
        )
        .opt("--resource-group", &config.resource_group)
        .opt("--gallery-name", &config.gallery_name)
        .opt("--gallery-image-definition", &config.image_definition)
        .opt("--gallery-image-version", &config.image_version)
        .opt("--virtual-machine", vm_id)
        .opt("--location", &config.region)
        .opt("--target-regions", &config.region)
        .arg("--no-wait");
        cx.run(&command).await?;
        Ok(())
    }

    async fn verify(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let version = image_version_ref(cx.config);
        let deadline = cx.config.timeouts.image_version;
        let handle = wait_for_provisioning(cx, &version, deadline).await?;
        cx.state.record(handle);
        cx.state.image_published = Some(true);
        Ok(())
    }
}

/// Persist the hand-off record for the pool stage.
pub struct SaveImageMetadata;

#[async_trait]
impl StepAction for SaveImageMetadata {
    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let config = cx.config;
        let recorded = cx
            .state
            .handle(ResourceKind::ImageVersion)
            .map(|h| h.id.clone())
            .filter(|id| id.starts_with("/subscriptions/"));
        let image_id = match (recorded, &cx.state.subscription_id) {
            (Some(id), _) => id,
            (None, Some(subscription)) => config.image_version_id(subscription),
            (None, None) => {
                return Err(Error::MissingPrerequisite(
                    "image version id is unknown (no subscription recorded)".into(),
                ));
            }
        };

        let metadata = ExecutionMetadata::for_image(config, image_id, cx.log.run_id());
        let path = config.image_metadata_path();
        metadata.save(&path).await?;
        cx.note(
            Level::Info,
            format!("Image metadata written to {}", path.display()),
        );
        cx.state.image_metadata = Some(metadata);
        Ok(())
    }
}
