// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource probes.
//!
//! Create steps ask the probe whether their target already exists before
//! acting. A describe that fails with the provider's "not found" diagnostic
//! means the resource is absent; any other failure is reported as an error
//! so an expired login or a network fault never looks like "absent".

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::{CloudCommand, CommandExecutor};

/// Kinds of external resources the driver manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Resource group
    ResourceGroup,
    /// Virtual machine
    Vm,
    /// VM extension
    VmExtension,
    /// Shared image gallery
    Gallery,
    /// Gallery image definition
    ImageDefinition,
    /// Gallery image version
    ImageVersion,
    /// Batch account
    BatchAccount,
    /// Batch pool
    Pool,
    /// Container registry
    Registry,
    /// Tagged image inside a container registry
    ContainerImage,
}

impl ResourceKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceGroup => "resource group",
            Self::Vm => "VM",
            Self::VmExtension => "VM extension",
            Self::Gallery => "gallery",
            Self::ImageDefinition => "image definition",
            Self::ImageVersion => "image version",
            Self::BatchAccount => "Batch account",
            Self::Pool => "pool",
            Self::Registry => "container registry",
            Self::ContainerImage => "container image",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of an external resource: its name plus the scope that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    /// Resource group
    ResourceGroup {
        /// Group name
        name: String,
    },
    /// Virtual machine
    Vm {
        /// Owning resource group
        resource_group: String,
        /// VM name
        name: String,
    },
    /// VM extension
    VmExtension {
        /// Owning resource group
        resource_group: String,
        /// VM name
        vm: String,
        /// Extension name
        name: String,
    },
    /// Shared image gallery
    Gallery {
        /// Owning resource group
        resource_group: String,
        /// Gallery name
        name: String,
    },
    /// Gallery image definition
    ImageDefinition {
        /// Owning resource group
        resource_group: String,
        /// Gallery name
        gallery: String,
        /// Definition name
        name: String,
    },
    /// Gallery image version
    ImageVersion {
        /// Owning resource group
        resource_group: String,
        /// Gallery name
        gallery: String,
        /// Definition name
        definition: String,
        /// Version, e.g. "1.0.0"
        version: String,
    },
    /// Batch account
    BatchAccount {
        /// Owning resource group
        resource_group: String,
        /// Account name
        name: String,
    },
    /// Batch pool
    Pool {
        /// Batch account name
        account: String,
        /// Pool id
        id: String,
    },
    /// Container registry
    Registry {
        /// Owning resource group
        resource_group: String,
        /// Registry name
        name: String,
    },
    /// Tagged container image in a registry
    ContainerImage {
        /// Registry name
        registry: String,
        /// Repository, e.g. "batchforge/worker"
        repository: String,
        /// Tag
        tag: String,
    },
}

impl ResourceRef {
    /// Kind of the referenced resource.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::ResourceGroup { .. } => ResourceKind::ResourceGroup,
            Self::Vm { .. } => ResourceKind::Vm,
            Self::VmExtension { .. } => ResourceKind::VmExtension,
            Self::Gallery { .. } => ResourceKind::Gallery,
            Self::ImageDefinition { .. } => ResourceKind::ImageDefinition,
            Self::ImageVersion { .. } => ResourceKind::ImageVersion,
            Self::BatchAccount { .. } => ResourceKind::BatchAccount,
            Self::Pool { .. } => ResourceKind::Pool,
            Self::Registry { .. } => ResourceKind::Registry,
            Self::ContainerImage { .. } => ResourceKind::ContainerImage,
        }
    }

    /// Leaf name of the referenced resource.
    pub fn name(&self) -> &str {
        match self {
            Self::ResourceGroup { name }
            | Self::Vm { name, .. }
            | Self::VmExtension { name, .. }
            | Self::Gallery { name, .. }
            | Self::ImageDefinition { name, .. }
            | Self::BatchAccount { name, .. }
            | Self::Registry { name, .. } => name,
            Self::ImageVersion { version, .. } => version,
            Self::Pool { id, .. } => id,
            Self::ContainerImage { tag, .. } => tag,
        }
    }

    /// Command that describes the resource as JSON.
    pub fn describe_command(&self) -> CloudCommand {
        let description = format!("Describe {} {}", self.kind(), self);
        let command = match self {
            Self::ResourceGroup { name } => {
                CloudCommand::new(description, ["group", "show"]).opt("--name", name)
            }
            Self::Vm {
                resource_group,
                name,
            } => CloudCommand::new(description, ["vm", "show"])
                .opt("--resource-group", resource_group)
                .opt("--name", name),
            Self::VmExtension {
                resource_group,
                vm,
                name,
            } => CloudCommand::new(description, ["vm", "extension", "show"])
                .opt("--resource-group", resource_group)
                .opt("--vm-name", vm)
                .opt("--name", name),
            Self::Gallery {
                resource_group,
                name,
            } => CloudCommand::new(description, ["sig", "show"])
                .opt("--resource-group", resource_group)
                .opt("--gallery-name", name),
            Self::ImageDefinition {
                resource_group,
                gallery,
                name,
            } => CloudCommand::new(description, ["sig", "image-definition", "show"])
                .opt("--resource-group", resource_group)
                .opt("--gallery-name", gallery)
                .opt("--gallery-image-definition", name),
            Self::ImageVersion {
                resource_group,
                gallery,
                definition,
                version,
            } => CloudCommand::new(description, ["sig", "image-version", "show"])
                .opt("--resource-group", resource_group)
                .opt("--gallery-name", gallery)
                .opt("--gallery-image-definition", definition)
                .opt("--gallery-image-version", version),
            Self::BatchAccount {
                resource_group,
                name,
            } => CloudCommand::new(description, ["batch", "account", "show"])
                .opt("--resource-group", resource_group)
                .opt("--name", name),
            Self::Pool { account, id } => CloudCommand::new(description, ["batch", "pool", "show"])
                .opt("--account-name", account)
                .opt("--pool-id", id),
            Self::Registry {
                resource_group,
                name,
            } => CloudCommand::new(description, ["acr", "show"])
                .opt("--resource-group", resource_group)
                .opt("--name", name),
            Self::ContainerImage {
                registry,
                repository,
                tag,
            } => CloudCommand::new(description, ["acr", "repository", "show"])
                .opt("--name", registry)
                .opt("--image", format!("{}:{}", repository, tag)),
        };
        command.json()
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceGroup { name } => write!(f, "{}", name),
            Self::Vm {
                resource_group,
                name,
            }
            | Self::Gallery {
                resource_group,
                name,
            }
            | Self::BatchAccount {
                resource_group,
                name,
            }
            | Self::Registry {
                resource_group,
                name,
            } => write!(f, "{}/{}", resource_group, name),
            Self::VmExtension {
                resource_group,
                vm,
                name,
            } => write!(f, "{}/{}/{}", resource_group, vm, name),
            Self::ImageDefinition {
                resource_group,
                gallery,
                name,
            } => write!(f, "{}/{}/{}", resource_group, gallery, name),
            Self::ImageVersion {
                resource_group,
                gallery,
                definition,
                version,
            } => write!(f, "{}/{}/{}/{}", resource_group, gallery, definition, version),
            Self::Pool { account, id } => write!(f, "{}/{}", account, id),
            Self::ContainerImage {
                registry,
                repository,
                tag,
            } => write!(f, "{}/{}:{}", registry, repository, tag),
        }
    }
}

/// In-memory reference to an external resource plus its last observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Resource kind
    pub kind: ResourceKind,
    /// Provider identifier (ARM id where the provider returns one)
    pub id: String,
    /// Last observed provisioning or allocation state
    pub state: Option<String>,
    /// Full describe document from the last observation
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl ResourceHandle {
    /// Build a handle from a describe document.
    pub fn from_describe(resource: &ResourceRef, details: Value) -> Self {
        let id = details
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| resource.to_string());
        let state = observed_state(resource.kind(), &details);
        Self {
            kind: resource.kind(),
            id,
            state,
            details,
        }
    }

    /// Whether the last observed state is a successful terminal state.
    pub fn is_succeeded(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("succeeded"))
    }

    /// Whether the last observed state is a failed terminal state.
    pub fn is_failed(&self) -> bool {
        self.state.as_deref().is_some_and(|s| {
            s.eq_ignore_ascii_case("failed") || s.eq_ignore_ascii_case("canceled")
        })
    }

    /// Whether a provisioning state is reported and is not yet terminal
    /// (`Creating`, `Updating`, ...). Not meaningful for pool allocation
    /// states.
    pub fn is_transitioning(&self) -> bool {
        self.state.is_some() && !self.is_succeeded() && !self.is_failed()
    }
}

fn observed_state(kind: ResourceKind, details: &Value) -> Option<String> {
    let lookup = |key: &str| {
        details
            .get(key)
            .or_else(|| details.get("properties").and_then(|p| p.get(key)))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    match kind {
        ResourceKind::Pool => lookup("allocationState"),
        _ => lookup("provisioningState"),
    }
}

/// Result of a describe call.
#[derive(Debug, Clone, PartialEq)]
pub enum Probed {
    /// The resource exists.
    Found(ResourceHandle),
    /// The provider reported the resource as absent.
    NotFound,
}

impl Probed {
    /// The handle, if found.
    pub fn into_handle(self) -> Option<ResourceHandle> {
        match self {
            Self::Found(handle) => Some(handle),
            Self::NotFound => None,
        }
    }
}

/// Whether a CLI error text is the provider's "not found" diagnostic.
pub fn is_not_found(error: &str) -> bool {
    const MARKERS: &[&str] = &[
        "resourcenotfound",
        "resourcegroupnotfound",
        "parentresourcenotfound",
        "(notfound)",
        "code: notfound",
        "could not be found",
        "was not found",
        "does not exist",
        "poolnotfound",
        "manifest_unknown",
    ];
    let lower = error.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

/// Power and generalization state from a VM instance view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmInstanceView {
    /// Power state without the "PowerState/" prefix, e.g. "running"
    pub power_state: Option<String>,
    /// Whether the OS has been generalized
    pub generalized: bool,
}

impl VmInstanceView {
    /// Parse the `statuses` list of an instance view document.
    pub fn from_json(value: &Value) -> Self {
        let statuses = value
            .get("instanceView")
            .and_then(|v| v.get("statuses"))
            .or_else(|| value.get("statuses"))
            .and_then(Value::as_array);
        let mut view = Self::default();
        for code in statuses
            .into_iter()
            .flatten()
            .filter_map(|s| s.get("code").and_then(Value::as_str))
        {
            if let Some(power) = code.strip_prefix("PowerState/") {
                view.power_state = Some(power.to_string());
            } else if code.eq_ignore_ascii_case("OSState/generalized") {
                view.generalized = true;
            }
        }
        view
    }

    /// Whether the VM reports the given power state.
    pub fn is_power_state(&self, state: &str) -> bool {
        self.power_state.as_deref() == Some(state)
    }
}

/// Existence and state queries against the cloud provider.
#[derive(Clone)]
pub struct ResourceProbe {
    executor: Arc<dyn CommandExecutor>,
}

impl ResourceProbe {
    /// Create a probe that describes resources through `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Describe a resource.
    pub async fn describe(&self, resource: &ResourceRef) -> Result<Probed> {
        let command = resource.describe_command();
        let outcome = self.executor.execute(&command).await;
        if outcome.succeeded {
            let details = outcome.parse_json()?;
            // `acr repository show` and friends print nothing for missing items.
            if details.is_null() {
                return Ok(Probed::NotFound);
            }
            let handle = ResourceHandle::from_describe(resource, details);
            debug!(resource = %resource, state = ?handle.state, "Resource found");
            return Ok(Probed::Found(handle));
        }

        let text = outcome.error_text();
        if is_not_found(&text) {
            debug!(resource = %resource, "Resource not found");
            Ok(Probed::NotFound)
        } else {
            Err(Error::Probe {
                resource: format!("{} {}", resource.kind(), resource),
                message: text,
            })
        }
    }

    /// Whether a resource exists.
    pub async fn exists(&self, resource: &ResourceRef) -> Result<bool> {
        Ok(matches!(self.describe(resource).await?, Probed::Found(_)))
    }

    /// Read the power and generalization state of a VM.
    pub async fn vm_instance_view(&self, resource_group: &str, vm: &str) -> Result<VmInstanceView> {
        let command = CloudCommand::new(
            format!("Read instance view of VM {}/{}", resource_group, vm),
            ["vm", "get-instance-view"],
        )
        .opt("--resource-group", resource_group)
        .opt("--name", vm)
        .json();
        let value = self.executor.execute_json(&command).await?;
        Ok(VmInstanceView::from_json(&value))
    }
}
