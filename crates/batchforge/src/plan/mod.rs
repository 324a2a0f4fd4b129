// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning plans.
//!
//! A plan is an ordered list of named steps. Every step has three phases:
//!
//! | Phase | Purpose |
//! |-------|---------|
//! | `precondition` | Probe the target; return [`Precondition::Skip`] if it already exists |
//! | `run` | Invoke the create/update action |
//! | `verify` | Wait until the resource reports a successful terminal state |
//!
//! A precondition that finds the target mid-provisioning returns
//! [`Precondition::InProgress`]: the action is not repeated but `verify`
//! still waits, so no step starts against a resource that is not ready.
//!
//! Steps exchange identifiers through [`RunState`], which lives for the whole
//! invocation so the pool plan can consume what the image plan produced.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{CloudCommand, CommandExecutor, CommandOutcome};
use crate::log::{ExecutionLog, Level};
use crate::metadata::ExecutionMetadata;
use crate::pool_spec::PoolSpecification;
use crate::probe::{Probed, ResourceHandle, ResourceKind, ResourceProbe, ResourceRef};
use crate::waiter::PollingWaiter;

pub mod image;
pub mod pool;
pub mod preflight;
pub mod validate;

pub use image::image_plan;
pub use pool::pool_plan;
pub use validate::validate_plan;

/// Decision taken by a step before acting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Nothing exists yet (or work remains); run the action.
    Run,
    /// The target already exists; record the reason and move on.
    Skip(String),
    /// The target exists but is still provisioning; skip the action and
    /// wait in `verify`.
    InProgress(String),
}

impl Precondition {
    /// Skip with a reason.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    /// Resume waiting on a target another invocation started.
    pub fn in_progress(reason: impl Into<String>) -> Self {
        Self::InProgress(reason.into())
    }
}

/// Behavior of one provisioning step.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Probe the target resource.
    async fn precondition(&self, _cx: &mut StepContext<'_>) -> Result<Precondition> {
        Ok(Precondition::Run)
    }

    /// Perform the action.
    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()>;

    /// Success predicate, typically a bounded wait.
    async fn verify(&self, _cx: &mut StepContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// A named step with its deadline and retry policy.
pub struct ProvisioningStep {
    name: &'static str,
    timeout: Duration,
    retryable: bool,
    action: Box<dyn StepAction>,
}

impl ProvisioningStep {
    /// Create a non-retryable step.
    pub fn new(name: &'static str, timeout: Duration, action: impl StepAction + 'static) -> Self {
        Self {
            name,
            timeout,
            retryable: false,
            action: Box::new(action),
        }
    }

    /// Allow the driver to re-attempt this step after a command failure.
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Step name as shown in logs and reports.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Deadline for precondition, action and verification together.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the step may be re-attempted.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The step's behavior.
    pub fn action(&self) -> &dyn StepAction {
        self.action.as_ref()
    }
}

impl fmt::Debug for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningStep")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retryable", &self.retryable)
            .finish()
    }
}

/// An ordered list of steps.
#[derive(Debug)]
pub struct ProvisioningPlan {
    name: &'static str,
    steps: Vec<ProvisioningStep>,
}

impl ProvisioningPlan {
    /// Create an empty plan.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: ProvisioningStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a step when `condition` holds.
    pub fn step_if(self, condition: bool, step: impl FnOnce() -> ProvisioningStep) -> Self {
        if condition { self.step(step()) } else { self }
    }

    /// Plan name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[ProvisioningStep] {
        &self.steps
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Properties of the configured VM size, recorded by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSkuInfo {
    /// Size name, e.g. "Standard_NC4as_T4_v3"
    pub name: String,
    /// Quota family reported by the provider
    pub family: Option<String>,
    /// vCPUs per VM
    pub vcpus: Option<u32>,
}

/// In-memory state of one invocation, shared by every plan it runs.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    handles: BTreeMap<ResourceKind, ResourceHandle>,
    /// CLI version reported by the preflight check
    pub cli_version: Option<String>,
    /// Subscription the CLI is signed in to
    pub subscription_id: Option<String>,
    /// Whether the target image version is already published (cached probe)
    pub image_published: Option<bool>,
    /// Image hand-off record, built by the image plan or loaded by the pool plan
    pub image_metadata: Option<ExecutionMetadata>,
    /// Rendered pool document
    pub pool_spec: Option<PoolSpecification>,
    /// Configured VM size as listed by the provider
    pub vm_sku: Option<VmSkuInfo>,
}

impl RunState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or replace the handle for a resource kind.
    pub fn record(&mut self, handle: ResourceHandle) {
        self.handles.insert(handle.kind, handle);
    }

    /// Last recorded handle of a kind.
    pub fn handle(&self, kind: ResourceKind) -> Option<&ResourceHandle> {
        self.handles.get(&kind)
    }

    /// All recorded handles.
    pub fn handles(&self) -> impl Iterator<Item = &ResourceHandle> {
        self.handles.values()
    }
}

/// Everything a step needs while it runs.
pub struct StepContext<'a> {
    /// Resolved configuration
    pub config: &'a Config,
    /// Command executor
    pub executor: &'a dyn CommandExecutor,
    /// Resource probe
    pub probe: &'a ResourceProbe,
    /// Polling waiter
    pub waiter: &'a PollingWaiter,
    /// Execution log
    pub log: &'a ExecutionLog,
    /// Shared run state
    pub state: &'a mut RunState,
    /// Deadline of the running step
    pub deadline: Duration,
}

impl StepContext<'_> {
    /// Run a command, failing on a failed outcome.
    pub async fn run(&self, command: &CloudCommand) -> Result<CommandOutcome> {
        self.executor.execute_checked(command).await
    }

    /// Run a command and parse its JSON output.
    pub async fn run_json(&self, command: &CloudCommand) -> Result<Value> {
        self.executor.execute_json(command).await
    }

    /// Describe a resource, recording its handle when found.
    pub async fn describe(&mut self, resource: &ResourceRef) -> Result<Probed> {
        let probed = self.probe.describe(resource).await?;
        if let Probed::Found(handle) = &probed {
            self.state.record(handle.clone());
        }
        Ok(probed)
    }

    /// Append a line to the execution log.
    pub fn note(&self, level: Level, message: impl AsRef<str>) {
        self.log.event(level, message.as_ref());
    }

    /// Whether the configured image version is already published.
    ///
    /// Probed once per invocation; the image-version step refreshes it.
    pub async fn image_published(&mut self) -> Result<bool> {
        if let Some(published) = self.state.image_published {
            return Ok(published);
        }
        let resource = image_version_ref(self.config);
        let published = match self.describe(&resource).await? {
            Probed::Found(handle) => handle.is_succeeded(),
            Probed::NotFound => false,
        };
        self.state.image_published = Some(published);
        Ok(published)
    }

    /// Batch account the pool stage targets: the one named in the hand-off
    /// record, falling back to configuration.
    pub fn batch_account(&self) -> &str {
        self.state
            .image_metadata
            .as_ref()
            .map(|m| m.batch_account.as_str())
            .unwrap_or(&self.config.batch_account)
    }
}

/// Gallery image version addressed by the configuration.
pub fn image_version_ref(config: &Config) -> ResourceRef {
    ResourceRef::ImageVersion {
        resource_group: config.resource_group.clone(),
        gallery: config.gallery_name.clone(),
        definition: config.image_definition.clone(),
        version: config.image_version.clone(),
    }
}

/// Poll a resource until it reports Succeeded (or reports no provisioning
/// state at all). Failed or Canceled ends the wait immediately.
pub async fn wait_for_provisioning(
    cx: &StepContext<'_>,
    resource: &ResourceRef,
    deadline: Duration,
) -> Result<ResourceHandle> {
    let probe = cx.probe;
    let what = format!("{} {} to provision", resource.kind(), resource);
    let outcome = cx
        .waiter
        .wait_until(&what, deadline, move || async move {
            match probe.describe(resource).await? {
                Probed::Found(handle) => {
                    ensure_not_failed(resource, &handle)?;
                    Ok((!handle.is_transitioning()).then_some(handle))
                }
                Probed::NotFound => Ok(None),
            }
        })
        .await?;
    outcome.or_timeout(what)
}

/// Fail with [`Error::FailedState`] when a handle reports a failed state.
pub fn ensure_not_failed(resource: &ResourceRef, handle: &ResourceHandle) -> Result<()> {
    if handle.is_failed() {
        return Err(Error::FailedState {
            resource: format!("{} {}", resource.kind(), resource),
            state: handle.state.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

type Target<T> = fn(&Config, &RunState) -> T;

/// Create-if-absent step for resources with a provisioning state.
///
/// A resource found still `Creating` or `Updating` is waited on rather than
/// skipped.
pub struct EnsureResource {
    resource: Target<ResourceRef>,
    create: Target<CloudCommand>,
}

impl EnsureResource {
    /// Step that describes `resource` and runs `create` when it is absent.
    pub fn new(resource: Target<ResourceRef>, create: Target<CloudCommand>) -> Self {
        Self { resource, create }
    }
}

#[async_trait]
impl StepAction for EnsureResource {
    async fn precondition(&self, cx: &mut StepContext<'_>) -> Result<Precondition> {
        let resource = (self.resource)(cx.config, cx.state);
        match cx.describe(&resource).await? {
            Probed::Found(handle) => {
                ensure_not_failed(&resource, &handle)?;
                if handle.is_transitioning() {
                    return Ok(Precondition::in_progress(format!(
                        "{} {} is {}",
                        resource.kind(),
                        resource,
                        handle.state.as_deref().unwrap_or_default()
                    )));
                }
                Ok(Precondition::skip(format!(
                    "{} {} already exists",
                    resource.kind(),
                    resource
                )))
            }
            Probed::NotFound => Ok(Precondition::Run),
        }
    }

    async fn run(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let command = (self.create)(cx.config, cx.state);
        cx.run(&command).await?;
        Ok(())
    }

    async fn verify(&self, cx: &mut StepContext<'_>) -> Result<()> {
        let resource = (self.resource)(cx.config, cx.state);
        let handle = wait_for_provisioning(cx, &resource, cx.deadline).await?;
        cx.state.record(handle);
        Ok(())
    }
}
