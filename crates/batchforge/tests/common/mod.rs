// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for batchforge plan tests.
//!
//! Provides `FakeCloud`, an in-memory model of one subscription that answers
//! the Azure CLI commands the plans issue, so whole plans run end to end
//! against `MockExecutor` without a network.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Value, json};

use batchforge::config::ConfigBuilder;
use batchforge::executor::{CloudCommand, CommandOutcome, MockExecutor};
use batchforge::{CommandExecutor, Config, ExecutionLog, OrchestrationDriver};

pub const SUBSCRIPTION: &str = "11111111-2222-3333-4444-555555555555";

/// Words that mark a command as changing cloud state.
const MUTATING: &[&str] = &[
    "create",
    "set",
    "deallocate",
    "generalize",
    "build",
    "register",
    "invoke",
];

/// Observable state of the simulated subscription.
#[derive(Debug)]
pub struct World {
    resources: BTreeSet<String>,
    /// Remaining describes in which a resource still reports a transitional
    /// state (`Creating`, or `resizing` for pools)
    transitions: BTreeMap<String, u32>,
    /// Power state reported by the build VM instance view
    pub power_state: String,
    /// Whether the build VM was generalized
    pub generalized: bool,
    /// Provisioning state the GPU driver extension reports once installed
    pub extension_state: String,
    /// Resize errors reported by every pool
    pub resize_errors: Vec<Value>,
    /// Providers reported as Registered
    pub registered: BTreeSet<String>,
    /// VM sizes offered in the region, with their vCPU counts
    pub offered_sizes: Vec<(String, u32)>,
    /// Compute usage per quota family: (in use, limit)
    pub usage: BTreeMap<String, (u64, u64)>,
    /// Output of `vm run-command invoke`
    pub run_command_message: String,
    /// Last pool document passed to `batch pool create`
    pub submitted_pool: Option<Value>,
    /// Admin password returned by `acr credential show`
    pub registry_password: String,
}

impl Default for World {
    fn default() -> Self {
        Self {
            resources: BTreeSet::new(),
            transitions: BTreeMap::new(),
            power_state: "running".to_string(),
            generalized: false,
            extension_state: "Succeeded".to_string(),
            resize_errors: Vec::new(),
            registered: ["Microsoft.Compute", "Microsoft.Batch", "Microsoft.ContainerRegistry"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            offered_sizes: vec![
                ("Standard_NC4as_T4_v3".to_string(), 4),
                ("Standard_D2s_v3".to_string(), 2),
            ],
            usage: BTreeMap::from([("standardNCASv3_T4Family".to_string(), (0, 16))]),
            run_command_message: "Enable succeeded: \n[stdout]\nbatchforge-preload-ok\n".to_string(),
            submitted_pool: None,
            registry_password: "registry-secret".to_string(),
        }
    }
}

fn arm_id(resource_group: &str, path: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/{}",
        SUBSCRIPTION, resource_group, path
    )
}

fn mark_transitioning(document: &mut Value) {
    if document.get("allocationState").is_some() {
        document["allocationState"] = json!("resizing");
    } else if document.get("provisioningState").is_some() {
        document["provisioningState"] = json!("Creating");
    } else if let Some(properties) = document.get_mut("properties") {
        properties["provisioningState"] = json!("Creating");
    }
}

impl World {
    /// Whether a resource with `key` (e.g. "vm/name") exists.
    pub fn exists(&self, key: &str) -> bool {
        self.resources.contains(key)
    }

    /// Create a resource out of band.
    pub fn insert(&mut self, key: impl Into<String>) {
        self.resources.insert(key.into());
    }

    /// Report `key` as still provisioning for its next `describes` describes.
    pub fn settle_after(&mut self, key: impl Into<String>, describes: u32) {
        self.transitions.insert(key.into(), describes);
    }

    /// Keys of every existing resource.
    pub fn keys(&self) -> Vec<String> {
        self.resources.iter().cloned().collect()
    }

    fn show(&mut self, key: &str, mut document: Value) -> CommandOutcome {
        if !self.exists(key) {
            return CommandOutcome::not_found(key);
        }
        if let Some(remaining) = self.transitions.get_mut(key).filter(|n| **n > 0) {
            *remaining -= 1;
            mark_transitioning(&mut document);
        }
        CommandOutcome::success_json(&document)
    }

    fn answer(&mut self, command: &CloudCommand) -> CommandOutcome {
        let value = |flag: &str| command.value_of(flag).unwrap_or_default().to_string();
        let name = value("--name");
        let rg = value("--resource-group");
        let args: Vec<&str> = command.args().iter().map(String::as_str).collect();

        match args.as_slice() {
            ["version", ..] => CommandOutcome::success_json(&json!({
                "azure-cli": "2.61.0",
                "azure-cli-core": "2.61.0",
            })),
            ["account", "show", ..] => CommandOutcome::success_json(&json!({
                "id": SUBSCRIPTION,
                "name": "batchforge-test",
                "state": "Enabled",
            })),

            ["group", "show", ..] | ["group", "create", ..] => {
                let key = format!("group/{}", name);
                if args[1] == "create" {
                    self.insert(key.clone());
                }
                self.show(
                    &key,
                    json!({
                        "id": format!("/subscriptions/{}/resourceGroups/{}", SUBSCRIPTION, name),
                        "properties": {"provisioningState": "Succeeded"},
                    }),
                )
            }

            ["vm", "show", ..] | ["vm", "create", ..] => {
                let key = format!("vm/{}", name);
                if args[1] == "create" {
                    self.insert(key.clone());
                    self.power_state = "running".to_string();
                    self.generalized = false;
                }
                self.show(
                    &key,
                    json!({
                        "id": arm_id(&rg, &format!("Microsoft.Compute/virtualMachines/{}", name)),
                        "name": name,
                        "provisioningState": "Succeeded",
                    }),
                )
            }
            ["vm", "get-instance-view", ..] => {
                let mut statuses = vec![
                    json!({"code": "ProvisioningState/succeeded"}),
                    json!({"code": format!("PowerState/{}", self.power_state)}),
                ];
                if self.generalized {
                    statuses.push(json!({"code": "OSState/generalized"}));
                }
                self.show(
                    &format!("vm/{}", name),
                    json!({"instanceView": {"statuses": statuses}}),
                )
            }
            ["vm", "extension", "show", ..] => {
                let key = format!("extension/{}/{}", value("--vm-name"), name);
                self.show(
                    &key,
                    json!({
                        "id": arm_id(&rg, &format!(
                            "Microsoft.Compute/virtualMachines/{}/extensions/{}",
                            value("--vm-name"),
                            name
                        )),
                        "provisioningState": self.extension_state,
                    }),
                )
            }
            ["vm", "extension", "set", ..] => {
                if !self.exists(&format!("vm/{}", value("--vm-name"))) {
                    return CommandOutcome::not_found(&value("--vm-name"));
                }
                self.insert(format!("extension/{}/{}", value("--vm-name"), name));
                CommandOutcome::success("")
            }
            ["vm", "run-command", "invoke", ..] => CommandOutcome::success_json(&json!({
                "value": [{
                    "code": "ProvisioningState/succeeded",
                    "message": self.run_command_message,
                }]
            })),
            ["vm", "deallocate", ..] => {
                self.power_state = "deallocated".to_string();
                CommandOutcome::success("")
            }
            ["vm", "generalize", ..] => {
                if self.power_state != "deallocated" {
                    return CommandOutcome::failure(
                        "ERROR: (OperationNotAllowed) The VM must be deallocated before generalizing.",
                    );
                }
                self.generalized = true;
                CommandOutcome::success("")
            }
            ["vm", "list-skus", ..] => {
                let size = value("--size");
                let skus: Vec<Value> = self
                    .offered_sizes
                    .iter()
                    .filter(|(name, _)| name.eq_ignore_ascii_case(&size))
                    .map(|(name, vcpus)| {
                        json!({
                            "name": name,
                            "resourceType": "virtualMachines",
                            "family": "standardNCASv3_T4Family",
                            "capabilities": [{"name": "vCPUs", "value": vcpus.to_string()}],
                            "restrictions": [],
                        })
                    })
                    .collect();
                CommandOutcome::success_json(&Value::Array(skus))
            }
            ["vm", "list-usage", ..] => {
                let usage: Vec<Value> = self
                    .usage
                    .iter()
                    .map(|(family, (used, limit))| {
                        json!({
                            "name": {"value": family, "localizedValue": family},
                            "currentValue": used.to_string(),
                            "limit": limit.to_string(),
                        })
                    })
                    .collect();
                CommandOutcome::success_json(&Value::Array(usage))
            }

            ["sig", "show", ..] | ["sig", "create", ..] => {
                let gallery = value("--gallery-name");
                let key = format!("gallery/{}", gallery);
                if args[1] == "create" {
                    self.insert(key.clone());
                }
                self.show(
                    &key,
                    json!({
                        "id": arm_id(&rg, &format!("Microsoft.Compute/galleries/{}", gallery)),
                        "provisioningState": "Succeeded",
                    }),
                )
            }
            ["sig", "image-definition", action, ..] => {
                let (gallery, definition) =
                    (value("--gallery-name"), value("--gallery-image-definition"));
                let key = format!("definition/{}/{}", gallery, definition);
                if *action == "create" {
                    self.insert(key.clone());
                }
                self.show(
                    &key,
                    json!({
                        "id": arm_id(&rg, &format!(
                            "Microsoft.Compute/galleries/{}/images/{}",
                            gallery, definition
                        )),
                        "provisioningState": "Succeeded",
                    }),
                )
            }
            ["sig", "image-version", action, ..] => {
                let (gallery, definition, version) = (
                    value("--gallery-name"),
                    value("--gallery-image-definition"),
                    value("--gallery-image-version"),
                );
                let key = format!("version/{}/{}/{}", gallery, definition, version);
                if *action == "create" {
                    if !self.generalized {
                        return CommandOutcome::failure(
                            "ERROR: (InvalidParameter) The source virtual machine is not generalized.",
                        );
                    }
                    self.insert(key.clone());
                    return CommandOutcome::success("");
                }
                self.show(
                    &key,
                    json!({
                        "id": arm_id(&rg, &format!(
                            "Microsoft.Compute/galleries/{}/images/{}/versions/{}",
                            gallery, definition, version
                        )),
                        "provisioningState": "Succeeded",
                    }),
                )
            }

            ["batch", "account", "show", ..] | ["batch", "account", "create", ..] => {
                let key = format!("account/{}", name);
                if args[2] == "create" {
                    self.insert(key.clone());
                }
                self.show(
                    &key,
                    json!({
                        "id": arm_id(&rg, &format!("Microsoft.Batch/batchAccounts/{}", name)),
                        "provisioningState": "Succeeded",
                    }),
                )
            }
            ["batch", "account", "login", ..] => {
                if !self.exists(&format!("account/{}", name)) {
                    return CommandOutcome::not_found(&name);
                }
                CommandOutcome::success("")
            }
            ["batch", "pool", "show", ..] => {
                let id = value("--pool-id");
                let key = format!("pool/{}/{}", value("--account-name"), id);
                let vm_size = self
                    .submitted_pool
                    .as_ref()
                    .and_then(|p| p.get("vmSize").cloned())
                    .unwrap_or(Value::Null);
                self.show(
                    &key,
                    json!({
                        "id": id,
                        "allocationState": "steady",
                        "state": "active",
                        "vmSize": vm_size,
                        "resizeErrors": self.resize_errors,
                    }),
                )
            }
            ["batch", "pool", "create", ..] => {
                let path = value("--json-file");
                let document: Value = match std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
                {
                    Ok(document) => document,
                    Err(e) => return CommandOutcome::failure(format!("ERROR: {}: {}", path, e)),
                };
                let id = document.get("id").and_then(Value::as_str).unwrap_or_default();
                self.insert(format!("pool/{}/{}", value("--account-name"), id));
                self.submitted_pool = Some(document);
                CommandOutcome::success("")
            }

            ["acr", "show", ..] | ["acr", "create", ..] => {
                let key = format!("registry/{}", name);
                if args[1] == "create" {
                    self.insert(key.clone());
                }
                self.show(
                    &key,
                    json!({
                        "id": arm_id(&rg, &format!("Microsoft.ContainerRegistry/registries/{}", name)),
                        "loginServer": format!("{}.azurecr.io", name),
                        "provisioningState": "Succeeded",
                    }),
                )
            }
            ["acr", "repository", "show", ..] => {
                let image = value("--image");
                self.show(
                    &format!("image/{}/{}", name, image),
                    json!({"name": image, "digest": "sha256:0123"}),
                )
            }
            ["acr", "build", ..] => {
                self.insert(format!("image/{}/{}", value("--registry"), value("--image")));
                CommandOutcome::success("")
            }
            ["acr", "credential", "show", ..] => CommandOutcome::success_json(&json!({
                "username": name,
                "passwords": [{"name": "password", "value": self.registry_password}],
            })),

            ["provider", "show", ..] => {
                let namespace = value("--namespace");
                let state = if self.registered.contains(&namespace) {
                    "Registered"
                } else {
                    "NotRegistered"
                };
                CommandOutcome::success_json(&json!({
                    "namespace": namespace,
                    "registrationState": state,
                }))
            }
            ["provider", "register", ..] => {
                self.registered.insert(value("--namespace"));
                CommandOutcome::success("")
            }

            _ => CommandOutcome::failure(format!("ERROR: unexpected command: {}", command)),
        }
    }
}

/// Simulated subscription shared by any number of executors.
#[derive(Clone, Default)]
pub struct FakeCloud {
    world: Arc<Mutex<World>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the world for inspection or tweaking.
    pub fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    /// A fresh executor (with its own call history) backed by this cloud.
    pub fn executor(&self) -> Arc<MockExecutor> {
        let world = self.world.clone();
        Arc::new(MockExecutor::with_handler(move |command| {
            world.lock().unwrap().answer(command)
        }))
    }

    /// Like [`FakeCloud::executor`], writing command lines to `log`.
    pub fn executor_with_log(&self, log: ExecutionLog) -> Arc<MockExecutor> {
        let world = self.world.clone();
        Arc::new(
            MockExecutor::with_handler(move |command| world.lock().unwrap().answer(command))
                .with_log(log),
        )
    }
}

/// Commands that changed (or tried to change) cloud state.
pub fn mutating_calls(executor: &MockExecutor) -> Vec<String> {
    executor
        .calls()
        .iter()
        .filter(|c| c.args().iter().any(|a| MUTATING.contains(&a.as_str())))
        .map(|c| c.to_string())
        .collect()
}

/// Configuration rooted at `state_dir` with a short polling interval.
pub fn config(state_dir: &Path) -> ConfigBuilder {
    Config::builder()
        .state_dir(state_dir)
        .poll_interval(Duration::from_millis(10))
}

/// Driver over `executor` with a console-only execution log.
pub fn driver(config: Config, executor: Arc<MockExecutor>) -> OrchestrationDriver {
    let executor: Arc<dyn CommandExecutor> = executor;
    OrchestrationDriver::new(Arc::new(config), executor, ExecutionLog::console_only())
}
