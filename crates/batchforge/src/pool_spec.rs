// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch pool specification document.
//!
//! Serialized with the Batch REST field names and submitted with
//! `az batch pool create --json-file`.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::metadata::ExecutionMetadata;
use crate::start_task::StartTaskCommand;

/// Pool creation document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpecification {
    /// Pool id
    pub id: String,
    /// Node VM size
    pub vm_size: String,
    /// Image and node agent
    pub virtual_machine_configuration: VirtualMachineConfiguration,
    /// Dedicated node count
    pub target_dedicated_nodes: u32,
    /// Task slots per node
    pub task_slots_per_node: u32,
    /// Node start task
    pub start_task: StartTask,
}

/// Image reference plus node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineConfiguration {
    /// Gallery image reference
    pub image_reference: ImageReference,
    /// Batch node agent SKU
    #[serde(rename = "nodeAgentSKUId")]
    pub node_agent_sku_id: String,
}

/// Gallery image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    /// Gallery image version resource id
    pub virtual_machine_image_id: String,
}

/// Start task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTask {
    /// Command line run on each node
    pub command_line: String,
    /// Identity the task runs as
    pub user_identity: UserIdentity,
    /// Whether the node waits for the task before accepting work
    pub wait_for_success: bool,
    /// Retries before the node is marked unusable
    pub max_task_retry_count: u32,
}

/// Start task identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    /// Auto user settings
    pub auto_user: AutoUser,
}

/// Auto user settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoUser {
    /// "pool" or "task"
    pub scope: String,
    /// "admin" or "nonadmin"
    pub elevation_level: String,
}

impl PoolSpecification {
    /// Render the pool document for `config` booting the image in `metadata`.
    pub fn render(
        config: &Config,
        metadata: &ExecutionMetadata,
        start_task: &StartTaskCommand,
    ) -> Self {
        Self {
            id: config.pool_id.clone(),
            vm_size: config.vm_size.clone(),
            virtual_machine_configuration: VirtualMachineConfiguration {
                image_reference: ImageReference {
                    virtual_machine_image_id: metadata.image_id.clone(),
                },
                node_agent_sku_id: metadata.node_agent_sku_id.clone(),
            },
            target_dedicated_nodes: config.node_count,
            task_slots_per_node: config.task_slots_per_node,
            start_task: StartTask {
                command_line: start_task.command_line(),
                // Installing packages and configuring the runtime needs root.
                user_identity: UserIdentity {
                    auto_user: AutoUser {
                        scope: "pool".to_string(),
                        elevation_level: "admin".to_string(),
                    },
                },
                wait_for_success: true,
                max_task_retry_count: 1,
            },
        }
    }
}
