// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted hand-off records.
//!
//! The image plan writes `image_metadata.json` when it finishes; a later
//! pool-only invocation reads it instead of rebuilding the image. The pool
//! plan writes `pool_metadata.json` for job-submission callers.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{Config, OsFamily};

/// Hand-off failures.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// No metadata file at the expected path.
    #[error("image metadata not found at {}; run the image stage first or pass --image-id", .0.display())]
    Missing(PathBuf),

    /// The file exists but is not a JSON object.
    #[error("image metadata at {} is malformed: {reason}", .path.display())]
    Malformed {
        /// File path
        path: PathBuf,
        /// Parse failure
        reason: String,
    },

    /// A required field is absent or empty.
    #[error("image metadata is missing required field '{0}'")]
    MissingField(&'static str),

    /// The file could not be read.
    #[error("failed to read image metadata at {}: {source}", .path.display())]
    Unreadable {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

/// Image stage output consumed by the pool stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Gallery image version resource id
    pub image_id: String,
    /// Batch node agent SKU matching the image OS
    pub node_agent_sku_id: String,
    /// Gallery name
    pub gallery_name: String,
    /// Image definition name
    pub image_definition: String,
    /// Image version
    pub image_version: String,
    /// Batch account the pool stage should use
    pub batch_account: String,

    /// Resource group holding the gallery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    /// Region the image was built in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// OS family of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_family: Option<OsFamily>,
    /// OS version of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Whether the image carries the GPU driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<bool>,
    /// VM size the image was built on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,
    /// Invocation that produced the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// When the record was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ExecutionMetadata {
    /// Fields that must be present and non-empty.
    pub const REQUIRED_FIELDS: [&'static str; 6] = [
        "image_id",
        "node_agent_sku_id",
        "gallery_name",
        "image_definition",
        "image_version",
        "batch_account",
    ];

    /// Record for an image built from `config`.
    pub fn for_image(config: &Config, image_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            image_id: image_id.into(),
            node_agent_sku_id: config.os.node_agent_sku_id(),
            gallery_name: config.gallery_name.clone(),
            image_definition: config.image_definition.clone(),
            image_version: config.image_version.clone(),
            batch_account: config.batch_account.clone(),
            resource_group: Some(config.resource_group.clone()),
            region: Some(config.region.clone()),
            os_family: Some(config.os.family),
            os_version: Some(config.os.version.clone()),
            gpu: Some(config.gpu),
            vm_size: Some(config.vm_size.clone()),
            run_id: Some(run_id),
            created_at: Some(Utc::now()),
        }
    }

    /// Parse and validate a metadata document.
    pub fn from_json_str(content: &str, path: &Path) -> Result<Self, HandoffError> {
        let malformed = |reason: String| HandoffError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let value: Value = serde_json::from_str(content).map_err(|e| malformed(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| malformed("expected a JSON object".to_string()))?;

        for field in Self::REQUIRED_FIELDS {
            match object.get(field) {
                Some(Value::String(v)) if !v.trim().is_empty() => {}
                None | Some(Value::Null) | Some(Value::String(_)) => {
                    return Err(HandoffError::MissingField(field));
                }
                Some(other) => {
                    return Err(malformed(format!(
                        "field '{}' must be a string, found {}",
                        field,
                        json_type(other)
                    )));
                }
            }
        }

        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
    }

    /// Read and validate the record at `path`.
    pub async fn load(path: &Path) -> Result<Self, HandoffError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HandoffError::Missing(path.to_path_buf()));
            }
            Err(source) => {
                return Err(HandoffError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_json_str(&content, path)
    }

    /// Write the record to `path`.
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        write_json(path, self).await
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Pool stage output for job-submission callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetadata {
    /// Pool id
    pub pool_id: String,
    /// Batch account
    pub batch_account: String,
    /// Resource group of the account
    pub resource_group: String,
    /// Region
    pub region: String,
    /// Node VM size
    pub vm_size: String,
    /// Dedicated node count
    pub node_count: u32,
    /// Image the nodes boot from
    pub image_id: String,
    /// Node agent SKU
    pub node_agent_sku_id: String,
    /// Whether nodes are GPU nodes
    pub gpu: bool,
    /// Invocation that produced the record
    pub run_id: Uuid,
    /// When the record was produced
    pub created_at: DateTime<Utc>,
}

impl PoolMetadata {
    /// Read the record at `path`.
    ///
    /// batchforge itself never reads this file back; this is the entry point
    /// for job-submission tooling that links the crate.
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Write the record to `path`.
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        write_json(path, self).await
    }
}

/// Write a value as pretty JSON, creating parent directories.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, content).await
}
