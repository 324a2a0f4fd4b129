// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for batchforge.
//!
//! Settings are resolved once per invocation, in this order: built-in
//! defaults, `BATCHFORGE_*` environment variables, command line overrides.
//! The result is an immutable [`Config`] shared by every component.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Base operating system family of the build VM and pool nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Canonical Ubuntu Server
    Ubuntu,
    /// AlmaLinux
    #[serde(rename = "almalinux")]
    AlmaLinux,
}

impl OsFamily {
    /// Returns the string representation of the family.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ubuntu => "ubuntu",
            Self::AlmaLinux => "almalinux",
        }
    }

    /// OS versions this tool knows how to provision.
    pub fn supported_versions(&self) -> &'static [&'static str] {
        match self {
            Self::Ubuntu => &["20.04", "22.04"],
            Self::AlmaLinux => &["8", "9"],
        }
    }

    /// Version used when none is configured.
    pub fn default_version(&self) -> &'static str {
        match self {
            Self::Ubuntu => "22.04",
            Self::AlmaLinux => "9",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ubuntu" => Ok(Self::Ubuntu),
            "almalinux" | "alma" => Ok(Self::AlmaLinux),
            other => Err(ConfigError::Invalid(
                "BATCHFORGE_OS",
                format!("unknown OS family '{}' (expected ubuntu or almalinux)", other),
            )),
        }
    }
}

/// Resolved base OS: family plus version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsImage {
    /// OS family
    pub family: OsFamily,
    /// Version string, e.g. "22.04" or "9"
    pub version: String,
}

impl OsImage {
    /// Marketplace image URN used to create the build VM.
    pub fn marketplace_urn(&self) -> &'static str {
        match (self.family, self.version.as_str()) {
            (OsFamily::Ubuntu, "20.04") => "Canonical:0001-com-ubuntu-server-focal:20_04-lts-gen2:latest",
            (OsFamily::Ubuntu, _) => "Canonical:0001-com-ubuntu-server-jammy:22_04-lts-gen2:latest",
            (OsFamily::AlmaLinux, "8") => "almalinux:almalinux-x86_64:8-gen2:latest",
            (OsFamily::AlmaLinux, _) => "almalinux:almalinux-x86_64:9-gen2:latest",
        }
    }

    /// Batch node agent SKU matching this OS.
    pub fn node_agent_sku_id(&self) -> String {
        match self.family {
            OsFamily::Ubuntu => format!("batch.node.ubuntu {}", self.version),
            OsFamily::AlmaLinux => format!("batch.node.el {}", self.version),
        }
    }

    /// Compact identifier used in derived resource names, e.g. "ubuntu2204".
    pub fn slug(&self) -> String {
        format!("{}{}", self.family.as_str(), self.version.replace('.', ""))
    }
}

impl fmt::Display for OsImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.version)
    }
}

/// Container image build and preload settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerBuild {
    /// Container registry name (without the .azurecr.io suffix)
    pub registry: String,
    /// Repository and tag, e.g. "batchforge/worker:latest"
    pub image: String,
    /// Dockerfile path relative to the build context
    pub dockerfile: String,
    /// Build context directory
    pub context: PathBuf,
}

impl ContainerBuild {
    /// Login server of the registry.
    pub fn login_server(&self) -> String {
        format!("{}.azurecr.io", self.registry)
    }

    /// Fully qualified image reference.
    pub fn image_ref(&self) -> String {
        format!("{}/{}", self.login_server(), self.image)
    }

    /// Repository part of the image (before the tag).
    pub fn repository(&self) -> &str {
        self.image.rsplit_once(':').map(|(r, _)| r).unwrap_or(&self.image)
    }

    /// Tag part of the image, "latest" when none is given.
    pub fn tag(&self) -> &str {
        self.image.rsplit_once(':').map(|(_, t)| t).unwrap_or("latest")
    }
}

/// Deadlines for long-running operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Fixed polling interval for all waits.
    pub poll_interval: Duration,
    /// Build VM reaching running (and deallocated) power state.
    pub vm_ready: Duration,
    /// GPU driver extension installation.
    pub driver_install: Duration,
    /// Gallery image version creation and replication.
    pub image_version: Duration,
    /// Pool allocation reaching steady state.
    pub pool_ready: Duration,
    /// Resource provider registration.
    pub provider_registration: Duration,
    /// Upper bound for a single external command.
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            vm_ready: Duration::from_secs(15 * 60),
            driver_install: Duration::from_secs(30 * 60),
            image_version: Duration::from_secs(60 * 60),
            pool_ready: Duration::from_secs(30 * 60),
            provider_registration: Duration::from_secs(10 * 60),
            command: Duration::from_secs(60 * 60),
        }
    }
}

/// Resolved batchforge configuration. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resource group holding every provisioned resource
    pub resource_group: String,
    /// Azure region
    pub region: String,
    /// Base OS of the image
    pub os: OsImage,
    /// Whether the image and pool target GPU nodes
    pub gpu: bool,
    /// VM size selected for the build VM and pool nodes
    pub vm_size: String,
    /// Name of the temporary build VM
    pub vm_name: String,
    /// Admin user on the build VM
    pub admin_username: String,
    /// Shared image gallery name
    pub gallery_name: String,
    /// Gallery image definition name
    pub image_definition: String,
    /// Gallery image version, e.g. "1.0.0"
    pub image_version: String,
    /// Image definition publisher
    pub image_publisher: String,
    /// Image definition offer
    pub image_offer: String,
    /// Image definition SKU
    pub image_sku: String,
    /// Batch account name
    pub batch_account: String,
    /// Batch pool identifier
    pub pool_id: String,
    /// Dedicated node count of the pool
    pub node_count: u32,
    /// Task slots per pool node
    pub task_slots_per_node: u32,
    /// Container image build settings (None when disabled)
    pub container: Option<ContainerBuild>,
    /// Explicit image version resource id for pool-only runs
    pub image_id_override: Option<String>,
    /// Register missing resource providers during validation
    pub auto_register_providers: bool,
    /// Deadlines for long-running operations
    pub timeouts: Timeouts,
    /// Attempts for retryable steps (1 = no retries)
    pub max_attempts: u32,
    /// Directory for metadata, pool spec and log files
    pub state_dir: PathBuf,
    /// Cloud CLI binary
    pub az_binary: String,
}

impl Config {
    /// Start from built-in defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        ConfigBuilder::from_env()?.build()
    }

    /// Resource id the image version will have once created.
    pub fn image_version_id(&self, subscription_id: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/galleries/{}/images/{}/versions/{}",
            subscription_id,
            self.resource_group,
            self.gallery_name,
            self.image_definition,
            self.image_version
        )
    }

    /// Path of the persisted image hand-off record.
    pub fn image_metadata_path(&self) -> PathBuf {
        self.state_dir.join("image_metadata.json")
    }

    /// Path of the persisted pool record.
    pub fn pool_metadata_path(&self) -> PathBuf {
        self.state_dir.join("pool_metadata.json")
    }

    /// Path of the rendered pool specification.
    pub fn pool_spec_path(&self) -> PathBuf {
        self.state_dir.join("pool-config.json")
    }
}

/// Overrides applied after defaults and environment, typically from the CLI.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Resource group
    pub resource_group: Option<String>,
    /// Region
    pub region: Option<String>,
    /// OS family
    pub os_family: Option<OsFamily>,
    /// OS version
    pub os_version: Option<String>,
    /// GPU flag
    pub gpu: Option<bool>,
    /// VM size
    pub vm_size: Option<String>,
    /// Pool identifier
    pub pool_id: Option<String>,
    /// Node count
    pub node_count: Option<u32>,
    /// Image version resource id
    pub image_id: Option<String>,
    /// Provider auto-registration
    pub auto_register_providers: Option<bool>,
    /// State directory
    pub state_dir: Option<PathBuf>,
}

/// Unresolved settings. Call [`ConfigBuilder::build`] to validate and freeze.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    resource_group: String,
    region: String,
    os_family: OsFamily,
    os_version: Option<String>,
    gpu: bool,
    gpu_vm_size: String,
    cpu_vm_size: String,
    vm_size: Option<String>,
    vm_name: String,
    admin_username: String,
    gallery_name: String,
    image_definition: Option<String>,
    image_version: String,
    image_publisher: String,
    image_offer: String,
    batch_account: String,
    pool_id: String,
    node_count: u32,
    task_slots_per_node: u32,
    build_container: bool,
    registry: String,
    container_image: String,
    dockerfile: String,
    build_context: PathBuf,
    image_id: Option<String>,
    auto_register_providers: bool,
    timeouts: Timeouts,
    max_attempts: u32,
    state_dir: PathBuf,
    az_binary: String,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            resource_group: "rg-batchforge".to_string(),
            region: "eastus".to_string(),
            os_family: OsFamily::Ubuntu,
            os_version: None,
            gpu: true,
            gpu_vm_size: "Standard_NC4as_T4_v3".to_string(),
            cpu_vm_size: "Standard_D2s_v3".to_string(),
            vm_size: None,
            vm_name: "vm-batchforge-build".to_string(),
            admin_username: "azureuser".to_string(),
            gallery_name: "batchforge_gallery".to_string(),
            image_definition: None,
            image_version: "1.0.0".to_string(),
            image_publisher: "batchforge".to_string(),
            image_offer: "batchforge-node".to_string(),
            batch_account: "batchforgeacct".to_string(),
            pool_id: "batchforge-pool".to_string(),
            node_count: 1,
            task_slots_per_node: 1,
            build_container: false,
            registry: "batchforgeacr".to_string(),
            container_image: "batchforge/worker:latest".to_string(),
            dockerfile: "Dockerfile".to_string(),
            build_context: PathBuf::from("."),
            image_id: None,
            auto_register_providers: true,
            timeouts: Timeouts::default(),
            max_attempts: 1,
            state_dir: PathBuf::from("."),
            az_binary: "az".to_string(),
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(var, format!("'{}' is not a boolean", value))),
    }
}

fn parse_number<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(var, format!("'{}' is not a valid number", value)))
}

impl ConfigBuilder {
    /// Defaults overlaid with `BATCHFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut b = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BATCHFORGE_RESOURCE_GROUP") {
            b.resource_group = v;
        }
        if let Some(v) = get("BATCHFORGE_REGION") {
            b.region = v;
        }
        if let Some(v) = get("BATCHFORGE_OS") {
            b.os_family = v.parse()?;
        }
        if let Some(v) = get("BATCHFORGE_OS_VERSION") {
            b.os_version = Some(v);
        }
        if let Some(v) = get("BATCHFORGE_GPU") {
            b.gpu = parse_bool("BATCHFORGE_GPU", &v)?;
        }
        if let Some(v) = get("BATCHFORGE_GPU_VM_SIZE") {
            b.gpu_vm_size = v;
        }
        if let Some(v) = get("BATCHFORGE_CPU_VM_SIZE") {
            b.cpu_vm_size = v;
        }
        if let Some(v) = get("BATCHFORGE_VM_SIZE") {
            b.vm_size = Some(v);
        }
        if let Some(v) = get("BATCHFORGE_VM_NAME") {
            b.vm_name = v;
        }
        if let Some(v) = get("BATCHFORGE_ADMIN_USERNAME") {
            b.admin_username = v;
        }
        if let Some(v) = get("BATCHFORGE_GALLERY") {
            b.gallery_name = v;
        }
        if let Some(v) = get("BATCHFORGE_IMAGE_DEFINITION") {
            b.image_definition = Some(v);
        }
        if let Some(v) = get("BATCHFORGE_IMAGE_VERSION") {
            b.image_version = v;
        }
        if let Some(v) = get("BATCHFORGE_BATCH_ACCOUNT") {
            b.batch_account = v;
        }
        if let Some(v) = get("BATCHFORGE_POOL_ID") {
            b.pool_id = v;
        }
        if let Some(v) = get("BATCHFORGE_NODE_COUNT") {
            b.node_count = parse_number("BATCHFORGE_NODE_COUNT", &v)?;
        }
        if let Some(v) = get("BATCHFORGE_BUILD_CONTAINER") {
            b.build_container = parse_bool("BATCHFORGE_BUILD_CONTAINER", &v)?;
        }
        if let Some(v) = get("BATCHFORGE_REGISTRY") {
            b.registry = v;
        }
        if let Some(v) = get("BATCHFORGE_CONTAINER_IMAGE") {
            b.container_image = v;
        }
        if let Some(v) = get("BATCHFORGE_DOCKERFILE") {
            b.dockerfile = v;
        }
        if let Some(v) = get("BATCHFORGE_BUILD_CONTEXT") {
            b.build_context = PathBuf::from(v);
        }
        if let Some(v) = get("BATCHFORGE_AUTO_REGISTER") {
            b.auto_register_providers = parse_bool("BATCHFORGE_AUTO_REGISTER", &v)?;
        }
        if let Some(v) = get("BATCHFORGE_POLL_INTERVAL_SECS") {
            b.timeouts.poll_interval =
                Duration::from_secs(parse_number("BATCHFORGE_POLL_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("BATCHFORGE_MAX_ATTEMPTS") {
            b.max_attempts = parse_number("BATCHFORGE_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("BATCHFORGE_STATE_DIR") {
            b.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("BATCHFORGE_AZ_BINARY") {
            b.az_binary = v;
        }

        Ok(b)
    }

    /// Apply command line overrides.
    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(v) = overrides.resource_group {
            self.resource_group = v;
        }
        if let Some(v) = overrides.region {
            self.region = v;
        }
        if let Some(family) = overrides.os_family {
            if family != self.os_family && overrides.os_version.is_none() {
                // A version from the environment belongs to the previous family.
                self.os_version = None;
            }
            self.os_family = family;
        }
        if let Some(v) = overrides.os_version {
            self.os_version = Some(v);
        }
        if let Some(v) = overrides.gpu {
            self.gpu = v;
        }
        if let Some(v) = overrides.vm_size {
            self.vm_size = Some(v);
        }
        if let Some(v) = overrides.pool_id {
            self.pool_id = v;
        }
        if let Some(v) = overrides.node_count {
            self.node_count = v;
        }
        if let Some(v) = overrides.image_id {
            self.image_id = Some(v);
        }
        if let Some(v) = overrides.auto_register_providers {
            self.auto_register_providers = v;
        }
        if let Some(v) = overrides.state_dir {
            self.state_dir = v;
        }
        self
    }

    /// Set the GPU flag.
    pub fn gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    /// Set the base OS.
    pub fn os(mut self, family: OsFamily, version: impl Into<String>) -> Self {
        self.os_family = family;
        self.os_version = Some(version.into());
        self
    }

    /// Enable container build and preload with the given registry and image.
    pub fn container_build(mut self, registry: impl Into<String>, image: impl Into<String>) -> Self {
        self.build_container = true;
        self.registry = registry.into();
        self.container_image = image.into();
        self
    }

    /// Set the state directory.
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set the fixed polling interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.timeouts.poll_interval = interval;
        self
    }

    /// Replace all timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the attempt budget for retryable steps.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        let version = self
            .os_version
            .clone()
            .unwrap_or_else(|| self.os_family.default_version().to_string());
        if !self.os_family.supported_versions().contains(&version.as_str()) {
            return Err(ConfigError::Invalid(
                "BATCHFORGE_OS_VERSION",
                format!(
                    "{} {} is not supported (expected one of {})",
                    self.os_family,
                    version,
                    self.os_family.supported_versions().join(", ")
                ),
            ));
        }
        let os = OsImage {
            family: self.os_family,
            version,
        };

        validate_batch_account(&self.batch_account)?;
        validate_gallery_name(&self.gallery_name)?;
        if self.node_count == 0 {
            return Err(ConfigError::Invalid(
                "BATCHFORGE_NODE_COUNT",
                "must be at least 1".to_string(),
            ));
        }
        if self.timeouts.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "BATCHFORGE_POLL_INTERVAL_SECS",
                "must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "BATCHFORGE_MAX_ATTEMPTS",
                "must be at least 1".to_string(),
            ));
        }
        for (var, value) in [
            ("BATCHFORGE_RESOURCE_GROUP", &self.resource_group),
            ("BATCHFORGE_REGION", &self.region),
            ("BATCHFORGE_VM_NAME", &self.vm_name),
            ("BATCHFORGE_POOL_ID", &self.pool_id),
            ("BATCHFORGE_IMAGE_VERSION", &self.image_version),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(var));
            }
        }

        let container = if self.build_container {
            validate_registry_name(&self.registry)?;
            if self.container_image.trim().is_empty() {
                return Err(ConfigError::Missing("BATCHFORGE_CONTAINER_IMAGE"));
            }
            Some(ContainerBuild {
                registry: self.registry,
                image: self.container_image,
                dockerfile: self.dockerfile,
                context: self.build_context,
            })
        } else {
            None
        };

        let vm_size = self.vm_size.unwrap_or(if self.gpu {
            self.gpu_vm_size
        } else {
            self.cpu_vm_size
        });
        let image_definition = self.image_definition.unwrap_or_else(|| {
            format!(
                "batchforge-{}-{}",
                os.slug(),
                if self.gpu { "gpu" } else { "cpu" }
            )
        });

        Ok(Config {
            resource_group: self.resource_group,
            region: self.region,
            image_sku: image_definition.clone(),
            os,
            gpu: self.gpu,
            vm_size,
            vm_name: self.vm_name,
            admin_username: self.admin_username,
            gallery_name: self.gallery_name,
            image_definition,
            image_version: self.image_version,
            image_publisher: self.image_publisher,
            image_offer: self.image_offer,
            batch_account: self.batch_account,
            pool_id: self.pool_id,
            node_count: self.node_count,
            task_slots_per_node: self.task_slots_per_node,
            container,
            image_id_override: self.image_id,
            auto_register_providers: self.auto_register_providers,
            timeouts: self.timeouts,
            max_attempts: self.max_attempts,
            state_dir: self.state_dir,
            az_binary: self.az_binary,
        })
    }
}

fn validate_batch_account(name: &str) -> Result<(), ConfigError> {
    let ok = (3..=24).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(
            "BATCHFORGE_BATCH_ACCOUNT",
            format!(
                "'{}' must be 3-24 lowercase letters and digits",
                name
            ),
        ))
    }
}

fn validate_gallery_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(
            "BATCHFORGE_GALLERY",
            format!("'{}' may only contain letters, digits, '.' and '_'", name),
        ))
    }
}

fn validate_registry_name(name: &str) -> Result<(), ConfigError> {
    let ok = (5..=50).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphanumeric());
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(
            "BATCHFORGE_REGISTRY",
            format!("'{}' must be 5-50 letters and digits", name),
        ))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required value is missing or empty.
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    /// A value failed to parse or validate.
    #[error("Invalid {0}: {1}")]
    Invalid(&'static str, String),
}
