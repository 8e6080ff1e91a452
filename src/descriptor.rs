//! Per-sandbox descriptor persisted in the working directory.
//!
//! The descriptor records what was provisioned for a sandbox (network,
//! labels, services and their limits) as `<workdir>/<id>/sandbox.toml`.
//! The directory is removed again during teardown.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::RuntimeConfig;
use crate::resources::ResourceQuantity;
use crate::runtime::network::{container_name, network_name, sandbox_labels};
use crate::runtime::ContainerSpec;

const DESCRIPTOR_FILE: &str = "sandbox.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub port: u16,
    #[serde(default)]
    pub health_command: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: ResourceQuantity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SandboxDescriptor {
    pub sandbox_id: String,
    pub network: String,
    /// Public endpoint assigned by the gateway
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// Address other containers on the sandbox network use to reach its API.
pub(crate) fn internal_endpoint(sandbox_id: &str, runtime: &RuntimeConfig) -> String {
    format!(
        "http://{}:{}",
        container_name(sandbox_id, &runtime.service),
        runtime.port
    )
}

impl SandboxDescriptor {
    /// Builds the descriptor for a new sandbox.
    ///
    /// The sandbox's environment is passed to its service together with
    /// `SANDBOX_ID` and `SANDBOX_TOOLS`; the whole reservation becomes the
    /// service's initial limits.
    pub fn render(
        sandbox_id: &str,
        runtime: &RuntimeConfig,
        limits: ResourceQuantity,
        tools: &[String],
        environment: &BTreeMap<String, String>,
        endpoint: &str,
    ) -> Self {
        let mut env = environment.clone();
        env.insert("SANDBOX_ID".to_string(), sandbox_id.to_string());
        env.insert("SANDBOX_TOOLS".to_string(), tools.join(","));
        env.insert("PORT".to_string(), runtime.port.to_string());

        Self {
            sandbox_id: sandbox_id.to_string(),
            network: network_name(sandbox_id),
            endpoint: endpoint.to_string(),
            created_at: Utc::now(),
            tools: tools.to_vec(),
            labels: sandbox_labels(sandbox_id),
            services: vec![ServiceSpec {
                name: runtime.service.clone(),
                image: runtime.image.clone(),
                port: runtime.port,
                health_command: runtime.health_command.clone(),
                env,
                limits,
            }],
        }
    }

    /// Directory holding everything written for `sandbox_id`.
    ///
    /// The id must be one plain path component, so the directory is always
    /// a direct child of `workdir`.
    pub fn dir(workdir: &Path, sandbox_id: &str) -> Result<PathBuf> {
        let mut components = Path::new(sandbox_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == sandbox_id => {
                Ok(workdir.join(sandbox_id))
            }
            _ => bail!("Sandbox id {sandbox_id:?} is not a plain directory name"),
        }
    }

    pub fn path(workdir: &Path, sandbox_id: &str) -> Result<PathBuf> {
        Ok(Self::dir(workdir, sandbox_id)?.join(DESCRIPTOR_FILE))
    }

    /// Container specs for every service, in order.
    ///
    /// `secrets` are added to each service's environment but never
    /// written to disk.
    pub fn container_specs(&self, secrets: &BTreeMap<String, String>) -> Vec<ContainerSpec> {
        self.services
            .iter()
            .map(|service| {
                let mut env = service.env.clone();
                env.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
                ContainerSpec {
                    name: container_name(&self.sandbox_id, &service.name),
                    image: service.image.clone(),
                    network: Some(self.network.clone()),
                    ports: vec![service.port],
                    env,
                    labels: self.labels.clone(),
                    limits: service.limits,
                    health_command: service.health_command.clone(),
                }
            })
            .collect()
    }

    /// Load the descriptor for `sandbox_id` if it exists
    pub fn load(workdir: &Path, sandbox_id: &str) -> Result<Option<Self>> {
        let path = Self::path(workdir, sandbox_id)?;

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read descriptor: {}", path.display()))?;

        let descriptor: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse descriptor: {}", path.display()))?;

        Ok(Some(descriptor))
    }

    /// Save the descriptor, creating the sandbox directory if needed
    pub fn save(&self, workdir: &Path) -> Result<PathBuf> {
        let path = Self::path(workdir, &self.sandbox_id)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize descriptor")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write descriptor: {}", path.display()))?;

        Ok(path)
    }

    /// Remove the sandbox directory. Returns false if it did not exist.
    pub fn delete(workdir: &Path, sandbox_id: &str) -> Result<bool> {
        let dir = Self::dir(workdir, sandbox_id)?;

        if !dir.exists() {
            return Ok(false);
        }

        fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove directory: {}", dir.display()))?;

        Ok(true)
    }
}
