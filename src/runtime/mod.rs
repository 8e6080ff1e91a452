//! Container runtime capability.
//!
//! The orchestrator only ever talks to containers through the
//! [`ContainerRuntime`] trait. [`DockerRuntime`] implements it on top of
//! the Docker API; tests use an in-memory implementation.

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod memory;
pub(crate) mod network;

pub(crate) use docker::DockerRuntime;
pub(crate) use error::ignore_not_found;
pub use error::RuntimeError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::resources::ResourceQuantity;

/// Everything needed to start one container.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Network to attach to, if any.
    pub network: Option<String>,
    /// Container ports to expose.
    pub ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Enforced CPU/memory limits; zero dimensions are left unlimited.
    pub limits: ResourceQuantity,
    /// Shell command used as the container health check.
    pub health_command: Option<String>,
}

/// An image to build from a local context directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageBuild {
    pub context: PathBuf,
    pub dockerfile: String,
    pub tag: String,
}

/// Lifecycle state of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Parses Docker's lowercase state string.
    pub fn parse(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Health check state of a container that declares one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One entry of a container listing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
}

/// Detailed state from inspecting a container.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContainerState {
    pub status: ContainerStatus,
    /// `None` when the container declares no health check.
    pub health: Option<HealthState>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Narrow capability over a container backend.
///
/// Label filters use the `key=value` form produced by [`network`].
/// Listings include stopped containers.
#[async_trait]
pub(crate) trait ContainerRuntime: Send + Sync {
    /// Builds an image from a local context.
    async fn build_image(&self, build: &ImageBuild) -> Result<(), RuntimeError>;

    /// Creates a network, reusing it if it already exists. Returns its name.
    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError>;

    /// Creates and starts a container. Returns its id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Lists containers (running or not) carrying `label`.
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Inspects one container.
    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError>;

    /// Samples current resource consumption of one container.
    async fn stats(&self, container: &str) -> Result<ResourceQuantity, RuntimeError>;

    /// Applies new CPU/memory limits to a running container.
    async fn update_limits(
        &self,
        container: &str,
        limits: &ResourceQuantity,
    ) -> Result<(), RuntimeError>;

    /// Stops a container, killing it once `timeout` elapses.
    async fn stop(&self, container: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Removes a container.
    async fn remove(&self, container: &str, force: bool) -> Result<(), RuntimeError>;

    /// Lists networks carrying `label`. Returns their names.
    async fn list_networks(&self, label: &str) -> Result<Vec<String>, RuntimeError>;

    /// Removes a network.
    async fn remove_network(&self, network: &str) -> Result<(), RuntimeError>;
}
