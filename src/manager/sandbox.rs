//! Sandbox records and the views handed out to callers.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::SandboxEntry;
use crate::resources::{ResourceQuantity, ResourceUsageHistory, UsageSample};
use crate::runtime::{ContainerStatus, HealthState};

/// Lifecycle state of a sandbox.
///
/// `Provisioning -> Running -> Stopping -> Stopped`. `Failed` is reached
/// from `Provisioning` while a failed create is rolled back, from `Running`
/// when a container exits or disappears, and from `Stopping` when teardown
/// is incomplete. Failed sandboxes are deleted again by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SandboxStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sandbox {
    pub id: String,
    pub compute_resources: ResourceQuantity,
    pub tools: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub status: SandboxStatus,
    pub network_id: Option<String>,
    pub endpoint_url: Option<String>,
}

/// A request to provision one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CreateRequest {
    pub sandbox_id: String,
    pub compute_resources: ResourceQuantity,
    pub tools: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

impl CreateRequest {
    pub fn new(sandbox_id: impl Into<String>, compute_resources: ResourceQuantity) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            compute_resources,
            tools: Vec::new(),
            environment: BTreeMap::new(),
        }
    }
}

impl From<&SandboxEntry> for CreateRequest {
    fn from(entry: &SandboxEntry) -> Self {
        let sandbox_id = entry
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        Self {
            sandbox_id,
            compute_resources: entry.resources,
            tools: entry.tools.clone(),
            environment: entry.environment.clone(),
        }
    }
}

/// How clients reach a running sandbox.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct SandboxEndpoint {
    pub sandbox_id: String,
    pub url: String,
    pub api_key: String,
}

impl fmt::Debug for SandboxEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxEndpoint")
            .field("sandbox_id", &self.sandbox_id)
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Manager-side bookkeeping for one sandbox.
#[derive(Debug)]
pub(crate) struct SandboxRecord {
    pub sandbox: Sandbox,
    /// Taken exactly once when the reservation is returned to the ledger.
    pub reservation: Option<ResourceQuantity>,
    /// Limits currently applied to the sandbox's containers.
    pub limits: ResourceQuantity,
    pub last_activity: DateTime<Utc>,
    pub history: ResourceUsageHistory,
}

impl SandboxRecord {
    pub fn provisioning(request: &CreateRequest) -> Self {
        Self {
            sandbox: Sandbox {
                id: request.sandbox_id.clone(),
                compute_resources: request.compute_resources,
                tools: request.tools.clone(),
                environment: request.environment.clone(),
                status: SandboxStatus::Provisioning,
                network_id: None,
                endpoint_url: None,
            },
            reservation: Some(request.compute_resources),
            limits: request.compute_resources,
            last_activity: Utc::now(),
            history: ResourceUsageHistory::new(),
        }
    }

    pub fn status(&self) -> SandboxStatus {
        self.sandbox.status
    }

    pub fn set_status(&mut self, status: SandboxStatus) {
        self.sandbox.status = status;
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> std::time::Duration {
        (Utc::now() - self.last_activity).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContainerReport {
    pub name: String,
    pub status: ContainerStatus,
    pub health: Option<HealthState>,
}

/// Point-in-time view of one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StatusReport {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    pub containers: Vec<ContainerReport>,
    pub endpoint: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub reservation: Option<ResourceQuantity>,
    pub limits: ResourceQuantity,
    pub max_usage: ResourceQuantity,
    pub latest_usage: Option<UsageSample>,
}
