use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resources::ResourceQuantity;
use crate::retry::RetryPolicy;

pub(crate) const CONFIG_FILE: &str = "sandboxd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Total resources the orchestrator may hand out
    #[serde(default = "default_capacity")]
    pub capacity: ResourceQuantity,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Sandboxes created when the daemon starts.
    #[serde(default, rename = "sandbox")]
    pub sandboxes: Vec<SandboxEntry>,
    /// Databases started before any sandbox and stopped after all of them.
    #[serde(default, rename = "database")]
    pub databases: Vec<DatabaseEntry>,
}

/// Background loops and working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory holding one subdirectory per sandbox
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Sandboxes idle longer than this are reclaimed
    #[serde(default = "default_inactivity_threshold")]
    pub inactivity_threshold_secs: u64,

    /// How often the inactivity sweep runs
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// How often container usage is sampled
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// How often container limits are right-sized
    #[serde(default = "default_adjust_interval")]
    pub adjust_interval_secs: u64,

    /// Headroom applied to observed peak usage when right-sizing
    #[serde(default = "default_adjust_factor")]
    pub adjust_factor: f64,

    /// CPU cores above which a usage sample counts as activity
    #[serde(default = "default_activity_cpu_threshold")]
    pub activity_cpu_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            inactivity_threshold_secs: default_inactivity_threshold(),
            cleanup_interval_secs: default_cleanup_interval(),
            monitor_interval_secs: default_monitor_interval(),
            adjust_interval_secs: default_adjust_interval(),
            adjust_factor: default_adjust_factor(),
            activity_cpu_threshold: default_activity_cpu_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the gateway registration API
    #[serde(default = "default_gateway_url")]
    pub url: String,

    #[serde(default = "default_gateway_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            request_timeout_secs: default_gateway_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Budget for the whole sandbox to become healthy
    #[serde(default = "default_health_timeout")]
    pub global_timeout_secs: u64,

    /// Budget for each container, measured from its start
    #[serde(default = "default_container_health_timeout")]
    pub container_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            global_timeout_secs: default_health_timeout(),
            container_timeout_secs: default_container_health_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl HealthConfig {
    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global_timeout_secs)
    }

    pub fn container_timeout(&self) -> Duration {
        Duration::from_secs(self.container_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_container_start")]
    pub container_start_secs: u64,

    /// Grace period before a stopping container is killed
    #[serde(default = "default_container_stop")]
    pub container_stop_secs: u64,

    /// Budget for tearing down one sandbox
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_secs: u64,

    #[serde(default = "default_database_stop")]
    pub database_stop_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            container_start_secs: default_container_start(),
            container_stop_secs: default_container_stop(),
            cleanup_secs: default_cleanup_timeout(),
            database_stop_secs: default_database_stop(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.factor,
        }
    }
}

/// The service every sandbox runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Service name, used in container names
    #[serde(default = "default_service_name")]
    pub service: String,

    /// Docker image to run
    #[serde(default = "default_image")]
    pub image: String,

    /// Build the image from this directory before the first sandbox starts
    #[serde(default)]
    pub build_context: Option<PathBuf>,

    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,

    /// Port the tool API listens on inside the container
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shell command used as the container health check
    #[serde(default = "default_health_command")]
    pub health_command: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service: default_service_name(),
            image: default_image(),
            build_context: None,
            dockerfile: default_dockerfile(),
            port: default_port(),
            health_command: default_health_command(),
        }
    }
}

/// A sandbox to create at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxEntry {
    /// Generated when omitted
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub resources: ResourceQuantity,

    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Entries sharing a group are created all or nothing
    #[serde(default)]
    pub group: Option<String>,
}

/// A dependent database run as a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,

    pub image: String,

    /// Container ports to publish
    #[serde(default)]
    pub ports: Vec<u16>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Shell command used as the container health check
    #[serde(default)]
    pub health_command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            capacity: default_capacity(),
            gateway: GatewayConfig::default(),
            health: HealthConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            runtime: RuntimeConfig::default(),
            sandboxes: Vec::new(),
            databases: Vec::new(),
        }
    }
}

// Default value functions
fn default_workdir() -> PathBuf {
    dirs::data_local_dir().map_or_else(
        || PathBuf::from(".sandboxd/sandboxes"),
        |d| d.join("sandboxd").join("sandboxes"),
    )
}

fn default_inactivity_threshold() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_adjust_interval() -> u64 {
    60
}

fn default_adjust_factor() -> f64 {
    1.3
}

fn default_activity_cpu_threshold() -> f64 {
    0.05
}

fn default_capacity() -> ResourceQuantity {
    ResourceQuantity {
        cpu_cores: 8.0,
        ram_gb: 32.0,
        disk_gb: 200.0,
        memory_bandwidth_gbps: 50.0,
        network_bandwidth_mbps: 1000.0,
    }
}

fn default_gateway_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_gateway_timeout() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    30
}

fn default_container_health_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_container_start() -> u64 {
    60
}

fn default_container_stop() -> u64 {
    10
}

fn default_cleanup_timeout() -> u64 {
    60
}

fn default_database_stop() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_service_name() -> String {
    "api".to_string()
}

fn default_image() -> String {
    "sandbox-api:latest".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_port() -> u16 {
    8000
}

#[allow(clippy::unnecessary_wraps)]
fn default_health_command() -> Option<String> {
    Some("curl -fsS http://localhost:8000/health || exit 1".to_string())
}

impl Config {
    /// Load configuration from `path`, using defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject values the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_valid() {
            bail!("capacity must be finite and non-negative");
        }
        if !(self.orchestrator.adjust_factor.is_finite() && self.orchestrator.adjust_factor > 0.0)
        {
            bail!("orchestrator.adjust_factor must be positive");
        }
        if self.health.poll_interval_ms == 0 {
            bail!("health.poll_interval_ms must be greater than zero");
        }
        for (interval, name) in [
            (self.orchestrator.cleanup_interval_secs, "cleanup_interval_secs"),
            (self.orchestrator.monitor_interval_secs, "monitor_interval_secs"),
            (self.orchestrator.adjust_interval_secs, "adjust_interval_secs"),
        ] {
            if interval == 0 {
                bail!("orchestrator.{name} must be greater than zero");
            }
        }
        for entry in &self.sandboxes {
            if !entry.resources.is_valid() {
                bail!(
                    "sandbox {} has invalid resources",
                    entry.id.as_deref().unwrap_or("<unnamed>")
                );
            }
        }
        let mut names = std::collections::HashSet::new();
        for db in &self.databases {
            if db.name.is_empty()
                || !db
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                bail!("database name {:?} must be alphanumeric, '-' or '_'", db.name);
            }
            if !names.insert(db.name.as_str()) {
                bail!("database {} is listed twice", db.name);
            }
        }
        Ok(())
    }
}
