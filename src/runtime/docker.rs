use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StatsOptions, StopContainerOptions,
    UpdateContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::BuildImageOptions;
use bollard::models::{ContainerStateStatusEnum, HealthConfig, HealthStatusEnum, HostConfig};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tar::Builder;
use tracing::{debug, info};

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, ContainerSummary,
    HealthState, ImageBuild, RuntimeError,
};
use crate::resources::ResourceQuantity;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// CFS scheduler period used when translating cores into a quota.
const CPU_PERIOD_US: i64 = 100_000;

/// Health check cadence applied to containers that declare a command.
const HEALTH_INTERVAL: Duration = Duration::from_secs(2);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_RETRIES: i64 = 3;

/// Container runtime backed by the local Docker daemon.
pub(crate) struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon and verifies it responds.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            RuntimeError::unavailable(format!("Failed to connect to Docker: {e}"))
        })?;

        docker.ping().await.map_err(|e| {
            RuntimeError::unavailable(format!("Cannot ping Docker daemon: {e}"))
        })?;

        Ok(Self { docker })
    }
}

/// Maps a Docker API error, keeping 404 distinguishable.
fn map_err(operation: &'static str, kind: &'static str, name: &str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::not_found(kind, name),
        other => RuntimeError::failed(operation, other.to_string()),
    }
}

fn label_filter(label: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![label.to_string()])])
}

fn gb_to_bytes(gb: f64) -> i64 {
    (gb * BYTES_PER_GB) as i64
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Docker reports `0001-01-01T00:00:00Z` for containers that never started.
fn parse_started_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?.with_timezone(&Utc);
    (parsed.year() > 1970).then_some(parsed)
}

/// Cumulative CPU counters from one stats reading, in nanoseconds.
#[derive(Debug, Clone, Copy)]
struct CpuReading {
    container: u64,
    system: u64,
}

/// Cores used by a container between two readings.
///
/// Without a previous system reading there is no interval to measure, and
/// the counters alone would give lifetime usage, so that reads as zero.
fn cpu_cores(current: CpuReading, previous: CpuReading, online_cpus: u64) -> f64 {
    if previous.system == 0 {
        return 0.0;
    }
    let cpu_delta = current.container.saturating_sub(previous.container);
    let system_delta = current.system.saturating_sub(previous.system);
    if system_delta == 0 || cpu_delta == 0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * online_cpus.max(1) as f64
}

fn build_container_config(spec: &ContainerSpec) -> ContainerConfig<String> {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .iter()
        .map(|p| (format!("{p}/tcp"), HashMap::new()))
        .collect();

    let healthcheck = spec.health_command.as_ref().map(|cmd| HealthConfig {
        test: Some(vec!["CMD-SHELL".to_string(), cmd.clone()]),
        interval: Some(nanos(HEALTH_INTERVAL)),
        timeout: Some(nanos(HEALTH_TIMEOUT)),
        retries: Some(HEALTH_RETRIES),
        ..Default::default()
    });

    let limits = &spec.limits;
    let host_config = HostConfig {
        network_mode: spec.network.clone(),
        memory: (limits.ram_gb > 0.0).then(|| gb_to_bytes(limits.ram_gb)),
        nano_cpus: (limits.cpu_cores > 0.0).then(|| (limits.cpu_cores * 1_000_000_000.0) as i64),
        ..Default::default()
    };

    ContainerConfig {
        image: Some(spec.image.clone()),
        env: Some(env),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        healthcheck,
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn tar_context(context: &Path) -> std::io::Result<Vec<u8>> {
    let mut tar_buf = Vec::new();
    {
        let mut tar = Builder::new(&mut tar_buf);
        tar.append_dir_all(".", context)?;
        tar.finish()?;
    }
    Ok(tar_buf)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, build: &ImageBuild) -> Result<(), RuntimeError> {
        info!(tag = %build.tag, context = %build.context.display(), "Building image");

        let context = build.context.clone();
        let tar_buf = tokio::task::spawn_blocking(move || tar_context(&context))
            .await
            .map_err(|e| RuntimeError::failed("build image", e.to_string()))?
            .map_err(|e| {
                RuntimeError::failed("build image", format!("Failed to create tarball: {e}"))
            })?;

        let options = BuildImageOptions {
            dockerfile: build.dockerfile.clone(),
            t: build.tag.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(tar_buf)));

        while let Some(chunk) = stream.next().await {
            let output = chunk.map_err(|e| RuntimeError::failed("build image", e.to_string()))?;
            if let Some(error) = output.error {
                return Err(RuntimeError::failed("build image", error));
            }
            if let Some(text) = output.stream {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    debug!("build: {}", trimmed);
                }
            }
        }

        Ok(())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            labels: labels.clone().into_iter().collect(),
            ..Default::default()
        };

        match self.docker.create_network(options).await {
            Ok(_) => {
                debug!(network = name, "Created network");
                Ok(name.to_string())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(network = name, "Network already exists, reusing");
                Ok(name.to_string())
            }
            Err(e) => Err(map_err("create network", "network", name, e)),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        debug!(container = %spec.name, image = %spec.image, "Creating container");

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                build_container_config(spec),
            )
            .await
            .map_err(|e| map_err("create container", "image", &spec.image, e))?;

        self.docker
            .start_container::<String>(&response.id, None)
            .await
            .map_err(|e| map_err("start container", "container", &spec.name, e))?;

        Ok(response.id)
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: label_filter(label),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::failed("list containers", e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map_or_else(|| id.clone(), |n| n.trim_start_matches('/').to_string());
                Some(ContainerSummary {
                    name,
                    status: c
                        .state
                        .as_deref()
                        .map_or(ContainerStatus::Unknown, ContainerStatus::parse),
                    labels: c.labels.unwrap_or_default().into_iter().collect(),
                    id,
                })
            })
            .collect())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError> {
        let info = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err("inspect container", "container", container, e))?;

        let state = info.state.unwrap_or_default();

        let status = match state.status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
            Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
            Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        };

        let health = state
            .health
            .and_then(|h| h.status)
            .and_then(|s| match s {
                HealthStatusEnum::STARTING => Some(HealthState::Starting),
                HealthStatusEnum::HEALTHY => Some(HealthState::Healthy),
                HealthStatusEnum::UNHEALTHY => Some(HealthState::Unhealthy),
                _ => None,
            });

        Ok(ContainerState {
            status,
            health,
            started_at: parse_started_at(state.started_at.as_deref()),
        })
    }

    async fn stats(&self, container: &str) -> Result<ResourceQuantity, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = self.docker.stats(container, Some(options));

        match stream.next().await {
            Some(Ok(stats)) => {
                let cpu_cores = cpu_cores(
                    CpuReading {
                        container: stats.cpu_stats.cpu_usage.total_usage,
                        system: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
                    },
                    CpuReading {
                        container: stats.precpu_stats.cpu_usage.total_usage,
                        system: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
                    },
                    stats.cpu_stats.online_cpus.unwrap_or(1),
                );
                let ram_gb = stats.memory_stats.usage.unwrap_or(0) as f64 / BYTES_PER_GB;

                Ok(ResourceQuantity::compute(cpu_cores, ram_gb))
            }
            Some(Err(e)) => Err(map_err("container stats", "container", container, e)),
            None => Err(RuntimeError::failed(
                "container stats",
                format!("no stats returned for {container}"),
            )),
        }
    }

    async fn update_limits(
        &self,
        container: &str,
        limits: &ResourceQuantity,
    ) -> Result<(), RuntimeError> {
        let memory = (limits.ram_gb > 0.0).then(|| gb_to_bytes(limits.ram_gb));
        let cpu = limits.cpu_cores > 0.0;

        let options = UpdateContainerOptions::<String> {
            memory,
            // Unlimited swap so lowering memory never trips the swap >= memory check.
            memory_swap: memory.map(|_| -1),
            cpu_period: cpu.then_some(CPU_PERIOD_US),
            cpu_quota: cpu.then(|| (limits.cpu_cores * CPU_PERIOD_US as f64) as i64),
            ..Default::default()
        };

        self.docker
            .update_container(container, options)
            .await
            .map_err(|e| map_err("update container", "container", container, e))
    }

    async fn stop(&self, container: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX),
        };

        match self.docker.stop_container(container, Some(options)).await {
            // 304: already stopped
            Ok(())
            | Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err("stop container", "container", container, e)),
        }
    }

    async fn remove(&self, container: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err("remove container", "container", container, e))
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: label_filter(label),
            }))
            .await
            .map_err(|e| RuntimeError::failed("list networks", e.to_string()))?;

        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn remove_network(&self, network: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(network)
            .await
            .map_err(|e| map_err("remove network", "network", network, e))
    }
}
