//! In-memory container runtime for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, ContainerSummary,
    HealthState, ImageBuild, RuntimeError,
};
use crate::resources::ResourceQuantity;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FailPoint {
    BuildImage,
    CreateNetwork,
    RunContainer,
    ListContainers,
    Inspect,
    Stats,
    UpdateLimits,
    RemoveContainer,
    RemoveNetwork,
}

#[derive(Debug, Clone)]
struct MemContainer {
    id: String,
    name: String,
    labels: BTreeMap<String, String>,
    status: ContainerStatus,
    health: Option<HealthState>,
    limits: ResourceQuantity,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MemoryState {
    containers: BTreeMap<String, MemContainer>,
    networks: BTreeMap<String, BTreeMap<String, String>>,
    failures: HashSet<FailPoint>,
    initial_status: ContainerStatus,
    initial_health: HealthState,
    usage: ResourceQuantity,
    updates: Vec<(String, ResourceQuantity)>,
    images: Vec<String>,
    run_delay: Option<Duration>,
    next_id: u64,
}

/// Container runtime that keeps every object in a map.
///
/// New containers start `running`; those with a health command start
/// `healthy` unless configured otherwise.
#[derive(Debug)]
pub(crate) struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

fn matches_label(labels: &BTreeMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                containers: BTreeMap::new(),
                networks: BTreeMap::new(),
                failures: HashSet::new(),
                initial_status: ContainerStatus::Running,
                initial_health: HealthState::Healthy,
                usage: ResourceQuantity::ZERO,
                updates: Vec::new(),
                images: Vec::new(),
                run_delay: None,
                next_id: 0,
            }),
        }
    }

    pub fn fail(&self, point: FailPoint) {
        self.state.lock().unwrap().failures.insert(point);
    }

    pub fn recover(&self, point: FailPoint) {
        self.state.lock().unwrap().failures.remove(&point);
    }

    pub fn set_initial_status(&self, status: ContainerStatus) {
        self.state.lock().unwrap().initial_status = status;
    }

    pub fn set_initial_health(&self, health: HealthState) {
        self.state.lock().unwrap().initial_health = health;
    }

    pub fn set_usage(&self, usage: ResourceQuantity) {
        self.state.lock().unwrap().usage = usage;
    }

    pub fn set_run_delay(&self, delay: Duration) {
        self.state.lock().unwrap().run_delay = Some(delay);
    }

    pub fn set_health(&self, container: &str, health: HealthState) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container) {
            c.health = Some(health);
        }
    }

    /// Adds a container directly, bypassing `run_container`.
    pub fn insert_container(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        status: ContainerStatus,
        health: Option<HealthState>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        state.containers.insert(
            name.to_string(),
            MemContainer {
                id,
                name: name.to_string(),
                labels,
                status,
                health,
                limits: ResourceQuantity::ZERO,
                started_at: Utc::now(),
            },
        );
    }

    /// Adds a network directly, bypassing `create_network`.
    pub fn insert_network(&self, name: &str, labels: BTreeMap<String, String>) {
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(name.to_string(), labels);
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.keys().cloned().collect()
    }

    pub fn container_limits(&self, name: &str) -> Option<ResourceQuantity> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.limits)
    }

    pub fn updates(&self) -> Vec<(String, ResourceQuantity)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn images_built(&self) -> Vec<String> {
        self.state.lock().unwrap().images.clone()
    }

    fn check(&self, point: FailPoint, operation: &'static str) -> Result<(), RuntimeError> {
        if self.state.lock().unwrap().failures.contains(&point) {
            return Err(RuntimeError::failed(operation, "injected failure"));
        }
        Ok(())
    }

    fn find<'a>(state: &'a mut MemoryState, container: &str) -> Option<&'a mut MemContainer> {
        let key = state
            .containers
            .iter()
            .find(|(name, c)| name.as_str() == container || c.id == container)
            .map(|(name, _)| name.clone())?;
        state.containers.get_mut(&key)
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn build_image(&self, build: &ImageBuild) -> Result<(), RuntimeError> {
        self.check(FailPoint::BuildImage, "build image")?;
        self.state.lock().unwrap().images.push(build.tag.clone());
        Ok(())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        self.check(FailPoint::CreateNetwork, "create network")?;
        self.state
            .lock()
            .unwrap()
            .networks
            .entry(name.to_string())
            .or_insert_with(|| labels.clone());
        Ok(name.to_string())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let delay = self.state.lock().unwrap().run_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(FailPoint::RunContainer, "create container")?;

        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::failed(
                "create container",
                format!("name {} already in use", spec.name),
            ));
        }
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        let container = MemContainer {
            id: id.clone(),
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            status: state.initial_status,
            health: spec.health_command.as_ref().map(|_| state.initial_health),
            limits: spec.limits,
            started_at: Utc::now(),
        };
        state.containers.insert(spec.name.clone(), container);
        Ok(id)
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.check(FailPoint::ListContainers, "list containers")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| matches_label(&c.labels, label))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                status: c.status,
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError> {
        self.check(FailPoint::Inspect, "inspect container")?;
        let mut state = self.state.lock().unwrap();
        let c = Self::find(&mut state, container)
            .ok_or_else(|| RuntimeError::not_found("container", container))?;
        Ok(ContainerState {
            status: c.status,
            health: c.health,
            started_at: Some(c.started_at),
        })
    }

    async fn stats(&self, container: &str) -> Result<ResourceQuantity, RuntimeError> {
        self.check(FailPoint::Stats, "container stats")?;
        let mut state = self.state.lock().unwrap();
        let usage = state.usage;
        Self::find(&mut state, container)
            .map(|_| usage)
            .ok_or_else(|| RuntimeError::not_found("container", container))
    }

    async fn update_limits(
        &self,
        container: &str,
        limits: &ResourceQuantity,
    ) -> Result<(), RuntimeError> {
        self.check(FailPoint::UpdateLimits, "update container")?;
        let mut state = self.state.lock().unwrap();
        let c = Self::find(&mut state, container)
            .ok_or_else(|| RuntimeError::not_found("container", container))?;
        c.limits = *limits;
        let name = c.name.clone();
        state.updates.push((name, *limits));
        Ok(())
    }

    async fn stop(&self, container: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let c = Self::find(&mut state, container)
            .ok_or_else(|| RuntimeError::not_found("container", container))?;
        c.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn remove(&self, container: &str, force: bool) -> Result<(), RuntimeError> {
        self.check(FailPoint::RemoveContainer, "remove container")?;
        let mut state = self.state.lock().unwrap();
        let c = Self::find(&mut state, container)
            .ok_or_else(|| RuntimeError::not_found("container", container))?;
        if c.status == ContainerStatus::Running && !force {
            return Err(RuntimeError::failed(
                "remove container",
                "container is running",
            ));
        }
        let name = c.name.clone();
        state.containers.remove(&name);
        Ok(())
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .networks
            .iter()
            .filter(|(_, labels)| matches_label(labels, label))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn remove_network(&self, network: &str) -> Result<(), RuntimeError> {
        self.check(FailPoint::RemoveNetwork, "remove network")?;
        self.state
            .lock()
            .unwrap()
            .networks
            .remove(network)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::not_found("network", network))
    }
}
