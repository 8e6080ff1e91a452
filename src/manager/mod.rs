//! Sandbox lifecycle orchestration.
//!
//! [`SandboxManager`] ties the ledger, runtime, gateway, health monitor and
//! cleaner together. A sandbox is only ever in the table while its
//! reservation is held, and every per-sandbox operation runs under that
//! sandbox's lock.

mod group;
mod sandbox;
mod usage;

pub(crate) use sandbox::{ContainerReport, CreateRequest, SandboxEndpoint, SandboxStatus, StatusReport};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanerSettings, ResourceCleaner, SweepTarget, TeardownPlan};
use crate::config::{Config, HealthConfig, RuntimeConfig};
use crate::database::DatabaseLifecycle;
use crate::descriptor::{internal_endpoint, SandboxDescriptor};
use crate::error::{CleanupError, ProvisioningCause, ProvisioningError, SandboxError};
use crate::gateway::{GatewayClient, GatewayRegistration};
use crate::health::HealthMonitor;
use crate::locks::LockTable;
use crate::resources::{LedgerSnapshot, ResourceLedger, ResourceQuantity, UsageSample};
use crate::retry::RetryPolicy;
use crate::runtime::network::{sandbox_filter, validate_sandbox_id};
use crate::runtime::{ContainerRuntime, ImageBuild, RuntimeError};
use sandbox::SandboxRecord;

/// Environment variable carrying the gateway-issued key into the sandbox.
const API_KEY_ENV: &str = "SANDBOX_API_KEY";

/// Tunables for the manager, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub(crate) struct ManagerSettings {
    pub workdir: PathBuf,
    pub runtime: RuntimeConfig,
    pub health: HealthConfig,
    pub container_start_timeout: Duration,
    pub container_stop_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub database_stop_timeout: Duration,
    pub activity_cpu_threshold: f64,
    pub retry: RetryPolicy,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workdir: config.orchestrator.workdir.clone(),
            runtime: config.runtime.clone(),
            health: config.health.clone(),
            container_start_timeout: Duration::from_secs(config.timeouts.container_start_secs),
            container_stop_timeout: Duration::from_secs(config.timeouts.container_stop_secs),
            cleanup_timeout: Duration::from_secs(config.timeouts.cleanup_secs),
            database_stop_timeout: Duration::from_secs(config.timeouts.database_stop_secs),
            activity_cpu_threshold: config.orchestrator.activity_cpu_threshold,
            retry: config.retry.policy(),
        }
    }
}

/// Intervals for the periodic background loops.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackgroundSchedule {
    pub sweep_interval: Duration,
    pub inactivity_threshold: Duration,
    pub monitor_interval: Duration,
    pub adjust_interval: Duration,
    pub adjust_factor: f64,
}

impl BackgroundSchedule {
    pub fn from_config(config: &Config) -> Self {
        let o = &config.orchestrator;
        Self {
            sweep_interval: Duration::from_secs(o.cleanup_interval_secs),
            inactivity_threshold: Duration::from_secs(o.inactivity_threshold_secs),
            monitor_interval: Duration::from_secs(o.monitor_interval_secs),
            adjust_interval: Duration::from_secs(o.adjust_interval_secs),
            adjust_factor: o.adjust_factor,
        }
    }
}

pub(crate) struct SandboxManager {
    ledger: ResourceLedger,
    locks: Arc<LockTable>,
    sandboxes: RwLock<HashMap<String, SandboxRecord>>,
    runtime: Arc<dyn ContainerRuntime>,
    gateway: Arc<dyn GatewayClient>,
    cleaner: Arc<ResourceCleaner>,
    health: HealthMonitor,
    image: OnceCell<()>,
    databases: Vec<Arc<dyn DatabaseLifecycle>>,
    started_databases: Mutex<Vec<Arc<dyn DatabaseLifecycle>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    settings: ManagerSettings,
}

impl SandboxManager {
    pub fn new(
        settings: ManagerSettings,
        capacity: ResourceQuantity,
        runtime: Arc<dyn ContainerRuntime>,
        gateway: Arc<dyn GatewayClient>,
    ) -> Self {
        let locks = Arc::new(LockTable::new());
        let cleaner = Arc::new(ResourceCleaner::new(
            Arc::clone(&runtime),
            Arc::clone(&gateway),
            Arc::clone(&locks),
            CleanerSettings {
                workdir: settings.workdir.clone(),
                stop_timeout: settings.container_stop_timeout,
                database_stop_timeout: settings.database_stop_timeout,
                retry: settings.retry,
            },
        ));
        let health = HealthMonitor::new(Arc::clone(&runtime), settings.health.poll_interval());

        Self {
            ledger: ResourceLedger::new(capacity),
            locks,
            sandboxes: RwLock::new(HashMap::new()),
            runtime,
            gateway,
            cleaner,
            health,
            image: OnceCell::new(),
            databases: Vec::new(),
            started_databases: Mutex::new(Vec::new()),
            tasks: StdMutex::new(Vec::new()),
            settings,
        }
    }

    /// Registers databases started by [`start_databases`](Self::start_databases).
    #[must_use]
    pub fn with_databases(mut self, databases: Vec<Arc<dyn DatabaseLifecycle>>) -> Self {
        self.databases = databases;
        self
    }

    #[cfg(test)]
    pub fn cleaner(&self) -> Arc<ResourceCleaner> {
        Arc::clone(&self.cleaner)
    }

    pub async fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot().await
    }

    /// Admits, provisions and health-checks a new sandbox.
    ///
    /// Capacity is reserved before anything else happens, so a request that
    /// does not fit fails with a resource error and no side effects. Any
    /// failure after admission is rolled back completely: containers,
    /// network, gateway registration, files and the reservation.
    pub async fn create_sandbox(
        &self,
        request: CreateRequest,
    ) -> Result<SandboxEndpoint, SandboxError> {
        validate_sandbox_id(&request.sandbox_id)?;
        let id = request.sandbox_id.clone();

        self.ledger.try_reserve(request.compute_resources).await?;

        let guard = self.locks.acquire(&id).await;
        {
            let mut sandboxes = self.sandboxes.write().await;
            if sandboxes.contains_key(&id) {
                drop(sandboxes);
                drop(guard);
                self.ledger.release(request.compute_resources).await;
                return Err(SandboxError::AlreadyExists { id });
            }
            sandboxes.insert(id.clone(), SandboxRecord::provisioning(&request));
        }

        info!(
            sandbox_id = %id,
            resources = %request.compute_resources,
            "Provisioning sandbox"
        );

        match self.provision(&request).await {
            Ok((descriptor, registration)) => {
                let initial = match self.measure(&id).await {
                    Ok(usage) => usage,
                    Err(e) => {
                        debug!(sandbox_id = %id, "Initial usage sample failed: {}", e);
                        ResourceQuantity::ZERO
                    }
                };

                let mut sandboxes = self.sandboxes.write().await;
                if let Some(record) = sandboxes.get_mut(&id) {
                    record.sandbox.network_id = Some(descriptor.network.clone());
                    record.sandbox.endpoint_url = Some(registration.endpoint.clone());
                    record.history.add_measurement(UsageSample::now(initial));
                    record.touch();
                    record.set_status(SandboxStatus::Running);
                }
                drop(sandboxes);
                drop(guard);

                info!(sandbox_id = %id, endpoint = %registration.endpoint, "Sandbox running");
                Ok(SandboxEndpoint {
                    sandbox_id: id,
                    url: registration.endpoint,
                    api_key: registration.api_key,
                })
            }
            Err(cause) => {
                error!(sandbox_id = %id, "Provisioning failed: {}", cause);
                let rollback = self.rollback(&id).await;
                drop(guard);
                self.locks.remove_if_idle(&id).await;

                Err(ProvisioningError {
                    sandbox_id: id,
                    cause,
                    rollback,
                }
                .into())
            }
        }
    }

    async fn provision(
        &self,
        request: &CreateRequest,
    ) -> Result<(SandboxDescriptor, GatewayRegistration), ProvisioningCause> {
        let id = &request.sandbox_id;
        let runtime_config = &self.settings.runtime;

        let registration = self
            .gateway
            .register(id, id, &internal_endpoint(id, runtime_config))
            .await?;

        let descriptor = SandboxDescriptor::render(
            id,
            runtime_config,
            request.compute_resources,
            &request.tools,
            &request.environment,
            &registration.endpoint,
        );
        let path = descriptor
            .save(&self.settings.workdir)
            .map_err(|e| ProvisioningCause::Descriptor {
                message: format!("{e:#}"),
            })?;
        debug!(sandbox_id = %id, path = %path.display(), "Wrote sandbox descriptor");

        self.ensure_image().await?;

        let start_timeout = self.settings.container_start_timeout;
        tokio::time::timeout(
            start_timeout,
            self.start_containers(&descriptor, &registration.api_key),
        )
        .await
        .map_err(|_| ProvisioningCause::StartTimeout {
            timeout_secs: start_timeout.as_secs(),
        })??;

        self.health
            .wait_until_healthy(
                id,
                self.settings.health.global_timeout(),
                self.settings.health.container_timeout(),
            )
            .await?;

        Ok((descriptor, registration))
    }

    /// Builds the configured image once per manager, if a build context is set.
    async fn ensure_image(&self) -> Result<(), RuntimeError> {
        let Some(context) = self.settings.runtime.build_context.clone() else {
            return Ok(());
        };
        self.image
            .get_or_try_init(|| async move {
                self.runtime
                    .build_image(&ImageBuild {
                        context,
                        dockerfile: self.settings.runtime.dockerfile.clone(),
                        tag: self.settings.runtime.image.clone(),
                    })
                    .await
            })
            .await
            .map(|_| ())
    }

    async fn start_containers(
        &self,
        descriptor: &SandboxDescriptor,
        api_key: &str,
    ) -> Result<(), RuntimeError> {
        self.runtime
            .create_network(&descriptor.network, &descriptor.labels)
            .await?;

        let secrets = BTreeMap::from([(API_KEY_ENV.to_string(), api_key.to_string())]);
        for spec in descriptor.container_specs(&secrets) {
            let container_id = self.runtime.run_container(&spec).await?;
            debug!(
                sandbox_id = %descriptor.sandbox_id,
                container = %spec.name,
                container_id = %container_id,
                "Started container"
            );
        }
        Ok(())
    }

    /// Undoes a failed provisioning. The caller holds the sandbox lock.
    async fn rollback(&self, id: &str) -> Option<CleanupError> {
        if let Some(record) = self.sandboxes.write().await.get_mut(id) {
            record.set_status(SandboxStatus::Failed);
        }

        let result = self
            .cleaner
            .teardown_locked(id, self.settings.cleanup_timeout, TeardownPlan::full())
            .await;

        let removed = self.sandboxes.write().await.remove(id);
        if let Some(reservation) = removed.and_then(|mut r| r.reservation.take()) {
            self.ledger.release(reservation).await;
        }

        match result {
            Ok(()) => {
                info!(sandbox_id = id, "Rolled back failed sandbox");
                None
            }
            Err(e) => {
                error!(sandbox_id = id, "Rollback incomplete: {}", e);
                Some(e)
            }
        }
    }

    /// Stops a sandbox and releases everything it holds.
    ///
    /// The reservation goes back to the ledger before teardown starts. If
    /// teardown is incomplete the record stays as `Failed` so the delete
    /// can be retried.
    pub async fn delete_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        if !self.sandboxes.read().await.contains_key(id) {
            return Err(SandboxError::not_found(id));
        }

        let guard = self.locks.acquire(id).await;

        let reservation = {
            let mut sandboxes = self.sandboxes.write().await;
            match sandboxes.get_mut(id) {
                Some(record) => {
                    record.set_status(SandboxStatus::Stopping);
                    record.reservation.take()
                }
                None => {
                    drop(sandboxes);
                    drop(guard);
                    self.locks.remove_if_idle(id).await;
                    return Err(SandboxError::not_found(id));
                }
            }
        };

        info!(sandbox_id = id, "Stopping sandbox");

        match self.gateway.unregister(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(sandbox_id = id, "Sandbox already unregistered"),
            Err(e) => warn!(sandbox_id = id, "Failed to unregister sandbox: {}", e),
        }

        if let Some(reservation) = reservation {
            self.ledger.release(reservation).await;
        }

        let result = self
            .cleaner
            .teardown_locked(id, self.settings.cleanup_timeout, TeardownPlan::without_gateway())
            .await;

        match result {
            Ok(()) => {
                {
                    let mut sandboxes = self.sandboxes.write().await;
                    if let Some(record) = sandboxes.get_mut(id) {
                        record.set_status(SandboxStatus::Stopped);
                    }
                    sandboxes.remove(id);
                }
                drop(guard);
                self.locks.remove_if_idle(id).await;
                info!(sandbox_id = id, "Sandbox stopped");
                Ok(())
            }
            Err(e) => {
                if let Some(record) = self.sandboxes.write().await.get_mut(id) {
                    record.set_status(SandboxStatus::Failed);
                }
                drop(guard);
                Err(e.into())
            }
        }
    }

    /// A copy of the tracked sandbox, if any.
    #[cfg(test)]
    pub async fn sandbox(&self, id: &str) -> Option<sandbox::Sandbox> {
        self.sandboxes
            .read()
            .await
            .get(id)
            .map(|record| record.sandbox.clone())
    }

    /// Current state of one sandbox, including its containers.
    pub async fn get_status(&self, id: &str) -> Result<StatusReport, SandboxError> {
        let mut report = {
            let sandboxes = self.sandboxes.read().await;
            let record = sandboxes.get(id).ok_or_else(|| SandboxError::not_found(id))?;
            StatusReport {
                sandbox_id: id.to_string(),
                status: record.status(),
                containers: Vec::new(),
                endpoint: record.sandbox.endpoint_url.clone(),
                last_activity: record.last_activity,
                reservation: record.reservation,
                limits: record.limits,
                max_usage: record.history.max_usage(),
                latest_usage: record.history.latest().copied(),
            }
        };

        let containers = self.runtime.list_containers(&sandbox_filter(id)).await?;
        for container in containers {
            let health = match self.runtime.inspect(&container.id).await {
                Ok(state) => state.health,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            report.containers.push(ContainerReport {
                name: container.name,
                status: container.status,
                health,
            });
        }
        Ok(report)
    }

    /// Status of every tracked sandbox.
    pub async fn list_statuses(&self) -> BTreeMap<String, SandboxStatus> {
        self.sandboxes
            .read()
            .await
            .iter()
            .map(|(id, record)| (id.clone(), record.status()))
            .collect()
    }

    async fn ids_with_status(&self, statuses: &[SandboxStatus]) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sandboxes
            .read()
            .await
            .iter()
            .filter(|(_, record)| statuses.contains(&record.status()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Starts the sweep, usage monitor and right-sizing loops.
    pub fn spawn_background_tasks(self: &Arc<Self>, schedule: BackgroundSchedule) {
        let sweep = self.cleaner.spawn_inactivity_sweep(
            Arc::clone(self) as Arc<dyn SweepTarget>,
            schedule.sweep_interval,
            schedule.inactivity_threshold,
        );

        let manager = Arc::clone(self);
        let monitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(schedule.monitor_interval);
            loop {
                ticker.tick().await;
                manager.sample_usage().await;
            }
        });

        let manager = Arc::clone(self);
        let adjust = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(schedule.adjust_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager
                    .adjust_sandbox_resources(schedule.adjust_factor)
                    .await;
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend([sweep, monitor, adjust]);
        }
    }

    fn abort_background_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Stops background loops, deletes every sandbox and stops databases.
    pub async fn shutdown(&self) -> Result<(), SandboxError> {
        info!("Shutting down sandbox manager");
        self.abort_background_tasks();

        let ids: Vec<String> = self.sandboxes.read().await.keys().cloned().collect();
        let mut failures = match self.delete_sandbox_group("shutdown", &ids).await {
            Ok(()) => BTreeMap::new(),
            Err(SandboxError::Cleanup(e)) => e.failures,
            Err(e) => BTreeMap::from([("sandboxes".to_string(), e.to_string())]),
        };

        if let Err(e) = self.stop_databases().await {
            failures.insert("databases".to_string(), e.to_string());
        }

        if failures.is_empty() {
            info!("Shutdown complete");
            Ok(())
        } else {
            Err(CleanupError::new("shutdown", failures).into())
        }
    }
}

#[async_trait]
impl SweepTarget for SandboxManager {
    async fn tracked_sandboxes(&self) -> HashSet<String> {
        self.sandboxes.read().await.keys().cloned().collect()
    }

    /// Running sandboxes idle past `threshold`, plus failed ones awaiting
    /// another delete attempt.
    async fn inactive_sandboxes(&self, threshold: Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sandboxes
            .read()
            .await
            .iter()
            .filter(|(_, record)| match record.status() {
                SandboxStatus::Running => record.idle_for() > threshold,
                SandboxStatus::Failed => true,
                _ => false,
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn reclaim(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        info!(sandbox_id, "Reclaiming inactive sandbox");
        self.delete_sandbox(sandbox_id).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{harness, harness_with, request};
    use super::*;
    use crate::runtime::memory::FailPoint;
    use crate::runtime::{ContainerStatus, HealthState};
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn capacity() -> ResourceQuantity {
        ResourceQuantity::compute(8.0, 32.0)
    }

    #[tokio::test]
    async fn test_create_sandbox_success() {
        let h = harness(capacity());

        let endpoint = h
            .manager
            .create_sandbox(request("sb-1", 2.0, 4.0))
            .await
            .unwrap();

        assert_eq!(endpoint.sandbox_id, "sb-1");
        assert_eq!(endpoint.url, "https://gateway.test/sandboxes/sb-1");
        assert_eq!(endpoint.api_key, "key-sb-1");

        let sandbox = h.manager.sandbox("sb-1").await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.network_id.as_deref(), Some("sandbox-sb-1-net"));
        assert_eq!(sandbox.endpoint_url.as_deref(), Some(endpoint.url.as_str()));

        assert_eq!(h.runtime.container_names(), vec!["sandbox-sb-1-api".to_string()]);
        assert_eq!(h.runtime.network_names(), vec!["sandbox-sb-1-net".to_string()]);
        assert_eq!(
            h.runtime.container_limits("sandbox-sb-1-api"),
            Some(ResourceQuantity::compute(2.0, 4.0))
        );
        assert!(h.workdir.path().join("sb-1").join("sandbox.toml").exists());

        let snapshot = h.manager.ledger_snapshot().await;
        assert_eq!(snapshot.used, ResourceQuantity::compute(2.0, 4.0));

        let status = h.manager.get_status("sb-1").await.unwrap();
        assert_eq!(status.latest_usage.map(|s| s.usage), Some(ResourceQuantity::ZERO));
    }

    #[tokio::test]
    async fn test_ledger_scenario_third_request_rejected() {
        let h = harness(capacity());

        h.manager.create_sandbox(request("a", 3.0, 10.0)).await.unwrap();
        h.manager.create_sandbox(request("b", 3.0, 10.0)).await.unwrap();
        let err = h
            .manager
            .create_sandbox(request("c", 3.0, 10.0))
            .await
            .unwrap_err();

        assert!(err.is_resource_error());
        let snapshot = h.manager.ledger_snapshot().await;
        assert_eq!(snapshot.used, ResourceQuantity::compute(6.0, 20.0));
        assert_eq!(snapshot.available, ResourceQuantity::compute(2.0, 12.0));
        // Rejected at admission: nothing was provisioned for it
        assert!(h.manager.sandbox("c").await.is_none());
        assert!(!h.gateway.registered().contains(&"c".to_string()));
        assert_eq!(h.runtime.container_names().len(), 2);
    }

    #[tokio::test]
    async fn test_container_failure_rolls_back_everything() {
        let h = harness(capacity());
        h.runtime.fail(FailPoint::RunContainer);

        let err = h
            .manager
            .create_sandbox(request("sb-1", 2.0, 4.0))
            .await
            .unwrap_err();

        match err {
            SandboxError::Provisioning(e) => {
                assert_eq!(e.sandbox_id, "sb-1");
                assert!(matches!(e.cause, ProvisioningCause::Runtime(_)));
                assert!(e.rollback.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
        assert!(h.runtime.container_names().is_empty());
        assert!(h.runtime.network_names().is_empty());
        assert!(h.gateway.registered().is_empty());
        assert!(!h.workdir.path().join("sb-1").exists());
        assert!(h.manager.sandbox("sb-1").await.is_none());
    }

    #[tokio::test]
    async fn test_health_failure_rolls_back() {
        let h = harness(capacity());
        h.runtime.set_initial_health(HealthState::Starting);

        let err = h
            .manager
            .create_sandbox(request("sb-1", 2.0, 4.0))
            .await
            .unwrap_err();

        match err {
            SandboxError::Provisioning(e) => {
                assert!(e.is_health_failure());
                assert!(!e.rollback_incomplete());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
        assert!(h.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_exited_container_fails_fast_and_rolls_back() {
        let h = harness(capacity());
        h.runtime.set_initial_status(ContainerStatus::Exited);

        let start = Instant::now();
        let err = h
            .manager
            .create_sandbox(request("sb-1", 1.0, 1.0))
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(err.is_provisioning_error());
        assert!(h.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_rolls_back_reservation() {
        let h = harness(capacity());
        h.gateway.fail_register.store(true, Ordering::SeqCst);

        let err = h
            .manager
            .create_sandbox(request("sb-1", 2.0, 4.0))
            .await
            .unwrap_err();

        match err {
            SandboxError::Provisioning(e) => {
                assert!(matches!(e.cause, ProvisioningCause::Gateway(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
        assert!(h.runtime.network_names().is_empty());
    }

    #[tokio::test]
    async fn test_start_timeout() {
        let h = harness_with(capacity(), |s| {
            s.container_start_timeout = Duration::from_millis(50);
        });
        h.runtime.set_run_delay(Duration::from_millis(500));

        let err = h
            .manager
            .create_sandbox(request("sb-1", 1.0, 1.0))
            .await
            .unwrap_err();

        match err {
            SandboxError::Provisioning(e) => {
                assert!(matches!(e.cause, ProvisioningCause::StartTimeout { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
    }

    #[tokio::test]
    async fn test_incomplete_rollback_is_attached() {
        let h = harness(capacity());
        h.runtime.set_initial_health(HealthState::Starting);
        h.runtime.fail(FailPoint::RemoveNetwork);

        let err = h
            .manager
            .create_sandbox(request("sb-1", 2.0, 4.0))
            .await
            .unwrap_err();

        match err {
            SandboxError::Provisioning(e) => {
                assert!(e.is_health_failure());
                let rollback = e.rollback.as_ref().unwrap();
                assert!(rollback.has_failure("networks"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The reservation is still returned
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
    }

    #[tokio::test]
    async fn test_image_built_once_when_context_configured() {
        let h = harness_with(capacity(), |s| {
            s.runtime.build_context = Some(PathBuf::from("/tmp/sandbox-image"));
        });

        h.manager.create_sandbox(request("a", 1.0, 1.0)).await.unwrap();
        h.manager.create_sandbox(request("b", 1.0, 1.0)).await.unwrap();

        assert_eq!(h.runtime.images_built(), vec!["sandbox-api:latest".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_leaking_reservation() {
        let h = harness(capacity());
        h.manager.create_sandbox(request("sb-1", 2.0, 4.0)).await.unwrap();

        let err = h
            .manager
            .create_sandbox(request("sb-1", 2.0, 4.0))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::AlreadyExists { .. }));
        assert_eq!(
            h.manager.ledger_snapshot().await.used,
            ResourceQuantity::compute(2.0, 4.0)
        );
        assert_eq!(
            h.manager.sandbox("sb-1").await.unwrap().status,
            SandboxStatus::Running
        );
    }

    #[tokio::test]
    async fn test_invalid_id_and_quantity() {
        let h = harness(capacity());

        let err = h
            .manager
            .create_sandbox(request("../escape", 1.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidId { .. }));

        let err = h
            .manager
            .create_sandbox(request("sb-1", -1.0, 1.0))
            .await
            .unwrap_err();
        assert!(err.is_resource_error());
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
    }

    #[tokio::test]
    async fn test_delete_sandbox_releases_everything() {
        let h = harness(capacity());
        h.manager.create_sandbox(request("sb-1", 2.0, 4.0)).await.unwrap();

        h.manager.delete_sandbox("sb-1").await.unwrap();

        assert!(h.manager.sandbox("sb-1").await.is_none());
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
        assert!(h.runtime.container_names().is_empty());
        assert!(h.runtime.network_names().is_empty());
        assert!(h.gateway.registered().is_empty());
        assert_eq!(h.gateway.unregistered(), vec!["sb-1".to_string()]);
        assert!(!h.workdir.path().join("sb-1").exists());

        let err = h.manager.delete_sandbox("sb-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_with_gateway_down_still_tears_down() {
        let h = harness(capacity());
        h.manager.create_sandbox(request("sb-1", 2.0, 4.0)).await.unwrap();
        h.gateway.fail_unregister.store(true, Ordering::SeqCst);

        h.manager.delete_sandbox("sb-1").await.unwrap();

        assert!(h.manager.sandbox("sb-1").await.is_none());
        assert!(h.runtime.container_names().is_empty());
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_failed_record_and_can_retry() {
        let h = harness(capacity());
        h.manager.create_sandbox(request("sb-1", 2.0, 4.0)).await.unwrap();
        h.runtime.fail(FailPoint::RemoveContainer);

        let err = h.manager.delete_sandbox("sb-1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Cleanup(_)));
        assert_eq!(
            h.manager.sandbox("sb-1").await.unwrap().status,
            SandboxStatus::Failed
        );
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);

        h.runtime.recover(FailPoint::RemoveContainer);
        h.manager.delete_sandbox("sb-1").await.unwrap();
        assert!(h.manager.sandbox("sb-1").await.is_none());
        // Released exactly once
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_operations_on_one_sandbox_are_serialized() {
        let h = harness(capacity());
        h.gateway.set_delay(Duration::from_millis(50));
        h.manager.create_sandbox(request("sb-1", 1.0, 1.0)).await.unwrap();

        let deletes: Vec<_> = (0..3)
            .map(|_| {
                let manager = Arc::clone(&h.manager);
                tokio::spawn(async move { manager.delete_sandbox("sb-1").await })
            })
            .collect();

        let mut ok = 0;
        for task in deletes {
            match task.await.unwrap() {
                Ok(()) => ok += 1,
                Err(e) => assert!(e.is_not_found()),
            }
        }

        assert_eq!(ok, 1);
        assert_eq!(h.gateway.max_in_flight(), 1);
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_never_oversubscribe() {
        let h = harness(capacity());

        let creates: Vec<_> = (0..12)
            .map(|i| {
                let manager = Arc::clone(&h.manager);
                tokio::spawn(async move {
                    manager
                        .create_sandbox(request(&format!("sb-{i}"), 1.0, 1.0))
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        for task in creates {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(e.is_resource_error()),
            }
        }

        assert_eq!(ok, 8);
        let snapshot = h.manager.ledger_snapshot().await;
        assert!(snapshot.used.fits_within(&snapshot.total));
        assert_eq!(h.runtime.container_names().len(), 8);
    }

    #[tokio::test]
    async fn test_get_status_and_list_statuses() {
        let h = harness(capacity());
        h.manager.create_sandbox(request("sb-1", 2.0, 4.0)).await.unwrap();

        let status = h.manager.get_status("sb-1").await.unwrap();
        assert_eq!(status.status, SandboxStatus::Running);
        assert_eq!(status.reservation, Some(ResourceQuantity::compute(2.0, 4.0)));
        assert_eq!(status.containers.len(), 1);
        assert_eq!(status.containers[0].name, "sandbox-sb-1-api");
        assert_eq!(status.containers[0].health, Some(HealthState::Healthy));
        assert!(status.latest_usage.is_some());

        let all = h.manager.list_statuses().await;
        assert_eq!(all.get("sb-1"), Some(&SandboxStatus::Running));

        assert!(h.manager.get_status("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_records_do_not_keep_api_key() {
        let h = harness(capacity());
        let endpoint = h.manager.create_sandbox(request("sb-1", 1.0, 1.0)).await.unwrap();

        let sandboxes = h.manager.sandboxes.read().await;
        let debug = format!("{:?}", sandboxes["sb-1"]);
        assert!(!debug.contains(&endpoint.api_key));
    }

    #[tokio::test]
    async fn test_sweep_target_reports_idle_sandboxes() {
        let h = harness(capacity());
        h.manager.create_sandbox(request("idle", 1.0, 1.0)).await.unwrap();
        h.manager.create_sandbox(request("busy", 1.0, 1.0)).await.unwrap();

        {
            let mut sandboxes = h.manager.sandboxes.write().await;
            let idle = sandboxes.get_mut("idle").unwrap();
            idle.last_activity = chrono::Utc::now() - chrono::Duration::hours(2);
        }

        let inactive = h.manager.inactive_sandboxes(Duration::from_secs(3600)).await;
        assert_eq!(inactive, vec!["idle".to_string()]);

        let report = h
            .manager
            .cleaner()
            .sweep_once(h.manager.as_ref(), Duration::from_secs(3600))
            .await;
        assert_eq!(report.reclaimed, vec!["idle".to_string()]);
        assert!(h.manager.sandbox("idle").await.is_none());
        assert!(h.manager.sandbox("busy").await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_deletes_all_sandboxes() {
        let h = harness(capacity());
        h.manager.create_sandbox(request("a", 1.0, 1.0)).await.unwrap();
        h.manager.create_sandbox(request("b", 1.0, 1.0)).await.unwrap();
        h.manager.spawn_background_tasks(BackgroundSchedule {
            sweep_interval: Duration::from_secs(60),
            inactivity_threshold: Duration::from_secs(3600),
            monitor_interval: Duration::from_secs(60),
            adjust_interval: Duration::from_secs(60),
            adjust_factor: 1.3,
        });

        h.manager.shutdown().await.unwrap();

        assert!(h.manager.list_statuses().await.is_empty());
        assert!(h.runtime.container_names().is_empty());
        assert_eq!(h.manager.ledger_snapshot().await.used, ResourceQuantity::ZERO);
        assert!(h.manager.tasks.lock().unwrap().is_empty());
    }
}
