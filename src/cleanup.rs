//! Teardown of everything a sandbox owns.
//!
//! Teardown is split into independent steps (containers, networks, gateway
//! registration, working files). Every step runs even when an earlier one
//! fails, and each failure is reported under its step name so partial
//! teardown is never silent.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::database::DatabaseLifecycle;
use crate::descriptor::SandboxDescriptor;
use crate::error::{CleanupError, SandboxError};
use crate::gateway::GatewayClient;
use crate::locks::LockTable;
use crate::retry::RetryPolicy;
use crate::runtime::network::{sandbox_filter, validate_sandbox_id};
use crate::runtime::{ignore_not_found, ContainerRuntime, ContainerStatus};

pub(crate) const CONTAINERS_STEP: &str = "containers";
pub(crate) const NETWORKS_STEP: &str = "networks";
pub(crate) const GATEWAY_STEP: &str = "gateway";
pub(crate) const FILES_STEP: &str = "files";
pub(crate) const DATABASE_STEP: &str = "database";
pub(crate) const ID_STEP: &str = "id";

/// Which teardown steps to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TeardownPlan {
    pub gateway: bool,
}

impl TeardownPlan {
    pub fn full() -> Self {
        Self { gateway: true }
    }

    /// For callers that already unregistered the sandbox themselves.
    pub fn without_gateway() -> Self {
        Self { gateway: false }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CleanerSettings {
    pub workdir: PathBuf,
    /// Grace period given to each container before it is killed
    pub stop_timeout: Duration,
    pub database_stop_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Source of sandboxes for the inactivity sweep.
#[async_trait]
pub(crate) trait SweepTarget: Send + Sync {
    /// Ids of every sandbox currently tracked.
    async fn tracked_sandboxes(&self) -> HashSet<String>;

    /// Ids of sandboxes with no activity for longer than `threshold`.
    async fn inactive_sandboxes(&self, threshold: Duration) -> Vec<String>;

    /// Tears a sandbox down and forgets it.
    async fn reclaim(&self, sandbox_id: &str) -> Result<(), SandboxError>;
}

/// Outcome of one sweep pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub reclaimed: Vec<String>,
    pub failed: Vec<String>,
    pub locks_removed: Vec<String>,
}

pub(crate) struct ResourceCleaner {
    runtime: Arc<dyn ContainerRuntime>,
    gateway: Arc<dyn GatewayClient>,
    locks: Arc<LockTable>,
    settings: CleanerSettings,
}

async fn bounded<F>(limit: Duration, step: F) -> Result<(), String>
where
    F: Future<Output = Result<(), String>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(result) => result,
        Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
    }
}

fn record(failures: &mut BTreeMap<String, String>, step: &str, result: Result<(), String>) {
    if let Err(message) = result {
        failures.insert(step.to_string(), message);
    }
}

impl ResourceCleaner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        gateway: Arc<dyn GatewayClient>,
        locks: Arc<LockTable>,
        settings: CleanerSettings,
    ) -> Self {
        Self {
            runtime,
            gateway,
            locks,
            settings,
        }
    }

    /// Tears down a sandbox, taking its lock for the duration.
    ///
    /// On full success the sandbox's lock is removed from the table.
    pub async fn cleanup_sandbox(
        &self,
        sandbox_id: &str,
        timeout: Duration,
    ) -> Result<(), CleanupError> {
        let guard = self.locks.acquire(sandbox_id).await;
        let result = self
            .teardown_locked(sandbox_id, timeout, TeardownPlan::full())
            .await;
        drop(guard);

        if result.is_ok() {
            self.locks.remove_if_idle(sandbox_id).await;
        }
        result
    }

    /// Tears down a sandbox whose lock the caller already holds.
    ///
    /// Containers get half of `timeout`; networks, gateway and files a
    /// sixth each, so the whole teardown stays within `timeout`. Ids that
    /// are not valid sandbox ids are refused before anything is touched.
    pub async fn teardown_locked(
        &self,
        sandbox_id: &str,
        timeout: Duration,
        plan: TeardownPlan,
    ) -> Result<(), CleanupError> {
        if let Err(e) = validate_sandbox_id(sandbox_id) {
            let failures = BTreeMap::from([(ID_STEP.to_string(), e.to_string())]);
            warn!(sandbox_id, "Refusing to tear down: {}", e);
            return Err(CleanupError::new(sandbox_id, failures));
        }

        let half = timeout / 2;
        let sixth = timeout / 6;
        let mut failures = BTreeMap::new();

        info!(sandbox_id, "Tearing down sandbox");

        let result = bounded(half, self.remove_containers(sandbox_id)).await;
        record(&mut failures, CONTAINERS_STEP, result);

        let result = bounded(sixth, self.remove_networks(sandbox_id)).await;
        record(&mut failures, NETWORKS_STEP, result);

        if plan.gateway {
            let result = bounded(sixth, self.unregister(sandbox_id)).await;
            record(&mut failures, GATEWAY_STEP, result);
        }

        let result = bounded(sixth, self.remove_files(sandbox_id)).await;
        record(&mut failures, FILES_STEP, result);

        if failures.is_empty() {
            info!(sandbox_id, "Sandbox torn down");
            Ok(())
        } else {
            let err = CleanupError::new(sandbox_id, failures);
            warn!(sandbox_id, "{}", err);
            Err(err)
        }
    }

    /// Stops and force-removes every container of the sandbox, re-listing
    /// until none remain or attempts run out.
    async fn remove_containers(&self, sandbox_id: &str) -> Result<(), String> {
        let filter = sandbox_filter(sandbox_id);
        let retry = &self.settings.retry;

        for attempt in 0..retry.max_attempts.max(1) {
            let delay = retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let containers = match self.runtime.list_containers(&filter).await {
                Ok(containers) => containers,
                Err(e) => {
                    warn!(sandbox_id, attempt = attempt + 1, "Failed to list containers: {}", e);
                    continue;
                }
            };
            if containers.is_empty() {
                return Ok(());
            }

            for container in &containers {
                if matches!(
                    container.status,
                    ContainerStatus::Running | ContainerStatus::Restarting | ContainerStatus::Paused
                ) {
                    if let Err(e) = ignore_not_found(
                        self.runtime
                            .stop(&container.id, self.settings.stop_timeout)
                            .await,
                    ) {
                        debug!(container = %container.name, "Stop failed, forcing removal: {}", e);
                    }
                }
                if let Err(e) = ignore_not_found(self.runtime.remove(&container.id, true).await) {
                    warn!(
                        sandbox_id,
                        container = %container.name,
                        attempt = attempt + 1,
                        "Failed to remove container: {}",
                        e
                    );
                }
            }
        }

        let survivors = self
            .runtime
            .list_containers(&filter)
            .await
            .map_err(|e| e.to_string())?;
        if survivors.is_empty() {
            Ok(())
        } else {
            let names: Vec<&str> = survivors.iter().map(|c| c.name.as_str()).collect();
            Err(format!("containers still present: {}", names.join(", ")))
        }
    }

    async fn remove_networks(&self, sandbox_id: &str) -> Result<(), String> {
        let filter = sandbox_filter(sandbox_id);
        let networks = self
            .runtime
            .list_networks(&filter)
            .await
            .map_err(|e| e.to_string())?;

        let mut errors = Vec::new();
        for network in &networks {
            if let Err(e) = ignore_not_found(self.runtime.remove_network(network).await) {
                errors.push(e.to_string());
            }
        }

        let remaining = self
            .runtime
            .list_networks(&filter)
            .await
            .map_err(|e| e.to_string())?;
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "networks still present: {} ({})",
                remaining.join(", "),
                errors.join("; ")
            ))
        }
    }

    async fn unregister(&self, sandbox_id: &str) -> Result<(), String> {
        let result = self
            .settings
            .retry
            .run_while(
                "gateway unregister",
                || self.gateway.unregister(sandbox_id),
                |e| !e.is_not_found(),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(sandbox_id, "Sandbox was not registered with the gateway");
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn remove_files(&self, sandbox_id: &str) -> Result<(), String> {
        let workdir = &self.settings.workdir;
        self.settings
            .retry
            .run("remove sandbox files", || async {
                SandboxDescriptor::delete(workdir, sandbox_id)
            })
            .await
            .map(|_| ())
            .map_err(|e| format!("{e:#}"))
    }

    /// Tears down several sandboxes concurrently, then stops their database.
    ///
    /// The database is only stopped when every sandbox was cleaned up;
    /// otherwise the `database` entry records that it was skipped.
    pub async fn cleanup_group(
        &self,
        group_id: &str,
        sandbox_ids: &[String],
        database: Option<Arc<dyn DatabaseLifecycle>>,
        timeout: Duration,
    ) -> Result<(), CleanupError> {
        info!(group_id, count = sandbox_ids.len(), "Cleaning up sandbox group");

        let results = join_all(sandbox_ids.iter().map(|id| async move {
            (id.clone(), self.cleanup_sandbox(id, timeout).await)
        }))
        .await;

        let mut failures = BTreeMap::new();
        for (id, result) in results {
            if let Err(e) = result {
                failures.insert(id, e.to_string());
            }
        }

        if let Some(database) = database {
            if failures.is_empty() {
                let stop =
                    tokio::time::timeout(self.settings.database_stop_timeout, database.stop()).await;
                match stop {
                    Ok(Ok(())) => info!(group_id, database = database.name(), "Database stopped"),
                    Ok(Err(e)) => {
                        failures.insert(DATABASE_STEP.to_string(), e.to_string());
                    }
                    Err(_) => {
                        failures.insert(
                            DATABASE_STEP.to_string(),
                            format!(
                                "{} did not stop within {}s",
                                database.name(),
                                self.settings.database_stop_timeout.as_secs()
                            ),
                        );
                    }
                }
            } else {
                failures.insert(
                    DATABASE_STEP.to_string(),
                    format!("skipped stopping {}: sandbox cleanup failed", database.name()),
                );
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError::new(group_id, failures))
        }
    }

    /// Drops idle locks of sandboxes that are no longer tracked.
    pub async fn audit_locks(&self, tracked: &HashSet<String>) -> Vec<String> {
        let removed = self.locks.audit(tracked).await;
        if !removed.is_empty() {
            info!(count = removed.len(), "Removed stale sandbox locks");
        }
        removed
    }

    /// Runs one inactivity sweep: audit locks, then reclaim idle sandboxes.
    ///
    /// Per-sandbox failures are logged and reported, never propagated.
    pub async fn sweep_once(&self, target: &dyn SweepTarget, threshold: Duration) -> SweepReport {
        let tracked = target.tracked_sandboxes().await;
        let locks_removed = self.audit_locks(&tracked).await;

        let inactive = target.inactive_sandboxes(threshold).await;
        if !inactive.is_empty() {
            info!(count = inactive.len(), "Reclaiming inactive sandboxes");
        }

        let results = join_all(inactive.into_iter().map(|id| async move {
            let result = target.reclaim(&id).await;
            (id, result)
        }))
        .await;

        let mut report = SweepReport {
            locks_removed,
            ..SweepReport::default()
        };
        for (id, result) in results {
            match result {
                Ok(()) => report.reclaimed.push(id),
                Err(e) if e.is_not_found() => {
                    debug!(sandbox_id = %id, "Sandbox already gone");
                    report.reclaimed.push(id);
                }
                Err(e) => {
                    error!(sandbox_id = %id, "Failed to reclaim inactive sandbox: {}", e);
                    report.failed.push(id);
                }
            }
        }
        report
    }

    /// Spawns the periodic inactivity sweep. Abort the handle to stop it.
    pub fn spawn_inactivity_sweep(
        self: &Arc<Self>,
        target: Arc<dyn SweepTarget>,
        interval: Duration,
        threshold: Duration,
    ) -> JoinHandle<()> {
        let cleaner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = cleaner.sweep_once(target.as_ref(), threshold).await;
                debug!(
                    reclaimed = report.reclaimed.len(),
                    failed = report.failed.len(),
                    "Inactivity sweep finished"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::FakeDatabase;
    use crate::gateway::RecordingGateway;
    use crate::runtime::memory::{FailPoint, MemoryRuntime};
    use crate::runtime::network::{network_name, sandbox_labels};
    use crate::runtime::HealthState;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        runtime: Arc<MemoryRuntime>,
        gateway: Arc<RecordingGateway>,
        locks: Arc<LockTable>,
        cleaner: Arc<ResourceCleaner>,
        workdir: TempDir,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(MemoryRuntime::new());
        let gateway = Arc::new(RecordingGateway::new());
        let locks = Arc::new(LockTable::new());
        let workdir = TempDir::new().unwrap();
        let cleaner = Arc::new(ResourceCleaner::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&gateway) as Arc<dyn GatewayClient>,
            Arc::clone(&locks),
            CleanerSettings {
                workdir: workdir.path().to_path_buf(),
                stop_timeout: Duration::from_secs(1),
                database_stop_timeout: Duration::from_secs(1),
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                    factor: 2.0,
                },
            },
        ));
        Fixture {
            runtime,
            gateway,
            locks,
            cleaner,
            workdir,
        }
    }

    async fn provision(f: &Fixture, id: &str) {
        f.runtime.insert_container(
            &format!("sandbox-{id}-api"),
            sandbox_labels(id),
            ContainerStatus::Running,
            Some(HealthState::Healthy),
        );
        f.runtime.insert_network(&network_name(id), sandbox_labels(id));
        f.gateway.register(id, id, "http://x").await.unwrap();
        std::fs::create_dir_all(f.workdir.path().join(id)).unwrap();
        std::fs::write(f.workdir.path().join(id).join("sandbox.toml"), "x").unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_removes_everything() {
        let f = fixture();
        provision(&f, "sb-1").await;
        provision(&f, "sb-2").await;

        f.cleaner.cleanup_sandbox("sb-1", TIMEOUT).await.unwrap();

        assert_eq!(f.runtime.container_names(), vec!["sandbox-sb-2-api".to_string()]);
        assert_eq!(f.runtime.network_names(), vec!["sandbox-sb-2-net".to_string()]);
        assert_eq!(f.gateway.registered(), vec!["sb-2".to_string()]);
        assert!(!f.workdir.path().join("sb-1").exists());
        assert!(f.workdir.path().join("sb-2").exists());
        assert!(f.locks.ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_refuses_ids_outside_workdir() {
        let root = TempDir::new().unwrap();
        let workdir = root.path().join("work");
        let victim = root.path().join("victim");
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::create_dir_all(&victim).unwrap();

        let f = fixture();
        let cleaner = ResourceCleaner::new(
            Arc::clone(&f.runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&f.gateway) as Arc<dyn GatewayClient>,
            Arc::clone(&f.locks),
            CleanerSettings {
                workdir,
                ..f.cleaner.settings.clone()
            },
        );

        let absolute = victim.to_string_lossy().into_owned();
        for id in ["../victim", absolute.as_str()] {
            let err = cleaner.cleanup_sandbox(id, TIMEOUT).await.unwrap_err();
            assert!(err.has_failure(ID_STEP), "{id}");
        }

        assert!(victim.exists());
        assert!(f.gateway.unregistered().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_stays_within_budget() {
        let f = fixture();
        provision(&f, "sb-1").await;
        f.gateway.set_delay(Duration::from_secs(10));

        let budget = Duration::from_millis(600);
        let started = std::time::Instant::now();
        let err = f.cleaner.cleanup_sandbox("sb-1", budget).await.unwrap_err();

        assert!(started.elapsed() < budget + Duration::from_millis(200));
        assert!(err.has_failure(GATEWAY_STEP));
        assert!(f.runtime.container_names().is_empty());
        assert!(!f.workdir.path().join("sb-1").exists());
    }

    #[tokio::test]
    async fn test_cleanup_of_unknown_sandbox_succeeds() {
        let f = fixture();
        f.cleaner.cleanup_sandbox("ghost", TIMEOUT).await.unwrap();
        assert_eq!(f.gateway.unregistered(), vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_step_does_not_stop_other_steps() {
        let f = fixture();
        provision(&f, "sb-1").await;
        f.runtime.fail(FailPoint::RemoveNetwork);

        let err = f.cleaner.cleanup_sandbox("sb-1", TIMEOUT).await.unwrap_err();

        assert_eq!(err.target, "sb-1");
        assert!(err.has_failure(NETWORKS_STEP));
        assert!(!err.has_failure(CONTAINERS_STEP));
        assert!(!err.has_failure(GATEWAY_STEP));
        assert!(!err.has_failure(FILES_STEP));

        assert!(f.runtime.container_names().is_empty());
        assert!(f.gateway.registered().is_empty());
        assert!(!f.workdir.path().join("sb-1").exists());
        // The lock survives a failed cleanup
        assert_eq!(f.locks.ids().await, vec!["sb-1".to_string()]);
    }

    #[tokio::test]
    async fn test_surviving_containers_are_reported() {
        let f = fixture();
        provision(&f, "sb-1").await;
        f.runtime.fail(FailPoint::RemoveContainer);

        let err = f.cleaner.cleanup_sandbox("sb-1", TIMEOUT).await.unwrap_err();

        assert!(err.has_failure(CONTAINERS_STEP));
        assert!(err.failures[CONTAINERS_STEP].contains("sandbox-sb-1-api"));
        assert!(!f.workdir.path().join("sb-1").exists());
    }

    #[tokio::test]
    async fn test_gateway_failure_is_reported() {
        let f = fixture();
        provision(&f, "sb-1").await;
        f.gateway.fail_unregister.store(true, Ordering::SeqCst);

        let err = f.cleaner.cleanup_sandbox("sb-1", TIMEOUT).await.unwrap_err();
        assert_eq!(err.failures.keys().collect::<Vec<_>>(), vec![GATEWAY_STEP]);
    }

    #[tokio::test]
    async fn test_teardown_without_gateway_skips_unregister() {
        let f = fixture();
        provision(&f, "sb-1").await;

        f.cleaner
            .teardown_locked("sb-1", TIMEOUT, TeardownPlan::without_gateway())
            .await
            .unwrap();

        assert!(f.gateway.unregistered().is_empty());
        assert!(f.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_sandbox_lock() {
        let f = fixture();
        provision(&f, "sb-1").await;
        let guard = f.locks.acquire("sb-1").await;

        let cleaner = Arc::clone(&f.cleaner);
        let task = tokio::spawn(async move { cleaner.cleanup_sandbox("sb-1", TIMEOUT).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(f.runtime.container_names().len(), 1);

        drop(guard);
        task.await.unwrap().unwrap();
        assert!(f.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_group_stops_database_after_all_sandboxes() {
        let f = fixture();
        provision(&f, "sb-1").await;
        provision(&f, "sb-2").await;
        let db = Arc::new(FakeDatabase::new("vector"));
        db.start().await.unwrap();

        f.cleaner
            .cleanup_group(
                "group-1",
                &["sb-1".to_string(), "sb-2".to_string()],
                Some(Arc::clone(&db) as Arc<dyn DatabaseLifecycle>),
                TIMEOUT,
            )
            .await
            .unwrap();

        assert!(f.runtime.container_names().is_empty());
        assert!(!db.is_running());
        assert_eq!(db.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_group_skips_database_when_a_sandbox_fails() {
        let f = fixture();
        provision(&f, "sb-1").await;
        // A plain file where the sandbox directory should be cannot be
        // removed as a directory.
        std::fs::write(f.workdir.path().join("sb-2"), "not a directory").unwrap();
        let db = Arc::new(FakeDatabase::new("graph"));
        db.start().await.unwrap();

        let err = f
            .cleaner
            .cleanup_group(
                "group-1",
                &["sb-1".to_string(), "sb-2".to_string()],
                Some(Arc::clone(&db) as Arc<dyn DatabaseLifecycle>),
                TIMEOUT,
            )
            .await
            .unwrap_err();

        assert_eq!(err.target, "group-1");
        assert!(err.has_failure("sb-2"));
        assert!(!err.has_failure("sb-1"));
        assert!(err.failures[DATABASE_STEP].contains("skipped"));
        assert!(db.is_running());
        assert_eq!(db.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_audit_locks_skips_held_locks() {
        let f = fixture();
        f.locks.get_or_create("stale").await;
        f.locks.get_or_create("tracked").await;
        let _held = f.locks.acquire("busy").await;

        let removed = f
            .cleaner
            .audit_locks(&HashSet::from(["tracked".to_string()]))
            .await;

        assert_eq!(removed, vec!["stale".to_string()]);
        assert_eq!(
            f.locks.ids().await,
            vec!["busy".to_string(), "tracked".to_string()]
        );
    }

    struct FakeTarget {
        inactive: Vec<String>,
        failing: HashSet<String>,
        gone: HashSet<String>,
        reclaimed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SweepTarget for FakeTarget {
        async fn tracked_sandboxes(&self) -> HashSet<String> {
            self.inactive.iter().cloned().collect()
        }

        async fn inactive_sandboxes(&self, _threshold: Duration) -> Vec<String> {
            self.inactive.clone()
        }

        async fn reclaim(&self, sandbox_id: &str) -> Result<(), SandboxError> {
            if self.failing.contains(sandbox_id) {
                let failures =
                    BTreeMap::from([(CONTAINERS_STEP.to_string(), "still present".to_string())]);
                return Err(CleanupError::new(sandbox_id, failures).into());
            }
            if self.gone.contains(sandbox_id) {
                return Err(SandboxError::not_found(sandbox_id));
            }
            self.reclaimed.lock().unwrap().push(sandbox_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweep_reclaims_inactive_and_survives_failures() {
        let f = fixture();
        f.locks.get_or_create("orphan").await;
        let target = FakeTarget {
            inactive: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            failing: HashSet::from(["b".to_string()]),
            gone: HashSet::new(),
            reclaimed: Mutex::new(Vec::new()),
        };

        let report = f.cleaner.sweep_once(&target, Duration::from_secs(60)).await;

        assert_eq!(report.reclaimed, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(report.failed, vec!["b".to_string()]);
        assert_eq!(report.locks_removed, vec!["orphan".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_counts_vanished_sandbox_as_reclaimed() {
        let f = fixture();
        let target = FakeTarget {
            inactive: vec!["a".to_string(), "gone".to_string()],
            failing: HashSet::new(),
            gone: HashSet::from(["gone".to_string()]),
            reclaimed: Mutex::new(Vec::new()),
        };

        let report = f.cleaner.sweep_once(&target, Duration::from_secs(60)).await;

        assert_eq!(report.reclaimed, vec!["a".to_string(), "gone".to_string()]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_sweep_runs_periodically() {
        let f = fixture();
        let target = Arc::new(FakeTarget {
            inactive: vec!["a".to_string()],
            failing: HashSet::new(),
            gone: HashSet::new(),
            reclaimed: Mutex::new(Vec::new()),
        });

        let handle = f.cleaner.spawn_inactivity_sweep(
            Arc::clone(&target) as Arc<dyn SweepTarget>,
            Duration::from_millis(20),
            Duration::from_secs(60),
        );
        tokio::time::sleep(Duration::from_millis(110)).await;
        handle.abort();

        assert!(target.reclaimed.lock().unwrap().len() >= 2);
    }
}
