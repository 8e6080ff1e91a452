//! Lifecycle of databases the sandboxes depend on.
//!
//! Vector and graph stores are opaque to the orchestrator: it only starts
//! them, asks whether they are healthy, and stops them.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::DatabaseEntry;
use crate::resources::ResourceQuantity;
use crate::runtime::network::MANAGED_LABEL;
use crate::runtime::{
    ignore_not_found, ContainerRuntime, ContainerSpec, ContainerStatus, HealthState, RuntimeError,
};

/// Label carrying the name of a database container.
pub(crate) const DATABASE_LABEL: &str = "sandbox.database";

/// Error reported by a database lifecycle operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Database {name}: {message}")]
pub struct DatabaseError {
    pub name: String,
    pub message: String,
}

impl DatabaseError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// A dependent database that can be started, health checked and stopped.
#[async_trait]
pub(crate) trait DatabaseLifecycle: Send + Sync {
    /// Short identifier used in logs and failure reports.
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), DatabaseError>;

    /// Returns true once the database accepts requests.
    async fn health_check(&self) -> bool;

    async fn stop(&self) -> Result<(), DatabaseError>;
}

/// A database run as a managed container.
pub(crate) struct ContainerDatabase {
    name: String,
    spec: ContainerSpec,
    runtime: Arc<dyn ContainerRuntime>,
    stop_timeout: Duration,
}

impl ContainerDatabase {
    pub fn new(
        entry: &DatabaseEntry,
        runtime: Arc<dyn ContainerRuntime>,
        stop_timeout: Duration,
    ) -> Self {
        let labels = BTreeMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (DATABASE_LABEL.to_string(), entry.name.clone()),
        ]);
        Self {
            name: entry.name.clone(),
            spec: ContainerSpec {
                name: format!("sandboxd-db-{}", entry.name),
                image: entry.image.clone(),
                network: None,
                ports: entry.ports.clone(),
                env: entry.environment.clone(),
                labels,
                limits: ResourceQuantity::ZERO,
                health_command: entry.health_command.clone(),
            },
            runtime,
            stop_timeout,
        }
    }

    fn fail(&self, e: RuntimeError) -> DatabaseError {
        DatabaseError::new(&self.name, e.to_string())
    }

    async fn remove_container(&self) -> Result<(), RuntimeError> {
        ignore_not_found(self.runtime.stop(&self.spec.name, self.stop_timeout).await)?;
        ignore_not_found(self.runtime.remove(&self.spec.name, true).await)
    }
}

#[async_trait]
impl DatabaseLifecycle for ContainerDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    /// Replaces any container left over from an earlier run.
    async fn start(&self) -> Result<(), DatabaseError> {
        self.remove_container().await.map_err(|e| self.fail(e))?;
        let id = self
            .runtime
            .run_container(&self.spec)
            .await
            .map_err(|e| self.fail(e))?;
        debug!(database = %self.name, container_id = %id, "Started database container");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match self.runtime.inspect(&self.spec.name).await {
            Ok(state) => {
                state.status == ContainerStatus::Running
                    && matches!(state.health, None | Some(HealthState::Healthy))
            }
            Err(e) => {
                debug!(database = %self.name, "Database health check failed: {}", e);
                false
            }
        }
    }

    async fn stop(&self) -> Result<(), DatabaseError> {
        self.remove_container().await.map_err(|e| self.fail(e))
    }
}

#[cfg(test)]
pub(crate) use fake::FakeDatabase;

#[cfg(test)]
mod fake {
    use super::{async_trait, DatabaseError, DatabaseLifecycle};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Database double that counts calls.
    #[derive(Debug)]
    pub(crate) struct FakeDatabase {
        name: String,
        pub running: AtomicBool,
        pub healthy: AtomicBool,
        pub fail_start: AtomicBool,
        pub fail_stop: AtomicBool,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
    }

    impl FakeDatabase {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                running: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                fail_start: AtomicBool::new(false),
                fail_stop: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DatabaseLifecycle for FakeDatabase {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<(), DatabaseError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(DatabaseError::new(&self.name, "failed to start"));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn health_check(&self) -> bool {
            self.is_running() && self.healthy.load(Ordering::SeqCst)
        }

        async fn stop(&self) -> Result<(), DatabaseError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(DatabaseError::new(&self.name, "failed to stop"));
            }
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }
}
