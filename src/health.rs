//! Waiting for a freshly started sandbox to become healthy.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::HealthCheckError;
use crate::runtime::network::sandbox_filter;
use crate::runtime::{ContainerRuntime, ContainerStatus, HealthState};

/// Polls a sandbox's containers until all of them are healthy.
pub(crate) struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
}

enum Progress {
    Healthy,
    Pending,
}

impl HealthMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, poll_interval: Duration) -> Self {
        Self {
            runtime,
            poll_interval,
        }
    }

    /// Waits until every container labelled with `sandbox_id` is running and,
    /// if it declares a health check, healthy.
    ///
    /// A container that stops running fails the wait immediately. A container
    /// still not healthy `per_container_timeout` after it started fails with
    /// `ContainerHealthTimeout`, even if the global budget has time left.
    pub async fn wait_until_healthy(
        &self,
        sandbox_id: &str,
        global_timeout: Duration,
        per_container_timeout: Duration,
    ) -> Result<(), HealthCheckError> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            global_timeout,
            self.poll_until_healthy(sandbox_id, per_container_timeout),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                info!(
                    sandbox_id,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Sandbox healthy"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HealthCheckError::global_timeout(sandbox_id, global_timeout)),
        }
    }

    async fn poll_until_healthy(
        &self,
        sandbox_id: &str,
        per_container_timeout: Duration,
    ) -> Result<(), HealthCheckError> {
        let mut first_seen: HashMap<String, Instant> = HashMap::new();
        loop {
            match self
                .check_once(sandbox_id, per_container_timeout, &mut first_seen)
                .await?
            {
                Progress::Healthy => return Ok(()),
                Progress::Pending => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn check_once(
        &self,
        sandbox_id: &str,
        per_container_timeout: Duration,
        first_seen: &mut HashMap<String, Instant>,
    ) -> Result<Progress, HealthCheckError> {
        let containers = self
            .runtime
            .list_containers(&sandbox_filter(sandbox_id))
            .await?;

        if containers.is_empty() {
            return Err(HealthCheckError::NoContainersFound {
                sandbox_id: sandbox_id.to_string(),
            });
        }

        let mut all_healthy = true;
        for container in &containers {
            let state = self.runtime.inspect(&container.id).await?;

            if state.status != ContainerStatus::Running {
                return Err(HealthCheckError::ContainerNotRunning {
                    container: container.name.clone(),
                    status: state.status.to_string(),
                });
            }

            match state.health {
                None | Some(HealthState::Healthy) => {}
                Some(health) => {
                    let seen = *first_seen
                        .entry(container.id.clone())
                        .or_insert_with(Instant::now);
                    let waited = state
                        .started_at
                        .and_then(|t| (Utc::now() - t).to_std().ok())
                        .unwrap_or_else(|| seen.elapsed());

                    if waited >= per_container_timeout {
                        return Err(HealthCheckError::container_timeout(
                            &container.name,
                            per_container_timeout,
                        ));
                    }

                    debug!(
                        sandbox_id,
                        container = %container.name,
                        %health,
                        "Waiting for container health"
                    );
                    all_healthy = false;
                }
            }
        }

        Ok(if all_healthy {
            Progress::Healthy
        } else {
            Progress::Pending
        })
    }
}
