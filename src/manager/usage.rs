//! Usage sampling and right-sizing of running sandboxes.

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::{SandboxManager, SandboxStatus};
use crate::error::SandboxError;
use crate::resources::{ResourceQuantity, UsageSample};
use crate::runtime::network::sandbox_filter;
use crate::runtime::{ContainerStatus, ContainerSummary, RuntimeError};

/// New limits for a sandbox given its peak usage.
///
/// Each dimension becomes `peak * factor`, capped at the reservation. A
/// dimension with no observed usage keeps its current limit.
fn right_size(
    peak: ResourceQuantity,
    current: ResourceQuantity,
    reservation: ResourceQuantity,
    factor: f64,
) -> ResourceQuantity {
    let pick = |peak: f64, current: f64, cap: f64| {
        if peak > 0.0 {
            (peak * factor).min(cap)
        } else {
            current
        }
    };
    ResourceQuantity {
        cpu_cores: pick(peak.cpu_cores, current.cpu_cores, reservation.cpu_cores),
        ram_gb: pick(peak.ram_gb, current.ram_gb, reservation.ram_gb),
        disk_gb: pick(peak.disk_gb, current.disk_gb, reservation.disk_gb),
        memory_bandwidth_gbps: pick(
            peak.memory_bandwidth_gbps,
            current.memory_bandwidth_gbps,
            reservation.memory_bandwidth_gbps,
        ),
        network_bandwidth_mbps: pick(
            peak.network_bandwidth_mbps,
            current.network_bandwidth_mbps,
            reservation.network_bandwidth_mbps,
        ),
    }
}

/// Why a running sandbox can no longer serve requests, if it can't.
fn crash_reason(containers: &[ContainerSummary]) -> Option<String> {
    if containers.is_empty() {
        return Some("no containers left".to_string());
    }
    let stopped: Vec<&str> = containers
        .iter()
        .filter(|c| matches!(c.status, ContainerStatus::Exited | ContainerStatus::Dead))
        .map(|c| c.name.as_str())
        .collect();
    (!stopped.is_empty()).then(|| format!("containers stopped: {}", stopped.join(", ")))
}

impl SandboxManager {
    /// Sums current usage across a sandbox's running containers.
    pub(super) async fn measure(&self, sandbox_id: &str) -> Result<ResourceQuantity, RuntimeError> {
        let containers = self
            .runtime
            .list_containers(&sandbox_filter(sandbox_id))
            .await?;
        self.sum_usage(&containers).await
    }

    async fn sum_usage(
        &self,
        containers: &[ContainerSummary],
    ) -> Result<ResourceQuantity, RuntimeError> {
        let mut total = ResourceQuantity::ZERO;
        for container in containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Running)
        {
            total = total + self.runtime.stats(&container.id).await?;
        }
        Ok(total)
    }

    /// Records one usage sample for every running sandbox.
    ///
    /// A sandbox whose CPU use is above the activity threshold counts as
    /// active. A sandbox with an exited, dead or missing container is marked
    /// `Failed` so the next sweep reclaims it. Sampling failures are logged
    /// and skipped.
    pub async fn sample_usage(&self) {
        let ids = self.ids_with_status(&[SandboxStatus::Running]).await;
        let threshold = self.settings.activity_cpu_threshold;

        for id in ids {
            let containers = match self.runtime.list_containers(&sandbox_filter(&id)).await {
                Ok(containers) => containers,
                Err(e) => {
                    warn!(sandbox_id = %id, "Failed to list containers: {}", e);
                    continue;
                }
            };

            if let Some(reason) = crash_reason(&containers) {
                let mut sandboxes = self.sandboxes.write().await;
                if let Some(record) = sandboxes.get_mut(&id) {
                    if record.status() == SandboxStatus::Running {
                        warn!(sandbox_id = %id, "Sandbox failed: {}", reason);
                        record.set_status(SandboxStatus::Failed);
                    }
                }
                continue;
            }

            let usage = match self.sum_usage(&containers).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(sandbox_id = %id, "Failed to sample usage: {}", e);
                    continue;
                }
            };

            if let Some(record) = self.sandboxes.write().await.get_mut(&id) {
                record.history.add_measurement(UsageSample::now(usage));
                debug!(sandbox_id = %id, usage = %usage, "Sampled usage");
            }
            if usage.cpu_cores > threshold {
                if let Err(e) = self.record_activity(&id).await {
                    debug!(sandbox_id = %id, "Sandbox went away while sampling: {}", e);
                }
            }
        }
    }

    /// Marks a sandbox as active now.
    pub async fn record_activity(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let mut sandboxes = self.sandboxes.write().await;
        let record = sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| SandboxError::not_found(sandbox_id))?;
        record.touch();
        Ok(())
    }

    /// Resizes every running sandbox's containers to `factor` times its
    /// peak recent usage, never above what it reserved.
    ///
    /// The ledger is not touched. Returns the ids whose limits changed.
    pub async fn adjust_sandbox_resources(&self, factor: f64) -> Vec<String> {
        let ids = self.ids_with_status(&[SandboxStatus::Running]).await;

        let results = join_all(ids.iter().map(|id| async move {
            (id.clone(), self.adjust_one(id, factor).await)
        }))
        .await;

        let mut adjusted = Vec::new();
        for (id, result) in results {
            match result {
                Ok(true) => adjusted.push(id),
                Ok(false) => {}
                Err(e) => warn!(sandbox_id = %id, "Failed to adjust resources: {}", e),
            }
        }
        if !adjusted.is_empty() {
            info!(count = adjusted.len(), "Adjusted sandbox resources");
        }
        adjusted
    }

    async fn adjust_one(&self, sandbox_id: &str, factor: f64) -> Result<bool, SandboxError> {
        let _guard = self.locks.acquire(sandbox_id).await;

        let (peak, current, reservation) = {
            let sandboxes = self.sandboxes.read().await;
            let Some(record) = sandboxes.get(sandbox_id) else {
                return Ok(false);
            };
            let Some(reservation) = record.reservation else {
                return Ok(false);
            };
            if record.status() != SandboxStatus::Running {
                return Ok(false);
            }
            (record.history.max_usage(), record.limits, reservation)
        };

        if peak.is_zero() {
            debug!(sandbox_id, "No usage observed; keeping limits");
            return Ok(false);
        }

        let limits = right_size(peak, current, reservation, factor);
        if limits == current {
            return Ok(false);
        }

        let containers = self
            .runtime
            .list_containers(&sandbox_filter(sandbox_id))
            .await?;
        for container in containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Running)
        {
            self.runtime.update_limits(&container.id, &limits).await?;
        }

        if let Some(record) = self.sandboxes.write().await.get_mut(sandbox_id) {
            record.limits = limits;
        }
        info!(sandbox_id, from = %current, to = %limits, "Adjusted sandbox limits");
        Ok(true)
    }
}
