//! Sandbox groups and the databases they share.

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{CreateRequest, SandboxEndpoint, SandboxManager};
use crate::database::{DatabaseError, DatabaseLifecycle};
use crate::error::{CleanupError, SandboxError};

impl SandboxManager {
    /// Creates several sandboxes concurrently.
    ///
    /// All or nothing: if any member fails, the members that were created
    /// are deleted again and the first failure (in request order) is
    /// returned.
    pub async fn create_sandbox_group(
        &self,
        requests: Vec<CreateRequest>,
    ) -> Result<Vec<SandboxEndpoint>, SandboxError> {
        info!(count = requests.len(), "Creating sandbox group");

        let results = join_all(requests.into_iter().map(|request| async move {
            let id = request.sandbox_id.clone();
            (id, self.create_sandbox(request).await)
        }))
        .await;

        let mut created = Vec::new();
        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(endpoint) => created.push(endpoint),
                Err(e) => {
                    error!(sandbox_id = %id, "Group member failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(err) = first_error else {
            return Ok(created);
        };

        let rollbacks = join_all(created.iter().map(|endpoint| async move {
            (
                endpoint.sandbox_id.as_str(),
                self.delete_sandbox(&endpoint.sandbox_id).await,
            )
        }))
        .await;
        for (id, result) in rollbacks {
            if let Err(e) = result {
                warn!(sandbox_id = id, "Failed to roll back group member: {}", e);
            }
        }
        Err(err)
    }

    /// Deletes several sandboxes concurrently, collecting every failure.
    ///
    /// Members that are already gone count as deleted.
    pub async fn delete_sandbox_group(
        &self,
        group_id: &str,
        sandbox_ids: &[String],
    ) -> Result<(), SandboxError> {
        info!(group_id, count = sandbox_ids.len(), "Deleting sandbox group");

        let results = join_all(sandbox_ids.iter().map(|id| async move {
            (id.clone(), self.delete_sandbox(id).await)
        }))
        .await;

        let failures: BTreeMap<String, String> = results
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(()) | Err(SandboxError::NotFound { .. }) => None,
                Err(e) => {
                    error!(group_id, sandbox_id = %id, "Failed to delete group member: {}", e);
                    Some((id, e.to_string()))
                }
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError::new(group_id, failures).into())
        }
    }

    /// Starts every registered database and waits for it to report healthy.
    ///
    /// If one fails, every database started so far is stopped again.
    pub async fn start_databases(&self) -> Result<(), SandboxError> {
        let mut started = self.started_databases.lock().await;

        for database in &self.databases {
            if started.iter().any(|d| Arc::ptr_eq(d, database)) {
                continue;
            }

            let result = self.start_database(database.as_ref()).await;
            // A failed start may still have left something running
            started.push(Arc::clone(database));

            if let Err(e) = result {
                error!(database = database.name(), "Failed to start database: {}", e);
                for database in started.drain(..).rev() {
                    if let Err(stop_err) = database.stop().await {
                        warn!(
                            database = database.name(),
                            "Failed to stop database: {}", stop_err
                        );
                    }
                }
                return Err(e.into());
            }
            info!(database = database.name(), "Database started");
        }
        Ok(())
    }

    async fn start_database(&self, database: &dyn DatabaseLifecycle) -> Result<(), DatabaseError> {
        database.start().await?;

        self.settings
            .retry
            .run("Database health check", || async move {
                if database.health_check().await {
                    Ok(())
                } else {
                    Err(DatabaseError::new(database.name(), "health check failed"))
                }
            })
            .await
    }

    /// Stops started databases in reverse start order.
    pub async fn stop_databases(&self) -> Result<(), CleanupError> {
        let mut started = self.started_databases.lock().await;
        let timeout = self.settings.database_stop_timeout;
        let mut failures = BTreeMap::new();

        for database in started.drain(..).rev() {
            match tokio::time::timeout(timeout, database.stop()).await {
                Ok(Ok(())) => info!(database = database.name(), "Database stopped"),
                Ok(Err(e)) => {
                    failures.insert(database.name().to_string(), e.message);
                }
                Err(_) => {
                    failures.insert(
                        database.name().to_string(),
                        format!("did not stop within {}s", timeout.as_secs()),
                    );
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            let err = CleanupError::new("databases", failures);
            error!("{}", err);
            Err(err)
        }
    }
}
