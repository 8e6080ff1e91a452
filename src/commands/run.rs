//! Run the orchestrator until interrupted.
//!
//! Creates the sandboxes listed in the configuration, starts the background
//! loops, and on Ctrl-C tears everything down again.

use anyhow::{Context, Result};
use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, SandboxEntry};
use crate::database::{ContainerDatabase, DatabaseLifecycle};
use crate::gateway::HttpGateway;
use crate::manager::{
    BackgroundSchedule, CreateRequest, ManagerSettings, SandboxManager, StatusReport,
};
use crate::runtime::{ContainerRuntime, DockerRuntime};

/// Outcome of creating one configured sandbox.
type Created = (String, Result<StatusReport, String>);

/// Entry point: runs the orchestrator against Docker and the gateway.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect()
            .await
            .context("Failed to connect to Docker")?,
    );
    let gateway = HttpGateway::new(
        &config.gateway.url,
        Duration::from_secs(config.gateway.request_timeout_secs),
    )
    .context("Failed to create gateway client")?;

    let database_stop = Duration::from_secs(config.timeouts.database_stop_secs);
    let databases = config
        .databases
        .iter()
        .map(|entry| {
            Arc::new(ContainerDatabase::new(entry, Arc::clone(&runtime), database_stop))
                as Arc<dyn DatabaseLifecycle>
        })
        .collect();

    let manager = Arc::new(
        SandboxManager::new(
            ManagerSettings::from_config(&config),
            config.capacity,
            runtime,
            Arc::new(gateway),
        )
        .with_databases(databases),
    );

    manager.start_databases().await?;

    let created = create_configured(&manager, &config).await;
    print!("{}", format_created(&created));

    manager.spawn_background_tasks(BackgroundSchedule::from_config(&config));
    let ledger = manager.ledger_snapshot().await;
    info!(
        capacity = %ledger.total,
        reserved = %ledger.used,
        available = %ledger.available,
        sandboxes = created.iter().filter(|(_, r)| r.is_ok()).count(),
        "Orchestrator running"
    );
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!();

    info!(sandboxes = ?manager.list_statuses().await, "Stopping orchestrator");
    manager.shutdown().await?;
    println!("{} All sandboxes stopped.", "✓".green());
    Ok(())
}

/// Splits configured entries into standalone requests and named groups.
fn plan_creates(
    entries: &[SandboxEntry],
) -> (Vec<CreateRequest>, BTreeMap<String, Vec<CreateRequest>>) {
    let mut single = Vec::new();
    let mut groups: BTreeMap<String, Vec<CreateRequest>> = BTreeMap::new();
    for entry in entries {
        let request = CreateRequest::from(entry);
        match &entry.group {
            Some(group) => groups.entry(group.clone()).or_default().push(request),
            None => single.push(request),
        }
    }
    (single, groups)
}

/// Creates every `[[sandbox]]` entry and reports its status.
///
/// Standalone entries are created one by one, so one failure does not stop
/// the rest. A group is created all or nothing.
async fn create_configured(manager: &SandboxManager, config: &Config) -> Vec<Created> {
    let (single, groups) = plan_creates(&config.sandboxes);
    let mut outcomes: Vec<(String, Result<(), String>)> = Vec::new();

    for request in single {
        let id = request.sandbox_id.clone();
        let result = manager.create_sandbox(request).await.map(|_| ()).map_err(|e| {
            warn!(sandbox_id = %id, "Failed to create sandbox: {}", e);
            e.to_string()
        });
        outcomes.push((id, result));
    }

    for (group, requests) in groups {
        let ids: Vec<String> = requests.iter().map(|r| r.sandbox_id.clone()).collect();
        match manager.create_sandbox_group(requests).await {
            Ok(_) => outcomes.extend(ids.into_iter().map(|id| (id, Ok(())))),
            Err(e) => {
                warn!(group = %group, "Failed to create sandbox group: {}", e);
                let message = format!("group {group}: {e}");
                outcomes.extend(ids.into_iter().map(|id| (id, Err(message.clone()))));
            }
        }
    }

    let mut created = Vec::new();
    for (id, outcome) in outcomes {
        let result = match outcome {
            Ok(()) => manager.get_status(&id).await.map_err(|e| e.to_string()),
            Err(message) => Err(message),
        };
        created.push((id, result));
    }
    created
}

/// Formats the startup summary. API keys are never part of it.
fn format_created(created: &[Created]) -> String {
    let mut out = String::new();
    if created.is_empty() {
        let _ = writeln!(
            &mut out,
            "\n{} No sandboxes configured; waiting for work.",
            "ℹ".blue()
        );
        return out;
    }

    let _ = writeln!(&mut out, "\n{}", "Sandboxes:".bold());
    for (id, result) in created {
        match result {
            Ok(report) => {
                let endpoint = report.endpoint.as_deref().unwrap_or("-");
                let _ = writeln!(
                    &mut out,
                    "  {} {} {}",
                    "✓".green(),
                    id.cyan(),
                    endpoint.dimmed()
                );
                for container in &report.containers {
                    let health = container
                        .health
                        .map(|h| format!(" ({h})"))
                        .unwrap_or_default();
                    let _ = writeln!(
                        &mut out,
                        "      {:<30} {}{}",
                        container.name, container.status, health
                    );
                }
            }
            Err(message) => {
                let _ = writeln!(&mut out, "  {} {} {}", "✗".red(), id.cyan(), message);
            }
        }
    }
    out
}
