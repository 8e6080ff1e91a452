//! Tear down sandboxes left behind by a previous run.
//!
//! Core logic decides which sandboxes to clean from what the runtime and the
//! working directory report. Formatting is pure. IO happens only at the top
//! level.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cleanup::{CleanerSettings, ResourceCleaner};
use crate::config::Config;
use crate::error::CleanupError;
use crate::gateway::HttpGateway;
use crate::locks::LockTable;
use crate::runtime::network::{
    managed_filter, sandbox_id_of, sandbox_id_of_network, validate_sandbox_id,
};
use crate::runtime::{ContainerRuntime, ContainerSummary, DockerRuntime};

/// Group id reported when several sandboxes are cleaned at once.
const CLEAN_GROUP: &str = "clean";

/// Every sandbox id with a trace in the runtime or the working directory.
fn discover_sandboxes(
    containers: &[ContainerSummary],
    networks: &[String],
    descriptor_dirs: &[String],
) -> BTreeSet<String> {
    containers
        .iter()
        .filter_map(|c| sandbox_id_of(&c.labels))
        .chain(networks.iter().filter_map(|n| sandbox_id_of_network(n)))
        .chain(descriptor_dirs.iter().map(String::as_str))
        .map(str::to_string)
        .collect()
}

/// Rejects invocations that name no sandboxes, or both ids and `--all`.
fn check_selection(ids: &[String], all: bool) -> Result<()> {
    match (all, ids.is_empty()) {
        (true, false) => bail!("Pass sandbox ids or --all, not both"),
        (false, true) => bail!("Pass one or more sandbox ids, or --all"),
        _ => Ok(()),
    }
}

/// Sandboxes to clean: the named ones, or everything discovered with `--all`.
///
/// A named id that is not a valid sandbox id is an error. Discovered names
/// that are not valid ids (stray directories, foreign labels) are skipped.
fn sandboxes_to_clean(
    ids: &[String],
    all: bool,
    discovered: &BTreeSet<String>,
) -> Result<Vec<String>> {
    check_selection(ids, all)?;
    if all {
        Ok(discovered
            .iter()
            .filter(|id| match validate_sandbox_id(id) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping {}", e);
                    false
                }
            })
            .cloned()
            .collect())
    } else {
        for id in ids {
            validate_sandbox_id(id)?;
        }
        let unique: BTreeSet<&String> = ids.iter().collect();
        Ok(unique.into_iter().cloned().collect())
    }
}

/// Formats the clean results as a displayable string.
fn format_results(targets: &[String], failure: Option<&CleanupError>) -> String {
    let mut out = String::new();
    if targets.is_empty() {
        let _ = writeln!(&mut out, "\n{} No sandboxes found to clean.", "ℹ".blue());
        return out;
    }

    let failed = |id: &str| failure.and_then(|f| f.failures.get(id));
    let _ = writeln!(&mut out, "\n{} Cleaned sandboxes:", "✓".green());
    for id in targets {
        let _ = match failed(id.as_str()) {
            None => writeln!(&mut out, "  {} {}", "✗".red(), id.dimmed()),
            Some(reason) => writeln!(
                &mut out,
                "  {} {} {}",
                "!".yellow().bold(),
                id.cyan(),
                reason.yellow()
            ),
        };
    }
    out
}

/// Lists sandbox directories under `workdir`. A missing directory is empty.
fn descriptor_dirs(workdir: &Path) -> Result<Vec<String>> {
    if !workdir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(workdir)
        .with_context(|| format!("Failed to read {}", workdir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
    }
    Ok(ids)
}

/// Entry point: cleans with the real runtime, gateway and filesystem.
pub async fn run(config_path: &Path, ids: &[String], all: bool) -> Result<()> {
    check_selection(ids, all)?;
    for id in ids {
        validate_sandbox_id(id)?;
    }
    let config = Config::load(config_path)?;
    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .context("Failed to connect to Docker")?,
    );
    let gateway = HttpGateway::new(
        &config.gateway.url,
        Duration::from_secs(config.gateway.request_timeout_secs),
    )
    .context("Failed to create gateway client")?;

    let discovered = if all {
        let containers = runtime.list_containers(&managed_filter()).await?;
        let networks = runtime.list_networks(&managed_filter()).await?;
        let dirs = descriptor_dirs(&config.orchestrator.workdir)?;
        discover_sandboxes(&containers, &networks, &dirs)
    } else {
        BTreeSet::new()
    };
    let targets = sandboxes_to_clean(ids, all, &discovered)?;

    let cleaner = ResourceCleaner::new(
        runtime,
        Arc::new(gateway),
        Arc::new(LockTable::new()),
        CleanerSettings {
            workdir: config.orchestrator.workdir.clone(),
            stop_timeout: Duration::from_secs(config.timeouts.container_stop_secs),
            database_stop_timeout: Duration::from_secs(config.timeouts.database_stop_secs),
            retry: config.retry.policy(),
        },
    );

    let timeout = Duration::from_secs(config.timeouts.cleanup_secs);
    let result = cleaner
        .cleanup_group(CLEAN_GROUP, &targets, None, timeout)
        .await;

    print!("{}", format_results(&targets, result.as_ref().err()));
    result.map_err(Into::into)
}
