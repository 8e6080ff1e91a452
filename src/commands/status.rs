//! Show managed sandboxes as seen by the container runtime.
//!
//! Works without a running orchestrator: containers are grouped by their
//! `sandbox.id` label and joined with the descriptors in the working
//! directory.

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use crate::config::Config;
use crate::descriptor::SandboxDescriptor;
use crate::runtime::network::{managed_filter, sandbox_id_of};
use crate::runtime::{ContainerRuntime, ContainerStatus, ContainerSummary, DockerRuntime};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ContainerLine {
    name: String,
    status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
struct SandboxSummary {
    endpoint: Option<String>,
    containers: Vec<ContainerLine>,
}

/// Groups managed containers by owning sandbox.
fn group_containers(containers: &[ContainerSummary]) -> BTreeMap<String, SandboxSummary> {
    let mut groups: BTreeMap<String, SandboxSummary> = BTreeMap::new();
    for container in containers {
        let Some(id) = sandbox_id_of(&container.labels) else {
            continue;
        };
        groups
            .entry(id.to_string())
            .or_default()
            .containers
            .push(ContainerLine {
                name: container.name.clone(),
                status: container.status.to_string(),
            });
    }
    groups
}

/// Formats the status table with colored output.
fn format_status(groups: &BTreeMap<String, SandboxSummary>) -> String {
    let mut out = String::new();

    if groups.is_empty() {
        let _ = writeln!(&mut out, "\n{} No managed sandboxes found.", "ℹ".blue());
        let _ = writeln!(&mut out, "  Run {} to start some.", "sandboxd run".green());
        return out;
    }

    let _ = writeln!(&mut out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(&mut out, "{}", "   Sandboxes".yellow().bold());
    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());

    for (id, summary) in groups {
        let _ = writeln!(&mut out, "  {}", id.cyan().bold());
        if let Some(endpoint) = &summary.endpoint {
            let _ = writeln!(&mut out, "    Endpoint:  {}", endpoint.cyan());
        }
        for container in &summary.containers {
            let status = if container.status == ContainerStatus::Running.to_string() {
                container.status.green()
            } else {
                container.status.red()
            };
            let _ = writeln!(&mut out, "    {:<30} {}", container.name, status);
        }
    }

    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());
    out
}

/// Entry point: queries Docker and prints the managed sandboxes.
pub async fn run(config_path: &Path, json: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let runtime = DockerRuntime::connect()
        .await
        .context("Failed to connect to Docker")?;

    let containers = runtime
        .list_containers(&managed_filter())
        .await
        .context("Failed to list containers")?;

    let mut groups = group_containers(&containers);
    for (id, summary) in &mut groups {
        if let Some(descriptor) = SandboxDescriptor::load(&config.orchestrator.workdir, id)? {
            summary.endpoint = Some(descriptor.endpoint);
        }
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&groups).context("Failed to serialize status")?
        );
    } else {
        print!("{}", format_status(&groups));
    }
    Ok(())
}
