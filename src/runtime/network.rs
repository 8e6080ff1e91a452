//! Naming and labelling conventions for sandbox containers and networks.
//!
//! Every object the orchestrator creates carries `sandbox.managed=true`
//! and `sandbox.id=<id>`, which is how teardown and health checks find
//! them again without any other bookkeeping.

use std::collections::BTreeMap;

use crate::error::SandboxError;

/// Label carrying the owning sandbox id.
pub(crate) const SANDBOX_ID_LABEL: &str = "sandbox.id";

/// Label marking objects created by this orchestrator.
pub(crate) const MANAGED_LABEL: &str = "sandbox.managed";

/// Label filter selecting every object of one sandbox.
pub(crate) fn sandbox_filter(sandbox_id: &str) -> String {
    format!("{SANDBOX_ID_LABEL}={sandbox_id}")
}

/// Label filter selecting every managed object.
pub(crate) fn managed_filter() -> String {
    format!("{MANAGED_LABEL}=true")
}

/// Labels applied to every object created for `sandbox_id`.
pub(crate) fn sandbox_labels(sandbox_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (SANDBOX_ID_LABEL.to_string(), sandbox_id.to_string()),
    ])
}

/// Name of the private network for a sandbox.
pub(crate) fn network_name(sandbox_id: &str) -> String {
    format!("sandbox-{sandbox_id}-net")
}

/// Name of one service container within a sandbox.
pub(crate) fn container_name(sandbox_id: &str, service: &str) -> String {
    format!("sandbox-{sandbox_id}-{service}")
}

/// Recovers the sandbox id from a network created by [`network_name`].
pub(crate) fn sandbox_id_of_network(name: &str) -> Option<&str> {
    name.strip_prefix("sandbox-")?
        .strip_suffix("-net")
        .filter(|id| !id.is_empty())
}

/// Extracts the owning sandbox id from an object's labels.
pub(crate) fn sandbox_id_of(labels: &BTreeMap<String, String>) -> Option<&str> {
    labels.get(SANDBOX_ID_LABEL).map(String::as_str)
}

/// Sandbox ids end up in container names, labels and directory names.
pub(crate) fn validate_sandbox_id(id: &str) -> Result<(), SandboxError> {
    let invalid = |reason| SandboxError::InvalidId {
        id: id.to_string(),
        reason,
    };

    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id.len() > 64 {
        return Err(invalid("must be at most 64 characters"));
    }
    if id.starts_with(['.', '-']) {
        return Err(invalid("must start with a letter, digit or underscore"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(invalid("may only contain letters, digits, '_', '.' and '-'"));
    }
    Ok(())
}
