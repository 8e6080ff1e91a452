//! Domain-specific error types for orchestrator operations.
//!
//! Typed errors let callers distinguish insufficient capacity from a
//! provisioning failure from a health timeout without parsing messages.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::database::DatabaseError;
use crate::resources::ResourceQuantity;
use crate::runtime::RuntimeError;

/// Admission-time errors. Reported synchronously, never retried internally.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    /// The ledger cannot satisfy every dimension of the request.
    #[error("Insufficient resources: requested {requested}, available {available}")]
    InsufficientResources {
        requested: ResourceQuantity,
        available: ResourceQuantity,
    },

    /// The request contains a negative or non-finite dimension.
    #[error("Invalid resource quantity: {quantity}")]
    InvalidQuantity { quantity: ResourceQuantity },
}

impl ResourceError {
    /// Creates an `InsufficientResources` error.
    pub fn insufficient(requested: ResourceQuantity, available: ResourceQuantity) -> Self {
        Self::InsufficientResources {
            requested,
            available,
        }
    }

    /// Creates an `InvalidQuantity` error.
    pub fn invalid_quantity(quantity: ResourceQuantity) -> Self {
        Self::InvalidQuantity { quantity }
    }

    /// Returns true if capacity was the problem.
    pub fn is_insufficient(&self) -> bool {
        matches!(self, Self::InsufficientResources { .. })
    }
}

/// Terminal outcomes of a health wait other than success.
#[derive(Debug, thiserror::Error)]
pub enum HealthCheckError {
    /// The runtime reports no containers for the sandbox.
    #[error("No containers found for sandbox {sandbox_id}")]
    NoContainersFound { sandbox_id: String },

    /// A container left the running state.
    #[error("Container {container} is not running (status: {status})")]
    ContainerNotRunning { container: String, status: String },

    /// A container with a health check did not become healthy in time.
    #[error("Container {container} did not become healthy within {timeout_secs} seconds")]
    ContainerHealthTimeout { container: String, timeout_secs: u64 },

    /// The overall health budget for the sandbox ran out.
    #[error("Sandbox {sandbox_id} did not become healthy within {timeout_secs} seconds")]
    GlobalHealthTimeout { sandbox_id: String, timeout_secs: u64 },

    /// The runtime could not be queried.
    #[error("Health check failed: {0}")]
    Runtime(#[from] RuntimeError),
}

impl HealthCheckError {
    /// Creates a `ContainerHealthTimeout` error from a `Duration`.
    pub fn container_timeout(container: impl Into<String>, timeout: Duration) -> Self {
        Self::ContainerHealthTimeout {
            container: container.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Creates a `GlobalHealthTimeout` error from a `Duration`.
    pub fn global_timeout(sandbox_id: impl Into<String>, timeout: Duration) -> Self {
        Self::GlobalHealthTimeout {
            sandbox_id: sandbox_id.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Returns true for either timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ContainerHealthTimeout { .. } | Self::GlobalHealthTimeout { .. }
        )
    }
}

/// Failures talking to the gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The gateway has no registration for this sandbox.
    #[error("Sandbox {sandbox_id} is not registered with the gateway")]
    NotFound { sandbox_id: String },

    /// The gateway answered with a non-success status.
    #[error("Gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The request did not complete.
    #[error("Gateway request failed: {message}")]
    Request { message: String },

    /// The response body could not be understood.
    #[error("Invalid gateway response: {message}")]
    InvalidResponse { message: String },
}

impl GatewayError {
    /// Creates a `Request` error.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// Returns true if the sandbox is already unknown to the gateway.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Teardown that did not fully complete.
///
/// Every step is attempted even when earlier ones fail; `failures` holds
/// one entry per failed step (or per failed sandbox for group cleanup).
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to clean up {target}: {}", format_failures(.failures))]
pub struct CleanupError {
    /// Sandbox id or group id the cleanup targeted.
    pub target: String,
    /// Failure reason keyed by step name or sandbox id.
    pub failures: BTreeMap<String, String>,
}

impl CleanupError {
    pub fn new(target: impl Into<String>, failures: BTreeMap<String, String>) -> Self {
        Self {
            target: target.into(),
            failures,
        }
    }

    /// Returns true if the named step (or sandbox) failed.
    pub fn has_failure(&self, key: &str) -> bool {
        self.failures.contains_key(key)
    }
}

fn format_failures(failures: &BTreeMap<String, String>) -> String {
    failures
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The step of provisioning that failed.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningCause {
    /// Registration with the gateway failed.
    #[error("gateway registration failed: {0}")]
    Gateway(#[from] GatewayError),

    /// The sandbox descriptor could not be written.
    #[error("descriptor could not be written: {message}")]
    Descriptor { message: String },

    /// The runtime rejected a network, image or container operation.
    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    /// Containers started but never became healthy.
    #[error("{0}")]
    Health(#[from] HealthCheckError),

    /// Starting the containers took longer than allowed.
    #[error("containers did not start within {timeout_secs} seconds")]
    StartTimeout { timeout_secs: u64 },
}

/// A failed create, after compensating cleanup has run.
///
/// `rollback` is set when the compensating cleanup itself was incomplete,
/// so operators can tell "creation failed" from "creation failed and
/// cleanup also failed".
#[derive(Debug, thiserror::Error)]
#[error(
    "Failed to provision sandbox {sandbox_id}: {cause}{}",
    format_rollback(.rollback.as_ref())
)]
pub struct ProvisioningError {
    pub sandbox_id: String,
    #[source]
    pub cause: ProvisioningCause,
    pub rollback: Option<CleanupError>,
}

impl ProvisioningError {
    /// Returns true if the failure was a health-check failure.
    pub fn is_health_failure(&self) -> bool {
        matches!(self.cause, ProvisioningCause::Health(_))
    }

    /// Returns true if rollback left resources behind.
    pub fn rollback_incomplete(&self) -> bool {
        self.rollback.is_some()
    }
}

fn format_rollback(rollback: Option<&CleanupError>) -> String {
    rollback
        .map(|r| format!(" (rollback incomplete: {r})"))
        .unwrap_or_default()
}

/// Errors returned by the sandbox manager's public operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// No sandbox with this id is tracked.
    #[error("Sandbox not found: {id}")]
    NotFound { id: String },

    /// A sandbox with this id is already tracked.
    #[error("Sandbox already exists: {id}")]
    AlreadyExists { id: String },

    /// The id cannot be used as a container label or directory name.
    #[error("Invalid sandbox id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },
}

impl SandboxError {
    /// Creates a `NotFound` error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Returns true if the request was rejected for lack of capacity.
    pub fn is_resource_error(&self) -> bool {
        matches!(self, Self::Resource(_))
    }

    /// Returns true if provisioning failed after admission.
    pub fn is_provisioning_error(&self) -> bool {
        matches!(self, Self::Provisioning(_))
    }

    /// Returns true if the sandbox is unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
