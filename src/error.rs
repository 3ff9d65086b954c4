//! Error types for stackwright.
//!
//! This module provides the error hierarchy for every stage of a provisioning
//! pass: configuration, state management, planning, reference resolution,
//! network assembly, provider calls, and orchestration.

use std::path::PathBuf;
use thiserror::Error;

use crate::resource::ResourceId;

/// The main error type for stackwright.
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Resource provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reference resolution errors.
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    /// Network topology errors.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Orchestration errors.
    #[error("Orchestration error: {0}")]
    Orchestrate(#[from] OrchestrateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource id: {id}")]
    DuplicateResource {
        /// The duplicated id.
        id: String,
    },

    /// Invalid port specification.
    #[error("Invalid port specification: {spec}")]
    InvalidPort {
        /// The invalid port specification.
        spec: String,
    },

    /// Invalid reference syntax.
    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference {
        /// The offending reference text.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors raised by resource provider adapters.
///
/// A provider error concerns a single resource: it is reported and blocks the
/// resource's dependents, but never aborts independent branches.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected or failed the operation.
    #[error("Provider operation on '{resource}' failed: {message}")]
    OperationFailed {
        /// Resource the operation targeted.
        resource: String,
        /// Provider message.
        message: String,
    },

    /// API request failed.
    #[error("Provider API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Rate limited.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Resource not found at the provider.
    #[error("Resource not found at provider: {resource}")]
    NotFound {
        /// Resource that was looked up.
        resource: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The operation did not complete within the allowed time.
    #[error("Operation {operation} on '{resource}' timed out after {timeout_secs}s")]
    TimedOut {
        /// Resource the operation targeted.
        resource: String,
        /// Operation kind.
        operation: String,
        /// Configured timeout.
        timeout_secs: u64,
    },

    /// No adapter is registered for the resource type.
    #[error("No provider adapter registered for resource type '{resource_type}'")]
    NoAdapter {
        /// The unhandled resource type.
        resource_type: String,
    },

    /// The operation was aborted through the provider's cancel hook.
    #[error("Operation on '{resource}' was cancelled")]
    Cancelled {
        /// Resource the operation targeted.
        resource: String,
    },
}

/// Planning errors.
///
/// All planning errors are fatal and raised before any provider call.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle {
        /// Ids along the cycle, in traversal order.
        cycle: Vec<ResourceId>,
    },

    /// A descriptor references a resource that is not declared.
    #[error("Resource '{resource}' references undeclared resource '{referenced}'")]
    UnknownReference {
        /// The referencing resource.
        resource: ResourceId,
        /// The missing resource.
        referenced: ResourceId,
    },

    /// An operation would break a dependency.
    #[error("Dependency violation on '{resource}' (dependency '{dependency}'): {reason}")]
    DependencyViolation {
        /// The resource whose operation is invalid.
        resource: ResourceId,
        /// The dependency involved.
        dependency: ResourceId,
        /// Description of the violation.
        reason: String,
    },

    /// A resource's type was changed in place.
    #[error("Resource '{resource}' changed type from {from} to {to}; rename it instead")]
    TypeChanged {
        /// The resource.
        resource: ResourceId,
        /// Recorded type.
        from: String,
        /// Desired type.
        to: String,
    },

    /// A destroy target is not recorded in state.
    #[error("Resource '{resource}' is not recorded in state")]
    UnknownTarget {
        /// The requested target.
        resource: ResourceId,
    },
}

/// Reference resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A reference could not be substituted.
    ///
    /// The scheduler only starts a resource once its dependencies are
    /// provisioned, so this signals a scheduling defect.
    #[error("Unresolved reference {reference} in '{resource}': {reason}")]
    UnresolvedReference {
        /// The resource being resolved.
        resource: ResourceId,
        /// The reference text (`id.attribute`).
        reference: String,
        /// Why it could not be resolved.
        reason: String,
    },

    /// A join part resolved to a non-scalar value.
    #[error("Cannot join non-scalar value in '{resource}' at {path}")]
    NonScalarJoin {
        /// The resource being resolved.
        resource: ResourceId,
        /// Property path of the join.
        path: String,
    },
}

/// Network topology errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The requested subnets do not fit the address block.
    #[error("Address space {cidr} exhausted: {required} subnets of /{prefix} requested, {available} available")]
    AddressSpaceExhausted {
        /// The base block.
        cidr: String,
        /// Number of subnets requested.
        required: usize,
        /// Number of subnets of that size that fit.
        available: usize,
        /// Subnet prefix length.
        prefix: u8,
    },

    /// A CIDR block could not be parsed.
    #[error("Invalid CIDR block '{cidr}': {reason}")]
    InvalidCidr {
        /// The offending text.
        cidr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A reachability declaration cannot produce a security rule.
    #[error("Invalid reachability from '{source_id}' to '{target}': {reason}")]
    InvalidRule {
        /// Resource declaring the reachability.
        source_id: ResourceId,
        /// The target resource.
        target: ResourceId,
        /// Why it was rejected.
        reason: String,
    },

    /// A resource is placed in a tier that has no subnets.
    #[error("Resource '{resource}' is placed in tier '{tier}' but the stack has no such subnets")]
    UnplacedResource {
        /// The resource.
        resource: ResourceId,
        /// The requested tier.
        tier: String,
    },
}

/// Orchestration errors.
#[derive(Debug, Error)]
pub enum OrchestrateError {
    /// The pass ended with failed resources.
    #[error("Provisioning pass failed: {failed} resource(s) failed, {blocked} blocked")]
    PassFailed {
        /// Number of failed resources.
        failed: usize,
        /// Number of blocked resources.
        blocked: usize,
    },

    /// The pass was cancelled.
    #[error("Provisioning pass cancelled: {reason}")]
    Cancelled {
        /// Reason for the cancellation.
        reason: String,
    },

    /// Drift detected and reported.
    #[error("Drift detected on {count} resource(s)")]
    DriftDetected {
        /// Number of drifted resources.
        count: usize,
    },
}

/// Result type alias for stackwright operations.
pub type Result<T> = std::result::Result<T, StackError>;

fn format_cycle(cycle: &[ResourceId]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(ResourceId::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(e) => e.retry_delay_secs(),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if this error must abort the whole pass rather than a
    /// single resource.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Provider(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true if the request may succeed when sent again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::NetworkError { .. } => true,
            Self::ApiRequestFailed { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::NetworkError { .. } => Some(5),
            Self::ApiRequestFailed { status, .. } if *status >= 500 => Some(2),
            _ => None,
        }
    }

    /// Creates an operation failure for a resource.
    #[must_use]
    pub fn failed(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            resource: resource.into(),
            message: message.into(),
        }
    }
}
