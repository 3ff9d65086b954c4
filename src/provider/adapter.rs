//! Provider adapter capability.
//!
//! Every resource type is provisioned through the same capability set; an
//! adapter may complete an operation immediately or hand back a pending
//! operation the executor polls until it settles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProviderError;
use crate::planner::Action;
use crate::resource::{Attributes, ResolvedDescriptor, ResourceId, ResourceType};

/// Outcome of a provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    /// The operation finished; attributes are final.
    Complete(Attributes),
    /// The operation is still running at the provider.
    InProgress(PendingOperation),
}

/// An operation accepted by a provider but not finished yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Provider-assigned operation id.
    pub id: String,
    /// Resource the operation targets.
    pub resource: ResourceId,
    /// Operation kind.
    pub action: Action,
}

/// Identity of a resource that already exists at the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Resource id.
    pub id: ResourceId,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Provider-facing name.
    pub physical_name: String,
    /// Attributes published by the last successful operation.
    pub attributes: Attributes,
}

impl From<&ResolvedDescriptor> for ResourceHandle {
    fn from(resolved: &ResolvedDescriptor) -> Self {
        Self {
            id: resolved.id.clone(),
            resource_type: resolved.resource_type,
            physical_name: resolved.physical_name.clone(),
            attributes: Attributes::new(),
        }
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.action, self.resource, self.id)
    }
}

/// Capability set a provider offers for the resource types it serves.
///
/// The executor never assumes idempotency: each method is called at most
/// once per planned operation, apart from `poll`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &str;

    /// Creates a resource.
    async fn create(&self, resource: &ResolvedDescriptor) -> Result<ProviderResponse, ProviderError>;

    /// Updates a resource in place.
    async fn update(
        &self,
        resource: &ResolvedDescriptor,
        previous: &Attributes,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Deletes a resource. Completing with empty attributes acknowledges.
    async fn delete(&self, resource: &ResourceHandle) -> Result<ProviderResponse, ProviderError>;

    /// Reads the attributes the provider currently reports.
    async fn describe(&self, resource: &ResourceHandle) -> Result<Attributes, ProviderError>;

    /// Checks on a pending operation.
    async fn poll(&self, operation: &PendingOperation) -> Result<ProviderResponse, ProviderError>;

    /// Aborts a pending operation.
    ///
    /// Returns `Ok(false)` when the provider has no cancellation hook; the
    /// caller must then wait for the operation to settle.
    async fn cancel(&self, operation: &PendingOperation) -> Result<bool, ProviderError> {
        let _ = operation;
        Ok(false)
    }
}
