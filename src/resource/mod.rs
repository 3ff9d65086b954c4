//! Resource model.
//!
//! Descriptors declare resources; property values are literals or references
//! to attributes other resources publish once provisioned.

mod descriptor;
mod value;

pub use descriptor::{ResolvedDescriptor, ResourceDescriptor, ResourceId, ResourceType};
pub use value::{Attributes, Join, Reference, Value};
