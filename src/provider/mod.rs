//! Provider adapters.
//!
//! Every resource type is created, updated, deleted and described through a
//! [`ProviderAdapter`]. The [`ProviderRegistry`] picks the adapter for a type;
//! [`SimulatedProvider`] keeps resources in memory (optionally snapshotted
//! to disk) and [`HttpProvider`] talks to a provider service.

mod adapter;
mod registry;
mod memory;
mod http;

pub use adapter::{PendingOperation, ProviderAdapter, ProviderResponse, ResourceHandle};
pub use registry::ProviderRegistry;
pub use memory::{ProviderCall, SimulatedProvider, SimulatedResource};
pub use http::HttpProvider;
