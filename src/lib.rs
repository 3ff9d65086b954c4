// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::too_many_arguments)]
#![warn(clippy::cognitive_complexity)]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackwright
//!
//! Declarative provisioning of cloud stacks driven by a resource dependency
//! graph.
//!
//! ## Overview
//!
//! A stack document declares resources, how they depend on each other and
//! which resources must reach which. Stackwright:
//!
//! - Builds the dependency graph and rejects cycles
//! - Plans creates, updates and deletes in a stable dependency order
//! - Allocates subnets and derives ingress rules from reachability
//! - Executes independent operations concurrently under a timeout
//! - Records state so a settled stack re-runs without provider calls
//!
//! ## Passes
//!
//! Every pass moves through `Planning`, `Executing` and `Reconciling` and ends
//! `Settled` or `Failed`. A failed operation blocks its dependents and is
//! never rolled back; the next pass picks up from the recorded state.
//!
//! ## Modules
//!
//! - [`config`]: Stack document parsing, validation and hashing
//! - [`resource`]: Resource descriptors and property values
//! - [`network`]: Subnet allocation and ingress derivation
//! - [`planner`]: Dependency graph, diff, plan and executor
//! - [`provider`]: Provider adapters (simulated and HTTP)
//! - [`resolver`]: Cross-resource reference resolution
//! - [`state`]: State storage backends (local, S3)
//! - [`orchestrator`]: Pass phases, drift and outputs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   environment: prod
//!   region: eu-west-1
//!
//! resources:
//!   - id: assets
//!     type: bucket
//!   - id: thumbnails
//!     type: function
//!     properties:
//!       bucket_arn: { ref: assets.arn }
//!
//! outputs:
//!   assets_bucket: { ref: assets.name }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod network;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod resolver;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{Result, StackError};
pub use network::{AssembledTopology, NetworkAssembler};
pub use orchestrator::{DriftReport, OrchestrationReport, Orchestrator, Phase, StackOutputs};
pub use planner::{DependencyGraph, DiffEngine, OperationPlan, PlanExecutor};
pub use provider::{HttpProvider, ProviderAdapter, ProviderRegistry, SimulatedProvider};
pub use resolver::{AttributeTable, OutputResolver};
pub use resource::{ResourceDescriptor, ResourceId, ResourceType, Value};
pub use state::{LocalStateStore, S3StateStore, StackState, StateStore};
