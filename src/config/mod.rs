//! Configuration module for stackwright.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackwright.yaml`
//! - Validation of configuration values and cross-resource references
//! - Computing descriptor hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DriftCheck, NetworkConfig, OrchestrationConfig, ProjectConfig, StackConfig, StateBackend,
    StateConfig,
};
pub use parser::{ConfigParser, PROVIDER_TOKEN_VAR, PROVIDER_URL_VAR, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult, is_valid_name};
pub use hash::ConfigHasher;
