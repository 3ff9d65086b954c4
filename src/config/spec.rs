//! Configuration specification types for stackwright.
//!
//! This module defines the structs that map to the `stackwright.yaml` stack
//! document. The document is loaded once at startup and never mutated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

use crate::network::SubnetTier;
use crate::resource::{ResourceDescriptor, Value};

/// The root configuration structure for a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Address space and subnet tiers.
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    /// Executor tuning.
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    /// Resources of the stack.
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    /// Named stack outputs, resolved once the stack settles.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProjectConfig {
    /// Unique name for the project.
    #[validate(length(min = 1, max = 40, message = "project name must be 1-40 characters"))]
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    #[validate(length(min = 1, max = 20, message = "environment must be 1-20 characters"))]
    pub environment: String,
    /// Target region.
    #[serde(default = "default_region")]
    #[validate(length(min = 1, message = "region cannot be empty"))]
    pub region: String,
    /// Target account id.
    #[serde(default)]
    #[validate(length(equal = 12, message = "account id must be 12 digits"))]
    pub account: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Network address space configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct NetworkConfig {
    /// Base IPv4 block.
    #[serde(default = "default_cidr")]
    pub cidr: String,
    /// Number of availability zones.
    #[serde(default = "default_zones")]
    #[validate(range(min = 1, max = 6, message = "zones must be between 1 and 6"))]
    pub zones: u8,
    /// Subnet tiers, allocated in this order.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<SubnetTier>,
    /// Fixed subnet prefix length; derived from the subnet count when absent.
    #[serde(default)]
    #[validate(range(min = 16, max = 28, message = "subnet prefix must be between 16 and 28"))]
    pub subnet_prefix: Option<u8>,
    /// NAT gateways serving the egress tier.
    #[serde(default = "default_nat_gateways")]
    pub nat_gateways: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: default_cidr(),
            zones: default_zones(),
            tiers: default_tiers(),
            subnet_prefix: None,
            nat_gateways: default_nat_gateways(),
        }
    }
}

/// When the reconciling phase describes resources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriftCheck {
    /// Describe every provisioned resource after every pass, even one with
    /// nothing to do.
    Always,
    /// Describe every provisioned resource after a pass that ran operations.
    #[default]
    AfterChanges,
    /// Skip the reconciling phase.
    Never,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct OrchestrationConfig {
    /// Upper bound for a single provider operation, polling included.
    #[serde(default = "default_operation_timeout")]
    #[validate(range(min = 1, max = 86_400, message = "operation timeout must be 1-86400 seconds"))]
    pub operation_timeout_secs: u64,
    /// Delay between polls of an in-progress operation.
    #[serde(default = "default_poll_interval")]
    #[validate(range(min = 10, max = 60_000, message = "poll interval must be 10-60000 ms"))]
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent provider operations.
    #[serde(default = "default_max_parallel")]
    #[validate(range(min = 1, max = 64, message = "max_parallel must be 1-64"))]
    pub max_parallel: usize,
    /// Reconciling phase behavior.
    #[serde(default)]
    pub drift_check: DriftCheck,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_parallel: default_max_parallel(),
            drift_check: DriftCheck::default(),
        }
    }
}

impl OrchestrationConfig {
    /// Returns the operation timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Returns the poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// Default value functions

const fn default_zones() -> u8 {
    2
}

const fn default_nat_gateways() -> u8 {
    2
}

const fn default_operation_timeout() -> u64 {
    1800
}

const fn default_poll_interval() -> u64 {
    2000
}

const fn default_max_parallel() -> usize {
    4
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_region() -> String {
    String::from("us-east-1")
}

fn default_cidr() -> String {
    String::from("10.0.0.0/16")
}

fn default_tiers() -> Vec<SubnetTier> {
    vec![
        SubnetTier::Public,
        SubnetTier::PrivateWithEgress,
        SubnetTier::PrivateIsolated,
    ]
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceType;

    #[test]
    fn test_minimal_document_defaults() {
        let yaml = r"
project:
  name: shop
resources:
  - id: files
    type: bucket
";
        let config: StackConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.project.region, "us-east-1");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(config.network.is_none());
        assert_eq!(config.orchestration.max_parallel, 4);
        assert_eq!(config.orchestration.drift_check, DriftCheck::AfterChanges);
        assert_eq!(config.resources[0].resource_type, ResourceType::Bucket);
        assert_eq!(config.qualified_name(), "shop-dev");
    }

    #[test]
    fn test_network_defaults() {
        let yaml = r"
project:
  name: shop
network: {}
";
        let config: StackConfig = serde_yaml::from_str(yaml).unwrap();
        let network = config.network.unwrap();
        assert_eq!(network, NetworkConfig::default());
        assert_eq!(network.tiers.len(), 3);
    }

    #[test]
    fn test_durations() {
        let orchestration = OrchestrationConfig::default();
        assert_eq!(orchestration.operation_timeout(), Duration::from_secs(1800));
        assert_eq!(orchestration.poll_interval(), Duration::from_millis(2000));
    }
}
