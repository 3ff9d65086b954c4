//! Resource descriptors.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::value::{Reference, Value};
use crate::network::{Reachability, SecurityRule, SubnetTier};

/// Unique identifier of a resource within a stack.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ResourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of resources a stack can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Virtual network with subnets across zones.
    Network,
    /// Standalone security group.
    SecurityGroup,
    /// Jump host in a public subnet.
    BastionHost,
    /// Managed relational or document database cluster.
    Database,
    /// Generated credentials.
    Secret,
    /// Container image registry.
    ContainerRegistry,
    /// Container cluster.
    ContainerCluster,
    /// Container service, optionally behind a load balancer.
    ContainerService,
    /// Application load balancer.
    LoadBalancer,
    /// Serverless function.
    Function,
    /// HTTP API front door.
    ApiGateway,
    /// TLS certificate.
    Certificate,
    /// DNS hosted zone.
    DnsZone,
    /// Object storage bucket.
    Bucket,
    /// Content delivery distribution.
    Cdn,
    /// Web application firewall.
    Firewall,
    /// Audit trail.
    AuditTrail,
    /// Log group.
    LogGroup,
}

impl ResourceType {
    /// All resource types, in declaration order.
    pub const ALL: [Self; 18] = [
        Self::Network,
        Self::SecurityGroup,
        Self::BastionHost,
        Self::Database,
        Self::Secret,
        Self::ContainerRegistry,
        Self::ContainerCluster,
        Self::ContainerService,
        Self::LoadBalancer,
        Self::Function,
        Self::ApiGateway,
        Self::Certificate,
        Self::DnsZone,
        Self::Bucket,
        Self::Cdn,
        Self::Firewall,
        Self::AuditTrail,
        Self::LogGroup,
    ];

    /// Returns the snake-case name used in stack documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::SecurityGroup => "security_group",
            Self::BastionHost => "bastion_host",
            Self::Database => "database",
            Self::Secret => "secret",
            Self::ContainerRegistry => "container_registry",
            Self::ContainerCluster => "container_cluster",
            Self::ContainerService => "container_service",
            Self::LoadBalancer => "load_balancer",
            Self::Function => "function",
            Self::ApiGateway => "api_gateway",
            Self::Certificate => "certificate",
            Self::DnsZone => "dns_zone",
            Self::Bucket => "bucket",
            Self::Cdn => "cdn",
            Self::Firewall => "firewall",
            Self::AuditTrail => "audit_trail",
            Self::LogGroup => "log_group",
        }
    }

    /// Returns true if resources of this type can open outbound connections.
    #[must_use]
    pub const fn can_originate_traffic(self) -> bool {
        matches!(
            self,
            Self::BastionHost
                | Self::ContainerService
                | Self::LoadBalancer
                | Self::Function
                | Self::ApiGateway
                | Self::Cdn
                | Self::SecurityGroup
        )
    }

    /// Returns true if resources of this type carry an ingress rule set.
    #[must_use]
    pub const fn accepts_ingress(self) -> bool {
        matches!(
            self,
            Self::BastionHost
                | Self::Database
                | Self::ContainerService
                | Self::LoadBalancer
                | Self::Function
                | Self::SecurityGroup
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Unique id within the stack.
    pub id: ResourceId,
    /// Resource kind.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Properties handed to the provider once resolved.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Ordering dependencies not expressed through references.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<ResourceId>,
    /// Subnet tier the resource is placed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<SubnetTier>,
    /// Resources this one must be able to reach.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reachability: Vec<Reachability>,
    /// Inbound rules derived from other resources' reachability.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<SecurityRule>,
}

impl ResourceDescriptor {
    /// Creates a descriptor without properties.
    #[must_use]
    pub fn new(id: impl Into<ResourceId>, resource_type: ResourceType) -> Self {
        Self {
            id: id.into(),
            resource_type,
            properties: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            placement: None,
            reachability: Vec::new(),
            ingress: Vec::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit ordering dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<ResourceId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Places the resource in a subnet tier.
    #[must_use]
    pub const fn with_placement(mut self, tier: SubnetTier) -> Self {
        self.placement = Some(tier);
        self
    }

    /// Adds a reachability declaration.
    #[must_use]
    pub fn with_reachability(mut self, reachability: Reachability) -> Self {
        self.reachability.push(reachability);
        self
    }

    /// Returns every reference in the properties with its property path.
    #[must_use]
    pub fn references(&self) -> Vec<(String, &Reference)> {
        let mut out = Vec::new();
        for (key, value) in &self.properties {
            value.collect_references(key, &mut out);
        }
        out
    }

    /// Returns the ids this resource depends on, through references or
    /// explicit `depends_on`.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        self.references()
            .into_iter()
            .map(|(_, r)| r.resource.clone())
            .chain(self.depends_on.iter().cloned())
            .collect()
    }

    /// Returns the provider-facing name of this resource.
    #[must_use]
    pub fn physical_name(&self, project: &str, environment: &str) -> String {
        format!("{project}-{environment}-{}", self.id)
    }
}

/// A descriptor whose references have all been substituted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDescriptor {
    /// Resource id.
    pub id: ResourceId,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Provider-facing name.
    pub physical_name: String,
    /// Literal properties.
    pub properties: BTreeMap<String, Value>,
    /// Inbound rules.
    #[serde(default)]
    pub ingress: Vec<SecurityRule>,
    /// Tags applied to the provisioned resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PortRange, Protocol};

    #[test]
    fn test_descriptor_yaml() {
        let yaml = r#"
id: api
type: container_service
placement: private_with_egress
properties:
  container_port: 4000
  database_url: { ref: database.endpoint }
depends_on: [cluster]
reachability:
  - target: database
    port: 5432
"#;
        let descriptor: ResourceDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.resource_type, ResourceType::ContainerService);
        assert_eq!(descriptor.placement, Some(SubnetTier::PrivateWithEgress));
        assert_eq!(descriptor.reachability[0].ports, PortRange::single(5432));
        assert_eq!(descriptor.reachability[0].protocol, Protocol::Tcp);

        let deps: Vec<ResourceId> = descriptor.dependencies().into_iter().collect();
        assert_eq!(deps, vec![ResourceId::from("cluster"), ResourceId::from("database")]);
    }

    #[test]
    fn test_physical_name() {
        let descriptor = ResourceDescriptor::new("bastion", ResourceType::BastionHost);
        assert_eq!(descriptor.physical_name("shop", "prod"), "shop-prod-bastion");
    }

    #[test]
    fn test_type_capabilities() {
        assert!(ResourceType::ContainerService.can_originate_traffic());
        assert!(!ResourceType::Database.can_originate_traffic());
        assert!(ResourceType::Database.accepts_ingress());
        assert!(!ResourceType::Bucket.accepts_ingress());
        assert_eq!(ResourceType::ALL.len(), 18);
    }
}
