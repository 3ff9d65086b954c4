//! Network topology assembly.
//!
//! Before planning, the assembler carves the stack's address block into
//! subnets, derives security rules from reachability declarations and folds
//! both into the descriptors:
//!
//! - `network` resources receive `cidr`, `nat_gateways` and `subnets`
//! - placed resources receive `subnet_tier` and `subnet_cidrs`
//! - rule targets receive `ingress`
//!
//! Rules name their source by id rather than by a provisioned attribute, so
//! they introduce no ordering edge between source and target.

mod security;
mod subnet;

pub use security::{
    Protocol, PortRange, PortSpec, Reachability, SecurityRule, derive_security_rules,
};
pub use subnet::{
    Ipv4Cidr, MAX_SUBNET_PREFIX, SubnetAllocation, SubnetAllocator, SubnetLayout, SubnetTier,
};

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::resource::{ResourceDescriptor, ResourceType, Value};

/// Descriptors enriched with network topology.
#[derive(Debug, Clone)]
pub struct AssembledTopology {
    /// Descriptors with network properties and ingress attached.
    pub descriptors: Vec<ResourceDescriptor>,
    /// Subnet layout, when the stack declares a network.
    pub layout: Option<SubnetLayout>,
    /// All derived rules, ordered by target then source.
    pub rules: Vec<SecurityRule>,
}

/// Assembles subnets and security rules for a stack.
#[derive(Debug, Clone, Copy)]
pub struct NetworkAssembler<'a> {
    network: Option<&'a NetworkConfig>,
    region: &'a str,
}

impl<'a> NetworkAssembler<'a> {
    /// Creates an assembler for the given network section and region.
    #[must_use]
    pub const fn new(network: Option<&'a NetworkConfig>, region: &'a str) -> Self {
        Self { network, region }
    }

    /// Computes the subnet layout, if a network is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the base block is invalid or exhausted.
    pub fn layout(&self) -> Result<Option<SubnetLayout>, NetworkError> {
        let Some(network) = self.network else {
            return Ok(None);
        };
        let base: Ipv4Cidr = network.cidr.parse()?;
        let layout = SubnetAllocator::new(base, network.zones, network.tiers.clone())
            .with_subnet_prefix(network.subnet_prefix)
            .allocate(self.region)?;
        debug!(
            "Allocated {} subnets of /{} in {}",
            layout.subnets.len(),
            layout.subnet_prefix,
            layout.cidr
        );
        Ok(Some(layout))
    }

    /// Assembles the topology for `descriptors`.
    ///
    /// # Errors
    ///
    /// Returns an error if subnets cannot be allocated, a resource is placed
    /// in a tier without subnets, or a reachability declaration is invalid.
    pub fn assemble(
        &self,
        descriptors: &[ResourceDescriptor],
    ) -> Result<AssembledTopology, NetworkError> {
        let layout = self.layout()?;
        let rules = derive_security_rules(descriptors, layout.as_ref())?;

        let mut assembled = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let mut descriptor = descriptor.clone();

            if let Some(tier) = descriptor.placement {
                let cidrs = layout
                    .as_ref()
                    .map(|l| l.cidrs_for(tier))
                    .unwrap_or_default();
                if cidrs.is_empty() {
                    return Err(NetworkError::UnplacedResource {
                        resource: descriptor.id.clone(),
                        tier: tier.to_string(),
                    });
                }
                descriptor
                    .properties
                    .insert("subnet_tier".to_string(), Value::from(tier.as_str()));
                descriptor
                    .properties
                    .insert("subnet_cidrs".to_string(), Value::from(cidrs));
            }

            if descriptor.resource_type == ResourceType::Network {
                if let (Some(layout), Some(network)) = (&layout, self.network) {
                    attach_layout(&mut descriptor, layout, network);
                }
            }

            descriptor.ingress = rules.get(&descriptor.id).cloned().unwrap_or_default();
            if !descriptor.ingress.is_empty() {
                let values = descriptor.ingress.iter().map(SecurityRule::to_value).collect();
                descriptor
                    .properties
                    .insert("ingress".to_string(), Value::List(values));
            }

            assembled.push(descriptor);
        }

        Ok(AssembledTopology {
            descriptors: assembled,
            layout,
            rules: rules.into_values().flatten().collect(),
        })
    }
}

fn attach_layout(descriptor: &mut ResourceDescriptor, layout: &SubnetLayout, network: &NetworkConfig) {
    let subnets = layout
        .subnets
        .iter()
        .map(|s| {
            Value::Map(BTreeMap::from([
                ("tier".to_string(), Value::from(s.tier.as_str())),
                ("zone".to_string(), Value::from(s.zone.as_str())),
                ("cidr".to_string(), Value::from(s.cidr.as_str())),
            ]))
        })
        .collect();

    let props = &mut descriptor.properties;
    props.insert("cidr".to_string(), Value::from(layout.cidr.as_str()));
    props.insert(
        "nat_gateways".to_string(),
        Value::Integer(i64::from(network.nat_gateways)),
    );
    props.insert("subnets".to_string(), Value::List(subnets));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceId;

    fn network_config() -> NetworkConfig {
        NetworkConfig {
            cidr: "10.0.0.0/16".to_string(),
            zones: 2,
            tiers: vec![
                SubnetTier::Public,
                SubnetTier::PrivateWithEgress,
                SubnetTier::PrivateIsolated,
            ],
            subnet_prefix: None,
            nat_gateways: 2,
        }
    }

    #[test]
    fn test_assemble_full_stack() {
        let config = network_config();
        let descriptors = vec![
            ResourceDescriptor::new("vpc", ResourceType::Network),
            ResourceDescriptor::new("database", ResourceType::Database)
                .with_placement(SubnetTier::PrivateIsolated),
            ResourceDescriptor::new("api", ResourceType::ContainerService)
                .with_placement(SubnetTier::PrivateWithEgress)
                .with_reachability(Reachability::tcp("database", 5432)),
        ];

        let topology = NetworkAssembler::new(Some(&config), "eu-west-1")
            .assemble(&descriptors)
            .unwrap();

        let vpc = &topology.descriptors[0];
        assert_eq!(vpc.properties["cidr"], Value::from("10.0.0.0/16"));
        assert!(matches!(&vpc.properties["subnets"], Value::List(l) if l.len() == 6));

        let db = &topology.descriptors[1];
        assert_eq!(db.ingress.len(), 1);
        assert_eq!(db.ingress[0].source, ResourceId::from("api"));
        assert_eq!(
            db.ingress[0].source_cidrs,
            vec!["10.0.64.0/19".to_string(), "10.0.96.0/19".to_string()]
        );
        assert!(db.properties.contains_key("ingress"));
        assert!(db.dependencies().is_empty());

        let api = &topology.descriptors[2];
        assert!(api.ingress.is_empty());
        assert!(!api.properties.contains_key("ingress"));
        assert_eq!(topology.rules.len(), 1);
    }

    #[test]
    fn test_placement_without_network() {
        let descriptors = vec![
            ResourceDescriptor::new("database", ResourceType::Database)
                .with_placement(SubnetTier::PrivateIsolated),
        ];
        let err = NetworkAssembler::new(None, "eu-west-1")
            .assemble(&descriptors)
            .unwrap_err();
        assert!(matches!(err, NetworkError::UnplacedResource { .. }));
    }

    #[test]
    fn test_exhaustion_surfaces() {
        let mut config = network_config();
        config.cidr = "10.0.0.0/27".to_string();
        let result = NetworkAssembler::new(Some(&config), "eu-west-1").assemble(&[]);
        assert!(matches!(
            result,
            Err(NetworkError::AddressSpaceExhausted { .. })
        ));
    }
}
