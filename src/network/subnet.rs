//! IPv4 block arithmetic and subnet allocation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::NetworkError;

/// Smallest subnet the allocator hands out.
pub const MAX_SUBNET_PREFIX: u8 = 28;

/// Subnet tiers by routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetTier {
    /// Routed to an internet gateway.
    Public,
    /// Outbound internet through NAT, not reachable from outside.
    PrivateWithEgress,
    /// No internet route at all.
    PrivateIsolated,
}

impl SubnetTier {
    /// Returns the snake-case tier name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::PrivateWithEgress => "private_with_egress",
            Self::PrivateIsolated => "private_isolated",
        }
    }
}

impl fmt::Display for SubnetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An IPv4 network block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Creates a block, rejecting host bits below the prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix exceeds 32 or the address has host bits set.
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self, NetworkError> {
        let invalid = |reason: &str| NetworkError::InvalidCidr {
            cidr: format!("{network}/{prefix}"),
            reason: reason.to_string(),
        };
        if prefix > 32 {
            return Err(invalid("prefix length must be at most 32"));
        }
        if u32::from(network) & !mask(prefix) != 0 {
            return Err(invalid("address has host bits set"));
        }
        Ok(Self { network, prefix })
    }

    /// Returns the network address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Returns the prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Returns the number of addresses in the block.
    #[must_use]
    pub const fn size(&self) -> u64 {
        1u64 << (32 - self.prefix)
    }

    /// Returns true if `other` lies entirely within this block.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.prefix >= self.prefix
            && u32::from(other.network) & mask(self.prefix) == u32::from(self.network)
    }

    /// Returns true if the two blocks share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Splits the block into the first `count` consecutive sub-blocks of
    /// length `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::AddressSpaceExhausted`] if fewer than `count`
    /// sub-blocks fit, or [`NetworkError::InvalidCidr`] if `prefix` is shorter
    /// than this block's.
    pub fn subdivide(&self, prefix: u8, count: usize) -> Result<Vec<Self>, NetworkError> {
        if prefix < self.prefix || prefix > 32 {
            return Err(NetworkError::InvalidCidr {
                cidr: self.to_string(),
                reason: format!("cannot split into /{prefix} blocks"),
            });
        }

        let available = 1u64 << (prefix - self.prefix);
        let requested = u64::try_from(count).unwrap_or(u64::MAX);
        if requested > available {
            return Err(NetworkError::AddressSpaceExhausted {
                cidr: self.to_string(),
                required: count,
                available: usize::try_from(available).unwrap_or(usize::MAX),
                prefix,
            });
        }

        let step = 1u64 << (32 - prefix);
        let base = u64::from(u32::from(self.network));
        (0..requested)
            .map(|i| {
                let start = u32::try_from(base + i * step).map_err(|_| NetworkError::InvalidCidr {
                    cidr: self.to_string(),
                    reason: "sub-block outside the IPv4 range".to_string(),
                })?;
                Ok(Self {
                    network: Ipv4Addr::from(start),
                    prefix,
                })
            })
            .collect()
    }
}

const fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| NetworkError::InvalidCidr {
            cidr: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected <address>/<prefix>"))?;
        let network = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid("invalid IPv4 address"))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| invalid("invalid prefix length"))?;
        Self::new(network, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// One allocated subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetAllocation {
    /// Routing tier.
    pub tier: SubnetTier,
    /// Zone index, starting at 0.
    pub zone_index: u8,
    /// Zone name, `{region}{letter}`.
    pub zone: String,
    /// Address block.
    pub cidr: String,
}

/// The full set of subnets carved from a network block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetLayout {
    /// The base block.
    pub cidr: String,
    /// Prefix length of every subnet.
    pub subnet_prefix: u8,
    /// Allocations, tier-major in declared tier order.
    pub subnets: Vec<SubnetAllocation>,
}

impl SubnetLayout {
    /// Returns the address blocks of one tier, in zone order.
    #[must_use]
    pub fn cidrs_for(&self, tier: SubnetTier) -> Vec<String> {
        self.subnets
            .iter()
            .filter(|s| s.tier == tier)
            .map(|s| s.cidr.clone())
            .collect()
    }
}

/// Partitions a base block into equal, disjoint subnets, one per tier per zone.
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    base: Ipv4Cidr,
    zones: u8,
    tiers: Vec<SubnetTier>,
    subnet_prefix: Option<u8>,
}

impl SubnetAllocator {
    /// Creates an allocator.
    #[must_use]
    pub const fn new(base: Ipv4Cidr, zones: u8, tiers: Vec<SubnetTier>) -> Self {
        Self {
            base,
            zones,
            tiers,
            subnet_prefix: None,
        }
    }

    /// Fixes the subnet prefix length instead of deriving it from the count.
    #[must_use]
    pub const fn with_subnet_prefix(mut self, prefix: Option<u8>) -> Self {
        self.subnet_prefix = prefix;
        self
    }

    /// Allocates the subnets, naming zones after `region`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::AddressSpaceExhausted`] if the subnets do not
    /// fit in the base block or would be smaller than `/28`.
    pub fn allocate(&self, region: &str) -> Result<SubnetLayout, NetworkError> {
        let count = self.tiers.len() * usize::from(self.zones);
        if count == 0 {
            return Ok(SubnetLayout {
                cidr: self.base.to_string(),
                subnet_prefix: self.base.prefix(),
                subnets: Vec::new(),
            });
        }

        let prefix = self
            .subnet_prefix
            .unwrap_or_else(|| self.base.prefix().saturating_add(bits_for(count)));

        if prefix > MAX_SUBNET_PREFIX {
            let available = if self.base.prefix() <= MAX_SUBNET_PREFIX {
                1usize << (MAX_SUBNET_PREFIX - self.base.prefix())
            } else {
                0
            };
            return Err(NetworkError::AddressSpaceExhausted {
                cidr: self.base.to_string(),
                required: count,
                available,
                prefix,
            });
        }

        let blocks = self.base.subdivide(prefix, count)?;
        let zone_count = usize::from(self.zones);
        let subnets = blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| {
                let tier = self.tiers[i / zone_count];
                let zone_index = u8::try_from(i % zone_count).unwrap_or(u8::MAX);
                SubnetAllocation {
                    tier,
                    zone_index,
                    zone: zone_name(region, zone_index),
                    cidr: block.to_string(),
                }
            })
            .collect();

        Ok(SubnetLayout {
            cidr: self.base.to_string(),
            subnet_prefix: prefix,
            subnets,
        })
    }
}

/// Returns the number of prefix bits needed to address `count` blocks.
const fn bits_for(count: usize) -> u8 {
    let mut bits = 0u8;
    while (1usize << bits) < count {
        bits += 1;
    }
    bits
}

fn zone_name(region: &str, index: u8) -> String {
    let letter = char::from(b'a'.saturating_add(index));
    format!("{region}{letter}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TIERS: [SubnetTier; 3] = [
        SubnetTier::Public,
        SubnetTier::PrivateWithEgress,
        SubnetTier::PrivateIsolated,
    ];

    #[test]
    fn test_parse_cidr() {
        let cidr: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        assert_eq!(cidr.prefix(), 16);
        assert_eq!(cidr.size(), 65536);
        assert_eq!(cidr.to_string(), "10.0.0.0/16");

        assert!("10.0.0.1/16".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_allocate_two_zones_three_tiers() {
        let base: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let layout = SubnetAllocator::new(base, 2, ALL_TIERS.to_vec())
            .allocate("eu-west-1")
            .unwrap();

        assert_eq!(layout.subnet_prefix, 19);
        assert_eq!(layout.subnets.len(), 6);
        assert_eq!(layout.subnets[0].cidr, "10.0.0.0/19");
        assert_eq!(layout.subnets[0].zone, "eu-west-1a");
        assert_eq!(layout.subnets[1].zone, "eu-west-1b");
        assert_eq!(layout.subnets[5].cidr, "10.0.160.0/19");
        assert_eq!(
            layout.cidrs_for(SubnetTier::PrivateIsolated),
            vec!["10.0.128.0/19".to_string(), "10.0.160.0/19".to_string()]
        );
    }

    #[test]
    fn test_allocations_are_disjoint_and_contained() {
        let base: Ipv4Cidr = "172.16.0.0/20".parse().unwrap();
        let layout = SubnetAllocator::new(base, 3, ALL_TIERS.to_vec())
            .allocate("us-east-1")
            .unwrap();

        let blocks: Vec<Ipv4Cidr> = layout
            .subnets
            .iter()
            .map(|s| s.cidr.parse().unwrap())
            .collect();
        for (i, a) in blocks.iter().enumerate() {
            assert!(base.contains(a));
            for b in &blocks[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn test_fixed_prefix_exhausted() {
        let base: Ipv4Cidr = "10.0.0.0/24".parse().unwrap();
        let err = SubnetAllocator::new(base, 3, ALL_TIERS.to_vec())
            .with_subnet_prefix(Some(26))
            .allocate("us-east-1")
            .unwrap_err();
        assert!(matches!(
            err,
            NetworkError::AddressSpaceExhausted {
                required: 9,
                available: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_derived_prefix_too_small() {
        let base: Ipv4Cidr = "10.0.0.0/26".parse().unwrap();
        let err = SubnetAllocator::new(base, 2, ALL_TIERS.to_vec())
            .allocate("us-east-1")
            .unwrap_err();
        assert!(matches!(err, NetworkError::AddressSpaceExhausted { .. }));
    }
}
