//! Descriptor hashing for change detection.
//!
//! Hashes are computed over the canonical JSON rendering of descriptors.
//! Every map in the resource model is ordered, so equal descriptors always
//! hash equally.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::spec::StackConfig;
use crate::resource::{ResolvedDescriptor, ResourceDescriptor};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire stack configuration.
    ///
    /// This hash changes when any part of the configuration changes.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());
        hasher.update(config.project.region.as_bytes());
        if let Some(account) = &config.project.account {
            hasher.update(account.as_bytes());
        }

        if let Some(network) = &config.network {
            hasher.update(canonical_bytes(network));
        }

        let mut resources: Vec<_> = config.resources.iter().collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        for resource in resources {
            hasher.update(self.hash_descriptor(resource).as_bytes());
        }

        hasher.update(canonical_bytes(&config.outputs));

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a declared descriptor.
    ///
    /// Covers type, properties (references unresolved), explicit
    /// dependencies, placement and ingress.
    #[must_use]
    pub fn hash_descriptor(&self, descriptor: &ResourceDescriptor) -> String {
        let mut hasher = Sha256::new();
        hasher.update(descriptor.id.as_str().as_bytes());
        hasher.update(descriptor.resource_type.as_str().as_bytes());
        hasher.update(canonical_bytes(&descriptor.properties));
        hasher.update(canonical_bytes(&descriptor.depends_on));
        hasher.update(canonical_bytes(&descriptor.placement));
        hasher.update(canonical_bytes(&descriptor.ingress));
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of what was actually handed to a provider.
    #[must_use]
    pub fn hash_resolved(&self, resolved: &ResolvedDescriptor) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resolved.physical_name.as_bytes());
        hasher.update(resolved.resource_type.as_str().as_bytes());
        hasher.update(canonical_bytes(&resolved.properties));
        hasher.update(canonical_bytes(&resolved.ingress));
        hasher.update(canonical_bytes(&resolved.tags));
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    // Ordered maps and plain data serialize infallibly.
    serde_json::to_vec(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceType, Value};

    fn database() -> ResourceDescriptor {
        ResourceDescriptor::new("database", ResourceType::Database)
            .with_property("port", 5432)
            .with_property("credentials", Value::reference("secret", "arn"))
    }

    #[test]
    fn test_descriptor_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_descriptor(&database()), hasher.hash_descriptor(&database()));
    }

    #[test]
    fn test_property_change_changes_hash() {
        let hasher = ConfigHasher::new();
        let changed = database().with_property("port", 5433);
        assert_ne!(hasher.hash_descriptor(&database()), hasher.hash_descriptor(&changed));
    }

    #[test]
    fn test_property_insertion_order_irrelevant() {
        let hasher = ConfigHasher::new();
        let reordered = ResourceDescriptor::new("database", ResourceType::Database)
            .with_property("credentials", Value::reference("secret", "arn"))
            .with_property("port", 5432);
        assert_eq!(hasher.hash_descriptor(&database()), hasher.hash_descriptor(&reordered));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
