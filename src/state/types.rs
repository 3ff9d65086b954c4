//! State types for tracking what previous passes applied.
//!
//! The recorded state is the "previous" side of every diff: it holds the
//! descriptor each resource was last provisioned from, the attributes its
//! provider reported and the final status of the last operation on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::{Attributes, ResourceDescriptor, ResourceId, ResourceType};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete recorded state of a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied configuration.
    pub config_hash: String,
    /// Records of individual resources.
    pub resources: BTreeMap<ResourceId, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Pass history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Recorded state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource id.
    pub id: ResourceId,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Provider-facing name.
    pub physical_name: String,
    /// Descriptor of the last attempted operation.
    pub descriptor: ResourceDescriptor,
    /// Hash of `descriptor`.
    pub descriptor_hash: String,
    /// Hash of the resolved inputs of the last successful create or update.
    #[serde(default)]
    pub applied_hash: Option<String>,
    /// Final status of the last operation.
    pub status: ResourceStatus,
    /// Attributes reported by the provider.
    #[serde(default)]
    pub attributes: Attributes,
    /// Error of the last failed operation.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the resource was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Final status of the last operation on a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// The provider reported the resource complete.
    Provisioned,
    /// The provider reported a failure.
    Failed,
    /// The operation did not complete in time.
    TimedOut,
}

/// A single entry in the pass history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the pass finished.
    pub timestamp: DateTime<Utc>,
    /// Type of pass.
    pub operation: StackOperation,
    /// Configuration hash at time of the pass.
    pub config_hash: String,
    /// Resources acted on.
    pub resources: Vec<String>,
    /// Whether the pass settled.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of passes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StackOperation {
    /// Create and update towards the declared stack.
    Apply,
    /// Tear down all or part of the stack.
    Destroy,
}

impl StackState {
    /// Creates a new empty stack state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by id.
    #[must_use]
    pub fn record(&self, id: &str) -> Option<&ResourceRecord> {
        self.resources.get(id)
    }

    /// Adds or replaces a record.
    pub fn set_record(&mut self, record: ResourceRecord) {
        self.resources.insert(record.id.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by id.
    pub fn remove_record(&mut self, id: &str) -> Option<ResourceRecord> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Returns the recorded descriptors, ordered by id.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ResourceDescriptor> {
        self.resources.values().map(|r| r.descriptor.clone()).collect()
    }

    /// Returns records whose last operation succeeded.
    #[must_use]
    pub fn provisioned(&self) -> Vec<&ResourceRecord> {
        self.resources
            .values()
            .filter(|r| r.status == ResourceStatus::Provisioned)
            .collect()
    }

    /// Counts records per status.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<ResourceStatus, usize> {
        let mut counts = BTreeMap::new();
        for record in self.resources.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// Adds a history entry, dropping the oldest beyond the retention limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl ResourceRecord {
    /// Creates a record for a resource whose first operation just finished.
    #[must_use]
    pub fn new(
        descriptor: ResourceDescriptor,
        descriptor_hash: String,
        physical_name: String,
        status: ResourceStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: descriptor.id.clone(),
            resource_type: descriptor.resource_type,
            physical_name,
            descriptor,
            descriptor_hash,
            applied_hash: None,
            status,
            attributes: Attributes::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if a create or update on this resource ever succeeded.
    #[must_use]
    pub const fn ever_provisioned(&self) -> bool {
        self.applied_hash.is_some()
    }

    /// Records a successful create or update.
    pub fn mark_provisioned(&mut self, applied_hash: String, attributes: Attributes) {
        self.status = ResourceStatus::Provisioned;
        self.applied_hash = Some(applied_hash);
        self.attributes = attributes;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Records a failed operation, keeping previous attributes.
    pub fn mark_failed(&mut self, status: ResourceStatus, error: impl Into<String>) {
        self.status = status;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Records that the provider no longer has the resource, so the next
    /// pass creates it again.
    pub fn mark_lost(&mut self, error: impl Into<String>) {
        self.applied_hash = None;
        self.attributes.clear();
        self.mark_failed(ResourceStatus::Failed, error);
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: StackOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: StackOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Provisioned => "provisioned",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Value;

    fn record(id: &str, status: ResourceStatus) -> ResourceRecord {
        ResourceRecord::new(
            ResourceDescriptor::new(id, ResourceType::Bucket),
            "hash".to_string(),
            format!("shop-dev-{id}"),
            status,
        )
    }

    #[test]
    fn test_record_lifecycle() {
        let mut rec = record("files", ResourceStatus::Failed);
        assert!(!rec.ever_provisioned());

        let attrs = Attributes::from([("arn".to_string(), Value::from("arn:files"))]);
        rec.mark_provisioned("applied".to_string(), attrs);
        assert!(rec.ever_provisioned());
        assert_eq!(rec.status, ResourceStatus::Provisioned);

        rec.mark_failed(ResourceStatus::TimedOut, "slow");
        assert_eq!(rec.status, ResourceStatus::TimedOut);
        assert!(rec.attributes.contains_key("arn"));
        assert_eq!(rec.last_error.as_deref(), Some("slow"));
    }

    #[test]
    fn test_lost_record_is_created_again() {
        let mut rec = record("files", ResourceStatus::Failed);
        let attrs = Attributes::from([("arn".to_string(), Value::from("arn:files"))]);
        rec.mark_provisioned("applied".to_string(), attrs);

        rec.mark_lost("gone");
        assert!(!rec.ever_provisioned());
        assert!(rec.attributes.is_empty());
        assert_eq!(rec.status, ResourceStatus::Failed);
    }

    #[test]
    fn test_state_counts_and_history_cap() {
        let mut state = StackState::new("shop", "dev");
        state.set_record(record("a", ResourceStatus::Provisioned));
        state.set_record(record("b", ResourceStatus::Failed));
        assert_eq!(state.provisioned().len(), 1);
        assert_eq!(state.status_counts()[&ResourceStatus::Failed], 1);

        for _ in 0..150 {
            state.add_history(HistoryEntry::new(StackOperation::Apply, "h", Vec::new()));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_state_serde() {
        let mut state = StackState::new("shop", "dev");
        state.set_record(record("files", ResourceStatus::Provisioned));
        let json = serde_json::to_string(&state).unwrap();
        let back: StackState = serde_json::from_str(&json).unwrap();
        assert!(back.record("files").is_some());
    }
}
