//! Diff engine for comparing desired descriptors with recorded state.
//!
//! This module decides, per resource, whether the next pass must create,
//! update or delete it.

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::PlanError;
use crate::resource::{ResourceDescriptor, ResourceId, ResourceType};
use crate::state::{ResourceRecord, ResourceStatus, StackState};

use super::graph::DependencyGraph;

/// Engine for computing diffs between desired descriptors and stack state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource id.
    pub id: ResourceId,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Set on updates triggered only by upstream changes.
    pub conditional: bool,
    /// Why this resource needs the action.
    pub reason: String,
    /// Changed properties.
    pub details: Vec<DiffDetail>,
    /// Recorded descriptor hash (if any).
    pub old_hash: Option<String>,
    /// Desired descriptor hash (if still declared).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a changed property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Property that differs.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<String>,
    /// Desired value.
    pub new_value: Option<String>,
}

/// Complete diff result, ordered by resource id.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update, conditional ones included.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between desired descriptors and recorded state.
    ///
    /// `desired_graph` must be the graph of `desired`; it is used to mark
    /// resources downstream of a change for a conditional update.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::TypeChanged`] if a declared resource changed type.
    pub fn compute_diff(
        &self,
        desired: &[ResourceDescriptor],
        desired_graph: &DependencyGraph,
        state: Option<&StackState>,
    ) -> Result<DiffResult, PlanError> {
        let mut by_id: BTreeMap<ResourceId, ResourceDiff> = BTreeMap::new();

        for descriptor in desired {
            let record = state.and_then(|s| s.record(descriptor.id.as_str()));
            let diff = self.compute_resource_diff(descriptor, record)?;
            by_id.insert(descriptor.id.clone(), diff);
        }

        // Dependencies precede dependents, so one pass propagates changes
        // transitively.
        for id in desired_graph.topological_order()? {
            let upstream_change = desired_graph
                .dependencies_of(id.as_str())
                .iter()
                .find(|dep| {
                    by_id
                        .get(dep.as_str())
                        .is_some_and(|d| matches!(d.diff_type, DiffType::Create | DiffType::Update))
                })
                .cloned();

            if let Some(dep) = upstream_change
                && let Some(diff) = by_id.get_mut(id.as_str())
                && diff.diff_type == DiffType::NoChange
            {
                debug!("Resource {id} may change because dependency {dep} changes");
                diff.diff_type = DiffType::Update;
                diff.conditional = true;
                diff.reason = format!("dependency '{dep}' changes");
            }
        }

        if let Some(state) = state {
            for record in state.resources.values() {
                if !by_id.contains_key(record.id.as_str()) {
                    debug!("Resource {} removed from configuration", record.id);
                    by_id.insert(record.id.clone(), Self::removed(record));
                }
            }
        }

        let diffs: Vec<ResourceDiff> = by_id.into_values().collect();
        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();

        Ok(DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        })
    }

    /// Computes the diff for a single declared resource.
    fn compute_resource_diff(
        &self,
        descriptor: &ResourceDescriptor,
        record: Option<&ResourceRecord>,
    ) -> Result<ResourceDiff, PlanError> {
        let new_hash = self.hasher.hash_descriptor(descriptor);
        let mut diff = ResourceDiff {
            id: descriptor.id.clone(),
            resource_type: descriptor.resource_type,
            diff_type: DiffType::NoChange,
            conditional: false,
            reason: String::new(),
            details: Vec::new(),
            old_hash: record.map(|r| r.descriptor_hash.clone()),
            new_hash: Some(new_hash.clone()),
        };

        let Some(record) = record else {
            diff.diff_type = DiffType::Create;
            diff.reason = String::from("declared in configuration");
            return Ok(diff);
        };

        if record.resource_type != descriptor.resource_type {
            return Err(PlanError::TypeChanged {
                resource: descriptor.id.clone(),
                from: record.resource_type.to_string(),
                to: descriptor.resource_type.to_string(),
            });
        }

        if !record.ever_provisioned() {
            diff.diff_type = DiffType::Create;
            diff.reason = format!("previous create ended {}", record.status);
        } else if record.descriptor_hash != new_hash {
            diff.diff_type = DiffType::Update;
            diff.details = Self::compute_detailed_diff(&record.descriptor, descriptor);
            diff.reason = String::from("configuration changed");
        } else if record.status != ResourceStatus::Provisioned {
            diff.diff_type = DiffType::Update;
            diff.reason = format!("previous update ended {}", record.status);
        }

        Ok(diff)
    }

    fn removed(record: &ResourceRecord) -> ResourceDiff {
        ResourceDiff {
            id: record.id.clone(),
            resource_type: record.resource_type,
            diff_type: DiffType::Delete,
            conditional: false,
            reason: String::from("removed from configuration"),
            details: Vec::new(),
            old_hash: Some(record.descriptor_hash.clone()),
            new_hash: None,
        }
    }

    /// Lists the properties that differ between two descriptors.
    fn compute_detailed_diff(
        old: &ResourceDescriptor,
        new: &ResourceDescriptor,
    ) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        let keys: std::collections::BTreeSet<&String> =
            old.properties.keys().chain(new.properties.keys()).collect();
        for key in keys {
            let before = old.properties.get(key);
            let after = new.properties.get(key);
            if before != after {
                details.push(DiffDetail {
                    field: key.clone(),
                    old_value: before.map(ToString::to_string),
                    new_value: after.map(ToString::to_string),
                });
            }
        }

        if old.depends_on != new.depends_on {
            details.push(DiffDetail {
                field: String::from("depends_on"),
                old_value: Some(format!("{:?}", old.depends_on)),
                new_value: Some(format!("{:?}", new.depends_on)),
            });
        }

        if old.placement != new.placement {
            details.push(DiffDetail {
                field: String::from("placement"),
                old_value: old.placement.map(|t| t.to_string()),
                new_value: new.placement.map(|t| t.to_string()),
            });
        }

        details
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Gets the diff for a resource.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.id.as_str() == id)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.diff_type)?;
        if !self.details.is_empty() {
            let fields: Vec<&str> = self.details.iter().map(|d| d.field.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Value;

    fn stack() -> Vec<ResourceDescriptor> {
        vec![
            ResourceDescriptor::new("db", ResourceType::Database)
                .with_property("engine", "aurora-postgresql"),
            ResourceDescriptor::new("api", ResourceType::ContainerService)
                .with_property("db_host", Value::reference("db", "endpoint")),
            ResourceDescriptor::new("logs", ResourceType::LogGroup),
        ]
    }

    fn settled_state(descriptors: &[ResourceDescriptor]) -> StackState {
        let hasher = ConfigHasher::new();
        let mut state = StackState::new("shop", "dev");
        for d in descriptors {
            let mut record = ResourceRecord::new(
                d.clone(),
                hasher.hash_descriptor(d),
                d.physical_name("shop", "dev"),
                ResourceStatus::Provisioned,
            );
            record.mark_provisioned(String::from("applied"), Default::default());
            state.set_record(record);
        }
        state
    }

    fn diff(desired: &[ResourceDescriptor], state: Option<&StackState>) -> DiffResult {
        let graph = DependencyGraph::build(desired).unwrap();
        DiffEngine::new().compute_diff(desired, &graph, state).unwrap()
    }

    #[test]
    fn test_fresh_stack_creates_everything() {
        let result = diff(&stack(), None);
        assert_eq!(result.creates, 3);
        assert!(result.has_changes());
    }

    #[test]
    fn test_settled_stack_has_no_changes() {
        let desired = stack();
        let state = settled_state(&desired);
        let result = diff(&desired, Some(&state));
        assert_eq!(result.unchanged, 3);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_changed_property_marks_dependents_conditional() {
        let desired = stack();
        let state = settled_state(&desired);

        let mut changed = desired;
        changed[0] = changed[0].clone().with_property("instance_class", "db.r6g.large");
        let result = diff(&changed, Some(&state));

        let db = result.get("db").unwrap();
        assert_eq!(db.diff_type, DiffType::Update);
        assert!(!db.conditional);
        assert_eq!(db.details[0].field, "instance_class");

        let api = result.get("api").unwrap();
        assert_eq!(api.diff_type, DiffType::Update);
        assert!(api.conditional);

        assert_eq!(result.get("logs").unwrap().diff_type, DiffType::NoChange);
    }

    #[test]
    fn test_failed_create_is_retried_as_create() {
        let desired = stack();
        let mut state = settled_state(&desired);
        let mut failed = ResourceRecord::new(
            desired[2].clone(),
            ConfigHasher::new().hash_descriptor(&desired[2]),
            String::from("shop-dev-logs"),
            ResourceStatus::Failed,
        );
        failed.mark_failed(ResourceStatus::TimedOut, "deadline");
        state.set_record(failed);

        let result = diff(&desired, Some(&state));
        assert_eq!(result.get("logs").unwrap().diff_type, DiffType::Create);
    }

    #[test]
    fn test_failed_update_is_retried_as_update() {
        let desired = stack();
        let mut state = settled_state(&desired);
        if let Some(record) = state.resources.get_mut("logs") {
            record.mark_failed(ResourceStatus::Failed, "boom");
        }

        let result = diff(&desired, Some(&state));
        let logs = result.get("logs").unwrap();
        assert_eq!(logs.diff_type, DiffType::Update);
        assert!(!logs.conditional);
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let desired = stack();
        let state = settled_state(&desired);
        let result = diff(&desired[..2], Some(&state));
        assert_eq!(result.deletes, 1);
        assert_eq!(result.get("logs").unwrap().diff_type, DiffType::Delete);
    }

    #[test]
    fn test_type_change_rejected() {
        let desired = stack();
        let state = settled_state(&desired);
        let mut changed = desired;
        changed[2] = ResourceDescriptor::new("logs", ResourceType::Bucket);

        let graph = DependencyGraph::build(&changed).unwrap();
        let result = DiffEngine::new().compute_diff(&changed, &graph, Some(&state));
        assert!(matches!(result, Err(PlanError::TypeChanged { .. })));
    }
}
