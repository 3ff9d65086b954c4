//! Operation plan types and construction.
//!
//! This module turns a diff into an ordered, dependency-consistent list of
//! operations. Plans carry no timestamps: identical inputs give identical
//! plans.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::PlanError;
use crate::resource::{ResourceId, ResourceType};
use crate::state::{ResourceStatus, StackState};

use super::diff::{DiffResult, DiffType};
use super::graph::DependencyGraph;

/// An ordered set of operations for one provisioning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPlan {
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Planned operations in execution order.
    pub steps: Vec<PlannedOperation>,
}

/// A single planned operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    /// Resource the operation applies to.
    pub resource: ResourceId,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Operation to perform.
    pub action: Action,
    /// Reason for this operation.
    pub reason: String,
    /// Earlier steps that must succeed before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<ResourceId>,
    /// Skip the provider call when resolved inputs are unchanged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conditional: bool,
}

/// Types of operations in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

impl OperationPlan {
    /// Creates a plan from a diff.
    ///
    /// Creates and updates follow the stable topological order of the
    /// desired graph; deletes follow the reverse order of the recorded graph
    /// and run after every create and update.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DependencyViolation`] if a step would need a
    /// resource that is neither present nor created earlier. A kept resource
    /// that still references a removed one never gets here: building the
    /// desired graph already fails with [`PlanError::UnknownReference`].
    pub fn from_diff(
        diff: &DiffResult,
        desired: &DependencyGraph,
        recorded: &DependencyGraph,
        state: Option<&StackState>,
        config_hash: &str,
    ) -> Result<Self, PlanError> {
        let actions: BTreeMap<&ResourceId, Action> = diff
            .diffs
            .iter()
            .filter_map(|d| {
                let action = match d.diff_type {
                    DiffType::Create => Action::Create,
                    DiffType::Update => Action::Update,
                    DiffType::Delete => Action::Delete,
                    DiffType::NoChange => return None,
                };
                Some((&d.id, action))
            })
            .collect();

        let deleting: BTreeSet<&ResourceId> = actions
            .iter()
            .filter(|(_, a)| **a == Action::Delete)
            .map(|(id, _)| *id)
            .collect();

        let mut steps = Vec::new();
        let mut scheduled: BTreeSet<ResourceId> = BTreeSet::new();

        for id in desired.topological_order()? {
            let Some(&action) = actions.get(&id) else {
                continue;
            };
            let Some(resource_diff) = diff.get(id.as_str()) else {
                continue;
            };

            let mut after = Vec::new();
            for dependency in desired.dependencies_of(id.as_str()) {
                if scheduled.contains(&dependency) {
                    after.push(dependency);
                    continue;
                }
                let present = !deleting.contains(&dependency)
                    && state
                        .and_then(|s| s.record(dependency.as_str()))
                        .is_some_and(|r| r.status == ResourceStatus::Provisioned);
                if !present {
                    return Err(PlanError::DependencyViolation {
                        resource: id.clone(),
                        dependency,
                        reason: format!("{action} needs a dependency that is not provisioned"),
                    });
                }
            }

            scheduled.insert(id.clone());
            steps.push(PlannedOperation {
                resource: id,
                resource_type: resource_diff.resource_type,
                action,
                reason: resource_diff.reason.clone(),
                after,
                conditional: resource_diff.conditional,
            });
        }

        let delete_steps = Self::delete_steps(recorded, state, &deleting, &scheduled)?;
        steps.extend(delete_steps);

        debug!("Planned {} operations", steps.len());
        Ok(Self {
            config_hash: config_hash.to_string(),
            steps,
        })
    }

    /// Creates a plan deleting recorded resources.
    ///
    /// With `targets`, only those resources are deleted; every recorded
    /// dependent of a target must be targeted too.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownTarget`] for targets missing from state
    /// and [`PlanError::DependencyViolation`] when a target has a dependent
    /// that would survive.
    pub fn destroy(
        recorded: &DependencyGraph,
        state: &StackState,
        targets: Option<&[ResourceId]>,
    ) -> Result<Self, PlanError> {
        let deleting: BTreeSet<&ResourceId> = match targets {
            Some(targets) => {
                for target in targets {
                    if !recorded.contains(target.as_str()) {
                        return Err(PlanError::UnknownTarget {
                            resource: target.clone(),
                        });
                    }
                }
                let selected: BTreeSet<&ResourceId> = targets.iter().collect();
                for target in &selected {
                    if let Some(survivor) = recorded
                        .dependents_of(target.as_str())
                        .into_iter()
                        .find(|d| !selected.contains(d))
                    {
                        return Err(PlanError::DependencyViolation {
                            resource: (*target).clone(),
                            dependency: survivor,
                            reason: String::from(
                                "a surviving resource still depends on it; target it as well",
                            ),
                        });
                    }
                }
                selected
            }
            None => recorded.nodes().collect(),
        };

        Ok(Self {
            config_hash: state.config_hash.clone(),
            steps: Self::delete_steps(recorded, Some(state), &deleting, &BTreeSet::new())?,
        })
    }

    /// Orders deletes as the reverse of the recorded creation order.
    fn delete_steps(
        recorded: &DependencyGraph,
        state: Option<&StackState>,
        deleting: &BTreeSet<&ResourceId>,
        scheduled: &BTreeSet<ResourceId>,
    ) -> Result<Vec<PlannedOperation>, PlanError> {
        let mut order = recorded.topological_order()?;
        order.reverse();

        let mut steps = Vec::new();
        for id in order {
            if !deleting.contains(&id) {
                continue;
            }

            // Dependents go first; a dependent updated in this pass must stop
            // using the resource before it disappears.
            let after: Vec<ResourceId> = recorded
                .dependents_of(id.as_str())
                .into_iter()
                .filter(|d| deleting.contains(d) || scheduled.contains(d))
                .collect();

            let resource_type = state
                .and_then(|s| s.record(id.as_str()))
                .map(|r| r.resource_type);
            let Some(resource_type) = resource_type else {
                continue;
            };

            steps.push(PlannedOperation {
                resource: id,
                resource_type,
                action: Action::Delete,
                reason: String::from("removed from configuration"),
                after,
                conditional: false,
            });
        }
        Ok(steps)
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            config_hash: config_hash.to_string(),
            steps: Vec::new(),
        }
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns the number of operations of one kind.
    #[must_use]
    pub fn count(&self, action: Action) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    /// Gets the operation planned for a resource.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&PlannedOperation> {
        self.steps.iter().find(|s| s.resource.as_str() == id)
    }

    /// Returns the index of a resource's operation.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.resource.as_str() == id)
    }

    /// Returns operations that can start immediately.
    #[must_use]
    pub fn ready_steps(&self) -> Vec<&PlannedOperation> {
        self.steps.iter().filter(|s| s.after.is_empty()).collect()
    }

    /// Serializes the plan to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl PlannedOperation {
    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        let verb = match self.action {
            Action::Create => "Create",
            Action::Update if self.conditional => "Refresh",
            Action::Update => "Update",
            Action::Delete => "Delete",
        };
        format!("{verb} {} '{}'", self.resource_type, self.resource)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.resource)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for OperationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Operation Plan ({} operations):", self.steps.len())?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {i}. {step}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigHasher;
    use crate::planner::DiffEngine;
    use crate::resource::{ResourceDescriptor, Value};
    use crate::state::ResourceRecord;

    fn database(id: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(id, ResourceType::Database)
    }

    fn compute(id: &str, refs: &[&str]) -> ResourceDescriptor {
        refs.iter().fold(
            ResourceDescriptor::new(id, ResourceType::Function),
            |d, r| d.with_property(format!("{r}_endpoint"), Value::reference(*r, "endpoint")),
        )
    }

    fn settled(descriptors: &[ResourceDescriptor]) -> StackState {
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

    fn plan(desired: &[ResourceDescriptor], state: Option<&StackState>) -> Result<OperationPlan, PlanError> {
        let desired_graph = DependencyGraph::build(desired)?;
        let recorded_graph = state
            .map(|s| DependencyGraph::build_recorded(&s.descriptors()))
            .transpose()?
            .unwrap_or_default();
        let diff = DiffEngine::new().compute_diff(desired, &desired_graph, state)?;
        OperationPlan::from_diff(&diff, &desired_graph, &recorded_graph, state, "hash")
    }

    fn summary(plan: &OperationPlan) -> Vec<String> {
        plan.steps
            .iter()
            .map(|s| format!("{} {}", s.action, s.resource))
            .collect()
    }

    #[test]
    fn test_create_follows_references() {
        let descriptors = vec![compute("b", &["a"]), database("a")];
        let plan = plan(&descriptors, None).unwrap();
        assert_eq!(summary(&plan), vec!["create a", "create b"]);
        assert_eq!(plan.step("b").unwrap().after, vec![ResourceId::from("a")]);
        assert_eq!(plan.ready_steps().len(), 1);
    }

    #[test]
    fn test_delete_reverses_recorded_order() {
        let descriptors = vec![database("a"), compute("b", &["a"])];
        let state = settled(&descriptors);
        let plan = plan(&[], Some(&state)).unwrap();
        assert_eq!(summary(&plan), vec!["delete b", "delete a"]);
        assert_eq!(plan.step("a").unwrap().after, vec![ResourceId::from("b")]);
    }

    #[test]
    fn test_independent_resources_precede_common_dependent() {
        let descriptors = vec![compute("f", &["e", "d"]), database("e"), database("d")];
        let plan = plan(&descriptors, None).unwrap();
        let f = plan.position("f").unwrap();
        assert!(plan.position("d").unwrap() < f);
        assert!(plan.position("e").unwrap() < f);
        assert_eq!(plan.step("f").unwrap().after.len(), 2);
        assert_eq!(plan.ready_steps().len(), 2);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let descriptors = vec![
            compute("web", &["api"]),
            compute("api", &["db", "cache"]),
            database("db"),
            database("cache"),
        ];
        let first = plan(&descriptors, None).unwrap().to_json().unwrap();

        let mut shuffled = descriptors;
        shuffled.rotate_left(2);
        let second = plan(&shuffled, None).unwrap().to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_settled_stack_plans_nothing() {
        let descriptors = vec![database("a"), compute("b", &["a"])];
        let state = settled(&descriptors);
        assert!(plan(&descriptors, Some(&state)).unwrap().is_empty());
    }

    #[test]
    fn test_mixed_plan_deletes_last() {
        let old = vec![database("old-db"), compute("api", &["old-db"])];
        let state = settled(&old);
        let new = vec![database("new-db"), compute("api", &["new-db"])];

        let plan = plan(&new, Some(&state)).unwrap();
        assert_eq!(
            summary(&plan),
            vec!["create new-db", "update api", "delete old-db"]
        );
        assert_eq!(
            plan.step("old-db").unwrap().after,
            vec![ResourceId::from("api")]
        );
    }

    #[test]
    fn test_create_needing_unprovisioned_dependency_is_violation() {
        let descriptors = vec![database("a"), compute("b", &["a"])];
        let desired_graph = DependencyGraph::build(&descriptors).unwrap();
        let diff = DiffEngine::new()
            .compute_diff(&descriptors, &desired_graph, None)
            .unwrap();

        // Drop `a` from the diff so `b` is planned alone.
        let mut partial = diff;
        partial.diffs.retain(|d| d.id.as_str() == "b");

        let result = OperationPlan::from_diff(
            &partial,
            &desired_graph,
            &DependencyGraph::default(),
            None,
            "hash",
        );
        assert!(matches!(
            result,
            Err(PlanError::DependencyViolation { resource, .. }) if resource.as_str() == "b"
        ));
    }

    #[test]
    fn test_removing_a_referenced_resource_is_unknown_reference() {
        let before = vec![database("a"), compute("b", &["a"])];
        let state = settled(&before);

        let result = plan(&[compute("b", &["a"])], Some(&state));
        assert!(matches!(
            result,
            Err(PlanError::UnknownReference { referenced, .. }) if referenced.as_str() == "a"
        ));
    }

    #[test]
    fn test_targeted_destroy() {
        let descriptors = vec![
            database("db"),
            compute("api", &["db"]),
            ResourceDescriptor::new("logs", ResourceType::LogGroup),
        ];
        let state = settled(&descriptors);
        let recorded = DependencyGraph::build_recorded(&state.descriptors()).unwrap();

        let targets = [ResourceId::from("api"), ResourceId::from("db")];
        let plan = OperationPlan::destroy(&recorded, &state, Some(&targets)).unwrap();
        assert_eq!(summary(&plan), vec!["delete api", "delete db"]);

        let only_db = [ResourceId::from("db")];
        assert!(matches!(
            OperationPlan::destroy(&recorded, &state, Some(&only_db)),
            Err(PlanError::DependencyViolation { .. })
        ));

        let unknown = [ResourceId::from("nope")];
        assert!(matches!(
            OperationPlan::destroy(&recorded, &state, Some(&unknown)),
            Err(PlanError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_full_destroy() {
        let descriptors = vec![
            ResourceDescriptor::new("vpc", ResourceType::Network),
            database("db").with_dependency("vpc"),
            compute("api", &["db"]),
        ];
        let state = settled(&descriptors);
        let recorded = DependencyGraph::build_recorded(&state.descriptors()).unwrap();
        let plan = OperationPlan::destroy(&recorded, &state, None).unwrap();
        assert_eq!(summary(&plan), vec!["delete api", "delete db", "delete vpc"]);
    }
}
