//! Orchestration driver for provisioning passes.
//!
//! A pass moves through `Planning -> Executing -> Reconciling -> Settled`.
//! Planning errors abort before any provider call. Provider failures are
//! collected and end the pass in `Failed` with per-resource outcomes; nothing
//! is rolled back and a later pass converges from the recorded state.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, DriftCheck, StackConfig};
use crate::error::{ProviderError, Result};
use crate::network::NetworkAssembler;
use crate::planner::{
    DependencyGraph, DiffEngine, DiffResult, ExecutionReport, OperationPlan, PlanExecutor,
};
use crate::provider::{ProviderRegistry, ResourceHandle};
use crate::resolver::{AttributeTable, OutputResolver};
use crate::resource::{ResourceDescriptor, ResourceId, Value};
use crate::state::{
    HistoryEntry, LockInfo, ResourceRecord, StackOperation, StackState, StateStore,
    generate_holder_id,
};

/// Phase of a provisioning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Building graphs and the operation plan.
    Planning,
    /// Running provider operations.
    Executing,
    /// Describing resources to detect drift.
    Reconciling,
    /// Every operation succeeded.
    Settled,
    /// The pass ended with failures.
    Failed,
}

/// One discrepancy between recorded and observed attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftItem {
    /// Drifted resource.
    pub resource: ResourceId,
    /// What differs.
    pub description: String,
}

/// Result of describing recorded resources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Number of resources described.
    pub checked: usize,
    /// Discrepancies found.
    pub drifted: Vec<DriftItem>,
    /// Resources whose describe call failed.
    pub errors: Vec<String>,
}

/// Flat attributes and named outputs of a stack.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StackOutputs {
    /// `resourceId.attributeName` to value.
    pub attributes: BTreeMap<String, Value>,
    /// Named stack outputs.
    pub outputs: BTreeMap<String, Value>,
}

/// Result of a provisioning or destroy pass.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    /// Terminal phase.
    pub phase: Phase,
    /// Kind of pass.
    pub operation: StackOperation,
    /// Plan that was executed.
    pub plan: OperationPlan,
    /// Per-resource outcomes.
    pub execution: ExecutionReport,
    /// Drift found while reconciling, if the phase ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
    /// Resolved attributes and outputs after the pass.
    pub outputs: StackOutputs,
    /// Errors collected during the pass.
    pub errors: Vec<String>,
}

/// Drives provisioning passes for one stack.
pub struct Orchestrator<'a, S: StateStore> {
    /// Immutable stack configuration.
    config: &'a StackConfig,
    /// State store.
    store: &'a S,
    /// Provider adapters.
    registry: &'a ProviderRegistry,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Lock holder id.
    holder: String,
}

impl<'a, S: StateStore> Orchestrator<'a, S> {
    /// Creates a new orchestrator.
    #[must_use]
    pub fn new(config: &'a StackConfig, store: &'a S, registry: &'a ProviderRegistry) -> Self {
        Self {
            config,
            store,
            registry,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            holder: generate_holder_id(),
        }
    }

    /// Assembles the network and plans the pass against recorded state.
    ///
    /// Returns the assembled descriptors together with the plan.
    ///
    /// # Errors
    ///
    /// Returns a planning or network error; no provider is called.
    pub fn plan_against(
        &self,
        state: Option<&StackState>,
    ) -> Result<(Vec<ResourceDescriptor>, OperationPlan)> {
        self.plan_parts(state).map(|(desired, _, plan)| (desired, plan))
    }

    fn plan_parts(
        &self,
        state: Option<&StackState>,
    ) -> Result<(Vec<ResourceDescriptor>, DiffResult, OperationPlan)> {
        info!(
            "Planning {} ({} resources)",
            self.config.qualified_name(),
            self.config.resources.len()
        );

        // References and cycles are checked on the declared descriptors so
        // graph errors surface before address allocation.
        DependencyGraph::build(&self.config.resources)?;

        let topology = NetworkAssembler::new(self.config.network.as_ref(), &self.config.project.region)
            .assemble(&self.config.resources)?;
        let desired = topology.descriptors;

        let desired_graph = DependencyGraph::build(&desired)?;
        let recorded_graph = DependencyGraph::build_recorded(
            &state.map(StackState::descriptors).unwrap_or_default(),
        )?;

        let diff = self.diff_engine.compute_diff(&desired, &desired_graph, state)?;
        info!(
            "Diff: {} creates, {} updates, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.deletes, diff.unchanged
        );

        let config_hash = self.hasher.hash_config(self.config);
        let plan = OperationPlan::from_diff(&diff, &desired_graph, &recorded_graph, state, &config_hash)?;
        Ok((desired, diff, plan))
    }

    /// Plans a pass against the stored state without executing it.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or planning fails.
    pub async fn plan(&self) -> Result<OperationPlan> {
        let state = self.store.load().await?;
        self.plan_against(state.as_ref()).map(|(_, plan)| plan)
    }

    /// Plans a pass and also returns the per-resource diff it came from.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or planning fails.
    pub async fn plan_with_diff(&self) -> Result<(OperationPlan, DiffResult)> {
        let state = self.store.load().await?;
        self.plan_parts(state.as_ref()).map(|(_, diff, plan)| (plan, diff))
    }

    /// Runs a provisioning pass.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails, the state lock cannot be taken,
    /// state cannot be saved or a reference cannot be resolved. Provider
    /// failures are reported in the returned report instead.
    pub async fn apply(&self, cancel: &watch::Receiver<bool>) -> Result<OrchestrationReport> {
        let lock = self.store.acquire_lock(&self.holder).await?;
        let result = self.apply_locked(cancel).await;
        self.release(&lock).await;
        result
    }

    async fn apply_locked(&self, cancel: &watch::Receiver<bool>) -> Result<OrchestrationReport> {
        let mut state = self.store.load().await?.unwrap_or_else(|| {
            StackState::new(&self.config.project.name, &self.config.project.environment)
        });

        let (desired, plan) = self.plan_against(Some(&state))?;
        let mut table = AttributeTable::from_state(&state);

        if plan.is_empty() {
            info!("No changes required, stack is settled");
            return self
                .finish(StackOperation::Apply, plan, ExecutionReport::default(), &state, &table)
                .await;
        }

        info!("Executing {} operations", plan.len());
        let executor = PlanExecutor::new(self.registry, &self.config.project, &self.config.orchestration);
        let execution = executor
            .execute(&plan, &desired, &mut state, &mut table, cancel)
            .await;

        let execution = match execution {
            Ok(execution) => execution,
            Err(e) => {
                error!("Pass aborted: {e}");
                state.add_history(HistoryEntry::failed(
                    StackOperation::Apply,
                    &plan.config_hash,
                    step_names(&plan),
                    &e.to_string(),
                ));
                self.store.save(&state).await?;
                return Err(e);
            }
        };

        state.config_hash.clone_from(&plan.config_hash);
        state.add_history(history_entry(StackOperation::Apply, &plan, &execution));
        self.store.save(&state).await?;

        self.finish(StackOperation::Apply, plan, execution, &state, &table)
            .await
    }

    /// Deletes recorded resources, all of them or only `targets`.
    ///
    /// # Errors
    ///
    /// Returns an error if a target is unknown, a surviving resource depends
    /// on a target, or state cannot be loaded or saved.
    pub async fn destroy(
        &self,
        targets: Option<&[ResourceId]>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<OrchestrationReport> {
        let lock = self.store.acquire_lock(&self.holder).await?;
        let result = self.destroy_locked(targets, cancel).await;
        self.release(&lock).await;
        result
    }

    async fn destroy_locked(
        &self,
        targets: Option<&[ResourceId]>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<OrchestrationReport> {
        let Some(mut state) = self.store.load().await? else {
            info!("No recorded state, nothing to destroy");
            let state = StackState::new(&self.config.project.name, &self.config.project.environment);
            return self
                .finish(
                    StackOperation::Destroy,
                    OperationPlan::empty(&self.hasher.hash_config(self.config)),
                    ExecutionReport::default(),
                    &state,
                    &AttributeTable::new(),
                )
                .await;
        };

        let recorded = DependencyGraph::build_recorded(&state.descriptors())?;
        let plan = OperationPlan::destroy(&recorded, &state, targets)?;
        info!("Destroying {} resources", plan.len());

        let mut table = AttributeTable::from_state(&state);
        let executor = PlanExecutor::new(self.registry, &self.config.project, &self.config.orchestration);
        let execution = executor
            .execute(&plan, &[], &mut state, &mut table, cancel)
            .await?;

        state.add_history(history_entry(StackOperation::Destroy, &plan, &execution));
        self.store.save(&state).await?;

        self.finish(StackOperation::Destroy, plan, execution, &state, &table)
            .await
    }

    /// Describes every provisioned resource and compares its attributes with
    /// the recorded ones. Nothing is changed.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.config.qualified_name());
        let Some(state) = self.store.load().await? else {
            return Ok(DriftReport::default());
        };
        let records: Vec<&ResourceRecord> = state.provisioned();
        Ok(self.describe_records(&records).await)
    }

    /// Returns the resolved attributes and named outputs of the stored state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a named output
    /// references an attribute that is not provisioned.
    pub async fn outputs(&self) -> Result<StackOutputs> {
        let state = self.store.load().await?.unwrap_or_else(|| {
            StackState::new(&self.config.project.name, &self.config.project.environment)
        });
        let table = AttributeTable::from_state(&state);
        Ok(StackOutputs {
            attributes: table.flatten(),
            outputs: OutputResolver::new(&self.config.project)
                .resolve_outputs(&self.config.outputs, &table)?,
        })
    }

    /// Reconciles and assembles the final report.
    async fn finish(
        &self,
        operation: StackOperation,
        plan: OperationPlan,
        execution: ExecutionReport,
        state: &StackState,
        table: &AttributeTable,
    ) -> Result<OrchestrationReport> {
        let mut errors: Vec<String> = execution
            .errors()
            .into_iter()
            .map(|(id, e)| format!("{id}: {e}"))
            .collect();
        if execution.blocked() > 0 {
            errors.push(format!("{} operation(s) blocked by failures", execution.blocked()));
        }
        if execution.cancelled() > 0 {
            errors.push(format!("{} operation(s) cancelled", execution.cancelled()));
        }

        let mut phase = if execution.is_success() {
            Phase::Reconciling
        } else {
            Phase::Failed
        };

        let mut drift = None;
        if phase == Phase::Reconciling && operation == StackOperation::Apply {
            let records: Vec<&ResourceRecord> = match self.config.orchestration.drift_check {
                DriftCheck::Always => state.provisioned(),
                DriftCheck::AfterChanges if plan.is_empty() => Vec::new(),
                DriftCheck::AfterChanges => state.provisioned(),
                DriftCheck::Never => Vec::new(),
            };
            if !records.is_empty() {
                info!("Reconciling {} resources", records.len());
                let report = self.describe_records(&records).await;
                if !report.errors.is_empty() {
                    errors.extend(report.errors.iter().cloned());
                    phase = Phase::Failed;
                }
                drift = Some(report);
            }
        }

        let mut outputs = StackOutputs {
            attributes: table.flatten(),
            outputs: BTreeMap::new(),
        };
        if operation == StackOperation::Apply {
            match OutputResolver::new(&self.config.project).resolve_outputs(&self.config.outputs, table) {
                Ok(named) => outputs.outputs = named,
                Err(e) if phase == Phase::Failed => debug!("Outputs unavailable: {e}"),
                Err(e) => {
                    errors.push(e.to_string());
                    phase = Phase::Failed;
                }
            }
        }

        if phase == Phase::Reconciling {
            phase = Phase::Settled;
        }
        info!("Pass finished in phase {phase}: {execution}");

        Ok(OrchestrationReport {
            phase,
            operation,
            plan,
            execution,
            drift,
            outputs,
            errors,
        })
    }

    async fn describe_records(&self, records: &[&ResourceRecord]) -> DriftReport {
        let mut report = DriftReport::default();

        for record in records {
            let handle = ResourceHandle {
                id: record.id.clone(),
                resource_type: record.resource_type,
                physical_name: record.physical_name.clone(),
                attributes: record.attributes.clone(),
            };
            let adapter = match self.registry.adapter_for(record.resource_type) {
                Ok(adapter) => adapter,
                Err(e) => {
                    report.errors.push(format!("{}: {e}", record.id));
                    continue;
                }
            };

            report.checked += 1;
            match adapter.describe(&handle).await {
                Ok(observed) => {
                    for (attribute, recorded) in &record.attributes {
                        match observed.get(attribute) {
                            Some(value) if value == recorded => {}
                            Some(value) => report.drifted.push(DriftItem {
                                resource: record.id.clone(),
                                description: format!(
                                    "attribute '{attribute}' changed from {} to {}",
                                    display_value(recorded),
                                    display_value(value)
                                ),
                            }),
                            None => report.drifted.push(DriftItem {
                                resource: record.id.clone(),
                                description: format!("attribute '{attribute}' is no longer reported"),
                            }),
                        }
                    }
                }
                Err(ProviderError::NotFound { .. }) => report.drifted.push(DriftItem {
                    resource: record.id.clone(),
                    description: String::from("resource no longer exists at the provider"),
                }),
                Err(e) => report.errors.push(format!("{}: {e}", record.id)),
            }
        }

        for item in &report.drifted {
            warn!("Drift on '{}': {}", item.resource, item.description);
        }
        report
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock: {e}");
        }
    }
}

impl<S: StateStore> fmt::Debug for Orchestrator<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stack", &self.config.qualified_name())
            .field("backend", &self.store.backend_type())
            .field("registry", self.registry)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

fn step_names(plan: &OperationPlan) -> Vec<String> {
    plan.steps.iter().map(|s| s.resource.to_string()).collect()
}

fn history_entry(operation: StackOperation, plan: &OperationPlan, execution: &ExecutionReport) -> HistoryEntry {
    if execution.is_success() {
        HistoryEntry::new(operation, &plan.config_hash, step_names(plan))
    } else {
        HistoryEntry::failed(operation, &plan.config_hash, step_names(plan), &execution.to_string())
    }
}

fn display_value(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("?"))
}

impl DriftReport {
    /// Returns true if any discrepancy was found.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }
}

impl OrchestrationReport {
    /// Returns true if the pass settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.phase == Phase::Settled
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Reconciling => "reconciling",
            Self::Settled => "settled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.drifted.is_empty() {
            write!(f, "No drift detected across {} resources", self.checked)?;
        } else {
            writeln!(f, "Drift detected:")?;
            for item in &self.drifted {
                writeln!(f, "  - {}: {}", item.resource, item.description)?;
            }
        }
        Ok(())
    }
}
