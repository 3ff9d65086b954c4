//! Plan executor for provisioning passes.
//!
//! This module runs an [`OperationPlan`] against provider adapters. Steps
//! whose `after` steps succeeded start as tasks; the driver loop alone
//! publishes attributes and updates recorded state as tasks finish. Failures
//! block dependents but never abort independent branches, and nothing is
//! rolled back.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, OrchestrationConfig, ProjectConfig};
use crate::error::{ProviderError, ResolveError, Result, StackError};
use crate::provider::{
    PendingOperation, ProviderAdapter, ProviderRegistry, ProviderResponse, ResourceHandle,
};
use crate::resolver::{AttributeTable, OutputResolver};
use crate::resource::{
    Attributes, ResolvedDescriptor, ResourceDescriptor, ResourceId, ResourceType,
};
use crate::state::{ResourceRecord, ResourceStatus, StackState};

use super::plan::{Action, OperationPlan, PlannedOperation};

/// Executor for operation plans.
#[derive(Debug)]
pub struct PlanExecutor<'a> {
    /// Adapters per resource type.
    registry: &'a ProviderRegistry,
    /// Project the resources belong to.
    project: &'a ProjectConfig,
    /// Timeouts, polling and parallelism.
    settings: &'a OrchestrationConfig,
    hasher: ConfigHasher,
}

/// Final outcome of one planned operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The provider completed the operation.
    Succeeded,
    /// A conditional update found its resolved inputs unchanged.
    Unchanged,
    /// The provider reported an error.
    Failed {
        /// Error message.
        error: String,
    },
    /// The operation exceeded the configured timeout.
    TimedOut {
        /// Error message.
        error: String,
    },
    /// A step this one waits for did not succeed.
    Blocked {
        /// The step that did not succeed.
        by: ResourceId,
    },
    /// The pass was cancelled before or while the step ran.
    Cancelled,
}

/// Result of executing a single operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    /// Resource the operation applied to.
    pub resource: ResourceId,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Operation kind.
    pub action: Action,
    /// Final outcome.
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Wall time from start to completion, zero for steps never started.
    pub elapsed_ms: u64,
}

/// Result of executing an entire plan, in plan order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    /// Individual operation results.
    pub results: Vec<OperationResult>,
}

/// Provider work handed to a task.
enum Work {
    Create(ResolvedDescriptor),
    Update(ResolvedDescriptor, Attributes),
    Delete(ResourceHandle),
}

/// What the driver needs to record a finished task.
struct InFlight {
    descriptor: Option<ResourceDescriptor>,
    applied_hash: String,
    physical_name: String,
    started: Instant,
}

/// A step prepared by the driver: either work to run, or an outcome that
/// needs no provider call.
enum Prepared {
    Run(Arc<dyn ProviderAdapter>, Work, InFlight),
    Done(Outcome),
}

struct TaskOutput {
    index: usize,
    result: std::result::Result<Attributes, ProviderError>,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub const fn new(
        registry: &'a ProviderRegistry,
        project: &'a ProjectConfig,
        settings: &'a OrchestrationConfig,
    ) -> Self {
        Self {
            registry,
            project,
            settings,
            hasher: ConfigHasher::new(),
        }
    }

    /// Executes a plan.
    ///
    /// `desired` supplies the descriptors of create and update steps; deletes
    /// are driven from `state`. Successful steps publish their attributes to
    /// `table` and update `state` as they finish.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if a started step has an unresolvable
    /// reference. In-flight operations are drained and recorded first.
    pub async fn execute(
        &self,
        plan: &OperationPlan,
        desired: &[ResourceDescriptor],
        state: &mut StackState,
        table: &mut AttributeTable,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ExecutionReport> {
        info!(
            "Executing plan with {} operations (max {} in parallel)",
            plan.len(),
            self.settings.max_parallel
        );

        let descriptors: BTreeMap<&ResourceId, &ResourceDescriptor> =
            desired.iter().map(|d| (&d.id, d)).collect();
        let positions: BTreeMap<&ResourceId, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (&s.resource, i))
            .collect();

        let mut outcomes: Vec<Option<Outcome>> = vec![None; plan.len()];
        let mut elapsed = vec![Duration::ZERO; plan.len()];
        let mut in_flight: BTreeMap<usize, InFlight> = BTreeMap::new();
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut fatal: Option<ResolveError> = None;

        loop {
            let stopping = *cancel.borrow() || fatal.is_some();

            for (index, step) in plan.steps.iter().enumerate() {
                if stopping {
                    break;
                }
                if outcomes[index].is_some() || in_flight.contains_key(&index) {
                    continue;
                }

                // `after` entries always precede their step, so blocking
                // propagates in a single sweep.
                let mut waiting = false;
                let mut blocked_by = None;
                for dependency in &step.after {
                    let Some(&position) = positions.get(dependency) else {
                        continue;
                    };
                    match &outcomes[position] {
                        None => waiting = true,
                        Some(Outcome::Succeeded | Outcome::Unchanged) => {}
                        Some(_) => {
                            blocked_by = Some(dependency.clone());
                            break;
                        }
                    }
                }
                if let Some(by) = blocked_by {
                    warn!("{} blocked by '{by}'", step.description());
                    outcomes[index] = Some(Outcome::Blocked { by });
                    continue;
                }
                if waiting {
                    continue;
                }

                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    continue;
                };

                match self.prepare(step, &descriptors, state, table) {
                    Ok(Prepared::Done(outcome)) => outcomes[index] = Some(outcome),
                    Ok(Prepared::Run(adapter, work, flight)) => {
                        info!("{} via {}", step.description(), adapter.name());
                        let settings = self.settings.clone();
                        let cancel = cancel.clone();
                        let resource = step.resource.clone();
                        in_flight.insert(index, flight);
                        tasks.spawn(async move {
                            let result = perform(adapter, work, &resource, &settings, cancel).await;
                            drop(permit);
                            TaskOutput { index, result }
                        });
                    }
                    Err(e) => {
                        error!("{e}");
                        outcomes[index] = Some(Outcome::Failed {
                            error: e.to_string(),
                        });
                        fatal = Some(e);
                        break;
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let output = joined.map_err(|e| StackError::internal(format!("Operation task failed: {e}")))?;
            let Some(flight) = in_flight.remove(&output.index) else {
                continue;
            };
            let step = &plan.steps[output.index];
            elapsed[output.index] = flight.started.elapsed();
            outcomes[output.index] = Some(self.record(step, flight, output.result, state, table));
        }

        let results = plan
            .steps
            .iter()
            .zip(outcomes)
            .zip(elapsed)
            .map(|((step, outcome), elapsed)| OperationResult {
                resource: step.resource.clone(),
                resource_type: step.resource_type,
                action: step.action,
                outcome: outcome.unwrap_or(Outcome::Cancelled),
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            })
            .collect();

        if let Some(e) = fatal {
            return Err(e.into());
        }

        let report = ExecutionReport { results };
        info!("{report}");
        Ok(report)
    }

    /// Resolves inputs and picks the adapter for a ready step.
    fn prepare(
        &self,
        step: &PlannedOperation,
        descriptors: &BTreeMap<&ResourceId, &ResourceDescriptor>,
        state: &StackState,
        table: &AttributeTable,
    ) -> std::result::Result<Prepared, ResolveError> {
        let record = state.record(step.resource.as_str());

        let (work, flight) = match step.action {
            Action::Create | Action::Update => {
                let Some(descriptor) = descriptors.get(&step.resource) else {
                    return Ok(Prepared::Done(Outcome::Failed {
                        error: format!("'{}' is not declared", step.resource),
                    }));
                };
                let resolved = OutputResolver::new(self.project).resolve(descriptor, table)?;
                let applied_hash = self.hasher.hash_resolved(&resolved);

                if step.conditional
                    && record.and_then(|r| r.applied_hash.as_deref()) == Some(applied_hash.as_str())
                {
                    debug!("'{}' resolved inputs unchanged, skipping update", step.resource);
                    return Ok(Prepared::Done(Outcome::Unchanged));
                }

                let flight = InFlight {
                    descriptor: Some((*descriptor).clone()),
                    applied_hash,
                    physical_name: resolved.physical_name.clone(),
                    started: Instant::now(),
                };
                let work = match (step.action, record) {
                    (Action::Update, Some(record)) => Work::Update(resolved, record.attributes.clone()),
                    _ => Work::Create(resolved),
                };
                (work, flight)
            }
            Action::Delete => {
                let Some(record) = record else {
                    debug!("'{}' has no record, nothing to delete", step.resource);
                    return Ok(Prepared::Done(Outcome::Succeeded));
                };
                let handle = ResourceHandle {
                    id: record.id.clone(),
                    resource_type: record.resource_type,
                    physical_name: record.physical_name.clone(),
                    attributes: record.attributes.clone(),
                };
                let flight = InFlight {
                    descriptor: None,
                    applied_hash: String::new(),
                    physical_name: record.physical_name.clone(),
                    started: Instant::now(),
                };
                (Work::Delete(handle), flight)
            }
        };

        match self.registry.adapter_for(step.resource_type) {
            Ok(adapter) => Ok(Prepared::Run(adapter, work, flight)),
            Err(e) => Ok(Prepared::Done(Outcome::Failed {
                error: e.to_string(),
            })),
        }
    }

    /// Applies a finished task to state and the attribute table.
    fn record(
        &self,
        step: &PlannedOperation,
        flight: InFlight,
        result: std::result::Result<Attributes, ProviderError>,
        state: &mut StackState,
        table: &mut AttributeTable,
    ) -> Outcome {
        let id = &step.resource;

        if step.action == Action::Delete {
            return match result {
                Ok(_) => {
                    info!("Deleted {} '{id}'", step.resource_type);
                    state.remove_record(id.as_str());
                    table.retract(id.as_str());
                    Outcome::Succeeded
                }
                Err(ProviderError::NotFound { .. }) => {
                    info!("{} '{id}' was already deleted", step.resource_type);
                    state.remove_record(id.as_str());
                    table.retract(id.as_str());
                    Outcome::Succeeded
                }
                Err(e) => {
                    error!("Failed to delete '{id}': {e}");
                    let outcome = failure_outcome(&e);
                    if let Some(record) = state.resources.get_mut(id.as_str()) {
                        record.mark_failed(status_for(&outcome), e.to_string());
                    }
                    outcome
                }
            };
        }

        let Some(descriptor) = flight.descriptor else {
            return Outcome::Failed {
                error: format!("'{id}' lost its descriptor"),
            };
        };
        let descriptor_hash = self.hasher.hash_descriptor(&descriptor);

        let mut record = match state.resources.remove(id.as_str()) {
            Some(mut existing) => {
                existing.resource_type = descriptor.resource_type;
                existing.physical_name = flight.physical_name;
                existing.descriptor = descriptor;
                existing.descriptor_hash = descriptor_hash;
                existing
            }
            None => ResourceRecord::new(
                descriptor,
                descriptor_hash,
                flight.physical_name,
                ResourceStatus::Failed,
            ),
        };

        let outcome = match result {
            Ok(attributes) => {
                info!("{} {} '{id}' ({} attributes)", past_tense(step.action), step.resource_type, attributes.len());
                table.publish(id.clone(), attributes.clone());
                record.mark_provisioned(flight.applied_hash, attributes);
                Outcome::Succeeded
            }
            Err(e @ ProviderError::NotFound { .. }) if step.action == Action::Update => {
                warn!(
                    "{} '{id}' no longer exists at the provider, it will be created again",
                    step.resource_type
                );
                table.retract(id.as_str());
                record.mark_lost(e.to_string());
                Outcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(e) => {
                error!("Failed to {} '{id}': {e}", step.action);
                table.retract(id.as_str());
                let outcome = failure_outcome(&e);
                record.mark_failed(status_for(&outcome), e.to_string());
                outcome
            }
        };

        state.set_record(record);
        outcome
    }
}

/// Runs one provider operation to completion under the operation timeout.
async fn perform(
    adapter: Arc<dyn ProviderAdapter>,
    work: Work,
    resource: &ResourceId,
    settings: &OrchestrationConfig,
    mut cancel: watch::Receiver<bool>,
) -> std::result::Result<Attributes, ProviderError> {
    let timeout = settings.operation_timeout();
    let deadline = tokio::time::Instant::now() + timeout;
    let (action, started) = match &work {
        Work::Create(resolved) => (Action::Create, adapter.create(resolved)),
        Work::Update(resolved, previous) => (Action::Update, adapter.update(resolved, previous)),
        Work::Delete(handle) => (Action::Delete, adapter.delete(handle)),
    };
    let timed_out = || ProviderError::TimedOut {
        resource: resource.to_string(),
        operation: action.to_string(),
        timeout_secs: timeout.as_secs(),
    };

    let mut operation = match tokio::time::timeout_at(deadline, started).await {
        Err(_) => return Err(timed_out()),
        Ok(response) => match response? {
            ProviderResponse::Complete(attributes) => return Ok(attributes),
            ProviderResponse::InProgress(operation) => operation,
        },
    };

    let mut watching = true;
    let mut cancel_sent = false;
    loop {
        if watching && !cancel_sent && *cancel.borrow() {
            cancel_sent = true;
            if abort(adapter.as_ref(), &operation).await {
                return Err(ProviderError::Cancelled {
                    resource: resource.to_string(),
                });
            }
            warn!("{operation} cannot be cancelled, waiting for it to settle");
        }

        tokio::select! {
            () = tokio::time::sleep(settings.poll_interval()) => {}
            changed = cancel.changed(), if watching && !cancel_sent => {
                watching = changed.is_ok();
                continue;
            }
            () = tokio::time::sleep_until(deadline) => {
                abort(adapter.as_ref(), &operation).await;
                return Err(timed_out());
            }
        }

        match tokio::time::timeout_at(deadline, adapter.poll(&operation)).await {
            Err(_) => {
                abort(adapter.as_ref(), &operation).await;
                return Err(timed_out());
            }
            Ok(Ok(ProviderResponse::Complete(attributes))) => return Ok(attributes),
            Ok(Ok(ProviderResponse::InProgress(next))) => operation = next,
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// Asks the provider to abort an operation; true if it did.
async fn abort(adapter: &dyn ProviderAdapter, operation: &PendingOperation) -> bool {
    match adapter.cancel(operation).await {
        Ok(cancelled) => cancelled,
        Err(e) => {
            warn!("Failed to cancel {operation}: {e}");
            false
        }
    }
}

fn failure_outcome(error: &ProviderError) -> Outcome {
    match error {
        ProviderError::TimedOut { .. } => Outcome::TimedOut {
            error: error.to_string(),
        },
        ProviderError::Cancelled { .. } => Outcome::Cancelled,
        _ => Outcome::Failed {
            error: error.to_string(),
        },
    }
}

const fn status_for(outcome: &Outcome) -> ResourceStatus {
    match outcome {
        Outcome::TimedOut { .. } => ResourceStatus::TimedOut,
        _ => ResourceStatus::Failed,
    }
}

const fn past_tense(action: Action) -> &'static str {
    match action {
        Action::Create => "Created",
        Action::Update => "Updated",
        Action::Delete => "Deleted",
    }
}

impl Outcome {
    /// Returns true if dependents may proceed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Unchanged)
    }

    /// Returns true for provider failures and timeouts.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut { .. })
    }

    /// Short label for tables.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Unchanged => "unchanged",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed out",
            Self::Blocked { .. } => "blocked",
            Self::Cancelled => "cancelled",
        }
    }
}

impl ExecutionReport {
    /// Gets the result for a resource.
    #[must_use]
    pub fn result(&self, id: &str) -> Option<&OperationResult> {
        self.results.iter().find(|r| r.resource.as_str() == id)
    }

    /// Gets the outcome for a resource.
    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.result(id).map(|r| &r.outcome)
    }

    /// Returns true if every operation succeeded or was unchanged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
    }

    /// Number of operations that succeeded or were unchanged.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_success()).count()
    }

    /// Number of failed or timed out operations.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_failure()).count()
    }

    /// Number of blocked operations.
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Blocked { .. }))
            .count()
    }

    /// Number of cancelled operations.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == Outcome::Cancelled)
            .count()
    }

    /// Error messages of failed operations, keyed by resource.
    #[must_use]
    pub fn errors(&self) -> Vec<(ResourceId, String)> {
        self.results
            .iter()
            .filter_map(|r| match &r.outcome {
                Outcome::Failed { error } | Outcome::TimedOut { error } => {
                    Some((r.resource.clone(), error.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} blocked, {} cancelled",
            self.succeeded(),
            self.failed(),
            self.blocked(),
            self.cancelled()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{DependencyGraph, DiffEngine};
    use crate::provider::SimulatedProvider;
    use crate::resource::Value;

    fn project() -> ProjectConfig {
        ProjectConfig {
            name: String::from("shop"),
            environment: String::from("dev"),
            region: String::from("us-east-1"),
            account: Some(String::from("123456789012")),
        }
    }

    fn fast() -> OrchestrationConfig {
        OrchestrationConfig {
            operation_timeout_secs: 1,
            poll_interval_ms: 10,
            max_parallel: 4,
            ..OrchestrationConfig::default()
        }
    }

    fn plan_for(desired: &[ResourceDescriptor], state: &StackState) -> OperationPlan {
        let graph = DependencyGraph::build(desired).unwrap();
        let recorded = DependencyGraph::build_recorded(&state.descriptors()).unwrap();
        let diff = DiffEngine::new().compute_diff(desired, &graph, Some(state)).unwrap();
        OperationPlan::from_diff(&diff, &graph, &recorded, Some(state), "hash").unwrap()
    }

    fn diamond() -> Vec<ResourceDescriptor> {
        vec![
            ResourceDescriptor::new("d", ResourceType::Bucket),
            ResourceDescriptor::new("e", ResourceType::LogGroup),
            ResourceDescriptor::new("f", ResourceType::Function)
                .with_property("bucket", Value::reference("d", "arn"))
                .with_property("queue", Value::reference("e", "arn")),
        ]
    }

    async fn run(
        provider: Arc<SimulatedProvider>,
        settings: &OrchestrationConfig,
        desired: &[ResourceDescriptor],
        state: &mut StackState,
    ) -> ExecutionReport {
        let registry = ProviderRegistry::single(provider);
        let project = project();
        let plan = plan_for(desired, state);
        let mut table = AttributeTable::from_state(state);
        let (_tx, rx) = watch::channel(false);
        PlanExecutor::new(&registry, &project, settings)
            .execute(&plan, desired, state, &mut table, &rx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_independent_steps_run_concurrently() {
        let provider = Arc::new(
            SimulatedProvider::new("us-east-1", "123456789012")
                .with_latency(Duration::from_millis(50)),
        );
        let mut state = StackState::new("shop", "dev");

        let report = run(Arc::clone(&provider), &fast(), &diamond(), &mut state).await;

        assert!(report.is_success());
        assert!(provider.peak_concurrency() >= 2);
        let calls: Vec<String> = provider.calls().await.iter().map(ToString::to_string).collect();
        let f = calls.iter().position(|c| c == "create f").unwrap();
        assert!(calls.iter().position(|c| c == "create d").unwrap() < f);
        assert!(calls.iter().position(|c| c == "create e").unwrap() < f);

        let record = state.record("f").unwrap();
        assert_eq!(record.status, ResourceStatus::Provisioned);
        assert_eq!(
            record.descriptor.properties["bucket"],
            Value::reference("d", "arn")
        );
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let provider = Arc::new(
            SimulatedProvider::new("us-east-1", "123456789012")
                .with_latency(Duration::from_millis(20)),
        );
        let desired: Vec<ResourceDescriptor> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|id| ResourceDescriptor::new(id, ResourceType::Bucket))
            .collect();
        let settings = OrchestrationConfig {
            max_parallel: 2,
            ..fast()
        };
        let mut state = StackState::new("shop", "dev");

        let report = run(Arc::clone(&provider), &settings, &desired, &mut state).await;

        assert_eq!(report.succeeded(), 5);
        assert!(provider.peak_concurrency() <= 2);
    }

    #[tokio::test]
    async fn test_timeout_blocks_dependents() {
        let provider = Arc::new(SimulatedProvider::new("us-east-1", "123456789012").hang_on("f"));
        let desired = vec![
            ResourceDescriptor::new("f", ResourceType::Database),
            ResourceDescriptor::new("g", ResourceType::ContainerService)
                .with_property("db", Value::reference("f", "endpoint")),
            ResourceDescriptor::new("h", ResourceType::Bucket),
        ];
        let mut state = StackState::new("shop", "dev");

        let report = run(Arc::clone(&provider), &fast(), &desired, &mut state).await;

        assert!(matches!(report.outcome("f"), Some(Outcome::TimedOut { .. })));
        assert_eq!(
            report.outcome("g"),
            Some(&Outcome::Blocked {
                by: ResourceId::from("f")
            })
        );
        assert_eq!(report.outcome("h"), Some(&Outcome::Succeeded));
        assert_eq!(state.record("f").unwrap().status, ResourceStatus::TimedOut);
        assert!(state.record("g").is_none());
        assert_eq!(report.to_string(), "1 succeeded, 1 failed, 1 blocked, 0 cancelled");

        let calls: Vec<String> = provider.calls().await.iter().map(ToString::to_string).collect();
        assert!(calls.contains(&String::from("cancel f")));
        assert!(!calls.iter().any(|c| c.ends_with(" g")));
    }

    #[tokio::test]
    async fn test_failure_keeps_independent_branches() {
        let provider = Arc::new(SimulatedProvider::new("us-east-1", "123456789012").fail_on("d"));
        let mut state = StackState::new("shop", "dev");

        let report = run(provider, &fast(), &diamond(), &mut state).await;

        assert!(!report.is_success());
        assert!(matches!(report.outcome("d"), Some(Outcome::Failed { .. })));
        assert_eq!(report.outcome("e"), Some(&Outcome::Succeeded));
        assert!(matches!(report.outcome("f"), Some(Outcome::Blocked { .. })));
        assert_eq!(report.errors().len(), 1);
        assert!(!state.record("d").unwrap().ever_provisioned());
    }

    #[tokio::test]
    async fn test_polled_operations_complete() {
        let provider = Arc::new(SimulatedProvider::new("us-east-1", "123456789012").with_polls(3));
        let mut state = StackState::new("shop", "dev");

        let report = run(Arc::clone(&provider), &fast(), &diamond(), &mut state).await;

        assert!(report.is_success());
        assert_eq!(state.provisioned().len(), 3);
        assert!(provider.calls().await.iter().any(|c| c.method == "poll"));
    }

    #[tokio::test]
    async fn test_conditional_update_skipped_when_inputs_unchanged() {
        let provider = Arc::new(SimulatedProvider::new("us-east-1", "123456789012"));
        let mut state = StackState::new("shop", "dev");
        run(Arc::clone(&provider), &fast(), &diamond(), &mut state).await;
        provider.clear_calls().await;

        // The bucket arn f reads does not depend on versioning.
        let mut desired = diamond();
        desired[0] = ResourceDescriptor::new("d", ResourceType::Bucket).with_property("versioning", true);

        let report = run(Arc::clone(&provider), &fast(), &desired, &mut state).await;

        assert_eq!(report.outcome("d"), Some(&Outcome::Succeeded));
        assert_eq!(report.outcome("f"), Some(&Outcome::Unchanged));
        let calls: Vec<String> = provider.calls().await.iter().map(ToString::to_string).collect();
        assert_eq!(calls, vec!["update d"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = Arc::new(SimulatedProvider::new("us-east-1", "123456789012"));
        let registry = ProviderRegistry::single(Arc::clone(&provider) as Arc<dyn ProviderAdapter>);
        let project = project();
        let settings = fast();
        let desired = diamond();
        let mut state = StackState::new("shop", "dev");
        let plan = plan_for(&desired, &state);
        let mut table = AttributeTable::new();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = PlanExecutor::new(&registry, &project, &settings)
            .execute(&plan, &desired, &mut state, &mut table, &rx)
            .await
            .unwrap();

        assert_eq!(report.cancelled(), 3);
        assert_eq!(provider.call_count().await, 0);
        assert!(state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_operation_cancelled() {
        let provider = Arc::new(SimulatedProvider::new("us-east-1", "123456789012").hang_on("d"));
        let registry = ProviderRegistry::single(Arc::clone(&provider) as Arc<dyn ProviderAdapter>);
        let project = project();
        let settings = OrchestrationConfig {
            operation_timeout_secs: 30,
            ..fast()
        };
        let desired = diamond();
        let mut state = StackState::new("shop", "dev");
        let plan = plan_for(&desired, &state);
        let mut table = AttributeTable::new();
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let report = PlanExecutor::new(&registry, &project, &settings)
            .execute(&plan, &desired, &mut state, &mut table, &rx)
            .await
            .unwrap();

        assert_eq!(report.outcome("d"), Some(&Outcome::Cancelled));
        assert_eq!(report.outcome("e"), Some(&Outcome::Succeeded));
        assert_eq!(report.outcome("f"), Some(&Outcome::Cancelled));
        assert!(provider.calls().await.iter().any(|c| c.to_string() == "cancel d"));
        assert_eq!(state.record("d").unwrap().status, ResourceStatus::Failed);
    }

    #[tokio::test]
    async fn test_uncancellable_operations_run_to_completion() {
        let provider = Arc::new(
            SimulatedProvider::new("us-east-1", "123456789012")
                .with_polls(20)
                .with_cancel_support(false),
        );
        let registry = ProviderRegistry::single(Arc::clone(&provider) as Arc<dyn ProviderAdapter>);
        let project = project();
        let settings = OrchestrationConfig {
            operation_timeout_secs: 30,
            ..fast()
        };
        let desired = diamond();
        let mut state = StackState::new("shop", "dev");
        let plan = plan_for(&desired, &state);
        let mut table = AttributeTable::new();
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let report = PlanExecutor::new(&registry, &project, &settings)
            .execute(&plan, &desired, &mut state, &mut table, &rx)
            .await
            .unwrap();

        assert_eq!(report.outcome("d"), Some(&Outcome::Succeeded));
        assert_eq!(report.outcome("e"), Some(&Outcome::Succeeded));
        assert_eq!(report.outcome("f"), Some(&Outcome::Cancelled));
        assert!(state.record("d").unwrap().ever_provisioned());
        assert!(table.flatten().contains_key("e.name"));
        assert!(provider.calls().await.iter().any(|c| c.to_string() == "cancel d"));
    }

    #[tokio::test]
    async fn test_deletes_remove_records() {
        let provider = Arc::new(SimulatedProvider::new("us-east-1", "123456789012"));
        let mut state = StackState::new("shop", "dev");
        run(Arc::clone(&provider), &fast(), &diamond(), &mut state).await;
        provider.clear_calls().await;

        let report = run(Arc::clone(&provider), &fast(), &[], &mut state).await;

        assert!(report.is_success());
        assert!(state.resources.is_empty());
        let calls: Vec<String> = provider.calls().await.iter().map(ToString::to_string).collect();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], "delete f");
    }
}
