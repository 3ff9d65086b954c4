//! Simulated provider.
//!
//! Provisions resources in memory, optionally persisted to a JSON snapshot so
//! that consecutive CLI runs see the same "cloud". Attributes are derived
//! from the physical name, so the same stack always produces the same ids,
//! ARNs and endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ProviderError, StackError};
use crate::planner::Action;
use crate::resource::{Attributes, ResolvedDescriptor, ResourceId, ResourceType, Value};

use super::adapter::{PendingOperation, ProviderAdapter, ProviderResponse, ResourceHandle};

/// A resource held by the simulated provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedResource {
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Provider-facing name.
    pub physical_name: String,
    /// Properties last applied.
    pub properties: Attributes,
    /// Attributes reported by `describe`.
    pub attributes: Attributes,
}

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Adapter method.
    pub method: &'static str,
    /// Resource involved.
    pub resource: ResourceId,
}

impl fmt::Display for ProviderCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.resource)
    }
}

enum Effect {
    Upsert(SimulatedResource),
    Remove,
}

struct Pending {
    operation: PendingOperation,
    remaining_polls: u32,
    hang: bool,
    effect: Effect,
}

#[derive(Default)]
struct Inner {
    resources: BTreeMap<ResourceId, SimulatedResource>,
    pending: BTreeMap<String, Pending>,
    next_operation: u64,
    calls: Vec<ProviderCall>,
}

/// In-memory provider with deterministic attributes.
pub struct SimulatedProvider {
    name: String,
    region: String,
    account: String,
    polls_before_complete: u32,
    latency: Duration,
    cancel_supported: bool,
    failures: BTreeSet<ResourceId>,
    hangs: BTreeSet<ResourceId>,
    snapshot: Option<PathBuf>,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedProvider {
    /// Creates an empty simulated provider.
    #[must_use]
    pub fn new(region: &str, account: &str) -> Self {
        Self {
            name: String::from("simulated"),
            region: region.to_string(),
            account: account.to_string(),
            polls_before_complete: 0,
            latency: Duration::ZERO,
            cancel_supported: true,
            failures: BTreeSet::new(),
            hangs: BTreeSet::new(),
            snapshot: None,
            inner: Mutex::new(Inner::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Opens a provider persisted at `path`, loading existing resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read.
    pub async fn open(
        path: impl AsRef<Path>,
        region: &str,
        account: &str,
    ) -> crate::error::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut provider = Self::new(region, account);

        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let resources: BTreeMap<ResourceId, SimulatedResource> =
                serde_json::from_str(&content).map_err(|e| {
                    StackError::internal(format!(
                        "Invalid simulated provider snapshot {}: {e}",
                        path.display()
                    ))
                })?;
            info!(
                "Loaded {} simulated resources from {}",
                resources.len(),
                path.display()
            );
            provider.inner.get_mut().resources = resources;
        }

        provider.snapshot = Some(path);
        Ok(provider)
    }

    /// Renames the adapter.
    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Reports every operation as in progress for `polls` polls.
    #[must_use]
    pub const fn with_polls(mut self, polls: u32) -> Self {
        self.polls_before_complete = polls;
        self
    }

    /// Delays every mutating call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Enables or disables the cancellation hook.
    #[must_use]
    pub const fn with_cancel_support(mut self, supported: bool) -> Self {
        self.cancel_supported = supported;
        self
    }

    /// Makes every operation on `id` fail.
    #[must_use]
    pub fn fail_on(mut self, id: impl Into<ResourceId>) -> Self {
        self.failures.insert(id.into());
        self
    }

    /// Makes every operation on `id` stay in progress forever.
    #[must_use]
    pub fn hang_on(mut self, id: impl Into<ResourceId>) -> Self {
        self.hangs.insert(id.into());
        self
    }

    /// Returns the calls made so far, in order.
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns the number of calls made so far.
    pub async fn call_count(&self) -> usize {
        self.inner.lock().await.calls.len()
    }

    /// Forgets recorded calls.
    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Returns a copy of a held resource.
    pub async fn resource(&self, id: &str) -> Option<SimulatedResource> {
        self.inner.lock().await.resources.get(id).cloned()
    }

    /// Returns the number of held resources.
    pub async fn resource_count(&self) -> usize {
        self.inner.lock().await.resources.len()
    }

    /// Changes an attribute behind the orchestrator's back.
    pub async fn tamper(&self, id: &str, attribute: &str, value: Value) {
        if let Some(resource) = self.inner.lock().await.resources.get_mut(id) {
            resource.attributes.insert(attribute.to_string(), value);
        }
    }

    /// Drops a resource behind the orchestrator's back.
    pub async fn forget(&self, id: &str) {
        self.inner.lock().await.resources.remove(id);
    }

    /// Returns the highest number of concurrent mutating calls observed.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn record(&self, method: &'static str, resource: &ResourceId) {
        self.inner.lock().await.calls.push(ProviderCall {
            method,
            resource: resource.clone(),
        });
    }

    async fn simulate_latency(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Applies an effect now or parks it behind a pending operation.
    async fn submit(
        &self,
        resource: &ResourceId,
        action: Action,
        effect: Effect,
    ) -> Result<ProviderResponse, ProviderError> {
        let hang = self.hangs.contains(resource);
        let mut inner = self.inner.lock().await;

        if !hang && self.polls_before_complete == 0 {
            let attributes = Self::apply(&mut inner, resource, effect);
            drop(inner);
            self.persist(resource).await?;
            return Ok(ProviderResponse::Complete(attributes));
        }

        inner.next_operation += 1;
        let operation = PendingOperation {
            id: format!("op-{:06}", inner.next_operation),
            resource: resource.clone(),
            action,
        };
        debug!("Simulated operation pending: {operation}");
        inner.pending.insert(
            operation.id.clone(),
            Pending {
                operation: operation.clone(),
                remaining_polls: self.polls_before_complete,
                hang,
                effect,
            },
        );
        Ok(ProviderResponse::InProgress(operation))
    }

    fn apply(inner: &mut Inner, resource: &ResourceId, effect: Effect) -> Attributes {
        match effect {
            Effect::Upsert(simulated) => {
                let attributes = simulated.attributes.clone();
                inner.resources.insert(resource.clone(), simulated);
                attributes
            }
            Effect::Remove => {
                inner.resources.remove(resource);
                Attributes::new()
            }
        }
    }

    async fn persist(&self, resource: &ResourceId) -> Result<(), ProviderError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let json = {
            let inner = self.inner.lock().await;
            serde_json::to_string_pretty(&inner.resources)
                .map_err(|e| ProviderError::failed(resource.as_str(), format!("snapshot: {e}")))?
        };

        let snapshot_error = |e: std::io::Error| ProviderError::failed(resource.as_str(), format!("snapshot: {e}"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(snapshot_error)?;
        }
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        tokio::fs::write(&temp, json).await.map_err(snapshot_error)?;
        tokio::fs::rename(&temp, path).await.map_err(snapshot_error)?;
        Ok(())
    }

    fn check_failure(&self, resource: &ResourceId, method: &str) -> Result<(), ProviderError> {
        if self.failures.contains(resource) {
            return Err(ProviderError::failed(
                resource.as_str(),
                format!("simulated {method} failure"),
            ));
        }
        Ok(())
    }

    fn build(&self, resolved: &ResolvedDescriptor, previous: Option<&Attributes>) -> SimulatedResource {
        let mut attributes = synthesize(
            resolved.resource_type,
            &resolved.physical_name,
            &resolved.properties,
            &self.region,
            &self.account,
        );
        // Provider-assigned ids survive updates.
        if let Some(previous) = previous
            && let Some(id) = previous.get("id")
        {
            attributes.insert(String::from("id"), id.clone());
        }

        SimulatedResource {
            resource_type: resolved.resource_type,
            physical_name: resolved.physical_name.clone(),
            properties: resolved.properties.clone(),
            attributes,
        }
    }
}

impl fmt::Debug for SimulatedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedProvider")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, resource: &ResolvedDescriptor) -> Result<ProviderResponse, ProviderError> {
        self.record("create", &resource.id).await;
        self.simulate_latency().await;
        self.check_failure(&resource.id, "create")?;

        let simulated = self.build(resource, None);
        self.submit(&resource.id, Action::Create, Effect::Upsert(simulated))
            .await
    }

    async fn update(
        &self,
        resource: &ResolvedDescriptor,
        previous: &Attributes,
    ) -> Result<ProviderResponse, ProviderError> {
        self.record("update", &resource.id).await;
        self.simulate_latency().await;
        self.check_failure(&resource.id, "update")?;

        if self.inner.lock().await.resources.get(&resource.id).is_none() {
            return Err(ProviderError::NotFound {
                resource: resource.physical_name.clone(),
            });
        }

        let simulated = self.build(resource, Some(previous));
        self.submit(&resource.id, Action::Update, Effect::Upsert(simulated))
            .await
    }

    async fn delete(&self, resource: &ResourceHandle) -> Result<ProviderResponse, ProviderError> {
        self.record("delete", &resource.id).await;
        self.simulate_latency().await;
        self.check_failure(&resource.id, "delete")?;

        if self.inner.lock().await.resources.get(&resource.id).is_none() {
            return Err(ProviderError::NotFound {
                resource: resource.physical_name.clone(),
            });
        }

        self.submit(&resource.id, Action::Delete, Effect::Remove).await
    }

    async fn describe(&self, resource: &ResourceHandle) -> Result<Attributes, ProviderError> {
        self.record("describe", &resource.id).await;
        self.inner
            .lock()
            .await
            .resources
            .get(&resource.id)
            .map(|r| r.attributes.clone())
            .ok_or_else(|| ProviderError::NotFound {
                resource: resource.physical_name.clone(),
            })
    }

    async fn poll(&self, operation: &PendingOperation) -> Result<ProviderResponse, ProviderError> {
        self.record("poll", &operation.resource).await;
        let mut inner = self.inner.lock().await;

        let Some(pending) = inner.pending.get_mut(&operation.id) else {
            return Err(ProviderError::Cancelled {
                resource: operation.resource.to_string(),
            });
        };

        if pending.hang || pending.remaining_polls > 1 {
            pending.remaining_polls = pending.remaining_polls.saturating_sub(1);
            return Ok(ProviderResponse::InProgress(pending.operation.clone()));
        }

        let Some(pending) = inner.pending.remove(&operation.id) else {
            return Err(ProviderError::Cancelled {
                resource: operation.resource.to_string(),
            });
        };
        let attributes = Self::apply(&mut inner, &operation.resource, pending.effect);
        drop(inner);
        self.persist(&operation.resource).await?;
        Ok(ProviderResponse::Complete(attributes))
    }

    async fn cancel(&self, operation: &PendingOperation) -> Result<bool, ProviderError> {
        self.record("cancel", &operation.resource).await;
        if !self.cancel_supported {
            return Ok(false);
        }
        let removed = self.inner.lock().await.pending.remove(&operation.id);
        Ok(removed.is_some())
    }
}

/// Derives the attributes a real provider would report for a resource.
fn synthesize(
    resource_type: ResourceType,
    name: &str,
    properties: &Attributes,
    region: &str,
    account: &str,
) -> Attributes {
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let short = &digest[..17];
    let arn = |service: &str, kind: &str| format!("arn:aws:{service}:{region}:{account}:{kind}{name}");

    let mut attrs = Attributes::new();
    let mut set = |key: &str, value: Value| {
        attrs.insert(key.to_string(), value);
    };
    set("name", Value::from(name));

    match resource_type {
        ResourceType::Network => {
            set("id", Value::from(format!("vpc-{short}")));
            if let Some(cidr) = properties.get("cidr") {
                set("cidr", cidr.clone());
            }
            let subnet_ids: Vec<Value> = match properties.get("subnets") {
                Some(Value::List(subnets)) => subnets
                    .iter()
                    .enumerate()
                    .map(|(i, _)| Value::from(format!("subnet-{}{i:02}", &digest[..15])))
                    .collect(),
                _ => Vec::new(),
            };
            set("subnet_ids", Value::List(subnet_ids));
        }
        ResourceType::SecurityGroup => {
            set("id", Value::from(format!("sg-{short}")));
            set("arn", Value::from(arn("ec2", "security-group/")));
        }
        ResourceType::BastionHost => {
            let bytes = Sha256::digest(name.as_bytes());
            set("id", Value::from(format!("i-{short}")));
            set(
                "public_ip",
                Value::from(format!("3.{}.{}.{}", bytes[0], bytes[1], bytes[2])),
            );
        }
        ResourceType::Database => {
            let engine = properties.get("engine").and_then(Value::as_str).unwrap_or("aurora-postgresql");
            let default_port = match engine {
                e if e.contains("docdb") || e.contains("mongo") => 27017,
                e if e.contains("mysql") => 3306,
                _ => 5432,
            };
            let port = properties.get("port").and_then(Value::as_i64).unwrap_or(default_port);
            set("id", Value::from(format!("cluster-{}", &digest[..12])));
            set("arn", Value::from(arn("rds", "cluster:")));
            set(
                "endpoint",
                Value::from(format!("{name}.cluster-{}.{region}.rds.amazonaws.com", &digest[..12])),
            );
            set(
                "reader_endpoint",
                Value::from(format!("{name}.cluster-ro-{}.{region}.rds.amazonaws.com", &digest[..12])),
            );
            set("port", Value::Integer(port));
        }
        ResourceType::Secret => {
            set("arn", Value::from(format!("{}-{}", arn("secretsmanager", "secret:"), &digest[..6])));
        }
        ResourceType::ContainerRegistry => {
            set("arn", Value::from(arn("ecr", "repository/")));
            set(
                "repository_uri",
                Value::from(format!("{account}.dkr.ecr.{region}.amazonaws.com/{name}")),
            );
        }
        ResourceType::ContainerCluster => {
            set("arn", Value::from(arn("ecs", "cluster/")));
        }
        ResourceType::ContainerService => {
            set("arn", Value::from(arn("ecs", "service/")));
            set("service_name", Value::from(name));
        }
        ResourceType::LoadBalancer => {
            set("arn", Value::from(arn("elasticloadbalancing", "loadbalancer/app/")));
            set(
                "dns_name",
                Value::from(format!("{name}-{}.{region}.elb.amazonaws.com", &digest[..10])),
            );
        }
        ResourceType::Function => {
            set("arn", Value::from(arn("lambda", "function:")));
            set("function_name", Value::from(name));
        }
        ResourceType::ApiGateway => {
            let api_id = &digest[..10];
            set("id", Value::from(api_id));
            set(
                "url",
                Value::from(format!("https://{api_id}.execute-api.{region}.amazonaws.com")),
            );
        }
        ResourceType::Certificate => {
            set("arn", Value::from(arn("acm", "certificate/")));
        }
        ResourceType::DnsZone => {
            set("id", Value::from(format!("Z{}", short.to_uppercase())));
            set(
                "name_servers",
                Value::List(
                    (1..=4)
                        .map(|i| Value::from(format!("ns-{i}{}.awsdns.com", &digest[..3])))
                        .collect(),
                ),
            );
        }
        ResourceType::Bucket => {
            set("arn", Value::from(format!("arn:aws:s3:::{name}")));
            set("domain_name", Value::from(format!("{name}.s3.{region}.amazonaws.com")));
        }
        ResourceType::Cdn => {
            set("id", Value::from(format!("E{}", digest[..13].to_uppercase())));
            set("domain_name", Value::from(format!("d{}.cloudfront.net", &digest[..13])));
        }
        ResourceType::Firewall => {
            set("arn", Value::from(arn("network-firewall", "firewall/")));
        }
        ResourceType::AuditTrail => {
            set("arn", Value::from(arn("cloudtrail", "trail/")));
        }
        ResourceType::LogGroup => {
            set("arn", Value::from(arn("logs", "log-group:")));
            set("log_group_name", Value::from(format!("/stackwright/{name}")));
        }
    }

    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn resolved(id: &str, resource_type: ResourceType) -> ResolvedDescriptor {
        ResolvedDescriptor {
            id: ResourceId::from(id),
            resource_type,
            physical_name: format!("shop-dev-{id}"),
            properties: BTreeMap::new(),
            ingress: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    fn attributes(response: ProviderResponse) -> Attributes {
        match response {
            ProviderResponse::Complete(attributes) => attributes,
            ProviderResponse::InProgress(op) => panic!("unexpected pending {op}"),
        }
    }

    #[tokio::test]
    async fn test_create_is_deterministic() {
        let first = SimulatedProvider::new("eu-west-1", "123456789012");
        let second = SimulatedProvider::new("eu-west-1", "123456789012");
        let db = resolved("db", ResourceType::Database);

        let a = attributes(first.create(&db).await.unwrap());
        let b = attributes(second.create(&db).await.unwrap());
        assert_eq!(a, b);
        assert_eq!(a.get("port"), Some(&Value::Integer(5432)));
        assert!(a["endpoint"].as_str().unwrap().ends_with(".eu-west-1.rds.amazonaws.com"));
    }

    #[tokio::test]
    async fn test_pending_operation_completes_after_polls() {
        let provider = SimulatedProvider::new("us-east-1", "123456789012").with_polls(2);
        let bucket = resolved("files", ResourceType::Bucket);

        let ProviderResponse::InProgress(op) = provider.create(&bucket).await.unwrap() else {
            panic!("expected pending operation");
        };
        assert!(matches!(
            provider.poll(&op).await.unwrap(),
            ProviderResponse::InProgress(_)
        ));
        let attrs = attributes(provider.poll(&op).await.unwrap());
        assert_eq!(attrs["arn"], Value::from("arn:aws:s3:::shop-dev-files"));
        assert_eq!(provider.resource_count().await, 1);
    }

    #[tokio::test]
    async fn test_hang_and_cancel() {
        let provider = SimulatedProvider::new("us-east-1", "123456789012").hang_on("slow");
        let slow = resolved("slow", ResourceType::Cdn);

        let ProviderResponse::InProgress(op) = provider.create(&slow).await.unwrap() else {
            panic!("expected pending operation");
        };
        for _ in 0..5 {
            assert!(matches!(
                provider.poll(&op).await.unwrap(),
                ProviderResponse::InProgress(_)
            ));
        }
        assert!(provider.cancel(&op).await.unwrap());
        assert!(matches!(
            provider.poll(&op).await,
            Err(ProviderError::Cancelled { .. })
        ));
        assert_eq!(provider.resource_count().await, 0);
    }

    #[tokio::test]
    async fn test_failure_injection_and_calls() {
        let provider = SimulatedProvider::new("us-east-1", "123456789012").fail_on("broken");
        assert!(provider.create(&resolved("broken", ResourceType::Function)).await.is_err());
        provider.create(&resolved("ok", ResourceType::Function)).await.unwrap();

        let calls: Vec<String> = provider.calls().await.iter().map(ToString::to_string).collect();
        assert_eq!(calls, vec!["create broken", "create ok"]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let provider = SimulatedProvider::new("us-east-1", "123456789012");
        let handle = ResourceHandle::from(&resolved("ghost", ResourceType::Bucket));
        assert!(matches!(
            provider.delete(&handle).await,
            Err(ProviderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cloud.json");

        let provider = SimulatedProvider::open(&path, "us-east-1", "123456789012").await.unwrap();
        provider.create(&resolved("files", ResourceType::Bucket)).await.unwrap();
        drop(provider);

        let reopened = SimulatedProvider::open(&path, "us-east-1", "123456789012").await.unwrap();
        assert!(reopened.resource("files").await.is_some());
    }
}
