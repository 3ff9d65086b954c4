//! Output resolution.
//!
//! Substitutes references with the attributes their producers published and
//! exposes the stack's outputs. The table only ever holds attributes of
//! resources whose last operation completed.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;

use crate::config::ProjectConfig;
use crate::error::ResolveError;
use crate::resource::{
    Attributes, Reference, ResolvedDescriptor, ResourceDescriptor, ResourceId, Value,
};
use crate::state::{ResourceStatus, StackState};

/// Tag key naming the owning project.
pub const TAG_PROJECT: &str = "stackwright:project";
/// Tag key naming the environment.
pub const TAG_ENVIRONMENT: &str = "stackwright:environment";
/// Tag key naming the resource id.
pub const TAG_RESOURCE: &str = "stackwright:resource";

/// Published attributes per resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttributeTable {
    entries: BTreeMap<ResourceId, Attributes>,
}

impl AttributeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table from the provisioned records of a stack.
    #[must_use]
    pub fn from_state(state: &StackState) -> Self {
        let entries = state
            .resources
            .values()
            .filter(|r| r.status == ResourceStatus::Provisioned)
            .map(|r| (r.id.clone(), r.attributes.clone()))
            .collect();
        Self { entries }
    }

    /// Publishes the full attribute set of a resource, replacing any
    /// previous one.
    pub fn publish(&mut self, id: ResourceId, attributes: Attributes) {
        trace!("Publishing {} attributes for {id}", attributes.len());
        self.entries.insert(id, attributes);
    }

    /// Withdraws a resource's attributes.
    pub fn retract(&mut self, id: &str) -> Option<Attributes> {
        self.entries.remove(id)
    }

    /// Gets the attributes of a resource.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Attributes> {
        self.entries.get(id)
    }

    /// Returns true if the resource has published attributes.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns the number of resources with attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over resources and their attributes.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &Attributes)> {
        self.entries.iter()
    }

    /// Looks up the value a reference points at.
    ///
    /// # Errors
    ///
    /// Returns a reason when the producer has published nothing or the
    /// attribute path does not exist.
    pub fn lookup(&self, reference: &Reference) -> Result<&Value, String> {
        let attributes = self
            .entries
            .get(&reference.resource)
            .ok_or_else(|| format!("resource '{}' is not provisioned", reference.resource))?;

        let (attribute, rest) = reference
            .path
            .split_first()
            .ok_or_else(|| String::from("reference has no attribute"))?;

        attributes
            .get(attribute)
            .ok_or_else(|| {
                format!(
                    "resource '{}' has no attribute '{attribute}'",
                    reference.resource
                )
            })?
            .lookup(rest)
            .ok_or_else(|| format!("path '{}' not found", rest.join(".")))
    }

    /// Flattens the table to `resourceId.attribute -> value`.
    #[must_use]
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .flat_map(|(id, attributes)| {
                attributes
                    .iter()
                    .map(move |(name, value)| (format!("{id}.{name}"), value.clone()))
            })
            .collect()
    }
}

/// Substitutes references using an [`AttributeTable`].
#[derive(Debug, Clone, Copy)]
pub struct OutputResolver<'a> {
    project: &'a ProjectConfig,
}

impl<'a> OutputResolver<'a> {
    /// Creates a resolver for a project.
    #[must_use]
    pub const fn new(project: &'a ProjectConfig) -> Self {
        Self { project }
    }

    /// Resolves every reference in a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnresolvedReference`] if a producer is not
    /// provisioned or lacks the attribute, and
    /// [`ResolveError::NonScalarJoin`] if a join part is not a scalar.
    pub fn resolve(
        &self,
        descriptor: &ResourceDescriptor,
        table: &AttributeTable,
    ) -> Result<ResolvedDescriptor, ResolveError> {
        let properties = descriptor
            .properties
            .iter()
            .map(|(key, value)| {
                Self::resolve_value(&descriptor.id, key, value, table).map(|v| (key.clone(), v))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(ResolvedDescriptor {
            id: descriptor.id.clone(),
            resource_type: descriptor.resource_type,
            physical_name: descriptor.physical_name(&self.project.name, &self.project.environment),
            properties,
            ingress: descriptor.ingress.clone(),
            tags: self.tags(descriptor),
        })
    }

    /// Resolves one value; `path` names it in errors.
    ///
    /// # Errors
    ///
    /// See [`Self::resolve`].
    pub fn resolve_value(
        resource: &ResourceId,
        path: &str,
        value: &Value,
        table: &AttributeTable,
    ) -> Result<Value, ResolveError> {
        match value {
            Value::Reference(reference) => table
                .lookup(reference)
                .cloned()
                .map_err(|reason| ResolveError::UnresolvedReference {
                    resource: resource.clone(),
                    reference: reference.to_string(),
                    reason,
                }),
            Value::Join(join) => {
                let mut text = String::new();
                for (i, part) in join.parts.iter().enumerate() {
                    let part_path = format!("{path}.join[{i}]");
                    let resolved = Self::resolve_value(resource, &part_path, part, table)?;
                    let piece = resolved.to_join_text().ok_or_else(|| {
                        ResolveError::NonScalarJoin {
                            resource: resource.clone(),
                            path: part_path.clone(),
                        }
                    })?;
                    text.push_str(&piece);
                }
                Ok(Value::String(text))
            }
            Value::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| Self::resolve_value(resource, &format!("{path}[{i}]"), item, table))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Map(entries) => entries
                .iter()
                .map(|(key, item)| {
                    Self::resolve_value(resource, &format!("{path}.{key}"), item, table)
                        .map(|v| (key.clone(), v))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Map),
            literal => Ok(literal.clone()),
        }
    }

    /// Resolves the stack's named outputs.
    ///
    /// # Errors
    ///
    /// Returns the first output that cannot be resolved.
    pub fn resolve_outputs(
        &self,
        outputs: &BTreeMap<String, Value>,
        table: &AttributeTable,
    ) -> Result<BTreeMap<String, Value>, ResolveError> {
        let owner = ResourceId::from("outputs");
        outputs
            .iter()
            .map(|(name, value)| {
                Self::resolve_value(&owner, name, value, table).map(|v| (name.clone(), v))
            })
            .collect()
    }

    /// Returns the tags applied to every provisioned resource.
    #[must_use]
    pub fn tags(&self, descriptor: &ResourceDescriptor) -> BTreeMap<String, String> {
        BTreeMap::from([
            (TAG_PROJECT.to_string(), self.project.name.clone()),
            (TAG_ENVIRONMENT.to_string(), self.project.environment.clone()),
            (TAG_RESOURCE.to_string(), descriptor.id.to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Join, ResourceType};

    fn project() -> ProjectConfig {
        ProjectConfig {
            name: String::from("shop"),
            environment: String::from("prod"),
            region: String::from("us-east-1"),
            account: None,
        }
    }

    fn table() -> AttributeTable {
        let mut table = AttributeTable::new();
        table.publish(
            ResourceId::from("db"),
            Attributes::from([
                (String::from("endpoint"), Value::from("db.internal")),
                (String::from("port"), Value::Integer(5432)),
                (
                    String::from("credentials"),
                    Value::Map(BTreeMap::from([(
                        String::from("username"),
                        Value::from("admin"),
                    )])),
                ),
            ]),
        );
        table
    }

    #[test]
    fn test_resolve_substitutes_nested_references() {
        let project = project();
        let resolver = OutputResolver::new(&project);
        let api = ResourceDescriptor::new("api", ResourceType::ContainerService)
            .with_property("db_host", Value::reference("db", "endpoint"))
            .with_property(
                "env",
                Value::List(vec![Value::Reference(Reference {
                    resource: ResourceId::from("db"),
                    path: vec![String::from("credentials"), String::from("username")],
                })]),
            )
            .with_property(
                "dsn",
                Value::Join(Join {
                    parts: vec![
                        Value::from("postgres://"),
                        Value::reference("db", "endpoint"),
                        Value::from(":"),
                        Value::reference("db", "port"),
                    ],
                }),
            );

        let resolved = resolver.resolve(&api, &table()).unwrap();
        assert_eq!(resolved.physical_name, "shop-prod-api");
        assert_eq!(resolved.properties["db_host"], Value::from("db.internal"));
        assert_eq!(
            resolved.properties["env"],
            Value::List(vec![Value::from("admin")])
        );
        assert_eq!(
            resolved.properties["dsn"],
            Value::from("postgres://db.internal:5432")
        );
        assert_eq!(resolved.tags[TAG_RESOURCE], "api");
    }

    #[test]
    fn test_unprovisioned_producer_is_unresolved() {
        let project = project();
        let resolver = OutputResolver::new(&project);
        let web = ResourceDescriptor::new("web", ResourceType::Cdn)
            .with_property("origin", Value::reference("bucket", "domain_name"));

        let err = resolver.resolve(&web, &table()).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UnresolvedReference { ref reference, .. } if reference == "bucket.domain_name"
        ));
    }

    #[test]
    fn test_missing_attribute_is_unresolved() {
        let project = project();
        let resolver = OutputResolver::new(&project);
        let api = ResourceDescriptor::new("api", ResourceType::Function)
            .with_property("x", Value::reference("db", "nonexistent"));
        assert!(resolver.resolve(&api, &table()).is_err());
    }

    #[test]
    fn test_join_rejects_non_scalar() {
        let project = project();
        let resolver = OutputResolver::new(&project);
        let api = ResourceDescriptor::new("api", ResourceType::Function).with_property(
            "x",
            Value::Join(Join {
                parts: vec![Value::reference("db", "credentials")],
            }),
        );
        assert!(matches!(
            resolver.resolve(&api, &table()),
            Err(ResolveError::NonScalarJoin { .. })
        ));
    }

    #[test]
    fn test_flatten_and_outputs() {
        let table = table();
        let flat = table.flatten();
        assert_eq!(flat["db.endpoint"], Value::from("db.internal"));
        assert_eq!(flat["db.port"], Value::Integer(5432));

        let project = project();
        let outputs = OutputResolver::new(&project)
            .resolve_outputs(
                &BTreeMap::from([(String::from("database_url"), Value::reference("db", "endpoint"))]),
                &table,
            )
            .unwrap();
        assert_eq!(outputs["database_url"], Value::from("db.internal"));
    }

    #[test]
    fn test_from_state_skips_failed() {
        use crate::state::ResourceRecord;

        let mut state = StackState::new("shop", "prod");
        let mut ok = ResourceRecord::new(
            ResourceDescriptor::new("ok", ResourceType::Bucket),
            String::new(),
            String::from("shop-prod-ok"),
            ResourceStatus::Provisioned,
        );
        ok.mark_provisioned(String::from("h"), Attributes::from([(String::from("arn"), Value::from("a"))]));
        let failed = ResourceRecord::new(
            ResourceDescriptor::new("bad", ResourceType::Bucket),
            String::new(),
            String::from("shop-prod-bad"),
            ResourceStatus::Failed,
        );
        state.set_record(ok);
        state.set_record(failed);

        let table = AttributeTable::from_state(&state);
        assert!(table.contains("ok"));
        assert!(!table.contains("bad"));
    }
}
