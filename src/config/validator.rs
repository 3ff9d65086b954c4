//! Configuration validation for stack documents.
//!
//! Field-level constraints come from the `validator` derives on the document
//! types; this module adds the cross-resource checks: unique ids, declared
//! reference targets, well-formed `ref`/`join` forms and network consistency.

use crate::error::{ConfigError, Result, StackError};
use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use super::spec::{NetworkConfig, ProjectConfig, StackConfig, StateBackend, StateConfig};
use crate::network::{Ipv4Cidr, SubnetTier};
use crate::resource::{ResourceDescriptor, ResourceType, Value};

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found if validation fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.collect(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StackError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn collect(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        if let Some(network) = &config.network {
            Self::validate_network(network, &mut result);
        }
        push_derive_errors("orchestration", config.orchestration.validate(), &mut result);
        Self::validate_resources(config, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        push_derive_errors("project", project.validate(), result);

        if !project.name.is_empty() && !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if let Some(account) = &project.account
            && !account.chars().all(|c| c.is_ascii_digit())
        {
            result.errors.push(ValidationError {
                field: String::from("project.account"),
                message: format!("Account id '{account}' must contain only digits"),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {
                // Local backend is always valid
            }
        }
    }

    /// Validates the network section.
    fn validate_network(network: &NetworkConfig, result: &mut ValidationResult) {
        push_derive_errors("network", network.validate(), result);

        if let Err(e) = network.cidr.parse::<Ipv4Cidr>() {
            result.errors.push(ValidationError {
                field: String::from("network.cidr"),
                message: e.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for (i, tier) in network.tiers.iter().enumerate() {
            if !seen.insert(tier) {
                result.errors.push(ValidationError {
                    field: format!("network.tiers[{i}]"),
                    message: format!("Duplicate subnet tier: {tier}"),
                });
            }
        }

        let has_egress = network.tiers.contains(&SubnetTier::PrivateWithEgress);
        if has_egress && network.nat_gateways == 0 {
            result.errors.push(ValidationError {
                field: String::from("network.nat_gateways"),
                message: String::from("The private_with_egress tier needs at least one NAT gateway"),
            });
        }
        if network.nat_gateways > 0 && !network.tiers.contains(&SubnetTier::Public) {
            result.errors.push(ValidationError {
                field: String::from("network.nat_gateways"),
                message: String::from("NAT gateways require a public tier"),
            });
        }
        if network.nat_gateways > network.zones {
            result.warnings.push(format!(
                "network.nat_gateways: {} gateways for {} zones, extra gateways stay unused",
                network.nat_gateways, network.zones
            ));
        }
    }

    /// Validates resource descriptors.
    fn validate_resources(config: &StackConfig, result: &mut ValidationResult) {
        let resources = &config.resources;
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let declared: HashSet<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        let mut seen_ids = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_ids.insert(resource.id.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: ConfigError::DuplicateResource {
                        id: resource.id.to_string(),
                    }
                    .to_string(),
                });
            }

            if !is_valid_name(resource.id.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: format!(
                        "Resource id '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.id
                    ),
                });
            }

            Self::validate_references(resource, &prefix, &declared, result);

            for (j, reach) in resource.reachability.iter().enumerate() {
                if !declared.contains(reach.target.as_str()) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.reachability[{j}].target"),
                        message: format!("Reachability target '{}' is not declared", reach.target),
                    });
                }
            }

            if resource.placement.is_some() && config.network.is_none() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.placement"),
                    message: String::from("Placement requires a network section"),
                });
            }

            if !resource.ingress.is_empty() {
                result.warnings.push(format!(
                    "{prefix}.ingress: Ingress is derived from reachability and will be replaced"
                ));
            }
        }

        let networks = resources
            .iter()
            .filter(|r| r.resource_type == ResourceType::Network)
            .count();
        if networks > 1 {
            result.warnings.push(format!(
                "{networks} network resources share one subnet layout"
            ));
        }
    }

    /// Validates the references and explicit dependencies of one resource.
    fn validate_references(
        resource: &ResourceDescriptor,
        prefix: &str,
        declared: &HashSet<&str>,
        result: &mut ValidationResult,
    ) {
        for (key, value) in &resource.properties {
            if let Some(path) = value.find_malformed_form(key) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.properties.{path}"),
                    message: String::from(
                        "Malformed reference: expected {ref: \"<resource>.<attribute>\"} or {join: [..]}",
                    ),
                });
            }
        }

        for (path, reference) in resource.references() {
            if !declared.contains(reference.resource.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.properties.{path}"),
                    message: format!(
                        "Reference {reference} points to undeclared resource '{}'",
                        reference.resource
                    ),
                });
            }
        }

        for dependency in &resource.depends_on {
            if !declared.contains(dependency.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.depends_on"),
                    message: format!("Dependency '{dependency}' is not declared"),
                });
            }
        }
    }

    /// Validates named stack outputs.
    fn validate_outputs(config: &StackConfig, result: &mut ValidationResult) {
        let declared: HashSet<&str> = config.resources.iter().map(|r| r.id.as_str()).collect();

        for (name, value) in &config.outputs {
            let mut refs = Vec::new();
            value.collect_references(name, &mut refs);
            for (path, reference) in refs {
                if !declared.contains(reference.resource.as_str()) {
                    result.errors.push(ValidationError {
                        field: format!("outputs.{path}"),
                        message: format!("Output references undeclared resource '{}'", reference.resource),
                    });
                }
            }
            if matches!(value, Value::Null) {
                result.warnings.push(format!("outputs.{name}: Output is null"));
            }
        }
    }
}

fn push_derive_errors(
    section: &str,
    outcome: std::result::Result<(), validator::ValidationErrors>,
    result: &mut ValidationResult,
) {
    let Err(errors) = outcome else {
        return;
    };

    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    for (field, field_errors) in fields {
        for error in field_errors {
            let message = error
                .message
                .as_ref()
                .map_or_else(|| error.code.to_string(), ToString::to_string);
            result.errors.push(ValidationError {
                field: format!("{section}.{field}"),
                message,
            });
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("api-service"));
        assert!(is_valid_name("db-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Api")); // uppercase
        assert!(!is_valid_name("1-db")); // starts with number
        assert!(!is_valid_name("db_main")); // underscore
        assert!(!is_valid_name("db.main")); // separator of references
        assert!(!is_valid_name("db-")); // ends with hyphen
        assert!(!is_valid_name("db--main")); // consecutive hyphens
    }

    #[test]
    fn test_valid_stack() {
        let config = parse(
            r"
project:
  name: shop
network: {}
resources:
  - id: vpc
    type: network
  - id: database
    type: database
    placement: private_isolated
  - id: api
    type: container_service
    properties:
      db: { ref: database.endpoint }
    reachability:
      - target: database
        port: 5432
",
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_detects_duplicates_and_dangling_references() {
        let config = parse(
            r"
project:
  name: shop
resources:
  - id: api
    type: function
    properties:
      db: { ref: database.endpoint }
    depends_on: [queue]
  - id: api
    type: bucket
",
        );
        let result = ConfigValidator::new().collect(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"resources[0].properties.db"));
        assert!(fields.contains(&"resources[0].depends_on"));
        assert!(fields.contains(&"resources[1].id"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_detects_malformed_reference() {
        let config = parse(
            r"
project:
  name: shop
resources:
  - id: api
    type: function
    properties:
      db: { ref: database }
",
        );
        let result = ConfigValidator::new().collect(&config);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "resources[0].properties.db");
    }

    #[test]
    fn test_derive_constraints_reported() {
        let config = parse(
            r#"
project:
  name: shop
  account: "12"
network:
  zones: 9
orchestration:
  max_parallel: 0
"#,
        );
        let result = ConfigValidator::new().collect(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"project.account"));
        assert!(fields.contains(&"network.zones"));
        assert!(fields.contains(&"orchestration.max_parallel"));
    }

    #[test]
    fn test_egress_tier_needs_nat() {
        let config = parse(
            r"
project:
  name: shop
network:
  nat_gateways: 0
",
        );
        let result = ConfigValidator::new().collect(&config);
        assert!(result.errors.iter().any(|e| e.field == "network.nat_gateways"));
    }
}
