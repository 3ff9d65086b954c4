//! Configuration parser for loading stack documents.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StackError};
use std::path::Path;
use tracing::{debug, info};

use super::spec::StackConfig;

/// Environment variable holding the HTTP provider endpoint.
pub const PROVIDER_URL_VAR: &str = "STACKWRIGHT_PROVIDER_URL";

/// Environment variable holding the HTTP provider bearer token.
pub const PROVIDER_TOKEN_VAR: &str = "STACKWRIGHT_PROVIDER_TOKEN";

/// Configuration parser for loading stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(StackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML configuration");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `STACKWRIGHT_<SECTION>_<KEY>` (e.g., `STACKWRIGHT_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies overrides from `lookup` to the configuration.
    pub fn apply_env_overrides(config: &mut StackConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("STACKWRIGHT_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(env) = lookup("STACKWRIGHT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Some(region) = lookup("STACKWRIGHT_REGION") {
            debug!("Overriding project.region from environment");
            config.project.region = region;
        }

        if let Some(account) = lookup("STACKWRIGHT_ACCOUNT") {
            debug!("Overriding project.account from environment");
            config.project.account = Some(account);
        }

        if let Some(bucket) = lookup("STACKWRIGHT_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("STACKWRIGHT_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the HTTP provider endpoint from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn get_provider_url() -> Result<String> {
        std::env::var(PROVIDER_URL_VAR).map_err(|_| {
            StackError::Config(ConfigError::MissingEnvVar {
                name: String::from(PROVIDER_URL_VAR),
            })
        })
    }

    /// Gets the HTTP provider token from the environment (optional).
    #[must_use]
    pub fn get_provider_token() -> Option<String> {
        std::env::var(PROVIDER_TOKEN_VAR).ok()
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stackwright.yaml",
    "stackwright.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceType, Value};
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
state:
  backend: local
resources: []
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: shop
  environment: prod
  region: eu-west-1
  account: "123456789012"

state:
  backend: s3
  bucket: shop-state
  prefix: shop/prod

network:
  cidr: 10.0.0.0/16
  zones: 2

resources:
  - id: vpc
    type: network
  - id: db-credentials
    type: secret
    properties:
      username: app
  - id: database
    type: database
    placement: private_isolated
    properties:
      engine: aurora-postgresql
      port: 5432
      credentials: { ref: db-credentials.arn }
    depends_on: [vpc]
  - id: api
    type: container_service
    placement: private_with_egress
    properties:
      container_port: 4000
      env:
        DB_HOST: { ref: database.endpoint }
    reachability:
      - target: database
        port: 5432

outputs:
  api_url: { join: ["https://", { ref: api.dns_name }] }
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.account.as_deref(), Some("123456789012"));
        assert_eq!(config.resources.len(), 4);
        assert_eq!(config.resources[2].resource_type, ResourceType::Database);
        assert_eq!(
            config.resources[2].properties["credentials"],
            Value::reference("db-credentials", "arn")
        );
        assert!(config.outputs.contains_key("api_url"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = ConfigParser::new().parse_yaml("project: [", None);
        assert!(matches!(
            result,
            Err(StackError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml("project:\n  name: shop\n", None)
            .unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("STACKWRIGHT_ENVIRONMENT", "staging"),
            ("STACKWRIGHT_REGION", "eu-central-1"),
            ("STACKWRIGHT_STATE_BUCKET", "state-bucket"),
        ]);

        ConfigParser::apply_env_overrides(&mut config, |name| {
            env.get(name).map(|v| (*v).to_string())
        });

        assert_eq!(config.project.name, "shop");
        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.project.region, "eu-central-1");
        assert_eq!(config.state.bucket.as_deref(), Some("state-bucket"));
    }

    #[test]
    fn test_find_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stackwright.yaml"), "project:\n  name: x\n").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("stackwright.yaml"));
    }

    #[test]
    fn test_init_template_is_valid() {
        let parser = ConfigParser::new();
        let config = parser
            .parse_yaml(include_str!("../../templates/stackwright.yaml"), None)
            .unwrap();
        assert_eq!(config.qualified_name(), "shop-dev");
        assert_eq!(config.resources.len(), 6);
        assert!(crate::config::ConfigValidator::new().validate(&config).is_ok());
        assert!(crate::planner::DependencyGraph::build(&config.resources).is_ok());
    }
}
