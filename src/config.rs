//! Agent configuration
//!
//! Configuration is read from a TOML file once at startup and consumed by the
//! runtime as plain structured data. Credentials are never stored in the file;
//! the file names the environment variables that hold them.

use crate::protocol::validate_agent_name;
use crate::rules::{LookupEntry, RegexEntry, RuleRegistry, RulerConfig};
use crate::workflow::WorkflowTemplate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub bus: BusSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub api: ApiSection,
    /// Named rulers usable by triggers and factory tasks
    #[serde(default)]
    pub rulers: Vec<RulerConfig>,
    /// Regexes rules can name with `regex_id`
    #[serde(default)]
    pub regexes: Vec<RegexEntry>,
    /// Lookup tables rules can name with `lookup_id`
    #[serde(default)]
    pub lookups: Vec<LookupEntry>,
    /// Workflow templates registered at startup
    #[serde(default)]
    pub workflows: Vec<WorkflowTemplate>,
}

/// Agent section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Agent name (must match [a-zA-Z0-9._-]+), also the event `source`
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Which transport variant carries the bus
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Broker transport (MQTT v5)
    #[default]
    Mqtt,
    /// Group-chat style room transport
    Room,
}

/// Bus section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusSection {
    #[serde(default)]
    pub transport: TransportKind,
    /// Broker URL with protocol and port (mqtt:// or mqtts://)
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Prefix prepended to every broker topic
    #[serde(default)]
    pub topic_prefix: String,
    /// Room domain for the group-chat transport
    #[serde(default = "default_muc_domain")]
    pub muc_domain: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub persistence: PersistenceSection,
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_muc_domain() -> String {
    "mucs.localhost".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

/// Kind of durable store behind the bus persistence or the workflow history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Postgres,
}

/// Bus persistence section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceSection {
    /// Durable backend; in-memory buffering only when absent
    pub backend: Option<BackendKind>,
    /// Backend connection string
    pub host: Option<String>,
    /// Retention of durable events, in minutes
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    /// Maximum number of events kept in memory
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,
}

fn default_ttl() -> u64 {
    60
}

fn default_memory_size() -> usize {
    10_000
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            backend: None,
            host: None,
            ttl: default_ttl(),
            memory_size: default_memory_size(),
        }
    }
}

/// Workflow history section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistorySection {
    #[serde(default = "default_history_backend")]
    pub backend: BackendKind,
    pub host: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub tls: TlsSection,
}

fn default_history_backend() -> BackendKind {
    BackendKind::Memory
}

fn default_database() -> String {
    "workflow".to_string()
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            backend: default_history_backend(),
            host: None,
            database: default_database(),
            tls: TlsSection::default(),
        }
    }
}

/// TLS options for durable backends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TlsSection {
    /// Require an encrypted connection
    #[serde(default)]
    pub require: bool,
    /// Root certificate used to verify the server
    pub ca_file: Option<String>,
}

/// HTTP surface for the history query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    /// Listening port, 0 disables the server
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    5558
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid agent name: {0}")]
    InvalidAgentName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_name(&self.agent.name)
            .map_err(|e| ConfigError::InvalidAgentName(format!("'{}': {e}", self.agent.name)))?;

        let persistence = &self.bus.persistence;
        if persistence.memory_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "bus.persistence.memory_size must be greater than 0".to_string(),
            ));
        }
        if persistence.ttl == 0 {
            return Err(ConfigError::InvalidConfig(
                "bus.persistence.ttl must be greater than 0".to_string(),
            ));
        }
        if persistence.backend == Some(BackendKind::Postgres) && persistence.host.is_none() {
            return Err(ConfigError::InvalidConfig(
                "bus.persistence.host is required for the postgres backend".to_string(),
            ));
        }
        if self.history.backend == BackendKind::Postgres && self.history.host.is_none() {
            return Err(ConfigError::InvalidConfig(
                "history.host is required for the postgres backend".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for ruler in &self.rulers {
            if !names.insert(ruler.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate ruler name: {}",
                    ruler.name
                )));
            }
        }

        self.resolved_rulers(&self.rule_registry()?)?;

        for template in &self.workflows {
            for trigger in &template.triggers {
                if let Some(ruler) = &trigger.ruler {
                    if !names.contains(ruler.as_str()) {
                        return Err(ConfigError::InvalidConfig(format!(
                            "workflow '{}' trigger references unknown ruler '{ruler}'",
                            template.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Registry seeded with the configured regexes and lookups
    pub fn rule_registry(&self) -> Result<RuleRegistry, ConfigError> {
        RuleRegistry::from_entries(self.regexes.clone(), self.lookups.clone())
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    /// Named rulers with their registry references resolved
    pub fn resolved_rulers(
        &self,
        registry: &RuleRegistry,
    ) -> Result<std::collections::HashMap<String, RulerConfig>, ConfigError> {
        self.rulers
            .iter()
            .map(|ruler| {
                let resolved = registry.resolve_ruler(ruler).map_err(|e| {
                    ConfigError::InvalidConfig(format!("ruler '{}': {e}", ruler.name))
                })?;
                Ok((ruler.name.clone(), resolved))
            })
            .collect()
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get bus username from environment variable
    pub fn get_bus_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.bus.username_env.as_ref())
    }

    /// Get bus password from environment variable
    pub fn get_bus_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.bus.password_env.as_ref())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[agent]
name = "test-agent"

[bus]
transport = "room"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[agent]
name = "timon"
description = "Listens on its own topic"

[bus]
transport = "mqtt"
broker_url = "mqtts://broker.local:8883"
username_env = "BUS_USER"
password_env = "BUS_PASS"
topic_prefix = "savanna"

[bus.persistence]
backend = "postgres"
host = "postgres://localhost/bus"
ttl = 30
memory_size = 500

[history]
backend = "postgres"
host = "postgres://localhost"
database = "history"

[history.tls]
require = true
ca_file = "/etc/ssl/ca.pem"

[api]
port = 8080

[[rulers]]
name = "normalize"
rules = [
    { type = "lower", fieldname = "name" },
    { type = "set", fieldname = "seen", value = "yes" },
]

[[workflows]]
id = "greet"
title = "Greeting"
root = true
tasks = [
    { id = "normalize", type = "factory", config = { rulers = ["normalize"] } },
    { id = "wait", type = "sleep", config = { time = 1 } },
]
edges = [{ from = "normalize", to = "wait" }]
triggers = [{ topic = "timon", ruler = "normalize", require = ["name"] }]
"#;

        let config = AgentConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.agent.name, "timon");
        assert_eq!(config.bus.transport, TransportKind::Mqtt);
        assert_eq!(config.bus.persistence.backend, Some(BackendKind::Postgres));
        assert_eq!(config.bus.persistence.ttl, 30);
        assert_eq!(config.bus.persistence.memory_size, 500);
        assert_eq!(config.history.database, "history");
        assert!(config.history.tls.require);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.rulers.len(), 1);
        assert_eq!(config.rulers[0].rules.len(), 2);
        assert_eq!(config.workflows.len(), 1);
        assert_eq!(config.workflows[0].tasks.len(), 2);
        assert_eq!(config.workflows[0].triggers[0].topic, "timon");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = AgentConfig::from_toml("[agent]\nname = \"pumbaa\"\n[bus]\n").unwrap();
        assert_eq!(config.bus.transport, TransportKind::Mqtt);
        assert_eq!(config.bus.broker_url, "mqtt://localhost:1883");
        assert_eq!(config.bus.keep_alive_secs, 60);
        assert_eq!(config.bus.persistence.backend, None);
        assert_eq!(config.bus.persistence.ttl, 60);
        assert_eq!(config.bus.persistence.memory_size, 10_000);
        assert_eq!(config.history.backend, BackendKind::Memory);
        assert_eq!(config.api.port, 5558);
        assert!(config.workflows.is_empty());
    }

    #[test]
    fn test_invalid_agent_name() {
        let result = AgentConfig::from_toml("[agent]\nname = \"bad name\"\n[bus]\n");
        assert!(matches!(result, Err(ConfigError::InvalidAgentName(_))));
    }

    #[test]
    fn test_zero_memory_size_rejected() {
        let toml_content = r#"
[agent]
name = "a"
[bus.persistence]
memory_size = 0
"#;
        let result = AgentConfig::from_toml(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_postgres_requires_host() {
        let toml_content = r#"
[agent]
name = "a"
[bus]
[history]
backend = "postgres"
"#;
        let result = AgentConfig::from_toml(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("history.host")));
    }

    #[test]
    fn test_trigger_with_unknown_ruler_rejected() {
        let toml_content = r#"
[agent]
name = "a"
[bus]

[[workflows]]
id = "wf"
title = "wf"
tasks = [{ id = "s", type = "sleep" }]
triggers = [{ topic = "t", ruler = "missing" }]
"#;
        let result = AgentConfig::from_toml(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("missing")));
    }

    #[test]
    fn test_duplicate_ruler_rejected() {
        let toml_content = r#"
[agent]
name = "a"
[bus]
[[rulers]]
name = "r"
rules = []
[[rulers]]
name = "r"
rules = []
"#;
        assert!(AgentConfig::from_toml(toml_content).is_err());
    }

    #[test]
    fn test_registry_sections() {
        let toml_content = r#"
[agent]
name = "a"
[bus]

[[regexes]]
id = "ticket"
title = "Ticket number"
pattern = "T-(\\d+)"

[[lookups]]
id = "levels"
table = [{ value = "1", replace = "low" }, { value = "2", replace = "high" }]

[[rulers]]
name = "triage"
rules = [
    { type = "extract", fieldname = "ticket", regex_id = "ticket" },
    { type = "lookup", fieldname = "level", lookup_id = "levels" },
]
"#;
        let config = AgentConfig::from_toml(toml_content).unwrap();
        let registry = config.rule_registry().unwrap();
        assert_eq!(registry.regex("ticket").unwrap().pattern, "T-(\\d+)");
        let rulers = config.resolved_rulers(&registry).unwrap();
        assert_eq!(rulers["triage"].rules.len(), 2);

        let dangling = toml_content.replace("lookup_id = \"levels\"", "lookup_id = \"nope\"");
        assert!(matches!(
            AgentConfig::from_toml(&dangling),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("nope")
        ));
    }

    #[test]
    fn test_malformed_toml() {
        let result = AgentConfig::from_toml("[agent\nname=");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_env_credentials() {
        let mut config = AgentConfig::test_config();
        config.bus.username_env = Some("AGENTBUS_TEST_USER_UNSET_VAR".to_string());
        assert_eq!(config.get_bus_username(), None);
        assert_eq!(config.get_bus_password(), None);
    }
}
