//! Consumer configuration
//!
//! Loaded from a TOML file. `${VAR}` placeholders anywhere in the file are
//! replaced with the value of the environment variable before parsing, so
//! credentials never have to be written to disk.

use crate::consumer::{AtMaxPolicy, ConsumerSettings, ReconnectConfig};
use crate::scanner::HttpHeadersScannerConfig;
use crate::transport::amqp::{select_auth_mechanism, ConnectionOptions, Protocol};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Locations tried, in order, when no `--config` is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["consumer.toml", "config/consumer.toml"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    /// Name reported to the broker and used as consumer tag prefix
    #[serde(default = "default_app_name")]
    pub app_name: String,
    pub broker: BrokerSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub scanner: ScannerSection,
    #[serde(default)]
    pub health: HealthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Defaults to 5672 for amqp and 5671 for amqps
    pub port: Option<u16>,
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_auth_mechanisms")]
    pub auth_mechanisms: Vec<String>,
    /// Request queue
    pub queue: String,
    pub result_queue: String,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default)]
    pub discard_malformed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub at_max: AtMaxPolicy,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            at_max: AtMaxPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScannerSection {
    #[serde(default = "default_scan_timeout_secs")]
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_scan_timeout_secs(),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

fn default_app_name() -> String {
    "analysis-consumer".to_string()
}

fn default_protocol() -> Protocol {
    Protocol::Amqp
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_heartbeat_secs() -> u16 {
    30
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_auth_mechanisms() -> Vec<String> {
    vec!["PLAIN".to_string(), "AMQPLAIN".to_string(), "EXTERNAL".to_string()]
}

fn default_prefetch() -> u16 {
    4
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    1_800_000 // 30 minutes
}

fn default_scan_timeout_secs() -> u64 {
    10
}

fn default_health_port() -> u16 {
    8080
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("No configuration file found, tried: {0}")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is a valid regex")
    })
}

/// Replace every `${VAR}` with the variable's value; an unset variable is an error
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    substitute_with(content, |name| std::env::var(name).ok())
}

fn substitute_with<F>(content: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = None;
    let replaced = placeholder().replace_all(content, |caps: &Captures| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });

    match missing {
        Some(name) => Err(ConfigError::EnvVarNotFound(name)),
        None => Ok(replaced.into_owned()),
    }
}

/// The explicit path if given, otherwise the first default path that exists
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
}

impl ConsumerConfig {
    /// Load, substitute environment variables, parse and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let config: ConsumerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.hostname.trim().is_empty() {
            return Err(invalid("broker.hostname must not be empty"));
        }
        if broker.queue.trim().is_empty() || broker.result_queue.trim().is_empty() {
            return Err(invalid("broker.queue and broker.result_queue must not be empty"));
        }
        if broker.queue == broker.result_queue {
            return Err(invalid(format!(
                "broker.queue and broker.result_queue must differ, both are '{}'",
                broker.queue
            )));
        }
        if broker.prefetch == 0 {
            return Err(invalid("broker.prefetch must be greater than 0"));
        }
        select_auth_mechanism(&broker.auth_mechanisms)
            .map_err(|e| invalid(format!("broker.auth_mechanisms: {e}")))?;

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 {
            return Err(invalid("reconnect.initial_delay_ms must be greater than 0"));
        }
        if reconnect.initial_delay_ms > reconnect.max_delay_ms {
            return Err(invalid(format!(
                "reconnect.initial_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                reconnect.initial_delay_ms, reconnect.max_delay_ms
            )));
        }

        if self.scanner.timeout_secs == 0 {
            return Err(invalid("scanner.timeout_secs must be greater than 0"));
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let broker = &self.broker;
        ConnectionOptions {
            protocol: broker.protocol,
            hostname: broker.hostname.clone(),
            port: broker.port.unwrap_or_else(|| broker.protocol.default_port()),
            username: broker.username.clone(),
            password: broker.password.clone(),
            vhost: broker.vhost.clone(),
            heartbeat_secs: broker.heartbeat_secs,
            connection_timeout_ms: broker.connection_timeout_ms,
            auth_mechanisms: broker.auth_mechanisms.clone(),
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            connection: self.connection_options(),
            queue: self.broker.queue.clone(),
            result_queue: self.broker.result_queue.clone(),
            prefetch: self.broker.prefetch,
            discard_malformed: self.broker.discard_malformed,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                at_max: self.reconnect.at_max,
            },
            consumer_tag_prefix: self.app_name.clone(),
        }
    }

    pub fn scanner_config(&self) -> HttpHeadersScannerConfig {
        let mut config = HttpHeadersScannerConfig {
            timeout: Duration::from_secs(self.scanner.timeout_secs),
            ..Default::default()
        };
        if let Some(user_agent) = &self.scanner.user_agent {
            config.user_agent = user_agent.clone();
        }
        config
    }

    /// Copy with the broker password masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.broker.password = "***".to_string();
        copy
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
app_name = "test-consumer"

[broker]
hostname = "localhost"
queue = "requests"
result_queue = "results"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_minimal_config_defaults() {
        let config = ConsumerConfig::test_config();
        assert!(config.validate().is_ok());

        assert_eq!(config.broker.prefetch, 4);
        assert!(!config.broker.discard_malformed);
        assert_eq!(config.reconnect.initial_delay_ms, 1_000);
        assert_eq!(config.reconnect.max_delay_ms, 1_800_000);
        assert_eq!(config.reconnect.at_max, AtMaxPolicy::Reset);
        assert!(!config.health.enabled);

        let options = config.connection_options();
        assert_eq!(options.port, 5672);
        assert_eq!(options.vhost, "/");
        assert_eq!(options.username, "guest");
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
app_name = "headers-consumer"

[broker]
protocol = "amqps"
hostname = "rabbit.internal"
username = "scanner"
password = "s3cret"
vhost = "scans"
heartbeat_secs = 10
connection_timeout_ms = 2500
auth_mechanisms = ["EXTERNAL", "PLAIN"]
queue = "requests"
result_queue = "results"
prefetch = 8
discard_malformed = true

[reconnect]
initial_delay_ms = 500
max_delay_ms = 60000
at_max = "plateau"

[scanner]
timeout_secs = 3
user_agent = "header-scan/1.0"

[health]
enabled = true
port = 9090
"#;
        let config = ConsumerConfig::from_toml_str(toml_content).unwrap();

        let settings = config.consumer_settings();
        assert_eq!(settings.connection.port, 5671);
        assert_eq!(settings.connection.protocol, Protocol::Amqps);
        assert_eq!(settings.prefetch, 8);
        assert!(settings.discard_malformed);
        assert_eq!(settings.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(settings.reconnect.at_max, AtMaxPolicy::Plateau);
        assert_eq!(settings.consumer_tag_prefix, "headers-consumer");

        let scanner = config.scanner_config();
        assert_eq!(scanner.timeout, Duration::from_secs(3));
        assert_eq!(scanner.user_agent, "header-scan/1.0");
        assert_eq!(config.health.port, 9090);
    }

    #[test]
    fn test_placeholder_substitution() {
        let vars: HashMap<&str, &str> = [("RABBIT_USER", "scanner"), ("RABBIT_PASS", "pw")].into();
        let content = "username = \"${RABBIT_USER}\"\npassword = \"${RABBIT_PASS}\"";

        let replaced = substitute_with(content, |name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(replaced, "username = \"scanner\"\npassword = \"pw\"");
    }

    #[test]
    fn test_missing_placeholder_variable() {
        let result = substitute_with("password = \"${NOT_SET_ANYWHERE}\"", |_| None);
        assert!(
            matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "NOT_SET_ANYWHERE")
        );
    }

    #[test]
    fn test_text_without_placeholders_untouched() {
        let content = "queue = \"requests\" # costs $5";
        assert_eq!(substitute_with(content, |_| None).unwrap(), content);
    }

    #[test]
    fn test_validation_failures() {
        let cases: Vec<(&str, Box<dyn Fn(&mut ConsumerConfig)>)> = vec![
            ("empty queue", Box::new(|c: &mut ConsumerConfig| c.broker.queue = String::new())),
            ("same queues", Box::new(|c: &mut ConsumerConfig| c.broker.result_queue = c.broker.queue.clone())),
            ("zero prefetch", Box::new(|c: &mut ConsumerConfig| c.broker.prefetch = 0)),
            ("zero initial delay", Box::new(|c: &mut ConsumerConfig| c.reconnect.initial_delay_ms = 0)),
            ("initial above max", Box::new(|c: &mut ConsumerConfig| c.reconnect.initial_delay_ms = c.reconnect.max_delay_ms + 1)),
            ("unknown auth", Box::new(|c: &mut ConsumerConfig| c.broker.auth_mechanisms = vec!["GSSAPI".to_string()])),
            ("empty hostname", Box::new(|c: &mut ConsumerConfig| c.broker.hostname = " ".to_string())),
        ];

        for (name, mutate) in cases {
            let mut config = ConsumerConfig::test_config();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidConfig(_))),
                "{name} should fail validation"
            );
        }
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let toml_content = r#"
[broker]
protocol = "mqtt"
queue = "requests"
result_queue = "results"
"#;
        assert!(matches!(
            ConsumerConfig::from_toml_str(toml_content),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_missing_queue_rejected() {
        let toml_content = "[broker]\nresult_queue = \"results\"\n";
        assert!(matches!(
            ConsumerConfig::from_toml_str(toml_content),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_redacted_hides_password() {
        let mut config = ConsumerConfig::test_config();
        config.broker.password = "hunter2".to_string();

        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("hunter2"));
        assert_eq!(config.broker.password, "hunter2");
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = Path::new("/etc/consumer/custom.toml");
        assert_eq!(resolve_config_path(Some(path)).unwrap(), path);
    }
}
