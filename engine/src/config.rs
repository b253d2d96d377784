// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub directory: DirectoryConfig,
    pub nats: NatsConfig,
    pub dispatch: DispatchConfig,
    pub templates: TemplatesConfig,
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

/// Where recipients come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub source: DirectorySource,
    #[serde(default)]
    pub run_migrations: bool,
    #[serde(default = "default_migrations_path")]
    pub migrations_path: String,
    /// JSON array of recipients loaded into the in-memory directory
    #[serde(default)]
    pub recipients_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectorySource {
    Postgres,
    Memory,
}

fn default_migrations_path() -> String {
    "migrations".to_string()
}

/// NATS JetStream settings for the fire queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    pub stream_name: String,
    /// Subject prefix; events are published on `<prefix>.<notification>`
    pub subject_prefix: String,
    pub consumer_name: String,
    /// Must exceed the longest delay notifications are scheduled with
    pub max_age_seconds: u64,
    /// -1 disables the limit; not-yet-due redeliveries count as deliveries
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
    /// Upper bound on how long a not-yet-due event is held back per redelivery
    #[serde(default = "default_max_hold_seconds")]
    pub max_hold_seconds: u64,
    /// Redelivery delay after a retryable fire failure
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

fn default_max_deliver() -> i64 {
    -1
}

fn default_max_hold_seconds() -> u64 {
    3600
}

fn default_retry_delay_seconds() -> u64 {
    30
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "NOTIFICATIONS".to_string(),
            subject_prefix: "notifications".to_string(),
            consumer_name: "notification-workers".to_string(),
            max_age_seconds: 30 * 86400,
            max_deliver: default_max_deliver(),
            max_hold_seconds: default_max_hold_seconds(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

/// Fan-out and routing of fire operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent (recipient, backend) deliveries per fire; 1 is sequential
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
    /// Send immediate notifications through the queue instead of firing inline
    #[serde(default)]
    pub route_immediate_through_queue: bool,
}

fn default_max_concurrent_deliveries() -> usize {
    16
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            route_immediate_through_queue: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesConfig {
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub definitions_path: String,
}

/// One delivery adapter, registered under `name`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_backend_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_backend_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Log,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.directory.source == DirectorySource::Postgres {
            if self.database.url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.database.max_connections == 0 {
                return Err("Database max_connections must be greater than 0".to_string());
            }
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.stream_name.is_empty() {
            return Err("NATS stream_name cannot be empty".to_string());
        }
        if self.nats.subject_prefix.is_empty() {
            return Err("NATS subject_prefix cannot be empty".to_string());
        }

        if self.dispatch.max_concurrent_deliveries == 0 {
            return Err("Dispatch max_concurrent_deliveries must be greater than 0".to_string());
        }

        if self.notifications.definitions_path.is_empty() {
            return Err("Notification definitions_path cannot be empty".to_string());
        }

        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err("Backend name cannot be empty".to_string());
            }
            if backend.kind == BackendKind::Webhook && backend.url.is_none() {
                return Err(format!("Webhook backend '{}' requires a url", backend.name));
            }
        }

        let mut names: Vec<&str> = self.backends.iter().map(|b| b.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err("Backend names must be unique".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/notifications".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            directory: DirectoryConfig {
                source: DirectorySource::Postgres,
                run_migrations: false,
                migrations_path: default_migrations_path(),
                recipients_path: None,
            },
            nats: NatsConfig::default(),
            dispatch: DispatchConfig::default(),
            templates: TemplatesConfig {
                dir: "templates".to_string(),
            },
            notifications: NotificationsConfig {
                definitions_path: "config/notifications.toml".to_string(),
            },
            backends: vec![BackendConfig {
                name: "log".to_string(),
                kind: BackendKind::Log,
                url: None,
                timeout_seconds: default_backend_timeout_seconds(),
                bearer_token: None,
            }],
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());

        settings.directory.source = DirectorySource::Memory;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_zero_concurrency() {
        let mut settings = Settings::default();
        settings.dispatch.max_concurrent_deliveries = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_webhook_without_url() {
        let mut settings = Settings::default();
        settings.backends.push(BackendConfig {
            name: "hooks".to_string(),
            kind: BackendKind::Webhook,
            url: None,
            timeout_seconds: 5,
            bearer_token: None,
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_duplicate_backend_names() {
        let mut settings = Settings::default();
        let duplicate = settings.backends[0].clone();
        settings.backends.push(duplicate);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[database]
url = "postgresql://localhost/notifications"
max_connections = 5
min_connections = 1
connect_timeout_seconds = 10

[directory]
source = "memory"

[nats]
url = "nats://localhost:4222"
stream_name = "NOTIFICATIONS"
subject_prefix = "notifications"
consumer_name = "workers"
max_age_seconds = 86400

[dispatch]
max_concurrent_deliveries = 4

[templates]
dir = "templates"

[notifications]
definitions_path = "config/notifications.toml"

[[backends]]
name = "email"
kind = "webhook"
url = "http://localhost:8025/send"

[observability]
log_level = "debug"
metrics_port = 9100
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.directory.source, DirectorySource::Memory);
        assert_eq!(settings.dispatch.max_concurrent_deliveries, 4);
        assert!(!settings.dispatch.route_immediate_through_queue);
        assert_eq!(settings.nats.max_deliver, -1);
        assert_eq!(settings.backends[0].timeout_seconds, 10);
        assert!(settings.validate().is_ok());
    }
}
