mod consul;

use ::config::{Config, Environment};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub use consul::ConsulKv;

use crate::messaging::ReceiveRequest;

// ============================================================================
// Configuration - resolved once at startup
// ============================================================================
//
// Sources:
// 1. Consul KV, when CONSUL_ADDR is set (CONSUL_KEY_ROOT is then required)
// 2. Environment variables otherwise
//
// Tunables (batch size, timeouts, redelivery policy, ports) always come from
// the environment. The resulting `Settings` is immutable and handed to the
// constructors that need it.
//
// ============================================================================

pub const DEFAULT_REGION: &str = "us-east-1";

/// SQS limits for a single receive
const MAX_WAIT_TIME_SECS: u64 = 20;
const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

/// Printed when the configuration can't be resolved
pub const USAGE: &str = "
events_to_pgstore - events to Postgres store

Configuration comes from consul or from environment variables.
To read it from consul, set CONSUL_ADDR to the consul API endpoint and
CONSUL_KEY_ROOT to the root of the config key path. The keys awsRegion,
queueUrl, dbHost, dbPort, dbName, dbUser and dbPassword are read below it.

Otherwise these environment variables are required:

QUEUE_URL   - SQS queue to read from
DB_HOST     - database host
DB_PORT     - database port
DB_NAME     - database name
DB_USER     - database user name
DB_PASSWORD - database password
AWS_REGION  - AWS region to use (default us-east-1)

Optional: MAX_MESSAGES (1..=10), WAIT_TIME_SECS (0..=20),
VISIBILITY_TIMEOUT_SECS (0..=43200), REDELIVERY_POLICY (capped|retry-forever),
MAX_RECEIVES, METRICS_PORT, STORE_CONNECT_ATTEMPTS.

AWS credentials come from the default chain (e.g. AWS_ACCESS_KEY_ID and
AWS_SECRET_ACCESS_KEY when running outside AWS).
";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .missing.join(", "))]
    Incomplete { missing: Vec<&'static str> },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("CONSUL_KEY_ROOT must also be provided when CONSUL_ADDR is specified")]
    ConsulKeyRootMissing,

    #[error("failed to read key {key} from consul: {source}")]
    Consul {
        key: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read configuration: {0}")]
    Source(#[from] ::config::ConfigError),
}

// ============================================================================
// Resolved settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    pub queue: QueueSettings,
    pub database: DatabaseSettings,
    pub redelivery: RedeliveryMode,
    pub metrics_port: u16,
    /// Startup connectivity attempts before giving up on the store
    pub store_connect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub url: String,
    pub region: String,
    pub max_messages: i32,
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
}

impl QueueSettings {
    pub fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: self.max_messages,
            wait_time: self.wait_time,
            visibility_timeout: self.visibility_timeout,
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"*********")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryMode {
    /// Leave every failed message in the queue, forever
    RetryForever,
    /// Dead-letter undecodable messages once they were received `max_receives` times
    Capped { max_receives: u32 },
}

impl Settings {
    /// Resolve settings from the process environment (and Consul if configured)
    pub async fn load() -> Result<Self, ConfigError> {
        Self::load_from(None).await
    }

    /// Same as `load`, reading variables from `env` instead of the process environment
    pub async fn load_from(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut raw = RawSettings::from_environment(env)?;

        if !raw.consul_addr.is_empty() {
            if raw.consul_key_root.is_empty() {
                return Err(ConfigError::ConsulKeyRootMissing);
            }
            tracing::info!(consul_addr = %raw.consul_addr, "Reading configuration from consul");
            ConsulKv::new(&raw.consul_addr, &raw.consul_key_root)
                .apply(&mut raw)
                .await?;
        }

        raw.resolve()
    }

    /// Log the effective configuration, password masked
    pub fn log_summary(&self) {
        tracing::info!(
            queue_url = %self.queue.url,
            region = %self.queue.region,
            max_messages = self.queue.max_messages,
            wait_time_secs = self.queue.wait_time.as_secs(),
            visibility_timeout_secs = self.queue.visibility_timeout.as_secs(),
            db_host = %self.database.host,
            db_port = self.database.port,
            db_name = %self.database.name,
            db_user = %self.database.user,
            db_password = "*********",
            redelivery = ?self.redelivery,
            metrics_port = self.metrics_port,
            "Configuration"
        );
    }
}

// ============================================================================
// Raw settings - everything as read, before validation
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub(crate) struct RawSettings {
    #[serde(default)]
    pub queue_url: String,
    #[serde(default)]
    pub db_host: String,
    #[serde(default)]
    pub db_port: String,
    #[serde(default)]
    pub db_name: String,
    #[serde(default)]
    pub db_user: String,
    #[serde(default)]
    pub db_password: String,
    #[serde(default)]
    pub aws_region: String,

    #[serde(default)]
    pub consul_addr: String,
    #[serde(default)]
    pub consul_key_root: String,

    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_redelivery_policy")]
    pub redelivery_policy: String,
    #[serde(default = "default_max_receives")]
    pub max_receives: u32,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_store_connect_attempts")]
    pub store_connect_attempts: u32,
}

fn default_max_messages() -> i32 {
    1
}

fn default_wait_time_secs() -> u64 {
    5
}

fn default_visibility_timeout_secs() -> u64 {
    1
}

fn default_redelivery_policy() -> String {
    "capped".to_string()
}

fn default_max_receives() -> u32 {
    5
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_store_connect_attempts() -> u32 {
    3
}

impl RawSettings {
    fn from_environment(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Environment::default().source(env))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    fn resolve(self) -> Result<Settings, ConfigError> {
        let required = [
            ("QUEUE_URL", &self.queue_url),
            ("DB_HOST", &self.db_host),
            ("DB_PORT", &self.db_port),
            ("DB_NAME", &self.db_name),
            ("DB_USER", &self.db_user),
            ("DB_PASSWORD", &self.db_password),
        ];
        let missing: Vec<&'static str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Incomplete { missing });
        }

        let port = self
            .db_port
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidValue {
                key: "DB_PORT",
                value: self.db_port.clone(),
            })?;

        // SQS accepts 1..=10 messages per receive
        if !(1..=10).contains(&self.max_messages) {
            return Err(ConfigError::InvalidValue {
                key: "MAX_MESSAGES",
                value: self.max_messages.to_string(),
            });
        }

        if self.wait_time_secs > MAX_WAIT_TIME_SECS {
            return Err(ConfigError::InvalidValue {
                key: "WAIT_TIME_SECS",
                value: self.wait_time_secs.to_string(),
            });
        }

        if self.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS {
            return Err(ConfigError::InvalidValue {
                key: "VISIBILITY_TIMEOUT_SECS",
                value: self.visibility_timeout_secs.to_string(),
            });
        }

        let redelivery = match self.redelivery_policy.trim() {
            "retry-forever" => RedeliveryMode::RetryForever,
            "capped" if self.max_receives >= 1 => RedeliveryMode::Capped {
                max_receives: self.max_receives,
            },
            "capped" => {
                return Err(ConfigError::InvalidValue {
                    key: "MAX_RECEIVES",
                    value: self.max_receives.to_string(),
                })
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "REDELIVERY_POLICY",
                    value: other.to_string(),
                })
            }
        };

        let region = if self.aws_region.trim().is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            self.aws_region
        };

        Ok(Settings {
            queue: QueueSettings {
                url: self.queue_url,
                region,
                max_messages: self.max_messages,
                wait_time: Duration::from_secs(self.wait_time_secs),
                visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            },
            database: DatabaseSettings {
                host: self.db_host,
                port,
                name: self.db_name,
                user: self.db_user,
                password: self.db_password,
            },
            redelivery,
            metrics_port: self.metrics_port,
            store_connect_attempts: self.store_connect_attempts.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn complete_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("QUEUE_URL", "https://sqs.eu-west-1.amazonaws.com/123/events"),
            ("DB_HOST", "localhost"),
            ("DB_PORT", "5432"),
            ("DB_NAME", "events"),
            ("DB_USER", "ingest"),
            ("DB_PASSWORD", "s3cret"),
        ]
    }

    #[tokio::test]
    async fn test_load_from_environment_with_defaults() {
        let settings = Settings::load_from(env(&complete_env())).await.unwrap();

        assert_eq!(settings.queue.url, "https://sqs.eu-west-1.amazonaws.com/123/events");
        assert_eq!(settings.queue.region, DEFAULT_REGION);
        assert_eq!(settings.queue.receive_request(), ReceiveRequest::default());
        assert_eq!(settings.database.host, "localhost");
        assert_eq!(settings.database.port, 5432);
        assert_eq!(settings.database.password, "s3cret");
        assert_eq!(settings.redelivery, RedeliveryMode::Capped { max_receives: 5 });
        assert_eq!(settings.metrics_port, 9090);
        assert_eq!(settings.store_connect_attempts, 3);
    }

    #[tokio::test]
    async fn test_tunables_from_environment() {
        let mut vars = complete_env();
        vars.extend([
            ("AWS_REGION", "eu-west-1"),
            ("MAX_MESSAGES", "10"),
            ("WAIT_TIME_SECS", "20"),
            ("VISIBILITY_TIMEOUT_SECS", "30"),
            ("REDELIVERY_POLICY", "retry-forever"),
            ("METRICS_PORT", "9100"),
        ]);

        let settings = Settings::load_from(env(&vars)).await.unwrap();

        assert_eq!(settings.queue.region, "eu-west-1");
        assert_eq!(settings.queue.max_messages, 10);
        assert_eq!(settings.queue.wait_time, Duration::from_secs(20));
        assert_eq!(settings.queue.visibility_timeout, Duration::from_secs(30));
        assert_eq!(settings.redelivery, RedeliveryMode::RetryForever);
        assert_eq!(settings.metrics_port, 9100);
    }

    #[tokio::test]
    async fn test_incomplete_configuration_lists_missing_settings() {
        let vars: Vec<_> = complete_env()
            .into_iter()
            .filter(|(k, _)| *k != "DB_PASSWORD" && *k != "QUEUE_URL")
            .collect();

        let err = Settings::load_from(env(&vars)).await.unwrap_err();

        match err {
            ConfigError::Incomplete { missing } => {
                assert_eq!(missing, vec!["QUEUE_URL", "DB_PASSWORD"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_blank_values_count_as_missing() {
        let mut vars = complete_env();
        vars.retain(|(k, _)| *k != "DB_HOST");
        vars.push(("DB_HOST", "   "));

        let err = Settings::load_from(env(&vars)).await.unwrap_err();
        assert!(matches!(err, ConfigError::Incomplete { ref missing } if missing == &vec!["DB_HOST"]));
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let cases = [
            ("DB_PORT", "not-a-port", "DB_PORT"),
            ("MAX_MESSAGES", "11", "MAX_MESSAGES"),
            ("REDELIVERY_POLICY", "sometimes", "REDELIVERY_POLICY"),
            ("MAX_RECEIVES", "0", "MAX_RECEIVES"),
            ("WAIT_TIME_SECS", "21", "WAIT_TIME_SECS"),
            ("VISIBILITY_TIMEOUT_SECS", "43201", "VISIBILITY_TIMEOUT_SECS"),
        ];

        for (var, value, expected_key) in cases {
            let mut vars = complete_env();
            vars.retain(|(k, _)| *k != var);
            vars.push((var, value));

            let err = Settings::load_from(env(&vars)).await.unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { key, .. } if key == expected_key),
                "unexpected error for {var}={value}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_receive_limits_are_inclusive() {
        let mut vars = complete_env();
        vars.extend([("WAIT_TIME_SECS", "20"), ("VISIBILITY_TIMEOUT_SECS", "43200")]);

        let settings = Settings::load_from(env(&vars)).await.unwrap();
        assert_eq!(settings.queue.wait_time, Duration::from_secs(20));
        assert_eq!(settings.queue.visibility_timeout, Duration::from_secs(43_200));

        let mut vars = complete_env();
        vars.extend([("WAIT_TIME_SECS", "0"), ("VISIBILITY_TIMEOUT_SECS", "0")]);
        let settings = Settings::load_from(env(&vars)).await.unwrap();
        assert_eq!(settings.queue.wait_time, Duration::ZERO);
    }

    #[test]
    fn test_usage_lists_every_required_setting() {
        for name in [
            "QUEUE_URL",
            "DB_HOST",
            "DB_PORT",
            "DB_NAME",
            "DB_USER",
            "DB_PASSWORD",
            "AWS_REGION",
            "CONSUL_ADDR",
            "CONSUL_KEY_ROOT",
        ] {
            assert!(USAGE.contains(name), "usage does not mention {name}");
        }
    }

    #[tokio::test]
    async fn test_consul_requires_key_root() {
        let err = Settings::load_from(env(&[("CONSUL_ADDR", "127.0.0.1:8500")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConsulKeyRootMissing));
    }

    #[test]
    fn test_password_is_masked_in_debug_output() {
        let db = DatabaseSettings {
            host: "localhost".to_string(),
            port: 5432,
            name: "events".to_string(),
            user: "ingest".to_string(),
            password: "s3cret".to_string(),
        };

        let rendered = format!("{db:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("*********"));
    }
}
