//! Configuration module
//!
//! Loads configuration from environment variables.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::outbox::TopicConfig;
use crate::processor::{BackoffConfig, ProcessorConfig};

/// Transaction isolation floor for append transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionIsolation {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl TransactionIsolation {
    pub fn as_sql(&self) -> &'static str {
        match self {
            TransactionIsolation::ReadCommitted => "READ COMMITTED",
            TransactionIsolation::RepeatableRead => "REPEATABLE READ",
            TransactionIsolation::Serializable => "SERIALIZABLE",
        }
    }
}

impl FromStr for TransactionIsolation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_committed" => Ok(TransactionIsolation::ReadCommitted),
            "repeatable_read" => Ok(TransactionIsolation::RepeatableRead),
            "serializable" => Ok(TransactionIsolation::Serializable),
            _ => Err(ConfigError::InvalidValue("TRANSACTION_ISOLATION")),
        }
    }
}

/// Read-replica routing for projections and processor fetches
#[derive(Debug, Clone, Default)]
pub struct ReadReplicaConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub pool_max: u32,
    pub pool_min: u32,
    pub user: Option<String>,
    pub pass: Option<String>,
}

/// One subsystem's processor scheduling plus leader retry cadence
#[derive(Debug, Clone)]
pub struct SubsystemConfig {
    pub processor: ProcessorConfig,
    pub leader_retry_interval: Duration,
}

impl Default for SubsystemConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            leader_retry_interval: Duration::from_secs(5),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Primary database connection URL
    pub database_url: String,

    /// Maximum database connections in the primary pool
    pub database_max_connections: u32,

    /// Write command audit rows alongside appended events
    pub persist_commands: bool,

    /// Streaming page size for projections
    pub fetch_size: i64,

    /// Isolation level for append transactions
    pub transaction_isolation: TransactionIsolation,

    /// Optional replica routing for reads
    pub read_replicas: ReadReplicaConfig,

    /// Command types whose duplicates surface as concurrency violations
    pub reject_on_duplicate: HashSet<String>,

    /// Outbox processor scheduling
    pub outbox: SubsystemConfig,

    /// View processor scheduling
    pub views: SubsystemConfig,

    /// Outbox topics: filter, publishers, per-publisher overrides
    pub topics: BTreeMap<String, TopicConfig>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = parse_env("DATABASE_MAX_CONNECTIONS", 10)?;
        let persist_commands = parse_env_bool("PERSIST_COMMANDS", false)?;
        let fetch_size = parse_env("FETCH_SIZE", 1000)?;

        let transaction_isolation = match env::var("TRANSACTION_ISOLATION") {
            Ok(value) => value.parse()?,
            Err(_) => TransactionIsolation::default(),
        };

        let read_replicas = ReadReplicaConfig {
            enabled: parse_env_bool("READ_REPLICAS_ENABLED", false)?,
            url: env::var("READ_REPLICAS_URL").ok(),
            pool_max: parse_env("READ_REPLICAS_POOL_MAX", 10)?,
            pool_min: parse_env("READ_REPLICAS_POOL_MIN", 0)?,
            user: env::var("READ_REPLICAS_POOL_USER").ok(),
            pass: env::var("READ_REPLICAS_POOL_PASS").ok(),
        };
        if read_replicas.enabled && read_replicas.url.is_none() {
            return Err(ConfigError::MissingEnv("READ_REPLICAS_URL"));
        }

        let reject_on_duplicate = env::var("REJECT_ON_DUPLICATE")
            .map(|raw| parse_command_type_list(&raw))
            .unwrap_or_default();

        let topics = match env::var("OUTBOX_TOPICS") {
            Ok(raw) => parse_topics(&raw)?,
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            database_url,
            database_max_connections,
            persist_commands,
            fetch_size,
            transaction_isolation,
            read_replicas,
            reject_on_duplicate,
            outbox: subsystem_from_env("OUTBOX")?,
            views: subsystem_from_env("VIEWS")?,
            topics,
        })
    }
}

fn subsystem_from_env(prefix: &str) -> Result<SubsystemConfig, ConfigError> {
    let polling_ms: u64 = parse_env_prefixed(prefix, "POLLING_INTERVAL_MS", 500)?;
    let backoff_max_seconds: u64 = parse_env_prefixed(prefix, "BACKOFF_MAX_SECONDS", 60)?;
    Ok(SubsystemConfig {
        processor: ProcessorConfig {
            polling_interval: Duration::from_millis(polling_ms),
            batch_size: parse_env_prefixed(prefix, "BATCH_SIZE", 100)?,
            enabled: parse_env_bool_prefixed(prefix, "ENABLED", true)?,
            max_errors: parse_env_prefixed(prefix, "MAX_ERRORS", 10)?,
            backoff: BackoffConfig {
                enabled: parse_env_bool_prefixed(prefix, "BACKOFF_ENABLED", true)?,
                threshold: parse_env_prefixed(prefix, "BACKOFF_THRESHOLD", 3)?,
                multiplier: parse_env_prefixed(prefix, "BACKOFF_MULTIPLIER", 2)?,
                max_interval: Duration::from_secs(backoff_max_seconds),
            },
        },
        leader_retry_interval: Duration::from_millis(parse_env_prefixed(
            prefix,
            "LEADER_RETRY_INTERVAL_MS",
            5000,
        )?),
    })
}

/// Parse the comma-separated reject-on-duplicate list
pub fn parse_command_type_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the `OUTBOX_TOPICS` JSON map
pub fn parse_topics(raw: &str) -> Result<BTreeMap<String, TopicConfig>, ConfigError> {
    serde_json::from_str(raw).map_err(|_| ConfigError::InvalidValue("OUTBOX_TOPICS"))
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

fn parse_env_prefixed<T>(prefix: &str, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match env::var(format!("{prefix}_{key}")) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidPrefixed(format!("{prefix}_{key}"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(value) => parse_bool(&value).ok_or(ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool_prefixed(prefix: &str, key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(format!("{prefix}_{key}")) {
        Ok(value) => {
            parse_bool(&value).ok_or_else(|| ConfigError::InvalidPrefixed(format!("{prefix}_{key}")))
        }
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidPrefixed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("sometimes"), None);
    }

    #[test]
    fn test_parse_command_type_list() {
        let set = parse_command_type_list("open_wallet, create_course,,open_wallet");
        assert_eq!(set.len(), 2);
        assert!(set.contains("open_wallet"));
        assert!(set.contains("create_course"));
        assert!(parse_command_type_list("").is_empty());
    }

    #[test]
    fn test_parse_topics_json() {
        let topics = parse_topics(
            r#"{
                "wallet-events": {
                    "required_tags": ["wallet_id"],
                    "publishers": ["kafka"]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics["wallet-events"].publishers, vec!["kafka"]);

        assert!(parse_topics("not json").is_err());
    }

    #[test]
    fn test_transaction_isolation_parse() {
        assert_eq!(
            "read_committed".parse::<TransactionIsolation>().unwrap(),
            TransactionIsolation::ReadCommitted
        );
        assert_eq!(
            "serializable".parse::<TransactionIsolation>().unwrap().as_sql(),
            "SERIALIZABLE"
        );
        assert!("snapshot".parse::<TransactionIsolation>().is_err());
    }
}
