//! Configuration types for the message management core.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{BrokerKind, RegisterConnectionRequest};
use crate::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DRAIN_BATCH_SIZE,
    DEFAULT_RECEIPT_TIMEOUT_SECS,
};

/// What to do when several drained messages carry the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Treat the first occurrence as the target and keep the rest
    #[default]
    FirstMatch,
    /// Treat every occurrence as a target
    AllMatches,
    /// Restore everything and fail with `AmbiguousId`
    Abort,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first" | "first_match" => Ok(DuplicatePolicy::FirstMatch),
            "all" | "all_matches" => Ok(DuplicatePolicy::AllMatches),
            "abort" => Ok(DuplicatePolicy::Abort),
            other => Err(format!("unknown duplicate id policy '{other}'")),
        }
    }
}

/// Settings for the mutation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum messages pulled by one drain call
    pub drain_batch_size: usize,

    /// Keep-republishes in flight at once
    pub publish_concurrency: usize,

    /// Extra attempts after an ambiguous publish
    pub receipt_retries: u32,

    /// Base delay between receipt retries in milliseconds
    pub receipt_retry_base_ms: u64,

    /// Tie-break for duplicate ids
    pub duplicate_policy: DuplicatePolicy,

    /// Safety cap on drain iterations during a purge
    pub purge_max_iterations: usize,

    /// Largest body accepted by import
    pub max_message_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
            publish_concurrency: 32,
            receipt_retries: 2,
            receipt_retry_base_ms: 200,
            duplicate_policy: DuplicatePolicy::FirstMatch,
            purge_max_iterations: 10_000,
            max_message_bytes: 128 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            drain_batch_size: env_parse("DRAIN_BATCH_SIZE")
                .unwrap_or(defaults.drain_batch_size)
                .clamp(1, DEFAULT_DRAIN_BATCH_SIZE),
            publish_concurrency: env_parse("PUBLISH_CONCURRENCY")
                .unwrap_or(defaults.publish_concurrency)
                .max(1),
            receipt_retries: env_parse("RECEIPT_RETRIES").unwrap_or(defaults.receipt_retries),
            receipt_retry_base_ms: env_parse("RECEIPT_RETRY_BASE_MS")
                .unwrap_or(defaults.receipt_retry_base_ms),
            duplicate_policy: env_parse("DUPLICATE_ID_POLICY").unwrap_or(defaults.duplicate_policy),
            purge_max_iterations: env_parse("PURGE_MAX_ITERATIONS")
                .unwrap_or(defaults.purge_max_iterations),
            max_message_bytes: env_parse("MAX_MESSAGE_BYTES").unwrap_or(defaults.max_message_bytes),
        }
    }

    /// Set the drain batch size.
    pub fn with_drain_batch_size(mut self, size: usize) -> Self {
        self.drain_batch_size = size.max(1);
        self
    }

    /// Set the duplicate id policy.
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Disable receipt retry delays.
    pub fn without_delays(mut self) -> Self {
        self.receipt_retry_base_ms = 0;
        self
    }
}

/// Settings for the bulk operation coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Maximum ids per chunk
    pub chunk_size: usize,

    /// Extra attempts per failed chunk
    pub max_retries: u32,

    /// Base backoff in milliseconds, doubled per attempt
    pub retry_base_delay_ms: u64,

    /// Pause after each successful chunk in milliseconds
    pub chunk_pause_ms: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 2,
            retry_base_delay_ms: 500,
            chunk_pause_ms: 100,
        }
    }
}

impl BulkConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: env_parse("BULK_CHUNK_SIZE")
                .unwrap_or(defaults.chunk_size)
                .clamp(1, DEFAULT_CHUNK_SIZE),
            max_retries: env_parse("BULK_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_base_delay_ms: env_parse("BULK_RETRY_BASE_MS")
                .unwrap_or(defaults.retry_base_delay_ms),
            chunk_pause_ms: env_parse("BULK_CHUNK_PAUSE_MS").unwrap_or(defaults.chunk_pause_ms),
        }
    }

    /// Disable backoff and inter-chunk pauses.
    pub fn without_delays(mut self) -> Self {
        self.retry_base_delay_ms = 0;
        self.chunk_pause_ms = 0;
        self
    }
}

/// Configuration shared by the registry and the message manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub engine: EngineConfig,
    pub bulk: BulkConfig,
    pub connect_timeout_secs: u64,
    pub receipt_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            bulk: BulkConfig::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            receipt_timeout_secs: DEFAULT_RECEIPT_TIMEOUT_SECS,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            engine: EngineConfig::from_env(),
            bulk: BulkConfig::from_env(),
            connect_timeout_secs: env_parse("CONNECT_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            receipt_timeout_secs: env_parse("RECEIPT_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_RECEIPT_TIMEOUT_SECS),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

/// Service-level configuration for the HTTP binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub manager: ManagerConfig,
    /// Connection registered at start-up, if configured
    pub bootstrap_connection: Option<RegisterConnectionRequest>,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let bootstrap_connection = std::env::var("BROKER_ENDPOINT").ok().map(|endpoint| {
            RegisterConnectionRequest {
                name: std::env::var("BROKER_NAME").unwrap_or_else(|_| "default".to_string()),
                broker_kind: env_parse("BROKER_KIND").unwrap_or(BrokerKind::RabbitMq),
                endpoint,
            }
        });

        Self {
            port: env_parse("PORT").unwrap_or(3020),
            manager: ManagerConfig::from_env(),
            bootstrap_connection,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
