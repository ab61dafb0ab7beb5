//! Configuration loading for meshsync-engine.
//!
//! Configuration is loaded from a TOML file (default: `meshsync.toml`).
//! Interval and backoff constants are tuning defaults, not correctness
//! requirements - only their monotonic/bounded shape matters.

use meshsync_core::BackoffPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::chunked::ChunkSettings;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the config file failed.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML did not parse.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value is unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration for the sync engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Candidate endpoint pool (relay/peer addresses to draw links from).
    pub endpoints: Vec<String>,

    /// Number of live links kept at a time (default: 5).
    #[serde(default = "default_active_links")]
    pub active_links: usize,

    /// Maximum fragments per logical message (default: 100, hard cap 256).
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,

    /// Retries for a fragment send blocked by backpressure (default: 10).
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,

    /// Delay between backpressure retries in milliseconds (default: 50).
    #[serde(default = "default_send_retry_delay_ms")]
    pub send_retry_delay_ms: u64,

    /// Idle timeout for incomplete inbound messages in milliseconds
    /// (default: 30000). Partials older than this are discarded.
    #[serde(default = "default_reassembly_idle_timeout_ms")]
    pub reassembly_idle_timeout_ms: u64,

    /// First reconnect delay in milliseconds (default: 2000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds (default: 30000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Maximum reconnect jitter in milliseconds (default: 5000).
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,

    /// Presence re-announcement period in milliseconds (default: 30000).
    /// Cheap and frequent.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Proactive link re-establishment period in milliseconds
    /// (default: 3600000 = 1 hour). Disruptive and rare.
    #[serde(default = "default_recycle_interval_ms")]
    pub recycle_interval_ms: u64,

    /// Consecutive connect failures before an endpoint is swapped for
    /// another pool candidate (default: 5).
    #[serde(default = "default_endpoint_failure_threshold")]
    pub endpoint_failure_threshold: u32,
}

impl EngineConfig {
    /// Build a config for the given endpoint pool with all defaults.
    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            active_links: default_active_links(),
            max_fragments: default_max_fragments(),
            send_retries: default_send_retries(),
            send_retry_delay_ms: default_send_retry_delay_ms(),
            reassembly_idle_timeout_ms: default_reassembly_idle_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            recycle_interval_ms: default_recycle_interval_ms(),
            endpoint_failure_threshold: default_endpoint_failure_threshold(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field values for usability.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Invalid("endpoint pool is empty".into()));
        }
        if self.active_links == 0 {
            return Err(ConfigError::Invalid("active_links must be > 0".into()));
        }
        if self.max_fragments == 0 || self.max_fragments > 256 {
            return Err(ConfigError::Invalid(
                "max_fragments must be in 1..=256".into(),
            ));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff_cap_ms must be >= backoff_base_ms".into(),
            ));
        }
        if self.refresh_interval_ms == 0 || self.recycle_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "refresh and recycle intervals must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// The reconnect backoff policy described by this config.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            jitter: Duration::from_millis(self.backoff_jitter_ms),
        }
    }

    /// The chunked-send tuning described by this config.
    pub fn chunk_settings(&self) -> ChunkSettings {
        ChunkSettings {
            max_fragments: self.max_fragments,
            send_retries: self.send_retries,
            send_retry_delay: Duration::from_millis(self.send_retry_delay_ms),
        }
    }

    /// Presence refresh period.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Link recycle period.
    pub fn recycle_interval(&self) -> Duration {
        Duration::from_millis(self.recycle_interval_ms)
    }
}

// Default value functions
fn default_active_links() -> usize {
    5
}

fn default_max_fragments() -> usize {
    100
}

fn default_send_retries() -> u32 {
    10
}

fn default_send_retry_delay_ms() -> u64 {
    50
}

fn default_reassembly_idle_timeout_ms() -> u64 {
    30_000
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    5_000
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

fn default_recycle_interval_ms() -> u64 {
    3_600_000
}

fn default_endpoint_failure_threshold() -> u32 {
    5
}
