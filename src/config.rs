use crate::config_validator::ConfigValidator;
use crate::error::{QuotaError, QuotaResult};
use envconfig::Envconfig;
use std::collections::HashMap;
use std::time::Duration;

/// Process settings, read from the environment.
#[derive(Debug, Envconfig, Clone, PartialEq, Eq)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDRESS", default = "127.0.0.1:3000")]
    pub bind_address: String,

    /// Redis connection URL; empty selects the in-memory store
    #[envconfig(from = "REDIS_URL", default = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Attempts per take before giving up
    #[envconfig(from = "CONNECTION_RETRIES", default = "3")]
    pub connection_retries: usize,

    /// Base delay between attempts, in milliseconds
    #[envconfig(from = "RETRY_BACKOFF_MS", default = "50")]
    pub retry_backoff_ms: u64,

    /// Configuration history directory; empty keeps it in memory only
    #[envconfig(from = "CONFIG_DIR", default = "")]
    pub config_dir: String,

    /// Seconds between sweeps of idle dynamic buckets; 0 disables them
    #[envconfig(from = "DYNAMIC_REAP_INTERVAL_SECS", default = "60")]
    pub dynamic_reap_interval_secs: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables. Not validated, so
    /// command line overrides can still be applied.
    pub fn from_env() -> QuotaResult<Self> {
        Config::init_from_env().map_err(|e| QuotaError::Validation(e.to_string()))
    }

    pub fn from_map(vars: &HashMap<String, String>) -> QuotaResult<Self> {
        Config::init_from_hashmap(vars).map_err(|e| QuotaError::Validation(e.to_string()))
    }

    pub fn validate(&self) -> QuotaResult<()> {
        ConfigValidator::validate_settings(&self.bind_address, &self.redis_url, self.connection_retries)
    }

    pub fn dynamic_reap_interval(&self) -> Duration {
        Duration::from_secs(self.dynamic_reap_interval_secs)
    }
}
