//! Config - TOML から読み込む設定
//!
//! ```toml
//! namespace = "skein"
//! result_poll_interval_ms = 50
//!
//! [worker]
//! poll_interval_ms = 100
//! error_backoff_ms = 1000
//! max_error_backoff_ms = 30000
//! lock_ttl_secs = 300
//!
//! [default_task]
//! timeout = 30.0
//! max_retries = 2
//! ```
//!
//! 全フィールドに既定値があり、空ファイルも有効です。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::TaskConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Worker loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep after finding the local queue empty.
    pub poll_interval_ms: u64,

    /// Sleep after the first infrastructure error; doubles on each
    /// consecutive one up to `max_error_backoff_ms`.
    pub error_backoff_ms: u64,
    pub max_error_backoff_ms: u64,

    /// How long a distributed worker blocks on the shared queue per pop.
    pub dequeue_timeout_ms: u64,

    pub lock_ttl_secs: u64,
    pub result_ttl_secs: u64,

    /// Max blocking handlers running at once.
    pub blocking_pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            error_backoff_ms: 1_000,
            max_error_backoff_ms: 30_000,
            dequeue_timeout_ms: 1_000,
            lock_ttl_secs: 300,
            result_ttl_secs: 3_600,
            blocking_pool_size: 8,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn max_error_backoff(&self) -> Duration {
        Duration::from_millis(self.max_error_backoff_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Prefix of every shared-store key.
    pub namespace: String,

    /// Polling step of `get_task_result` / `wait_for_workflow`.
    pub result_poll_interval_ms: u64,

    pub worker: WorkerConfig,

    /// Policy used by `TaskRequest::new` when the caller does not set one.
    pub default_task: TaskConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            namespace: "skein".to_string(),
            result_poll_interval_ms: 50,
            worker: WorkerConfig::default(),
            default_task: TaskConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }
        if self.result_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "result_poll_interval_ms must be positive".into(),
            ));
        }
        if self.worker.blocking_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "worker.blocking_pool_size must be positive".into(),
            ));
        }
        if self.worker.lock_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.lock_ttl_secs must be positive".into(),
            ));
        }
        if self.worker.max_error_backoff_ms < self.worker.error_backoff_ms {
            return Err(ConfigError::Invalid(
                "worker.max_error_backoff_ms must be >= worker.error_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}
