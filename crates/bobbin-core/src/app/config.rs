//! AppConfig - 明示的な設定構造体
//!
//! グローバルなシングルトンは持たず、`AppBuilder` が `Arc<AppConfig>` として
//! 各コンポーネントに配ります。TOML から読み込めます。
//!
//! ```toml
//! default_queue = "celery"
//! result_ttl_secs = 86400
//! chord_error_policy = "fail_fast"
//!
//! [worker]
//! concurrency = 8
//! pool = "threads"
//! queues = ["celery", "video"]
//!
//! [[routes]]
//! pattern = "video.*"
//! queue = "video"
//! priority = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use crate::domain::ChordErrorPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How a worker runs each task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// Lightweight: one tokio task per execution.
    #[default]
    Tasks,
    /// Isolated: one OS thread with its own runtime per execution.
    Threads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_queue: String,
    /// `0` keeps results forever.
    pub result_ttl_secs: u64,
    pub default_max_retries: u32,
    pub chord_error_policy: ChordErrorPolicy,
    /// Where undecodable messages are forwarded. Dropped when unset.
    pub dead_letter_queue: Option<String>,
    pub worker: WorkerConfig,
    pub result: ResultConfig,
    pub retry: RetryConfig,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Defaults to `worker-<pid>`.
    pub hostname: Option<String>,
    pub concurrency: usize,
    pub pool: PoolStrategy,
    /// Consumed queues, highest precedence first. Empty means `[default_queue]`.
    pub queues: Vec<String>,
    pub poll_timeout_ms: u64,
    /// Time between the soft cancellation signal and the forced kill.
    pub soft_timeout_grace_ms: u64,
    /// How often a running task's revocation entry is checked.
    pub revoke_poll_ms: u64,
    pub heartbeat_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultConfig {
    /// Minimum interval between store reads in `AsyncResult::get`.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Exact name, or a pattern with `*` wildcards (`video.*`, `*.report`).
    pub pattern: String,
    pub queue: String,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_queue: "celery".to_string(),
            result_ttl_secs: 24 * 60 * 60,
            default_max_retries: 3,
            chord_error_policy: ChordErrorPolicy::FailFast,
            dead_letter_queue: None,
            worker: WorkerConfig::default(),
            result: ResultConfig::default(),
            retry: RetryConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            concurrency: 4,
            pool: PoolStrategy::Tasks,
            queues: Vec::new(),
            poll_timeout_ms: 1_000,
            soft_timeout_grace_ms: 2_000,
            revoke_poll_ms: 200,
            heartbeat_ms: 5_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10 * 60 * 1_000,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_queue.trim().is_empty() {
            return Err(ConfigError::Invalid("default_queue must not be empty".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be > 0".into()));
        }
        if self.worker.poll_timeout_ms == 0 || self.result.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll intervals must be > 0".into()));
        }
        if self.worker.revoke_poll_ms == 0 || self.worker.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.revoke_poll_ms and worker.heartbeat_ms must be > 0".into(),
            ));
        }
        if self.worker.backoff_initial_ms == 0
            || self.worker.backoff_initial_ms > self.worker.backoff_max_ms
        {
            return Err(ConfigError::Invalid(
                "worker backoff must satisfy 0 < initial <= max".into(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        if let Some(route) = self.routes.iter().find(|r| r.queue.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "route '{}' has an empty queue",
                route.pattern
            )));
        }
        Ok(())
    }

    pub fn result_ttl(&self) -> Option<Duration> {
        (self.result_ttl_secs > 0).then(|| Duration::from_secs(self.result_ttl_secs))
    }

    pub fn hostname(&self) -> String {
        self.worker
            .hostname
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }

    /// Queues the worker consumes.
    pub fn worker_queues(&self) -> Vec<String> {
        if self.worker.queues.is_empty() {
            vec![self.default_queue.clone()]
        } else {
            self.worker.queues.clone()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

impl WorkerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn soft_timeout_grace(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_grace_ms)
    }

    pub fn revoke_poll(&self) -> Duration {
        Duration::from_millis(self.revoke_poll_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl ResultConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
