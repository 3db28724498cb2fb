//! Node Configuration
//!
//! Settings are read from a TOML file where every section and field is
//! optional, then selectively overridden from the command line (or the
//! matching `HUB_*` environment variables).
//!
//! ```toml
//! [executor]
//! backend = "queue"
//!
//! [broker]
//! kind = "redis"
//! url = "redis://localhost:6379/0"
//!
//! [database]
//! kind = "sqlite"
//! path = "hub.db"
//!
//! [lock]
//! mode = "atomic"
//! ttl_secs = 600
//! ```

use crate::allocation::{DEFAULT_LOCK_TTL, LockMode};
use crate::executor::distributed::QueueOptions;
use crate::executor::worker::WorkerOptions;
use crate::tasks::{APP_NAME, COMMON_QUEUE, SUBMISSION_QUEUE};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Broker-backed worker pool.
    #[default]
    Queue,
    /// One OS thread per task inside the calling process.
    Thread,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: APP_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub backend: BackendKind,
    pub default_queue: String,
    pub poll_interval_ms: u64,
    /// Finished results are dropped after this long. Unset keeps them.
    pub result_expires_secs: Option<u64>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Queue,
            default_queue: COMMON_QUEUE.to_string(),
            poll_interval_ms: 200,
            result_expires_secs: Some(24 * 3600),
        }
    }
}

impl ExecutorSettings {
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            default_queue: self.default_queue.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn result_expires(&self) -> Option<Duration> {
        self.result_expires_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub kind: StoreKind,
    pub url: String,
    /// Prefix of every broker key.
    pub namespace: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: "redis://127.0.0.1:6379/0".to_string(),
            namespace: "hub".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub node_name: String,
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub lease_secs: u64,
    pub lease_renewal_secs: u64,
    pub idle_sleep_ms: u64,
    pub revocation_poll_ms: u64,
    pub housekeeping_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let defaults = WorkerOptions::default();
        Self {
            node_name: defaults.node_name,
            concurrency: defaults.concurrency,
            queues: vec![SUBMISSION_QUEUE.to_string(), COMMON_QUEUE.to_string()],
            lease_secs: defaults.lease.as_secs(),
            lease_renewal_secs: defaults.lease_renewal.as_secs(),
            idle_sleep_ms: defaults.idle_sleep.as_millis() as u64,
            revocation_poll_ms: defaults.revocation_poll.as_millis() as u64,
            housekeeping_secs: defaults.housekeeping.as_secs(),
        }
    }
}

impl WorkerSettings {
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            node_name: self.node_name.clone(),
            concurrency: self.concurrency,
            queues: self.queues.clone(),
            lease: Duration::from_secs(self.lease_secs),
            lease_renewal: Duration::from_secs(self.lease_renewal_secs),
            idle_sleep: Duration::from_millis(self.idle_sleep_ms),
            revocation_poll: Duration::from_millis(self.revocation_poll_ms),
            housekeeping: Duration::from_secs(self.housekeeping_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub kind: DatabaseKind,
    pub path: Option<PathBuf>,
    /// How long an allocation waits for a row lock.
    pub lock_timeout_secs: u64,
    pub identifier_prefixes: Vec<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Memory,
            path: None,
            lock_timeout_secs: 30,
            identifier_prefixes: crate::storage::database::DEFAULT_IDENTIFIER_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
        }
    }
}

impl DatabaseSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub kind: StoreKind,
    pub url: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: "redis://127.0.0.1:6379/1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub mode: LockMode,
    pub ttl_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            mode: LockMode::default(),
            ttl_secs: DEFAULT_LOCK_TTL.as_secs(),
        }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppSettings,
    pub executor: ExecutorSettings,
    pub broker: BrokerSettings,
    pub worker: WorkerSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub lock: LockSettings,
    pub logging: LoggingSettings,
}

/// Command-line overrides. Unset flags leave the file value in place.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    /// Executor backend.
    #[arg(long, env = "HUB_BACKEND", value_enum)]
    pub backend: Option<BackendKind>,

    /// Broker url; switches the broker to Redis.
    #[arg(long, env = "HUB_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Cache url; switches the cache to Redis.
    #[arg(long, env = "HUB_CACHE_URL")]
    pub cache_url: Option<String>,

    /// SQLite database file; switches the database to SQLite.
    #[arg(long, env = "HUB_DATABASE")]
    pub database: Option<PathBuf>,

    /// Number of concurrent workers.
    #[arg(long, env = "HUB_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Queues consumed by the workers (repeatable).
    #[arg(long = "queue", env = "HUB_QUEUES", value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Worker name prefix.
    #[arg(long, env = "HUB_NODE_NAME")]
    pub node_name: Option<String>,

    /// Single-flight lock mode (`atomic` or `check-then-set`).
    #[arg(long, env = "HUB_LOCK_MODE")]
    pub lock_mode: Option<LockMode>,

    /// Log filter, e.g. `debug` or `dataset_hub=trace`.
    #[arg(long, env = "HUB_LOG")]
    pub log_level: Option<String>,
}

impl Settings {
    /// Reads `path`, or returns the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(backend) = overrides.backend {
            self.executor.backend = backend;
        }
        if let Some(url) = &overrides.broker_url {
            self.broker.kind = StoreKind::Redis;
            self.broker.url = url.clone();
        }
        if let Some(url) = &overrides.cache_url {
            self.cache.kind = StoreKind::Redis;
            self.cache.url = url.clone();
        }
        if let Some(path) = &overrides.database {
            self.database.kind = DatabaseKind::Sqlite;
            self.database.path = Some(path.clone());
        }
        if let Some(concurrency) = overrides.concurrency {
            self.worker.concurrency = concurrency;
        }
        if !overrides.queues.is_empty() {
            self.worker.queues = overrides.queues.clone();
        }
        if let Some(node_name) = &overrides.node_name {
            self.worker.node_name = node_name.clone();
        }
        if let Some(mode) = overrides.lock_mode {
            self.lock.mode = mode;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Rejects combinations the node cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));

        if self.app.name.trim().is_empty() {
            return invalid("app.name must not be empty");
        }
        if self.worker.concurrency == 0 {
            return invalid("worker.concurrency must be at least 1");
        }
        if self.worker.queues.iter().all(|queue| queue.trim().is_empty()) {
            return invalid("worker.queues must name at least one queue");
        }
        if self.worker.lease_renewal_secs >= self.worker.lease_secs {
            return invalid("worker.lease_renewal_secs must be shorter than worker.lease_secs");
        }
        if self.worker.housekeeping_secs == 0 {
            return invalid("worker.housekeeping_secs must be positive");
        }
        if self.lock.ttl_secs == 0 {
            return invalid("lock.ttl_secs must be positive");
        }
        if self.database.kind == DatabaseKind::Sqlite {
            if !cfg!(feature = "sqlite") {
                return invalid("database.kind = sqlite needs the `sqlite` feature");
            }
            if self.database.path.is_none() {
                return invalid("database.path is required for sqlite");
            }
        }
        let wants_redis =
            self.broker.kind == StoreKind::Redis || self.cache.kind == StoreKind::Redis;
        if wants_redis && !cfg!(feature = "redis") {
            return invalid("a redis broker or cache needs the `redis` feature");
        }
        Ok(())
    }
}
