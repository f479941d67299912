//! Engine configuration
//!
//! Configuration comes from three places, in increasing priority: built-in
//! defaults, a TOML file ([`EngineConfig::load`]) and `SCHEDSYNC_*`
//! environment variables ([`EngineConfig::from_env`]).
//!
//! ```toml
//! server_url = "wss://sync.example.com/realtime"
//! heartbeat_interval_secs = 10
//! rollback_timeout_secs = 30
//!
//! [reconnection]
//! base_delay_ms = 1000
//! max_delay_ms = 5000
//! max_attempts = 5
//! timeout_ms = 20000
//!
//! [queue]
//! max_retries = 5
//! backoff_secs = [1, 5, 15, 30, 60]
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default server URL
const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000/realtime";

/// Heartbeat ping interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long an optimistic update waits for the server before rolling back
pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry delays indexed by retry count
pub const DEFAULT_BACKOFF_TABLE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/// Reconnection parameters handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt
    pub base_delay: Duration,
    /// Upper bound for the exponential backoff
    pub max_delay: Duration,
    /// Attempts before giving up (`error` becomes terminal)
    pub max_attempts: u32,
    /// Per-attempt connect timeout
    pub timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
            timeout: Duration::from_secs(20),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Offline queue parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Failures before an item is marked failed permanently
    pub max_retries: u32,
    /// Retry delay indexed by the item's retry count (last entry repeats)
    pub backoff_table: Vec<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_table: DEFAULT_BACKOFF_TABLE.to_vec(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub server_url: String,
    pub reconnection: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub rollback_timeout: Duration,
    pub queue: QueueConfig,
    /// SQLite file backing the offline queue
    pub database_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnection: ReconnectPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rollback_timeout: DEFAULT_ROLLBACK_TIMEOUT,
            queue: QueueConfig::default(),
            database_path: default_database_path(),
        }
    }
}

impl EngineConfig {
    /// Create a new EngineConfigBuilder
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Defaults overridden by `SCHEDSYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().apply_env()?.build()
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::builder().apply_file(file).build()
    }

    /// Load a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let file: FileConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::builder().apply_file(file).apply_env()?.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheme_ok = self.server_url.starts_with("ws://")
            || self.server_url.starts_with("wss://")
            || self.server_url.starts_with("loopback:");
        if !scheme_ok {
            return Err(ConfigError::InvalidUrl(self.server_url.clone()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue("heartbeat_interval must be positive"));
        }
        if self.rollback_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("rollback_timeout must be positive"));
        }
        if self.queue.max_retries == 0 {
            return Err(ConfigError::InvalidValue("queue.max_retries must be at least 1"));
        }
        if self.queue.backoff_table.is_empty() {
            return Err(ConfigError::InvalidValue("queue.backoff_table must not be empty"));
        }
        if self.reconnection.base_delay > self.reconnection.max_delay {
            return Err(ConfigError::InvalidValue(
                "reconnection.base_delay exceeds reconnection.max_delay",
            ));
        }
        Ok(())
    }
}

/// Builder for EngineConfig
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn reconnection(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnection = policy;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn rollback_timeout(mut self, timeout: Duration) -> Self {
        self.config.rollback_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.queue.max_retries = max_retries;
        self
    }

    pub fn backoff_table(mut self, table: Vec<Duration>) -> Self {
        self.config.queue.backoff_table = table;
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    fn apply_file(mut self, file: FileConfig) -> Self {
        if let Some(url) = file.server_url {
            self.config.server_url = url;
        }
        if let Some(secs) = file.heartbeat_interval_secs {
            self.config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.rollback_timeout_secs {
            self.config.rollback_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = file.database_path {
            self.config.database_path = path;
        }
        if let Some(reconnection) = file.reconnection {
            let policy = &mut self.config.reconnection;
            if let Some(ms) = reconnection.base_delay_ms {
                policy.base_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = reconnection.max_delay_ms {
                policy.max_delay = Duration::from_millis(ms);
            }
            if let Some(attempts) = reconnection.max_attempts {
                policy.max_attempts = attempts;
            }
            if let Some(ms) = reconnection.timeout_ms {
                policy.timeout = Duration::from_millis(ms);
            }
        }
        if let Some(queue) = file.queue {
            if let Some(max_retries) = queue.max_retries {
                self.config.queue.max_retries = max_retries;
            }
            if let Some(table) = queue.backoff_secs {
                self.config.queue.backoff_table =
                    table.into_iter().map(Duration::from_secs).collect();
            }
        }
        self
    }

    fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("SCHEDSYNC_SERVER_URL") {
            self.config.server_url = url;
        }
        if let Ok(path) = std::env::var("SCHEDSYNC_DATABASE_PATH") {
            self.config.database_path = PathBuf::from(path);
        }
        if let Some(secs) = env_u64("SCHEDSYNC_HEARTBEAT_SECS")? {
            self.config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SCHEDSYNC_ROLLBACK_SECS")? {
            self.config.rollback_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_u64("SCHEDSYNC_MAX_RETRIES")? {
            self.config.queue.max_retries = u32::try_from(retries)
                .map_err(|_| ConfigError::InvalidValue("SCHEDSYNC_MAX_RETRIES out of range"))?;
        }
        Ok(self)
    }

    /// Build the configuration
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn env_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Platform data directory location of the queue database
fn default_database_path() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    path.push("schedsync");
    path.push("queue.db");
    path
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    server_url: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    rollback_timeout_secs: Option<u64>,
    database_path: Option<PathBuf>,
    reconnection: Option<FileReconnection>,
    queue: Option<FileQueue>,
}

#[derive(Debug, Default, Deserialize)]
struct FileReconnection {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileQueue {
    max_retries: Option<u32>,
    backoff_secs: Option<Vec<u64>>,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("invalid environment variable {name}={value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config read error: {0}")]
    Io(String),
}
