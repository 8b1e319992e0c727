//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default database location used when no path is configured.
pub const DEFAULT_DATABASE_PATH: &str = "./data/haul.db";

/// Dedup cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a finished result is reused, as a duration string ("5m", "90s").
    #[serde(default = "default_cache_ttl")]
    pub ttl: String,
    /// Delete the artifact of a result when its entry is evicted.
    #[serde(default)]
    pub remove_artifacts: bool,
    /// Interval in seconds between eviction sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_cache_ttl() -> String {
    "5m".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            remove_artifacts: false,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    /// Parse the configured TTL.
    pub fn ttl(&self) -> crate::Result<Duration> {
        humantime::parse_duration(self.ttl.trim()).map_err(|e| {
            crate::Error::InvalidConfig(format!("cache.ttl '{}' is not a duration: {e}", self.ttl))
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.ttl()?;
        // tokio::time::interval panics on a zero period
        if self.sweep_interval_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "cache.sweep_interval_secs cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Database file path. Empty selects [`DEFAULT_DATABASE_PATH`].
    #[serde(default)]
    pub path: PathBuf,
    /// How long a writer waits on a locked database before failing.
    #[serde(default)]
    pub busy_timeout_secs: Option<u64>,
}

impl MetadataConfig {
    pub fn database_path(&self) -> PathBuf {
        if self.path.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_DATABASE_PATH)
        } else {
            self.path.clone()
        }
    }
}

/// External downloader configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Downloader executable (yt-dlp compatible command line).
    #[serde(default = "default_fetcher_program")]
    pub program: String,
    /// Extra arguments placed before the generated ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory receiving one scratch directory per download.
    #[serde(default = "default_fetcher_work_dir")]
    pub work_dir: PathBuf,
    /// Hard limit on a single download, in seconds.
    #[serde(default = "default_fetcher_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fetcher_program() -> String {
    "yt-dlp".to_string()
}

fn default_fetcher_work_dir() -> PathBuf {
    PathBuf::from("./data/downloads")
}

fn default_fetcher_timeout_secs() -> u64 {
    600 // 10 minutes
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            program: default_fetcher_program(),
            args: Vec::new(),
            work_dir: default_fetcher_work_dir(),
            timeout_secs: default_fetcher_timeout_secs(),
        }
    }
}

impl FetcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Operator session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Upper bound on concurrently live sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_max_sessions() -> usize {
    1024
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Persisted log configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Write log events into the database `logs` table.
    #[serde(default = "default_persist_logs")]
    pub persist: bool,
    /// Buffered events per live subscriber before events are dropped.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

fn default_persist_logs() -> bool {
    true
}

fn default_subscriber_capacity() -> usize {
    64
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            persist: default_persist_logs(),
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

/// A filter seeded into an empty database.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub exclude_query_params: bool,
    #[serde(default)]
    pub path_pattern: Option<String>,
    #[serde(default)]
    pub credentials_ref: Option<String>,
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

impl AppConfig {
    pub fn validate(&self) -> crate::Result<()> {
        self.cache.validate()?;
        if self.sessions.max_sessions == 0 {
            return Err(crate::Error::InvalidConfig(
                "sessions.max_sessions cannot be 0".to_string(),
            ));
        }
        if self.logs.subscriber_capacity == 0 {
            return Err(crate::Error::InvalidConfig(
                "logs.subscriber_capacity cannot be 0".to_string(),
            ));
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if filter.hosts.iter().all(|h| h.trim().is_empty()) {
                return Err(crate::Error::InvalidConfig(format!(
                    "filters[{i}] must list at least one host"
                )));
            }
        }
        Ok(())
    }
}
