//! Configuration types for archive-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Download behavior configuration (destination, concurrency, filtering)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Destination root; files land at `<dest>/<item>/<file>` (default: ".")
    #[serde(default = "default_dest")]
    pub dest: PathBuf,

    /// Maximum concurrent file transfers (default: 4)
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Randomize item order before scheduling (default: false)
    #[serde(default)]
    pub shuffle: bool,

    /// Seed for the shuffle; `None` draws from OS entropy
    #[serde(default)]
    pub seed: Option<u64>,

    /// Filename glob; only matching files are downloaded (None = all files)
    ///
    /// Alternatives may be separated by `|`, e.g. `*.warc.gz|*.cdx.gz`.
    #[serde(default)]
    pub filter: Option<String>,

    /// Adopt destination files that exist without a completion record if their MD5 matches
    #[serde(default)]
    pub verify_existing: bool,

    /// Stop dispatching after this many file failures in a row (None = never)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: Option<usize>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dest: default_dest(),
            jobs: default_jobs(),
            shuffle: false,
            seed: None,
            filter: None,
            verify_existing: false,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// Remote service endpoints, credentials and transfer deadlines
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Service root; metadata is read from `<base_url>/metadata/<item>` and
    /// files from `<base_url>/download/<item>/<file>` (default: "https://archive.org")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Access key (sent together with `secret_key`)
    #[serde(default)]
    pub access_key: Option<String>,

    /// Secret key (sent together with `access_key`)
    #[serde(default)]
    pub secret_key: Option<String>,

    /// TCP connect timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Timeout for a metadata request (default: 60 seconds)
    #[serde(default = "default_metadata_timeout", with = "duration_serde")]
    pub metadata_timeout: Duration,

    /// Upper bound on a single file transfer (default: 3600 seconds)
    #[serde(default = "default_file_timeout", with = "duration_serde")]
    pub file_timeout: Duration,

    /// Maximum silence between two received chunks (default: 60 seconds)
    #[serde(default = "default_stall_timeout", with = "duration_serde")]
    pub stall_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_key: None,
            secret_key: None,
            connect_timeout: default_connect_timeout(),
            metadata_timeout: default_metadata_timeout(),
            file_timeout: default_file_timeout(),
            stall_timeout: default_stall_timeout(),
        }
    }
}

impl RemoteConfig {
    /// The credential pair, if both halves are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

/// Where run state is kept between invocations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Completion cache database (default: `<local data dir>/archive-dl/default.sqlite`)
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Store item file listings in the cache and reuse them on later runs (default: false)
    #[serde(default)]
    pub cache_listings: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            cache_listings: false,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 4)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 4 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 256 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 4.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Policy for file transfers: two quick retries, then leave it to the next run
    pub fn transfers() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// No in-run retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }
}

/// Main configuration for a download run
///
/// Fields are organized into sub-configs:
/// - [`download`](DownloadConfig): destination, concurrency, ordering, filtering
/// - [`remote`](RemoteConfig): service endpoints, credentials, deadlines
/// - [`persistence`](PersistenceConfig): completion cache location
/// - `resolve_retry` / `transfer_retry`: in-run retry policies
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Remote service settings
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Cache settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Retries for item metadata lookups
    #[serde(default)]
    pub resolve_retry: RetryConfig,

    /// Retries for file transfers
    #[serde(default = "RetryConfig::transfers")]
    pub transfer_retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            remote: RemoteConfig::default(),
            persistence: PersistenceConfig::default(),
            resolve_retry: RetryConfig::default(),
            transfer_retry: RetryConfig::transfers(),
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file
    ///
    /// Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(
                "config",
                format!("cannot read config file {}: {}", path.display(), e),
            )
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Check settings that would otherwise fail deep inside a run
    pub fn validate(&self) -> Result<()> {
        if self.download.jobs == 0 {
            return Err(Error::config("jobs", "jobs must be at least 1"));
        }

        if let Some(pattern) = &self.download.filter {
            crate::resolver::FileFilter::new(pattern)?;
        }

        url::Url::parse(&self.remote.base_url).map_err(|e| {
            Error::config(
                "base_url",
                format!("invalid base URL '{}': {}", self.remote.base_url, e),
            )
        })?;

        if self.remote.access_key.is_some() != self.remote.secret_key.is_some() {
            return Err(Error::config(
                "access_key",
                "access_key and secret_key must be given together",
            ));
        }

        if self.remote.file_timeout.is_zero() || self.remote.stall_timeout.is_zero() {
            return Err(Error::config("file_timeout", "timeouts must be non-zero"));
        }

        Ok(())
    }
}

/// Default completion cache location for a collection
///
/// Lives under the platform's local data directory (or the temp directory when
/// there is none) so it is never inside the destination tree. The name becomes a
/// single file name: separators, `..`, NUL and leading dots are rejected.
pub fn cache_path_for_collection(collection: &str) -> Result<PathBuf> {
    if collection.is_empty()
        || collection.starts_with('.')
        || collection.contains(['/', '\\', '\0'])
    {
        return Err(Error::config(
            "collection",
            format!("invalid collection name '{}'", collection.escape_default()),
        ));
    }
    Ok(cache_dir().join(format!("{collection}.sqlite")))
}

fn cache_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("archive-dl")
}

fn default_dest() -> PathBuf {
    PathBuf::from(".")
}

fn default_jobs() -> usize {
    4
}

fn default_max_consecutive_failures() -> Option<usize> {
    Some(100)
}

fn default_base_url() -> String {
    "https://archive.org".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_metadata_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_file_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_path() -> PathBuf {
    cache_dir().join("default.sqlite")
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(4)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(256)
}

fn default_backoff_multiplier() -> f64 {
    4.0
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
