//! Agent configuration
//!
//! Settings are layered, later sources winning:
//!
//! 1. built-in defaults (the `DEFAULT_*` constants below)
//! 2. an optional TOML file (`--config` / `COUNTERLINK_CONFIG`)
//! 3. a `.env` file in the working directory, loaded through `dotenvy`
//! 4. `COUNTERLINK_*` environment variables
//!
//! The merged result is validated once and handed to the poll loop; nothing
//! reads configuration after startup.

use crate::error::ConfigError;
use chrono_tz::Tz;
use counterlink_common::types::LocationId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Agent Configuration Constants
// ============================================================================

/// Where the counter is expected to auto-mount.
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt/usb";

/// Desktop automount parent directory searched for labelled devices.
pub const DEFAULT_MEDIA_ROOT: &str = "/media/pi";

/// Kernel mount table.
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/mounts";

/// Volume-name fragments identifying the counter.
pub const DEFAULT_DEVICE_LABELS: &[&str] = &["apollyon", "trax"];

/// Export extensions picked up by default.
pub const DEFAULT_EXTENSIONS: &[&str] = &["csv", "prn"];

/// Seconds between poll cycles (5 minutes).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Seconds to wait before looking again when the device is absent.
pub const DEFAULT_DEVICE_RETRY_SECS: u64 = 60;

/// A file must keep its size and mtime for this long before it is read.
pub const DEFAULT_STABILITY_WINDOW_MS: u64 = 2_000;

/// Timezone the counter's clock is set to.
pub const DEFAULT_SOURCE_TIMEZONE: &str = "UTC";

/// Monthly data plan share for uploads (10 MiB).
pub const DEFAULT_MONTHLY_BYTE_BUDGET: u64 = 10 * 1024 * 1024;

/// Upper bound on one upload request.
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 30;

/// Bytes charged per request on top of the body: request and response
/// headers plus a TLS handshake on a fresh connection.
pub const DEFAULT_REQUEST_OVERHEAD_BYTES: u64 = 1_024;

/// Ledger and budget state location.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/counterlink";

const ENV_PREFIX: &str = "COUNTERLINK_";

/// What happens to an export once the server has acknowledged it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Remove the file from the device
    #[default]
    Delete,
    /// Move it into `archive_dir`
    Archive,
}

impl std::str::FromStr for CleanupMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delete" => Ok(CleanupMode::Delete),
            "archive" | "move" => Ok(CleanupMode::Archive),
            _ => Err(ConfigError::invalid_value("cleanup", s)),
        }
    }
}

impl std::fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupMode::Delete => write!(f, "delete"),
            CleanupMode::Archive => write!(f, "archive"),
        }
    }
}

/// Validated agent configuration
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    /// Location this counter is installed at
    pub location_id: LocationId,

    /// Ingestion endpoint receiving batch POSTs
    pub server_url: String,

    /// Bearer token sent with every upload, if the server wants one
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,

    /// Preferred mount point of the counter
    pub mount_root: PathBuf,

    /// Parent of desktop automount points
    pub media_root: PathBuf,

    /// Lowercase volume-name fragments identifying the counter
    pub device_labels: Vec<String>,

    /// Mount table consulted by the locator
    pub mount_table: PathBuf,

    /// Lowercase export extensions, without the dot
    pub extensions: Vec<String>,

    pub poll_interval_secs: u64,

    pub device_retry_secs: u64,

    pub stability_window_ms: u64,

    /// IANA timezone name of the counter's clock
    pub source_timezone: String,

    pub monthly_byte_budget: u64,

    /// Estimated non-body bytes each upload costs against the budget
    pub request_overhead_bytes: u64,

    pub upload_timeout_secs: u64,

    pub cleanup: CleanupMode,

    /// Required when `cleanup = "archive"`
    pub archive_dir: Option<PathBuf>,

    /// Directory holding the ledger and budget files
    pub state_dir: PathBuf,
}

impl AgentConfig {
    /// Load configuration from an optional TOML file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut partial = PartialConfig::default();
        if let Some(path) = path {
            partial = partial.merge(PartialConfig::from_file(path)?);
        }
        partial = partial.merge(PartialConfig::from_lookup(|key| std::env::var(key).ok())?);

        partial.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Missing("server_url"));
        }
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::invalid_value("server_url", &self.server_url));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("poll_interval_secs must be greater than 0"));
        }
        if self.device_retry_secs == 0 {
            return Err(ConfigError::invalid("device_retry_secs must be greater than 0"));
        }
        if self.upload_timeout_secs == 0 {
            return Err(ConfigError::invalid("upload_timeout_secs must be greater than 0"));
        }
        if self.monthly_byte_budget == 0 {
            return Err(ConfigError::invalid("monthly_byte_budget must be greater than 0"));
        }
        if self.request_overhead_bytes >= self.monthly_byte_budget {
            return Err(ConfigError::invalid(
                "request_overhead_bytes must be smaller than monthly_byte_budget",
            ));
        }
        if self.extensions.is_empty() {
            return Err(ConfigError::invalid("at least one export extension is required"));
        }
        if let Some(unknown) = self
            .extensions
            .iter()
            .find(|ext| crate::scanner::ExportDialect::from_extension(ext).is_none())
        {
            return Err(ConfigError::invalid_value("extensions", unknown));
        }
        if self.cleanup == CleanupMode::Archive && self.archive_dir.is_none() {
            return Err(ConfigError::invalid("cleanup = \"archive\" requires archive_dir"));
        }
        self.timezone()?;

        Ok(())
    }

    /// Parsed source timezone
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.source_timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::invalid_value("source_timezone", &self.source_timezone))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn device_retry(&self) -> Duration {
        Duration::from_secs(self.device_retry_secs)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.jsonl")
    }

    pub fn budget_path(&self) -> PathBuf {
        self.state_dir.join("budget.json")
    }
}

/// One configuration layer; unset fields fall through to earlier layers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub location_id: Option<LocationId>,
    pub server_url: Option<String>,
    pub auth_token: Option<String>,
    pub mount_root: Option<PathBuf>,
    pub media_root: Option<PathBuf>,
    pub device_labels: Option<Vec<String>>,
    pub mount_table: Option<PathBuf>,
    pub extensions: Option<Vec<String>>,
    pub poll_interval_secs: Option<u64>,
    pub device_retry_secs: Option<u64>,
    pub stability_window_ms: Option<u64>,
    pub source_timezone: Option<String>,
    pub monthly_byte_budget: Option<u64>,
    pub request_overhead_bytes: Option<u64>,
    pub upload_timeout_secs: Option<u64>,
    pub cleanup: Option<CleanupMode>,
    pub archive_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

impl PartialConfig {
    /// Read a TOML layer from disk
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build a layer from `COUNTERLINK_*` variables found through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            location_id: parse_var(var("LOCATION_ID"), "location_id")?,
            server_url: var("SERVER_URL"),
            auth_token: var("AUTH_TOKEN"),
            mount_root: var("MOUNT_ROOT").map(PathBuf::from),
            media_root: var("MEDIA_ROOT").map(PathBuf::from),
            device_labels: var("DEVICE_LABELS").map(|v| split_list(&v)),
            mount_table: var("MOUNT_TABLE").map(PathBuf::from),
            extensions: var("EXTENSIONS").map(|v| split_list(&v)),
            poll_interval_secs: parse_var(var("POLL_INTERVAL_SECS"), "poll_interval_secs")?,
            device_retry_secs: parse_var(var("DEVICE_RETRY_SECS"), "device_retry_secs")?,
            stability_window_ms: parse_var(var("STABILITY_WINDOW_MS"), "stability_window_ms")?,
            source_timezone: var("SOURCE_TIMEZONE"),
            monthly_byte_budget: parse_var(var("MONTHLY_BYTE_BUDGET"), "monthly_byte_budget")?,
            request_overhead_bytes: parse_var(var("REQUEST_OVERHEAD_BYTES"), "request_overhead_bytes")?,
            upload_timeout_secs: parse_var(var("UPLOAD_TIMEOUT_SECS"), "upload_timeout_secs")?,
            cleanup: var("CLEANUP").map(|v| v.parse()).transpose()?,
            archive_dir: var("ARCHIVE_DIR").map(PathBuf::from),
            state_dir: var("STATE_DIR").map(PathBuf::from),
        })
    }

    /// Overlay `other` on top of `self`
    pub fn merge(self, other: PartialConfig) -> Self {
        Self {
            location_id: other.location_id.or(self.location_id),
            server_url: other.server_url.or(self.server_url),
            auth_token: other.auth_token.or(self.auth_token),
            mount_root: other.mount_root.or(self.mount_root),
            media_root: other.media_root.or(self.media_root),
            device_labels: other.device_labels.or(self.device_labels),
            mount_table: other.mount_table.or(self.mount_table),
            extensions: other.extensions.or(self.extensions),
            poll_interval_secs: other.poll_interval_secs.or(self.poll_interval_secs),
            device_retry_secs: other.device_retry_secs.or(self.device_retry_secs),
            stability_window_ms: other.stability_window_ms.or(self.stability_window_ms),
            source_timezone: other.source_timezone.or(self.source_timezone),
            monthly_byte_budget: other.monthly_byte_budget.or(self.monthly_byte_budget),
            request_overhead_bytes: other.request_overhead_bytes.or(self.request_overhead_bytes),
            upload_timeout_secs: other.upload_timeout_secs.or(self.upload_timeout_secs),
            cleanup: other.cleanup.or(self.cleanup),
            archive_dir: other.archive_dir.or(self.archive_dir),
            state_dir: other.state_dir.or(self.state_dir),
        }
    }

    /// Fill defaults, normalize and validate
    pub fn resolve(self) -> Result<AgentConfig, ConfigError> {
        let lowercase = |items: Vec<String>| -> Vec<String> {
            items
                .into_iter()
                .map(|s| s.trim().trim_start_matches('.').to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let defaults = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let config = AgentConfig {
            location_id: self.location_id.ok_or(ConfigError::Missing("location_id"))?,
            server_url: self.server_url.ok_or(ConfigError::Missing("server_url"))?,
            auth_token: self.auth_token.filter(|t| !t.is_empty()),
            mount_root: self.mount_root.unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_ROOT)),
            media_root: self.media_root.unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT)),
            device_labels: lowercase(
                self.device_labels
                    .unwrap_or_else(|| defaults(DEFAULT_DEVICE_LABELS)),
            ),
            mount_table: self.mount_table.unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_TABLE)),
            extensions: lowercase(self.extensions.unwrap_or_else(|| defaults(DEFAULT_EXTENSIONS))),
            poll_interval_secs: self.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            device_retry_secs: self.device_retry_secs.unwrap_or(DEFAULT_DEVICE_RETRY_SECS),
            stability_window_ms: self.stability_window_ms.unwrap_or(DEFAULT_STABILITY_WINDOW_MS),
            source_timezone: self
                .source_timezone
                .unwrap_or_else(|| DEFAULT_SOURCE_TIMEZONE.to_string()),
            monthly_byte_budget: self.monthly_byte_budget.unwrap_or(DEFAULT_MONTHLY_BYTE_BUDGET),
            request_overhead_bytes: self
                .request_overhead_bytes
                .unwrap_or(DEFAULT_REQUEST_OVERHEAD_BYTES),
            upload_timeout_secs: self.upload_timeout_secs.unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS),
            cleanup: self.cleanup.unwrap_or_default(),
            archive_dir: self.archive_dir,
            state_dir: self.state_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
        };

        config.validate()?;
        Ok(config)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn parse_var<T: std::str::FromStr>(raw: Option<String>, key: &str) -> Result<Option<T>, ConfigError> {
    raw.map(|v| v.parse::<T>().map_err(|_| ConfigError::invalid_value(key, v)))
        .transpose()
}
