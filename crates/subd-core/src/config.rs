//! Configuration module for subd.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation and defaults. Command-line flags override the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::filter::Filter;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for subd.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub rpc: RpcConfig,
    pub triggers: TriggersConfig,
    pub safety: SafetyConfig,
    pub logging: LoggingConfig,
}

/// Background filesystem scanner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Root of the managed filesystem.
    pub root_dir: PathBuf,
    /// Seconds to wait between the end of one scan and the start of the next.
    pub interval_secs: u64,
    /// Percentage of measured disk read capacity the scanner may use (1-100).
    pub speed_percent: u8,
    /// Regular expressions for pathnames the scanner skips.
    pub exclusions: Vec<String>,
    /// Do not descend into other mounted filesystems.
    pub one_file_system: bool,
}

/// Object fetching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Percentage of measured network capacity a fetch may use (1-100).
    pub speed_percent: u8,
    /// Maximum objects downloaded concurrently outside of a benchmark.
    pub fetch_concurrency: usize,
    /// A fetch larger than this (in MiB) with no known link speed runs as a benchmark.
    pub benchmark_threshold_mb: u64,
    /// Per-request timeout against the object server.
    pub request_timeout_secs: u64,
}

/// On-disk state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Private working directory, relative to the managed root. Holds the
    /// object cache, saved triggers and the network benchmark.
    pub work_dir: String,
}

/// RPC listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Address the HTTP RPC server binds to.
    pub listen_address: String,
}

/// Service trigger runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggersConfig {
    /// Log triggers instead of running them.
    pub disabled: bool,
    /// Program and leading arguments; the service name and action are appended.
    pub command: Vec<String>,
}

/// Safety switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Reject Fetch and Update.
    pub read_only: bool,
    /// Reject Update.
    pub disable_updates: bool,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Default path for the configuration file.
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/subd/config.yaml")
    }

    /// Absolute host path of the private working directory.
    pub fn work_dir_path(&self) -> PathBuf {
        self.scanner
            .root_dir
            .join(self.storage.work_dir.trim_start_matches('/'))
    }

    /// Host path of the object cache directory.
    pub fn objects_dir(&self) -> PathBuf {
        self.work_dir_path().join("objects")
    }

    /// Host path of the saved trigger list.
    pub fn triggers_file(&self) -> PathBuf {
        self.work_dir_path().join("triggers.json")
    }

    /// Host path of the saved network benchmark.
    pub fn netbench_file(&self) -> PathBuf {
        self.work_dir_path().join("netbench")
    }

    /// Compiled scanner exclusions; the working directory is always excluded.
    pub fn scan_filter(&self) -> Result<Filter, crate::domain::DomainError> {
        scan_filter_with(&self.storage.work_dir, &self.scanner.exclusions)
    }
}

/// Builds a scan filter from exclusion lines plus the private working directory.
pub fn scan_filter_with(
    work_dir: &str,
    exclusions: &[String],
) -> Result<Filter, crate::domain::DomainError> {
    let work_dir_line = format!("{}(/|$)", regex::escape(work_dir));
    Filter::new(std::iter::once(work_dir_line.as_str()).chain(exclusions.iter().map(String::as_str)))
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/"),
            interval_secs: 10,
            speed_percent: 2,
            exclusions: vec![
                "/data/.*".into(),
                "/home/.*".into(),
                "/proc/.*".into(),
                "/sys/.*".into(),
                "/tmp/.*".into(),
                "/var/log/.*".into(),
                "/var/mail/.*".into(),
                "/var/spool/.*".into(),
                "/var/tmp/.*".into(),
            ],
            one_file_system: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            speed_percent: 10,
            fetch_concurrency: 4,
            benchmark_threshold_mb: 64,
            request_timeout_secs: 300,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: "/.subd".into(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:6969".into(),
        }
    }
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            command: vec!["service".into()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"scanner.speed_percent"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn check_percent(errors: &mut Vec<ValidationError>, field: &str, value: u8) {
    if value == 0 || value > 100 {
        errors.push(ValidationError {
            field: field.into(),
            message: format!("must be between 1 and 100, got {value}"),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- scanner ---
        if !self.scanner.root_dir.is_absolute() {
            errors.push(ValidationError {
                field: "scanner.root_dir".into(),
                message: format!("must be absolute: {}", self.scanner.root_dir.display()),
            });
        }
        check_percent(&mut errors, "scanner.speed_percent", self.scanner.speed_percent);
        if let Err(e) = Filter::new(&self.scanner.exclusions) {
            errors.push(ValidationError {
                field: "scanner.exclusions".into(),
                message: e.to_string(),
            });
        }

        // --- network ---
        check_percent(&mut errors, "network.speed_percent", self.network.speed_percent);
        if self.network.fetch_concurrency == 0 {
            errors.push(ValidationError {
                field: "network.fetch_concurrency".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.network.request_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "network.request_timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- storage ---
        let work_dir = &self.storage.work_dir;
        if crate::domain::validate_managed_path(work_dir).is_err() || work_dir == "/" {
            errors.push(ValidationError {
                field: "storage.work_dir".into(),
                message: format!("must be an absolute path below the root: {work_dir}"),
            });
        }

        // --- rpc ---
        if self
            .rpc
            .listen_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            errors.push(ValidationError {
                field: "rpc.listen_address".into(),
                message: format!("not a socket address: {}", self.rpc.listen_address),
            });
        }

        // --- triggers ---
        if !self.triggers.disabled && self.triggers.command.is_empty() {
            errors.push(ValidationError {
                field: "triggers.command".into(),
                message: "must name a program when triggers are enabled".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "must be one of {:?}, got {:?}",
                    VALID_LOG_LEVELS, self.logging.level
                ),
            });
        }

        errors
    }
}
