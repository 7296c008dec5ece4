//! Configuration for conveyor, read from `conveyor.toml`.
//!
//! Settings are layered: file, then environment, then CLI flags. A missing file
//! means defaults for everything.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! base_url = "http://localhost:8080"
//! timeout_secs = 30
//! retries = 3
//! retry_backoff_ms = 200
//! public_group = "public"
//!
//! [scheduler]
//! max_parallel = 4
//! rebuild_dependencies = false
//!
//! [product]
//! name = "default"
//! version = "1.0"
//!
//! [driver]
//! shell = "sh"
//! work_dir = "."
//! log_dir = ".conveyor/logs"
//!
//! [catalog]
//! path = "configurations.toml"
//! records_dir = ".conveyor/records"
//!
//! [logging]
//! filter = "info"
//! format = "pretty"
//! directory = ".conveyor/logs"
//! ```

use anyhow::{Context, Result};
use conveyor_common::ProductVersion;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dag::SchedulerConfig;
use crate::repository::HierarchySettings;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "conveyor.toml";

pub const ENV_STORE_URL: &str = "CONVEYOR_STORE_URL";
pub const ENV_MAX_PARALLEL: &str = "CONVEYOR_MAX_PARALLEL";
pub const ENV_LOG: &str = "CONVEYOR_LOG";

/// Artifact-store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Base URL of the store service; `/api` is appended when missing
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for existence checks and store creation
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Backoff between retries, multiplied by the attempt number
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Group holding public remote repositories, appended to every product group
    #[serde(default = "default_public_group")]
    pub public_group: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_public_group() -> String {
    crate::repository::naming::DEFAULT_PUBLIC_GROUP.to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            public_group: default_public_group(),
        }
    }
}

impl StoreSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn hierarchy_settings(&self) -> HierarchySettings {
        HierarchySettings::default()
            .with_public_group(&self.public_group)
            .with_retries(self.retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

/// Product the builds of a submission belong to when the root configuration names none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSection {
    #[serde(default = "default_product_name")]
    pub name: String,
    #[serde(default = "default_product_version")]
    pub version: String,
}

fn default_product_name() -> String {
    "default".to_string()
}

fn default_product_version() -> String {
    "1.0".to_string()
}

impl Default for ProductSection {
    fn default() -> Self {
        Self {
            name: default_product_name(),
            version: default_product_version(),
        }
    }
}

impl ProductSection {
    pub fn product_version(&self) -> ProductVersion {
        ProductVersion::new(&self.name, &self.version)
    }
}

/// Local process driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSection {
    /// Shell used to run build scripts (`<shell> -c <script>`)
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Working directory for build scripts
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Where build logs are written
    #[serde(default = "default_driver_log_dir")]
    pub log_dir: PathBuf,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_driver_log_dir() -> PathBuf {
    PathBuf::from(".conveyor/logs")
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            work_dir: default_work_dir(),
            log_dir: default_driver_log_dir(),
        }
    }
}

/// File catalog locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSection {
    /// TOML file listing build configurations
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
    /// Directory holding one JSON file per build record
    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("configurations.toml")
}

fn default_records_dir() -> PathBuf {
    PathBuf::from(".conveyor/records")
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            records_dir: default_records_dir(),
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `tracing` filter directive, e.g. `info` or `conveyor=debug`
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write a daily-rolling log file here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// The complete conveyor.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConveyorConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub product: ProductSection,
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ConveyorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conveyor.toml")
    }

    /// Load `path`, or return defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conveyor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CONVEYOR_*` environment variables on top of the file settings.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.store.base_url = url;
        }
        if let Some(max) = lookup(ENV_MAX_PARALLEL) {
            self.scheduler.max_parallel = max
                .parse()
                .with_context(|| format!("{} must be a number, got '{}'", ENV_MAX_PARALLEL, max))?;
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.logging.filter = filter;
        }
        Ok(())
    }

    /// Resolve relative paths against `base`, normally the config file's directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.driver.work_dir);
        resolve(&mut self.driver.log_dir);
        resolve(&mut self.catalog.path);
        resolve(&mut self.catalog.records_dir);
        if let Some(dir) = self.logging.directory.as_mut() {
            resolve(dir);
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.store.base_url.starts_with("http://") && !self.store.base_url.starts_with("https://") {
            warnings.push(format!(
                "store.base_url '{}' should start with http:// or https://",
                self.store.base_url
            ));
        }
        if self.store.timeout_secs == 0 {
            warnings.push("store.timeout_secs is 0; every store call will time out".to_string());
        }
        if self.scheduler.max_parallel == 0 {
            warnings.push("scheduler.max_parallel is 0; 1 will be used".to_string());
        }
        if self.product.name.trim().is_empty() || self.product.version.trim().is_empty() {
            warnings.push("product.name and product.version must not be empty".to_string());
        }
        if self.driver.shell.trim().is_empty() {
            warnings.push("driver.shell must not be empty".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.filter).is_err() {
            warnings.push(format!("Invalid logging.filter '{}'", self.logging.filter));
        }

        warnings
    }
}
