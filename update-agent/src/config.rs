//! Configuration management for the update agent.
//!
//! Loads configuration from TOML file with environment variable overrides
//! (`UPDATE_AGENT__UPDATE__ENABLED=false`, `UPDATE_AGENT__AGENT__PORT=9000`, ...).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// HTTP server port for the update endpoints
    #[serde(default = "default_port")]
    pub port: u16,

    /// Install root containing `app/` and `.update/`
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Master switch for every update operation
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub source: SourceConfig,

    /// systemd unit restarted after apply/rollback (process exit if unset)
    #[serde(default)]
    pub service_name: Option<String>,

    /// Run periodic background checks
    #[serde(default = "default_true")]
    pub auto_check: bool,

    #[serde(default = "default_auto_check_interval_hours")]
    pub auto_check_interval_hours: u64,

    /// Directories (relative to `app/`) where files missing from a release
    /// may be deleted. Everything else is left alone.
    #[serde(default)]
    pub updateable_dirs: BTreeSet<String>,

    /// Files (relative to `app/`) every release must contain
    #[serde(default = "default_required_files")]
    pub required_files: BTreeSet<String>,

    /// Confirm a pending verification after this much uptime
    #[serde(default)]
    pub auto_confirm_after_secs: Option<u64>,

    /// Timeout for release metadata requests
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    /// Timeout for archive downloads
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Repository identifier, e.g. `owner/project`
    #[serde(default)]
    pub repository: String,

    /// Branch used when release assets are disabled
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Use "latest release" metadata instead of the branch version file
    #[serde(default = "default_true")]
    pub use_release_assets: bool,

    /// Path of the version file inside the repository
    #[serde(default = "default_version_file")]
    pub version_file: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_raw_base")]
    pub raw_base: String,

    #[serde(default = "default_archive_base")]
    pub archive_base: String,

    /// Optional bearer token for private repositories
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (full, compact)
    #[serde(default = "default_log_output")]
    pub output: String,
}

// Default values
fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8080
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("/opt/app")
}

fn default_auto_check_interval_hours() -> u64 {
    24
}

fn default_required_files() -> BTreeSet<String> {
    BTreeSet::from(["VERSION".to_string()])
}

fn default_check_timeout_secs() -> u64 {
    10
}

fn default_download_timeout_secs() -> u64 {
    120
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_version_file() -> String {
    "app/VERSION".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_raw_base() -> String {
    "https://raw.githubusercontent.com".to_string()
}

fn default_archive_base() -> String {
    "https://github.com".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "full".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            install_dir: default_install_dir(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: SourceConfig::default(),
            service_name: None,
            auto_check: true,
            auto_check_interval_hours: default_auto_check_interval_hours(),
            updateable_dirs: BTreeSet::new(),
            required_files: default_required_files(),
            auto_confirm_after_secs: None,
            check_timeout_secs: default_check_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repository: String::new(),
            branch: default_branch(),
            use_release_assets: true,
            version_file: default_version_file(),
            api_base: default_api_base(),
            raw_base: default_raw_base(),
            archive_base: default_archive_base(),
            token: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
        }
    }
}

impl UpdateConfig {
    pub fn auto_check_interval(&self) -> Duration {
        Duration::from_secs(self.auto_check_interval_hours.max(1) * 3600)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl SourceConfig {
    /// Last path component of the repository id (`owner/project` -> `project`)
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `UPDATE_AGENT__*` overrides
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("UPDATE_AGENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Render the configuration as TOML (used by `--print-config`)
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
