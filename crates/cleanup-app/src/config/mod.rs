//! Configuration loading.
//!
//! Precedence, lowest to highest: built-in defaults, the optional
//! `config/settings.*` file, `CLEANUP__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::paths::project_dirs;
use crate::services::{DEFAULT_MAX_INDEXED_ITEMS, DEFAULT_MAX_NEIGHBORS, PollPolicy};

const CONFIG_FILE: &str = "config/settings";
const ENV_PREFIX: &str = "CLEANUP";

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_PLATFORM_URL: &str = "https://gate.dataloop.ai/api/v1";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub platform: PlatformConfig,
    pub polling: PollingConfig,
    pub clustering: ClusteringConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Allow any origin, method and header (the panel is served elsewhere).
    pub cors_allow_any: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of the filesystem blob store holding export markers.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

impl PlatformConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    pub export_timeout_secs: u64,
    pub execution_timeout_secs: u64,
    pub max_sleep_secs: u64,
    pub backoff_base_ms: u64,
}

impl PollingConfig {
    pub fn export_policy(&self) -> PollPolicy {
        self.policy(self.export_timeout_secs)
    }

    pub fn execution_policy(&self) -> PollPolicy {
        self.policy(self.execution_timeout_secs)
    }

    fn policy(&self, timeout_secs: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(timeout_secs),
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.max_sleep_secs),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    pub max_neighbors: usize,
    /// Feature sets above this size are not indexed.
    pub max_indexed_items: usize,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    load_from(Path::new(CONFIG_FILE))
}

/// Load with `file` (extension optional) as the settings file.
pub fn load_from(file: &Path) -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let builder = Config::builder()
        .set_default("server.listen_addr", DEFAULT_LISTEN_ADDR)?
        .set_default("server.cors_allow_any", true)?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .set_default("platform.base_url", DEFAULT_PLATFORM_URL)?
        .set_default("platform.request_timeout_secs", 30)?
        .set_default("polling.export_timeout_secs", 2 * 60 * 60)?
        .set_default("polling.execution_timeout_secs", 2 * 60 * 60)?
        .set_default("polling.max_sleep_secs", 10)?
        .set_default("polling.backoff_base_ms", 1000)?
        .set_default("clustering.max_neighbors", DEFAULT_MAX_NEIGHBORS as u64)?
        .set_default("clustering.max_indexed_items", DEFAULT_MAX_INDEXED_ITEMS as u64)?
        .add_source(File::with_name(&file.to_string_lossy()).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), AppConfigError> {
        let positive = [
            ("platform.request_timeout_secs", self.platform.request_timeout_secs),
            ("polling.export_timeout_secs", self.polling.export_timeout_secs),
            ("polling.execution_timeout_secs", self.polling.execution_timeout_secs),
            ("polling.max_sleep_secs", self.polling.max_sleep_secs),
            ("polling.backoff_base_ms", self.polling.backoff_base_ms),
            ("clustering.max_neighbors", self.clustering.max_neighbors as u64),
            ("clustering.max_indexed_items", self.clustering.max_indexed_items as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(AppConfigError::Invalid(format!("`{key}` must be greater than zero")));
        }
        if self.server.listen_addr.trim().is_empty() {
            return Err(AppConfigError::Invalid("`server.listen_addr` is empty".into()));
        }
        url::Url::parse(&self.platform.base_url).map_err(|err| {
            AppConfigError::Invalid(format!(
                "`platform.base_url` ({}) is not a URL: {err}",
                self.platform.base_url
            ))
        })?;
        Ok(())
    }
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()
        .ok_or(AppConfigError::MissingProjectDirs)?
        .data_dir()
        .join("markers"))
}
