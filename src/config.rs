//! File and environment configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;
use crate::session::Credentials;

pub const ENV_ENDPOINT: &str = "ENTERPRISE_SYNC_ENDPOINT";
pub const ENV_USERNAME: &str = "ENTERPRISE_SYNC_USERNAME";
pub const ENV_PASSWORD: &str = "ENTERPRISE_SYNC_PASSWORD";

const CONFIG_FILE: &str = "config.toml";
const STORE_FILE: &str = "store.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// URL every protocol command is posted to
    pub endpoint: String,
    pub username: String,
    pub password: Option<String>,
    /// Per-request HTTP timeout
    pub timeout_secs: u64,
    /// Seconds between scheduled passes
    pub interval_secs: u64,
    /// Consecutive transport failures before the session reports itself
    /// unusable
    pub max_transport_failures: u32,
    /// Local store file; defaults to the platform data directory
    pub store_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: None,
            timeout_secs: 30,
            interval_secs: 60,
            max_transport_failures: 3,
            store_path: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "enterprise-sync", "enterprise-sync")
}

impl SyncConfig {
    /// Platform config file location, e.g. `~/.config/enterprise-sync/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path`, or from [`default_path`](Self::default_path) when
    /// none is given, then apply environment overrides. A missing file is
    /// not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!("No config file at {}, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Ok(username) = std::env::var(ENV_USERNAME) {
            self.username = username;
        }
        if let Ok(password) = std::env::var(ENV_PASSWORD) {
            self.password = Some(password);
        }
    }

    pub fn validate(&self) -> std::result::Result<(), SyncError> {
        if self.endpoint.trim().is_empty() {
            return Err(SyncError::Config("endpoint is not set".to_string()));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(SyncError::Config(format!(
                "endpoint {} is not an http(s) URL",
                self.endpoint
            )));
        }
        if self.timeout_secs == 0 {
            return Err(SyncError::Config("timeout_secs must be positive".to_string()));
        }
        if self.interval_secs == 0 {
            return Err(SyncError::Config("interval_secs must be positive".to_string()));
        }
        if self.max_transport_failures == 0 {
            return Err(SyncError::Config(
                "max_transport_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        if self.username.is_empty() {
            return None;
        }
        Some(Credentials::new(
            self.username.clone(),
            self.password.clone().unwrap_or_default(),
        ))
    }

    /// Configured store path, else the platform data directory, else the
    /// working directory.
    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join(STORE_FILE)))
            .unwrap_or_else(|| PathBuf::from(STORE_FILE))
    }
}
