use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::{default_data_dir, DataPaths};

/// Load the configuration file, writing the defaults if it does not exist yet.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let config = AppConfig::default();
        save_config(path, &config)?;
        return Ok(config);
    }
    let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
    let config: AppConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Address other instances use to reach a provider; containers share the host network.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_proxy_addr")]
    pub proxy_addr: String,
    /// URL fetched once before auto-starting instances.
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_log_buffer_size")]
    pub log_buffer_size: usize,
    /// Semver requirement a descriptor version must satisfy to be applied by an update.
    #[serde(default = "default_supported_versions")]
    pub supported_versions: String,
    /// Directory of service descriptors (`*.json`). Defaults to `<data_dir>/services`.
    #[serde(default)]
    pub services_dir: Option<PathBuf>,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_probe_url() -> String {
    "https://hub.docker.com".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    20
}

fn default_log_buffer_size() -> usize {
    1000
}

fn default_supported_versions() -> String {
    ">=0.1.0".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            host: default_host(),
            proxy_addr: default_proxy_addr(),
            probe_url: default_probe_url(),
            probe_timeout_secs: default_probe_timeout_secs(),
            log_buffer_size: default_log_buffer_size(),
            supported_versions: default_supported_versions(),
            services_dir: None,
            docker_bin: default_docker_bin(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AppError::config("host must not be empty"));
        }
        if self.log_buffer_size == 0 {
            return Err(AppError::config("log_buffer_size must be at least 1"));
        }
        self.version_req()?;
        Ok(())
    }

    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_dir)
    }

    pub fn services_dir(&self) -> PathBuf {
        self.services_dir
            .clone()
            .unwrap_or_else(|| self.paths().services_dir())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn version_req(&self) -> Result<semver::VersionReq> {
        semver::VersionReq::parse(&self.supported_versions).map_err(|e| {
            AppError::config(format!(
                "Invalid supported_versions {:?}: {}",
                self.supported_versions, e
            ))
        })
    }
}
