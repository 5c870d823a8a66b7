//! Centralized path utilities for the data directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Name of the per-instance metadata directory.
const META_DIR: &str = ".vertex";

/// Default root data directory (~/.vertex).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vertex")
}

/// Every on-disk location, derived from a single root.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure all required data directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [self.root.clone(), self.instances_dir(), self.services_dir()];
        for dir in &dirs {
            fs::create_dir_all(dir).map_err(|e| {
                AppError::io(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    pub fn services_dir(&self) -> PathBuf {
        self.root.join("services")
    }

    pub fn redirects_path(&self) -> PathBuf {
        self.root.join("redirects.toml")
    }

    /// Root directory of an instance (also the docker build context when none is given).
    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(instance_id)
    }

    pub fn instance_meta_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(META_DIR)
    }

    pub fn descriptor_path(&self, instance_id: &str) -> PathBuf {
        self.instance_meta_dir(instance_id).join("service.json")
    }

    pub fn settings_path(&self, instance_id: &str) -> PathBuf {
        self.instance_meta_dir(instance_id).join("settings.toml")
    }

    pub fn env_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(".env")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_files_live_under_instance_dir() {
        let paths = DataPaths::new("/data");
        let id = "0b6c2f1e-4d2a-4a55-9a43-6d1c7f7f0a11";
        assert_eq!(
            paths.descriptor_path(id),
            PathBuf::from("/data/instances").join(id).join(".vertex/service.json")
        );
        assert_eq!(
            paths.env_path(id),
            PathBuf::from("/data/instances").join(id).join(".env")
        );
    }
}
