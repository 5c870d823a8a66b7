//! Latest known service descriptors.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use super::ServiceDescriptor;
use crate::error::{AppError, Result};

#[derive(Debug, Default)]
pub struct ServiceCatalog {
    services: RwLock<BTreeMap<String, ServiceDescriptor>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every `*.json` descriptor in `dir`. Unreadable files are skipped.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            log::info!("Service directory {:?} does not exist, catalog is empty", dir);
            return Ok(0);
        }

        let entries = fs::read_dir(dir)
            .map_err(|e| AppError::io(format!("Failed to read {}: {}", dir.display(), e)))?;

        let mut loaded = 0;
        for entry in entries {
            let path = entry.map_err(|e| AppError::io(e.to_string()))?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match read_descriptor(&path) {
                Ok(service) => {
                    self.insert(service);
                    loaded += 1;
                }
                Err(e) => log::warn!("Skipping service descriptor {:?}: {}", path, e),
            }
        }

        log::info!("Loaded {} service descriptor(s) from {:?}", loaded, dir);
        Ok(loaded)
    }

    pub fn insert(&self, service: ServiceDescriptor) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services.insert(service.id.clone(), service);
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceDescriptor> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services.get(service_id).cloned()
    }

    pub fn all(&self) -> Vec<ServiceDescriptor> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services.values().cloned().collect()
    }

    /// Whether `current` differs from the latest known version of the same service.
    pub fn is_outdated(&self, current: &ServiceDescriptor) -> bool {
        self.get(&current.id)
            .map(|latest| latest != *current)
            .unwrap_or(false)
    }
}

fn read_descriptor(path: &Path) -> Result<ServiceDescriptor> {
    let content = fs::read_to_string(path)?;
    let content = content.trim_start_matches('\u{feff}');
    Ok(serde_json::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fixtures;

    #[test]
    fn load_dir_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("redis.json"),
            serde_json::to_string(&fixtures::redis()).unwrap(),
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = ServiceCatalog::new();
        assert_eq!(catalog.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(catalog.get("redis"), Some(fixtures::redis()));
    }

    #[test]
    fn outdated_only_when_known_and_different() {
        let catalog = ServiceCatalog::new();
        let current = fixtures::redis();
        assert!(!catalog.is_outdated(&current));

        catalog.insert(current.clone());
        assert!(!catalog.is_outdated(&current));

        let mut latest = current.clone();
        latest.version = "1.1.0".to_string();
        catalog.insert(latest);
        assert!(catalog.is_outdated(&current));
    }
}
