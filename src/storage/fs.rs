use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{env_file, InstanceStore};
use crate::error::{AppError, Result};
use crate::instance::InstanceSettings;
use crate::paths::DataPaths;
use crate::service::ServiceDescriptor;
use crate::validation::validate_instance_id;

/// Instance state on disk:
///
/// ```text
/// <data>/instances/<id>/.vertex/service.json
/// <data>/instances/<id>/.vertex/settings.toml
/// <data>/instances/<id>/.env
/// ```
#[derive(Debug, Clone)]
pub struct FsInstanceStore {
    paths: DataPaths,
}

impl FsInstanceStore {
    pub fn new(paths: DataPaths) -> Self {
        Self { paths }
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    fs::write(path, content)
        .map_err(|e| AppError::io(format!("Failed to write {}: {}", path.display(), e)))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::io(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

impl InstanceStore for FsInstanceStore {
    fn create_dir(&self, instance_id: &str) -> Result<()> {
        validate_instance_id(instance_id)?;
        let dir = self.paths.instance_meta_dir(instance_id);
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::io(format!("Failed to create instance dir: {}", e)))
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let dir = self.paths.instances_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_instance_id(&name).is_ok() {
                ids.push(name);
            } else {
                log::debug!("Ignoring non-instance directory {:?}", entry.path());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, instance_id: &str) -> Result<()> {
        validate_instance_id(instance_id)?;
        let dir = self.paths.instance_dir(instance_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| {
                AppError::io(format!("Failed to remove {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    fn load_descriptor(&self, instance_id: &str) -> Result<ServiceDescriptor> {
        validate_instance_id(instance_id)?;
        let path = self.paths.descriptor_path(instance_id);
        let content = read_optional(&path)?
            .ok_or_else(|| AppError::not_found("service descriptor", instance_id))?;
        Ok(serde_json::from_str(content.trim_start_matches('\u{feff}'))?)
    }

    fn save_descriptor(&self, instance_id: &str, service: &ServiceDescriptor) -> Result<()> {
        validate_instance_id(instance_id)?;
        let content = serde_json::to_string_pretty(service)?;
        write_file(&self.paths.descriptor_path(instance_id), &content)
    }

    fn load_settings(&self, instance_id: &str) -> Result<InstanceSettings> {
        validate_instance_id(instance_id)?;
        match read_optional(&self.paths.settings_path(instance_id))? {
            Some(content) => Ok(toml::from_str(&content)?),
            None => Ok(InstanceSettings::default()),
        }
    }

    fn save_settings(&self, instance_id: &str, settings: &InstanceSettings) -> Result<()> {
        validate_instance_id(instance_id)?;
        let content = toml::to_string_pretty(settings)?;
        write_file(&self.paths.settings_path(instance_id), &content)
    }

    fn load_env(&self, instance_id: &str) -> Result<BTreeMap<String, String>> {
        validate_instance_id(instance_id)?;
        Ok(read_optional(&self.paths.env_path(instance_id))?
            .map(|content| env_file::parse(&content))
            .unwrap_or_default())
    }

    fn save_env(&self, instance_id: &str, env: &BTreeMap<String, String>) -> Result<()> {
        validate_instance_id(instance_id)?;
        write_file(&self.paths.env_path(instance_id), &env_file::render(env))
    }
}
