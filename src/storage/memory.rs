use std::collections::BTreeMap;
use std::sync::RwLock;

use super::InstanceStore;
use crate::error::{AppError, Result};
use crate::instance::InstanceSettings;
use crate::service::ServiceDescriptor;

#[derive(Debug, Clone, Default)]
struct Stored {
    descriptor: Option<ServiceDescriptor>,
    settings: Option<InstanceSettings>,
    env: BTreeMap<String, String>,
}

/// Volatile store; state lives as long as the value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: RwLock<BTreeMap<String, Stored>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_instance<R>(&self, instance_id: &str, f: impl FnOnce(&mut Stored) -> R) -> Result<R> {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        instances
            .get_mut(instance_id)
            .map(f)
            .ok_or_else(|| AppError::instance_not_found(instance_id))
    }
}

impl InstanceStore for MemoryStore {
    fn create_dir(&self, instance_id: &str) -> Result<()> {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        instances.entry(instance_id.to_string()).or_default();
        drop(instances);
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        Ok(instances.keys().cloned().collect())
    }

    fn delete(&self, instance_id: &str) -> Result<()> {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        instances.remove(instance_id);
        drop(instances);
        Ok(())
    }

    fn load_descriptor(&self, instance_id: &str) -> Result<ServiceDescriptor> {
        self.with_instance(instance_id, |s| s.descriptor.clone())?
            .ok_or_else(|| AppError::not_found("service descriptor", instance_id))
    }

    fn save_descriptor(&self, instance_id: &str, service: &ServiceDescriptor) -> Result<()> {
        self.with_instance(instance_id, |s| s.descriptor = Some(service.clone()))
    }

    fn load_settings(&self, instance_id: &str) -> Result<InstanceSettings> {
        self.with_instance(instance_id, |s| s.settings.clone().unwrap_or_default())
    }

    fn save_settings(&self, instance_id: &str, settings: &InstanceSettings) -> Result<()> {
        self.with_instance(instance_id, |s| s.settings = Some(settings.clone()))
    }

    fn load_env(&self, instance_id: &str) -> Result<BTreeMap<String, String>> {
        self.with_instance(instance_id, |s| s.env.clone())
    }

    fn save_env(&self, instance_id: &str, env: &BTreeMap<String, String>) -> Result<()> {
        self.with_instance(instance_id, |s| s.env = env.clone())
    }
}
