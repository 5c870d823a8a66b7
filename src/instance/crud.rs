//! Instance install, load, query, configuration and delete.

use std::collections::BTreeMap;

use super::registry::InstanceQuery;
use super::types::{Instance, SettingsPatch};
use super::{wiring, InstanceService};
use crate::bus::Event;
use crate::error::{AppError, ErrorKind, Result};
use crate::runner::ContainerInfo;
use crate::service::{InstallMethod, ServiceDescriptor};
use crate::validation::validate_env_name;

impl InstanceService {
    pub fn get(&self, id: &str) -> Result<Instance> {
        Ok(self.entry(id)?.snapshot())
    }

    pub fn get_all(&self) -> Vec<Instance> {
        self.registry.snapshot()
    }

    pub fn search(&self, query: &InstanceQuery) -> Vec<Instance> {
        self.registry.search(|i| query.matches(i))
    }

    /// Install a new instance of `service`.
    pub async fn install(
        &self,
        service: ServiceDescriptor,
        method: InstallMethod,
    ) -> Result<Instance> {
        if !service.supports(method) {
            return Err(AppError::install_method_unsupported(
                &service.id,
                method.as_str(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        log::info!("Installing {} as instance {} ({})", service.id, id, method);
        self.store.create_dir(&id)?;

        let (sink, _forwarder) = self.log_sink(&id);
        if let Err(e) = self.runner.install(&id, &service, sink).await {
            log::error!("Install of instance {} failed: {}", id, e);
            self.discard(&id);
            return Err(e);
        }

        let instance = match self.register_installed(&id, service, method) {
            Ok(instance) => instance,
            Err(e) => {
                log::error!("Failed to register instance {}: {}", id, e);
                self.discard(&id);
                return Err(e);
            }
        };

        self.emit(Event::InstanceCreated {
            instance_id: id.clone(),
        });
        self.emit(Event::InstancesChanged);
        log::info!("Instance {} installed", id);
        Ok(instance)
    }

    fn register_installed(
        &self,
        id: &str,
        service: ServiceDescriptor,
        method: InstallMethod,
    ) -> Result<Instance> {
        self.store.save_descriptor(id, &service)?;

        let mut instance = Instance::new(id.to_string(), service);
        instance.settings.install_method = Some(method);
        instance.update_available = self.catalog.is_outdated(&instance.service);
        self.store.save_settings(id, &instance.settings)?;

        instance.env = instance.service.default_env();
        self.store.save_env(id, &instance.env)?;

        let databases = wiring::auto_resolve(&instance, &self.registry);
        if !databases.is_empty() {
            let mut wired = instance.clone();
            wired.settings.databases = databases;
            match wiring::resolve_env(&wired, &self.registry, &self.host) {
                Ok(env) => {
                    wired.env = env;
                    self.store.save_settings(id, &wired.settings)?;
                    self.store.save_env(id, &wired.env)?;
                    instance = wired;
                }
                Err(e) => {
                    log::warn!("Installing instance {} without database wiring: {}", id, e);
                }
            }
        }

        self.registry.put(instance.clone())?;
        Ok(instance)
    }

    fn discard(&self, id: &str) {
        if let Err(e) = self.store.delete(id) {
            log::warn!("Failed to clean up instance {}: {}", id, e);
        }
    }

    /// Register every persisted instance. Instances that fail to load are skipped.
    pub fn load_all(&self) -> Result<usize> {
        let mut count = 0;
        for id in self.store.list_ids()? {
            if self.registry.exists(&id) {
                continue;
            }
            match self.load_one(&id) {
                Ok(()) => {
                    count += 1;
                    self.emit(Event::InstanceLoaded { instance_id: id });
                }
                Err(e) => log::error!("Failed to load instance {}: {}", id, e),
            }
        }

        log::info!("Loaded {} instance(s)", count);
        self.emit(Event::InstancesLoaded { count });
        Ok(count)
    }

    fn load_one(&self, id: &str) -> Result<()> {
        let service = self.store.load_descriptor(id)?;
        let mut instance = Instance::new(id.to_string(), service);
        instance.settings = self.store.load_settings(id)?;
        instance.env = self.store.load_env(id)?;
        instance.update_available = self.catalog.is_outdated(&instance.service);
        self.registry.put(instance)?;
        Ok(())
    }

    /// Remove an instance that is not running, with its container and stored state.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _guard = entry.lock_transition().await?;

        let instance = entry.snapshot();
        if instance.status.is_active() {
            return Err(AppError::still_running(id));
        }

        match self.runner.delete(&instance).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::ContainerNotFound => {
                log::debug!("Instance {} had no container", id);
            }
            Err(e) => return Err(e),
        }

        self.store.delete(id)?;
        entry.mark_removed();
        self.registry.delete(id);

        log::info!("Instance {} deleted", id);
        self.emit(Event::InstanceDeleted {
            instance_id: id.to_string(),
        });
        self.emit(Event::InstancesChanged);
        Ok(())
    }

    /// Replace the dependency map and re-wire the environment.
    pub async fn set_databases(
        &self,
        id: &str,
        databases: BTreeMap<String, String>,
    ) -> Result<Instance> {
        let entry = self.entry(id)?;
        let _guard = entry.lock_transition().await?;

        for provider_id in databases.values() {
            if provider_id != id && !self.registry.exists(provider_id) {
                return Err(AppError::instance_not_found(provider_id));
            }
        }

        let mut instance = entry.snapshot();
        instance.settings.databases = databases;
        let env = wiring::resolve_env(&instance, &self.registry, &self.host)?;

        self.store.save_settings(id, &instance.settings)?;
        self.store.save_env(id, &env)?;
        let instance = entry.update(|i| {
            i.settings.databases = instance.settings.databases;
            i.env = env;
            i.clone()
        });

        self.emit(Event::InstancesChanged);
        Ok(instance)
    }

    /// Replace the environment. Takes effect on the next start.
    pub async fn set_env(&self, id: &str, env: BTreeMap<String, String>) -> Result<Instance> {
        for name in env.keys() {
            validate_env_name(name)?;
        }

        let entry = self.entry(id)?;
        let _guard = entry.lock_transition().await?;

        self.store.save_env(id, &env)?;
        let instance = entry.update(|i| {
            i.env = env;
            i.clone()
        });

        self.emit(Event::InstancesChanged);
        Ok(instance)
    }

    pub async fn patch_settings(&self, id: &str, patch: SettingsPatch) -> Result<Instance> {
        let entry = self.entry(id)?;
        let _guard = entry.lock_transition().await?;

        let mut settings = entry.snapshot().settings;
        settings.apply(patch);
        self.store.save_settings(id, &settings)?;
        let instance = entry.update(|i| {
            i.settings = settings;
            i.clone()
        });

        self.emit(Event::InstancesChanged);
        Ok(instance)
    }

    /// Image versions the runner can offer for the instance.
    pub async fn versions(&self, id: &str) -> Result<Vec<String>> {
        let instance = self.get(id)?;
        self.runner.get_all_versions(&instance).await
    }

    pub async fn info(&self, id: &str) -> Result<ContainerInfo> {
        let instance = self.get(id)?;
        self.runner.info(&instance).await
    }
}
