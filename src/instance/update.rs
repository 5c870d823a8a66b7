use semver::Version;

use super::types::{InstanceStatus, SkipReason, UpdateCheck, UpdateOutcome};
use super::InstanceService;
use crate::bus::Event;
use crate::error::{AppError, Result};
use crate::service::ServiceDescriptor;

impl InstanceService {
    /// Rebuild the instance from `latest`.
    ///
    /// Unchanged or unsupported descriptors are skipped, not rejected.
    pub async fn update(&self, id: &str, latest: ServiceDescriptor) -> Result<UpdateOutcome> {
        let entry = self.entry(id)?;
        let _guard = entry.lock_transition().await?;

        let instance = entry.snapshot();
        if instance.status.is_active() {
            return Err(AppError::still_running(id));
        }

        if instance.service == latest {
            log::info!("Instance {} is already on the latest descriptor", id);
            return Ok(UpdateOutcome::Skipped(SkipReason::AlreadyLatest));
        }

        let supported = Version::parse(&latest.version)
            .map(|v| self.supported_versions.matches(&v))
            .unwrap_or(false);
        if !supported {
            log::warn!(
                "Skipping update of instance {}: version {} is not supported",
                id,
                latest.version
            );
            return Ok(UpdateOutcome::Skipped(SkipReason::UnsupportedVersion));
        }

        log::info!(
            "Updating instance {} from {} to {}",
            id,
            instance.service.version,
            latest.version
        );
        self.set_status(&entry, InstanceStatus::Building);

        let mut env = instance.env;
        for (name, value) in latest.default_env() {
            env.entry(name).or_insert(value);
        }

        let (sink, _forwarder) = self.log_sink(id);
        let installed = match self.runner.install(id, &latest, sink).await {
            Ok(()) => self
                .store
                .save_env(id, &env)
                .and_then(|()| self.store.save_descriptor(id, &latest)),
            Err(e) => Err(e),
        };
        if let Err(e) = installed {
            log::error!("Update of instance {} failed: {}", id, e);
            self.set_status(&entry, InstanceStatus::Error);
            return Err(e);
        }

        entry.update(|i| {
            i.env = env;
            i.service = latest;
            i.update_available = false;
        });

        self.set_status(&entry, InstanceStatus::Off);
        self.emit(Event::InstancesChanged);
        Ok(UpdateOutcome::Updated)
    }

    /// Update to the catalog's descriptor for the instance's service.
    pub async fn update_to_latest(&self, id: &str) -> Result<UpdateOutcome> {
        let service_id = self.get(id)?.service.id;
        let latest = self
            .catalog
            .get(&service_id)
            .ok_or_else(|| AppError::not_found("service", &service_id))?;
        self.update(id, latest).await
    }

    /// Refresh `update_available` on every instance.
    pub async fn check_for_updates(&self) -> UpdateCheck {
        let mut error = None;

        for entry in self.registry.get_all() {
            let instance = entry.snapshot();
            let outdated = self.catalog.is_outdated(&instance.service);
            let newer_image = match self.runner.check_for_updates(&instance).await {
                Ok(newer) => newer,
                Err(e) => {
                    log::warn!("Update check for instance {} failed: {}", entry.id(), e);
                    error.get_or_insert_with(|| e.to_string());
                    false
                }
            };
            entry.update(|i| i.update_available = outdated || newer_image);
        }

        self.emit(Event::InstancesChanged);
        UpdateCheck {
            instances: self.registry.snapshot(),
            error,
        }
    }
}
