//! Instance management.
//!
//! [`InstanceService`] owns the lifecycle of every instance: it keeps the
//! [`InstanceRegistry`] in sync with the [`InstanceStore`], drives the
//! [`ContainerRunner`] and publishes every state change on the [`EventBus`].
//!
//! State machine:
//!
//! ```text
//! Off -> Building -> Off            (update / rebuild)
//! Off | Error -> Starting -> Running -> Off
//! Building | Starting | Running -> Error   (runner failure)
//! ```

mod crud;
mod lifecycle;
pub mod probe;
mod registry;
mod types;
mod update;
pub mod wiring;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{Event, EventBus};
use crate::error::Result;
use crate::runner::{ContainerRunner, LogSink};
use crate::service::ServiceCatalog;
use crate::storage::InstanceStore;

pub use probe::{ConnectivityProbe, HttpProbe};
pub use registry::{InstanceEntry, InstanceQuery, InstanceRegistry};
pub use types::{
    Instance, InstanceSettings, InstanceStatus, SettingsPatch, SkipReason, UpdateCheck,
    UpdateOutcome,
};

pub struct InstanceService {
    registry: Arc<InstanceRegistry>,
    bus: Arc<EventBus>,
    store: Arc<dyn InstanceStore>,
    runner: Arc<dyn ContainerRunner>,
    catalog: Arc<ServiceCatalog>,
    probe: Arc<dyn ConnectivityProbe>,
    /// Host written into wired consumers.
    host: String,
    supported_versions: semver::VersionReq,
}

impl InstanceService {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn InstanceStore>,
        runner: Arc<dyn ContainerRunner>,
        catalog: Arc<ServiceCatalog>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            registry: Arc::new(InstanceRegistry::new()),
            bus,
            store,
            runner,
            catalog,
            probe,
            host: "127.0.0.1".to_string(),
            supported_versions: semver::VersionReq::STAR,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_supported_versions(mut self, req: semver::VersionReq) -> Self {
        self.supported_versions = req;
        self
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn emit(&self, event: Event) {
        self.bus.dispatch(&event);
    }

    fn set_status(&self, entry: &InstanceEntry, status: InstanceStatus) {
        transition(&self.bus, entry, status);
    }

    fn entry(&self, id: &str) -> Result<Arc<InstanceEntry>> {
        self.registry.get(id)
    }

    /// A sink whose payloads are published as `Log` events of `instance_id`.
    fn log_sink(&self, instance_id: &str) -> (LogSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = Arc::clone(&self.bus);
        let id = instance_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                bus.dispatch(&Event::log(&id, payload));
            }
        });
        (tx, task)
    }
}

fn transition(bus: &EventBus, entry: &InstanceEntry, status: InstanceStatus) {
    entry.set_status(status);
    log::debug!("Instance {} is now {}", entry.id(), status);
    bus.dispatch(&Event::status_changed(entry.id(), status));
}
