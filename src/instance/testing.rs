//! In-process doubles for the runner, the store and the probe, and a wired service harness.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ConnectivityProbe, Instance, InstanceService, InstanceSettings, InstanceStatus};
use crate::bus::{DownloadProgress, Event, EventBus, Listener, LogPayload};
use crate::error::{AppError, Result};
use crate::runner::{ContainerInfo, ContainerOutput, ContainerRunner, LogSink, WaitCondition};
use crate::service::{InstallMethod, ServiceCatalog, ServiceDescriptor};
use crate::storage::{InstanceStore, MemoryStore};

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    fail_start: bool,
    fail_install: bool,
    missing_container: bool,
    outdated: BTreeSet<String>,
    /// One notifier per run; signalled when the container stops.
    running: BTreeMap<String, Arc<Notify>>,
    /// Starts wait for a permit here when set.
    gate: Option<Arc<Notify>>,
}

#[derive(Default)]
pub(crate) struct FakeRunner {
    state: Mutex<FakeState>,
}

impl FakeRunner {
    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub(crate) fn fail_start(&self, fail: bool) {
        self.with_state(|s| s.fail_start = fail);
    }

    pub(crate) fn fail_install(&self, fail: bool) {
        self.with_state(|s| s.fail_install = fail);
    }

    pub(crate) fn missing_container(&self, missing: bool) {
        self.with_state(|s| s.missing_container = missing);
    }

    pub(crate) fn update_available(&self, instance_id: &str) {
        self.with_state(|s| s.outdated.insert(instance_id.to_string()));
    }

    /// Every following start blocks until the returned notifier hands out a permit.
    pub(crate) fn hold_starts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.with_state(|s| s.gate = Some(Arc::clone(&gate)));
        gate
    }

    /// The container exits without being asked to.
    pub(crate) fn crash(&self, instance_id: &str) {
        if let Some(notify) = self.with_state(|s| s.running.remove(instance_id)) {
            notify.notify_one();
        }
    }
}

#[async_trait]
impl ContainerRunner for FakeRunner {
    async fn install(
        &self,
        instance_id: &str,
        service: &ServiceDescriptor,
        sink: LogSink,
    ) -> Result<()> {
        let fail = self.with_state(|s| {
            s.calls.push(format!("install:{}:{}", instance_id, service.version));
            s.fail_install
        });
        if fail {
            return Err(AppError::runner("image pull failed"));
        }
        let _ = sink.send(LogPayload::Stdout(format!("Pulling {}", service.id)));
        let _ = sink.send(LogPayload::DownloadProgress(DownloadProgress {
            id: "a1b2c3d4e5f6".to_string(),
            status: "Download complete".to_string(),
            current: Some(10),
            total: Some(10),
        }));
        Ok(())
    }

    async fn start(&self, instance: &Instance) -> Result<ContainerOutput> {
        let gate = self.with_state(|s| s.gate.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let fail = self.with_state(|s| {
            s.calls.push(format!("start:{}", instance.id));
            if !s.fail_start {
                s.running
                    .insert(instance.id.clone(), Arc::new(Notify::new()));
            }
            s.fail_start
        });
        if fail {
            return Err(AppError::runner("container failed to start"));
        }
        Ok(ContainerOutput {
            stdout: Some(Box::pin(Cursor::new(b"ready\n".to_vec()))),
            stderr: None,
        })
    }

    async fn stop(&self, instance: &Instance) -> Result<()> {
        let notify = self.with_state(|s| {
            s.calls.push(format!("stop:{}", instance.id));
            s.running.remove(&instance.id)
        });
        if let Some(notify) = notify {
            notify.notify_one();
        }
        Ok(())
    }

    async fn delete(&self, instance: &Instance) -> Result<()> {
        let missing = self.with_state(|s| {
            s.calls.push(format!("delete:{}", instance.id));
            s.missing_container
        });
        if missing {
            return Err(AppError::container_not_found(&instance.id));
        }
        Ok(())
    }

    async fn info(&self, instance: &Instance) -> Result<ContainerInfo> {
        let running = self.with_state(|s| s.running.contains_key(&instance.id));
        Ok(ContainerInfo {
            id: instance.id.clone(),
            running,
            ..Default::default()
        })
    }

    async fn wait_condition(&self, instance: &Instance, _condition: WaitCondition) -> Result<()> {
        let notify = self.with_state(|s| s.running.get(&instance.id).cloned());
        if let Some(notify) = notify {
            notify.notified().await;
        }
        Ok(())
    }

    async fn check_for_updates(&self, instance: &Instance) -> Result<bool> {
        Ok(self.with_state(|s| s.outdated.contains(&instance.id)))
    }

    async fn get_all_versions(&self, _instance: &Instance) -> Result<Vec<String>> {
        Ok(vec!["1.0.0".to_string(), "latest".to_string()])
    }
}

/// [`MemoryStore`] whose environment writes can be made to fail.
#[derive(Default)]
pub(crate) struct FakeStore {
    inner: MemoryStore,
    fail_env_writes: AtomicBool,
}

impl FakeStore {
    pub(crate) fn fail_env_writes(&self, fail: bool) {
        self.fail_env_writes.store(fail, Ordering::SeqCst);
    }
}

impl InstanceStore for FakeStore {
    fn create_dir(&self, instance_id: &str) -> Result<()> {
        self.inner.create_dir(instance_id)
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        self.inner.list_ids()
    }

    fn delete(&self, instance_id: &str) -> Result<()> {
        self.inner.delete(instance_id)
    }

    fn load_descriptor(&self, instance_id: &str) -> Result<ServiceDescriptor> {
        self.inner.load_descriptor(instance_id)
    }

    fn save_descriptor(&self, instance_id: &str, service: &ServiceDescriptor) -> Result<()> {
        self.inner.save_descriptor(instance_id, service)
    }

    fn load_settings(&self, instance_id: &str) -> Result<InstanceSettings> {
        self.inner.load_settings(instance_id)
    }

    fn save_settings(&self, instance_id: &str, settings: &InstanceSettings) -> Result<()> {
        self.inner.save_settings(instance_id, settings)
    }

    fn load_env(&self, instance_id: &str) -> Result<BTreeMap<String, String>> {
        self.inner.load_env(instance_id)
    }

    fn save_env(&self, instance_id: &str, env: &BTreeMap<String, String>) -> Result<()> {
        if self.fail_env_writes.load(Ordering::SeqCst) {
            return Err(AppError::io("disk full"));
        }
        self.inner.save_env(instance_id, env)
    }
}

pub(crate) struct FakeProbe(AtomicBool);

impl FakeProbe {
    pub(crate) fn new(reachable: bool) -> Self {
        Self(AtomicBool::new(reachable))
    }

    pub(crate) fn set(&self, reachable: bool) {
        self.0.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for FakeProbe {
    async fn check(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct Harness {
    pub service: InstanceService,
    pub store: Arc<FakeStore>,
    pub runner: Arc<FakeRunner>,
    pub catalog: Arc<ServiceCatalog>,
    pub probe: Arc<FakeProbe>,
    recorded: Arc<Mutex<Vec<Event>>>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_supported_versions(semver::VersionReq::STAR)
    }

    pub(crate) fn with_supported_versions(req: semver::VersionReq) -> Self {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(FakeStore::default());
        let runner = Arc::new(FakeRunner::default());
        let catalog = Arc::new(ServiceCatalog::new());
        let probe = Arc::new(FakeProbe::new(true));

        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        let listener: Arc<dyn Listener> = Arc::new(move |event: &Event| {
            sink.lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event.clone());
        });
        bus.add_listener(listener);

        let store_dyn: Arc<dyn InstanceStore> = store.clone();
        let runner_dyn: Arc<dyn ContainerRunner> = runner.clone();
        let probe_dyn: Arc<dyn ConnectivityProbe> = probe.clone();
        let service = InstanceService::new(
            bus,
            store_dyn,
            runner_dyn,
            Arc::clone(&catalog),
            probe_dyn,
        )
        .with_supported_versions(req);

        Self {
            service,
            store,
            runner,
            catalog,
            probe,
            recorded,
        }
    }

    /// Install `service` and forget the events it produced.
    pub(crate) async fn installed(&self, service: ServiceDescriptor) -> Instance {
        let method = if service.supports(InstallMethod::Docker) {
            InstallMethod::Docker
        } else {
            InstallMethod::Script
        };
        let instance = self.service.install(service, method).await.unwrap();
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        instance
    }

    fn all_events(&self) -> Vec<Event> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded events without log lines.
    pub(crate) fn events(&self) -> Vec<Event> {
        self.all_events()
            .into_iter()
            .filter(|e| !matches!(e, Event::Log { .. }))
            .collect()
    }

    pub(crate) fn statuses(&self) -> Vec<InstanceStatus> {
        self.all_events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StatusChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Poll the recorded events until `predicate` holds.
    pub(crate) async fn wait_for(&self, predicate: impl Fn(&[Event]) -> bool + Send + Sync) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !predicate(self.all_events().as_slice()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "expected event was never dispatched");
    }
}
