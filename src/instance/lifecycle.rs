//! Start / stop of instance containers.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt as _, BufReader};

use super::registry::InstanceEntry;
use super::types::InstanceStatus;
use super::{transition, InstanceService};
use crate::bus::{Event, EventBus, LogPayload};
use crate::error::{AppError, ErrorKind, Result};
use crate::runner::{ContainerOutput, ContainerRunner, OutputStream, WaitCondition};

impl InstanceService {
    pub async fn start(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _guard = entry.lock_transition().await?;
        self.start_locked(&entry).await
    }

    async fn start_locked(&self, entry: &Arc<InstanceEntry>) -> Result<()> {
        let id = entry.id();
        if entry.status().is_active() {
            return Err(AppError::already_running(id));
        }

        log::info!("Starting instance {}", id);
        self.set_status(entry, InstanceStatus::Starting);
        let run = entry.begin_run();
        let instance = entry.snapshot();

        let output = match self.runner.start(&instance).await {
            Ok(output) => output,
            Err(e) => {
                log::error!("Failed to start instance {}: {}", id, e);
                self.set_status(entry, InstanceStatus::Error);
                return Err(e);
            }
        };

        self.set_status(entry, InstanceStatus::Running);
        self.pump_output(id, output);
        self.watch_exit(entry, run);
        log::info!("Instance {} started", id);
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _guard = entry.lock_transition().await?;
        self.stop_locked(&entry).await
    }

    async fn stop_locked(&self, entry: &InstanceEntry) -> Result<()> {
        let id = entry.id();
        if entry.status() != InstanceStatus::Running {
            return Err(AppError::not_running(id));
        }

        log::info!("Stopping instance {}", id);
        if let Err(e) = self.runner.stop(&entry.snapshot()).await {
            log::error!("Failed to stop instance {}: {}", id, e);
            self.set_status(entry, InstanceStatus::Error);
            return Err(e);
        }

        self.set_status(entry, InstanceStatus::Off);
        log::info!("Instance {} stopped", id);
        Ok(())
    }

    /// Stop the instance if it is running, then start it again.
    pub async fn restart(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _guard = entry.lock_transition().await?;
        if entry.status() == InstanceStatus::Running {
            self.stop_locked(&entry).await?;
        }
        self.start_locked(&entry).await
    }

    /// Start every instance flagged `launch_on_startup`. Returns the ids that started.
    pub async fn start_all(&self) -> Vec<String> {
        let selected: Vec<String> = self
            .registry
            .search(|i| i.settings.launch_on_startup)
            .into_iter()
            .map(|i| i.id)
            .collect();
        if selected.is_empty() {
            return Vec::new();
        }

        if !self.probe.check().await {
            log::error!(
                "Connectivity check failed, not starting {} instance(s)",
                selected.len()
            );
            return Vec::new();
        }

        let results = join_all(selected.iter().map(|id| self.start(id))).await;
        selected
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(()) => Some(id),
                Err(e) => {
                    log::error!("Auto-start of instance {} failed: {}", id, e);
                    None
                }
            })
            .collect()
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .registry
            .get_all()
            .iter()
            .map(|entry| entry.id().to_string())
            .collect();

        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotRunning => {
                    log::debug!("Instance {} was not running", id);
                }
                Err(e) => log::error!("Failed to stop instance {}: {}", id, e),
            }
        }
    }

    fn pump_output(&self, id: &str, output: ContainerOutput) {
        if let Some(stdout) = output.stdout {
            spawn_pump(Arc::clone(&self.bus), id.to_string(), stdout, LogPayload::Stdout);
        }
        if let Some(stderr) = output.stderr {
            spawn_pump(Arc::clone(&self.bus), id.to_string(), stderr, LogPayload::Stderr);
        }
    }

    /// Moves the instance to Off once its container stops on its own.
    fn watch_exit(&self, entry: &Arc<InstanceEntry>, run: u64) {
        let entry = Arc::clone(entry);
        let bus = Arc::clone(&self.bus);
        let runner: Arc<dyn ContainerRunner> = Arc::clone(&self.runner);

        tokio::spawn(async move {
            let instance = entry.snapshot();
            if let Err(e) = runner
                .wait_condition(&instance, WaitCondition::NotRunning)
                .await
            {
                log::warn!("Exit watcher for instance {} failed: {}", entry.id(), e);
                return;
            }

            let Ok(_guard) = entry.lock_transition().await else {
                return;
            };
            if entry.generation() != run || entry.status() != InstanceStatus::Running {
                return;
            }
            log::warn!("Instance {} exited", entry.id());
            transition(&bus, &entry, InstanceStatus::Off);
        });
    }
}

fn spawn_pump(
    bus: Arc<EventBus>,
    id: String,
    stream: OutputStream,
    wrap: fn(String) -> LogPayload,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => bus.dispatch(&Event::log(&id, wrap(line))),
                Ok(None) => break,
                Err(e) => {
                    log::debug!("Output of instance {} closed: {}", id, e);
                    break;
                }
            }
        }
    });
}
