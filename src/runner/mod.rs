//! Container runner: the boundary to the container engine.

mod docker;
mod progress;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::bus::LogPayload;
use crate::error::Result;
use crate::instance::Instance;
use crate::service::ServiceDescriptor;

pub use docker::DockerRunner;
pub use progress::parse_pull_line;

/// Where a runner reports build/pull output while installing.
pub type LogSink = mpsc::UnboundedSender<LogPayload>;

pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Live output of a started container. Either stream may be absent.
#[derive(Default)]
pub struct ContainerOutput {
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

impl fmt::Debug for ContainerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerOutput")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Returns as soon as the container is not running (immediately if it already is not).
    NotRunning,
    /// Waits for the next exit of the container.
    NextExit,
    /// Waits until the container has been removed.
    Removed,
}

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Build or pull whatever the instance needs to run.
    async fn install(
        &self,
        instance_id: &str,
        service: &ServiceDescriptor,
        sink: LogSink,
    ) -> Result<()>;

    async fn start(&self, instance: &Instance) -> Result<ContainerOutput>;

    async fn stop(&self, instance: &Instance) -> Result<()>;

    /// Fails with `ContainerNotFound` if there is nothing to delete.
    async fn delete(&self, instance: &Instance) -> Result<()>;

    async fn info(&self, instance: &Instance) -> Result<ContainerInfo>;

    async fn wait_condition(&self, instance: &Instance, condition: WaitCondition) -> Result<()>;

    /// Whether a newer image than the installed one is available.
    async fn check_for_updates(&self, instance: &Instance) -> Result<bool>;

    async fn get_all_versions(&self, instance: &Instance) -> Result<Vec<String>>;
}
