//! Domain events published on the [`EventBus`](super::EventBus).

use serde::{Deserialize, Serialize};

use crate::instance::InstanceStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    InstanceCreated { instance_id: String },
    InstanceLoaded { instance_id: String },
    InstanceDeleted { instance_id: String },
    StatusChanged {
        instance_id: String,
        status: InstanceStatus,
    },
    /// Something in the instance list changed (env, settings, dependencies, ...).
    InstancesChanged,
    InstancesLoaded { count: usize },
    Log {
        instance_id: String,
        payload: LogPayload,
    },
}

impl Event {
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::InstanceCreated { instance_id }
            | Self::InstanceLoaded { instance_id }
            | Self::InstanceDeleted { instance_id }
            | Self::StatusChanged { instance_id, .. }
            | Self::Log { instance_id, .. } => Some(instance_id),
            Self::InstancesChanged | Self::InstancesLoaded { .. } => None,
        }
    }

    pub fn log(instance_id: &str, payload: LogPayload) -> Self {
        Self::Log {
            instance_id: instance_id.to_string(),
            payload,
        }
    }

    pub fn status_changed(instance_id: &str, status: InstanceStatus) -> Self {
        Self::StatusChanged {
            instance_id: instance_id.to_string(),
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Stdout,
    Stderr,
    DownloadProgress,
    Downloads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LogPayload {
    Stdout(String),
    Stderr(String),
    DownloadProgress(DownloadProgress),
    /// Aggregated progress of several concurrent downloads.
    Downloads(Vec<DownloadProgress>),
}

impl LogPayload {
    pub fn kind(&self) -> LogKind {
        match self {
            Self::Stdout(_) => LogKind::Stdout,
            Self::Stderr(_) => LogKind::Stderr,
            Self::DownloadProgress(_) => LogKind::DownloadProgress,
            Self::Downloads(_) => LogKind::Downloads,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Layer or file identifier.
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}
