//! Instance-related type definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::service::{InstallMethod, ServiceDescriptor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Off,
    Building,
    Starting,
    Running,
    Error,
}

impl InstanceStatus {
    /// Building, starting or running: the container must not be removed or rebuilt.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Building | Self::Starting | Self::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Building => "building",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// User-controlled settings, persisted per instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSettings {
    #[serde(default)]
    pub launch_on_startup: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub install_method: Option<InstallMethod>,
    /// Image tag to run. `None` means the descriptor's default.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Dependency id → provider instance id.
    #[serde(default)]
    pub databases: BTreeMap<String, String>,
}

/// Partial settings update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub launch_on_startup: Option<bool>,
    pub display_name: Option<String>,
    pub version: Option<String>,
    pub tags: Option<BTreeSet<String>>,
}

impl InstanceSettings {
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(launch) = patch.launch_on_startup {
            self.launch_on_startup = launch;
        }
        if let Some(name) = patch.display_name {
            self.display_name = (!name.trim().is_empty()).then_some(name);
        }
        if let Some(version) = patch.version {
            self.version = (!version.trim().is_empty()).then_some(version);
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub service: ServiceDescriptor,
    pub status: InstanceStatus,
    pub env: BTreeMap<String, String>,
    pub settings: InstanceSettings,
    pub update_available: bool,
}

impl Instance {
    pub fn new(id: String, service: ServiceDescriptor) -> Self {
        Self {
            id,
            service,
            status: InstanceStatus::Off,
            env: BTreeMap::new(),
            settings: InstanceSettings::default(),
            update_available: false,
        }
    }

    pub fn display_name(&self) -> &str {
        self.settings
            .display_name
            .as_deref()
            .unwrap_or(&self.service.name)
    }

    pub fn databases(&self) -> &BTreeMap<String, String> {
        &self.settings.databases
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.settings.tags.contains(tag)
    }

    pub fn provides(&self, feature: &str) -> bool {
        self.service.feature_types().any(|t| t == feature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyLatest,
    UnsupportedVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Updated,
    Skipped(SkipReason),
}

/// Result of a batch update check. `error` carries the first failure encountered.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateCheck {
    pub instances: Vec<Instance>,
    pub error: Option<String>,
}
