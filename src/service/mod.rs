//! Service descriptors: the static definition of an installable service.
//!
//! A descriptor declares the environment contract of the service, how it can be
//! installed, which database features it provides to other instances and which
//! database dependencies it consumes.

mod catalog;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use catalog::ServiceCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub env: Vec<EnvDefinition>,
    #[serde(default)]
    pub methods: ServiceMethods,
    #[serde(default)]
    pub features: ServiceFeatures,
    /// Database dependencies this service consumes, keyed by dependency id.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseDependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvDefinition {
    pub name: String,
    /// "port", "url", "string", ...
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMethods {
    #[serde(default)]
    pub script: Option<ScriptMethod>,
    #[serde(default)]
    pub docker: Option<DockerMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMethod {
    pub file: String,
}

/// Either a prebuilt `image` or a `dockerfile` built from `context`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerMethod {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    /// Container port → name of the env variable holding the host port.
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    /// Host path (relative to the instance dir) → container path.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    /// Container variable → name of the instance env variable providing its value.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFeatures {
    #[serde(default)]
    pub databases: Vec<DatabaseFeature>,
}

/// Provider side of a database connection: which of its env variables hold what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseFeature {
    /// "postgres", "redis", ...
    #[serde(rename = "type")]
    pub kind: String,
    pub port: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

/// Consumer side: which provider types are accepted and where to write the values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDependency {
    #[serde(default)]
    pub display_name: Option<String>,
    pub types: Vec<String>,
    pub names: DatabaseEnvNames,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEnvNames {
    pub host: String,
    pub port: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMethod {
    Script,
    Docker,
}

impl InstallMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServiceDescriptor {
    pub fn supports(&self, method: InstallMethod) -> bool {
        match method {
            InstallMethod::Script => self.methods.script.is_some(),
            InstallMethod::Docker => self.methods.docker.is_some(),
        }
    }

    /// Environment populated with every declared default.
    pub fn default_env(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter_map(|def| def.default.clone().map(|value| (def.name.clone(), value)))
            .collect()
    }

    pub fn feature_types(&self) -> impl Iterator<Item = &str> {
        self.features.databases.iter().map(|f| f.kind.as_str())
    }

    /// First provided feature matching one of the accepted types.
    pub fn database_feature(&self, accepted: &[String]) -> Option<&DatabaseFeature> {
        self.features
            .databases
            .iter()
            .find(|f| accepted.iter().any(|t| t == &f.kind))
    }
}
