//! Application error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Core error, serializable for whatever transport binding sits on top.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Instance, redirect, provider or dependency not found
    NotFound,
    /// Instance is already running
    AlreadyRunning,
    /// Instance is not running
    NotRunning,
    /// Instance is still running (or busy building/starting)
    StillRunning,
    /// Entity with the same key already exists
    AlreadyExists,
    /// The descriptor does not offer the requested install method
    InstallMethodUnsupported,
    /// Log buffer has no entries
    BufferEmpty,
    /// The container backing an instance does not exist
    ContainerNotFound,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Container runner error
    Runner,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::NotFound => 1001,
            Self::AlreadyRunning => 1002,
            Self::NotRunning => 1003,
            Self::StillRunning => 1004,
            Self::AlreadyExists => 1005,
            Self::InstallMethodUnsupported => 1006,
            Self::BufferEmpty => 1007,
            Self::ContainerNotFound => 1008,
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Network => 2003,
            Self::Runner => 3001,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    /// `what` names the entity ("instance", "redirect", ...), `id` its key.
    pub fn not_found(what: &str, id: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            HashMap::from([
                ("what".to_string(), what.to_string()),
                ("id".to_string(), id.to_string()),
            ]),
        )
    }

    pub fn instance_not_found(id: &str) -> Self {
        Self::not_found("instance", id)
    }

    pub fn already_running(id: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyRunning,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn not_running(id: &str) -> Self {
        Self::new(
            ErrorKind::NotRunning,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn still_running(id: &str) -> Self {
        Self::new(
            ErrorKind::StillRunning,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn already_exists(what: &str, key: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyExists,
            HashMap::from([
                ("what".to_string(), what.to_string()),
                ("key".to_string(), key.to_string()),
            ]),
        )
    }

    pub fn install_method_unsupported(service_id: &str, method: &str) -> Self {
        Self::new(
            ErrorKind::InstallMethodUnsupported,
            HashMap::from([
                ("service".to_string(), service_id.to_string()),
                ("method".to_string(), method.to_string()),
            ]),
        )
    }

    pub fn buffer_empty(id: &str) -> Self {
        Self::new(
            ErrorKind::BufferEmpty,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn container_not_found(name: &str) -> Self {
        Self::new(
            ErrorKind::ContainerNotFound,
            HashMap::from([("container".to_string(), name.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network,
            HashMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn runner(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Runner, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &HashMap<String, String> {
        &self.payload
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<semver::Error> for AppError {
    fn from(err: semver::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
