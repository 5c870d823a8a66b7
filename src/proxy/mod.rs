//! Host-based reverse proxy.
//!
//! [`RedirectTable`] maps a request host to an upstream URL; [`ProxyRouter`]
//! forwards requests according to it and [`ProxyServer`] exposes the router on
//! a socket.

mod server;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::validation::validate_host;

pub use server::{ProxyRouter, ProxyServer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub id: Uuid,
    /// Host (optionally `host:port`) the redirect answers for.
    pub source: String,
    /// Upstream base URL.
    pub target: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RedirectFile {
    #[serde(default)]
    redirects: Vec<Redirect>,
}

#[derive(Debug, Default)]
pub struct RedirectTable {
    redirects: RwLock<BTreeMap<Uuid, Redirect>>,
    path: Option<PathBuf>,
}

impl RedirectTable {
    /// In-memory table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table persisted to `path`; existing redirects are loaded from it.
    pub fn load(path: &Path) -> Result<Self> {
        let redirects = if path.exists() {
            let content = fs::read_to_string(path)?;
            let file: RedirectFile = toml::from_str(&content)?;
            file.redirects.into_iter().map(|r| (r.id, r)).collect()
        } else {
            BTreeMap::new()
        };

        log::info!("Loaded {} redirect(s) from {:?}", redirects.len(), path);
        Ok(Self {
            redirects: RwLock::new(redirects),
            path: Some(path.to_path_buf()),
        })
    }

    fn persist(&self, redirects: &BTreeMap<Uuid, Redirect>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = RedirectFile {
            redirects: redirects.values().cloned().collect(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn get_redirects(&self) -> Vec<Redirect> {
        let redirects = self.redirects.read().unwrap_or_else(|e| e.into_inner());
        redirects.values().cloned().collect()
    }

    pub fn add_redirect(&self, source: &str, target: &str) -> Result<Uuid> {
        let source = source.trim().to_ascii_lowercase();
        validate_host(&source)?;
        validate_target(target)?;

        let mut redirects = self.redirects.write().unwrap_or_else(|e| e.into_inner());
        if redirects.values().any(|r| r.source == source) {
            return Err(AppError::already_exists("redirect", &source));
        }

        let redirect = Redirect {
            id: Uuid::new_v4(),
            source,
            target: target.to_string(),
        };
        let id = redirect.id;
        log::info!("Redirect {} -> {} added", redirect.source, redirect.target);
        redirects.insert(id, redirect);

        if let Err(e) = self.persist(&redirects) {
            redirects.remove(&id);
            return Err(e);
        }
        drop(redirects);
        Ok(id)
    }

    pub fn remove_redirect(&self, id: Uuid) -> Result<Redirect> {
        let mut redirects = self.redirects.write().unwrap_or_else(|e| e.into_inner());
        let removed = redirects
            .remove(&id)
            .ok_or_else(|| AppError::not_found("redirect", &id.to_string()))?;
        if let Err(e) = self.persist(&redirects) {
            redirects.insert(id, removed);
            return Err(e);
        }
        drop(redirects);
        log::info!("Redirect {} removed", removed.source);
        Ok(removed)
    }

    /// Exact match first, then the host without its port.
    pub fn get_redirect_by_host(&self, host: &str) -> Option<Redirect> {
        let host = host.trim().to_ascii_lowercase();
        let redirects = self.redirects.read().unwrap_or_else(|e| e.into_inner());

        let find = |h: &str| redirects.values().find(|r| r.source == h).cloned();
        find(&host).or_else(|| {
            let (bare, port) = host.rsplit_once(':')?;
            if port.chars().all(|c| c.is_ascii_digit()) {
                find(bare)
            } else {
                None
            }
        })
    }
}

fn validate_target(target: &str) -> Result<()> {
    let url = Url::parse(target)
        .map_err(|e| AppError::config(format!("Invalid redirect target {:?}: {}", target, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(AppError::config(format!(
            "Redirect target must be an http(s) URL: {:?}",
            target
        )));
    }
    Ok(())
}
