//! Persisted host directory.
//!
//! Known hosts keyed by `"ip:port"`, written through to a JSON file so
//! saved hosts survive restarts. A missing or corrupt file yields a fresh
//! directory rather than an error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// One saved host entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedHost {
    /// Host address
    pub ip: IpAddr,
    /// Host tunnel port
    pub port: u16,
    /// Shared passphrase for that host
    pub passphrase: String,
}

/// Persisted `"ip:port" -> host` map
pub struct HostDirectory {
    path: PathBuf,
    hosts: Mutex<HashMap<String, SavedHost>>,
}

impl HostDirectory {
    /// Load the directory at `path`, tolerating a missing or corrupt file
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let hosts = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(hosts) => hosts,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "host directory corrupt, starting fresh: {e}");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "host directory unreadable, starting fresh: {e}");
                HashMap::new()
            }
        };

        Self {
            path,
            hosts: Mutex::new(hosts),
        }
    }

    /// Directory key for a host
    #[must_use]
    pub fn key(ip: IpAddr, port: u16) -> String {
        format!("{ip}:{port}")
    }

    /// Save or update a host and write the file through
    pub fn add(&self, ip: IpAddr, port: u16, passphrase: impl Into<String>) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts.insert(
            Self::key(ip, port),
            SavedHost {
                ip,
                port,
                passphrase: passphrase.into(),
            },
        );
        self.persist(&hosts);
    }

    /// Remove a host and write the file through. Unknown hosts are a no-op.
    pub fn remove(&self, ip: IpAddr, port: u16) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        if hosts.remove(&Self::key(ip, port)).is_some() {
            self.persist(&hosts);
        }
    }

    /// Look up one saved host
    #[must_use]
    pub fn get(&self, ip: IpAddr, port: u16) -> Option<SavedHost> {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(ip, port))
            .cloned()
    }

    /// Snapshot of all saved hosts
    #[must_use]
    pub fn hosts(&self) -> Vec<SavedHost> {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The file this directory persists to
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, hosts: &HashMap<String, SavedHost>) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = serde_json::to_vec_pretty(hosts)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&self.path, body)
        };
        if let Err(e) = write() {
            tracing::warn!(path = %self.path.display(), "failed to persist host directory: {e}");
        }
    }
}
