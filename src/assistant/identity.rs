//! Persisted device identity used to derive session identifiers

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Stable identifier of this endpoint
pub trait SessionIdentity: Send + Sync {
    fn device_id(&self) -> &str;
}

/// Identity stored as a UUID in a file, created on first use
#[derive(Debug, Clone)]
pub struct FileIdentity {
    id: String,
    path: PathBuf,
}

impl FileIdentity {
    /// Load the identity at `path`, generating and saving one if missing
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or written
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let id = std::fs::read_to_string(path)?.trim().to_string();
            if !id.is_empty() {
                tracing::debug!(path = %path.display(), "loaded device identity");
                return Ok(Self {
                    id,
                    path: path.to_path_buf(),
                });
            }
            tracing::warn!(path = %path.display(), "identity file empty, regenerating");
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let id = uuid::Uuid::new_v4().to_string();
        std::fs::write(path, &id)?;
        tracing::info!(path = %path.display(), "created device identity");

        Ok(Self {
            id,
            path: path.to_path_buf(),
        })
    }

    /// Load the identity from its default location
    ///
    /// # Errors
    ///
    /// Returns error if no data directory is known or the file is unusable
    pub fn load_default() -> Result<Self> {
        let path = default_identity_path()
            .ok_or_else(|| Error::Config("no data directory for device identity".to_string()))?;
        Self::load_or_create(&path)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionIdentity for FileIdentity {
    fn device_id(&self) -> &str {
        &self.id
    }
}

/// Fixed identity
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

impl SessionIdentity for StaticIdentity {
    fn device_id(&self) -> &str {
        &self.0
    }
}

/// Return the identity path: `~/.local/share/omni/beacon/session_id`
#[must_use]
pub fn default_identity_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.data_dir()
            .join("omni")
            .join("beacon")
            .join("session_id")
    })
}
