use std::fs;
use std::path::{Path, PathBuf};
use crate::common::error::{FaceAuthError, Result};

/// On-disk layout under the configured data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// Creates every directory the server writes to and checks that the
    /// base directory is writable.
    pub fn bootstrap(&self) -> Result<()> {
        for dir in [
            self.base_dir.clone(),
            self.users_dir(),
            self.faces_dir(),
            self.models_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| {
                FaceAuthError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        let probe = self.base_dir.join(".write_test");
        fs::write(&probe, b"test").map_err(|e| {
            FaceAuthError::Storage(format!(
                "Data directory {} is not writable: {}", self.base_dir.display(), e
            ))
        })?;
        fs::remove_file(&probe)?;

        tracing::debug!("Data directories ready under {}", self.base_dir.display());
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn users_dir(&self) -> PathBuf {
        self.base_dir.join("users")
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.base_dir.join("faces")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.base_dir.join("models")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Default registration image location, used when a user's recorded path
    /// cannot be read.
    pub fn default_registration_face(&self, username: &str) -> PathBuf {
        self.faces_dir().join(format!("{}_register.jpg", username))
    }
}
