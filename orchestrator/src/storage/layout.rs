//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the orchestrator's local state
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Service configuration
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("config.json"))
    }

    /// Key/value settings store (tokens, SSH keys, mail credentials)
    pub fn kv_file(&self) -> File {
        File::new(self.base_dir.join("kv.json"))
    }

    /// Durable job records
    pub fn jobs_file(&self) -> File {
        File::new(self.base_dir.join("jobs.json"))
    }

    /// Per-job scratch files (archives, launcher scripts)
    pub fn temp_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("tmp"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), OrchestratorError> {
        Dir::new(&self.base_dir).create().await?;
        self.temp_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/optimizerd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".optimizerd");

        Self::new(base_dir)
    }
}
