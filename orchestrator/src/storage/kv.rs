//! Key/value settings store
//!
//! Secrets and operator preferences the orchestrator consults at run time:
//! cloud API token, SSH key pair, notification defaults and mail credentials.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::filesys::file::File;

pub const CLOUD_API_TOKEN: &str = "cloud_api_token";
pub const SSH_PRIVATE_KEY: &str = "ssh_private_key";
pub const SSH_PUBLIC_KEY: &str = "ssh_public_key";
pub const NOTIFICATION_EMAIL: &str = "notification_email";
pub const MAIL_API_KEY: &str = "mail_api_key";
pub const MAIL_DOMAIN: &str = "mail_domain";
pub const MAIL_FROM: &str = "mail_from";

/// Settings store trait for testability
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value; blank values read as absent
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError>;

    /// Write a value
    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError>;
}

/// Settings store backed by a JSON object on disk
pub struct JsonKvStore {
    file: File,
    values: RwLock<BTreeMap<String, String>>,
    write_lock: Mutex<()>,
}

impl JsonKvStore {
    /// Load the store, starting empty when the file does not exist
    pub async fn open(file: File) -> Result<Self, OrchestratorError> {
        let values: BTreeMap<String, String> = file.read_json_or_default().await.map_err(|e| {
            OrchestratorError::Storage(format!(
                "failed to read settings store {}: {}",
                file.path().display(),
                e
            ))
        })?;
        debug!("Loaded {} settings from {}", values.len(), file.path().display());

        Ok(Self {
            file,
            values: RwLock::new(values),
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl KeyValueStore for JsonKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(non_blank(values.get(key)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
            values.insert(key.to_string(), value.to_string());
            values.clone()
        };
        self.file.write_json(&snapshot).await?;
        self.file.set_permissions_600().await
    }
}

/// In-memory settings store
#[derive(Default)]
pub struct MemoryKvStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(non_blank(values.get(key)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
