//! Persisted SSH key pair
//!
//! Guarantees a usable key pair sits in the settings store before a VM is
//! created. Failures to derive a public key are soft: the job proceeds and
//! fails later when SSH authentication is attempted.

use secrecy::SecretString;
use tracing::{info, warn};

use crate::errors::OrchestratorError;
use crate::keys::openssh::{self, Ed25519KeyPair};
use crate::keys::KeyError;
use crate::storage::kv::{KeyValueStore, SSH_PRIVATE_KEY, SSH_PUBLIC_KEY};

pub const KEY_COMMENT: &str = "optimizerd";

/// What `ensure_key_pair` found and did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPairStatus {
    /// Both halves were already stored
    Present,
    /// Public key derived from the stored private key
    DerivedPublic,
    /// Only a public key is stored; VMs trusting it cannot be reached
    PublicOnly,
    /// A fresh pair was generated and stored
    Generated,
    /// The stored private key could not be used to derive a public key
    DeriveFailed(String),
}

impl KeyPairStatus {
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            KeyPairStatus::Present | KeyPairStatus::DerivedPublic | KeyPairStatus::Generated
        )
    }
}

/// Make sure a private key and its public half are in the settings store
pub async fn ensure_key_pair(kv: &dyn KeyValueStore) -> Result<KeyPairStatus, OrchestratorError> {
    let private = kv.get(SSH_PRIVATE_KEY).await?;
    let public = kv.get(SSH_PUBLIC_KEY).await?;

    match (private, public) {
        (Some(_), Some(_)) => Ok(KeyPairStatus::Present),
        (Some(private), None) => match openssh::derive_public_key(&private, KEY_COMMENT) {
            Ok(line) => {
                kv.set(SSH_PUBLIC_KEY, &line).await?;
                info!(
                    "Derived SSH public key from stored private key ({})",
                    openssh::fingerprint(&line).unwrap_or_default()
                );
                Ok(KeyPairStatus::DerivedPublic)
            }
            Err(e) => {
                warn!("Could not derive SSH public key from stored private key: {}", e);
                Ok(KeyPairStatus::DeriveFailed(e.to_string()))
            }
        },
        (None, Some(_)) => {
            warn!("Only an SSH public key is stored; remote jobs will fail to connect until a private key is added");
            Ok(KeyPairStatus::PublicOnly)
        }
        (None, None) => {
            let pair = Ed25519KeyPair::generate();
            let line = pair.public_key_line(KEY_COMMENT);
            kv.set(SSH_PRIVATE_KEY, &pair.private_key_pem(KEY_COMMENT)).await?;
            kv.set(SSH_PUBLIC_KEY, &line).await?;
            info!(
                "Generated new SSH key pair ({})",
                openssh::fingerprint(&line).unwrap_or_default()
            );
            Ok(KeyPairStatus::Generated)
        }
    }
}

/// Stored private key, wrapped for the lifetime of a run
pub async fn load_private_key(kv: &dyn KeyValueStore) -> Result<SecretString, OrchestratorError> {
    kv.get(SSH_PRIVATE_KEY)
        .await?
        .map(SecretString::from)
        .ok_or_else(|| KeyError::MissingPrivateKey.into())
}

/// Stored public key line, if any
pub async fn load_public_key(kv: &dyn KeyValueStore) -> Result<Option<String>, OrchestratorError> {
    kv.get(SSH_PUBLIC_KEY).await
}
