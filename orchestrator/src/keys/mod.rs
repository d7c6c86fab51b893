//! SSH key material: encoding, derivation and the persisted key pair

pub mod openssh;
pub mod provider;
pub mod wire;

use thiserror::Error;

use crate::errors::OrchestratorError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("malformed key: {0}")]
    Malformed(String),

    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("encrypted private keys are not supported")]
    Encrypted,

    #[error("no SSH private key is configured")]
    MissingPrivateKey,
}

impl From<KeyError> for OrchestratorError {
    fn from(err: KeyError) -> Self {
        OrchestratorError::Key(err.to_string())
    }
}
