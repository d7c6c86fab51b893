//! Cloud provisioning client

pub mod cloud_init;
pub mod hetzner;
pub mod models;
pub mod naming;

use async_trait::async_trait;

use crate::errors::OrchestratorError;
use models::{CreateServerRequest, DeleteOutcome, ServerId, ServerInfo, ServerLookup};

/// Control-plane operations the orchestrator needs
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Request a new VM; returns it as first reported (usually without an IP)
    async fn create_server(
        &self,
        request: &CreateServerRequest,
    ) -> Result<ServerInfo, OrchestratorError>;

    /// Current state of a VM, `Missing` when the vendor no longer knows it
    async fn get_server(&self, id: ServerId) -> Result<ServerLookup, OrchestratorError>;

    /// Delete a VM; an unknown id is `Missing`, not an error
    async fn delete_server(&self, id: ServerId) -> Result<DeleteOutcome, OrchestratorError>;
}
