//! Gate on work a job depends on

use async_trait::async_trait;

use crate::errors::OrchestratorError;
use crate::jobs::model::RemoteJob;

/// Reports how many jobs `job` is still waiting for
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    async fn pending(&self, job: &RemoteJob) -> Result<usize, OrchestratorError>;
}

/// Nothing is ever pending
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependencies;

#[async_trait]
impl DependencyProbe for NoDependencies {
    async fn pending(&self, _job: &RemoteJob) -> Result<usize, OrchestratorError> {
        Ok(0)
    }
}
