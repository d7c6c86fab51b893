//! Job lifecycle manager: the operations the HTTP layer calls

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::OrchestratorError;
use crate::jobs::context::JobContext;
use crate::jobs::driver;
use crate::jobs::fsm::JobEvent;
use crate::jobs::model::{JobSnapshot, JobStatus, RemoteJob};
use crate::jobs::reconcile::Reconciler;
use crate::keys::provider;
use crate::remote::tail::last_lines;
use crate::remote::SshTarget;

/// Bytes read from the end of the remote log
pub const REMOTE_LOG_TAIL_BYTES: u64 = 256 * 1024;
pub const DEFAULT_LOG_LINES: usize = 200;
pub const MAX_LOG_LINES: usize = 2000;

/// Failure stage recorded by a manual stop
pub const STOP_STAGE: &str = "stopped";

#[derive(Debug, Clone, Serialize)]
pub struct RemoteLog {
    pub job: JobSnapshot,
    pub log_text: String,
    pub tail_line_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub job: JobSnapshot,
    pub server_deleted: bool,
}

pub struct JobManager {
    ctx: Arc<JobContext>,
    reconciler: Arc<Reconciler>,
}

impl JobManager {
    pub fn new(ctx: Arc<JobContext>, reconciler: Arc<Reconciler>) -> Self {
        Self { ctx, reconciler }
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    fn snapshot(&self, job: &RemoteJob) -> JobSnapshot {
        self.ctx.store.snapshot(&job.id).unwrap_or_else(|| JobSnapshot {
            job: job.clone(),
            current_stage: None,
            log_tail: Vec::new(),
        })
    }

    /// Record a queued job and start driving it in the background
    pub async fn trigger_optimization(
        &self,
        template_id: &str,
        template_name: &str,
        triggered_by: &str,
    ) -> Result<JobSnapshot, OrchestratorError> {
        if template_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidState(
                "template id must not be empty".to_string(),
            ));
        }

        let job = RemoteJob::new(template_id, template_name, triggered_by, Utc::now());
        let snapshot = JobSnapshot {
            job: job.clone(),
            current_stage: None,
            log_tail: Vec::new(),
        };
        self.ctx.store.insert(job.clone());
        self.ctx.persister.flush_now(&job.id).await?;
        info!(
            "Queued job {} for template {} (requested by {})",
            job.id, job.template_id, job.triggered_by
        );

        tokio::spawn(driver::drive(self.ctx.clone(), job.id.clone()));
        Ok(snapshot)
    }

    pub fn get_job(&self, id: &str) -> Result<JobSnapshot, OrchestratorError> {
        self.ctx
            .store
            .snapshot(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", id)))
    }

    /// All jobs, newest first, after a reconciliation sweep
    pub async fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.reconciler.sweep().await;
        self.ctx.store.snapshots()
    }

    /// Last `lines` lines of the remote engine log
    pub async fn get_remote_log(
        &self,
        id: &str,
        lines: Option<usize>,
    ) -> Result<RemoteLog, OrchestratorError> {
        let job = self.ctx.store.require(id)?;
        if !matches!(job.status, JobStatus::Running | JobStatus::Handoff) {
            return Err(OrchestratorError::InvalidState(format!(
                "job {} is {}; the remote log is only available while running or in handoff",
                id, job.status
            )));
        }
        let Some(ip) = job.remote_server_ip.clone() else {
            return Err(OrchestratorError::InvalidState(format!(
                "job {} has no server address yet",
                id
            )));
        };
        let lines = lines.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);

        let remote = &self.ctx.settings.remote;
        let private_key = provider::load_private_key(self.ctx.kv.as_ref()).await?;
        let target = SshTarget::new(ip, remote.ssh_port, remote.ssh_user.as_str());
        let session = self.ctx.connector.connect(&target, &private_key).await?;
        let read = session
            .read_tail(&remote.log_path, REMOTE_LOG_TAIL_BYTES)
            .await;
        session.close().await;
        let (raw, truncated) = read?;

        let (log_text, tail_line_count) = last_lines(&raw, lines, truncated);
        Ok(RemoteLog {
            job: self.snapshot(&job),
            log_text,
            tail_line_count,
        })
    }

    /// Delete the job's VM and mark it failed, whatever stage it is in
    pub async fn stop_optimization(&self, id: &str) -> Result<StopResult, OrchestratorError> {
        let job = self.ctx.store.require(id)?;
        if !job.status.is_active() {
            return Err(OrchestratorError::InvalidState(format!(
                "job {} is already {}",
                id, job.status
            )));
        }

        let mut server_deleted = false;
        let mut server_gone = true;
        if let Some(server_id) = job.hetzner_server_id {
            match self.ctx.cloud.delete_server(server_id).await {
                Ok(outcome) => server_deleted = outcome.was_deleted(),
                Err(e) => {
                    warn!("Stopping job {}: deleting server {} failed: {}", id, server_id, e);
                    server_gone = false;
                }
            }
        }

        let (job, _) = self.ctx.store.update(id, |job| {
            let status = job.apply(JobEvent::fail(STOP_STAGE, "stopped by operator"), Utc::now())?;
            if server_gone {
                job.hetzner_server_id = None;
                job.remote_server_ip = None;
            }
            Ok(status)
        })?;
        self.ctx.store.log(id, "stopped by operator");
        self.ctx.persister.flush_now(id).await?;
        info!("Stopped job {} (server deleted: {})", id, server_deleted);

        Ok(StopResult {
            job: self.snapshot(&job),
            server_deleted,
        })
    }
}
