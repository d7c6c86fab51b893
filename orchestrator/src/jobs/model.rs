//! Job records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cloud::models::ServerId;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Record exists, no VM requested yet
    Queued,

    /// Driver is provisioning and preparing the VM
    Running,

    /// Remote process launched and acknowledged; the VM is on its own
    Handoff,

    /// VM observed gone after handoff
    Succeeded,

    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Position in `queued, running, handoff, terminal`
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Handoff => 2,
            JobStatus::Succeeded | JobStatus::Failed => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Handoff => "handoff",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJob {
    pub id: String,
    pub template_id: String,
    pub template_name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hetzner_server_id: Option<ServerId>,
    #[serde(default)]
    pub remote_server_ip: Option<String>,
    pub triggered_by: String,
    #[serde(default)]
    pub failure_stage: Option<String>,
    #[serde(default)]
    pub failure_details: Option<String>,
}

impl RemoteJob {
    pub fn new(template_id: &str, template_name: &str, triggered_by: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            template_id: template_id.to_string(),
            template_name: template_name.to_string(),
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            hetzner_server_id: None,
            remote_server_ip: None,
            triggered_by: triggered_by.to_string(),
            failure_stage: None,
            failure_details: None,
        }
    }

    /// Time since the driver started, or since creation when it never did
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at.unwrap_or(self.created_at)
    }
}

/// External view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: RemoteJob,

    /// Stage the driver is in, while one is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,

    /// Most recent buffered log lines
    #[serde(default)]
    pub log_tail: Vec<String>,
}
