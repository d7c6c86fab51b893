//! Job state machine
//!
//! `queued -> running -> handoff -> {succeeded, failed}`, plus
//! `queued -> failed` and `running -> failed`. Terminal states accept nothing.

use chrono::{DateTime, Utc};

use crate::errors::OrchestratorError;
use crate::jobs::model::{JobStatus, RemoteJob};

/// Job event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Driver picked the job up
    Start,

    /// Remote launch acknowledged
    HandOff,

    /// Any stage, a stop or the reconciler gave up on the job
    Fail { stage: String, details: String },

    /// VM disappeared after handoff
    Succeed,
}

impl JobEvent {
    pub fn fail(stage: impl Into<String>, details: impl Into<String>) -> Self {
        JobEvent::Fail {
            stage: stage.into(),
            details: details.into(),
        }
    }
}

/// Target state for `event` from `status`
pub fn next_status(status: JobStatus, event: &JobEvent) -> Result<JobStatus, OrchestratorError> {
    let next = match (status, event) {
        (JobStatus::Queued, JobEvent::Start) => JobStatus::Running,
        (JobStatus::Running, JobEvent::HandOff) => JobStatus::Handoff,
        (JobStatus::Handoff, JobEvent::Succeed) => JobStatus::Succeeded,
        (JobStatus::Queued | JobStatus::Running | JobStatus::Handoff, JobEvent::Fail { .. }) => {
            JobStatus::Failed
        }

        (state, event) => {
            return Err(OrchestratorError::InvalidState(format!(
                "invalid transition: {} -> {:?}",
                state, event
            )));
        }
    };
    Ok(next)
}

impl RemoteJob {
    /// Apply `event`, stamping each timestamp at most once and never earlier
    /// than the one before it
    pub fn apply(&mut self, event: JobEvent, now: DateTime<Utc>) -> Result<JobStatus, OrchestratorError> {
        let next = next_status(self.status, &event)?;
        debug_assert!(next.rank() > self.status.rank());

        match event {
            JobEvent::Start => {
                if self.started_at.is_none() {
                    self.started_at = Some(now.max(self.created_at));
                }
            }
            JobEvent::Fail { stage, details } => {
                self.failure_stage = Some(stage);
                self.failure_details = Some(details);
            }
            JobEvent::HandOff | JobEvent::Succeed => {}
        }

        if next.is_terminal() && self.finished_at.is_none() {
            let floor = self.started_at.unwrap_or(self.created_at);
            self.finished_at = Some(now.max(floor));
        }

        self.status = next;
        Ok(next)
    }
}
