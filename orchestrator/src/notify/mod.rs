//! Failure notifications
//!
//! Best effort only: missing configuration skips the email and a failed send
//! is logged, neither touches job state.

pub mod email;
pub mod mailgun;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::OrchestratorError;
use crate::jobs::model::RemoteJob;
use crate::storage::kv::{KeyValueStore, NOTIFICATION_EMAIL};

/// Log lines quoted in a failure email
pub const EMAIL_LOG_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Skipped(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<DeliveryOutcome, OrchestratorError>;
}

/// Requester when it looks like an address, otherwise the configured default
pub async fn resolve_recipient(
    kv: &dyn KeyValueStore,
    triggered_by: &str,
) -> Result<Option<String>, OrchestratorError> {
    let requester = triggered_by.trim();
    if requester.contains('@') {
        return Ok(Some(requester.to_string()));
    }
    kv.get(NOTIFICATION_EMAIL).await
}

/// Email the failure of `job`; never fails
pub async fn notify_failure(
    kv: &dyn KeyValueStore,
    mailer: &dyn Mailer,
    job: &RemoteJob,
    log_tail: &[String],
) -> DeliveryOutcome {
    let recipient = match resolve_recipient(kv, &job.triggered_by).await {
        Ok(Some(recipient)) => recipient,
        Ok(None) => {
            return DeliveryOutcome::Skipped("no notification recipient".to_string());
        }
        Err(e) => {
            warn!("Could not resolve notification recipient for job {}: {}", job.id, e);
            return DeliveryOutcome::Skipped(e.to_string());
        }
    };

    let message = email::failure_email(job, &recipient, log_tail);
    match mailer.send(&message).await {
        Ok(DeliveryOutcome::Sent) => {
            info!("Sent failure notification for job {} to {}", job.id, recipient);
            DeliveryOutcome::Sent
        }
        Ok(skipped) => skipped,
        Err(e) => {
            warn!("Failure notification for job {} was not sent: {}", job.id, e);
            DeliveryOutcome::Skipped(e.to_string())
        }
    }
}
