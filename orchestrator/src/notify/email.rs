//! Failure email composition

use crate::jobs::model::RemoteJob;
use crate::notify::{EmailMessage, EMAIL_LOG_LINES};

pub fn failure_email(job: &RemoteJob, to: &str, log_tail: &[String]) -> EmailMessage {
    let stage = job.failure_stage.as_deref().unwrap_or("unknown");
    let details = job.failure_details.as_deref().unwrap_or("no details recorded");

    let skip = log_tail.len().saturating_sub(EMAIL_LOG_LINES);
    let excerpt = if log_tail.is_empty() {
        "(no log lines buffered)".to_string()
    } else {
        log_tail[skip..].join("\n")
    };

    let mut text = String::new();
    text.push_str(&format!(
        "The remote optimization for {} ({}) failed.\n\n",
        job.template_name, job.template_id
    ));
    text.push_str(&format!("Job:      {}\n", job.id));
    text.push_str(&format!("Stage:    {}\n", stage));
    text.push_str(&format!("Started:  {}\n", fmt_time(job.started_at)));
    text.push_str(&format!("Failed:   {}\n", fmt_time(job.finished_at)));
    if let Some(server) = job.hetzner_server_id {
        text.push_str(&format!("Server:   {}\n", server));
    }
    text.push_str(&format!("\nError:\n{}\n", details));
    text.push_str(&format!("\nLast log lines:\n{}\n", excerpt));

    EmailMessage {
        to: to.to_string(),
        subject: format!("Optimization failed: {} [{}]", job.template_name, stage),
        text,
    }
}

fn fmt_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}
