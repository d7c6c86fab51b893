//! Stale-job reconciliation
//!
//! Cross-checks every job that still claims to be in flight against the
//! cloud API and wall-clock limits. The reconciler only ever moves jobs to a
//! terminal state. A failed cloud lookup leaves the job alone until the next
//! sweep.
//!
//! A job in `handoff` whose VM is gone is taken as succeeded: the launcher
//! deletes its own VM on exit, and nothing else reports back. A crash that
//! also removed the VM looks the same.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cloud::models::{ServerId, ServerInfo, ServerLookup};
use crate::jobs::context::JobContext;
use crate::jobs::fsm::JobEvent;
use crate::jobs::model::{JobStatus, RemoteJob};
use crate::notify::{self, EMAIL_LOG_LINES};
use crate::storage::settings::ReconcilerSettings;

/// Failure stage recorded for jobs the reconciler gives up on
pub const RECONCILE_STAGE: &str = "reconcile";

/// What the cloud API said about a job's VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// No lookup was made
    Skipped,
    Found(ServerInfo),
    Missing,
    /// Lookup failed; ambiguous
    Unavailable,
}

/// Action for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Warn(String),
    Fail(String),
    Succeed,
    /// Terminal job still holding a VM
    Release(ServerId),
}

fn exceeded(elapsed: chrono::Duration, limit_secs: u64) -> bool {
    elapsed > chrono::Duration::seconds(limit_secs as i64)
}

/// Decide what to do with `job`. `driving` is true while a driver in this
/// process still works on it; its own ceilings then govern the slow cases.
pub fn assess(
    job: &RemoteJob,
    probe: &Probe,
    driving: bool,
    now: DateTime<Utc>,
    limits: &ReconcilerSettings,
) -> Verdict {
    let elapsed = job.age(now);

    match job.status {
        JobStatus::Queued => {
            if job.started_at.is_none() && exceeded(elapsed, limits.queued_timeout_secs) {
                Verdict::Fail("never started after restart".to_string())
            } else {
                Verdict::Keep
            }
        }

        JobStatus::Running => match (job.hetzner_server_id, probe) {
            (None, _) => {
                if !driving && exceeded(elapsed, limits.running_timeout_secs) {
                    Verdict::Fail("driver lost before a server was created".to_string())
                } else {
                    Verdict::Keep
                }
            }
            (Some(id), Probe::Missing) => Verdict::Fail(format!("server {} disappeared", id)),
            (Some(id), Probe::Found(info)) if !info.is_healthy() => {
                if !driving && exceeded(elapsed, limits.provisioning_grace_secs) {
                    Verdict::Fail(format!(
                        "server {} unresponsive ({:?}, no address)",
                        id, info.status
                    ))
                } else {
                    Verdict::Keep
                }
            }
            (Some(id), Probe::Found(_)) => {
                if !driving && exceeded(elapsed, limits.running_timeout_secs) {
                    Verdict::Fail(format!("stalled before hand-off on server {}", id))
                } else {
                    Verdict::Keep
                }
            }
            (Some(_), Probe::Unavailable | Probe::Skipped) => Verdict::Keep,
        },

        JobStatus::Handoff => match probe {
            Probe::Missing => Verdict::Succeed,
            Probe::Unavailable => Verdict::Keep,
            _ if exceeded(elapsed, limits.handoff_timeout_secs) => {
                Verdict::Fail("handoff timed out".to_string())
            }
            Probe::Found(info) if !info.is_healthy() => Verdict::Warn(format!(
                "server {} is {:?} without an address, the launcher may be shutting it down",
                info.id, info.status
            )),
            _ => Verdict::Keep,
        },

        JobStatus::Succeeded | JobStatus::Failed => match job.hetzner_server_id {
            Some(id) if !driving => Verdict::Release(id),
            _ => Verdict::Keep,
        },
    }
}

/// Counts from one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub failed: usize,
    pub succeeded: usize,
    pub released: usize,
    /// Another sweep was in progress or the last one was too recent
    pub skipped: bool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler {
    ctx: Arc<JobContext>,
    in_flight: AtomicBool,
    last_sweep: Mutex<Option<Instant>>,
}

impl Reconciler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self {
            ctx,
            in_flight: AtomicBool::new(false),
            last_sweep: Mutex::new(None),
        }
    }

    fn limits(&self) -> &ReconcilerSettings {
        &self.ctx.settings.reconciler
    }

    /// Claim the sweep slot, honouring single flight and minimum spacing
    fn claim(&self) -> Option<InFlight<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconciliation already in progress");
            return None;
        }
        let guard = InFlight(&self.in_flight);

        let spacing = Duration::from_secs(self.limits().min_spacing_secs);
        let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = *last {
            if at.elapsed() < spacing {
                debug!("Reconciliation ran {:?} ago, skipping", at.elapsed());
                return None;
            }
        }
        *last = Some(Instant::now());
        Some(guard)
    }

    /// Run one pass over all jobs
    pub async fn sweep(&self) -> SweepReport {
        let Some(_guard) = self.claim() else {
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };

        let mut report = SweepReport::default();
        for job in self.ctx.store.list() {
            if job.status.is_terminal() && job.hetzner_server_id.is_none() {
                continue;
            }
            report.examined += 1;

            let probe = self.probe(&job).await;
            let driving = self.ctx.store.is_driving(&job.id);
            match assess(&job, &probe, driving, Utc::now(), self.limits()) {
                Verdict::Keep => {}
                Verdict::Warn(message) => warn!("Job {}: {}", job.id, message),
                Verdict::Fail(reason) => {
                    if self.fail(&job, &reason).await {
                        report.failed += 1;
                    }
                }
                Verdict::Succeed => {
                    if self.succeed(&job).await {
                        report.succeeded += 1;
                    }
                }
                Verdict::Release(server_id) => {
                    if self.release(&job.id, server_id).await {
                        report.released += 1;
                    }
                }
            }
        }

        if report.failed + report.succeeded + report.released > 0 {
            info!(
                "Reconciled {} jobs: {} failed, {} succeeded, {} servers released",
                report.examined, report.failed, report.succeeded, report.released
            );
        }
        report
    }

    async fn probe(&self, job: &RemoteJob) -> Probe {
        let Some(server_id) = job.hetzner_server_id else {
            return Probe::Skipped;
        };
        if !matches!(job.status, JobStatus::Running | JobStatus::Handoff) {
            return Probe::Skipped;
        }
        match self.ctx.cloud.get_server(server_id).await {
            Ok(ServerLookup::Found(info)) => Probe::Found(info),
            Ok(ServerLookup::Missing) => Probe::Missing,
            Err(e) => {
                warn!(
                    "Lookup of server {} for job {} failed, retrying next sweep: {}",
                    server_id, job.id, e
                );
                Probe::Unavailable
            }
        }
    }

    async fn fail(&self, job: &RemoteJob, reason: &str) -> bool {
        let applied = self.ctx.store.update(&job.id, |job| {
            job.apply(JobEvent::fail(RECONCILE_STAGE, reason), Utc::now())
        });
        if let Err(e) = applied {
            debug!("Job {} changed during the sweep: {}", job.id, e);
            return false;
        }
        warn!("Job {} marked failed: {}", job.id, reason);
        self.ctx.store.log(&job.id, &format!("reconciler: {}", reason));

        if let Some(server_id) = job.hetzner_server_id {
            self.release(&job.id, server_id).await;
        } else if let Err(e) = self.ctx.persister.flush_now(&job.id).await {
            error!("Could not persist job {}: {}", job.id, e);
        }

        if let Some(failed) = self.ctx.store.get(&job.id) {
            let log_tail = self.ctx.store.log_tail(&job.id, EMAIL_LOG_LINES);
            notify::notify_failure(
                self.ctx.kv.as_ref(),
                self.ctx.mailer.as_ref(),
                &failed,
                &log_tail,
            )
            .await;
        }
        true
    }

    async fn succeed(&self, job: &RemoteJob) -> bool {
        let applied = self.ctx.store.update(&job.id, |job| {
            let status = job.apply(JobEvent::Succeed, Utc::now())?;
            job.hetzner_server_id = None;
            job.remote_server_ip = None;
            Ok(status)
        });
        if let Err(e) = applied {
            debug!("Job {} changed during the sweep: {}", job.id, e);
            return false;
        }
        info!("Job {} succeeded, its server is gone", job.id);
        if let Err(e) = self.ctx.persister.flush_now(&job.id).await {
            error!("Could not persist job {}: {}", job.id, e);
        }
        true
    }

    /// Best-effort delete; the id is only cleared once the VM is confirmed gone
    async fn release(&self, job_id: &str, server_id: ServerId) -> bool {
        let released = match self.ctx.cloud.delete_server(server_id).await {
            Ok(outcome) => {
                info!("Server {} of job {} released ({:?})", server_id, job_id, outcome);
                let cleared = self.ctx.store.update(job_id, |job| {
                    if job.hetzner_server_id == Some(server_id) {
                        job.hetzner_server_id = None;
                        job.remote_server_ip = None;
                    }
                    Ok(())
                });
                cleared.is_ok()
            }
            Err(e) => {
                error!(
                    "Could not delete server {} of job {}, retrying next sweep: {}",
                    server_id, job_id, e
                );
                false
            }
        };
        if let Err(e) = self.ctx.persister.flush_now(job_id).await {
            error!("Could not persist job {}: {}", job_id, e);
        }
        released
    }
}
