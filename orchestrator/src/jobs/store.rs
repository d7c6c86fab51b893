//! Durable job store
//!
//! All jobs live in memory and are written together to one JSON file.
//! Writers go through `update`, which applies a change to a copy and only
//! commits it when the change succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::jobs::model::{JobSnapshot, RemoteJob};
use crate::jobs::runtime::JobRuntime;

/// Log lines included in a snapshot
pub const SNAPSHOT_LOG_LINES: usize = 50;

/// Something that can write all pending job state out
#[async_trait]
pub trait Flush: Send + Sync {
    async fn flush(&self) -> Result<(), OrchestratorError>;
}

#[derive(Debug, Clone)]
struct JobEntry {
    job: RemoteJob,
    runtime: Option<JobRuntime>,
}

pub struct JobStore {
    file: File,
    jobs: RwLock<HashMap<String, JobEntry>>,
    write_lock: Mutex<()>,
    writes: AtomicU64,
}

impl JobStore {
    /// Load `jobs.json`, starting empty when it does not exist
    pub async fn load(file: File) -> Result<Self, OrchestratorError> {
        let jobs: Vec<RemoteJob> = file.read_json_or_default().await.map_err(|e| {
            OrchestratorError::Storage(format!(
                "failed to read job store {}: {}",
                file.path().display(),
                e
            ))
        })?;
        info!("Loaded {} jobs from {}", jobs.len(), file.path().display());

        let jobs = jobs
            .into_iter()
            .map(|job| {
                (
                    job.id.clone(),
                    JobEntry {
                        job,
                        runtime: None,
                    },
                )
            })
            .collect();

        Ok(Self {
            file,
            jobs: RwLock::new(jobs),
            write_lock: Mutex::new(()),
            writes: AtomicU64::new(0),
        })
    }

    pub fn insert(&self, job: RemoteJob) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(
            job.id.clone(),
            JobEntry {
                job,
                runtime: Some(JobRuntime::default()),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<RemoteJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(id).map(|entry| entry.job.clone())
    }

    pub fn require(&self, id: &str) -> Result<RemoteJob, OrchestratorError> {
        self.get(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", id)))
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<RemoteJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<RemoteJob> = jobs.values().map(|entry| entry.job.clone()).collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(id).map(snapshot_of)
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<JobSnapshot> = jobs.values().map(snapshot_of).collect();
        list.sort_by(|a, b| b.job.created_at.cmp(&a.job.created_at));
        list
    }

    /// Apply `change` to a copy of the job and commit it on success
    pub fn update<T, F>(&self, id: &str, change: F) -> Result<(RemoteJob, T), OrchestratorError>
    where
        F: FnOnce(&mut RemoteJob) -> Result<T, OrchestratorError>,
    {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", id)))?;

        let mut job = entry.job.clone();
        let value = change(&mut job)?;
        entry.job = job.clone();
        Ok((job, value))
    }

    /// Mutate the runtime state, creating it when missing
    pub fn with_runtime<T>(&self, id: &str, f: impl FnOnce(&mut JobRuntime) -> T) -> Option<T> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.get_mut(id)
            .map(|entry| f(entry.runtime.get_or_insert_with(JobRuntime::default)))
    }

    /// Append to the job's log buffer
    pub fn log(&self, id: &str, line: &str) {
        self.with_runtime(id, |runtime| runtime.log.push(line));
    }

    pub fn set_stage(&self, id: &str, stage: &str) {
        self.with_runtime(id, |runtime| {
            runtime.current_stage = Some(stage.to_string());
            runtime.log.push(&format!("stage: {}", stage));
        });
    }

    /// Last `count` buffered log lines
    pub fn log_tail(&self, id: &str, count: usize) -> Vec<String> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(id)
            .and_then(|entry| entry.runtime.as_ref())
            .map(|runtime| runtime.log.tail(count))
            .unwrap_or_default()
    }

    /// Whether a driver in this process is working on the job
    pub fn is_driving(&self, id: &str) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(id)
            .and_then(|entry| entry.runtime.as_ref())
            .is_some_and(|runtime| runtime.current_stage.is_some())
    }

    /// Driver finished; the snapshot no longer reports a live stage
    pub fn end_run(&self, id: &str) {
        self.with_runtime(id, |runtime| runtime.current_stage = None);
    }

    /// Number of completed file writes
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn write_all(&self) -> Result<(), OrchestratorError> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.list();
        jobs.reverse();
        let data = serde_json::to_vec_pretty(&jobs)?;
        self.file.write_atomic(&data).await.map_err(|e| {
            OrchestratorError::Storage(format!(
                "failed to write job store {}: {}",
                self.file.path().display(),
                e
            ))
        })?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!("Wrote {} jobs to {}", jobs.len(), self.file.path().display());
        Ok(())
    }
}

#[async_trait]
impl Flush for JobStore {
    async fn flush(&self) -> Result<(), OrchestratorError> {
        self.write_all().await
    }
}

fn snapshot_of(entry: &JobEntry) -> JobSnapshot {
    JobSnapshot {
        job: entry.job.clone(),
        current_stage: entry
            .runtime
            .as_ref()
            .and_then(|runtime| runtime.current_stage.clone()),
        log_tail: entry
            .runtime
            .as_ref()
            .map(|runtime| runtime.log.tail(SNAPSHOT_LOG_LINES))
            .unwrap_or_default(),
    }
}
