//! Debounced job persistence
//!
//! Write requests are keyed by job id. A new request for the same id
//! replaces the pending one and restarts its timer, so a burst of stage
//! changes costs one write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::OrchestratorError;
use crate::jobs::store::Flush;

pub struct DebouncedPersister {
    target: Arc<dyn Flush>,
    delay: Duration,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DebouncedPersister {
    pub fn new(target: Arc<dyn Flush>, delay: Duration) -> Self {
        Self {
            target,
            delay,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Write `job_id`'s state after the debounce delay, superseding any
    /// write already waiting for it
    pub fn schedule(&self, job_id: &str) {
        let target = self.target.clone();
        let delay = self.delay;
        let id = job_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = target.flush().await {
                warn!("Debounced write for job {} failed: {}", id, e);
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|_, task| !task.is_finished());
        if let Some(previous) = pending.insert(job_id.to_string(), handle) {
            previous.abort();
            debug!("Coalesced pending write for job {}", job_id);
        }
    }

    /// Cancel any pending write for `job_id` and write now
    pub async fn flush_now(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        if let Some(previous) = previous {
            previous.abort();
        }
        self.target.flush().await
    }

    /// Cancel every pending write and write once
    pub async fn flush_all(&self) -> Result<(), OrchestratorError> {
        let drained: Vec<JoinHandle<()>> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in drained {
            task.abort();
        }
        self.target.flush().await
    }

    /// Writes still waiting on their timer
    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.values().filter(|task| !task.is_finished()).count()
    }
}

impl Drop for DebouncedPersister {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, task) in pending.drain() {
            task.abort();
        }
    }
}
