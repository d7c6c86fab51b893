//! Server state

use std::sync::Arc;

use crate::jobs::manager::JobManager;

/// Server state shared across handlers
pub struct ServerState {
    pub manager: Arc<JobManager>,
}

impl ServerState {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }
}
