//! In-memory state of a job while a driver works on it. None of this is
//! persisted; a restarted service rebuilds jobs from durable fields alone.

use std::collections::VecDeque;

use chrono::Utc;

pub const LOG_BUFFER_CAPACITY: usize = 400;

/// Bounded ring of recent log lines
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a timestamped line, evicting the oldest when full
    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines
            .push_back(format!("{} {}", Utc::now().format("%H:%M:%S"), line));
    }

    /// Last `count` lines, oldest first
    pub fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_BUFFER_CAPACITY)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobRuntime {
    pub log: LogBuffer,
    pub current_stage: Option<String>,
    /// Launch acknowledged; the driver must not delete the VM after this
    pub handoff_complete: bool,
}
