//! Job tracking and cooperative cancellation
//!
//! Every top-level request carries a job id. Cancelling a job flips a
//! shared flag; in-flight tasks check it at their next yield point (batch
//! boundary, RPC completion) and stop with a `Cancelled` error.

use crate::error::{ClusterError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cancellation handle shared by all tasks of one job
#[derive(Debug, Clone)]
pub struct JobToken {
    job_id: String,
    cancelled: Arc<AtomicBool>,
}

impl JobToken {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Error out if the job was cancelled; called at yield points
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ClusterError::Cancelled(self.job_id.clone()))
        } else {
            Ok(())
        }
    }
}

/// Registry of jobs running on this node
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobToken>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a job with a fresh id
    pub fn create(&self) -> JobToken {
        self.register(uuid::Uuid::new_v4().to_string())
    }

    /// Register a job arriving from a coordinator
    pub fn register(&self, job_id: impl Into<String>) -> JobToken {
        let token = JobToken::new(job_id);
        self.jobs
            .lock()
            .insert(token.job_id().to_string(), token.clone());
        token
    }

    /// Signal every task of a job to stop at its next yield point
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.jobs.lock().get(job_id) {
            Some(token) => {
                debug!("cancelling job {job_id}");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a finished job
    pub fn finish(&self, job_id: &str) {
        self.jobs.lock().remove(job_id);
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().len()
    }
}
