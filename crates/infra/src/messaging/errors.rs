//! Lifecycle errors for background workers.

use std::time::Duration;

use clinisync_domain::ClinisyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker already running")]
    AlreadyRunning,

    #[error("Worker not running")]
    NotRunning,

    #[error("No handlers registered")]
    NoHandlers,

    #[error("{0} worker task(s) panicked")]
    Panicked(usize),

    #[error("{pending} worker task(s) did not finish within {timeout:?}")]
    JoinTimeout { pending: usize, timeout: Duration },
}

impl From<WorkerError> for ClinisyncError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::AlreadyRunning | WorkerError::NotRunning | WorkerError::NoHandlers => {
                Self::Config(err.to_string())
            }
            WorkerError::Panicked(_) | WorkerError::JoinTimeout { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}
