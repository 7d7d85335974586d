//! Unified error taxonomy for the scheduler. Soft/recoverable paths
//! (admission refusal, grammar compile failure) are absorbed inline and
//! never reach this type (`spec.md` §7); only errors that should propagate
//! out of an iteration step do.

use thiserror::Error;

use crate::cache::CacheError;
use crate::pool::PoolError;
use crate::prefill::PrefillError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker forward pass failed: {0}")]
    Forward(String),
    #[error("worker weight update failed: {0}")]
    WeightUpdate(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Prefill(#[from] PrefillError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    /// `check_memory()` detected a pool-accounting leak. Fatal when
    /// `crash_on_warning` is set; otherwise the caller logs and continues.
    #[error("invariant drift detected: {0}")]
    InvariantDrift(String),
}
