//! Error types at the service boundaries.
//!
//! Every invocation-level failure is delivered exactly once through the
//! response callback as an [`InvocationError`]; each kind carries a stable
//! identifier for callers that key on strings rather than variants.
//! Spawn-time syscall failures never reach the caller directly: the pool
//! retries them and logs degradation, and the caller observes
//! `NoIdleWorker` or `WorkerCrashed`.

use std::io;

use thiserror::Error;
use udfbox_sandbox::SpawnError;

use crate::control::ControlError;
use crate::frame::FrameError;

/// Terminal failure of a single invocation.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Worker closed its socket before a complete response frame.
    #[error("worker closed its socket before responding")]
    WorkerCrashed,

    /// Caller cancelled the invocation; the worker was killed.
    #[error("invocation cancelled")]
    Cancelled,

    /// Deadline expired before the worker responded.
    #[error("invocation deadline exceeded")]
    DeadlineExceeded,

    /// The code token was deleted while the invocation was queued.
    #[error("code token deleted")]
    Deleted,

    /// No worker became idle within the acquisition bound.
    #[error("no idle worker within the acquisition bound")]
    NoIdleWorker,

    /// The worker's response frame exceeded the configured cap.
    #[error("worker response malformed: {0}")]
    Malformed(FrameError),
}

impl InvocationError {
    /// Stable identifier for this kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerCrashed => "worker_crashed",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Deleted => "deleted",
            Self::NoIdleWorker => "no_idle_worker",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Failure to load a binary.
#[derive(Debug, Error)]
pub enum LoadError {
    /// `worker_count` must be at least 1.
    #[error("worker_count must be positive")]
    InvalidWorkerCount,

    /// `worker_count` exceeds the configured admission bound.
    #[error("worker_count {requested} exceeds configured maximum {max}")]
    TooManyWorkers { requested: usize, max: usize },

    /// The artifact could not be written or marked executable.
    #[error("binary rejected: {0}")]
    BinaryRejected(#[source] io::Error),

    /// Worker spawn failed during prewarm after retries.
    #[error("spawn failed: {0}")]
    SpawnFailed(#[from] SpawnError),

    /// A spawned worker never completed the control-plane handshake.
    #[error("worker handshake failed: {0}")]
    Handshake(#[from] ControlError),

    /// The service is shutting down.
    #[error("service is shut down")]
    ShutDown,
}

impl LoadError {
    /// Stable identifier for this kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidWorkerCount => "invalid_worker_count",
            Self::TooManyWorkers { .. } => "too_many_workers",
            Self::BinaryRejected(_) => "binary_rejected",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::Handshake(_) => "spawn_failed",
            Self::ShutDown => "shut_down",
        }
    }
}

/// Failure to surface captured logs.
#[derive(Debug, Error)]
pub enum LogError {
    /// Log egress was not enabled for this code token.
    #[error("log capture not enabled for this invocation")]
    NotFound,

    #[error("log read: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(InvocationError::WorkerCrashed.kind(), "worker_crashed");
        assert_eq!(InvocationError::Cancelled.kind(), "cancelled");
        assert_eq!(InvocationError::DeadlineExceeded.kind(), "deadline_exceeded");
        assert_eq!(InvocationError::Deleted.kind(), "deleted");
        assert_eq!(InvocationError::NoIdleWorker.kind(), "no_idle_worker");
        assert_eq!(LoadError::InvalidWorkerCount.kind(), "invalid_worker_count");
    }
}
