//! Host-side worker handles.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use crate::token::CodeToken;

/// Immutable description of the worker population for one code token.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSpec {
    pub code_token: CodeToken,
    pub binary_path: PathBuf,
    pub worker_count: usize,
    pub log_egress: bool,
}

/// Lifecycle of a worker slot as tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    /// Cloned, handshake not yet observed.
    Starting,
    /// Handshaken and queued for an invocation.
    Idle,
    /// Owned by the dispatcher for exactly one invocation.
    Busy,
}

/// One live child. Owned by the pool while idle, borrowed whole by the
/// dispatcher between acquire and release; the control socket is never
/// shared.
#[derive(Debug)]
pub(crate) struct Worker {
    pub pid: libc::pid_t,
    pub code_token: CodeToken,
    pub control: UnixStream,
    /// Present iff log egress is enabled for the code token.
    pub log_path: Option<PathBuf>,
}
