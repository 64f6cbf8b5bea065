//! Dispatcher: matches invocations to idle workers and watches for the
//! outcome.
//!
//! `dispatch` is synchronous up to the worker acquisition bound; once the
//! framed request is on the wire, a response watcher takes over on the
//! watcher pool. The watcher multiplexes four sources in bounded `poll`
//! slices:
//!
//! - a framed reply on the worker socket → `Completed`
//! - peer close before a full frame → `WorkerCrashed`
//! - the per-invocation cancel flag → `Cancelled` (the canceller already
//!   killed the pid, which closed the socket and woke the poll)
//! - the absolute deadline → `DeadlineExceeded` (the watcher kills)
//!
//! Exactly one terminal transition claims the registry entry; callbacks
//! run on the caller pool. The worker is consumed whatever the outcome.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::InvocationError;
use crate::frame::{FrameDecoder, FrameError, FrameWriter};
use crate::logs;
use crate::pool::{AcquireError, ReleaseOutcome, WorkerPool};
use crate::registry::{CallbackRegistry, Entry};
use crate::service::{Completion, InvocationRequest};
use crate::threadpool::ThreadPool;
use crate::token::ExecutionToken;
use crate::worker::Worker;

/// Poll slice between cancel/deadline checks.
const WATCH_SLICE: Duration = Duration::from_millis(100);

pub(crate) struct Dispatcher {
    pool: Arc<WorkerPool>,
    registry: Arc<CallbackRegistry>,
    watchers: Arc<ThreadPool>,
    callers: Arc<ThreadPool>,
    max_frame_len: u64,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<WorkerPool>,
        registry: Arc<CallbackRegistry>,
        watchers: Arc<ThreadPool>,
        callers: Arc<ThreadPool>,
        max_frame_len: u64,
    ) -> Self {
        Self {
            pool,
            registry,
            watchers,
            callers,
            max_frame_len,
        }
    }

    /// Run one invocation to a terminal state, eventually.
    pub fn dispatch(&self, req: InvocationRequest) -> ExecutionToken {
        let token = ExecutionToken::mint();

        let worker = match self.pool.acquire(&req.code_token) {
            Ok(worker) => worker,
            Err(AcquireError::Deleted) => {
                self.reject(&token, req, InvocationError::Deleted);
                return token;
            }
            Err(AcquireError::NoIdleWorker) => {
                self.reject(&token, req, InvocationError::NoIdleWorker);
                return token;
            }
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        self.registry.insert(
            token.clone(),
            Entry {
                on_response: req.on_response,
                on_logs: req.on_logs,
                metadata: req.metadata,
                cancelled: Arc::clone(&cancelled),
                pid: worker.pid,
            },
        );

        let mut writer = FrameWriter::new(&worker.control, self.max_frame_len);
        if let Err(err) = writer.send(&req.request) {
            tracing::debug!(%err, pid = worker.pid, "request write failed");
            self.finish(worker, &token, Err(InvocationError::WorkerCrashed));
            return token;
        }

        let deadline_at = req.deadline.map(|d| Instant::now() + d);
        let pool = Arc::clone(&self.pool);
        let registry = Arc::clone(&self.registry);
        let callers = Arc::clone(&self.callers);
        let max_frame_len = self.max_frame_len;
        let watcher_token = token.clone();
        self.watchers.execute(move || {
            let result = watch_socket(&worker, &cancelled, deadline_at, max_frame_len);
            deliver(&pool, &registry, &callers, worker, &watcher_token, result);
        });
        token
    }

    /// Terminal path for a dispatched invocation that never reached the
    /// watcher pool.
    fn finish(
        &self,
        worker: Worker,
        token: &ExecutionToken,
        result: Result<Vec<u8>, InvocationError>,
    ) {
        deliver(
            &self.pool,
            &self.registry,
            &self.callers,
            worker,
            token,
            result,
        );
    }

    /// Terminal path for an invocation that never got a worker.
    fn reject(&self, token: &ExecutionToken, req: InvocationRequest, error: InvocationError) {
        let completion = Completion {
            execution_token: token.clone(),
            result: Err(error),
            metadata: req.metadata,
        };
        let on_response = req.on_response;
        let on_logs = req.on_logs;
        self.callers.execute(move || {
            on_response(completion);
            if let Some(on_logs) = on_logs {
                on_logs(Err(crate::error::LogError::NotFound));
            }
        });
    }
}

/// Claim the callback, read the logs, consume the worker, deliver.
/// Claiming before release guarantees a late cancel can never signal a
/// pid the pool has already reaped.
fn deliver(
    pool: &WorkerPool,
    registry: &CallbackRegistry,
    callers: &ThreadPool,
    worker: Worker,
    token: &ExecutionToken,
    result: Result<Vec<u8>, InvocationError>,
) {
    let entry = registry.take(token);
    let logs_result = logs::collect(worker.log_path.as_deref());
    logs::discard(worker.log_path.as_deref());

    let outcome = match &result {
        Ok(_) => ReleaseOutcome::Completed,
        Err(InvocationError::Cancelled) => ReleaseOutcome::Cancelled,
        Err(InvocationError::DeadlineExceeded) => ReleaseOutcome::TimedOut,
        Err(InvocationError::Malformed(_)) => ReleaseOutcome::Malformed,
        Err(_) => ReleaseOutcome::Crashed,
    };
    pool.release(worker, outcome);

    let Some(entry) = entry else {
        tracing::error!(execution_token = %token, "terminal transition found no callback");
        return;
    };
    let completion = Completion {
        execution_token: token.clone(),
        result,
        metadata: entry.metadata,
    };
    let on_response = entry.on_response;
    let on_logs = entry.on_logs;
    callers.execute(move || {
        on_response(completion);
        if let Some(on_logs) = on_logs {
            on_logs(logs_result);
        }
    });
}

/// Await the worker's reply, folding in cancellation and the deadline.
fn watch_socket(
    worker: &Worker,
    cancelled: &AtomicBool,
    deadline_at: Option<Instant>,
    max_frame_len: u64,
) -> Result<Vec<u8>, InvocationError> {
    let fd = worker.control.as_raw_fd();
    if let Err(err) = set_nonblocking(fd) {
        tracing::error!(%err, "failed to set worker socket nonblocking");
        return Err(InvocationError::WorkerCrashed);
    }

    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut buf = [0u8; 4096];
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(InvocationError::Cancelled);
        }
        if let Some(at) = deadline_at {
            if Instant::now() >= at {
                kill(worker.pid);
                return Err(InvocationError::DeadlineExceeded);
            }
        }

        let slice = match deadline_at {
            Some(at) => at
                .saturating_duration_since(Instant::now())
                .min(WATCH_SLICE),
            None => WATCH_SLICE,
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // Cast is safe: the slice is capped at 100ms.
        let ret = unsafe { libc::poll(&mut pfd, 1, slice.as_millis() as libc::c_int) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(%err, "poll on worker socket failed");
            return Err(InvocationError::WorkerCrashed);
        }
        if ret == 0 {
            continue;
        }

        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(closed_outcome(cancelled));
            }
            if n == 0 {
                return Err(closed_outcome(cancelled));
            }
            decoder.extend(&buf[..n as usize]);
            match decoder.try_frame() {
                Ok(Some(payload)) => return Ok(payload),
                Ok(None) => {}
                Err(err @ FrameError::Malformed { .. }) => {
                    kill(worker.pid);
                    return Err(InvocationError::Malformed(err));
                }
                Err(err) => {
                    tracing::error!(%err, "frame decode failed");
                    return Err(InvocationError::WorkerCrashed);
                }
            }
        }
    }
}

/// A closed socket is a crash unless the caller asked for it.
fn closed_outcome(cancelled: &AtomicBool) -> InvocationError {
    if cancelled.load(Ordering::SeqCst) {
        InvocationError::Cancelled
    } else {
        InvocationError::WorkerCrashed
    }
}

fn kill(pid: libc::pid_t) {
    if pid > 0 {
        unsafe { libc::kill(pid, libc::SIGKILL) };
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
