//! Worker pool: per-code-token steady-state population with respawn.
//!
//! The pool owns every worker outright. The dispatcher borrows one whole
//! worker between `acquire` and `release`; nothing else ever touches a
//! worker's control socket. All reaping funnels through a single reaper
//! thread in `waitpid(-1)`, which is therefore the only place pivot-root
//! directories are removed and replacements are spawned: a worker never
//! outlives its pivot root, and no two threads race on `waitpid`.
//!
//! A worker's exit status is not interesting: the protocol is one
//! invocation per worker life, so a non-zero status is a normal terminal
//! event and the pool respawns unchanged. Spawn failures are retried a
//! bounded number of times per slot, after which the code token is marked
//! degraded and the failure is logged; callers only ever observe
//! `NoIdleWorker`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use udfbox_sandbox::{SandboxMode, SpawnError, SpawnRequest, StdioSink};

use crate::control::{ControlError, ControlPlane};
use crate::logs;
use crate::token::CodeToken;
use crate::worker::{Worker, WorkerSpec, WorkerState};

/// How often blocked loops re-check state they could only miss through a
/// lost notification.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub(crate) enum AcquireError {
    #[error("no idle worker within the bound")]
    NoIdleWorker,

    #[error("code token deleted")]
    Deleted,
}

#[derive(Debug, Error)]
pub(crate) enum SpawnFailure {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Handshake(#[from] ControlError),
}

impl From<SpawnFailure> for crate::error::LoadError {
    fn from(failure: SpawnFailure) -> Self {
        match failure {
            SpawnFailure::Spawn(e) => Self::SpawnFailed(e),
            SpawnFailure::Handshake(e) => Self::Handshake(e),
        }
    }
}

/// Why a worker is being handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    Completed,
    Crashed,
    Cancelled,
    TimedOut,
    Malformed,
}

/// Point-in-time population counts for one code token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub starting: usize,
    pub target: usize,
    pub degraded: bool,
}

struct PidMeta {
    code_token: CodeToken,
    pivot_root_dir: PathBuf,
    log_path: Option<PathBuf>,
    state: WorkerState,
}

struct PoolEntry {
    spec: WorkerSpec,
    idle: VecDeque<Worker>,
    degraded: bool,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<CodeToken, PoolEntry>,
    pids: HashMap<libc::pid_t, PidMeta>,
    shutdown: bool,
}

struct Inner {
    state: Mutex<PoolState>,
    cv: Condvar,
    control: Arc<ControlPlane>,
    mounts: Vec<PathBuf>,
    mode: SandboxMode,
    log_dir: PathBuf,
    handshake_timeout: Duration,
    acquire_timeout: Duration,
    spawn_retry_limit: u32,
}

pub(crate) struct WorkerPool {
    inner: Arc<Inner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<ControlPlane>,
        mounts: Vec<PathBuf>,
        mode: SandboxMode,
        log_dir: PathBuf,
        handshake_timeout: Duration,
        acquire_timeout: Duration,
        spawn_retry_limit: u32,
    ) -> std::io::Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(PoolState::default()),
            cv: Condvar::new(),
            control,
            mounts,
            mode,
            log_dir,
            handshake_timeout,
            acquire_timeout,
            spawn_retry_limit,
        });
        let reaper_inner = Arc::clone(&inner);
        let reaper = std::thread::Builder::new()
            .name("udfbox-reaper".to_owned())
            .spawn(move || reaper_loop(&reaper_inner))?;
        Ok(Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Bring a fresh code token to its steady-state population. Returns
    /// once every worker has completed the control-plane handshake.
    pub fn prewarm(&self, spec: WorkerSpec) -> Result<(), SpawnFailure> {
        let token = spec.code_token.clone();
        self.inner.control.register(&token);
        {
            let mut state = self.inner.state.lock().expect("pool lock");
            state.entries.insert(
                token.clone(),
                PoolEntry {
                    spec: spec.clone(),
                    idle: VecDeque::new(),
                    degraded: false,
                },
            );
        }

        let mut outcome = Ok(());
        for _ in 0..spec.worker_count.saturating_sub(1) {
            if let Err(err) = self.inner.spawn_with_retries(&spec) {
                outcome = Err(err);
                break;
            }
        }
        if outcome.is_ok() {
            outcome = self.inner.spawn_with_retries(&spec);
        }

        if outcome.is_err() {
            self.delete(&token);
        }
        outcome
    }

    /// FIFO pop of an idle worker, waiting up to the configured bound.
    pub fn acquire(&self, token: &CodeToken) -> Result<Worker, AcquireError> {
        let deadline = Instant::now() + self.inner.acquire_timeout;
        let mut state = self.inner.state.lock().expect("pool lock");
        loop {
            let Some(entry) = state.entries.get_mut(token) else {
                return Err(AcquireError::Deleted);
            };
            if let Some(worker) = entry.idle.pop_front() {
                if let Some(meta) = state.pids.get_mut(&worker.pid) {
                    meta.state = WorkerState::Busy;
                }
                return Ok(worker);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AcquireError::NoIdleWorker);
            }
            let (guard, _) = self
                .inner
                .cv
                .wait_timeout(state, remaining.min(WAIT_SLICE))
                .expect("pool lock");
            state = guard;
        }
    }

    /// Hand back a consumed worker. Whatever the outcome, the worker is
    /// killed; the reaper replaces it.
    pub fn release(&self, worker: Worker, outcome: ReleaseOutcome) {
        tracing::debug!(
            pid = worker.pid,
            code_token = %worker.code_token,
            ?outcome,
            "releasing worker"
        );
        if worker.pid > 0 {
            unsafe { libc::kill(worker.pid, libc::SIGKILL) };
        }
        // Dropping the worker closes the control socket.
    }

    /// Remove the spec, kill every live worker under `token`, and block
    /// until each has been reaped and its pivot root removed.
    pub fn delete(&self, token: &CodeToken) {
        {
            let mut state = self.inner.state.lock().expect("pool lock");
            if let Some(entry) = state.entries.remove(token) {
                tracing::info!(code_token = %token, "deleting code token");
                drop(entry.idle);
            }
            for (pid, meta) in &state.pids {
                if meta.code_token == *token && *pid > 0 {
                    unsafe { libc::kill(*pid, libc::SIGKILL) };
                }
            }
            self.inner.cv.notify_all();
        }
        self.inner.control.deregister(token);
        self.await_drained(|state| {
            state
                .pids
                .values()
                .any(|meta| meta.code_token == *token)
        });
    }

    /// Tokens currently loaded.
    pub fn tokens(&self) -> Vec<CodeToken> {
        let state = self.inner.state.lock().expect("pool lock");
        state.entries.keys().cloned().collect()
    }

    pub fn stats(&self, token: &CodeToken) -> Option<PoolStats> {
        let state = self.inner.state.lock().expect("pool lock");
        let entry = state.entries.get(token)?;
        let mut busy = 0;
        let mut starting = 0;
        for meta in state.pids.values() {
            if meta.code_token == *token {
                match meta.state {
                    WorkerState::Busy => busy += 1,
                    WorkerState::Starting => starting += 1,
                    WorkerState::Idle => {}
                }
            }
        }
        Some(PoolStats {
            idle: entry.idle.len(),
            busy,
            starting,
            target: entry.spec.worker_count,
            degraded: entry.degraded,
        })
    }

    /// Kill everything, wait for the reaper to drain, and join it.
    pub fn shutdown(&self) {
        let tokens = {
            let mut state = self.inner.state.lock().expect("pool lock");
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let tokens: Vec<_> = state.entries.keys().cloned().collect();
            state.entries.clear();
            for (pid, _) in state.pids.iter() {
                if *pid > 0 {
                    unsafe { libc::kill(*pid, libc::SIGKILL) };
                }
            }
            self.inner.cv.notify_all();
            tokens
        };
        for token in tokens {
            self.inner.control.deregister(&token);
        }
        self.await_drained(|state| !state.pids.is_empty());
        if let Some(handle) = self.reaper.lock().expect("pool lock").take() {
            handle.join().ok();
        }
    }

    fn await_drained(&self, mut still_waiting: impl FnMut(&PoolState) -> bool) {
        let mut state = self.inner.state.lock().expect("pool lock");
        while still_waiting(&state) {
            let (guard, _) = self
                .inner
                .cv
                .wait_timeout(state, WAIT_SLICE)
                .expect("pool lock");
            state = guard;
        }
    }
}

impl Inner {
    fn spawn_with_retries(&self, spec: &WorkerSpec) -> Result<(), SpawnFailure> {
        let mut last = None;
        for attempt in 0..=self.spawn_retry_limit {
            match self.spawn_worker(spec) {
                Ok(worker) => {
                    self.enqueue_idle(worker);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        code_token = %spec.code_token,
                        attempt,
                        %err,
                        "worker spawn failed"
                    );
                    last = Some(err);
                }
            }
        }
        Err(last.expect("at least one attempt"))
    }

    /// Clone one worker and wait for its handshake. The pid is tracked
    /// from the moment the clone returns so the reaper can clean up a
    /// child that dies before registering.
    fn spawn_worker(&self, spec: &WorkerSpec) -> Result<Worker, SpawnFailure> {
        let log_path = spec
            .log_egress
            .then(|| logs::worker_log_path(&self.log_dir, &uuid::Uuid::new_v4().to_string()));
        let stdio = match &log_path {
            Some(path) => StdioSink::LogFile(path),
            None => StdioSink::Null,
        };
        let spawned = udfbox_sandbox::spawn(&SpawnRequest {
            code_token: spec.code_token.as_str(),
            binary_path: &spec.binary_path,
            control_socket: self.control.socket_path(),
            mounts: &self.mounts,
            mode: self.mode,
            stdio,
        })?;

        {
            let mut state = self.state.lock().expect("pool lock");
            state.pids.insert(
                spawned.pid,
                PidMeta {
                    code_token: spec.code_token.clone(),
                    pivot_root_dir: spawned.pivot_root_dir,
                    log_path: log_path.clone(),
                    state: WorkerState::Starting,
                },
            );
        }

        match self.control.take(&spec.code_token, self.handshake_timeout) {
            Ok(control) => Ok(Worker {
                pid: spawned.pid,
                code_token: spec.code_token.clone(),
                control,
                log_path,
            }),
            Err(err) => {
                // The reaper sees a Starting-state exit and cleans up
                // without respawning; the spawner owns this retry.
                unsafe { libc::kill(spawned.pid, libc::SIGKILL) };
                Err(err.into())
            }
        }
    }

    fn enqueue_idle(&self, worker: Worker) {
        let mut guard = self.state.lock().expect("pool lock");
        let state = &mut *guard;
        match state.entries.get_mut(&worker.code_token) {
            Some(entry) => {
                if let Some(meta) = state.pids.get_mut(&worker.pid) {
                    meta.state = WorkerState::Idle;
                }
                entry.idle.push_back(worker);
                drop(guard);
                self.cv.notify_all();
            }
            None => {
                // Deleted while the spawn was in flight.
                if worker.pid > 0 {
                    unsafe { libc::kill(worker.pid, libc::SIGKILL) };
                }
            }
        }
    }
}

fn reaper_loop(inner: &Arc<Inner>) {
    loop {
        {
            let state = inner.state.lock().expect("pool lock");
            if state.shutdown && state.pids.is_empty() {
                return;
            }
            if state.pids.is_empty() {
                let _unused = inner.cv.wait_timeout(state, WAIT_SLICE);
                continue;
            }
        }

        let mut status: libc::c_int = 0;
        // SAFETY: plain waitpid; status is a valid out-pointer.
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid <= 0 {
            let errno = std::io::Error::last_os_error().raw_os_error();
            if errno == Some(libc::EINTR) || errno == Some(libc::ECHILD) {
                continue;
            }
            tracing::error!(?errno, "waitpid failed");
            continue;
        }
        handle_exit(inner, pid, status);
    }
}

fn handle_exit(inner: &Arc<Inner>, pid: libc::pid_t, status: libc::c_int) {
    let (meta, respawn_spec) = {
        let mut state = inner.state.lock().expect("pool lock");
        let Some(meta) = state.pids.remove(&pid) else {
            tracing::error!(pid, "waitpid returned unknown pid");
            return;
        };
        inner.cv.notify_all();
        let respawn = meta.state != WorkerState::Starting && !state.shutdown;
        let spec = respawn
            .then(|| state.entries.get(&meta.code_token).map(|e| e.spec.clone()))
            .flatten();
        (meta, spec)
    };

    tracing::debug!(
        pid,
        code_token = %meta.code_token,
        status,
        "reaped worker"
    );

    // Only after waitpid has returned may the pivot root go away.
    if let Err(err) = std::fs::remove_dir_all(&meta.pivot_root_dir) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                path = %meta.pivot_root_dir.display(),
                %err,
                "failed to remove pivot-root dir"
            );
        }
    }
    // A worker that never reached Busy has no watcher to read its log.
    if meta.state != WorkerState::Busy {
        logs::discard(meta.log_path.as_deref());
    }

    if let Some(spec) = respawn_spec {
        if let Err(err) = inner.spawn_with_retries(&spec) {
            let mut state = inner.state.lock().expect("pool lock");
            if let Some(entry) = state.entries.get_mut(&spec.code_token) {
                entry.degraded = true;
            }
            tracing::error!(
                code_token = %spec.code_token,
                %err,
                "respawn exhausted retries, marking code token degraded"
            );
        }
    }
}
