//! Public façade: load, execute, cancel, delete, shutdown.
//!
//! A [`UdfService`] is an explicit service context: it owns the artifact
//! store, control plane, worker pool, dispatcher and both thread pools,
//! and tears all of them down in [`shutdown`](UdfService::shutdown) (also
//! run on drop). Nothing here is process-global except the `SIGPIPE`
//! disposition, which must be ignored so a worker closing its socket
//! mid-write surfaces as `EPIPE` instead of killing the host.
//!
//! ## Example
//!
//! ```ignore
//! use udfbox::{BinarySource, Config, ExecuteRequest, UdfService};
//!
//! let service = UdfService::new(Config::default())?;
//! let token = service.load_binary(BinarySource::Path("./my_udf".as_ref()), 4, false)?;
//! service.execute(
//!     ExecuteRequest::new(token.clone(), b"request".to_vec()),
//!     |completion| println!("{:?}", completion.result),
//!     None,
//! );
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::control::ControlPlane;
use crate::dispatch::Dispatcher;
use crate::error::{InvocationError, LoadError, LogError};
use crate::pool::{PoolStats, WorkerPool};
use crate::registry::CallbackRegistry;
use crate::threadpool::ThreadPool;
use crate::token::{CodeToken, ExecutionToken};
use crate::worker::WorkerSpec;

/// Terminal result of one invocation, delivered exactly once.
#[derive(Debug)]
pub struct Completion {
    pub execution_token: ExecutionToken,
    /// Response payload, or the terminal failure kind.
    pub result: Result<Vec<u8>, InvocationError>,
    /// The metadata passed to `execute`, returned and then purged.
    pub metadata: HashMap<String, String>,
}

/// Response callback. Runs on the caller pool, never under a service
/// lock.
pub type ResponseFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Log sink callback. `Err(LogError::NotFound)` when log egress is off.
pub type LogsFn = Box<dyn FnOnce(Result<String, LogError>) + Send + 'static>;

/// Where a binary comes from.
#[derive(Debug, Clone, Copy)]
pub enum BinarySource<'a> {
    Bytes(&'a [u8]),
    Path(&'a Path),
}

/// One invocation to dispatch.
#[derive(Debug)]
pub struct ExecuteRequest {
    pub code_token: CodeToken,
    pub payload: Vec<u8>,
    /// Opaque to the core; held for the invocation, delivered with the
    /// completion, then purged.
    pub metadata: HashMap<String, String>,
    /// Absolute bound on the invocation; expiry kills the worker.
    pub deadline: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(code_token: CodeToken, payload: Vec<u8>) -> Self {
        Self {
            code_token,
            payload,
            metadata: HashMap::new(),
            deadline: None,
        }
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Internal form handed to the dispatcher.
pub(crate) struct InvocationRequest {
    pub code_token: CodeToken,
    pub request: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub deadline: Option<Duration>,
    pub on_response: ResponseFn,
    pub on_logs: Option<LogsFn>,
}

enum DirHandle {
    Temp(TempDir),
    Fixed(PathBuf),
}

impl DirHandle {
    fn create(fixed: Option<PathBuf>, prefix: &str) -> io::Result<Self> {
        match fixed {
            Some(path) => {
                std::fs::create_dir_all(&path)?;
                Ok(Self::Fixed(path))
            }
            None => Ok(Self::Temp(TempDir::with_prefix(prefix)?)),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Temp(dir) => dir.path(),
            Self::Fixed(path) => path,
        }
    }
}

/// The sandboxed BYOB execution service.
pub struct UdfService {
    artifacts: ArtifactStore,
    control: Arc<ControlPlane>,
    pool: Arc<WorkerPool>,
    registry: Arc<CallbackRegistry>,
    dispatcher: Dispatcher,
    watchers: Arc<ThreadPool>,
    callers: Arc<ThreadPool>,
    max_workers: usize,
    shut: AtomicBool,
    // Held for their Drop: temp dirs outlive every worker referencing them.
    _socket_dir: DirHandle,
    _log_dir: DirHandle,
}

impl UdfService {
    pub fn new(config: Config) -> io::Result<Self> {
        // SAFETY: installing SIG_IGN for SIGPIPE is process-wide but
        // idempotent and required before any socket write.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        let socket_dir = DirHandle::create(config.socket_dir.clone(), "udfbox-sock-")?;
        let log_dir = DirHandle::create(config.log_dir.clone(), "udfbox-logs-")?;

        let control = Arc::new(ControlPlane::bind(
            &socket_dir.path().join("control.sock"),
            config.handshake_timeout,
        )?);
        let artifacts = ArtifactStore::new()?;

        let mut mounts = config.mounts.clone();
        mounts.push(artifacts.dir().to_path_buf());

        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&control),
            mounts,
            config.sandbox_mode,
            log_dir.path().to_path_buf(),
            config.handshake_timeout,
            config.acquire_timeout,
            config.spawn_retry_limit,
        )?);
        let registry = Arc::new(CallbackRegistry::new());
        let watchers = Arc::new(ThreadPool::new("udfbox-watch", config.watcher_threads));
        let callers = Arc::new(ThreadPool::new("udfbox-call", config.callback_threads));
        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&watchers),
            Arc::clone(&callers),
            config.max_frame_len,
        );

        tracing::info!(
            socket = %socket_dir.path().display(),
            "udf service started"
        );
        Ok(Self {
            artifacts,
            control,
            pool,
            registry,
            dispatcher,
            watchers,
            callers,
            max_workers: config.max_workers_per_binary,
            shut: AtomicBool::new(false),
            _socket_dir: socket_dir,
            _log_dir: log_dir,
        })
    }

    /// Load a binary and prewarm its workers. Returns once every worker
    /// has completed the control-plane handshake.
    pub fn load_binary(
        &self,
        source: BinarySource<'_>,
        worker_count: usize,
        log_egress: bool,
    ) -> Result<CodeToken, LoadError> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(LoadError::ShutDown);
        }
        if worker_count == 0 {
            return Err(LoadError::InvalidWorkerCount);
        }
        let max = self.max_workers;
        if worker_count > max {
            return Err(LoadError::TooManyWorkers {
                requested: worker_count,
                max,
            });
        }

        let (code_token, binary_path) = match source {
            BinarySource::Bytes(bytes) => self.artifacts.store(bytes)?,
            BinarySource::Path(path) => self.artifacts.store_from_path(path)?,
        };
        let spec = WorkerSpec {
            code_token: code_token.clone(),
            binary_path,
            worker_count,
            log_egress,
        };
        if let Err(err) = self.pool.prewarm(spec) {
            self.artifacts.forget(&code_token);
            return Err(err.into());
        }
        tracing::info!(
            code_token = %code_token,
            worker_count,
            log_egress,
            "binary loaded"
        );
        Ok(code_token)
    }

    /// Dispatch one invocation. The response callback fires exactly once
    /// with the terminal state; the log callback fires alongside it.
    pub fn execute(
        &self,
        request: ExecuteRequest,
        on_response: impl FnOnce(Completion) + Send + 'static,
        on_logs: Option<LogsFn>,
    ) -> ExecutionToken {
        self.dispatcher.dispatch(InvocationRequest {
            code_token: request.code_token,
            request: request.payload,
            metadata: request.metadata,
            deadline: request.deadline,
            on_response: Box::new(on_response),
            on_logs,
        })
    }

    /// Cancel a pending invocation. A no-op once the invocation has
    /// reached a terminal state.
    pub fn cancel(&self, token: &ExecutionToken) {
        if !self.registry.cancel(token) {
            tracing::debug!(execution_token = %token, "cancel after terminal state");
        }
    }

    /// Unload a binary: kill and reap its workers, remove their
    /// pivot-root directories, drop the artifact. Infallible from the
    /// caller's view.
    pub fn delete(&self, token: &CodeToken) {
        self.pool.delete(token);
        self.artifacts.forget(token);
    }

    /// Population counts for a loaded token; `None` after delete.
    pub fn pool_stats(&self, token: &CodeToken) -> Option<PoolStats> {
        self.pool.stats(token)
    }

    /// Drain and tear down: delete every code token, join every thread.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("udf service shutting down");
        for token in self.pool.tokens() {
            self.pool.delete(&token);
            self.artifacts.forget(&token);
        }
        self.pool.shutdown();
        self.control.shutdown();
        self.watchers.shutdown();
        self.callers.shutdown();
    }
}

impl Drop for UdfService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
