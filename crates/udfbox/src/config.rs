//! Service configuration.
//!
//! A `Config` describes everything the service needs: where its sockets
//! and logs live, what the sandbox exposes, and how its thread pools and
//! bounds are sized.
//!
//! ## Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `mounts` | `/lib`, `/lib64` |
//! | `sandbox_mode` | `gvisor` |
//! | `acquire_timeout` | 2 s |
//! | `handshake_timeout` | 5 s |
//! | `max_frame_len` | 64 MiB |
//! | `spawn_retry_limit` | 2 |
//! | `watcher_threads` | 16 |
//! | `callback_threads` | 4 |
//! | `max_workers_per_binary` | 128 |
//!
//! Socket and log directories default to fresh per-process temp
//! directories; point them somewhere explicit for operation under an
//! external monitor, where the socket directory must be reachable from
//! the workers' mount view.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
pub use udfbox_sandbox::SandboxMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the control-plane socket. `None` means a fresh
    /// per-process temp directory.
    pub socket_dir: Option<PathBuf>,

    /// Directory for per-worker log files. `None` means a fresh
    /// per-process temp directory.
    pub log_dir: Option<PathBuf>,

    /// Read-only paths visible inside every worker sandbox. The artifact
    /// directory is always appended.
    pub mounts: Vec<PathBuf>,

    pub sandbox_mode: SandboxMode,

    /// How long `execute` may wait for an idle worker before failing
    /// with `no_idle_worker`.
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,

    /// How long a freshly spawned worker gets to complete the
    /// control-plane handshake.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Cap on request and response frame payloads.
    pub max_frame_len: u64,

    /// Respawn attempts per worker slot before the pool marks the code
    /// token degraded.
    pub spawn_retry_limit: u32,

    /// Threads watching worker sockets for responses; bounds in-flight
    /// invocations.
    pub watcher_threads: usize,

    /// Threads delivering caller callbacks.
    pub callback_threads: usize,

    /// Admission bound on `worker_count` per loaded binary.
    pub max_workers_per_binary: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_dir: None,
            log_dir: None,
            mounts: vec![PathBuf::from("/lib"), PathBuf::from("/lib64")],
            sandbox_mode: SandboxMode::default(),
            acquire_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            max_frame_len: crate::frame::DEFAULT_MAX_FRAME_LEN,
            spawn_retry_limit: 2,
            watcher_threads: 16,
            callback_threads: 4,
            max_workers_per_binary: 128,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Replace the read-only mount list.
    pub fn mounts(mut self, mounts: impl IntoIterator<Item = PathBuf>) -> Self {
        self.mounts = mounts.into_iter().collect();
        self
    }

    pub fn sandbox_mode(mut self, mode: SandboxMode) -> Self {
        self.sandbox_mode = mode;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn max_frame_len(mut self, cap: u64) -> Self {
        self.max_frame_len = cap;
        self
    }

    pub fn watcher_threads(mut self, n: usize) -> Self {
        self.watcher_threads = n;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.mounts, vec![PathBuf::from("/lib"), PathBuf::from("/lib64")]);
        assert_eq!(cfg.sandbox_mode, SandboxMode::Gvisor);
        assert_eq!(cfg.spawn_retry_limit, 2);
        assert_eq!(cfg.max_frame_len, 64 * 1024 * 1024);
    }

    #[test]
    fn builder_setters() {
        let cfg = Config::new()
            .mounts([PathBuf::from("/usr/lib")])
            .sandbox_mode(SandboxMode::Namespaces)
            .acquire_timeout(Duration::from_millis(250));
        assert_eq!(cfg.mounts.len(), 1);
        assert_eq!(cfg.sandbox_mode, SandboxMode::Namespaces);
        assert_eq!(cfg.acquire_timeout, Duration::from_millis(250));
    }

    #[test]
    fn deserializes_from_table() {
        let cfg: Config = serde_json::from_str(
            r#"{"mounts": ["/lib64"], "sandbox_mode": "namespaces", "acquire_timeout": 500}"#,
        )
        .unwrap();
        assert_eq!(cfg.mounts, vec![PathBuf::from("/lib64")]);
        assert_eq!(cfg.sandbox_mode, SandboxMode::Namespaces);
        assert_eq!(cfg.acquire_timeout, Duration::from_millis(500));
    }
}
