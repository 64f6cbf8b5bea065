//! Per-invocation log capture.
//!
//! When log egress is enabled for a code token, every worker gets a
//! private file in the service log directory, dup'd over its
//! stdout/stderr before `execve`. On the invocation's terminal
//! transition the file is read to completion and handed to the caller's
//! log sink; workers without egress write to `/dev/null` and the sink
//! observes `NotFound`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::LogError;

/// Fresh log path for one worker under `log_dir`.
pub(crate) fn worker_log_path(log_dir: &Path, worker_id: &str) -> PathBuf {
    log_dir.join(format!("{worker_id}.log"))
}

/// Read captured output for a finished invocation.
///
/// `None` means egress was disabled. A path whose file vanished also
/// reports `NotFound` rather than an I/O error: delete may race the
/// final read, and the caller asked for logs that no longer exist either
/// way.
pub(crate) fn collect(log_path: Option<&Path>) -> Result<String, LogError> {
    let Some(path) = log_path else {
        return Err(LogError::NotFound);
    };
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(LogError::NotFound),
        Err(err) => Err(LogError::Io(err)),
    }
}

/// Best-effort removal once the invocation is done with the file.
pub(crate) fn discard(log_path: Option<&Path>) {
    if let Some(path) = log_path {
        fs::remove_file(path).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn disabled_egress_is_not_found() {
        assert!(matches!(collect(None), Err(LogError::NotFound)));
    }

    #[test]
    fn reads_captured_content() {
        let dir = TempDir::new().unwrap();
        let path = worker_log_path(dir.path(), "worker-1");
        fs::write(&path, "line1\nline2\n").unwrap();
        assert_eq!(collect(Some(&path)).unwrap(), "line1\nline2\n");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = worker_log_path(dir.path(), "gone");
        assert!(matches!(collect(Some(&path)), Err(LogError::NotFound)));
    }

    #[test]
    fn discard_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = worker_log_path(dir.path(), "w");
        fs::write(&path, "x").unwrap();
        discard(Some(&path));
        assert!(!path.exists());
        discard(Some(&path));
    }
}
