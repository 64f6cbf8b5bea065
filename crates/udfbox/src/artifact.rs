//! Artifact store: materializes uploaded binaries on disk.
//!
//! Binaries live under one per-process temp directory, each at a unique
//! UUID filename with owner read+execute permissions. The directory is
//! part of every sandbox's read-only mount list, so the stored path is
//! valid both on the host and inside the pivot-rooted worker.
//!
//! The store is append-only within a process lifetime: tokens never
//! collide, and `forget` only unlinks the file once no pool references
//! the token.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempDir;

use crate::error::LoadError;
use crate::token::CodeToken;

/// Owner read + execute: the sandbox may run the binary but nobody may
/// rewrite it.
const ARTIFACT_MODE: u32 = 0o500;

#[derive(Debug)]
pub(crate) struct ArtifactStore {
    dir: TempDir,
    entries: Mutex<HashMap<CodeToken, PathBuf>>,
}

impl ArtifactStore {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: TempDir::with_prefix("udfbox-artifacts-")?,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Host directory holding every artifact; bind-mounted into workers.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Write `bytes` under a fresh code token.
    pub fn store(&self, bytes: &[u8]) -> Result<(CodeToken, PathBuf), LoadError> {
        let token = CodeToken::mint();
        let path = self.dir.path().join(token.as_str());
        fs::write(&path, bytes).map_err(LoadError::BinaryRejected)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(ARTIFACT_MODE))
            .map_err(LoadError::BinaryRejected)?;
        self.entries
            .lock()
            .expect("artifact lock")
            .insert(token.clone(), path.clone());
        Ok((token, path))
    }

    /// Copy an existing file into the store. The source must be a regular
    /// file.
    pub fn store_from_path(&self, source: &Path) -> Result<(CodeToken, PathBuf), LoadError> {
        let meta = fs::metadata(source).map_err(LoadError::BinaryRejected)?;
        if !meta.is_file() {
            return Err(LoadError::BinaryRejected(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", source.display()),
            )));
        }
        let bytes = fs::read(source).map_err(LoadError::BinaryRejected)?;
        self.store(&bytes)
    }

    /// Remove the artifact for `token`. Idempotent.
    pub fn forget(&self, token: &CodeToken) {
        let removed = self.entries.lock().expect("artifact lock").remove(token);
        if let Some(path) = removed {
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %err, "failed to remove artifact");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_sets_exec_permissions() {
        let store = ArtifactStore::new().unwrap();
        let (_, path) = store.store(b"\x7fELF").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, ARTIFACT_MODE);
    }

    #[test]
    fn tokens_and_paths_are_unique() {
        let store = ArtifactStore::new().unwrap();
        let (t1, p1) = store.store(b"a").unwrap();
        let (t2, p2) = store.store(b"a").unwrap();
        assert_ne!(t1, t2);
        assert_ne!(p1, p2);
    }

    #[test]
    fn forget_removes_the_file() {
        let store = ArtifactStore::new().unwrap();
        let (token, path) = store.store(b"bytes").unwrap();
        assert!(path.exists());
        store.forget(&token);
        assert!(!path.exists());
        store.forget(&token);
    }

    #[test]
    fn store_from_path_rejects_directories() {
        let store = ArtifactStore::new().unwrap();
        let dir = TempDir::new().unwrap();
        let err = store.store_from_path(dir.path()).unwrap_err();
        assert!(matches!(err, LoadError::BinaryRejected(_)));
    }

    #[test]
    fn store_from_path_copies_contents() {
        let store = ArtifactStore::new().unwrap();
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("udf");
        fs::write(&src, b"payload").unwrap();
        let (_, stored) = store.store_from_path(&src).unwrap();
        assert_eq!(fs::read(stored).unwrap(), b"payload");
    }
}
