//! Control plane: the rendezvous socket workers dial on startup.
//!
//! One `UnixListener` serves every worker of every loaded binary. A
//! dedicated accept thread reads the fixed 36-byte code-token handshake
//! from each connection and routes the stream into the per-token arrival
//! queue; the pool collects arrivals with [`ControlPlane::take`] in spawn
//! order, so the N-th worker spawned under a token becomes the N-th idle
//! slot.
//!
//! Connections announcing an unregistered token are closed with a log
//! record. The handshake read carries a timeout so one wedged child
//! cannot stall every other registration.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::token::{CodeToken, TOKEN_LEN};

#[derive(Debug, Error)]
pub enum ControlError {
    /// No worker completed the handshake within the deadline.
    #[error("timed out waiting for a worker handshake")]
    Timeout,

    /// The code token was deregistered while waiting.
    #[error("code token deregistered")]
    Deregistered,

    /// The control plane is shut down.
    #[error("control plane is shut down")]
    ShutDown,
}

struct Shared {
    queues: Mutex<HashMap<CodeToken, VecDeque<UnixStream>>>,
    arrivals: Condvar,
    shutdown: AtomicBool,
}

pub(crate) struct ControlPlane {
    shared: Arc<Shared>,
    listener_fd: i32,
    path: PathBuf,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPlane {
    /// Bind the listener and start the accept thread.
    pub fn bind(path: &Path, handshake_timeout: Duration) -> io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        let shared = Arc::new(Shared {
            queues: Mutex::new(HashMap::new()),
            arrivals: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let listener_fd = listener.as_raw_fd();

        let accept_shared = Arc::clone(&shared);
        let accept_thread = std::thread::Builder::new()
            .name("udfbox-accept".to_owned())
            .spawn(move || accept_loop(&listener, &accept_shared, handshake_timeout))?;

        Ok(Self {
            shared,
            listener_fd,
            path: path.to_path_buf(),
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    /// Filesystem path workers dial.
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Open an arrival queue for `token`. Must precede the first spawn.
    pub fn register(&self, token: &CodeToken) {
        self.shared
            .queues
            .lock()
            .expect("control lock")
            .entry(token.clone())
            .or_default();
    }

    /// Drop the arrival queue, closing any handshaken-but-unclaimed
    /// connections.
    pub fn deregister(&self, token: &CodeToken) {
        let removed = self
            .shared
            .queues
            .lock()
            .expect("control lock")
            .remove(token);
        if let Some(pending) = removed {
            if !pending.is_empty() {
                tracing::debug!(
                    code_token = %token,
                    count = pending.len(),
                    "closing unclaimed worker connections"
                );
            }
        }
        self.shared.arrivals.notify_all();
    }

    /// Wait for the oldest unclaimed arrival under `token`.
    pub fn take(&self, token: &CodeToken, timeout: Duration) -> Result<UnixStream, ControlError> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.shared.queues.lock().expect("control lock");
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(ControlError::ShutDown);
            }
            match queues.get_mut(token) {
                None => return Err(ControlError::Deregistered),
                Some(queue) => {
                    if let Some(stream) = queue.pop_front() {
                        return Ok(stream);
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ControlError::Timeout);
            }
            let (guard, _) = self
                .shared
                .arrivals
                .wait_timeout(queues, remaining)
                .expect("control lock");
            queues = guard;
        }
    }

    /// Stop accepting and join the accept thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Unblocks the accept thread; closing alone does not on Linux.
        unsafe { libc::shutdown(self.listener_fd, libc::SHUT_RDWR) };
        self.shared.arrivals.notify_all();
        if let Some(handle) = self.accept_thread.lock().expect("control lock").take() {
            handle.join().ok();
        }
        std::fs::remove_file(&self.path).ok();
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &UnixListener, shared: &Shared, handshake_timeout: Duration) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                tracing::warn!(%err, "control-plane accept failed");
                continue;
            }
        };
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match read_handshake(&stream, handshake_timeout) {
            Ok(token) => {
                let mut queues = shared.queues.lock().expect("control lock");
                match queues.get_mut(&token) {
                    Some(queue) => {
                        queue.push_back(stream);
                        drop(queues);
                        shared.arrivals.notify_all();
                    }
                    None => {
                        tracing::error!(code_token = %token, "unrecognized code token");
                    }
                }
            }
            Err(err) => {
                tracing::error!(%err, "worker handshake failed");
            }
        }
    }
}

fn read_handshake(mut stream: &UnixStream, timeout: Duration) -> io::Result<CodeToken> {
    stream.set_read_timeout(Some(timeout))?;
    let mut buf = [0u8; TOKEN_LEN];
    stream.read_exact(&mut buf)?;
    stream.set_read_timeout(None)?;
    CodeToken::from_bytes(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn plane(dir: &TempDir) -> ControlPlane {
        ControlPlane::bind(&dir.path().join("control.sock"), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn routes_handshakes_in_arrival_order() {
        let dir = TempDir::new().unwrap();
        let control = plane(&dir);
        let token = CodeToken::mint();
        control.register(&token);

        let mut clients = Vec::new();
        for marker in [b'a', b'b'] {
            let mut client = UnixStream::connect(control.socket_path()).unwrap();
            client.write_all(token.as_str().as_bytes()).unwrap();
            client.write_all(&[marker]).unwrap();
            clients.push(client);
        }

        for expected in [b'a', b'b'] {
            let mut stream = control.take(&token, Duration::from_secs(2)).unwrap();
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).unwrap();
            assert_eq!(byte[0], expected);
        }
    }

    #[test]
    fn take_times_out_when_nothing_arrives() {
        let dir = TempDir::new().unwrap();
        let control = plane(&dir);
        let token = CodeToken::mint();
        control.register(&token);
        let err = control.take(&token, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ControlError::Timeout));
    }

    #[test]
    fn take_fails_fast_for_unregistered_token() {
        let dir = TempDir::new().unwrap();
        let control = plane(&dir);
        let err = control
            .take(&CodeToken::mint(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ControlError::Deregistered));
    }

    #[test]
    fn deregister_wakes_waiters() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(plane(&dir));
        let token = CodeToken::mint();
        control.register(&token);

        let waiter = {
            let control = Arc::clone(&control);
            let token = token.clone();
            std::thread::spawn(move || control.take(&token, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(50));
        control.deregister(&token);
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ControlError::Deregistered)));
    }

    #[test]
    fn unknown_token_connection_is_closed() {
        let dir = TempDir::new().unwrap();
        let control = plane(&dir);
        let mut client = UnixStream::connect(control.socket_path()).unwrap();
        client
            .write_all(CodeToken::mint().as_str().as_bytes())
            .unwrap();
        let mut buf = [0u8; 1];
        // The accept loop drops the stream; the peer observes EOF.
        let n = client.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn shutdown_unblocks_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let control = plane(&dir);
        control.shutdown();
        control.shutdown();
        assert!(!control.socket_path().exists());
    }
}
