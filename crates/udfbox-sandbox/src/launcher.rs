//! Worker launcher: clone into fresh namespaces, sandbox, exec.
//!
//! [`spawn`] produces one worker process from a [`SpawnRequest`]:
//!
//! 1. The parent prepares everything that allocates: the ephemeral
//!    pivot-root directory, bind-mount target directories, `CString`
//!    paths, the control-socket address and the stdio sink descriptors.
//! 2. `clone(2)` places the child in new mount, PID, IPC and UTS
//!    namespaces (`SIGCHLD` so the pool's reaper observes the exit).
//! 3. The child redirects stdio, dials the control plane and writes the
//!    36-byte code-token handshake, performs the pivot-root mount dance,
//!    optionally strips capabilities, dups the socket and execs the UDF
//!    binary with `argv[1] = decimal(fd)`.
//!
//! The child side runs on a copied address space while the parent may be
//! multi-threaded, so between `clone` and `execve` it performs no heap
//! allocation: every buffer it touches was prepared by the parent.
//!
//! A child that fails setup exits with status 125 (126 if `execve` itself
//! returned); the parent only reports [`SpawnError`] when `clone` never
//! produced a pid.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use rustix::io::Errno;
use serde::Deserialize;
use thiserror::Error;

use crate::rootfs::{self, path_to_cstring};
use crate::{caps, last_errno};

/// Number of bytes in the code-token handshake.
pub const TOKEN_HANDSHAKE_LEN: usize = 36;

const CHILD_STACK_SIZE: usize = 1 << 20;

/// How the worker is expected to be supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// An external monitor (gVisor) fronts the worker; ambient and
    /// bounding capability sets are cleared and `NO_NEW_PRIVS` is set.
    #[default]
    Gvisor,
    /// Namespace and mount isolation only; capabilities are left to the
    /// operator.
    Namespaces,
}

/// Where the worker's stdout/stderr go.
#[derive(Debug, Clone, Copy)]
pub enum StdioSink<'a> {
    /// Both streams to `/dev/null`.
    Null,
    /// Both streams appended to this host-side file, opened before the
    /// mount dance so the path need not be visible inside the sandbox.
    LogFile(&'a Path),
}

/// Everything needed to produce one worker.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    /// 36-byte token written as the control-plane handshake.
    pub code_token: &'a str,
    /// Absolute path of the UDF binary on the host.
    pub binary_path: &'a Path,
    /// Filesystem path of the control-plane listener.
    pub control_socket: &'a Path,
    /// Read-only paths made visible inside the sandbox (shared libraries,
    /// the artifact directory). Missing paths are skipped.
    pub mounts: &'a [PathBuf],
    pub mode: SandboxMode,
    pub stdio: StdioSink<'a>,
}

/// Handle for a launched worker. The pivot-root directory is owned by the
/// caller and must only be removed after the pid has been reaped.
#[derive(Debug)]
pub struct Spawned {
    pub pid: libc::pid_t,
    pub pivot_root_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("code token must be {TOKEN_HANDSHAKE_LEN} bytes, got {0}")]
    Token(usize),

    #[error("pivot-root dir: {0}")]
    PivotDir(io::Error),

    #[error("stdio sink: {0}")]
    Stdio(io::Error),

    #[error("control socket path too long: {0}")]
    SocketPath(PathBuf),

    #[error("path: {0}")]
    Path(Errno),

    #[error("clone: {0}")]
    Clone(Errno),
}

/// Parent-prepared state the child consumes without allocating.
struct ChildPlan {
    token: [u8; TOKEN_HANDSHAKE_LEN],
    control_addr: libc::sockaddr_un,
    /// (source on host, target under the pivot dir, target after pivot).
    binds: Vec<(CString, CString, CString)>,
    pivot_dir: CString,
    old_root: CString,
    binary_dir: CString,
    binary: CString,
    env: CString,
    mode: SandboxMode,
    null_fd: RawFd,
    sink_fd: RawFd,
}

/// Launch one sandboxed worker.
pub fn spawn(req: &SpawnRequest<'_>) -> Result<Spawned, SpawnError> {
    if req.code_token.len() != TOKEN_HANDSHAKE_LEN {
        return Err(SpawnError::Token(req.code_token.len()));
    }

    let pivot_root_dir = tempfile::Builder::new()
        .prefix("udfbox-worker-")
        .tempdir()
        .map_err(SpawnError::PivotDir)?
        .into_path();

    match prepare_and_clone(req, &pivot_root_dir) {
        Ok(pid) => {
            tracing::debug!(pid, code_token = req.code_token, "spawned worker");
            Ok(Spawned {
                pid,
                pivot_root_dir,
            })
        }
        Err(err) => {
            std::fs::remove_dir_all(&pivot_root_dir).ok();
            Err(err)
        }
    }
}

fn prepare_and_clone(
    req: &SpawnRequest<'_>,
    pivot_root_dir: &Path,
) -> Result<libc::pid_t, SpawnError> {
    // Bind targets and the old-root parking directory must exist before
    // the child starts mounting.
    let mut binds = Vec::new();
    for mount in req.mounts {
        if !mount.exists() {
            tracing::debug!(path = %mount.display(), "skipping missing mount");
            continue;
        }
        let under_pivot = rebase(pivot_root_dir, mount);
        std::fs::create_dir_all(&under_pivot).map_err(SpawnError::PivotDir)?;
        binds.push((
            path_to_cstring(mount).map_err(SpawnError::Path)?,
            path_to_cstring(&under_pivot).map_err(SpawnError::Path)?,
            path_to_cstring(mount).map_err(SpawnError::Path)?,
        ));
    }
    let old_root = pivot_root_dir.join("pivot");
    std::fs::create_dir_all(&old_root).map_err(SpawnError::PivotDir)?;

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(SpawnError::Stdio)?;
    let sink: Option<OwnedFd> = match req.stdio {
        StdioSink::Null => None,
        StdioSink::LogFile(path) => Some(
            OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .mode(0o600)
                .open(path)
                .map_err(SpawnError::Stdio)?
                .into(),
        ),
    };

    let binary_dir = req.binary_path.parent().unwrap_or(Path::new("/"));
    let plan = ChildPlan {
        token: req.code_token.as_bytes().try_into().expect("length checked"),
        control_addr: unix_addr(req.control_socket)?,
        binds,
        pivot_dir: path_to_cstring(pivot_root_dir).map_err(SpawnError::Path)?,
        old_root: path_to_cstring(&old_root).map_err(SpawnError::Path)?,
        binary_dir: path_to_cstring(binary_dir).map_err(SpawnError::Path)?,
        binary: path_to_cstring(req.binary_path).map_err(SpawnError::Path)?,
        env: ld_library_path(req.mounts),
        mode: req.mode,
        null_fd: null.as_raw_fd(),
        sink_fd: sink.as_ref().map_or(null.as_raw_fd(), AsRawFd::as_raw_fd),
    };

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS;

    // SAFETY: the callback only touches `plan` (fully prepared above) and
    // raw syscalls; it never returns to Rust code that assumes parent
    // state, and the address space is copied (no CLONE_VM).
    let pid = unsafe {
        nix::sched::clone(
            Box::new(|| child_main(&plan)),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| SpawnError::Clone(Errno::from_raw_os_error(e as i32)))?;

    Ok(pid.as_raw())
}

fn rebase(pivot_root_dir: &Path, mount: &Path) -> PathBuf {
    let relative = mount.strip_prefix("/").unwrap_or(mount);
    pivot_root_dir.join(relative)
}

fn unix_addr(path: &Path) -> Result<libc::sockaddr_un, SpawnError> {
    // SAFETY: sockaddr_un is plain-old-data; all-zero is a valid initial state.
    let mut sa: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    sa.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= sa.sun_path.len() {
        return Err(SpawnError::SocketPath(path.to_path_buf()));
    }
    for (dst, src) in sa.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(sa)
}

fn ld_library_path(mounts: &[PathBuf]) -> CString {
    let joined = mounts
        .iter()
        .map(|m| m.to_string_lossy())
        .collect::<Vec<_>>()
        .join(":");
    CString::new(format!("LD_LIBRARY_PATH={joined}")).unwrap_or_else(|_| {
        CString::new("LD_LIBRARY_PATH=/lib:/lib64").expect("static string")
    })
}

const EXIT_SETUP_FAILED: isize = 125;
const EXIT_EXEC_FAILED: isize = 126;

/// Child side. No allocation, no locks: syscalls over parent-prepared
/// buffers only.
fn child_main(plan: &ChildPlan) -> isize {
    // Stdio first so anything the UDF prints lands in the sink.
    unsafe {
        if libc::dup2(plan.null_fd, 0) < 0
            || libc::dup2(plan.sink_fd, 1) < 0
            || libc::dup2(plan.sink_fd, 2) < 0
        {
            return EXIT_SETUP_FAILED;
        }
    }

    // Dial the control plane and announce the code token while the host
    // paths are still visible.
    let sock = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return whine(b"worker: socket() failed\n");
    }
    let connected = unsafe {
        libc::connect(
            sock,
            std::ptr::addr_of!(plan.control_addr).cast(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if connected != 0 {
        return whine(b"worker: control-plane connect failed\n");
    }
    if write_all(sock, &plan.token).is_err() {
        return whine(b"worker: handshake write failed\n");
    }

    // Restricted filesystem: pivot_root refuses shared mount points.
    if rootfs::make_rprivate().is_err() {
        return whine(b"worker: remount private failed\n");
    }
    for (source, under_pivot, _) in &plan.binds {
        if rootfs::bind(source, under_pivot).is_err() {
            return whine(b"worker: bind mount failed\n");
        }
    }
    if rootfs::bind_self(&plan.pivot_dir).is_err() {
        return whine(b"worker: self bind failed\n");
    }
    if rootfs::enter_pivot_root(&plan.pivot_dir, &plan.old_root).is_err() {
        return whine(b"worker: pivot_root failed\n");
    }
    for (_, _, in_sandbox) in &plan.binds {
        if rootfs::remount_readonly(in_sandbox).is_err() {
            return whine(b"worker: readonly remount failed\n");
        }
    }
    if rootfs::remount_readonly(&plan.binary_dir).is_err() {
        return whine(b"worker: binary remount failed\n");
    }

    if plan.mode == SandboxMode::Gvisor && caps::drop_all().is_err() {
        return whine(b"worker: capability drop failed\n");
    }

    // Handoff: dup clears CLOEXEC so the descriptor survives execve.
    let rpc_fd = unsafe { libc::dup(sock) };
    if rpc_fd < 0 {
        return whine(b"worker: dup failed\n");
    }
    let mut fd_buf = [0u8; 12];
    let fd_arg = format_fd(rpc_fd, &mut fd_buf);

    let argv: [*const libc::c_char; 3] = [plan.binary.as_ptr(), fd_arg, std::ptr::null()];
    let envp: [*const libc::c_char; 2] = [plan.env.as_ptr(), std::ptr::null()];
    unsafe { libc::execve(plan.binary.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
    whine(b"worker: execve failed\n");
    EXIT_EXEC_FAILED
}

fn whine(msg: &[u8]) -> isize {
    unsafe { libc::write(2, msg.as_ptr().cast(), msg.len()) };
    EXIT_SETUP_FAILED
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<(), ()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n <= 0 {
            if n < 0 && last_errno() == Errno::INTR {
                continue;
            }
            return Err(());
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Render `fd` as a NUL-terminated decimal string into `buf`.
fn format_fd(fd: RawFd, buf: &mut [u8; 12]) -> *const libc::c_char {
    let mut digits = [0u8; 10];
    let mut n = fd as u32;
    let mut len = 0;
    loop {
        digits[len] = b'0' + (n % 10) as u8;
        n /= 10;
        len += 1;
        if n == 0 {
            break;
        }
    }
    for i in 0..len {
        buf[i] = digits[len - 1 - i];
    }
    buf[len] = 0;
    buf.as_ptr().cast()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn format_fd_decimal() {
        let mut buf = [0u8; 12];
        let ptr = format_fd(1073741823, &mut buf);
        let s = unsafe { CStr::from_ptr(ptr) };
        assert_eq!(s.to_str().unwrap(), "1073741823");

        let ptr = format_fd(0, &mut buf);
        let s = unsafe { CStr::from_ptr(ptr) };
        assert_eq!(s.to_str().unwrap(), "0");
    }

    #[test]
    fn rebase_strips_leading_slash() {
        let target = rebase(Path::new("/tmp/pivot"), Path::new("/lib64"));
        assert_eq!(target, Path::new("/tmp/pivot/lib64"));
    }

    #[test]
    fn unix_addr_rejects_oversized_path() {
        let long = "/tmp/".to_string() + &"x".repeat(200);
        assert!(unix_addr(Path::new(&long)).is_err());
    }

    #[test]
    fn ld_library_path_joins_mounts() {
        let env = ld_library_path(&[PathBuf::from("/lib"), PathBuf::from("/lib64")]);
        assert_eq!(env.to_str().unwrap(), "LD_LIBRARY_PATH=/lib:/lib64");
    }

    #[test]
    fn spawn_rejects_short_token() {
        let req = SpawnRequest {
            code_token: "short",
            binary_path: Path::new("/bin/true"),
            control_socket: Path::new("/tmp/none.sock"),
            mounts: &[],
            mode: SandboxMode::Namespaces,
            stdio: StdioSink::Null,
        };
        assert!(matches!(spawn(&req), Err(SpawnError::Token(5))));
    }
}
