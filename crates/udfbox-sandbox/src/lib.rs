//! udfbox-sandbox: worker spawn and filesystem isolation
//!
//! This crate turns an opaque user-supplied executable into an isolated
//! worker process:
//!
//! - **Namespaces** - each worker is cloned into fresh mount, PID, IPC and
//!   UTS namespaces
//! - **Pivot root** - the worker's filesystem view is reduced to an
//!   explicit read-only mount list plus the binary's own directory
//! - **Capability stripping** - in gVisor mode the ambient and bounding
//!   capability sets are cleared and `NO_NEW_PRIVS` is set
//! - **Descriptor handoff** - the worker's RPC socket is dup'd and its
//!   number passed as `argv[1]`, the only contract the binary must honor
//!
//! The crate is spawn-only: it has no opinion about what flows over the
//! handed-off socket. Pooling, dispatch and framing live in the `udfbox`
//! crate.
//!
//! ## Requirements
//!
//! - Linux with mount/PID namespace privileges (CAP_SYS_ADMIN or root)
//! - A reachable control-plane socket for the worker handshake

pub mod caps;
pub mod launcher;
pub mod rootfs;

pub use launcher::{spawn, SandboxMode, Spawned, SpawnError, SpawnRequest, StdioSink};

use rustix::io::Errno;

/// Errno of the most recent failed libc call.
#[inline]
pub(crate) fn last_errno() -> Errno {
    Errno::from_raw_os_error(
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL),
    )
}
