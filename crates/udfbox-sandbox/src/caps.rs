//! Capability stripping for workers running under an external monitor.
//!
//! Clears the ambient set, drops every capability from the bounding set,
//! and sets `NO_NEW_PRIVS`. The order matters: ambient must be cleared
//! before the bounding set is emptied, and `NO_NEW_PRIVS` seals both.

use rustix::io::Errno;

use crate::last_errno;

/// Drop every capability the worker could pass to the UDF binary.
pub fn drop_all() -> Result<(), Errno> {
    unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        );
        for cap in 0..64 {
            // Stops failing with EINVAL past the last known capability.
            libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0);
        }
    }

    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}
