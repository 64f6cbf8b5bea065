//! Mount plumbing for the worker's restricted filesystem view.
//!
//! The worker child calls these in sequence, inside its own mount
//! namespace:
//!
//! 1. [`make_rprivate`] - detach mount propagation from the host
//! 2. [`bind`] - one bind per configured read-only path, placed at the
//!    same location under the pivot-root directory
//! 3. [`bind_self`] - bind the pivot-root directory onto itself
//!    (`pivot_root` refuses to operate on a plain directory) and make the
//!    subtree a slave so later host mounts cannot leak in
//! 4. [`enter_pivot_root`] - switch roots, parking the old root at
//!    `/pivot` and lazily detaching it
//! 5. [`remount_readonly`] - enforce read-only semantics on the binds,
//!    which plain `MS_BIND` does not
//!
//! All functions take pre-built `CStr`s where they run on the child side
//! of `clone`: the parent may be multi-threaded, so the child must not
//! allocate.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rustix::io::Errno;
use crate::last_errno;

/// Make all mounts private recursively.
pub fn make_rprivate() -> Result<(), Errno> {
    let ret = unsafe {
        libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Recursively bind `source` at `target`.
pub fn bind(source: &CStr, target: &CStr) -> Result<(), Errno> {
    let ret = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Bind the pivot-root directory onto itself and make the subtree a slave.
pub fn bind_self(dir: &CStr) -> Result<(), Errno> {
    let ret = unsafe {
        libc::mount(
            dir.as_ptr(),
            dir.as_ptr(),
            c"bind".as_ptr(),
            libc::MS_REC | libc::MS_BIND,
            std::ptr::null(),
        )
    };
    if ret != 0 {
        return Err(last_errno());
    }
    let ret = unsafe {
        libc::mount(
            dir.as_ptr(),
            dir.as_ptr(),
            c"bind".as_ptr(),
            libc::MS_REC | libc::MS_SLAVE,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Switch roots into `new_root`, moving the old root to `<new_root>/pivot`
/// and lazily detaching it. The `pivot` directory must already exist.
pub fn enter_pivot_root(new_root: &CStr, old_root: &CStr) -> Result<(), Errno> {
    rustix::process::pivot_root(new_root, old_root)?;
    if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
        return Err(last_errno());
    }
    if unsafe { libc::umount2(c"/pivot".as_ptr(), libc::MNT_DETACH) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Remount an existing bind read-only. Read-only still permits
/// execution, which is all the binary's directory needs.
pub fn remount_readonly(target: &CStr) -> Result<(), Errno> {
    let ret = unsafe {
        libc::mount(
            target.as_ptr(),
            target.as_ptr(),
            std::ptr::null(),
            libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

#[inline]
pub fn path_to_cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_to_cstring_valid() {
        let cstr = path_to_cstring(Path::new("/tmp/test")).unwrap();
        assert_eq!(cstr.as_bytes(), b"/tmp/test");
    }

    #[test]
    fn path_to_cstring_rejects_interior_nul() {
        use std::ffi::OsStr;
        let path = Path::new(OsStr::from_bytes(b"/tmp/\0bad"));
        assert!(path_to_cstring(path).is_err());
    }
}
