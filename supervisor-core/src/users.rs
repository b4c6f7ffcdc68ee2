//! User-namespace identity mapping and credential dropping.
//!
//! The sandbox always sees itself as uid/gid 1000; the outer identity is
//! masked by a single-line `/proc/self/uid_map` entry. The kernel interface
//! expects lines of the form `ID-inside-ns ID-outside-ns length`.

use crate::errors::ProcfsError;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{Gid, Uid};
use std::fs;
use std::io;
use std::path::PathBuf;

/// The uid/gid the sandbox observes for itself.
pub const SANDBOX_UID: u32 = 1000;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Writes `deny` to `/proc/self/setgroups` when the file exists (it was
/// introduced in Linux 3.19; older kernels do not need it).
pub fn write_setgroups_if_present(contents: &str) -> Result<(), ProcfsError> {
    let path = PathBuf::from("/proc/self/setgroups");
    match fs::write(&path, contents) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProcfsError::WriteFailed {
            path,
            source_err: e,
        }),
    }
}

/// Writes a single mapping line to `/proc/self/{uid,gid}_map`. For an
/// unprivileged user namespace the kernel accepts exactly one line mapping
/// the caller's real id.
pub fn write_userns_map(kind: &str, contents: &str) -> Result<(), ProcfsError> {
    let path = PathBuf::from(format!("/proc/self/{kind}_map"));
    fs::write(&path, contents).map_err(|e| ProcfsError::WriteFailed {
        path,
        source_err: e,
    })
}

/// Masks the outer identity: the sandbox sees 1000:1000 regardless of who
/// launched the supervisor. Must run after `unshare(CLONE_NEWUSER)` and
/// before anything relies on in-namespace permissions.
pub fn map_sandbox_ids(outer_uid: Uid, outer_gid: Gid) -> Result<()> {
    write_setgroups_if_present("deny\n").context("failed to deny setgroups")?;
    write_userns_map("uid", &format!("{SANDBOX_UID} {outer_uid} 1\n"))
        .context("failed to write uid_map")?;
    write_userns_map("gid", &format!("{SANDBOX_UID} {outer_gid} 1\n"))
        .context("failed to write gid_map")?;
    Ok(())
}

/// Drops every POSIX capability and tightens the umask.
///
/// Performed post-fork in both the supervisor and the app child, because the
/// child needs one final `unshare()` for its network namespace first.
///
/// The 0007 umask keeps grain data private from other users while granting
/// full access to the group, so a dedicated sandbox account and a real
/// administrator account can share a group over the data.
pub fn drop_credentials() -> Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // All bitmaps zeroed: no capabilities remain.
    let data = [CapUserData::default(); 2];

    let rc = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if rc != 0 {
        return Err(Errno::last()).context("capset failed");
    }

    umask(Mode::from_bits_truncate(0o007));
    Ok(())
}
