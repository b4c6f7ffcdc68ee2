//! Outer sandbox construction.
//!
//! Everything here runs before fork. The contract: on return the process is
//! in fresh user/mount/IPC/UTS/PID namespaces, `/` is the read-only app
//! package, `.` is the grain's var directory, and the only remaining handle
//! into var from outside the sandbox is the returned directory descriptor.
//! The sequence is order-sensitive throughout.

use crate::errors::UserError;
use crate::users;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::{mknod, umask, Mode, SFlag};
use nix::unistd::{access, chdir, getgid, getuid, mkdir, pivot_root, sethostname, AccessFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Scratch mountpoint used while assembling the pivot. It lives in the
/// host's /tmp and is shared between runs; the mounts placed on it are
/// private to our mount namespace.
pub const SCRATCH_MOUNTPOINT: &str = "/tmp/sandstorm-grain";

/// Outcome of the cross-process grain lock.
pub enum GrainLock {
    /// We hold the lock; keep the value alive for the supervisor's lifetime.
    Held(Flock<File>),
    /// Another supervisor holds it.
    AlreadyLocked,
}

/// Creates or verifies the pkg and var directories and the grain log file.
pub fn check_paths(pkg_path: &Path, var_path: &Path, is_new: bool, grain_id: &str) -> Result<()> {
    // Be explicit about permissions from here on.
    umask(Mode::empty());

    access(pkg_path, AccessFlags::R_OK | AccessFlags::X_OK)
        .with_context(|| format!("package not accessible: {}", pkg_path.display()))?;

    if is_new {
        match mkdir(var_path, Mode::from_bits_truncate(0o770)) {
            Ok(()) => {}
            Err(Errno::EEXIST) => {
                return Err(UserError::GrainExists(grain_id.to_string()).into());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("mkdir failed: {}", var_path.display()));
            }
        }
        mkdir(&var_path.join("sandbox"), Mode::from_bits_truncate(0o770))
            .with_context(|| format!("mkdir failed: {}", var_path.join("sandbox").display()))?;
    } else {
        match access(
            var_path,
            AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK,
        ) {
            Ok(()) => {}
            Err(Errno::ENOENT) => {
                return Err(UserError::NoSuchGrain(grain_id.to_string()).into());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("grain var not accessible: {}", var_path.display()));
            }
        }
    }

    match mkdir(SCRATCH_MOUNTPOINT, Mode::from_bits_truncate(0o770)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(e).context("failed to create scratch mountpoint"),
    }

    // Create the log file while still outside the sandbox, so its ownership
    // reflects the launching user.
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(var_path.join("log"))
        .context("failed to create grain log file")?;

    Ok(())
}

/// Takes the per-grain startup lock.
///
/// The socket rendezvous in the single-instance gate has a window between
/// the liveness probe and the new socket bind; the flock on `<var>/lock`
/// closes it.
pub fn lock_grain(var_path: &Path) -> Result<GrainLock> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .open(var_path.join("lock"))
        .context("failed to open grain lock file")?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(GrainLock::Held(lock)),
        Err((_, Errno::EAGAIN)) => Ok(GrainLock::AlreadyLocked),
        Err((_, e)) => Err(e).context("flock on grain lock failed"),
    }
}

/// Unshares every outer namespace except network, masks our identity, and
/// detaches the mount tree from the host.
///
/// Network is deliberately left shared here: the loopback and netfilter
/// setup must run post-fork in the child so the supervisor keeps the host's
/// network view.
pub fn unshare_outer() -> Result<()> {
    let uid = getuid();
    let gid = getgid();

    // Unsharing the pid namespace is a little odd in that it does not affect
    // this process, only children created afterwards.
    unshare(
        CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWPID,
    )
    .context("unshare(user|mount|ipc|uts|pid) failed")?;

    users::map_sandbox_ids(uid, gid)?;

    // Without this, mount manipulations would propagate back to the host.
    mount(
        Some("none"),
        "/",
        None::<&Path>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("failed to make / recursively private")?;

    // A fake host/domain name so the grain can't see the real one. The UTS
    // namespace confines the change to us and our children.
    sethostname("sandbox").context("sethostname failed")?;
    let rc = unsafe { libc::setdomainname(b"sandbox".as_ptr() as *const libc::c_char, 7) };
    Errno::result(rc).context("setdomainname failed")?;

    Ok(())
}

/// Bind-mounts `src` onto `dst` and applies `flags`.
///
/// Mount flags are ignored on the initial MS_BIND despite what the
/// documentation claims; a second MS_REMOUNT pass is required to set them.
pub fn bind(src: &Path, dst: &Path, flags: MsFlags) -> Result<()> {
    mount(Some(src), dst, None::<&Path>, MsFlags::MS_BIND, None::<&str>).with_context(|| {
        format!("failed to bind {} on {}", src.display(), dst.display())
    })?;
    mount(
        Some(src),
        dst,
        None::<&Path>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | flags,
        None::<&str>,
    )
    .with_context(|| {
        format!(
            "failed to remount {} on {} with flags",
            src.display(),
            dst.display()
        )
    })?;
    Ok(())
}

/// Creates a regular-file mountpoint under `dev/` and binds the real device
/// onto it. A real device node made with mknod would not function here: the
/// tmpfs is mounted nodev, so we simulate nodes with bind mounts instead.
fn make_device_file(name: &str, real_name: &str) -> Result<()> {
    let dst = PathBuf::from("dev").join(name);
    mknod(&dst, SFlag::S_IFREG, Mode::from_bits_truncate(0o666), 0)
        .with_context(|| format!("failed to create dev/{name}"))?;
    mount(
        Some(&PathBuf::from("/dev").join(real_name)),
        &dst,
        None::<&Path>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("failed to bind /dev/{real_name} on dev/{name}"))?;
    Ok(())
}

fn anchor_exists(path: &str) -> bool {
    access(path, AccessFlags::F_OK).is_ok()
}

/// Builds the app-visible filesystem and pivots into it.
///
/// Returns the held descriptor for the grain's var directory (the
/// supervisor's only handle into var after the pivot) and the possibly
/// downgraded mount-proc flag (dropped when the package has no `proc`
/// anchor).
pub fn setup_filesystem(
    pkg_path: &Path,
    var_path: &Path,
    mount_proc: bool,
) -> Result<(File, bool)> {
    // The supervisor's private view of var: bind it to the scratch point,
    // grab a descriptor, and immediately detach the mount again so the app
    // can never reach it through the mount tree.
    bind(
        var_path,
        Path::new(SCRATCH_MOUNTPOINT),
        MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
    )?;
    let supervisor_dir =
        File::open(SCRATCH_MOUNTPOINT).context("failed to open supervisor directory")?;
    umount2(SCRATCH_MOUNTPOINT, MntFlags::MNT_DETACH)
        .context("failed to detach supervisor directory bind")?;

    // The app package becomes the sandbox root, read-only.
    bind(
        pkg_path,
        Path::new(SCRATCH_MOUNTPOINT),
        MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
    )?;
    chdir(SCRATCH_MOUNTPOINT).context("chdir to scratch mountpoint failed")?;

    // Optional inner mounts, keyed on empty anchor directories the package
    // chooses to expose.
    if anchor_exists("tmp") {
        // A private tmpfs per run: a shared one would have no quota
        // isolation, and this one evaporates with the mount namespace so
        // there is no cleanup to get wrong.
        mount(
            Some("sandstorm-tmp"),
            "tmp",
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("size=16m,nr_inodes=4k,mode=770"),
        )
        .context("failed to mount sandbox tmpfs")?;
    }
    if anchor_exists("dev") {
        mount(
            Some("sandstorm-dev"),
            "dev",
            Some("tmpfs"),
            MsFlags::MS_NOATIME | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            Some("size=1m,nr_inodes=16,mode=755"),
        )
        .context("failed to mount dev tmpfs")?;
        make_device_file("null", "null")?;
        make_device_file("zero", "zero")?;
        make_device_file("random", "urandom")?;
        make_device_file("urandom", "urandom")?;
        mount(
            Some("dev"),
            "dev",
            None::<&Path>,
            MsFlags::MS_REMOUNT
                | MsFlags::MS_BIND
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .context("failed to remount dev read-only")?;
    }
    if anchor_exists("var") {
        bind(&var_path.join("sandbox"), Path::new("var"), MsFlags::MS_NODEV)?;
    }
    if anchor_exists("proc/cpuinfo") {
        bind(
            Path::new("/proc/cpuinfo"),
            Path::new("proc/cpuinfo"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        )?;
    }

    // Keep a reference to the old root; it is the only way back out after
    // the pivot stacks the old root on top of the new one.
    let old_root = File::open("/").context("failed to open old root")?;

    let mut mount_proc = mount_proc;
    if mount_proc {
        if anchor_exists("proc") {
            // Bind the host proc to retain permission to mount proc at all.
            // This instance belongs to the wrong pid namespace; the child
            // replaces it after fork.
            mount(
                Some("/proc"),
                "proc",
                None::<&Path>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .context("failed to bind host /proc")?;
        } else {
            mount_proc = false;
        }
    }

    pivot_root(SCRATCH_MOUNTPOINT, SCRATCH_MOUNTPOINT).context("pivot_root failed")?;

    // Our root is now the sandbox, with the old root mounted on top of it;
    // "/" and "/." both resolve to the sandbox, so the old root can only be
    // reached (and detached) through the saved descriptor.
    fchdir(&old_root).context("fchdir to old root failed")?;
    umount2(".", MntFlags::MNT_DETACH).context("failed to detach old root")?;
    fchdir(&supervisor_dir).context("fchdir to supervisor directory failed")?;

    // Post-condition: '.' is the grain's var and '/' is the sandbox root.
    Ok((supervisor_dir, mount_proc))
}

fn fchdir(dir: &File) -> Result<(), Errno> {
    Errno::result(unsafe { libc::fchdir(dir.as_raw_fd()) }).map(drop)
}

/// Replaces stdin with /dev/null and points stderr at the grain log.
///
/// Stdin could be a TTY or some other descriptor with powers we do not want
/// the sandbox to inherit. Stdout is left alone: it carries the one-line
/// readiness protocol back to the launcher.
pub fn setup_stdio(keep_stdio: bool) -> Result<()> {
    if keep_stdio {
        return Ok(());
    }

    let dev_null = File::open("/dev/null").context("failed to open /dev/null")?;
    Errno::result(unsafe { libc::dup2(dev_null.as_raw_fd(), libc::STDIN_FILENO) })
        .context("failed to replace stdin")?;

    // Relative open: '.' is var after the pivot.
    let log = OpenOptions::new()
        .append(true)
        .open("log")
        .context("failed to open grain log")?;
    Errno::result(unsafe { libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO) })
        .context("failed to redirect stderr to log")?;

    Ok(())
}

/// Re-mounts proc for the child's pid namespace. Must run post-fork: only
/// then does the process live in the new pid namespace. A copy of proc must
/// stay mounted throughout or we lose the privilege of mounting it.
pub fn finish_mounting_proc(mount_proc: bool) -> Result<()> {
    if !mount_proc {
        return Ok(());
    }

    let old_proc = File::open("proc").context("failed to open stale proc")?;

    // Park the stale instance on the namespace root, which is mostly
    // inaccessible, then mount the correct one in its place.
    mount(
        Some("proc"),
        "/",
        None::<&Path>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .context("failed to move stale proc")?;
    mount(
        Some("proc"),
        "proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("failed to mount proc")?;

    fchdir(&old_proc).context("fchdir to stale proc failed")?;
    umount2(".", MntFlags::MNT_DETACH).context("failed to detach stale proc")?;
    chdir("/").context("chdir back to root failed")?;

    Ok(())
}
