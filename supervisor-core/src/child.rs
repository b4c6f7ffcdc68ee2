//! The app side of the fork: final sandboxing steps and exec.

use crate::{network, seccomp, setup, users, GrainOptions};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{chdir, execve};
use std::convert::Infallible;
use std::ffi::CString;
use std::os::raw::c_int;
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;

/// The descriptor on which the app expects its API socket.
pub const API_SOCKET_FD: c_int = 3;

/// Not exported by libc; one past the highest real-time signal.
const NSIG: c_int = 65;

/// Completes the isolation that had to wait for fork: network namespace,
/// the pid-correct proc mount, credential drop, and finally seccomp, so
/// that the preceding steps can still use what it forbids.
fn enter_sandbox(options: &GrainOptions, mount_proc: bool, have_ip_tables: bool) -> Result<()> {
    chdir("/").context("chdir to sandbox root failed")?;

    network::unshare_network(have_ip_tables)?;
    setup::finish_mounting_proc(mount_proc)?;
    users::drop_credentials()?;

    let filter = seccomp::FilterProgram::build(options.dev_mode);
    if options.dump_seccomp {
        // To stderr: stdout carries the readiness protocol until exec.
        filter.dump(std::io::stderr())?;
    }
    filter.install()?;

    Ok(())
}

/// Restores default dispositions and unblocks everything. exec() preserves
/// ignored signals and the mask, and the supervisor side both ignores and
/// blocks things the app should receive normally.
fn reset_signal_handlers() -> Result<()> {
    for signo in 1..NSIG {
        // The only possible error is EINVAL for the unsettable signals;
        // we don't care.
        unsafe { libc::signal(signo, libc::SIG_DFL) };
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .context("failed to unblock signals")?;
    Ok(())
}

/// Post-fork child path: finish sandboxing, renumber descriptors, exec the
/// app. Only ever returns an error; on success the process image is
/// replaced.
pub fn run_child(
    api_socket: UnixStream,
    command: &[String],
    env: &[String],
    options: &GrainOptions,
    mount_proc: bool,
    have_ip_tables: bool,
) -> Result<Infallible> {
    enter_sandbox(options, mount_proc, have_ip_tables)?;
    reset_signal_handlers()?;

    // The app expects the API socket on fd 3.
    let api_fd = api_socket.into_raw_fd();
    if api_fd == API_SOCKET_FD {
        // Right descriptor already; just unset CLOEXEC.
        Errno::result(unsafe { libc::fcntl(api_fd, libc::F_SETFD, 0) })
            .context("failed to clear CLOEXEC on API socket")?;
    } else {
        // dup2 leaves CLOEXEC unset on the new descriptor.
        Errno::result(unsafe { libc::dup2(api_fd, API_SOCKET_FD) })
            .context("failed to move API socket to fd 3")?;
        unsafe { libc::close(api_fd) };
    }

    // Stdout belongs to the readiness protocol between the supervisor and
    // its launcher; the app must not be able to write to it. Fold it into
    // stderr, which already points at the grain log.
    Errno::result(unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) })
        .context("failed to redirect stdout to stderr")?;

    let argv: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .context("command contains a NUL byte")?;
    let envp: Vec<CString> = env
        .iter()
        .map(|var| CString::new(var.as_str()))
        .collect::<Result<_, _>>()
        .context("environment contains a NUL byte")?;

    execve(&argv[0], &argv, &envp)
        .with_context(|| format!("failed to exec {}", command[0]))
}
