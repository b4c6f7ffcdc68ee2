//! Process-wide signal disposition, the idle timer, and guaranteed child
//! termination.
//!
//! The supervisor must kill the app on *every* exit path. Terminal signals
//! are handled directly in the signal handler (kill + `_exit`); ordinary
//! returns and panics are covered by a [`ChildGuard`] established right
//! after fork.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Pid of the sandboxed app, 0 when there is none. Written by the main loop
/// (after fork, after reap) and by the signal handler (cleared on kill).
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Set by the `keepAlive` RPC, cleared by each idle-timer tick. Starts true
/// so that a freshly launched grain survives its first tick.
static KEEP_ALIVE: AtomicBool = AtomicBool::new(true);

/// The idle timer fires every 90 seconds; two consecutive ticks without a
/// keep-alive terminate the supervisor. Clients normally send keep-alives
/// every minute, and a missed one is harmless: the grain transparently
/// restarts on the next request.
const IDLE_TICK_SECS: i64 = 90;

/// Signals that by default terminate the process.
const DEATH_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGBUS,
    Signal::SIGIO,
    Signal::SIGPROF,
    Signal::SIGSYS,
    Signal::SIGTRAP,
    Signal::SIGVTALRM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGSTKFLT,
    Signal::SIGPWR,
    Signal::SIGPIPE,
];

pub fn set_child_pid(pid: Pid) {
    CHILD_PID.store(pid.as_raw(), Ordering::Relaxed);
}

/// Raw pid of the app child, 0 when none is running.
pub fn child_pid() -> i32 {
    CHILD_PID.load(Ordering::Relaxed)
}

pub fn clear_child_pid() {
    CHILD_PID.store(0, Ordering::Relaxed);
}

pub fn set_keep_alive() {
    KEEP_ALIVE.store(true, Ordering::Relaxed);
}

/// Sends SIGKILL to the app, if any. Async-signal-safe. Reaping is left to
/// init once the supervisor exits; pre-exit reaping happens on SIGCHLD in
/// the event loop.
pub fn kill_child() {
    let pid = CHILD_PID.swap(0, Ordering::Relaxed);
    if pid != 0 {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// Kills the app on drop. Established immediately after fork so that panics
/// and early error returns in the supervisor cannot orphan a live sandbox.
pub struct ChildGuard;

impl Drop for ChildGuard {
    fn drop(&mut self) {
        kill_child();
    }
}

/// Writes a message to stderr using only async-signal-safe operations.
fn write_safely(mut text: &[u8]) {
    while !text.is_empty() {
        let n = unsafe { libc::write(libc::STDERR_FILENO, text.as_ptr() as *const c_void, text.len()) };
        if n <= 0 {
            return;
        }
        text = &text[n as usize..];
    }
}

extern "C" fn signal_handler(signo: c_int) {
    if signo == libc::SIGALRM {
        if KEEP_ALIVE.swap(false, Ordering::Relaxed) {
            write_safely(b"** GRAIN SUPERVISOR: Grain still in use; staying up for now.\n");
            return;
        }
        write_safely(b"** GRAIN SUPERVISOR: Grain no longer in use; shutting down.\n");
        kill_child();
        unsafe { libc::_exit(0) };
    }

    if signo == libc::SIGINT || signo == libc::SIGTERM {
        write_safely(b"** GRAIN SUPERVISOR: Grain supervisor terminated by signal.\n");
        kill_child();
        unsafe { libc::_exit(0) };
    }

    write_safely(b"** GRAIN SUPERVISOR: Grain supervisor crashed due to signal.\n");
    kill_child();
    unsafe { libc::_exit(1) };
}

/// Installs the handler for SIGALRM and every death signal, then arms the
/// idle interval timer.
///
/// The handler runs with a full signal mask (it completes or exits quickly,
/// so there is no point making it interruptible). The timer is not inherited
/// over fork.
pub fn register_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(signal_handler),
        SaFlags::empty(),
        SigSet::all(),
    );

    unsafe {
        sigaction(Signal::SIGALRM, &action).context("sigaction(SIGALRM) failed")?;
        for sig in DEATH_SIGNALS {
            sigaction(*sig, &action)
                .with_context(|| format!("sigaction({sig}) failed"))?;
        }
    }

    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: IDLE_TICK_SECS,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: IDLE_TICK_SECS,
            tv_usec: 0,
        },
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    Errno::result(rc).context("setitimer(ITIMER_REAL) failed")?;

    Ok(())
}

/// Clears any inherited signal mask. Called as early as possible so a weird
/// mask from the launcher cannot confuse later signal plumbing.
pub fn reset_signal_mask() -> Result<()> {
    nix::sys::signal::sigprocmask(
        nix::sys::signal::SigmaskHow::SIG_SETMASK,
        Some(&SigSet::empty()),
        None,
    )
    .context("sigprocmask(SIG_SETMASK) failed")?;
    Ok(())
}
