//! supervisor-core - Per-grain sandbox supervisor library
//!
//! One supervisor process runs per *grain* (a persistent instance of an
//! application). It builds a tight Linux isolation environment around the
//! app's entry command, mediates the app's lifecycle, serves a small RPC
//! surface on a Unix socket inside the grain's var directory, and keeps a
//! running estimate of the grain's on-disk footprint.
//!
//! ## Architecture
//!
//! - **Outer setup** (`setup`, `users`): namespaces, uid masking, the
//!   filesystem pivot, stdio plumbing. Runs before fork.
//! - **Child** (`child`, `network`, `seccomp`): final sandboxing and exec.
//! - **Supervisor** (`supervisor`, `watcher`, `wire`, `signals`): the
//!   poll-driven accept loop, disk watcher, idle timer, and exit paths.

pub mod child;
pub mod errors;
pub mod network;
pub mod paths;
pub mod seccomp;
pub mod setup;
pub mod signals;
pub mod structy;
pub mod supervisor;
pub mod users;
pub mod watcher;
pub mod wire;

pub use errors::UserError;
pub use paths::canonicalize_lenient;

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use nix::unistd::{fork, ForkResult};
use setup::GrainLock;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::{io, process};

#[cfg(feature = "cli")]
use clap::Args;

/// Default location of read-only application packages.
pub const DEFAULT_APPS_DIR: &str = "/var/sandstorm/apps";
/// Default location of mutable grain state.
pub const DEFAULT_GRAINS_DIR: &str = "/var/sandstorm/grains";

/// Behavioral switches for one supervisor run.
#[cfg_attr(feature = "cli", derive(Args))]
#[derive(Debug, Clone, Default)]
pub struct GrainOptions {
    /// Initializes a new grain. (Otherwise, runs an existing one.)
    #[cfg_attr(feature = "cli", arg(short = 'n', long = "new"))]
    pub is_new: bool,

    /// Mount procfs inside the sandbox. For security reasons, this is NOT
    /// RECOMMENDED during normal use, but it may be useful for debugging.
    #[cfg_attr(feature = "cli", arg(long = "proc"))]
    pub mount_proc: bool,

    /// Don't redirect the sandbox's stdio. Useful for debugging.
    #[cfg_attr(feature = "cli", arg(long = "stdio"))]
    pub keep_stdio: bool,

    /// Allow some system calls useful for debugging which are blocked in
    /// production.
    #[cfg_attr(feature = "cli", arg(long = "dev"))]
    pub dev_mode: bool,

    /// Dump a listing of the generated seccomp filter.
    #[cfg_attr(feature = "cli", arg(long = "seccomp-dump-pfc"))]
    pub dump_seccomp: bool,
}

/// Fully validated configuration for one grain supervisor.
#[derive(Debug, Clone)]
pub struct GrainConfig {
    /// Name of the application, used for the default package path. Never
    /// empty, never contains '/'.
    pub app_name: String,
    /// Id of the grain, used for the default var path. Never empty, never
    /// contains '/'.
    pub grain_id: String,
    /// Read-only application bundle. Defaults under [`DEFAULT_APPS_DIR`].
    pub pkg_path: Option<PathBuf>,
    /// Mutable grain state. Defaults under [`DEFAULT_GRAINS_DIR`].
    pub var_path: Option<PathBuf>,
    /// Environment passed to the app, as NAME=VALUE pairs. Nothing is
    /// inherited from the supervisor's own environment.
    pub env: Vec<String>,
    /// The app's entry command. Never empty.
    pub command: Vec<String>,
    pub options: GrainOptions,
}

impl GrainConfig {
    fn effective_pkg_path(&self) -> PathBuf {
        self.pkg_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_APPS_DIR).join(&self.app_name))
    }

    fn effective_var_path(&self) -> PathBuf {
        self.var_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_GRAINS_DIR).join(&self.grain_id))
    }
}

fn write_status_line(line: &str) -> Result<()> {
    io::stdout()
        .write_all(line.as_bytes())
        .and_then(|()| io::stdout().flush())
        .context("failed to write status line")
}

/// Runs the grain supervisor to completion and returns the process exit
/// code.
pub fn run(config: GrainConfig) -> Result<i32> {
    // A weird signal mask inherited from the launcher would confuse all of
    // the signal plumbing below.
    signals::reset_signal_mask()?;

    // The ip_tables probe needs the host's /proc, so it runs before any
    // namespace work.
    let have_ip_tables = network::is_ip_tables_loaded()?;

    let pkg_path = config.effective_pkg_path();
    let var_path = config.effective_var_path();

    // Single-instance gate: keep-alive any supervisor already serving this
    // grain and bow out before touching filesystem state.
    if supervisor::check_if_already_running(&var_path) {
        write_status_line("Already running...\n")?;
        return Ok(0);
    }

    // Outer sandbox setup. Order matters everywhere below.
    nix::sys::prctl::set_no_new_privs().context("PR_SET_NO_NEW_PRIVS failed")?;
    paths::close_extra_fds()?;
    setup::check_paths(
        &pkg_path,
        &var_path,
        config.options.is_new,
        &config.grain_id,
    )?;
    let _grain_lock = match setup::lock_grain(&var_path)? {
        GrainLock::Held(lock) => lock,
        GrainLock::AlreadyLocked => {
            write_status_line("Already running...\n")?;
            return Ok(0);
        }
    };
    setup::unshare_outer()?;
    let (_supervisor_dir, mount_proc) =
        setup::setup_filesystem(&pkg_path, &var_path, config.options.mount_proc)?;
    setup::setup_stdio(config.options.keep_stdio)?;

    tracing::info!("Starting up grain.");

    signals::register_handlers()?;

    // Block SIGCHLD before fork so an app that exits instantly parks its
    // signal until the supervisor's signalfd exists.
    let mut sigchld = SigSet::empty();
    sigchld.add(Signal::SIGCHLD);
    sigchld.thread_block().context("failed to block SIGCHLD")?;

    // The API socket pair; the child's end becomes its fd 3.
    let (supervisor_api, app_api) =
        UnixStream::pair().context("failed to create API socket pair")?;

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            drop(supervisor_api);
            let err = match child::run_child(
                app_api,
                &config.command,
                &config.env,
                &config.options,
                mount_proc,
                have_ip_tables,
            ) {
                Err(err) => err,
                Ok(never) => match never {},
            };
            // We are a fork of the supervisor: report and exit without
            // running any of its cleanup.
            eprintln!("sandboxed app setup failed: {err:?}");
            process::exit(1);
        }
        ForkResult::Parent { child } => {
            signals::set_child_pid(child);
            let _guard = signals::ChildGuard;
            drop(app_api);
            supervisor::run_supervisor(supervisor_api, &config.options)
        }
    }
}
