//! The supervisor's post-fork runtime: a single-threaded poll loop joining
//! the accept loop, the child-exit wait, the disk watcher, and the app's
//! API socket. Whichever completes first decides the exit path.

use crate::signals;
use crate::watcher::DiskUsageWatcher;
use crate::wire::{self, ApiRequest, ApiResponse, FrameReader, Request, Response};
use crate::{seccomp, users, GrainOptions};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chroot, Pid};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::raw::c_void;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::{Duration, Instant};
use std::{fs, io};

/// Settling delay before answering a size-change waiter, to damp update
/// streams during heavy disk I/O.
const SIZE_CHANGE_DEBOUNCE: Duration = Duration::from_millis(100);

/// How long after the app drops its API socket we keep waiting for SIGCHLD
/// to deliver a precise exit status.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Probes an existing supervisor on the grain's socket with a keep-alive.
///
/// True means a live supervisor answered and this process should bow out.
/// Any failure to connect or to complete the call means the socket is
/// stale and startup proceeds. A race remains when two supervisors start
/// inside the same window; the grain flock closes it.
pub fn check_if_already_running(var_path: &Path) -> bool {
    let socket_path = var_path.join("socket");
    let mut stream = match UnixStream::connect(&socket_path) {
        Ok(stream) => stream,
        Err(_) => return false,
    };
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    matches!(
        wire::call_blocking(&mut stream, &Request::KeepAlive),
        Ok(Response::Ok)
    )
}

struct Connection {
    stream: UnixStream,
    reader: FrameReader,
    out: Vec<u8>,
    closed: bool,
}

struct SizeWaiter {
    conn: u64,
    old_size: u64,
    fire_at: Option<Instant>,
}

#[derive(Clone, Copy)]
enum Tag {
    Sigchld,
    Listener,
    Watcher,
    Api,
    Conn(u64),
}

/// Runs the supervisor until an exit path fires; returns the process exit
/// code. `api` is our end of the app's fd-3 socket.
pub fn run_supervisor(api: UnixStream, options: &GrainOptions) -> Result<i32> {
    // Our root directory is currently controlled by the app; if libc read,
    // say, /etc/nsswitch.conf from it, the grain could take over the
    // supervisor. Chroot into the supervisor directory (var) and put this
    // process in its own mini-sandbox.
    chroot(".").context("chroot into supervisor directory failed")?;
    users::drop_credentials()?;
    let filter = seccomp::FilterProgram::build(options.dev_mode);
    if options.dump_seccomp {
        filter.dump(std::io::stderr())?;
    }
    filter.install()?;

    // SIGCHLD was blocked before fork, so an early-exiting child parks its
    // signal in the pending set until the signalfd picks it up here.
    let mut sigset = SigSet::empty();
    sigset.add(Signal::SIGCHLD);
    let sigchld = SignalFd::with_flags(&sigset, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("failed to create signalfd")?;

    let watcher = DiskUsageWatcher::new(".")?;

    // Clear any stale socket from a previous supervisor.
    let _ = fs::remove_file("socket");
    let listener = UnixListener::bind("socket").context("failed to bind grain socket")?;
    listener
        .set_nonblocking(true)
        .context("failed to make listener non-blocking")?;
    api.set_nonblocking(true)
        .context("failed to make API socket non-blocking")?;

    // The launcher waits for exactly this line.
    io::stdout()
        .write_all(b"Listening...\n")
        .and_then(|()| io::stdout().flush())
        .context("failed to write readiness line")?;

    SupervisorLoop {
        listener,
        sigchld,
        watcher,
        api,
        api_reader: FrameReader::new(),
        api_out: Vec::new(),
        api_down: false,
        disconnect_deadline: None,
        conns: HashMap::new(),
        next_conn_id: 0,
        waiters: Vec::new(),
        main_view: None,
        view_waiters: Vec::new(),
        view_requested: false,
    }
    .run()
}

struct SupervisorLoop {
    listener: UnixListener,
    sigchld: SignalFd,
    watcher: DiskUsageWatcher,
    api: UnixStream,
    api_reader: FrameReader,
    api_out: Vec<u8>,
    api_down: bool,
    disconnect_deadline: Option<Instant>,
    conns: HashMap<u64, Connection>,
    next_conn_id: u64,
    waiters: Vec<SizeWaiter>,
    main_view: Option<serde_json::Value>,
    view_waiters: Vec<u64>,
    view_requested: bool,
}

/// Sends with MSG_NOSIGNAL so a vanished peer surfaces as EPIPE on this one
/// session instead of a process-wide SIGPIPE.
fn send_buffered(stream: &UnixStream, out: &mut Vec<u8>) -> io::Result<()> {
    while !out.is_empty() {
        let n = unsafe {
            libc::send(
                stream.as_raw_fd(),
                out.as_ptr() as *const c_void,
                out.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        out.drain(..n as usize);
    }
    Ok(())
}

/// Drains everything currently readable. Returns true on EOF.
fn read_available(stream: &mut UnixStream, reader: &mut FrameReader) -> io::Result<bool> {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => reader.extend(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

impl SupervisorLoop {
    fn run(mut self) -> Result<i32> {
        loop {
            if let Some(code) = self.fire_deadlines()? {
                return Ok(code);
            }

            let mut tags: Vec<Tag> = Vec::new();
            let mut fds: Vec<PollFd> = Vec::new();
            {
                let mut push = |fd: RawFd, events: PollFlags, tag: Tag| {
                    tags.push(tag);
                    fds.push(PollFd::new(
                        unsafe { BorrowedFd::borrow_raw(fd) },
                        events,
                    ));
                };
                push(self.sigchld.as_raw_fd(), PollFlags::POLLIN, Tag::Sigchld);
                push(self.listener.as_raw_fd(), PollFlags::POLLIN, Tag::Listener);
                push(self.watcher.raw_fd(), PollFlags::POLLIN, Tag::Watcher);
                if !self.api_down {
                    let mut events = PollFlags::POLLIN;
                    if !self.api_out.is_empty() {
                        events |= PollFlags::POLLOUT;
                    }
                    push(self.api.as_raw_fd(), events, Tag::Api);
                }
                for (id, conn) in &self.conns {
                    let mut events = PollFlags::POLLIN;
                    if !conn.out.is_empty() {
                        events |= PollFlags::POLLOUT;
                    }
                    push(conn.stream.as_raw_fd(), events, Tag::Conn(*id));
                }
            }

            match poll(&mut fds, self.poll_timeout()) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("poll failed"),
            }

            let ready: Vec<(Tag, PollFlags)> = tags
                .iter()
                .zip(fds.iter())
                .filter_map(|(tag, fd)| fd.revents().map(|revents| (*tag, revents)))
                .filter(|(_, revents)| !revents.is_empty())
                .collect();
            drop(fds);

            for (tag, revents) in ready {
                let exit = match tag {
                    Tag::Sigchld => self.handle_sigchld()?,
                    Tag::Listener => {
                        self.accept_connections()?;
                        None
                    }
                    Tag::Watcher => {
                        self.watcher.process_events()?;
                        None
                    }
                    Tag::Api => {
                        self.handle_api(revents);
                        None
                    }
                    Tag::Conn(id) => self.handle_conn(id, revents)?,
                };
                if let Some(code) = exit {
                    return Ok(code);
                }
            }

            self.arm_waiters();
            self.reap_closed();
        }
    }

    /// Computes how long poll may sleep: until the next waiter debounce or
    /// the app-disconnect grace runs out, or forever.
    fn poll_timeout(&self) -> PollTimeout {
        let mut next: Option<Instant> = None;
        let mut consider = |deadline: Instant| match next {
            Some(current) if current <= deadline => {}
            _ => next = Some(deadline),
        };
        for waiter in &self.waiters {
            if let Some(at) = waiter.fire_at {
                consider(at);
            }
        }
        if let Some(deadline) = self.disconnect_deadline {
            consider(deadline);
        }
        match next {
            None => PollTimeout::NONE,
            Some(deadline) => {
                let ms = deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u128::from(u16::MAX)) as u16;
                PollTimeout::from(ms)
            }
        }
    }

    /// Resolves due size waiters and enforces the disconnect grace.
    fn fire_deadlines(&mut self) -> Result<Option<i32>> {
        let now = Instant::now();
        let size = self.watcher.total_size();

        let mut due = Vec::new();
        self.waiters.retain(|waiter| match waiter.fire_at {
            Some(at) if at <= now => {
                due.push(waiter.conn);
                false
            }
            _ => true,
        });
        for conn_id in due {
            self.send_response(conn_id, &Response::GrainSize { size });
        }

        if let Some(deadline) = self.disconnect_deadline {
            if now >= deadline {
                tracing::error!("App disconnected API socket but didn't actually exit; killing it.");
                signals::kill_child();
                return Ok(Some(1));
            }
        }
        Ok(None)
    }

    /// Starts the debounce clock for waiters whose size has moved.
    fn arm_waiters(&mut self) {
        let size = self.watcher.total_size();
        let deadline = Instant::now() + SIZE_CHANGE_DEBOUNCE;
        for waiter in &mut self.waiters {
            if waiter.fire_at.is_none() && waiter.old_size != size {
                waiter.fire_at = Some(deadline);
            }
        }
    }

    fn handle_sigchld(&mut self) -> Result<Option<i32>> {
        while self
            .sigchld
            .read_signal()
            .context("failed to read signalfd")?
            .is_some()
        {}

        let pid = signals::child_pid();
        if pid == 0 {
            return Ok(None);
        }
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                signals::clear_child_pid();
                if code == 0 {
                    tracing::info!("App exited with status code: 0");
                    Ok(Some(0))
                } else {
                    tracing::error!("App exited with status code: {code}");
                    Ok(Some(1))
                }
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                signals::clear_child_pid();
                tracing::error!(
                    "App exited due to signal {} ({}).",
                    signal as i32,
                    signal.as_str()
                );
                Ok(Some(1))
            }
            Ok(_) => Ok(None),
            Err(Errno::ECHILD) => Ok(None),
            Err(e) => Err(e).context("waitpid failed"),
        }
    }

    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    stream
                        .set_nonblocking(true)
                        .context("failed to make connection non-blocking")?;
                    let id = self.next_conn_id;
                    self.next_conn_id += 1;
                    self.conns.insert(
                        id,
                        Connection {
                            stream,
                            reader: FrameReader::new(),
                            out: Vec::new(),
                            closed: false,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("accept on grain socket failed"),
            }
        }
    }

    /// Traffic on the app's API socket: view replies in, and hangup when
    /// the app goes away.
    fn handle_api(&mut self, revents: PollFlags) {
        if self.api_down {
            return;
        }

        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            match read_available(&mut self.api, &mut self.api_reader) {
                Ok(false) => {}
                Ok(true) => return self.app_disconnected(),
                Err(e) => {
                    tracing::warn!("error reading API socket: {e}");
                    return self.app_disconnected();
                }
            }

            loop {
                let payload = match self.api_reader.next_frame() {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("bad frame from app: {e}");
                        return self.app_disconnected();
                    }
                };
                match wire::decode::<ApiResponse>(&payload) {
                    Ok(ApiResponse::MainView { view }) => {
                        self.main_view = Some(view.clone());
                        let waiting = std::mem::take(&mut self.view_waiters);
                        for conn_id in waiting {
                            self.send_response(conn_id, &Response::MainView { view: view.clone() });
                        }
                    }
                    Err(e) => tracing::warn!("unintelligible message from app: {e}"),
                }
            }
        }

        if revents.contains(PollFlags::POLLOUT) {
            if let Err(e) = send_buffered(&self.api, &mut self.api_out) {
                tracing::warn!("error writing API socket: {e}");
                self.app_disconnected();
            }
        }
    }

    /// The app hung up its API socket. It probably exited and the signal
    /// has not arrived yet; give SIGCHLD a moment to produce a precise
    /// status before force-killing.
    fn app_disconnected(&mut self) {
        self.api_down = true;
        if self.disconnect_deadline.is_none() {
            self.disconnect_deadline = Some(Instant::now() + DISCONNECT_GRACE);
        }
        // Nobody is left to answer a view request.
        let waiting = std::mem::take(&mut self.view_waiters);
        for conn_id in waiting {
            self.send_response(
                conn_id,
                &Response::Error {
                    message: "app disconnected".to_string(),
                },
            );
        }
    }

    fn handle_conn(&mut self, id: u64, revents: PollFlags) -> Result<Option<i32>> {
        let mut payloads = Vec::new();
        {
            let Some(conn) = self.conns.get_mut(&id) else {
                return Ok(None);
            };

            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                match read_available(&mut conn.stream, &mut conn.reader) {
                    Ok(false) => {}
                    Ok(true) => conn.closed = true,
                    Err(e) => {
                        tracing::warn!("connection failed: {e}");
                        conn.closed = true;
                    }
                }
                loop {
                    match conn.reader.next_frame() {
                        Ok(Some(payload)) => payloads.push(payload),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("connection failed: {e}");
                            conn.closed = true;
                            break;
                        }
                    }
                }
            }

            if revents.contains(PollFlags::POLLOUT) {
                if let Err(e) = send_buffered(&conn.stream, &mut conn.out) {
                    tracing::warn!("connection failed: {e}");
                    conn.closed = true;
                }
            }
        }

        for payload in payloads {
            match wire::decode::<Request>(&payload) {
                Ok(request) => {
                    if let Some(code) = self.handle_request(id, request) {
                        return Ok(Some(code));
                    }
                }
                Err(e) => {
                    tracing::warn!("bad request: {e}");
                    self.send_response(
                        id,
                        &Response::Error {
                            message: format!("bad request: {e}"),
                        },
                    );
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.closed = true;
                    }
                }
            }
        }
        Ok(None)
    }

    fn handle_request(&mut self, id: u64, request: Request) -> Option<i32> {
        match request {
            Request::KeepAlive => {
                signals::set_keep_alive();
                self.send_response(id, &Response::Ok);
            }
            Request::Shutdown => {
                tracing::info!("shutdown requested");
                signals::kill_child();
                return Some(0);
            }
            Request::GetGrainSize => {
                let size = self.watcher.total_size();
                self.send_response(id, &Response::GrainSize { size });
            }
            Request::GetGrainSizeWhenDifferent { old_size } => {
                let fire_at = if self.watcher.total_size() != old_size {
                    Some(Instant::now() + SIZE_CHANGE_DEBOUNCE)
                } else {
                    None
                };
                self.waiters.push(SizeWaiter {
                    conn: id,
                    old_size,
                    fire_at,
                });
            }
            Request::GetMainView => {
                if let Some(view) = self.main_view.clone() {
                    self.send_response(id, &Response::MainView { view });
                } else if self.api_down {
                    self.send_response(
                        id,
                        &Response::Error {
                            message: "app disconnected".to_string(),
                        },
                    );
                } else {
                    self.view_waiters.push(id);
                    if !self.view_requested {
                        self.view_requested = true;
                        self.send_to_app(&ApiRequest::RestoreMainView);
                    }
                }
            }
        }
        None
    }

    fn send_to_app(&mut self, request: &ApiRequest) {
        match wire::encode_frame(request) {
            Ok(frame) => {
                self.api_out.extend_from_slice(&frame);
                if let Err(e) = send_buffered(&self.api, &mut self.api_out) {
                    tracing::warn!("error writing API socket: {e}");
                    self.app_disconnected();
                }
            }
            Err(e) => tracing::warn!("failed to encode app request: {e}"),
        }
    }

    fn send_response(&mut self, conn_id: u64, response: &Response) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        match wire::encode_frame(response) {
            Ok(frame) => {
                conn.out.extend_from_slice(&frame);
                if let Err(e) = send_buffered(&conn.stream, &mut conn.out) {
                    tracing::warn!("connection failed: {e}");
                    conn.closed = true;
                }
            }
            Err(e) => {
                tracing::warn!("failed to encode response: {e}");
                conn.closed = true;
            }
        }
    }

    /// Drops sessions that hit EOF or errored, along with their waiters.
    fn reap_closed(&mut self) {
        let closed: Vec<u64> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.closed)
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            self.conns.remove(id);
        }
        self.waiters.retain(|waiter| !closed.contains(&waiter.conn));
        self.view_waiters.retain(|id| !closed.contains(id));
    }
}
