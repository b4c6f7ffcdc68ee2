//! Inotify-driven disk usage accounting for the grain's var directory.
//!
//! Harder than it should be. The kernel reports *past* events while lstat
//! reports *present* state, so event masks are only hints: every named
//! event triggers a re-stat of that child and a diff against the stored
//! byte count. If inotify shipped a `struct stat` with each event none of
//! this would be necessary.

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use nix::sys::stat::lstat;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

fn watch_flags() -> AddWatchFlags {
    AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_DONT_FOLLOW
        | AddWatchFlags::IN_ONLYDIR
        | AddWatchFlags::from_bits_retain(libc::IN_EXCL_UNLINK)
}

fn child_event_mask() -> AddWatchFlags {
    AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
}

struct WatchInfo {
    path: PathBuf,
    child_sizes: HashMap<OsString, u64>,
}

struct DiskUsage {
    path: PathBuf,
    bytes: u64,
    is_dir: bool,
}

/// Estimated on-disk footprint of one directory entry.
///
/// Sizes round up to 4k blocks; hard links amortize across their link
/// count; `sizeof(struct stat)` plus the word-rounded filename approximate
/// per-entry metadata overhead. A vanished entry counts as zero.
fn disk_usage(parent: &Path, name: &OsStr) -> Result<DiskUsage> {
    let path = parent.join(name);
    loop {
        match lstat(&path) {
            Ok(stats) => {
                let mut bytes = (stats.st_size as u64 + 4095) & !4095;
                // The link count really can be zero, e.g. for the temporary
                // files `git init` rapidly creates and deletes.
                if stats.st_nlink != 0 {
                    bytes /= stats.st_nlink;
                    bytes += mem::size_of::<libc::stat>() as u64
                        + ((name.as_bytes().len() as u64 + 8) & !7);
                }
                let is_dir = stats.st_mode & libc::S_IFMT == libc::S_IFDIR;
                return Ok(DiskUsage { path, bytes, is_dir });
            }
            Err(Errno::EINTR) => continue,
            // Entry no longer exists, or a parent directory was replaced.
            Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => {
                return Ok(DiskUsage {
                    path,
                    bytes: 0,
                    is_dir: false,
                })
            }
            Err(e) => {
                return Err(e).with_context(|| format!("lstat failed: {}", path.display()))
            }
        }
    }
}

/// Watches a directory tree, keeps a running total of its estimated disk
/// usage, and reports when the total moves.
pub struct DiskUsageWatcher {
    root: PathBuf,
    inotify: Inotify,
    total_size: u64,
    watch_map: HashMap<WatchDescriptor, WatchInfo>,
    /// Directories to watch once the current event batch is fully consumed;
    /// the descriptor table must not be mutated mid-batch. Drained as a
    /// stack for DFS traversal.
    pending_watches: Vec<PathBuf>,
}

impl DiskUsageWatcher {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .context("inotify_init1 failed")?;
        let mut watcher = DiskUsageWatcher {
            pending_watches: vec![root.clone()],
            root,
            inotify,
            total_size: 0,
            watch_map: HashMap::new(),
        };
        watcher.add_pending_watches()?;
        Ok(watcher)
    }

    /// The descriptor to poll for readability.
    pub fn raw_fd(&self) -> RawFd {
        self.inotify.as_fd().as_raw_fd()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Drains every available event batch and reconciles the size table.
    pub fn process_events(&mut self) -> Result<()> {
        loop {
            let events = match self.inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("failed to read inotify events"),
            };
            for event in events {
                if self.handle_event(event)? {
                    // The watch table was rebuilt; the rest of this batch
                    // described the old descriptor space.
                    return Ok(());
                }
            }
        }
        self.add_pending_watches()?;
        Ok(())
    }

    /// Handles one event. Returns true when the session was rebuilt.
    fn handle_event(&mut self, event: InotifyEvent) -> Result<bool> {
        if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            // Too far behind to reconcile incrementally; start over.
            tracing::warn!("inotify event queue overflow; restarting watch from scratch");
            self.reinit()?;
            return Ok(true);
        }

        let Some(watch) = self.watch_map.get_mut(&event.wd) else {
            bail!("inotify reported an unknown watch descriptor");
        };

        if event.mask.intersects(child_event_mask()) {
            if let Some(name) = &event.name {
                Self::child_event(
                    &mut self.total_size,
                    &mut self.pending_watches,
                    watch,
                    name,
                )?;
            }
        }

        if event.mask.contains(AddWatchFlags::IN_IGNORED) {
            // The kernel dropped this watch, normally because the directory
            // was deleted. Un-count whatever children remain.
            if let Some(watch) = self.watch_map.remove(&event.wd) {
                for (_, size) in watch.child_sizes {
                    self.total_size -= size;
                }
            }
        }

        Ok(false)
    }

    fn reinit(&mut self) -> Result<()> {
        self.inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .context("inotify_init1 failed")?;
        self.total_size = 0;
        self.watch_map.clear();
        self.pending_watches.clear();
        self.pending_watches.push(self.root.clone());
        self.add_pending_watches()
    }

    fn add_pending_watches(&mut self) -> Result<()> {
        while let Some(path) = self.pending_watches.pop() {
            self.add_watch(path)?;
        }
        Ok(())
    }

    /// Starts watching `path`. Idempotent: watching an already-watched path
    /// refreshes its child table.
    fn add_watch(&mut self, path: PathBuf) -> Result<()> {
        let wd = loop {
            match self.inotify.add_watch(&path, watch_flags()) {
                Ok(wd) => break wd,
                Err(Errno::EINTR) => continue,
                // The directory is already gone again; no matter.
                Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => return Ok(()),
                // ENOSPC means no inotify watches left; nothing sensible to
                // fall back to, so treat it like any other fatal error.
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("inotify_add_watch failed: {}", path.display()))
                }
            }
        };

        // The kernel returns a pre-existing descriptor when the directory is
        // already watched under another name (a move race). The stored child
        // table may be stale either way: un-count it and relist.
        let mut watch = match self.watch_map.remove(&wd) {
            Some(watch) => watch,
            None => WatchInfo {
                path: path.clone(),
                child_sizes: HashMap::new(),
            },
        };
        watch.path = path.clone();
        for (_, size) in watch.child_sizes.drain() {
            self.total_size -= size;
        }

        if let Ok(entries) = fs::read_dir(&path) {
            for entry in entries {
                let entry =
                    entry.with_context(|| format!("readdir failed: {}", path.display()))?;
                Self::child_event(
                    &mut self.total_size,
                    &mut self.pending_watches,
                    &mut watch,
                    entry.file_name().as_os_str(),
                )?;
            }
        }

        self.watch_map.insert(wd, watch);
        Ok(())
    }

    /// Reconciles one child of a watched directory against the disk.
    fn child_event(
        total_size: &mut u64,
        pending_watches: &mut Vec<PathBuf>,
        watch: &mut WatchInfo,
        name: &OsStr,
    ) -> Result<()> {
        let usage = disk_usage(&watch.path, name)?;

        if usage.bytes == 0 {
            // No child by this name on disk any more.
            if let Some(old) = watch.child_sizes.remove(name) {
                *total_size -= old;
            }
        } else if let Some(size) = watch.child_sizes.get_mut(name) {
            *total_size -= *size;
            *total_size += usage.bytes;
            *size = usage.bytes;
        } else {
            *total_size += usage.bytes;
            watch.child_sizes.insert(name.to_os_string(), usage.bytes);
        }

        // IN_MODIFY is never generated for subdirectories, so an event on a
        // still-existing directory means created or moved in. Either way it
        // needs a (re-)watch: after a move the stored path is wrong and the
        // table may have drifted while it was. The actual add is deferred
        // until the current batch is consumed.
        if usage.is_dir {
            pending_watches.push(usage.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    /// Recomputes the whole-tree total with the same per-entry formula, by
    /// direct traversal rather than event accounting.
    fn full_tree_size(root: &Path) -> u64 {
        let mut total = 0;
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap() {
                let entry = entry.unwrap();
                let usage = disk_usage(&dir, entry.file_name().as_os_str()).unwrap();
                total += usage.bytes;
                if usage.is_dir {
                    stack.push(usage.path);
                }
            }
        }
        total
    }

    fn drain(watcher: &mut DiskUsageWatcher) {
        // Events are queued by the kernel at the time of the file operation,
        // so a handful of passes settles everything, including watches added
        // for newly created directories.
        for _ in 0..8 {
            watcher.process_events().unwrap();
        }
    }

    fn write_file(path: &Path, len: usize) {
        let mut f = File::create(path).unwrap();
        f.write_all(&vec![0x5a; len]).unwrap();
    }

    #[test]
    fn initial_scan_matches_direct_traversal() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("small"), 100);
        write_file(&dir.path().join("big"), 10_000);
        fs::create_dir(dir.path().join("sub")).unwrap();
        write_file(&dir.path().join("sub/nested"), 5000);

        let watcher = DiskUsageWatcher::new(dir.path()).unwrap();
        assert_eq!(watcher.total_size(), full_tree_size(dir.path()));
    }

    #[test]
    fn converges_after_creates_writes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("keep"), 256);
        let mut watcher = DiskUsageWatcher::new(dir.path()).unwrap();

        write_file(&dir.path().join("new"), 1 << 20);
        fs::create_dir(dir.path().join("later")).unwrap();
        write_file(&dir.path().join("later/inner"), 2048);
        drain(&mut watcher);
        assert_eq!(watcher.total_size(), full_tree_size(dir.path()));

        fs::remove_file(dir.path().join("new")).unwrap();
        write_file(&dir.path().join("keep"), 9000);
        drain(&mut watcher);
        assert_eq!(watcher.total_size(), full_tree_size(dir.path()));
    }

    #[test]
    fn growing_a_file_grows_the_total() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DiskUsageWatcher::new(dir.path()).unwrap();
        let before = watcher.total_size();

        write_file(&dir.path().join("blob"), 1 << 20);
        drain(&mut watcher);
        assert!(watcher.total_size() >= before + (1 << 20));
    }

    #[test]
    fn renaming_a_subtree_keeps_the_total() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("alpha")).unwrap();
        write_file(&dir.path().join("alpha/data"), 40_000);
        fs::create_dir(dir.path().join("alpha/deep")).unwrap();
        write_file(&dir.path().join("alpha/deep/more"), 1234);

        let mut watcher = DiskUsageWatcher::new(dir.path()).unwrap();
        let before = watcher.total_size();

        // Same name length, so the metadata estimate is unchanged too.
        fs::rename(dir.path().join("alpha"), dir.path().join("omega")).unwrap();
        drain(&mut watcher);
        assert_eq!(watcher.total_size(), before);
        assert_eq!(watcher.total_size(), full_tree_size(dir.path()));
    }

    #[test]
    fn vanished_entry_counts_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let usage = disk_usage(dir.path(), OsStr::new("never-existed")).unwrap();
        assert_eq!(usage.bytes, 0);
        assert!(!usage.is_dir);
    }

    #[test]
    fn usage_formula_includes_metadata_overhead() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("f"), 1);
        let usage = disk_usage(dir.path(), OsStr::new("f")).unwrap();
        // One byte rounds up to a 4k block, plus stat overhead plus the
        // name (1 byte + NUL) rounded up to a word.
        let expected = 4096 + mem::size_of::<libc::stat>() as u64 + 8;
        assert_eq!(usage.bytes, expected);
    }
}
