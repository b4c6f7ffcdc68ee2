//! Path and file-descriptor utilities.

use anyhow::{Context, Result};
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::{env, fs};

/// Converts `path` to an absolute path, whether or not it exists.
///
/// `fs::canonicalize` refuses paths with missing components, but grain
/// directories are frequently named before they are created. When the target
/// is missing we resolve the parent instead and re-join the final component;
/// a bare relative name is joined to the current working directory.
pub fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(resolved) => Ok(resolved),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            match (path.parent(), path.file_name()) {
                (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                    Ok(canonicalize_lenient(parent)?.join(name))
                }
                _ => Ok(env::current_dir()?.join(path)),
            }
        }
        Err(err) => Err(err),
    }
}

/// Lists the file descriptors currently open in this process.
///
/// Reads `/proc/self/fd`. The returned list necessarily includes the
/// descriptor opened for the listing itself.
pub fn open_fds() -> Result<Vec<RawFd>> {
    let mut fds = Vec::new();
    let entries = fs::read_dir("/proc/self/fd").context("opendir(/proc/self/fd) failed")?;
    for entry in entries {
        let entry = entry.context("readdir(/proc/self/fd) failed")?;
        let name = entry.file_name();
        if let Ok(fd) = name.to_string_lossy().parse::<RawFd>() {
            fds.push(fd);
        }
    }
    Ok(fds)
}

/// Closes every file descriptor above stderr.
///
/// A badly-written launcher may have leaked private descriptors to us without
/// CLOEXEC; the sandboxed app must never see those. The scan and the closes
/// are two separate phases: closing while listing would mutate the directory
/// being iterated, and the listing itself holds an open descriptor.
pub fn close_extra_fds() -> Result<()> {
    let fds = open_fds()?;
    for fd in fds {
        if fd > libc::STDERR_FILENO {
            // Close errors are ignored; one of these is the already-closed
            // directory descriptor from the scan.
            unsafe { libc::close(fd) };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_existing_path_matches_fs() {
        let dir = tempfile::tempdir().unwrap();
        let expected = fs::canonicalize(dir.path()).unwrap();
        assert_eq!(canonicalize_lenient(dir.path()).unwrap(), expected);
    }

    #[test]
    fn canonicalize_missing_leaf_resolves_parent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-created-yet");
        let expected = fs::canonicalize(dir.path()).unwrap().join("not-created-yet");
        assert_eq!(canonicalize_lenient(&missing).unwrap(), expected);
    }

    #[test]
    fn canonicalize_missing_subtree_resolves_deepest_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a/b/c");
        let expected = fs::canonicalize(dir.path()).unwrap().join("a/b/c");
        assert_eq!(canonicalize_lenient(&missing).unwrap(), expected);
    }

    #[test]
    fn canonicalize_bare_relative_name_joins_cwd() {
        let got = canonicalize_lenient(Path::new("surely-no-such-file-here")).unwrap();
        let expected = env::current_dir().unwrap().join("surely-no-such-file-here");
        assert_eq!(got, expected);
    }

    #[test]
    fn open_fds_contains_stdio() {
        let fds = open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }
}
