//! Single-instance guard for the `run` command.
//!
//! Two proxies on one machine would fight over the same ports and kill each
//! other's backend during orphan cleanup, so `run` holds an exclusive `fs2`
//! lock for its whole lifetime.
use fs2::FileExt;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "vibeproxy.lock";
const HELD_MESSAGE: &str = "Another vibeproxy instance is already running (lock held).";

/// Exclusive instance lock; unlocks and removes the file on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

/// Candidate lock locations, most preferred first:
/// `$XDG_RUNTIME_DIR/vibeproxy.lock`, then `/tmp/vibeproxy.lock`.
pub fn candidate_lock_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(rt) = env::var_os("XDG_RUNTIME_DIR").filter(|s| !s.is_empty()) {
        paths.push(PathBuf::from(rt).join(LOCK_FILE));
    }
    paths.push(PathBuf::from("/tmp").join(LOCK_FILE));
    paths
}

/// Acquire the lock at the first usable candidate path.
///
/// A lock held elsewhere is reported immediately; only open/create failures
/// fall through to the next candidate.
pub fn acquire_lock() -> io::Result<InstanceLock> {
    let paths = candidate_lock_paths();
    let mut last_err: Option<io::Error> = None;
    for p in &paths {
        match acquire_lock_at(p) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(e),
            Err(e) => last_err = Some(e),
        }
    }

    let mut msg = String::from("Failed to create lock file in any candidate location: ");
    msg.push_str(
        &paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    );
    if let Some(e) = last_err {
        msg.push_str(&format!(" (last error: {e})"));
    }
    Err(io::Error::other(msg))
}

/// Acquire the lock at a specific path.
pub fn acquire_lock_at(p: &Path) -> io::Result<InstanceLock> {
    if let Some(parent) = p.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(p)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(InstanceLock {
            file,
            path: p.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, HELD_MESSAGE))
        }
        Err(e) => Err(e),
    }
}
