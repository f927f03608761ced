//! Lock-guarded atomic file replacement
//!
//! Every write goes to a temp file beside the target, is flushed to durable
//! storage, and is then renamed over the target while the target's lock is
//! held. Readers take the same lock, so they observe either the previous or
//! the new content, never a partial file.

use crate::io::error::LockError;
use crate::io::lock::LockManager;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `content` under its lock
pub fn atomic_write(locks: &LockManager, path: &Path, content: &[u8]) -> Result<(), LockError> {
    locks.with_lock(path, "atomic_write", || write_durable(path, content))
}

/// Read `path` under its lock; `None` when the file does not exist
pub fn atomic_read(locks: &LockManager, path: &Path) -> Result<Option<Vec<u8>>, LockError> {
    locks.with_lock(path, "atomic_read", || read_if_exists(path))
}

/// Read, transform and rewrite `path` in one critical section
///
/// `update` receives the current content (`None` when the file is missing)
/// and returns the replacement.
pub fn atomic_update<F>(locks: &LockManager, path: &Path, update: F) -> Result<(), LockError>
where
    F: FnOnce(Option<&[u8]>) -> Vec<u8>,
{
    locks.with_lock(path, "atomic_update", || {
        let current = read_if_exists(path)?;
        let next = update(current.as_deref());
        write_durable(path, &next)
    })
}

/// Read `path` without locking; the caller must already hold its lock
pub(crate) fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, LockError> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockError::io(path, e)),
    }
}

/// Durably replace `path` without locking; the caller must already hold its lock
pub(crate) fn write_durable(path: &Path, content: &[u8]) -> Result<(), LockError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;
    }

    let tmp_path = tmp_path_for(path);
    {
        let mut tmp_file = fs::File::create(&tmp_path).map_err(|e| LockError::io(&tmp_path, e))?;
        let written = tmp_file
            .write_all(content)
            .and_then(|()| tmp_file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(LockError::io(&tmp_path, e));
        }
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(LockError::io(path, e));
    }

    sync_parent_dir(path);
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut raw = path.as_os_str().to_os_string();
    raw.push(format!(".tmp-{}-{n}", std::process::id()));
    PathBuf::from(raw)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        })
    {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
