//! Per-path exclusive locks backed by on-disk sentinels
//!
//! A lock on resource `F` is represented by the sentinel file `F.lock`. The
//! sentinel is created with `create_new` (atomic create-if-absent), then held
//! with a platform advisory lock for as long as the owner keeps it, and carries
//! a JSON [`LockHandle`] describing the owner:
//!
//! ```json
//! {"pid": 4242, "thread_id": "ThreadId(7)", "timestamp": "2026-10-18T09:12:44.120Z",
//!  "operation": "dequeue", "metadata": {}}
//! ```
//!
//! On contention the caller polls every `retry_interval` until the timeout or
//! retry budget runs out. Each failed attempt inspects the existing sentinel
//! and reclaims it when it is stale: corrupt content, older than
//! `stale_lock_age`, or recorded by a process that no longer exists. A
//! sentinel whose advisory lock is still held is always treated as live.
//!
//! There is no global lock table. Each [`LockManager`] tracks only the locks it
//! acquired and releases them all when dropped.

use crate::config::LockConfig;
use crate::io::error::LockError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Ownership record persisted inside a sentinel file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHandle {
    /// Process id of the holder
    pub pid: u32,

    /// Thread of the holder within its process
    pub thread_id: String,

    /// When the lock was acquired
    pub timestamp: DateTime<Utc>,

    /// Name of the operation performed under the lock
    pub operation: String,

    /// Free-form caller metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl LockHandle {
    fn for_current_thread(operation: &str, metadata: Map<String, Value>) -> Self {
        Self {
            pid: std::process::id(),
            thread_id: format!("{:?}", std::thread::current().id()),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            metadata,
        }
    }

    /// Age of the lock relative to `now` (zero when the timestamp lies in the future)
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Sentinel path guarding `path`: the same path with `.lock` appended
pub fn sentinel_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(".lock");
    PathBuf::from(raw)
}

struct HeldLock {
    file: File,
    sentinel: PathBuf,
    payload: Vec<u8>,
    handle: LockHandle,
}

/// Acquires and releases sentinel locks for one process component
pub struct LockManager {
    config: LockConfig,
    held: Mutex<HashMap<PathBuf, HeldLock>>,
}

impl LockManager {
    /// Create a manager using the given timing configuration
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Timing configuration in effect
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn held(&self) -> MutexGuard<'_, HashMap<PathBuf, HeldLock>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the exclusive lock on `path`
    ///
    /// Blocks, polling every `retry_interval`, until the lock is obtained,
    /// `timeout` (default: the configured lock timeout) elapses, or
    /// `max_retries` attempts have failed.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` when the lock could not be obtained within
    /// budget, or `LockError::Io` when the sentinel cannot be created.
    pub fn acquire(
        &self,
        path: &Path,
        operation: &str,
        metadata: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<LockHandle, LockError> {
        let timeout = timeout.unwrap_or_else(|| self.config.timeout());
        let sentinel = sentinel_path(path);
        if let Some(parent) = sentinel.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;
        }

        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            if let Some(held) = self.try_create(&sentinel, operation, &metadata)? {
                let handle = held.handle.clone();
                debug!(
                    path = %path.display(),
                    operation,
                    attempts,
                    "lock acquired"
                );
                self.held().insert(path.to_path_buf(), held);
                return Ok(handle);
            }

            let waited = started.elapsed();
            if waited >= timeout || attempts > self.config.max_retries {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    attempts,
                    waited,
                });
            }

            if self.reclaim_if_stale(&sentinel) {
                continue;
            }

            let remaining = timeout.saturating_sub(waited);
            std::thread::sleep(self.config.retry_interval().min(remaining));
        }
    }

    /// Release the lock on `path`
    ///
    /// Idempotent: releasing a lock that is not held, was already released,
    /// or whose sentinel was reclaimed externally is a no-op.
    pub fn release(&self, path: &Path) -> Result<(), LockError> {
        let Some(held) = self.held().remove(path) else {
            debug!(path = %path.display(), "release of lock not held by this manager");
            return Ok(());
        };

        // The sentinel goes before the advisory lock so waiters never see an
        // unlocked sentinel that still names us.
        let result = match fs::read(&held.sentinel) {
            Ok(current) if current == held.payload => match fs::remove_file(&held.sentinel) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(LockError::io(&held.sentinel, e)),
            },
            Ok(_) => {
                warn!(
                    sentinel = %held.sentinel.display(),
                    "sentinel was reclaimed by another holder; leaving it in place"
                );
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::io(&held.sentinel, e)),
        };

        let _ = FileExt::unlock(&held.file);
        debug!(path = %path.display(), operation = %held.handle.operation, "lock released");
        result
    }

    /// Acquire `path`, returning a guard that releases it on drop
    pub fn lock(&self, path: &Path, operation: &str) -> Result<LockGuard<'_>, LockError> {
        self.acquire(path, operation, Map::new(), None)?;
        Ok(LockGuard {
            manager: self,
            path: path.to_path_buf(),
        })
    }

    /// Run `f` while holding the lock on `path`, releasing it afterwards even
    /// when `f` fails
    pub fn with_lock<T, E, F>(&self, path: &Path, operation: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LockError>,
    {
        let _guard = self.lock(path, operation)?;
        f()
    }

    /// Run `f` while holding the locks on every path in `paths`
    ///
    /// Locks are taken in slice order and released in reverse. Callers that
    /// lock several resources must always pass them in the same order.
    pub fn with_locks<T, E, F>(&self, paths: &[&Path], operation: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LockError>,
    {
        let mut guards = Vec::with_capacity(paths.len());
        for path in paths {
            guards.push(self.lock(path, operation)?);
        }
        let result = f();
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        result
    }

    /// Whether this manager currently holds the lock on `path`
    pub fn is_held(&self, path: &Path) -> bool {
        self.held().contains_key(path)
    }

    /// Paths currently locked by this manager
    pub fn held_paths(&self) -> Vec<PathBuf> {
        self.held().keys().cloned().collect()
    }

    /// Release every lock held by this manager
    pub fn release_all(&self) {
        for path in self.held_paths() {
            if let Err(e) = self.release(&path) {
                warn!(path = %path.display(), error = %e, "failed to release lock during shutdown");
            }
        }
    }

    /// Read the handle recorded in the sentinel guarding `path`, if any
    pub fn inspect(path: &Path) -> Option<LockHandle> {
        let content = fs::read(sentinel_path(path)).ok()?;
        serde_json::from_slice(&content).ok()
    }

    fn try_create(
        &self,
        sentinel: &Path,
        operation: &str,
        metadata: &Map<String, Value>,
    ) -> Result<Option<HeldLock>, LockError> {
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(sentinel)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(LockError::io(sentinel, e)),
        };

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                // A reclaimer is probing our brand-new file; let it decide.
                return Ok(None);
            }
            Err(e) => {
                debug!(sentinel = %sentinel.display(), error = %e, "advisory lock unsupported, relying on sentinel only");
            }
        }

        let handle = LockHandle::for_current_thread(operation, metadata.clone());
        let payload = serde_json::to_vec(&handle).map_err(|e| {
            LockError::io(sentinel, std::io::Error::new(ErrorKind::InvalidData, e))
        })?;

        if let Err(e) = file.write_all(&payload).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(sentinel);
            return Err(LockError::io(sentinel, e));
        }

        // A reclaimer may have removed the file between our create and lock.
        match fs::read(sentinel) {
            Ok(current) if current == payload => Ok(Some(HeldLock {
                file,
                sentinel: sentinel.to_path_buf(),
                payload,
                handle,
            })),
            _ => {
                let _ = FileExt::unlock(&file);
                Ok(None)
            }
        }
    }

    /// Inspect an existing sentinel and delete it when it is stale.
    ///
    /// Returns `true` when the sentinel was removed (or had already vanished)
    /// so acquisition can be retried immediately.
    fn reclaim_if_stale(&self, sentinel: &Path) -> bool {
        let probe = match OpenOptions::new().read(true).write(true).open(sentinel) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return true,
            Err(e) => {
                debug!(sentinel = %sentinel.display(), error = %e, "cannot open sentinel for inspection");
                return false;
            }
        };

        match probe.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return false,
            Err(_) => {}
        }

        let content = match fs::read(sentinel) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let _ = FileExt::unlock(&probe);
                return true;
            }
            Err(_) => {
                let _ = FileExt::unlock(&probe);
                return false;
            }
        };

        let reason = match serde_json::from_slice::<LockHandle>(&content) {
            Err(_) => Some("corrupt sentinel".to_string()),
            Ok(handle) => self.stale_reason(&handle),
        };

        let reclaimed = match reason {
            Some(reason) => {
                // Only remove the file we inspected, not a successor.
                let unchanged = fs::read(sentinel).map(|c| c == content).unwrap_or(false);
                if unchanged {
                    match fs::remove_file(sentinel) {
                        Ok(()) => {
                            warn!(sentinel = %sentinel.display(), %reason, "reclaimed stale lock");
                            true
                        }
                        Err(e) if e.kind() == ErrorKind::NotFound => true,
                        Err(e) => {
                            warn!(sentinel = %sentinel.display(), error = %e, "failed to remove stale lock");
                            false
                        }
                    }
                } else {
                    false
                }
            }
            None => false,
        };

        let _ = FileExt::unlock(&probe);
        reclaimed
    }

    fn stale_reason(&self, handle: &LockHandle) -> Option<String> {
        let age = handle.age(Utc::now());
        if age > self.config.stale_lock_age() {
            return Some(format!("held for {age:?} by pid {}", handle.pid));
        }
        if handle.pid != std::process::id() && !is_pid_alive(handle.pid) {
            return Some(format!("owner pid {} no longer exists", handle.pid));
        }
        None
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .field("held", &self.held_paths())
            .finish()
    }
}

/// Guard returned by [`LockManager::lock`]; releases the lock on drop
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    path: PathBuf,
}

impl LockGuard<'_> {
    /// Path of the guarded resource
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    let contended = fs2::lock_contended_error();
    err.kind() == ErrorKind::WouldBlock
        || (err.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error())
}

/// Check whether process `pid` is currently alive.
///
/// On Unix sends signal 0 (`kill(pid, 0)`), which tests existence without
/// delivering a signal. `EPERM` means the process exists but belongs to
/// someone else. On other platforms the pid is assumed alive and only the
/// age threshold can reclaim the lock.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: kill(pid, 0) performs an existence/permission check only.
        let result = unsafe { libc::kill(pid, 0) };
        result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
