//! Process-wide serialization of every storage access.
//!
//! Each read or write holds the serializer for its entire duration, result
//! materialization included, so a reader never observes a half-applied write.
//! The lock is global, non-reentrant and non-fair: whichever waiter first
//! finds the resource free wins, and a waiter can starve under sustained
//! contention. Acquiring twice from the same thread deadlocks.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;
use crate::core::config::Config;
use crate::core::error::Result;
use crate::lock::cancel::CancellationToken;
use crate::storage::layout::StorageLayout;

/// A mutual exclusion resource shared by every client of the resource root.
pub trait MutualExclusion: Send + Sync {
    /// Take the resource if it is free right now.
    fn try_acquire(&self) -> Result<bool>;

    /// Give the resource back. Must succeed even if it is no longer held.
    fn release(&self) -> Result<()>;

    fn poll_interval(&self) -> Duration;

    /// Block until the resource is ours, polling at `poll_interval`.
    fn acquire(&self) -> Result<()> {
        while !self.try_acquire()? {
            thread::sleep(self.poll_interval());
        }
        Ok(())
    }
}

/// Existence of a marker file means "held". Creation is an atomic
/// create-if-absent, so two clients can never both see themselves as holder.
///
/// The marker's first word is the holder id. While held, a heartbeat thread
/// keeps its mtime fresh, so only a marker whose holder stopped beating for
/// `stale_after` is ever considered abandoned. Release removes the marker only
/// if it still carries this holder's id.
pub struct MarkerFileLock {
    path: PathBuf,
    holder: Uuid,
    poll_interval: Duration,
    stale_after: Option<Duration>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MarkerFileLock {
    pub fn new(path: PathBuf, poll_interval: Duration, stale_after: Option<Duration>) -> Self {
        MarkerFileLock {
            path,
            holder: Uuid::new_v4(),
            poll_interval,
            stale_after,
            heartbeat: Mutex::new(None),
        }
    }

    pub fn from_config(layout: &StorageLayout, config: &Config) -> Self {
        Self::new(layout.marker_path(), config.serializer_poll_interval, config.stale_marker_after)
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Time since the current marker was created or last refreshed, if there is one.
    pub fn marker_age(&self) -> Result<Option<Duration>> {
        file_age(&self.path)
    }

    fn reaper_path(&self) -> PathBuf {
        self.path.with_extension("reap")
    }

    /// Remove a marker whose holder stopped refreshing it more than
    /// `stale_after` ago. A holder that crashed inside the critical section
    /// would otherwise block every client forever.
    ///
    /// Only one client reaps at a time, guarded by a second create-if-absent
    /// file. Age is re-checked under that guard right before removal, so a
    /// marker that was released and retaken meanwhile is left alone.
    fn clear_if_stale(&self) -> Result<()> {
        let Some(limit) = self.stale_after else {
            return Ok(());
        };
        if !matches!(self.marker_age()?, Some(age) if age > limit) {
            return Ok(());
        }

        let reaper = self.reaper_path();
        match OpenOptions::new().write(true).create_new(true).open(&reaper) {
            Ok(_) => {}
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                // Left behind by a reaper that died between its three syscalls.
                if matches!(file_age(&reaper)?, Some(age) if age > limit) {
                    remove_logged(&reaper, "abandoned reaper guard");
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.reap(limit);
        remove_logged(&reaper, "reaper guard");
        result
    }

    fn reap(&self, limit: Duration) -> Result<()> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let age = match self.marker_age()? {
            Some(age) if age > limit => age,
            _ => return Ok(()),
        };

        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::warn!(
                    "removed stale access marker {} ({:?} without heartbeat, holder {})",
                    self.path.display(),
                    age,
                    contents.trim()
                );
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn start_heartbeat(&self) {
        let Some(limit) = self.stale_after else {
            return;
        };
        let interval = (limit / 3).max(Duration::from_millis(1));
        let token = CancellationToken::new();
        let beat_token = token.clone();
        let path = self.path.clone();
        let holder = self.holder.to_string();

        let handle = thread::spawn(move || {
            while !beat_token.sleep(interval) {
                match touch_if_owned(&path, &holder) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::warn!("access marker {} no longer ours, heartbeat stopped", path.display());
                        break;
                    }
                    Err(e) => log::warn!("access marker heartbeat failed: {}", e),
                }
            }
        });

        if let Some(previous) = self.heartbeat.lock().replace(Heartbeat { token, handle }) {
            previous.stop();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
        }
    }
}

impl Heartbeat {
    fn stop(self) {
        self.token.cancel();
        if self.handle.join().is_err() {
            log::error!("access marker heartbeat thread panicked");
        }
    }
}

impl Drop for MarkerFileLock {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

fn file_age(path: &Path) -> Result<Option<Duration>> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified()?;
            Ok(Some(SystemTime::now().duration_since(modified).unwrap_or_default()))
        }
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Bump the marker's mtime if `holder` still owns it.
fn touch_if_owned(path: &Path, holder: &str) -> Result<bool> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.starts_with(holder) => {
            OpenOptions::new().write(true).open(path)?.set_modified(SystemTime::now())?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn remove_logged(path: &Path, what: &str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == IoErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove {} {}: {}", what, path.display(), e),
    }
}

impl MutualExclusion for MarkerFileLock {
    fn try_acquire(&self) -> Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                self.clear_if_stale()?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = writeln!(file, "{} {}", self.holder, Utc::now().to_rfc3339()) {
            remove_logged(&self.path, "half-written access marker");
            return Err(e.into());
        }
        self.start_heartbeat();
        Ok(true)
    }

    fn release(&self) -> Result<()> {
        self.stop_heartbeat();

        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.starts_with(&self.holder.to_string()) => {
                match fs::remove_file(&self.path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Ok(contents) => {
                log::warn!(
                    "access marker {} taken over by {}, leaving it in place",
                    self.path.display(),
                    contents.trim()
                );
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                log::warn!("access marker {} already gone on release", self.path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// OS advisory lock (`flock(2)`) on a file that is never removed. The kernel
/// drops the lock when the holder dies, so no stale detection is needed.
#[cfg(unix)]
pub struct FlockLock {
    path: PathBuf,
    held: Mutex<Option<File>>,
    poll_interval: Duration,
}

#[cfg(unix)]
impl FlockLock {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        FlockLock {
            path,
            held: Mutex::new(None),
            poll_interval,
        }
    }

    pub fn from_config(layout: &StorageLayout, config: &Config) -> Self {
        Self::new(layout.base_dir.join(".flock"), config.serializer_poll_interval)
    }

    fn open(&self) -> Result<File> {
        Ok(OpenOptions::new().create(true).truncate(false).write(true).open(&self.path)?)
    }

    fn flock(file: &File, operation: libc::c_int) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid open descriptor owned by `file` for the call.
        let rc = unsafe { libc::flock(fd, operation) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(unix)]
impl MutualExclusion for FlockLock {
    fn try_acquire(&self) -> Result<bool> {
        let file = self.open()?;
        match Self::flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                *self.held.lock() = Some(file);
                Ok(true)
            }
            Err(e) if e.kind() == IoErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn acquire(&self) -> Result<()> {
        let file = self.open()?;
        Self::flock(&file, libc::LOCK_EX)?;
        *self.held.lock() = Some(file);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        if let Some(file) = self.held.lock().take() {
            Self::flock(&file, libc::LOCK_UN)?;
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Wraps storage operations in one acquire/release pair each.
pub struct AccessSerializer {
    lock: Box<dyn MutualExclusion>,
}

impl AccessSerializer {
    pub fn new(lock: Box<dyn MutualExclusion>) -> Self {
        AccessSerializer { lock }
    }

    pub fn marker_file(layout: &StorageLayout, config: &Config) -> Self {
        Self::new(Box::new(MarkerFileLock::from_config(layout, config)))
    }

    /// Blocks until the resource is held. No timeout.
    pub fn acquire(&self) -> Result<SerializerGuard<'_>> {
        self.lock.acquire()?;
        Ok(SerializerGuard { lock: self.lock.as_ref() })
    }

    /// Same as `acquire`, but yields to the tokio runtime between polls.
    pub async fn acquire_async(&self) -> Result<SerializerGuard<'_>> {
        while !self.lock.try_acquire()? {
            tokio::time::sleep(self.lock.poll_interval()).await;
        }
        Ok(SerializerGuard { lock: self.lock.as_ref() })
    }

    /// Run `op` inside the serialized section. The resource is released on
    /// every exit path, errors and panics included.
    pub fn run<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.acquire()?;
        op()
    }
}

/// Held serializer; dropping it releases.
pub struct SerializerGuard<'a> {
    lock: &'a dyn MutualExclusion,
}

impl Drop for SerializerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            log::error!("failed to release access serializer: {}", e);
        }
    }
}
