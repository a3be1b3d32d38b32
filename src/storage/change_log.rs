use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam::channel::{self, Receiver, TrySendError};
use serde::{Serialize, Deserialize};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{ChangeGroup, Collection};
use crate::lock::cancel::CancellationToken;
use crate::storage::layout::StorageLayout;

/// Append-only change signal shared by every client.
///
/// Each write appends one marker byte per change group it touched. Readers
/// never look at the bytes; they only compare the file size against their own
/// cursor, so a poll tells "something in some group changed", nothing more.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    path: PathBuf,
    append_retries: u32,
    append_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangePoll {
    Unchanged,
    Changed { cursor: u64 },
}

impl ChangeLog {
    pub fn new(path: PathBuf, append_retries: u32, append_backoff: Duration) -> Self {
        ChangeLog {
            path,
            append_retries,
            append_backoff,
        }
    }

    pub fn from_config(layout: &StorageLayout, config: &Config) -> Self {
        Self::new(layout.change_log_path(), config.log_append_retries, config.log_append_backoff)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One marker per group intersected by `affected`, in group order.
    pub fn markers_for(affected: &[Collection]) -> Vec<u8> {
        let groups: HashSet<ChangeGroup> = affected.iter().filter_map(|c| c.change_group()).collect();
        ChangeGroup::ALL
            .iter()
            .filter(|g| groups.contains(g))
            .map(|g| g.marker())
            .collect()
    }

    /// Record a write touching `affected`. Returns the number of bytes appended.
    ///
    /// Permission failures (another client briefly holding the file on some
    /// platforms) are retried with exponential backoff; after the last retry
    /// the error is surfaced as `RetryExhausted`.
    pub fn notify(&self, affected: &[Collection]) -> Result<usize> {
        let markers = Self::markers_for(affected);
        if markers.is_empty() {
            return Ok(0);
        }

        let mut backoff = self.append_backoff;
        let mut attempt = 0;
        loop {
            match self.append(&markers) {
                Ok(()) => return Ok(markers.len()),
                Err(e) if e.kind() == IoErrorKind::PermissionDenied && attempt < self.append_retries => {
                    attempt += 1;
                    log::warn!(
                        "change log append denied ({}), retry {}/{} in {:?}",
                        e, attempt, self.append_retries, backoff
                    );
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) if e.kind() == IoErrorKind::PermissionDenied => {
                    return Err(Error::new(
                        ErrorKind::RetryExhausted,
                        format!(
                            "change log {} not writable after {} retries: {}",
                            self.path.display(), self.append_retries, e
                        ),
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn append(&self, markers: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(markers)
    }

    /// Current log size. A log nobody has written yet has size 0.
    pub fn size(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare the log size with `cursor`. Only growth counts as a change;
    /// the returned cursor never moves backwards.
    pub fn poll(&self, cursor: u64) -> Result<ChangePoll> {
        let size = self.size()?;
        if size > cursor {
            Ok(ChangePoll::Changed { cursor: size })
        } else {
            Ok(ChangePoll::Unchanged)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub previous: u64,
    pub cursor: u64,
}

/// Background poller holding its own cursor. Emits one event per poll that
/// saw growth; several writes between two polls collapse into one event, and
/// at most one event waits undelivered.
pub struct ChangeWatcher {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    events: Receiver<ChangeEvent>,
}

impl ChangeWatcher {
    pub fn spawn(log: ChangeLog, start_cursor: u64, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let (sender, events) = channel::bounded(1);
        let task_token = token.clone();

        let handle = thread::spawn(move || {
            let mut cursor = start_cursor;
            loop {
                match log.poll(cursor) {
                    Ok(ChangePoll::Changed { cursor: next }) => {
                        // While an event is still queued the cursor stays put;
                        // the next delivered event then covers all growth since.
                        match sender.try_send(ChangeEvent { previous: cursor, cursor: next }) {
                            Ok(()) => cursor = next,
                            Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Disconnected(_)) => break,
                        }
                    }
                    Ok(ChangePoll::Unchanged) => {}
                    Err(e) => log::warn!("change log poll failed: {}", e),
                }
                if task_token.sleep(interval) {
                    break;
                }
            }
            log::debug!("change watcher on {} stopped at {}", log.path().display(), cursor);
        });

        ChangeWatcher {
            token,
            handle: Some(handle),
            events,
        }
    }

    pub fn events(&self) -> &Receiver<ChangeEvent> {
        &self.events
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("change watcher thread panicked");
            }
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
