use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use serde::{Serialize, Deserialize};
use uuid::Uuid;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Collection, RowId};
use crate::lock::cancel::CancellationToken;
use crate::storage::layout::StorageLayout;

/// Identifies one held row lock. At most one exists per pair across all clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    pub collection: Collection,
    pub row_id: RowId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditLockState {
    Unlocked,
    AcquiringLock,
    Locked,
    Released,
    Cancelled,
}

impl EditLockState {
    /// Nothing of this client's is left on disk for the pair.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EditLockState::Unlocked | EditLockState::Released | EditLockState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotFound,
}

/// Per-row advisory edit locks backed by one file per (collection, row).
///
/// Contention is a wait, not an error: `stage` polls in the background until
/// the current holder releases, then creates the lock file with an atomic
/// create-if-absent and runs the callback.
pub struct EditLockManager {
    layout: StorageLayout,
    poll_interval: Duration,
    holder: Uuid,
    states: Arc<StateTable>,
    pending: Mutex<Vec<Arc<Task>>>,
}

/// Default number of pairs whose state is remembered.
pub const DEFAULT_STATE_CAPACITY: usize = 1024;

/// Last known state per pair. Past `capacity` entries, pairs in a terminal
/// state are forgotten and read back as `Unlocked`.
struct StateTable {
    states: Mutex<HashMap<LockToken, EditLockState>>,
    capacity: usize,
}

impl StateTable {
    fn new(capacity: usize) -> Self {
        StateTable {
            states: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn set(&self, lock: LockToken, state: EditLockState) {
        let mut states = self.states.lock();
        states.insert(lock, state);
        if states.len() > self.capacity {
            states.retain(|token, s| *token == lock || !s.is_terminal());
        }
    }

    fn get(&self, lock: &LockToken) -> EditLockState {
        self.states.lock().get(lock).copied().unwrap_or(EditLockState::Unlocked)
    }

    fn len(&self) -> usize {
        self.states.lock().len()
    }
}

impl EditLockManager {
    pub fn new(layout: StorageLayout, poll_interval: Duration) -> Self {
        Self::with_state_capacity(layout, poll_interval, DEFAULT_STATE_CAPACITY)
    }

    pub fn with_state_capacity(layout: StorageLayout, poll_interval: Duration, capacity: usize) -> Self {
        EditLockManager {
            layout,
            poll_interval,
            holder: Uuid::new_v4(),
            states: Arc::new(StateTable::new(capacity)),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(layout: StorageLayout, config: &Config) -> Self {
        Self::new(layout, config.edit_lock_poll_interval)
    }

    /// Start acquiring the lock for `(collection, row_id)` on a background
    /// thread. `on_locked` runs exactly once, after the lock file exists, unless
    /// the acquisition is cancelled first.
    pub fn stage<F>(&self, collection: Collection, row_id: RowId, on_locked: F) -> PendingEdit
    where
        F: FnOnce() + Send + 'static,
    {
        let lock = LockToken { collection, row_id };
        let path = self.layout.edit_lock_path(collection, row_id);
        let cancel = CancellationToken::new();
        let task = Arc::new(Task {
            cancel: cancel.clone(),
            ..Task::default()
        });

        {
            let mut pending = self.pending.lock();
            pending.retain(|t| !t.is_finished());
            pending.push(task.clone());
        }

        let worker = Worker {
            lock,
            path,
            holder: self.holder,
            poll_interval: self.poll_interval,
            cancel: cancel.clone(),
            states: self.states.clone(),
        };
        let task_slot = task.clone();
        thread::spawn(move || {
            let outcome = worker.run(on_locked);
            task_slot.finish(outcome);
        });

        PendingEdit { lock, task }
    }

    /// Remove the lock file. A missing lock is reported, not raised.
    pub fn release(&self, collection: Collection, row_id: RowId) -> Result<ReleaseOutcome> {
        let lock = LockToken { collection, row_id };
        let path = self.layout.edit_lock_path(collection, row_id);

        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("released edit lock for row {} on {}", row_id, collection);
                self.states.set(lock, EditLockState::Released);
                Ok(ReleaseOutcome::Released)
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                log::info!("no lock found for row {} on {}", row_id, collection);
                Ok(ReleaseOutcome::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel every acquisition staged through this manager that has not
    /// finished yet, and wait for them to wind down.
    pub fn cancel(&self) {
        let pending: Vec<Arc<Task>> = self.pending.lock().drain(..).collect();
        for task in &pending {
            task.cancel.cancel();
        }
        for task in &pending {
            task.wait_finished();
        }
        log::debug!("cancelled {} staged edit(s)", pending.len());
    }

    /// State of the pair as driven by this manager.
    pub fn state(&self, collection: Collection, row_id: RowId) -> EditLockState {
        self.states.get(&LockToken { collection, row_id })
    }

    /// Number of pairs whose state is currently remembered.
    pub fn tracked_states(&self) -> usize {
        self.states.len()
    }

    /// Whether any client currently holds the pair.
    pub fn is_locked(&self, collection: Collection, row_id: RowId) -> bool {
        self.layout.edit_lock_path(collection, row_id).exists()
    }
}

/// Handle on one background acquisition.
pub struct PendingEdit {
    lock: LockToken,
    task: Arc<Task>,
}

impl PendingEdit {
    pub fn token(&self) -> LockToken {
        self.lock
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.task.cancel
    }

    /// Ask the acquisition to stop. It notices within one poll tick.
    pub fn cancel(&self) {
        self.task.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Block until the acquisition ends.
    pub fn wait(self) -> Result<LockOutcome> {
        self.task.wait_outcome()
    }

    pub fn cancel_and_wait(self) -> Result<LockOutcome> {
        self.cancel();
        self.wait()
    }
}

#[derive(Default)]
struct Task {
    cancel: CancellationToken,
    state: Mutex<TaskState>,
    done: Condvar,
}

#[derive(Default)]
struct TaskState {
    finished: bool,
    outcome: Option<Result<LockOutcome>>,
}

impl Task {
    fn finish(&self, outcome: Result<LockOutcome>) {
        let mut state = self.state.lock();
        state.finished = true;
        state.outcome = Some(outcome);
        self.done.notify_all();
    }

    fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn wait_finished(&self) {
        let mut state = self.state.lock();
        while !state.finished {
            self.done.wait(&mut state);
        }
    }

    fn wait_outcome(&self) -> Result<LockOutcome> {
        let mut state = self.state.lock();
        while !state.finished {
            self.done.wait(&mut state);
        }
        state.outcome.take().unwrap_or_else(|| {
            Err(Error::new(ErrorKind::InvalidState, "edit outcome already taken".to_string()))
        })
    }
}

struct Worker {
    lock: LockToken,
    path: std::path::PathBuf,
    holder: Uuid,
    poll_interval: Duration,
    cancel: CancellationToken,
    states: Arc<StateTable>,
}

impl Worker {
    fn run<F: FnOnce()>(self, on_locked: F) -> Result<LockOutcome> {
        let LockToken { collection, row_id } = self.lock;
        let result = self.acquire_and_notify(on_locked);

        // Cancellation observed after the lock file exists still gives it back.
        let outcome = match result {
            Ok(LockOutcome::Locked) if self.cancel.is_cancelled() => {
                match fs::remove_file(&self.path) {
                    Ok(()) => log::info!("released lock for row {} on {} due to cancellation", row_id, collection),
                    Err(e) if e.kind() == IoErrorKind::NotFound => {}
                    Err(e) => return self.settle(Err(e.into())),
                }
                Ok(LockOutcome::Cancelled)
            }
            other => other,
        };
        self.settle(outcome)
    }

    fn settle(&self, outcome: Result<LockOutcome>) -> Result<LockOutcome> {
        let state = match &outcome {
            Ok(LockOutcome::Locked) => EditLockState::Locked,
            Ok(LockOutcome::Cancelled) => {
                log::info!("edit of row {} on {} cancelled", self.lock.row_id, self.lock.collection);
                EditLockState::Cancelled
            }
            Err(_) => EditLockState::Unlocked,
        };
        self.set_state(state);
        outcome
    }

    fn acquire_and_notify<F: FnOnce()>(&self, on_locked: F) -> Result<LockOutcome> {
        let LockToken { collection, row_id } = self.lock;
        self.set_state(EditLockState::AcquiringLock);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(LockOutcome::Cancelled);
            }
            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(
                        file,
                        "Editing {} where ID is {} (holder {}, since {})",
                        collection, row_id, self.holder, Utc::now().to_rfc3339()
                    ) {
                        self.remove_lock_file("half-written");
                        return Err(e.into());
                    }
                    break;
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                    log::debug!("row {} on {} is currently being edited, waiting", row_id, collection);
                    if self.cancel.sleep(self.poll_interval) {
                        return Ok(LockOutcome::Cancelled);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.set_state(EditLockState::Locked);
        log::info!("row {} on {} is now locked for editing", row_id, collection);

        if panic::catch_unwind(AssertUnwindSafe(on_locked)).is_err() {
            self.remove_lock_file("panicked editor's");
            return Err(Error::new(
                ErrorKind::Internal,
                format!("edit callback for row {} on {} panicked", row_id, collection),
            ));
        }
        Ok(LockOutcome::Locked)
    }

    fn remove_lock_file(&self, what: &str) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "failed to remove {} edit lock {}, row stays blocked until removed: {}",
                what,
                self.path.display(),
                e
            ),
        }
    }

    fn set_state(&self, state: EditLockState) {
        self.states.set(self.lock, state);
    }
}
