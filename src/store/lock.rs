//! Two-layer advisory locking for cache entries
//!
//! Threads of one process serialize on an in-memory slot keyed by the
//! normalized lock-file path. Across processes, the lock file itself is the
//! lock: it is created exclusively and holds the owner's pid. A lock file whose
//! pid no longer names a live process is considered abandoned and removed.

use crate::error::{KilnError, KilnResult};
use crate::util::format_elapsed;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Waiting behavior shared by entry and maintenance locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up after waiting this long in total
    pub timeout: Duration,
    /// Interval between "still waiting" log lines
    pub print_info_after: Duration,
    /// Sleep between checks of another process's lock file
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            print_info_after: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    owner: Option<ThreadId>,
    depth: usize,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    released: Condvar,
}

type SlotTable = Mutex<HashMap<PathBuf, Arc<Slot>>>;

/// In-process lock table.
///
/// Created alongside a dispatcher or cache manager and dropped with it. Share
/// one registry between several of them to coordinate purely in memory. A slot
/// lives only while some thread holds or awaits it.
#[derive(Debug, Default)]
pub struct LockRegistry {
    slots: Arc<SlotTable>,
}

/// Held lock; released when dropped
#[derive(Debug)]
pub struct LockGuard {
    slots: Arc<SlotTable>,
    slot: Arc<Slot>,
    lock_file: PathBuf,
    holds_file: bool,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_for(&self, normalized: &Path) -> Arc<Slot> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(normalized.to_path_buf()).or_default().clone()
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or_default()
    }

    /// Run `action` while holding the lock on `lock_file`
    pub fn with_lock<R>(
        &self,
        lock_file: &Path,
        options: &LockOptions,
        action: impl FnOnce() -> KilnResult<R>,
    ) -> KilnResult<R> {
        let _guard = self.acquire(lock_file, options)?;
        action()
    }

    /// Acquire without waiting; `None` while anyone else holds the lock
    pub fn try_acquire(&self, lock_file: &Path) -> KilnResult<Option<LockGuard>> {
        let options = LockOptions {
            timeout: Duration::ZERO,
            print_info_after: Duration::ZERO,
            poll_interval: Duration::ZERO,
        };
        match self.acquire(lock_file, &options) {
            Ok(guard) => Ok(Some(guard)),
            Err(KilnError::LockTimeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Acquire the in-process slot, then the lock file.
    ///
    /// Reentrant for the owning thread: nested acquisitions neither wait nor
    /// touch the file.
    pub fn acquire(&self, lock_file: &Path, options: &LockOptions) -> KilnResult<LockGuard> {
        let normalized = std::path::absolute(lock_file).unwrap_or_else(|_| lock_file.to_path_buf());
        let slot = self.slot_for(&normalized);
        let me = thread::current().id();
        let start = Instant::now();

        {
            let mut state = slot
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if state.owner == Some(me) {
                state.depth += 1;
                drop(state);
                return Ok(LockGuard {
                    slots: self.slots.clone(),
                    slot,
                    lock_file: normalized,
                    holds_file: false,
                });
            }

            let mut announced = false;
            while state.owner.is_some() {
                if !announced {
                    info!(
                        "Lock for '{}' is currently held by another thread, waiting for it to be released...",
                        lock_file.display()
                    );
                    announced = true;
                }
                let waited = start.elapsed();
                if waited >= options.timeout {
                    drop(state);
                    let mut slots = self
                        .slots
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    forget_if_idle(&mut slots, &normalized, &slot);
                    return Err(KilnError::LockTimeout {
                        path: lock_file.to_path_buf(),
                        waited_ms: waited.as_millis() as u64,
                        timeout_ms: options.timeout.as_millis() as u64,
                    });
                }
                let wait_for = options
                    .print_info_after
                    .min(options.timeout - waited)
                    .max(Duration::from_millis(1));
                let (next, result) = slot
                    .released
                    .wait_timeout(state, wait_for)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state = next;
                if result.timed_out() && state.owner.is_some() {
                    info!(
                        "Have been waiting on lock for '{}' for {}",
                        lock_file.display(),
                        format_elapsed(start.elapsed())
                    );
                }
            }

            state.owner = Some(me);
            state.depth = 1;
        }

        let mut guard = LockGuard {
            slots: self.slots.clone(),
            slot,
            lock_file: normalized,
            holds_file: false,
        };
        acquire_process_lock(lock_file, options, start)?;
        guard.holds_file = true;

        debug!(
            "Acquired lock '{}' in {}",
            lock_file.display(),
            format_elapsed(start.elapsed())
        );
        Ok(guard)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Table before slot state; nothing takes them in the other order.
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut state = self
            .slot
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 {
            return;
        }

        if self.holds_file {
            if let Err(e) = fs::remove_file(&self.lock_file) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "Failed to delete lock file {}: {}",
                        self.lock_file.display(),
                        e
                    );
                }
            }
        }
        state.owner = None;
        drop(state);

        forget_if_idle(&mut slots, &self.lock_file, &self.slot);
        drop(slots);
        self.slot.released.notify_all();
    }
}

/// Drop `slot` from the table when only the table and the caller still refer
/// to it. Holders and waiters each keep a clone.
fn forget_if_idle(slots: &mut HashMap<PathBuf, Arc<Slot>>, key: &Path, slot: &Arc<Slot>) {
    let idle = Arc::strong_count(slot) == 2
        && slots.get(key).is_some_and(|entry| Arc::ptr_eq(entry, slot));
    if idle {
        slots.remove(key);
    }
}

/// Read the pid recorded in a lock file, if the file exists and parses
pub fn read_lock_pid(lock_file: &Path) -> Option<u32> {
    fs::read_to_string(lock_file)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

/// Whether `lock_file` is currently held by a live process
pub fn is_lock_active(lock_file: &Path) -> bool {
    lock_file.exists() && !matches!(inspect(lock_file), Holder::Abandoned(_))
}

/// Whether a process with this pid exists
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let pid = match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => pid,
        _ => return false,
    };
    // Signal 0 only performs the existence and permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid > 0
}

/// How long a lock file may stay without a readable pid before it counts as
/// abandoned
const UNREADABLE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Live(u32),
    /// Created but the pid is not written yet
    Writing,
    /// Dead pid, or no readable pid past the grace period
    Abandoned(Option<u32>),
}

fn inspect(lock_file: &Path) -> Holder {
    match read_lock_pid(lock_file) {
        // Our own pid means another registry in this process holds it.
        Some(pid) if pid == std::process::id() || process_alive(pid) => Holder::Live(pid),
        Some(pid) => Holder::Abandoned(Some(pid)),
        None if unreadable_for(lock_file) >= UNREADABLE_GRACE => Holder::Abandoned(None),
        None => Holder::Writing,
    }
}

fn unreadable_for(lock_file: &Path) -> Duration {
    fs::metadata(lock_file)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default()
}

fn acquire_process_lock(lock_file: &Path, options: &LockOptions, start: Instant) -> KilnResult<()> {
    if let Some(parent) = lock_file.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| KilnError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let current_pid = std::process::id();
    let mut next_report = start.elapsed() + options.print_info_after;
    let mut announced = None;

    loop {
        if lock_file.exists() {
            match inspect(lock_file) {
                Holder::Abandoned(holder) => {
                    match holder {
                        Some(pid) => warn!(
                            "Lock file '{}' is held by pid {} which no longer exists, assuming abrupt termination and deleting it",
                            lock_file.display(),
                            pid
                        ),
                        None => warn!(
                            "Lock file '{}' has no readable pid, assuming abrupt termination and deleting it",
                            lock_file.display()
                        ),
                    }
                    remove_stale(lock_file, holder)?;
                    continue;
                }
                Holder::Live(pid) => {
                    if announced != Some(pid) {
                        info!(
                            "Lock file '{}' is currently held by pid {}, waiting for it to be released...",
                            lock_file.display(),
                            pid
                        );
                        announced = Some(pid);
                    }
                }
                Holder::Writing => debug!("Lock file '{}' is being written, waiting", lock_file.display()),
            }

            thread::sleep(options.poll_interval);
            let waited = start.elapsed();
            if waited >= options.timeout {
                return Err(KilnError::LockTimeout {
                    path: lock_file.to_path_buf(),
                    waited_ms: waited.as_millis() as u64,
                    timeout_ms: options.timeout.as_millis() as u64,
                });
            }
            if waited >= next_report {
                info!(
                    "Have been waiting on lock file '{}' for {}. If this persists, stop the other build; the lock file may need to be deleted manually.",
                    lock_file.display(),
                    format_elapsed(waited)
                );
                next_report = waited + options.print_info_after;
            }
            continue;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_file)
        {
            Ok(mut file) => {
                file.write_all(current_pid.to_string().as_bytes())
                    .and_then(|_| file.sync_all())
                    .map_err(|e| KilnError::io(format!("writing lock file {}", lock_file.display()), e))?;
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(KilnError::io(
                    format!("creating lock file {}", lock_file.display()),
                    e,
                ))
            }
        }
    }
}

/// Delete an abandoned lock file unless another waiter already replaced it
fn remove_stale(lock_file: &Path, holder: Option<u32>) -> KilnResult<()> {
    if inspect(lock_file) != Holder::Abandoned(holder) {
        return Ok(());
    }
    match fs::remove_file(lock_file) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KilnError::io(
            format!("deleting abandoned lock file {}", lock_file.display()),
            e,
        )),
    }
}
