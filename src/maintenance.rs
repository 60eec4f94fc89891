//! Cache maintenance and eviction
//!
//! Maintenance runs under its own lock over the whole cache root. Cleanups are
//! rate limited (`perform_cleanup_after`) and, once due, scheduled a grace
//! period into the future (`delay_cleanup_by`) so entries written just before
//! the decision are not immediately at risk.
//!
//! An eviction pass deletes entries unused for longer than the expiry, except
//! those named in a retained entry's protection list. If any remaining
//! candidate is locked, nothing at all is deleted.

use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::store::{CacheEntry, CacheStore, LockOptions, LockRegistry};
use crate::util::{atomic_write, dir_size, format_bytes, format_elapsed, format_millis, now_millis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Timers governing when cleanups happen and what they delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenancePolicy {
    pub expire_unused_after: Duration,
    pub perform_cleanup_after: Duration,
    pub delay_cleanup_by: Duration,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        Self {
            expire_unused_after: Duration::from_secs(7 * 24 * 60 * 60),
            perform_cleanup_after: Duration::from_secs(24 * 60 * 60),
            delay_cleanup_by: Duration::from_secs(60 * 60),
        }
    }
}

/// Contents of `maintenance.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceInfo {
    pub last_cleanup: u64,
    pub scheduled_cleanup: Option<u64>,
}

impl MaintenanceInfo {
    fn fresh() -> Self {
        Self {
            last_cleanup: now_millis(),
            scheduled_cleanup: None,
        }
    }
}

/// Result of one eviction pass that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Entries deleted (or that would be, for a preview)
    pub deleted: Vec<String>,
    pub deleted_bytes: u64,
    /// Expired entries spared because a retained entry depends on them
    pub protected: Vec<String>,
    /// Number of entries still within their retention window
    pub kept: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    Completed(EvictionReport),
    /// A candidate was locked; nothing was deleted
    Aborted { locked_entry: String },
}

/// What a maintenance pass decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    /// The cache root does not exist yet
    MissingRoot,
    /// First pass over this cache; bookkeeping created
    Initialized,
    /// Last cleanup is too recent
    NotDue,
    /// Cleanup scheduled for the given epoch millis
    Scheduled { at: u64 },
    /// Cleanup scheduled but its time has not come
    Waiting { until: u64 },
    Cleaned(EvictionReport),
    /// Cleanup attempted and abandoned; retried on a later pass
    Aborted { locked_entry: String },
}

/// One cache entry as seen by `kiln cache list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub id: String,
    pub action: String,
    pub input_hash: String,
    pub size_bytes: u64,
    /// None while the entry has no readable metadata
    pub last_used: Option<u64>,
    pub locked: bool,
    pub protects: Vec<String>,
}

pub struct CacheManager {
    store: CacheStore,
    locks: Arc<LockRegistry>,
    lock_options: LockOptions,
}

impl CacheManager {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            store: CacheStore::new(cache_root),
            locks: Arc::new(LockRegistry::new()),
            lock_options: LockOptions::default(),
        }
    }

    pub fn from_config(config: &Config, cache_root: impl Into<PathBuf>) -> Self {
        Self::new(cache_root).with_lock_options(config.lock_options())
    }

    pub fn with_lock_registry(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Run one maintenance pass.
    ///
    /// `identity` is the terminal input hash of the current run; root entries
    /// ending in it get their last-used time refreshed even when the dispatch
    /// never looked at them.
    pub fn perform_maintenance(
        &self,
        policy: &MaintenancePolicy,
        identity: Option<&str>,
    ) -> KilnResult<MaintenanceOutcome> {
        if !self.store.root().is_dir() {
            debug!("Cache root {} does not exist, nothing to maintain", self.store.root().display());
            return Ok(MaintenanceOutcome::MissingRoot);
        }

        let start = Instant::now();
        let outcome = self.locks.with_lock(&self.store.maintenance_lock(), &self.lock_options, || {
            info!("Acquired cache maintenance lock in {}", format_elapsed(start.elapsed()));
            if let Some(identity) = identity {
                self.touch_identity(identity)?;
            }
            self.advance_schedule(policy)
        })?;

        info!("Finished cache maintenance in {}", format_elapsed(start.elapsed()));
        Ok(outcome)
    }

    /// Evict expired entries now, ignoring the schedule
    pub fn clean(&self, expire_unused_after: Duration) -> KilnResult<Eviction> {
        self.locked_evict(expire_unused_after, false)
    }

    /// What [`CacheManager::clean`] would delete, without deleting anything
    pub fn preview(&self, expire_unused_after: Duration) -> KilnResult<Eviction> {
        self.locked_evict(expire_unused_after, true)
    }

    pub fn maintenance_info(&self) -> Option<MaintenanceInfo> {
        read_info(&self.store.maintenance_file())
    }

    pub fn entries(&self) -> KilnResult<Vec<EntryInfo>> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .map(|entry| {
                let metadata = entry.read_metadata();
                let (action, input_hash) = entry.id().rsplit_once('_').unwrap_or((entry.id(), ""));
                EntryInfo {
                    id: entry.id().to_string(),
                    action: action.to_string(),
                    input_hash: input_hash.to_string(),
                    size_bytes: dir_size(entry.dir()),
                    last_used: metadata.as_ref().map(|m| m.last_used),
                    locked: entry.is_locked(),
                    protects: metadata
                        .and_then(|m| m.skipped_when_up_to_date)
                        .map(|set| set.into_iter().collect())
                        .unwrap_or_default(),
                }
            })
            .collect())
    }

    fn touch_identity(&self, identity: &str) -> KilnResult<()> {
        let suffix = format!("_{}", identity);
        for entry in self.store.entries()? {
            if !entry.id().ends_with(&suffix) || !entry.has_metadata() || entry.is_locked() {
                continue;
            }
            if entry.touch()? {
                debug!("Refreshed last use of {}", entry.id());
            }
        }
        Ok(())
    }

    fn advance_schedule(&self, policy: &MaintenancePolicy) -> KilnResult<MaintenanceOutcome> {
        let file = self.store.maintenance_file();
        let Some(info) = read_info(&file) else {
            write_info(&file, &MaintenanceInfo::fresh())?;
            return Ok(MaintenanceOutcome::Initialized);
        };

        let now = now_millis();
        if now.saturating_sub(info.last_cleanup) < millis(policy.perform_cleanup_after) {
            return Ok(MaintenanceOutcome::NotDue);
        }

        match info.scheduled_cleanup {
            None => {
                let at = now.saturating_add(millis(policy.delay_cleanup_by));
                info!("Scheduled cache cleanup for after {}", format_millis(at));
                write_info(
                    &file,
                    &MaintenanceInfo {
                        scheduled_cleanup: Some(at),
                        ..info
                    },
                )?;
                Ok(MaintenanceOutcome::Scheduled { at })
            }
            Some(until) if now < until => Ok(MaintenanceOutcome::Waiting { until }),
            Some(_) => match self.evict(policy.expire_unused_after, false)? {
                Eviction::Completed(report) => {
                    write_info(
                        &file,
                        &MaintenanceInfo {
                            last_cleanup: now_millis(),
                            scheduled_cleanup: None,
                        },
                    )?;
                    Ok(MaintenanceOutcome::Cleaned(report))
                }
                Eviction::Aborted { locked_entry } => {
                    Ok(MaintenanceOutcome::Aborted { locked_entry })
                }
            },
        }
    }

    fn locked_evict(&self, expire_unused_after: Duration, dry_run: bool) -> KilnResult<Eviction> {
        if !self.store.root().is_dir() {
            return Ok(Eviction::Completed(EvictionReport::default()));
        }
        self.locks.with_lock(&self.store.maintenance_lock(), &self.lock_options, || {
            self.evict(expire_unused_after, dry_run)
        })
    }

    /// Caller holds the maintenance lock
    fn evict(&self, expire_unused_after: Duration, dry_run: bool) -> KilnResult<Eviction> {
        let start = Instant::now();
        let now = now_millis();
        let expiry = millis(expire_unused_after);

        let mut candidates: Vec<CacheEntry> = Vec::new();
        let mut keep: Vec<CacheEntry> = Vec::new();
        for entry in self.store.entries()? {
            // no metadata means never completed, or still running
            let Some(last_used) = last_used(&entry) else {
                continue;
            };
            if now.saturating_sub(last_used) > expiry {
                candidates.push(entry);
            } else {
                keep.push(entry);
            }
        }

        let mut report = EvictionReport {
            kept: keep.len(),
            ..Default::default()
        };
        if !candidates.is_empty() {
            for retained in &keep {
                let Some(metadata) = retained.read_metadata() else {
                    continue;
                };
                candidates.retain(|candidate| {
                    let protected = metadata.protects(candidate.id());
                    if protected {
                        debug!("{} is protected by {}", candidate.id(), retained.id());
                        report.protected.push(candidate.id().to_string());
                    }
                    !protected
                });
            }
        }

        // Candidate locks stay held until their directories are gone.
        let mut guards = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let free = if dry_run {
                !candidate.is_locked()
            } else {
                match self.locks.try_acquire(&candidate.lock_path())? {
                    Some(guard) => {
                        guards.push(guard);
                        true
                    }
                    None => false,
                }
            };
            if !free {
                warn!("Aborted cache cleanup due to locked cache entry ({})", candidate.id());
                return Ok(Eviction::Aborted {
                    locked_entry: candidate.id().to_string(),
                });
            }
        }

        for candidate in candidates {
            report.deleted_bytes += dir_size(candidate.dir());
            if !dry_run {
                fs::remove_dir_all(candidate.dir()).map_err(|e| {
                    KilnError::io(format!("deleting cache entry {}", candidate.dir().display()), e)
                })?;
            }
            report.deleted.push(candidate.id().to_string());
        }
        drop(guards);

        if dry_run {
            info!(
                "Would delete {} expired cache entries totaling {}",
                report.deleted.len(),
                format_bytes(report.deleted_bytes)
            );
        } else {
            info!(
                "Deleted {} expired cache entries totaling {} in {}",
                report.deleted.len(),
                format_bytes(report.deleted_bytes),
                format_elapsed(start.elapsed())
            );
        }
        Ok(Eviction::Completed(report))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Recorded last use, or the metadata file's mtime when it cannot be parsed
fn last_used(entry: &CacheEntry) -> Option<u64> {
    if !entry.has_metadata() {
        return None;
    }
    if let Some(metadata) = entry.read_metadata() {
        return Some(metadata.last_used);
    }
    let modified = fs::metadata(entry.metadata_path()).and_then(|m| m.modified()).ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(millis)
}

fn read_info(path: &std::path::Path) -> Option<MaintenanceInfo> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("Ignoring corrupt maintenance file {}: {}", path.display(), e);
            None
        }
    }
}

fn write_info(path: &std::path::Path, info: &MaintenanceInfo) -> KilnResult<()> {
    atomic_write(path, &serde_json::to_vec(info)?)
}
