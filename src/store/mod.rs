//! On-disk cache store
//!
//! Each action execution lives in its own directory named after the action
//! and its input hash. Entries are append-only: a different input hash always
//! maps to a new directory, and an entry is only trusted once its metadata has
//! been written after a successful execution.
//!
//! ```text
//! <cache-root>/
//!   <action-name>_<inputHash>/
//!     lock             holder pid, present only while in use
//!     metadata.json    output hashes, protection list, last use
//!     <outputs...>
//!   maintenance.lock
//!   maintenance.json
//! ```

pub mod lock;

pub use lock::{is_lock_active, LockGuard, LockOptions, LockRegistry};

use crate::error::{KilnError, KilnResult};
use crate::util::{atomic_write, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const METADATA_FILE: &str = "metadata.json";
pub const LOCK_FILE: &str = "lock";
pub const MAINTENANCE_LOCK_FILE: &str = "maintenance.lock";
pub const MAINTENANCE_FILE: &str = "maintenance.json";

/// Persisted record of a successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Hashes of the action's outputs, in declaration order
    pub output_hashes: Vec<String>,
    /// Entries this one relies on having been valid; shields them from eviction
    pub skipped_when_up_to_date: Option<BTreeSet<String>>,
    /// Epoch millis of the last execution or cache hit
    pub last_used: u64,
}

impl Metadata {
    pub fn new(output_hashes: Vec<String>, skipped_when_up_to_date: Option<BTreeSet<String>>) -> Self {
        Self {
            output_hashes,
            skipped_when_up_to_date,
            last_used: now_millis(),
        }
    }

    pub fn touched(&self) -> Self {
        Self {
            last_used: now_millis(),
            ..self.clone()
        }
    }

    /// Whether `entry_id` is on this entry's protection list
    pub fn protects(&self, entry_id: &str) -> bool {
        self.skipped_when_up_to_date
            .as_ref()
            .is_some_and(|set| set.contains(entry_id))
    }
}

/// Root of a cache, resolving entry locations
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry(&self, action_name: &str, input_hash: &str) -> CacheEntry {
        let id = entry_id(action_name, input_hash);
        CacheEntry {
            dir: self.root.join(&id),
            id,
        }
    }

    pub fn maintenance_lock(&self) -> PathBuf {
        self.root.join(MAINTENANCE_LOCK_FILE)
    }

    pub fn maintenance_file(&self) -> PathBuf {
        self.root.join(MAINTENANCE_FILE)
    }

    /// All entry directories under the root, sorted by name
    pub fn entries(&self) -> KilnResult<Vec<CacheEntry>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let read = fs::read_dir(&self.root)
            .map_err(|e| KilnError::io(format!("listing cache root {}", self.root.display()), e))?;
        let mut entries = Vec::new();
        for item in read {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    debug!("Skipping unreadable cache root entry: {}", e);
                    continue;
                }
            };
            let is_dir = item.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            entries.push(CacheEntry {
                id: item.file_name().to_string_lossy().into_owned(),
                dir: item.path(),
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}

/// Identifier of a cache entry: `<action-name>_<inputHash>`
pub fn entry_id(action_name: &str, input_hash: &str) -> String {
    format!("{}_{}", action_name, input_hash)
}

/// One `<action-name>_<inputHash>` directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    id: String,
    dir: PathBuf,
}

impl CacheEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Input-hash part of the identifier (after the last `_`)
    pub fn input_hash(&self) -> Option<&str> {
        self.id.rsplit_once('_').map(|(_, hash)| hash)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn output_path(&self, output_name: &str) -> PathBuf {
        self.dir.join(output_name)
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata_path().is_file()
    }

    pub fn is_locked(&self) -> bool {
        is_lock_active(&self.lock_path())
    }

    /// Read `metadata.json`.
    ///
    /// Missing or corrupt metadata yields `None`: the entry is then simply
    /// not up to date.
    pub fn read_metadata(&self) -> Option<Metadata> {
        let path = self.metadata_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {}", path.display(), e);
                }
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!("Ignoring corrupt metadata {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn write_metadata(&self, metadata: &Metadata) -> KilnResult<()> {
        let json = serde_json::to_vec(metadata)?;
        atomic_write(&self.metadata_path(), &json)
    }

    /// Refresh `lastUsed`, keeping everything else
    pub fn touch(&self) -> KilnResult<bool> {
        match self.read_metadata() {
            Some(metadata) => {
                self.write_metadata(&metadata.touched())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
