//! Graph execution against the on-disk cache
//!
//! Nodes run depth-first, dependencies before dependents. For every node the
//! input hash selects a cache entry; under that entry's lock the recorded
//! output hashes are compared with the outputs on disk and the action only
//! runs on a mismatch. Metadata is written last, after a successful run.
//!
//! When the caller supplies a terminal input hash, root nodes first check
//! their entry for that hash without visiting dependencies at all. On a miss
//! the root falls back, exactly once, to a full walk.

use super::{NodeId, WorkGraph};
use crate::error::{KilnError, KilnResult};
use crate::hash::{combine_hashes, HashCache};
use crate::store::{entry_id, CacheEntry, CacheStore, LockOptions, LockRegistry, Metadata};
use crate::util::format_elapsed;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What one dispatch did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Actions that ran, in execution order
    pub executed: Vec<String>,
    /// Actions whose cache entry was already up to date
    pub up_to_date: Vec<String>,
    pub graph_built_in: Duration,
    pub executed_in: Duration,
}

impl DispatchReport {
    pub fn was_executed(&self, name: &str) -> bool {
        self.executed.iter().any(|n| n == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    UpToDate,
    Executed,
    /// Early check missed; the caller must walk the dependencies first
    Deferred,
}

pub(crate) struct Executor<'a> {
    graph: &'a WorkGraph,
    store: &'a CacheStore,
    locks: &'a LockRegistry,
    lock_options: &'a LockOptions,
    terminal_input_hash: Option<&'a str>,
    progress: &'a mut dyn FnMut(&str),
    visited: HashSet<NodeId>,
    input_hashes: Vec<Option<String>>,
    hash_cache: HashCache,
    report: DispatchReport,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(
        graph: &'a WorkGraph,
        store: &'a CacheStore,
        locks: &'a LockRegistry,
        lock_options: &'a LockOptions,
        terminal_input_hash: Option<&'a str>,
        progress: &'a mut dyn FnMut(&str),
    ) -> Self {
        Self {
            graph,
            store,
            locks,
            lock_options,
            terminal_input_hash,
            progress,
            visited: HashSet::new(),
            input_hashes: vec![None; graph.len()],
            hash_cache: HashCache::new(),
            report: DispatchReport::default(),
        }
    }

    pub(crate) fn run(mut self) -> KilnResult<DispatchReport> {
        for &root in self.graph.roots() {
            self.execute_node(root, false)?;
        }
        Ok(self.report)
    }

    fn execute_node(&mut self, id: NodeId, retry: bool) -> KilnResult<()> {
        if !retry && !self.visited.insert(id) {
            return Ok(());
        }

        let graph = self.graph;
        let node = graph.node(id);
        let name = node.registration.name.as_str();
        let terminal = if graph.is_root(id) {
            self.terminal_input_hash
        } else {
            None
        };
        let early = terminal.is_some() && !retry;

        if !early {
            for &dep in &node.dependencies {
                self.execute_node(dep, false)?;
            }
        }

        (self.progress)(name);

        let start = Instant::now();
        let input_hash = match terminal {
            Some(hash) => hash.to_string(),
            None => {
                let hashes = self.hash_cache.hash_all(&node.registration.inputs)?;
                combine_hashes(&hashes)
            }
        };
        self.input_hashes[id] = Some(input_hash.clone());

        let entry = self.store.entry(name, &input_hash);
        for output in &node.registration.outputs {
            let slot = output.as_output().ok_or_else(|| KilnError::UnsupportedOutput {
                action: name.to_string(),
                value: output.to_string(),
            })?;
            output.bind(entry.output_path(slot.name()))?;
        }

        let outcome = {
            let _guard = self.locks.acquire(&entry.lock_path(), self.lock_options)?;
            self.check_or_run(id, &entry, early, start)?
        };

        match outcome {
            Outcome::UpToDate => self.report.up_to_date.push(name.to_string()),
            Outcome::Executed => self.report.executed.push(name.to_string()),
            Outcome::Deferred => {
                debug!(
                    "Early up-to-date check for {} missed, building dependencies",
                    name
                );
                self.execute_node(id, true)?;
            }
        }
        Ok(())
    }

    /// Runs with the entry lock held
    fn check_or_run(
        &mut self,
        id: NodeId,
        entry: &CacheEntry,
        early: bool,
        start: Instant,
    ) -> KilnResult<Outcome> {
        let registration = &self.graph.node(id).registration;
        let name = registration.name.as_str();
        let outputs = &registration.outputs;

        if let Some(metadata) = entry.read_metadata() {
            if self.hash_cache.hash_all(outputs)? == metadata.output_hashes {
                info!("Skipping {} (up-to-date)", name);
                entry.write_metadata(&metadata.touched())?;
                debug!(
                    "Up-to-date check for {} took {} (up-to-date)",
                    name,
                    format_elapsed(start.elapsed())
                );
                return Ok(Outcome::UpToDate);
            }
            self.hash_cache.invalidate(outputs);
            debug!(
                "Up-to-date check for {} took {} (out-of-date)",
                name,
                format_elapsed(start.elapsed())
            );
        }

        if early {
            return Ok(Outcome::Deferred);
        }

        info!("Executing {}...", name);
        let started = Instant::now();
        registration
            .execute()
            .map_err(|e| KilnError::action_failed(name, e))?;

        self.hash_cache.invalidate(outputs);
        let output_hashes = self.hash_cache.hash_all(outputs)?;
        let protected = if self.terminal_input_hash.is_some() && self.graph.is_root(id) {
            Some(self.collect_dependencies(id)).filter(|deps| !deps.is_empty())
        } else {
            None
        };
        entry.write_metadata(&Metadata::new(output_hashes, protected))?;

        info!("Finished {} in {}", name, format_elapsed(started.elapsed()));
        Ok(Outcome::Executed)
    }

    /// Entry ids of every transitive dependency of `id`
    fn collect_dependencies(&self, id: NodeId) -> BTreeSet<String> {
        let mut deps = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for &dep in &self.graph.node(current).dependencies {
                if dep == id || !seen.insert(dep) {
                    continue;
                }
                queue.push_back(dep);
                if let Some(hash) = &self.input_hashes[dep] {
                    deps.insert(entry_id(&self.graph.node(dep).registration.name, hash));
                }
            }
        }
        deps
    }
}
