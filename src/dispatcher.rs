//! Dispatcher: the registry of provided values and actions
//!
//! Registration validates the producer invariants eagerly, so a conflicting
//! setup fails at the call that introduces the conflict. `dispatch` then builds
//! the graph for the requested values and executes it against the cache.

use crate::action::{Action, Registration};
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::graph::execute::Executor;
use crate::graph::{DispatchReport, WorkGraph};
use crate::store::{CacheStore, LockOptions, LockRegistry};
use crate::util::format_elapsed;
use crate::value::{OutputKind, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub struct Dispatcher {
    store: CacheStore,
    locks: Arc<LockRegistry>,
    lock_options: LockOptions,
    provided: HashSet<Value>,
    registrations: Vec<Arc<Registration>>,
    terminal_input_hash: Option<String>,
}

impl Dispatcher {
    /// Dispatcher over the cache at `cache_root`, with its own lock registry
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            store: CacheStore::new(cache_root),
            locks: Arc::new(LockRegistry::new()),
            lock_options: LockOptions::default(),
            provided: HashSet::new(),
            registrations: Vec::new(),
            terminal_input_hash: None,
        }
    }

    /// Dispatcher configured from `config`, using `cache_root`
    pub fn from_config(config: &Config, cache_root: impl Into<PathBuf>) -> Self {
        Self::new(cache_root).with_lock_options(config.lock_options())
    }

    /// Coordinate with other dispatchers sharing `locks`
    pub fn with_lock_registry(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    pub fn cache_root(&self) -> &Path {
        self.store.root()
    }

    pub fn lock_registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// New lazy file output; its path is bound when the owning action runs
    pub fn output_file(&self, name: impl Into<String>) -> Value {
        Value::output(name, OutputKind::File)
    }

    /// New lazy directory output
    pub fn output_dir(&self, name: impl Into<String>) -> Value {
        Value::output(name, OutputKind::Directory)
    }

    /// Mark `value` as supplied from outside the graph
    pub fn provided(&mut self, value: Value) -> KilnResult<Value> {
        if let Some(reg) = self.registrations.iter().find(|r| r.produces(&value)) {
            return Err(KilnError::ProvidedIsOutput {
                value: value.to_string(),
                action: reg.name.clone(),
            });
        }
        if !self.provided.insert(value.clone()) {
            return Err(KilnError::AlreadyProvided(value.to_string()));
        }
        Ok(value)
    }

    /// Register `action` under `name`, returning it for later wiring
    pub fn register<T: Action + 'static>(
        &mut self,
        name: impl Into<String>,
        action: T,
    ) -> KilnResult<Arc<T>> {
        let name = name.into();
        if self.registrations.iter().any(|r| r.name == name) {
            return Err(KilnError::DuplicateAction(name));
        }

        let action = Arc::new(action);
        let registration = Registration::new(name, action.clone());
        for output in &registration.outputs {
            if output.as_output().is_none() {
                return Err(KilnError::UnsupportedOutput {
                    action: registration.name.clone(),
                    value: output.to_string(),
                });
            }
            if self.provided.contains(output) {
                return Err(KilnError::OutputIsProvided {
                    action: registration.name.clone(),
                    value: output.to_string(),
                });
            }
            if let Some(other) = self.registrations.iter().find(|r| r.produces(output)) {
                return Err(KilnError::OutputAlreadyProduced {
                    action: registration.name.clone(),
                    value: output.to_string(),
                    producer: other.name.clone(),
                });
            }
        }

        for output in &registration.outputs {
            output.set_owner(&registration.name);
        }
        debug!(
            "Registered {} ({} inputs, {} outputs)",
            registration.name,
            registration.inputs.len(),
            registration.outputs.len()
        );
        self.registrations.push(Arc::new(registration));
        Ok(action)
    }

    /// Look up a previously registered action by name and type
    pub fn registered<T: Action + 'static>(&self, name: &str) -> KilnResult<Arc<T>> {
        let registration = self
            .registrations
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| KilnError::ActionNotFound(name.to_string()))?;

        registration
            .any
            .clone()
            .downcast::<T>()
            .map_err(|_| KilnError::ActionTypeMismatch(name.to_string()))
    }

    /// Names of all registered actions, in registration order
    pub fn action_names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    /// Assert the input hash of the requested values' producers.
    ///
    /// Enables the early up-to-date check: a root whose entry for this hash is
    /// valid is skipped without building its dependencies.
    pub fn override_terminal_input_hash(&mut self, hash: impl Into<String>) {
        self.terminal_input_hash = Some(hash.into());
    }

    /// Build and execute whatever is needed to produce `targets`
    pub fn dispatch(&self, targets: &[Value]) -> KilnResult<DispatchReport> {
        self.dispatch_with_progress(targets, |_| {})
    }

    /// Like [`Dispatcher::dispatch`], reporting each action name as it is visited
    pub fn dispatch_with_progress<F>(
        &self,
        targets: &[Value],
        mut progress: F,
    ) -> KilnResult<DispatchReport>
    where
        F: FnMut(&str),
    {
        let start = Instant::now();
        let graph = WorkGraph::build(&self.provided, &self.registrations, targets)?;
        let graph_built_in = start.elapsed();
        debug!("Built work graph of {} nodes in {}", graph.len(), format_elapsed(graph_built_in));

        let start = Instant::now();
        let mut report = Executor::new(
            &graph,
            &self.store,
            &self.locks,
            &self.lock_options,
            self.terminal_input_hash.as_deref(),
            &mut progress,
        )
        .run()?;
        report.graph_built_in = graph_built_in;
        report.executed_in = start.elapsed();

        if !graph.is_empty() {
            info!(
                "Dispatch finished in {}: {} executed, {} up-to-date",
                format_elapsed(report.executed_in),
                report.executed.len(),
                report.up_to_date.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::FnAction;
    use std::fs;
    use tempfile::TempDir;

    struct CopyAction {
        input: Value,
        output: Value,
    }

    impl Action for CopyAction {
        fn inputs(&self) -> Vec<Value> {
            vec![self.input.clone()]
        }

        fn outputs(&self) -> Vec<Value> {
            vec![self.output.clone()]
        }

        fn execute(&self) -> Result<(), crate::error::ActionError> {
            fs::copy(self.input.path()?, self.output.path()?)?;
            Ok(())
        }
    }

    fn noop(outputs: Vec<Value>) -> FnAction {
        FnAction::new(vec![], outputs, |_, _| Ok(()))
    }

    #[test]
    fn provided_twice_fails() {
        let mut d = Dispatcher::new("/unused");
        let v = d.provided(Value::string("x")).unwrap();
        assert!(matches!(d.provided(v), Err(KilnError::AlreadyProvided(_))));
    }

    #[test]
    fn provided_output_fails() {
        let mut d = Dispatcher::new("/unused");
        let out = d.output_file("out");
        d.register("make", noop(vec![out.clone()])).unwrap();

        match d.provided(out).unwrap_err() {
            KilnError::ProvidedIsOutput { action, .. } => assert_eq!(action, "make"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn duplicate_name_fails() {
        let mut d = Dispatcher::new("/unused");
        let a = d.output_file("a");
        let b = d.output_file("b");
        d.register("make", noop(vec![a])).unwrap();
        assert!(matches!(
            d.register("make", noop(vec![b])),
            Err(KilnError::DuplicateAction(_))
        ));
    }

    #[test]
    fn output_produced_twice_fails() {
        let mut d = Dispatcher::new("/unused");
        let out = d.output_file("out");
        d.register("first", noop(vec![out.clone()])).unwrap();

        match d.register("second", noop(vec![out.clone()])).unwrap_err() {
            KilnError::OutputAlreadyProduced { producer, .. } => assert_eq!(producer, "first"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(out.as_output().unwrap().owner(), Some("first"));
        assert_eq!(d.action_names(), vec!["first"]);
    }

    #[test]
    fn output_must_be_lazy() {
        let mut d = Dispatcher::new("/unused");
        let eager = Value::file("/tmp/out");
        assert!(matches!(
            d.register("bad", noop(vec![eager])),
            Err(KilnError::UnsupportedOutput { .. })
        ));
    }

    #[test]
    fn output_cannot_be_provided() {
        let mut d = Dispatcher::new("/unused");
        let out = d.provided(d.output_file("out")).unwrap();
        assert!(matches!(
            d.register("make", noop(vec![out])),
            Err(KilnError::OutputIsProvided { .. })
        ));
    }

    #[test]
    fn registered_is_typed() {
        let mut d = Dispatcher::new("/unused");
        let src = d.provided(Value::file("/tmp/src")).unwrap();
        let output = d.output_file("copy");
        let copy = d.register("copy", CopyAction { input: src, output }).unwrap();

        let found: Arc<CopyAction> = d.registered("copy").unwrap();
        assert!(Arc::ptr_eq(&copy, &found));
        assert!(matches!(
            d.registered::<FnAction>("copy"),
            Err(KilnError::ActionTypeMismatch(_))
        ));
        assert!(matches!(
            d.registered::<CopyAction>("missing"),
            Err(KilnError::ActionNotFound(_))
        ));
    }

    #[test]
    fn dispatch_runs_trait_action() {
        let temp = TempDir::new().unwrap();
        let src_path = temp.path().join("src.txt");
        fs::write(&src_path, "content").unwrap();

        let mut d = Dispatcher::new(temp.path().join("cache"));
        let src = d.provided(Value::file(&src_path)).unwrap();
        let output = d.output_file("copy.txt");
        let copy = d.register("copy", CopyAction { input: src, output }).unwrap();

        let mut visited = Vec::new();
        let report = d
            .dispatch_with_progress(&[copy.output.clone()], |name| visited.push(name.to_string()))
            .unwrap();

        assert_eq!(visited, vec!["copy"]);
        assert_eq!(report.executed, vec!["copy"]);
        let out_path = copy.output.path().unwrap();
        assert!(out_path.starts_with(temp.path().join("cache")));
        assert_eq!(fs::read_to_string(out_path).unwrap(), "content");
    }

    #[test]
    fn dispatch_of_provided_value_does_nothing() {
        let temp = TempDir::new().unwrap();
        let mut d = Dispatcher::new(temp.path());
        let v = d.provided(Value::string("x")).unwrap();

        let report = d.dispatch(&[v]).unwrap();
        assert!(report.executed.is_empty());
        assert!(report.up_to_date.is_empty());
    }
}
