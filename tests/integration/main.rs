//! Integration tests for Kiln

mod dispatch_tests {
    use kiln::store::Metadata;
    use kiln::{Action, ActionError, CacheManager, Dispatcher, Eviction, FnAction, Value};
    use serial_test::serial;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    /// Copies its input file
    struct CopyFile {
        src: Value,
        out: Value,
        runs: Arc<AtomicUsize>,
    }

    impl Action for CopyFile {
        fn inputs(&self) -> Vec<Value> {
            vec![self.src.clone()]
        }

        fn outputs(&self) -> Vec<Value> {
            vec![self.out.clone()]
        }

        fn execute(&self) -> Result<(), ActionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            fs::copy(self.src.path()?, self.out.path()?)?;
            Ok(())
        }
    }

    /// Writes its input file uppercased
    struct UppercaseFile {
        src: Value,
        out: Value,
        runs: Arc<AtomicUsize>,
    }

    impl Action for UppercaseFile {
        fn inputs(&self) -> Vec<Value> {
            vec![self.src.clone()]
        }

        fn outputs(&self) -> Vec<Value> {
            vec![self.out.clone()]
        }

        fn execute(&self) -> Result<(), ActionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let text = fs::read_to_string(self.src.path()?)?;
            fs::write(self.out.path()?, text.to_uppercase())?;
            Ok(())
        }
    }

    struct Chain {
        dispatcher: Dispatcher,
        a1: Arc<CopyFile>,
        a2: Arc<UppercaseFile>,
    }

    fn chain(cache: &Path, src_file: &Path) -> Chain {
        let mut dispatcher = Dispatcher::new(cache);
        let src = dispatcher.provided(Value::file(src_file)).unwrap();
        let out1 = dispatcher.output_file("out1.txt");
        let out2 = dispatcher.output_file("out2.txt");
        let a1 = dispatcher
            .register(
                "a1",
                CopyFile {
                    src,
                    out: out1,
                    runs: Arc::default(),
                },
            )
            .unwrap();
        let a2 = dispatcher
            .register(
                "a2",
                UppercaseFile {
                    src: a1.out.clone(),
                    out: out2,
                    runs: Arc::default(),
                },
            )
            .unwrap();
        Chain { dispatcher, a1, a2 }
    }

    fn entry_ids(cache: &Path) -> Vec<String> {
        CacheManager::new(cache)
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    #[test]
    fn copy_then_uppercase_scenario() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let src_file = temp.path().join("src.txt");
        fs::write(&src_file, "x").unwrap();

        let c = chain(&cache, &src_file);
        let target = c.a2.out.clone();

        let report = c.dispatcher.dispatch(&[target.clone()]).unwrap();
        assert_eq!(report.executed, vec!["a1", "a2"]);
        assert_eq!(fs::read_to_string(c.a1.out.path().unwrap()).unwrap(), "x");
        assert_eq!(fs::read_to_string(target.path().unwrap()).unwrap(), "X");

        // unchanged input: nothing runs
        let report = c.dispatcher.dispatch(&[target.clone()]).unwrap();
        assert!(report.executed.is_empty());
        assert_eq!(report.up_to_date, vec!["a1", "a2"]);
        assert_eq!(c.a1.runs.load(Ordering::SeqCst), 1);
        assert_eq!(c.a2.runs.load(Ordering::SeqCst), 1);

        // changed input: both rerun into new entries, old ones stay
        let old_ids = entry_ids(&cache);
        fs::write(&src_file, "y").unwrap();
        let report = c.dispatcher.dispatch(&[target.clone()]).unwrap();
        assert_eq!(report.executed, vec!["a1", "a2"]);
        assert_eq!(fs::read_to_string(target.path().unwrap()).unwrap(), "Y");

        let new_ids = entry_ids(&cache);
        assert_eq!(new_ids.len(), 4);
        assert!(old_ids.iter().all(|id| new_ids.contains(id)));
    }

    #[test]
    fn separate_dispatchers_share_cache() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let src_file = temp.path().join("src.txt");
        fs::write(&src_file, "shared").unwrap();

        let first = chain(&cache, &src_file);
        first.dispatcher.dispatch(&[first.a2.out.clone()]).unwrap();

        let second = chain(&cache, &src_file);
        let report = second.dispatcher.dispatch(&[second.a2.out.clone()]).unwrap();
        assert!(report.executed.is_empty());
        assert_eq!(
            fs::read_to_string(second.a2.out.path().unwrap()).unwrap(),
            "SHARED"
        );
    }

    #[test]
    fn failed_action_is_retried() {
        let temp = TempDir::new().unwrap();
        let mut dispatcher = Dispatcher::new(temp.path());
        let input = dispatcher.provided(Value::string("payload")).unwrap();
        let out = dispatcher.output_file("out.txt");
        let fail = Arc::new(AtomicBool::new(true));
        let runs = Arc::new(AtomicUsize::new(0));

        let (fail_flag, run_count) = (fail.clone(), runs.clone());
        dispatcher
            .register(
                "flaky",
                FnAction::new(vec![input], vec![out.clone()], move |ins, outs| {
                    run_count.fetch_add(1, Ordering::SeqCst);
                    fs::write(outs[0].path()?, ins[0].as_str()?)?;
                    if fail_flag.load(Ordering::SeqCst) {
                        return Err("tool crashed after writing output".into());
                    }
                    Ok(())
                }),
            )
            .unwrap();

        let err = dispatcher.dispatch(&[out.clone()]).unwrap_err();
        assert_eq!(err.to_string(), "Exception executing flaky");

        fail.store(false, Ordering::SeqCst);
        let report = dispatcher.dispatch(&[out.clone()]).unwrap();
        assert_eq!(report.executed, vec!["flaky"]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn construction_errors_run_nothing() {
        let temp = TempDir::new().unwrap();
        let mut dispatcher = Dispatcher::new(temp.path());
        let missing = Value::string("never provided");
        let out = dispatcher.output_file("out.txt");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        dispatcher
            .register(
                "needs-missing",
                FnAction::new(vec![missing], vec![out.clone()], move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let err = dispatcher.dispatch(&[out]).unwrap_err();
        assert!(err.is_construction_error());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(entry_ids(temp.path()).is_empty());
    }

    #[test]
    fn terminal_hash_skips_subgraph_and_protects_it() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let src_file = temp.path().join("src.txt");
        fs::write(&src_file, "bundle contents").unwrap();

        let mut c = chain(&cache, &src_file);
        c.dispatcher.override_terminal_input_hash("bundle-1");
        let first = c.dispatcher.dispatch(&[c.a2.out.clone()]).unwrap();
        assert_eq!(first.executed, vec!["a1", "a2"]);

        // a fresh process run: the root is found by hash alone
        let mut again = chain(&cache, &src_file);
        again.dispatcher.override_terminal_input_hash("bundle-1");
        let mut visited = Vec::new();
        let report = again
            .dispatcher
            .dispatch_with_progress(&[again.a2.out.clone()], |name| visited.push(name.to_string()))
            .unwrap();
        assert_eq!(visited, vec!["a2"]);
        assert_eq!(report.up_to_date, vec!["a2"]);
        assert!(again.a1.out.path().is_err(), "a1 was never visited");

        // a1's entry has expired, a2's is fresh and names it
        let manager = CacheManager::new(&cache);
        let a1_id = entry_ids(&cache)
            .into_iter()
            .find(|id| id.starts_with("a1_"))
            .unwrap();
        let a1_entry = manager
            .store()
            .entries()
            .unwrap()
            .into_iter()
            .find(|e| e.id() == a1_id)
            .unwrap();
        let metadata = a1_entry.read_metadata().unwrap();
        a1_entry
            .write_metadata(&Metadata {
                last_used: metadata.last_used - 30 * DAY_MS,
                ..metadata
            })
            .unwrap();

        match manager.clean(Duration::from_secs(7 * 24 * 3600)).unwrap() {
            Eviction::Completed(report) => {
                assert!(report.deleted.is_empty());
                assert_eq!(report.protected, vec![a1_id.clone()]);
            }
            other => panic!("unexpected eviction {:?}", other),
        }
        assert!(cache.join(&a1_id).exists());
    }

    fn slow_writer(dispatcher: &mut Dispatcher, runs: Arc<AtomicUsize>) -> Value {
        let input = dispatcher.provided(Value::string("same input")).unwrap();
        let out = dispatcher.output_file("out.txt");
        dispatcher
            .register(
                "slow",
                FnAction::new(vec![input], vec![out.clone()], move |_, outs| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(300));
                    fs::write(outs[0].path()?, "result")?;
                    Ok(())
                }),
            )
            .unwrap();
        out
    }

    fn race(cache: &Path, shared: Option<Arc<kiln::LockRegistry>>) -> (usize, Vec<String>) {
        let fast_poll = kiln::LockOptions {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };

        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (cache, runs, barrier, shared) =
                    (cache.to_path_buf(), runs.clone(), barrier.clone(), shared.clone());
                thread::spawn(move || {
                    let mut dispatcher = Dispatcher::new(cache).with_lock_options(fast_poll);
                    if let Some(locks) = shared {
                        dispatcher = dispatcher.with_lock_registry(locks);
                    }
                    let out = slow_writer(&mut dispatcher, runs);
                    barrier.wait();
                    dispatcher.dispatch(&[out.clone()]).unwrap();
                    fs::read_to_string(out.path().unwrap()).unwrap()
                })
            })
            .collect();

        let contents = handles.into_iter().map(|h| h.join().unwrap()).collect();
        (runs.load(Ordering::SeqCst), contents)
    }

    #[test]
    #[serial]
    fn concurrent_dispatchers_execute_once() {
        let temp = TempDir::new().unwrap();
        let (runs, contents) = race(temp.path(), None);
        assert_eq!(runs, 1);
        assert_eq!(contents, vec!["result", "result"]);
    }

    #[test]
    #[serial]
    fn shared_registry_executes_once() {
        let temp = TempDir::new().unwrap();
        let (runs, contents) = race(temp.path(), Some(Arc::new(kiln::LockRegistry::new())));
        assert_eq!(runs, 1);
        assert_eq!(contents, vec!["result", "result"]);
    }
}

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use kiln::{Dispatcher, FnAction, Value};
    use predicates::prelude::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Binary isolated from the user's config and cache
    fn kiln(temp: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.env("KILN_CONFIG", temp.join("config.toml"))
            .env("KILN_CACHE_DIR", temp.join("cache"));
        cmd
    }

    fn populate(cache: &Path) {
        let mut dispatcher = Dispatcher::new(cache);
        let input = dispatcher.provided(Value::string("hello")).unwrap();
        let out = dispatcher.output_file("greeting.txt");
        dispatcher
            .register(
                "greet",
                FnAction::new(vec![input], vec![out.clone()], |ins, outs| {
                    fs::write(outs[0].path()?, ins[0].as_str()?)?;
                    Ok(())
                }),
            )
            .unwrap();
        dispatcher.dispatch(&[out]).unwrap();
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "Incremental work orchestration with a content-addressed on-disk cache",
            ))
            .stdout(predicate::str::contains("Usage: kiln"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("expire_unused_after = \"7d\""));
    }

    #[test]
    fn config_init_writes_file() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path()).args(["config", "init"]).assert().success();
        assert!(temp.path().join("config.toml").is_file());
    }

    #[test]
    fn invalid_config_fails() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("config.toml"), "[lock]\ntimeout = \"forever\"").unwrap();
        kiln(temp.path())
            .args(["cache", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn list_empty() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries"));
    }

    #[test]
    fn list_populated_as_json() {
        let temp = TempDir::new().unwrap();
        populate(&temp.path().join("cache"));
        kiln(temp.path())
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"action\": \"greet\""));
    }

    #[test]
    fn maintain_initializes() {
        let temp = TempDir::new().unwrap();
        populate(&temp.path().join("cache"));
        kiln(temp.path())
            .args(["cache", "maintain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));
        assert!(temp.path().join("cache").join("maintenance.json").is_file());
    }

    #[test]
    fn clean_dry_run_keeps_entries() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        populate(&cache);
        std::thread::sleep(std::time::Duration::from_millis(1100));

        kiln(temp.path())
            .args(["cache", "clean", "--expire", "1s", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Would delete 1"));
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 1);
    }
}
