//! Behavioral tests for the evaluator: memoization, surgical re-evaluation,
//! early cutoff, dynamic dep sets, cycles, error policy and eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use skein_graph::{Context, Engine, EvalOptions, FailureKind, Handler, Step};

const POISON: i64 = i64::MIN;

/// Inputs and observation points shared between a test and its engine.
#[derive(Default)]
struct World {
    leaves: Mutex<HashMap<String, i64>>,
    defs: Mutex<HashMap<String, Vec<String>>>,
    runs: Mutex<Vec<String>>,
    counter: Mutex<i64>,
}

impl World {
    fn set_leaf(&self, name: &str, value: i64) {
        self.leaves.lock().unwrap().insert(name.to_owned(), value);
    }

    fn define(&self, name: &str, deps: &[&str]) {
        self.defs
            .lock()
            .unwrap()
            .insert(name.to_owned(), deps.iter().map(|s| (*s).to_owned()).collect());
    }

    fn take_runs(&self) -> Vec<String> {
        std::mem::take(&mut *self.runs.lock().unwrap())
    }

    fn record(&self, key: &str) {
        self.runs.lock().unwrap().push(key.to_owned());
    }
}

/// Keys: `leaf/<name>` reads a settable input, `sum/<name>` adds the deps
/// registered for `<name>`, `pick/<name>` requests `leaf/<name>.cond` and then
/// one of two further leaves, `volatile/<name>` bumps a counter on every run.
struct TestHandler {
    world: Arc<World>,
    delay: Option<Duration>,
}

impl Handler<String, i64, String> for TestHandler {
    fn evaluate(&self, key: &String, ctx: &mut Context<'_, String, i64, String>) -> Step<String, i64, String> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let world = &self.world;
        if let Some(name) = key.strip_prefix("leaf/") {
            world.record(key);
            return match world.leaves.lock().unwrap().get(name) {
                Some(&v) if v == POISON => Step::Err(format!("poisoned leaf {}", name)),
                Some(&v) => Step::Ready(v),
                None => Step::Err(format!("no such leaf {}", name)),
            };
        }
        if let Some(name) = key.strip_prefix("sum/") {
            let deps = world.defs.lock().unwrap().get(name).cloned().unwrap_or_default();
            return match ctx.request_and_wait(&deps) {
                None => Step::NotReady,
                Some(results) => {
                    let mut total = 0;
                    for result in results {
                        match result {
                            Ok(v) => total += v,
                            Err(e) => {
                                world.record(key);
                                return Step::Forward(e);
                            }
                        }
                    }
                    world.record(key);
                    Step::Ready(total)
                }
            };
        }
        if let Some(name) = key.strip_prefix("parity/") {
            return match ctx.request(&format!("leaf/{}", name)) {
                None => Step::NotReady,
                Some(Err(e)) => Step::Forward(e),
                Some(Ok(v)) => {
                    world.record(key);
                    Step::Ready(v & 1)
                }
            };
        }
        if let Some(name) = key.strip_prefix("pick/") {
            let cond = match ctx.request(&format!("leaf/{}.cond", name)) {
                None => return Step::NotReady,
                Some(Err(e)) => return Step::Forward(e),
                Some(Ok(v)) => v,
            };
            let chosen =
                if cond == 0 { format!("leaf/{}.left", name) } else { format!("leaf/{}.right", name) };
            return match ctx.request(&chosen) {
                None => Step::NotReady,
                Some(Err(e)) => Step::Forward(e),
                Some(Ok(v)) => {
                    world.record(key);
                    Step::Ready(v)
                }
            };
        }
        if key.starts_with("volatile/") {
            world.record(key);
            let mut counter = world.counter.lock().unwrap();
            *counter += 1;
            return Step::Ready(*counter);
        }
        Step::Err(format!("unknown key {}", key))
    }

    fn cache_value(&self, key: &String, _value: &i64) -> bool {
        !key.starts_with("volatile/")
    }

    fn cache_error(&self, error: &String) -> bool {
        !error.contains("transient")
    }
}

fn engine() -> (Engine<String, i64, String>, Arc<World>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let world = Arc::new(World::default());
    let engine = Engine::new(TestHandler { world: Arc::clone(&world), delay: None });
    (engine, world)
}

fn eval(engine: &Engine<String, i64, String>, root: &str) -> Result<i64, String> {
    let result = engine.evaluate(&[root.to_owned()], EvalOptions::default());
    result.roots.into_iter().next().unwrap().1.map_err(|e| e.to_string())
}

#[test]
fn computes_and_memoizes() {
    let (engine, world) = engine();
    world.set_leaf("a", 2);
    world.set_leaf("b", 3);
    world.define("root", &["leaf/a", "leaf/b"]);
    assert_eq!(eval(&engine, "sum/root"), Ok(5));

    // No invalidation: nothing runs the second time.
    world.take_runs();
    let second = engine.evaluate(&["sum/root".to_owned()], EvalOptions::default());
    assert_eq!(second.roots[0].1.as_ref().ok(), Some(&5));
    assert_eq!(second.stats.functions_run, 0);
    assert!(second.stats.reused >= 1);
    assert!(world.take_runs().is_empty());
}

#[test]
fn changed_leaf_reruns_exactly_its_chain() {
    let (engine, world) = engine();
    world.set_leaf("a", 1);
    world.set_leaf("b", 10);
    world.define("left", &["leaf/a"]);
    world.define("right", &["leaf/b"]);
    world.define("root", &["sum/left", "sum/right"]);
    assert_eq!(eval(&engine, "sum/root"), Ok(11));
    world.take_runs();

    world.set_leaf("a", 2);
    engine.invalidate(["leaf/a".to_owned()]);
    assert_eq!(eval(&engine, "sum/root"), Ok(12));

    let mut runs = world.take_runs();
    runs.sort();
    // The untouched branch is verified clean without running.
    assert_eq!(runs, vec!["leaf/a", "sum/left", "sum/root"]);
}

#[test]
fn unchanged_leaf_recleans_without_running_rdeps() {
    let (engine, world) = engine();
    world.set_leaf("a", 1);
    world.define("root", &["leaf/a"]);
    assert_eq!(eval(&engine, "sum/root"), Ok(1));
    world.take_runs();

    // Invalidate without changing the value: the leaf re-stats, the value is
    // equal, and everything above is cleaned instead of rerun.
    engine.invalidate(["leaf/a".to_owned()]);
    let result = engine.evaluate(&["sum/root".to_owned()], EvalOptions::default());
    assert_eq!(result.roots[0].1.as_ref().ok(), Some(&1));
    assert_eq!(result.stats.functions_run, 1);
    assert_eq!(result.stats.values_changed, 0);
    assert!(result.stats.cleaned >= 1);
    assert_eq!(world.take_runs(), vec!["leaf/a"]);
}

#[test]
fn early_cutoff_stops_mid_chain() {
    let (engine, world) = engine();
    world.set_leaf("x", 4);
    world.define("top", &["parity/x"]);
    assert_eq!(eval(&engine, "sum/top"), Ok(0));
    world.take_runs();

    // The leaf changes 4 -> 6; parity recomputes to the same value, so top
    // is verified clean without running.
    world.set_leaf("x", 6);
    engine.invalidate(["leaf/x".to_owned()]);
    let result = engine.evaluate(&["sum/top".to_owned()], EvalOptions::default());
    assert_eq!(result.roots[0].1.as_ref().ok(), Some(&0));
    let mut runs = world.take_runs();
    runs.sort();
    assert_eq!(runs, vec!["leaf/x", "parity/x"]);
    assert!(result.stats.cleaned >= 1);

    let (parity_changed, parity_evaluated) = engine.stamps(&"parity/x".to_owned()).unwrap();
    assert!(parity_changed < parity_evaluated);
}

#[test]
fn dep_set_capture_drops_stale_edges() {
    let (engine, world) = engine();
    world.set_leaf("p.cond", 0);
    world.set_leaf("p.left", 7);
    world.set_leaf("p.right", 9);
    assert_eq!(eval(&engine, "pick/p"), Ok(7));
    let deps = engine.deps_of(&"pick/p".to_owned()).unwrap();
    assert!(deps.contains(&"leaf/p.cond".to_owned()));
    assert!(deps.contains(&"leaf/p.left".to_owned()));
    assert!(!deps.contains(&"leaf/p.right".to_owned()));

    // Flip the condition: the dep set is re-captured.
    world.set_leaf("p.cond", 1);
    engine.invalidate(["leaf/p.cond".to_owned()]);
    assert_eq!(eval(&engine, "pick/p"), Ok(9));
    let deps = engine.deps_of(&"pick/p".to_owned()).unwrap();
    assert!(!deps.contains(&"leaf/p.left".to_owned()));
    assert!(deps.contains(&"leaf/p.right".to_owned()));

    // The dropped branch no longer triggers work.
    world.take_runs();
    world.set_leaf("p.left", 100);
    engine.invalidate(["leaf/p.left".to_owned()]);
    let result = engine.evaluate(&["pick/p".to_owned()], EvalOptions::default());
    assert_eq!(result.stats.functions_run, 0);
    assert!(world.take_runs().is_empty());
}

#[test]
fn cycle_reported_with_path_and_sticky() {
    let (engine, world) = engine();
    world.define("a", &["sum/b"]);
    world.define("b", &["sum/a"]);
    let result = engine.evaluate(&["sum/a".to_owned()], EvalOptions::default());
    let err = result.roots[0].1.as_ref().unwrap_err();
    let cycle_path = match &err.kind {
        FailureKind::Cycle(path) => path.clone(),
        other => panic!("expected cycle, got {:?}", other),
    };
    assert!(cycle_path.contains(&"sum/a".to_owned()));
    assert!(cycle_path.contains(&"sum/b".to_owned()));
    assert_eq!(cycle_path.first(), cycle_path.last());

    // Sticky: the second build reports the same error without new work.
    let again = engine.evaluate(&["sum/a".to_owned()], EvalOptions::default());
    assert!(again.roots[0].1.is_err());
    assert_eq!(again.stats.functions_run, 0);
}

#[test]
fn self_dependency_is_a_cycle() {
    let (engine, world) = engine();
    world.define("narcissus", &["sum/narcissus"]);
    let result = engine.evaluate(&["sum/narcissus".to_owned()], EvalOptions::default());
    assert!(result.roots[0].1.as_ref().unwrap_err().is_cycle());
}

#[test]
fn error_chain_names_origin_and_requesters() {
    let (engine, world) = engine();
    world.set_leaf("bad", POISON);
    world.define("mid", &["leaf/bad"]);
    world.define("top", &["sum/mid"]);
    let result = engine.evaluate(&["sum/top".to_owned()], EvalOptions::default());
    let err = result.roots[0].1.as_ref().unwrap_err();
    assert_eq!(err.origin, "leaf/bad");
    assert_eq!(err.chain, vec!["sum/mid".to_owned(), "sum/top".to_owned()]);
    assert!(err.function_error().unwrap().contains("poisoned"));
}

#[test]
fn keep_going_evaluates_siblings() {
    let (engine, world) = engine();
    world.set_leaf("bad", POISON);
    world.set_leaf("good", 1);
    world.define("broken", &["leaf/bad"]);
    world.define("fine", &["leaf/good"]);
    let keep = engine.evaluate(
        &["sum/broken".to_owned(), "sum/fine".to_owned()],
        EvalOptions { keep_going: true, ..Default::default() },
    );
    assert!(keep.roots[0].1.is_err());
    assert_eq!(keep.roots[1].1.as_ref().ok(), Some(&1));
    assert!(!keep.aborted);
}

#[test]
fn fail_fast_aborts() {
    let (engine, world) = engine();
    world.set_leaf("bad", POISON);
    world.set_leaf("good", 1);
    world.define("broken", &["leaf/bad"]);
    world.define("fine", &["leaf/good"]);
    let fast =
        engine.evaluate(&["sum/broken".to_owned(), "sum/fine".to_owned()], EvalOptions::default());
    assert!(fast.aborted);
    assert!(fast.roots[0].1.is_err());
}

#[test]
fn uncached_values_rerun_every_build() {
    let (engine, _world) = engine();
    let first = eval(&engine, "volatile/v").unwrap();
    let second = eval(&engine, "volatile/v").unwrap();
    assert_eq!(second, first + 1);
}

#[test]
fn uncached_errors_rerun_every_build() {
    let (engine, _world) = engine();
    // "transient" errors are refused by cache_error.
    let result = engine.evaluate(&["leaf/transient-missing".to_owned()], EvalOptions::default());
    assert!(result.roots[0].1.is_err());
    let again = engine.evaluate(&["leaf/transient-missing".to_owned()], EvalOptions::default());
    assert!(again.roots[0].1.is_err());
    // The leaf reran: its error was not cached.
    assert_eq!(again.stats.functions_run, 1);
}

#[test]
fn cached_input_errors_are_reused() {
    let (engine, world) = engine();
    world.set_leaf("bad", POISON);
    let result = engine.evaluate(&["leaf/bad".to_owned()], EvalOptions::default());
    assert!(result.roots[0].1.is_err());
    let again = engine.evaluate(&["leaf/bad".to_owned()], EvalOptions::default());
    assert!(again.roots[0].1.is_err());
    assert_eq!(again.stats.functions_run, 0);
}

#[test]
fn discarded_values_recompute_on_demand() {
    let (engine, world) = engine();
    world.set_leaf("a", 2);
    world.define("root", &["leaf/a"]);
    assert_eq!(eval(&engine, "sum/root"), Ok(2));
    engine.discard_values(|k| k.starts_with("sum/"));
    let result = engine.evaluate(&["sum/root".to_owned()], EvalOptions::default());
    assert_eq!(result.roots[0].1.as_ref().ok(), Some(&2));
    // The discarded node reran; the retained leaf did not.
    assert_eq!(result.stats.functions_run, 1);
}

#[test]
fn deep_discard_forgets_everything() {
    let (engine, world) = engine();
    world.set_leaf("a", 2);
    world.define("root", &["leaf/a"]);
    assert_eq!(eval(&engine, "sum/root"), Ok(2));
    engine.discard_all_values(false);
    assert_eq!(engine.node_count(), 0);
    let result = engine.evaluate(&["sum/root".to_owned()], EvalOptions::default());
    assert_eq!(result.roots[0].1.as_ref().ok(), Some(&2));
    assert_eq!(result.stats.functions_run, 2);
}

#[test]
fn same_version_same_value_for_duplicate_roots() {
    let (engine, world) = engine();
    world.set_leaf("a", 3);
    world.define("root", &["leaf/a"]);
    let result =
        engine.evaluate(&["sum/root".to_owned(), "sum/root".to_owned()], EvalOptions::default());
    assert_eq!(result.roots[0].1.as_ref().ok(), result.roots[1].1.as_ref().ok());
}

#[test]
fn independent_keys_evaluate_in_parallel() {
    let world = Arc::new(World::default());
    for i in 0..8 {
        world.set_leaf(&format!("slow{}", i), i);
    }
    let engine = Engine::new(TestHandler {
        world: Arc::clone(&world),
        delay: Some(Duration::from_millis(100)),
    });
    let roots: Vec<String> = (0..8).map(|i| format!("leaf/slow{}", i)).collect();
    let start = Instant::now();
    let result = engine.evaluate(&roots, EvalOptions { jobs: 8, ..Default::default() });
    let elapsed = start.elapsed();
    assert!(result.roots.iter().all(|(_, r)| r.is_ok()));
    // Serial would take >= 800ms.
    assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
}

#[test]
fn version_stamps_stay_consistent() {
    let (engine, world) = engine();
    world.set_leaf("a", 1);
    world.set_leaf("b", 2);
    world.define("l", &["leaf/a"]);
    world.define("r", &["leaf/b"]);
    world.define("root", &["sum/l", "sum/r"]);
    let _ = eval(&engine, "sum/root");
    world.set_leaf("a", 5);
    engine.invalidate(["leaf/a".to_owned()]);
    let _ = eval(&engine, "sum/root");

    for key in ["leaf/a", "leaf/b", "sum/l", "sum/r", "sum/root"].iter() {
        let (changed, evaluated) = engine.stamps(&(*key).to_string()).unwrap();
        assert!(changed <= evaluated, "{}: {} > {}", key, changed, evaluated);
        // Every dep was confirmed no newer than its consumer.
        for dep in engine.deps_of(&(*key).to_string()).unwrap_or_default() {
            let (dep_changed, _) = engine.stamps(&dep).unwrap();
            assert!(dep_changed <= evaluated, "{} dep {} too new", key, dep);
        }
    }
}
