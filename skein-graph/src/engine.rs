//! The evaluation engine.
//!
//! `Engine` memoizes keyed computations and re-evaluates them incrementally.
//! Handlers are restart-based: a handler that finds a dep missing requests it
//! and returns `Step::NotReady`; once the deps land the handler runs again
//! from the top. Suspended nodes never pin a worker thread.
//!
//! Scheduling is a bounded worker pool draining a channel of node indices.
//! All graph state lives in one arena behind a single lock; handlers run
//! outside the lock.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, trace};
use parking_lot::Mutex;

use crate::error::{FailureKind, NodeError, NodeFailure};
use crate::node::{Arena, DirtyState, NodeIx, Phase, Version, WorkState};

/// Bounds every key type the engine can evaluate.
pub trait GraphKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> GraphKey for T {}

/// Bounds every value type. Structural equality drives change pruning.
pub trait GraphValue: Clone + PartialEq + Send + Sync + 'static {}
impl<T: Clone + PartialEq + Send + Sync + 'static> GraphValue for T {}

/// Bounds every function-error type.
pub trait GraphError: Clone + PartialEq + Send + Sync + 'static {}
impl<T: Clone + PartialEq + Send + Sync + 'static> GraphError for T {}

/// Outcome of one handler invocation.
pub enum Step<K, V, E> {
    /// The function produced its value.
    Ready(V),
    /// At least one requested dep was missing; run again once deps land.
    NotReady,
    /// The function failed; this node is the failure's origin.
    Err(E),
    /// Propagate a dep's failure as this node's result. The engine extends
    /// the requesting chain with this node's key.
    Forward(NodeError<K, E>),
}

/// One keyed function table. The single implementation dispatches on the
/// key's function name (its enum variant).
pub trait Handler<K, V, E>: Send + Sync + 'static {
    fn evaluate(&self, key: &K, ctx: &mut Context<'_, K, V, E>) -> Step<K, V, E>;

    /// Whether `value` may be reused by later evaluations. Values refused
    /// here are recomputed on every build that requests them.
    fn cache_value(&self, _key: &K, _value: &V) -> bool {
        true
    }

    /// Whether `error` may be reused by later evaluations. Input errors are
    /// cached; execution failures are not.
    fn cache_error(&self, _error: &E) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    /// Worker threads; 0 means one per available CPU.
    pub jobs: usize,
    /// Continue evaluating sibling branches after a failure.
    pub keep_going: bool,
}

impl Default for EvalOptions {
    fn default() -> EvalOptions {
        EvalOptions { jobs: 0, keep_going: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    /// Handler invocations that produced a final result.
    pub functions_run: usize,
    /// Results that differed from the node's prior result.
    pub values_changed: usize,
    /// Maybe-dirty nodes verified clean without running their function.
    pub cleaned: usize,
    /// Nodes reused without even a dep check.
    pub reused: usize,
    /// Handler invocations that returned `NotReady`.
    pub restarts: usize,
}

pub struct EvalResult<K, V, E> {
    /// One entry per requested root, in request order.
    pub roots: Vec<(K, Result<V, NodeError<K, E>>)>,
    pub stats: EvalStats,
    /// True when the evaluation stopped early (first error in fail-fast
    /// mode, or external cancellation).
    pub aborted: bool,
}

impl<K, V, E> EvalResult<K, V, E> {
    /// The first root failure, if any.
    pub fn first_error(&self) -> Option<&NodeError<K, E>> {
        self.roots.iter().filter_map(|(_, r)| r.as_ref().err()).next()
    }
}

enum Job {
    Work(NodeIx),
    Shutdown,
}

struct State<K, V, E> {
    arena: Arena<K, V, E>,
    version: Version,
    epoch: u64,
    // Per-evaluation bookkeeping.
    roots_pending: usize,
    active: usize,
    abort: bool,
    keep_going: bool,
    jobs: usize,
    tx: Option<Sender<Job>>,
    stats: EvalStats,
}

struct Shared<K, V, E> {
    handler: Box<dyn Handler<K, V, E>>,
    state: Mutex<State<K, V, E>>,
    cancel: AtomicBool,
}

/// The incremental evaluator.
pub struct Engine<K, V, E> {
    shared: Arc<Shared<K, V, E>>,
}

impl<K: GraphKey, V: GraphValue, E: GraphError> Engine<K, V, E> {
    pub fn new(handler: impl Handler<K, V, E>) -> Engine<K, V, E> {
        Engine {
            shared: Arc::new(Shared {
                handler: Box::new(handler),
                state: Mutex::new(State {
                    arena: Arena::new(),
                    version: 0,
                    epoch: 0,
                    roots_pending: 0,
                    active: 0,
                    abort: false,
                    keep_going: false,
                    jobs: 1,
                    tx: None,
                    stats: EvalStats::default(),
                }),
                cancel: AtomicBool::new(false),
            }),
        }
    }

    pub fn version(&self) -> Version {
        self.shared.state.lock().version
    }

    pub fn node_count(&self) -> usize {
        self.shared.state.lock().arena.len()
    }

    /// Marks keys dirty; their transitive rdeps become maybe-dirty.
    pub fn invalidate<I: IntoIterator<Item = K>>(&self, keys: I) {
        let mut state = self.shared.state.lock();
        for key in keys {
            let ix = state.arena.intern(&key);
            state.arena.mark_dirty(ix);
        }
    }

    /// Marks every existing node whose key matches `pred` dirty.
    pub fn invalidate_matching(&self, pred: impl Fn(&K) -> bool) {
        let mut state = self.shared.state.lock();
        let matching: Vec<NodeIx> = state
            .arena
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| pred(&n.key))
            .map(|(ix, _)| ix)
            .collect();
        for ix in matching {
            state.arena.mark_dirty(ix);
        }
    }

    /// Drops stored values for keys matching `pred`. Edges and stamps are
    /// kept; a discarded node recomputes on next request, and the recompute
    /// counts as a change (there is no prior value left to compare against).
    pub fn discard_values(&self, pred: impl Fn(&K) -> bool) {
        let mut state = self.shared.state.lock();
        let mut dropped = 0usize;
        for node in state.arena.nodes.iter_mut() {
            if node.result.is_some() && pred(&node.key) {
                node.result = None;
                dropped += 1;
            }
        }
        debug!("discarded {} node values", dropped);
    }

    /// Drops every stored value. With `retain_edges`, the dep/rdep skeleton
    /// survives for diagnostics; otherwise the whole graph is forgotten.
    pub fn discard_all_values(&self, retain_edges: bool) {
        let mut state = self.shared.state.lock();
        if retain_edges {
            for node in state.arena.nodes.iter_mut() {
                node.result = None;
            }
        } else {
            state.arena = Arena::new();
        }
    }

    /// Current value of a key, regardless of version. Introspection only.
    pub fn value_of(&self, key: &K) -> Option<V> {
        let state = self.shared.state.lock();
        let ix = state.arena.lookup(key)?;
        match &state.arena.nodes[ix].result {
            Some(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// `(changed_at, evaluated_at)` stamps of a key. Introspection only.
    pub fn stamps(&self, key: &K) -> Option<(Version, Version)> {
        let state = self.shared.state.lock();
        let ix = state.arena.lookup(key)?;
        let node = &state.arena.nodes[ix];
        Some((node.changed_at, node.evaluated_at))
    }

    /// Keys the node depended on in its most recent completed evaluation.
    pub fn deps_of(&self, key: &K) -> Option<Vec<K>> {
        let state = self.shared.state.lock();
        let ix = state.arena.lookup(key)?;
        Some(
            state.arena.nodes[ix]
                .deps
                .iter()
                .map(|&d| state.arena.nodes[d].key.clone())
                .collect(),
        )
    }

    pub fn cancel_handle(&self) -> CancelHandleRef<K, V, E> {
        CancelHandleRef { shared: Arc::clone(&self.shared) }
    }

    /// Evaluates `roots` at a new graph version and returns their results.
    pub fn evaluate(&self, roots: &[K], options: EvalOptions) -> EvalResult<K, V, E> {
        let jobs = if options.jobs == 0 { num_cpus::get() } else { options.jobs };
        self.shared.cancel.store(false, Ordering::SeqCst);

        let rx = {
            let mut state = self.shared.state.lock();
            let state = &mut *state;
            state.version += 1;
            state.epoch += 1;
            state.roots_pending = 0;
            state.active = 0;
            state.abort = false;
            state.keep_going = options.keep_going;
            state.jobs = jobs;
            state.stats = EvalStats::default();
            let (tx, rx) = unbounded();
            state.tx = Some(tx);

            trace!("evaluate: version {} roots {:?}", state.version, roots);

            // Count unique roots first so completions during scheduling can
            // never drive roots_pending to zero prematurely.
            let epoch = state.epoch;
            let mut root_ixs = Vec::with_capacity(roots.len());
            for key in roots {
                let ix = state.arena.intern(key);
                state.arena.nodes[ix].sync_epoch(epoch);
                if !state.arena.nodes[ix].is_root {
                    state.arena.nodes[ix].is_root = true;
                    state.roots_pending += 1;
                    root_ixs.push(ix);
                }
            }
            for ix in root_ixs {
                ensure_scheduled(&self.shared, state, ix);
            }
            rx
        };

        let need_workers = {
            let state = self.shared.state.lock();
            state.roots_pending > 0
        };

        if need_workers {
            let mut handles = Vec::with_capacity(jobs);
            for i in 0..jobs {
                let shared = Arc::clone(&self.shared);
                let rx: Receiver<Job> = rx.clone();
                let handle = thread::Builder::new()
                    .name(format!("skein-eval-{}", i))
                    .spawn(move || worker_loop(&shared, &rx))
                    .expect("failed to spawn evaluator worker");
                handles.push(handle);
            }
            for handle in handles {
                if handle.join().is_err() {
                    error!("evaluator worker panicked");
                }
            }
        }

        let mut state = self.shared.state.lock();
        let state = &mut *state;
        state.tx = None;
        let version = state.version;
        let mut out = Vec::with_capacity(roots.len());
        for key in roots {
            let ix = state.arena.intern(key);
            let result = match &state.arena.nodes[ix].result {
                Some(r) if state.arena.nodes[ix].evaluated_at == version => r.clone(),
                _ => Err(NodeFailure::new(key.clone(), FailureKind::Internal("root never completed"))),
            };
            out.push((key.clone(), result));
        }
        let aborted = state.abort || self.shared.cancel.load(Ordering::SeqCst);
        EvalResult { roots: out, stats: state.stats, aborted }
    }
}

/// Cancellation handle bound to a concrete engine.
pub struct CancelHandleRef<K, V, E> {
    shared: Arc<Shared<K, V, E>>,
}

impl<K, V, E> Clone for CancelHandleRef<K, V, E> {
    fn clone(&self) -> Self {
        CancelHandleRef { shared: Arc::clone(&self.shared) }
    }
}

impl<K, V, E> CancelHandleRef<K, V, E> {
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }
}

/// The environment handle passed to handlers.
pub struct Context<'a, K, V, E> {
    shared: &'a Shared<K, V, E>,
    ix: NodeIx,
    key: K,
    recorded: Vec<NodeIx>,
    seen: HashSet<NodeIx>,
    cycle: Option<Vec<K>>,
}

impl<'a, K: GraphKey, V: GraphValue, E: GraphError> Context<'a, K, V, E> {
    /// Requests a dep. Returns its result if it is already computed at the
    /// current version, scheduling it and returning `None` otherwise. After
    /// any `None` the handler must return `Step::NotReady`.
    pub fn request(&mut self, key: &K) -> Option<Result<V, NodeError<K, E>>> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let dep = state.arena.intern(key);
        if dep == self.ix {
            self.cycle = Some(vec![self.key.clone(), self.key.clone()]);
            return None;
        }
        let epoch = state.epoch;
        state.arena.nodes[dep].sync_epoch(epoch);
        if self.seen.insert(dep) {
            self.recorded.push(dep);
        }
        if ensure_scheduled(self.shared, state, dep) {
            return Some(
                state.arena.nodes[dep].result.clone().expect("scheduled node done without result"),
            );
        }
        // The dep is in flight. Adding a wait edge that reaches back to us
        // would deadlock; report the cycle instead.
        if self.cycle.is_none() {
            if let Some(path) = find_cycle(state, dep, self.ix) {
                debug!("cycle detected at {:?}: {:?}", self.key, path);
                self.cycle = Some(path);
                return None;
            }
        }
        if !state.arena.nodes[self.ix].waits_on.contains(&dep) {
            state.arena.nodes[self.ix].waits_on.push(dep);
        }
        None
    }

    /// Requests every key, returning all results only when all are ready.
    /// Requesting everything before giving up maximizes parallel fan-out.
    pub fn request_and_wait(&mut self, keys: &[K]) -> Option<Vec<Result<V, NodeError<K, E>>>> {
        let mut out = Vec::with_capacity(keys.len());
        let mut all_ready = true;
        for key in keys {
            match self.request(key) {
                Some(result) => out.push(result),
                None => all_ready = false,
            }
        }
        if all_ready {
            Some(out)
        } else {
            None
        }
    }

    /// True once the evaluation is being torn down. Long-running handlers
    /// should poll this and bail out.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst) || self.shared.state.lock().abort
    }

    pub fn key(&self) -> &K {
        &self.key
    }
}

fn worker_loop<K: GraphKey, V: GraphValue, E: GraphError>(
    shared: &Shared<K, V, E>,
    rx: &Receiver<Job>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Shutdown => break,
            Job::Work(ix) => process(shared, ix),
        }
    }
}

/// Schedules a node if it needs work. Returns true when the node is already
/// done at the current version (including via the clean-reuse fast path).
fn ensure_scheduled<K: GraphKey, V: GraphValue, E: GraphError>(
    shared: &Shared<K, V, E>,
    state: &mut State<K, V, E>,
    ix: NodeIx,
) -> bool {
    let epoch = state.epoch;
    let version = state.version;
    state.arena.nodes[ix].sync_epoch(epoch);
    match state.arena.nodes[ix].work {
        WorkState::Done => true,
        WorkState::Queued | WorkState::Running | WorkState::Suspended => false,
        WorkState::Idle => {
            let node = &mut state.arena.nodes[ix];
            if node.done_at(version) {
                node.work = WorkState::Done;
                return true;
            }
            if node.result.is_some() && !node.volatile && node.dirty == DirtyState::Clean {
                // Untouched by any invalidation: reusable as-is.
                node.evaluated_at = version;
                node.work = WorkState::Done;
                state.stats.reused += 1;
                finish(shared, state, ix);
                return true;
            }
            state.arena.nodes[ix].work = WorkState::Queued;
            state.active += 1;
            state
                .tx
                .as_ref()
                .expect("no work queue outside evaluation")
                .send(Job::Work(ix))
                .expect("work queue closed");
            false
        }
    }
}

/// Wakes waiters and settles root bookkeeping after `ix` completed.
fn finish<K: GraphKey, V: GraphValue, E: GraphError>(
    shared: &Shared<K, V, E>,
    state: &mut State<K, V, E>,
    ix: NodeIx,
) {
    let _ = shared;
    state.arena.nodes[ix].waits_on.clear();
    let waiters = mem::take(&mut state.arena.nodes[ix].waiters);
    for w in waiters {
        let node = &mut state.arena.nodes[w];
        if node.work != WorkState::Suspended {
            continue;
        }
        node.pending = node.pending.saturating_sub(1);
        if node.pending == 0 {
            node.work = WorkState::Queued;
            state.active += 1;
            state
                .tx
                .as_ref()
                .expect("no work queue outside evaluation")
                .send(Job::Work(w))
                .expect("work queue closed");
        }
    }
    if state.arena.nodes[ix].is_root {
        state.roots_pending -= 1;
        if state.roots_pending == 0 {
            if let Some(tx) = state.tx.as_ref() {
                for _ in 0..state.jobs {
                    let _ = tx.send(Job::Shutdown);
                }
            }
        }
    }
}

/// Releases one unit of queue work and recovers from a wedged scheduler.
fn release_active<K: GraphKey, V: GraphValue, E: GraphError>(
    shared: &Shared<K, V, E>,
    state: &mut State<K, V, E>,
) {
    state.active -= 1;
    if state.active == 0 && state.roots_pending > 0 {
        // Nothing queued, nothing running, roots unfinished: every remaining
        // node is suspended with no wakeup coming. This is an engine bug;
        // fail the remaining roots rather than hang the build.
        error!("evaluator wedged with {} roots pending", state.roots_pending);
        let stuck: Vec<NodeIx> = state
            .arena
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.epoch == state.epoch && n.is_root && n.work != WorkState::Done)
            .map(|(ix, _)| ix)
            .collect();
        for ix in stuck {
            let key = state.arena.nodes[ix].key.clone();
            store_error(shared, state, ix, NodeFailure::new(key, FailureKind::Internal("scheduler wedged")), true, Vec::new());
        }
    }
}

/// Looks for a waits-on path `start -> ... -> target` among in-flight nodes.
/// Returns the cycle as keys, `target` first and last.
fn find_cycle<K: GraphKey, V: GraphValue, E: GraphError>(
    state: &State<K, V, E>,
    start: NodeIx,
    target: NodeIx,
) -> Option<Vec<K>> {
    let version = state.version;
    let mut parents: HashMap<NodeIx, NodeIx> = HashMap::new();
    let mut stack = vec![start];
    let mut found = false;
    while let Some(n) = stack.pop() {
        if n == target {
            found = true;
            break;
        }
        let node = &state.arena.nodes[n];
        if node.epoch != state.epoch || node.done_at(version) {
            continue;
        }
        for &m in &node.waits_on {
            if let std::collections::hash_map::Entry::Vacant(e) = parents.entry(m) {
                e.insert(n);
                stack.push(m);
            }
        }
    }
    if !found {
        return None;
    }
    // Reconstruct target <- ... <- start, then emit in request order.
    let mut rev = vec![target];
    let mut cur = target;
    while cur != start {
        cur = parents[&cur];
        rev.push(cur);
    }
    let mut path: Vec<K> = vec![state.arena.nodes[target].key.clone()];
    for ix in rev.into_iter().rev() {
        path.push(state.arena.nodes[ix].key.clone());
    }
    Some(path)
}

fn store_value<K: GraphKey, V: GraphValue, E: GraphError>(
    shared: &Shared<K, V, E>,
    state: &mut State<K, V, E>,
    ix: NodeIx,
    value: V,
    deps: Vec<NodeIx>,
) {
    let version = state.version;
    state.stats.functions_run += 1;
    let volatile = !shared.handler.cache_value(&state.arena.nodes[ix].key, &value);
    let changed = match &state.arena.nodes[ix].result {
        Some(Ok(prev)) => *prev != value,
        _ => true,
    };
    state.arena.set_deps(ix, deps);
    let node = &mut state.arena.nodes[ix];
    node.result = Some(Ok(value));
    node.volatile = volatile;
    if changed {
        node.changed_at = version;
        state.stats.values_changed += 1;
    }
    node.evaluated_at = version;
    node.dirty = DirtyState::Clean;
    node.work = WorkState::Done;
    finish(shared, state, ix);
}

fn store_error<K: GraphKey, V: GraphValue, E: GraphError>(
    shared: &Shared<K, V, E>,
    state: &mut State<K, V, E>,
    ix: NodeIx,
    err: NodeError<K, E>,
    volatile: bool,
    deps: Vec<NodeIx>,
) {
    let version = state.version;
    let changed = match &state.arena.nodes[ix].result {
        Some(Err(prev)) => **prev != *err,
        _ => true,
    };
    if !state.keep_going && !err.is_cancelled() {
        state.abort = true;
    }
    state.arena.set_deps(ix, deps);
    let node = &mut state.arena.nodes[ix];
    node.result = Some(Err(err));
    node.volatile = volatile;
    if changed {
        node.changed_at = version;
    }
    node.evaluated_at = version;
    node.dirty = DirtyState::Clean;
    node.work = WorkState::Done;
    finish(shared, state, ix);
}

fn error_volatility<K, V: GraphValue, E: GraphError>(
    shared: &Shared<K, V, E>,
    kind: &FailureKind<K, E>,
) -> bool
where
    K: GraphKey,
{
    match kind {
        FailureKind::Function(e) => !shared.handler.cache_error(e),
        FailureKind::Cycle(_) => false,
        FailureKind::Cancelled => true,
        FailureKind::Internal(_) => true,
    }
}

fn process<K: GraphKey, V: GraphValue, E: GraphError>(shared: &Shared<K, V, E>, ix: NodeIx) {
    // Claim and decide under the lock.
    let run_key = {
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        let version = state.version;

        if state.arena.nodes[ix].work != WorkState::Queued {
            // Stale queue entry.
            release_active(shared, state);
            return;
        }

        if state.abort || shared.cancel.load(Ordering::SeqCst) {
            let node = &state.arena.nodes[ix];
            if !node.done_at(version) {
                let key = node.key.clone();
                let prior_deps = node.deps.clone();
                // Prefer forwarding a failed dep over a bare cancellation, so
                // the originating error still reaches the roots.
                let dep_err = node
                    .waits_on
                    .iter()
                    .chain(node.deps.iter())
                    .filter_map(|&d| {
                        let dep = &state.arena.nodes[d];
                        if dep.done_at(version) {
                            match &dep.result {
                                Some(Err(e)) => Some(e.clone()),
                                _ => None,
                            }
                        } else {
                            None
                        }
                    })
                    .next();
                match dep_err {
                    Some(err) => {
                        let volatile = error_volatility(shared, &err.kind);
                        let forwarded = err.forwarded(key);
                        store_error(shared, state, ix, forwarded, volatile, prior_deps);
                    }
                    None => {
                        store_error(
                            shared,
                            state,
                            ix,
                            NodeFailure::new(key, FailureKind::Cancelled),
                            true,
                            prior_deps,
                        );
                    }
                }
            } else {
                state.arena.nodes[ix].work = WorkState::Done;
                finish(shared, state, ix);
            }
            release_active(shared, state);
            return;
        }

        if state.arena.nodes[ix].phase == Phase::Decide {
            let node = &mut state.arena.nodes[ix];
            if node.done_at(version) {
                node.work = WorkState::Done;
                finish(shared, state, ix);
                release_active(shared, state);
                return;
            }
            if node.result.is_some() && !node.volatile {
                match node.dirty {
                    DirtyState::Clean => {
                        node.evaluated_at = version;
                        node.work = WorkState::Done;
                        state.stats.reused += 1;
                        finish(shared, state, ix);
                        release_active(shared, state);
                        return;
                    }
                    DirtyState::MaybeDirty => node.phase = Phase::CheckDeps,
                    DirtyState::Dirty => node.phase = Phase::Run,
                }
            } else {
                node.phase = Phase::Run;
            }
        }

        if state.arena.nodes[ix].phase == Phase::CheckDeps {
            let deps = state.arena.nodes[ix].deps.clone();
            let mut pending = 0;
            for &dep in &deps {
                if !ensure_scheduled(shared, state, dep) {
                    state.arena.nodes[dep].waiters.push(ix);
                    if !state.arena.nodes[ix].waits_on.contains(&dep) {
                        state.arena.nodes[ix].waits_on.push(dep);
                    }
                    pending += 1;
                }
            }
            if pending > 0 {
                let node = &mut state.arena.nodes[ix];
                node.work = WorkState::Suspended;
                node.pending = pending;
                release_active(shared, state);
                return;
            }
            let evaluated_at = state.arena.nodes[ix].evaluated_at;
            let clean =
                deps.iter().all(|&dep| state.arena.nodes[dep].changed_at <= evaluated_at);
            if clean {
                let node = &mut state.arena.nodes[ix];
                node.evaluated_at = version;
                node.dirty = DirtyState::Clean;
                node.work = WorkState::Done;
                state.stats.cleaned += 1;
                trace!("cleaned without rerun: {:?}", node.key);
                finish(shared, state, ix);
                release_active(shared, state);
                return;
            }
            state.arena.nodes[ix].phase = Phase::Run;
        }

        let node = &mut state.arena.nodes[ix];
        node.work = WorkState::Running;
        node.waits_on.clear();
        node.key.clone()
    };

    // Run the handler outside the lock.
    let mut ctx = Context {
        shared,
        ix,
        key: run_key.clone(),
        recorded: Vec::new(),
        seen: HashSet::new(),
        cycle: None,
    };
    let step = shared.handler.evaluate(&run_key, &mut ctx);
    let Context { recorded, cycle, .. } = ctx;

    let mut guard = shared.state.lock();
    let state = &mut *guard;
    let version = state.version;

    if let Some(path) = cycle {
        let err = NodeFailure::new(run_key, FailureKind::Cycle(path));
        store_error(shared, state, ix, err, false, recorded);
        release_active(shared, state);
        return;
    }

    match step {
        Step::Ready(value) => {
            store_value(shared, state, ix, value, recorded);
        }
        Step::Err(e) => {
            state.stats.functions_run += 1;
            let volatile = !shared.handler.cache_error(&e);
            let err = NodeFailure::new(run_key, FailureKind::Function(e));
            store_error(shared, state, ix, err, volatile, recorded);
        }
        Step::Forward(dep_err) => {
            state.stats.functions_run += 1;
            let volatile = error_volatility(shared, &dep_err.kind);
            let err = dep_err.forwarded(run_key);
            store_error(shared, state, ix, err, volatile, recorded);
        }
        Step::NotReady => {
            state.stats.restarts += 1;
            let mut pending = 0;
            let mut waits = Vec::new();
            for &dep in &recorded {
                if !state.arena.nodes[dep].done_at(version) {
                    state.arena.nodes[dep].waiters.push(ix);
                    waits.push(dep);
                    pending += 1;
                }
            }
            let node = &mut state.arena.nodes[ix];
            node.waits_on = waits;
            if pending == 0 {
                // Every dep landed while we were running; go again now.
                node.work = WorkState::Queued;
                state.active += 1;
                state
                    .tx
                    .as_ref()
                    .expect("no work queue outside evaluation")
                    .send(Job::Work(ix))
                    .expect("work queue closed");
            } else {
                node.work = WorkState::Suspended;
                node.pending = pending;
            }
        }
    }
    release_active(shared, state);
}
