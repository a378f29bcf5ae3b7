//! Running builds: the build environment, the keyed-function handler, and
//! the session that drives loading, analysis and execution over the
//! evaluator.
//!
//! Every layer is a function on the evaluator; cross-layer dependencies are
//! declared by requesting keys, never by direct calls. The session's job is
//! only to pick roots, feed invalidations, and interpret results.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use log::{debug, info, trace, warn};

use skein_data::{Label, TargetPattern};
use skein_graph::{Engine, EvalOptions, Handler, NodeError, Step};
use skein_vfs::{Vfs, WorkspaceScanner};

pub mod actions;
pub mod artifact;
pub mod aspect;
pub mod cache;
pub mod configuration;
pub mod exec;
pub mod file;
pub mod glob;
pub mod keys;
pub mod nested;
pub mod package;
pub mod pattern;
pub mod query;
pub mod remote;
pub mod target;

pub use self::keys::{
    ActionExecKey, ActionOutputs, BuildError, BuildKey, BuildValue, ConfiguredTargetKey,
};

use self::actions::check_conflicts;
use self::artifact::Artifact;
use self::cache::DiskCache;
use self::configuration::{ConfigRef, Configuration};
use self::exec::{InFlightMap, LocalSpawnRunner, SpawnRunner};
use self::nested::NestedSetStore;
use self::remote::{with_retries, Clock, RemoteCache, SystemClock};
use self::target::ConfiguredTargetValue;
use crate::config::Config;
use crate::workspace::Workspace;

/// Bounded number of invalidate-and-retry rounds for expired remote entries.
const MAX_REWIND_ROUNDS: usize = 3;

/// Per-build execution counters.
#[derive(Default)]
pub struct BuildStats {
    executed: std::sync::atomic::AtomicUsize,
    cache_hits: std::sync::atomic::AtomicUsize,
    remote_hits: std::sync::atomic::AtomicUsize,
}

impl BuildStats {
    pub(crate) fn count_executed(&self) {
        self.executed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn count_cache_hit(&self) {
        self.cache_hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn count_remote_hit(&self) {
        self.remote_hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn executed(&self) -> usize {
        self.executed.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn remote_hits(&self) -> usize {
        self.remote_hits.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn reset(&self) {
        self.executed.store(0, std::sync::atomic::Ordering::SeqCst);
        self.cache_hits.store(0, std::sync::atomic::Ordering::SeqCst);
        self.remote_hits.store(0, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Everything a build function may touch, passed explicitly. No function
/// reaches for process-global state; tests swap any of these out.
pub struct BuildEnv {
    pub workspace: Workspace,
    pub config: Config,
    pub vfs: Arc<Vfs>,
    pub sets: Arc<NestedSetStore>,
    pub disk_cache: Arc<DiskCache>,
    pub remote: Option<RemoteCache>,
    pub runner: Arc<dyn SpawnRunner>,
    pub clock: Arc<dyn Clock>,
    /// Snapshot of the client env vars actions may declare.
    pub client_env: BTreeMap<String, String>,
    pub stats: BuildStats,
    pub(crate) in_flight: InFlightMap,
    rewinds: Mutex<HashSet<BuildKey>>,
    /// Actions whose cached remote entry proved unusable. They bypass the
    /// remote lookup until they have actually executed, or a rewind would
    /// re-publish the same dead entry forever.
    poisoned: Mutex<HashSet<BuildKey>>,
}

impl BuildEnv {
    /// Asks the session to invalidate `key` and re-evaluate after this
    /// round, used when a cached remote entry turned out to be gone.
    pub(crate) fn request_rewind(&self, key: BuildKey) {
        self.rewinds.lock().unwrap().insert(key);
    }

    fn take_rewinds(&self) -> Vec<BuildKey> {
        self.rewinds.lock().unwrap().drain().collect()
    }

    fn poison(&self, keys: &[BuildKey]) {
        self.poisoned.lock().unwrap().extend(keys.iter().cloned());
    }

    pub(crate) fn is_poisoned(&self, key: &BuildKey) -> bool {
        self.poisoned.lock().unwrap().contains(key)
    }

    pub(crate) fn unpoison(&self, key: &BuildKey) {
        self.poisoned.lock().unwrap().remove(key);
    }

    pub(crate) fn io_retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.io_retry_base_ms)
    }
}

/// The single keyed-function table: dispatches each key variant to its
/// function.
struct BuildHandler {
    env: Arc<BuildEnv>,
}

impl Handler<BuildKey, BuildValue, BuildError> for BuildHandler {
    fn evaluate(
        &self,
        key: &BuildKey,
        ctx: &mut skein_graph::Context<'_, BuildKey, BuildValue, BuildError>,
    ) -> Step<BuildKey, BuildValue, BuildError> {
        trace!("evaluating {:?}", key);
        match key {
            BuildKey::FileStat(path) => file::stat_file(&self.env, path),
            BuildKey::DirListing(path) => glob::list_directory(&self.env, path),
            BuildKey::FileDigest(path) => file::digest_file(&self.env, path, ctx),
            BuildKey::Glob(glob_key) => glob::evaluate_glob(&self.env, glob_key, ctx),
            BuildKey::Package(pkg) => package::load_package(&self.env, pkg, ctx),
            BuildKey::Extension(path) => package::load_extension(&self.env, path, ctx),
            BuildKey::Patterns(p) => pattern::expand_pattern(&self.env, p, ctx),
            BuildKey::ConfiguredTarget(k) => target::analyze_configured_target(&self.env, k, ctx),
            BuildKey::Aspect(k) => aspect::apply_aspect(&self.env, k, ctx),
            BuildKey::ActionExec(k) => exec::execute_action(&self.env, k, ctx),
        }
    }

    fn cache_value(&self, _key: &BuildKey, value: &BuildValue) -> bool {
        match value {
            // A package with errors re-runs every build while the errors
            // persist; only its partial target map is kept for diagnostics.
            BuildValue::Package(p) => !p.has_errors(),
            _ => true,
        }
    }

    fn cache_error(&self, error: &BuildError) -> bool {
        error.is_cacheable()
    }
}

/// The result of one `build` invocation.
#[derive(Debug)]
pub struct BuildOutcome {
    pub success: bool,
    /// Labels the requested patterns expanded to.
    pub targets: Vec<Label>,
    pub actions_executed: usize,
    pub cache_hits: usize,
    /// Absolute paths of the requested targets' default outputs.
    pub outputs: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Drives builds and queries over one evaluator instance. Keeping the
/// session alive between builds is what makes rebuilds incremental; the
/// on-disk action cache covers cold starts.
pub struct BuildSession {
    engine: Engine<BuildKey, BuildValue, BuildError>,
    env: Arc<BuildEnv>,
    scanner: Option<Arc<dyn WorkspaceScanner>>,
    built_once: bool,
}

impl BuildSession {
    pub fn new(workspace: Workspace, config: Config) -> Result<BuildSession> {
        BuildSession::with_parts(
            workspace,
            config,
            Arc::new(LocalSpawnRunner),
            Arc::new(SystemClock),
            None,
        )
    }

    /// Full dependency injection for tests and embedders.
    pub fn with_parts(
        workspace: Workspace,
        config: Config,
        runner: Arc<dyn SpawnRunner>,
        clock: Arc<dyn Clock>,
        remote: Option<RemoteCache>,
    ) -> Result<BuildSession> {
        let vfs = Arc::new(Vfs::new(config.hash_function));
        let disk_cache = Arc::new(
            DiskCache::open(config.disk_cache.clone(), config.hash_function)
                .context("opening the action cache")?,
        );
        let client_env: BTreeMap<String, String> = std::env::vars()
            .filter(|(name, _)| config.action_env.iter().any(|allowed| allowed == name))
            .collect();
        let env = Arc::new(BuildEnv {
            workspace,
            config,
            vfs,
            sets: Arc::new(NestedSetStore::new()),
            disk_cache,
            remote,
            runner,
            clock,
            client_env,
            stats: BuildStats::default(),
            in_flight: InFlightMap::default(),
            rewinds: Mutex::new(HashSet::new()),
            poisoned: Mutex::new(HashSet::new()),
        });
        let engine = Engine::new(BuildHandler { env: Arc::clone(&env) });
        Ok(BuildSession { engine, env, scanner: None, built_once: false })
    }

    pub fn set_scanner(&mut self, scanner: Arc<dyn WorkspaceScanner>) {
        self.scanner = Some(scanner);
    }

    pub fn env(&self) -> &Arc<BuildEnv> {
        &self.env
    }

    fn eval_options(&self) -> EvalOptions {
        EvalOptions { jobs: self.env.config.jobs, keep_going: self.env.config.keep_going }
    }

    fn top_configuration(&self) -> ConfigRef {
        Arc::new(Configuration::new(self.env.config.options.clone()))
    }

    /// Marks potentially-changed filesystem state dirty before a build.
    fn detect_changes(&mut self) -> Result<()> {
        if !self.built_once {
            return Ok(());
        }
        let report = match &self.scanner {
            Some(scanner) => scanner
                .changed_paths(self.env.workspace.root())
                .context("scanning the workspace for changes")?,
            None => None,
        };
        match report {
            Some(paths) => {
                debug!("scanner reported {} changed paths", paths.len());
                self.env.vfs.forget(&paths);
                let mut keys: Vec<BuildKey> = Vec::with_capacity(paths.len() * 3);
                for path in paths {
                    keys.push(BuildKey::FileStat(path.clone()));
                    keys.push(BuildKey::DirListing(path.clone()));
                    // Creation and deletion change the parent's listing.
                    if let Some(parent) = path.parent() {
                        keys.push(BuildKey::DirListing(parent.to_owned()));
                    }
                }
                self.engine.invalidate(keys);
            }
            None => {
                // No scanner knowledge: every file key is suspect. The
                // stat-based equality re-cleans them quickly.
                self.engine.invalidate_matching(BuildKey::is_file_key);
            }
        }
        Ok(())
    }

    /// Resolves, analyzes and executes the given target patterns.
    pub fn build(&mut self, patterns: &[TargetPattern]) -> Result<BuildOutcome> {
        self.env.stats.reset();
        let _ = self.env.take_rewinds();
        self.detect_changes()?;
        self.built_once = true;
        let opts = self.eval_options();

        let mut errors: Vec<String> = Vec::new();

        // Loading: expand patterns to labels.
        let pattern_keys: Vec<BuildKey> =
            patterns.iter().map(|p| BuildKey::Patterns(p.clone())).collect();
        let loaded = self.engine.evaluate(&pattern_keys, opts);
        let mut labels: BTreeSet<Label> = BTreeSet::new();
        for (_key, result) in loaded.roots {
            match result {
                Ok(value) => match value.into_patterns() {
                    Ok(found) => labels.extend(found.iter().cloned()),
                    Err(e) => errors.push(e.to_string()),
                },
                Err(e) => errors.push(format_error(&e)),
            }
        }
        if labels.is_empty() || (!errors.is_empty() && !self.env.config.keep_going) {
            if labels.is_empty() && errors.is_empty() {
                errors.push("no targets matched the requested patterns".to_owned());
            }
            return Ok(self.outcome(Vec::new(), Vec::new(), errors));
        }

        // Analysis: configured targets at the top configuration.
        let top = self.top_configuration();
        let ct_keys: Vec<ConfiguredTargetKey> = labels
            .iter()
            .map(|label| ConfiguredTargetKey::new(label.clone(), Some(Arc::clone(&top))))
            .collect();
        let analysis_keys: Vec<BuildKey> =
            ct_keys.iter().map(|k| BuildKey::ConfiguredTarget(k.clone())).collect();
        let analyzed = self.engine.evaluate(&analysis_keys, opts);
        let mut root_values: Vec<(ConfiguredTargetKey, Arc<ConfiguredTargetValue>)> = Vec::new();
        for (key, result) in ct_keys.iter().zip(analyzed.roots.into_iter().map(|(_, r)| r)) {
            match result {
                Ok(value) => match value.into_configured_target() {
                    Ok(v) => root_values.push((key.clone(), v)),
                    Err(e) => errors.push(e.to_string()),
                },
                Err(e) => errors.push(format_error(&e)),
            }
        }
        if root_values.is_empty() || (!errors.is_empty() && !self.env.config.keep_going) {
            return Ok(self.outcome(labels.into_iter().collect(), Vec::new(), errors));
        }

        // Action conflicts are fatal before anything executes.
        let transitive = self.transitive_values(&root_values);
        if let Err(conflict) = check_conflicts(transitive.iter().map(|v| v.as_ref())) {
            errors.push(conflict.to_string());
            return Ok(self.outcome(labels.into_iter().collect(), Vec::new(), errors));
        }

        // Execution: the generating actions of every requested default
        // output, re-running rewound actions a bounded number of times.
        let mut root_artifacts: Vec<Artifact> = Vec::new();
        let mut exec_keys: HashSet<ActionExecKey> = HashSet::new();
        for (_key, value) in &root_values {
            if let Some(files) = value.providers.files() {
                for artifact in self.env.sets.flatten(files) {
                    if let Some(gen) = artifact.generating_action() {
                        exec_keys.insert(gen);
                    }
                    root_artifacts.push(artifact);
                }
            }
        }
        let exec_build_keys: Vec<BuildKey> =
            exec_keys.iter().map(|k| BuildKey::ActionExec(k.clone())).collect();

        let mut exec_errors: Vec<String> = Vec::new();
        for round in 0..MAX_REWIND_ROUNDS {
            exec_errors.clear();
            let executed = self.engine.evaluate(&exec_build_keys, opts);
            for (_, result) in executed.roots {
                if let Err(e) = result {
                    exec_errors.push(format_error(&e));
                }
            }
            self.materialize_roots(&root_artifacts, &mut exec_errors);
            let rewinds = self.env.take_rewinds();
            if rewinds.is_empty() {
                break;
            }
            info!("re-executing {} rewound actions (round {})", rewinds.len(), round + 1);
            self.env.poison(&rewinds);
            self.engine.invalidate(rewinds);
        }
        errors.extend(exec_errors);

        let outputs: Vec<PathBuf> = root_artifacts
            .iter()
            .map(|a| self.env.workspace.execroot().join(a.exec_path()))
            .collect();
        Ok(self.outcome(labels.into_iter().collect(), outputs, errors))
    }

    fn outcome(
        &self,
        targets: Vec<Label>,
        outputs: Vec<PathBuf>,
        errors: Vec<String>,
    ) -> BuildOutcome {
        BuildOutcome {
            success: errors.is_empty(),
            targets,
            actions_executed: self.env.stats.executed(),
            cache_hits: self.env.stats.cache_hits(),
            outputs,
            errors,
        }
    }

    /// Every configured-target value reachable from the roots.
    fn transitive_values(
        &self,
        roots: &[(ConfiguredTargetKey, Arc<ConfiguredTargetValue>)],
    ) -> Vec<Arc<ConfiguredTargetValue>> {
        let mut seen: HashSet<ConfiguredTargetKey> = HashSet::new();
        let mut out = Vec::new();
        let mut pending: Vec<(ConfiguredTargetKey, Arc<ConfiguredTargetValue>)> = roots.to_vec();
        while let Some((key, value)) = pending.pop() {
            if !seen.insert(key) {
                continue;
            }
            for dep in &value.deps {
                if let Some(BuildValue::ConfiguredTarget(dep_value)) =
                    self.engine.value_of(&BuildKey::ConfiguredTarget(dep.clone()))
                {
                    pending.push((dep.clone(), dep_value));
                }
            }
            out.push(value);
        }
        out
    }

    /// Brings requested outputs to disk. Remote states fetch their bytes; an
    /// expired entry schedules the generating action for re-execution.
    fn materialize_roots(&self, artifacts: &[Artifact], errors: &mut Vec<String>) {
        use skein_data::FileState;
        for artifact in artifacts {
            let gen = match artifact.generating_action() {
                Some(gen) => gen,
                None => continue,
            };
            let outputs =
                match self.engine.value_of(&BuildKey::ActionExec(gen.clone())) {
                    Some(BuildValue::ActionResult(outputs)) => outputs,
                    _ => continue,
                };
            let state = match outputs.by_path.get(artifact.exec_path()) {
                Some(s) => s,
                None => continue,
            };
            if let FileState::Remote { digest, .. } = state {
                let fetched = with_retries(
                    "remote ReadBlob",
                    self.env.config.io_retries,
                    self.env.io_retry_delay(),
                    || match &self.env.remote {
                        Some(remote) => remote.blobs.read_blob(digest),
                        None => Ok(None),
                    },
                )
                .unwrap_or(None);
                match fetched {
                    Some(bytes) => {
                        let dst = self.env.workspace.execroot().join(artifact.exec_path());
                        if let Some(parent) = dst.parent() {
                            let _ = fs::create_dir_all(parent);
                        }
                        if let Err(e) = fs::write(&dst, &bytes) {
                            errors.push(format!("materializing {}: {}", dst.display(), e));
                        }
                    }
                    None => {
                        warn!("remote entry for {:?} expired before fetch; rewinding", artifact);
                        self.env.request_rewind(BuildKey::ActionExec(gen));
                    }
                }
            }
        }
    }

    /// Analysis-only query; see `query::run_query`.
    pub fn query(&mut self, expr: &str) -> Result<Vec<String>> {
        query::run_query(self, expr)
    }

    pub(crate) fn engine(&self) -> &Engine<BuildKey, BuildValue, BuildError> {
        &self.engine
    }

    /// Drops the analysis cache, keeping execution-layer nodes.
    pub fn discard_analysis(&self) {
        self.engine.discard_values(BuildKey::is_analysis_key);
    }

    /// Evicts caches. With `expunge`, the whole output base (execution root
    /// included) is removed.
    pub fn clean(&mut self, expunge: bool) -> Result<()> {
        self.engine.discard_all_values(false);
        self.built_once = false;
        self.env.disk_cache.clear().context("clearing the action cache")?;
        if expunge {
            let base = self.env.workspace.output_base();
            if base.exists() {
                fs::remove_dir_all(base)
                    .with_context(|| format!("removing {}", base.display()))?;
            }
        }
        Ok(())
    }
}

pub(crate) fn format_error(err: &NodeError<BuildKey, BuildError>) -> String {
    err.to_string()
}
