//! Action execution.
//!
//! For each action the build needs, decide whether to execute it at all:
//! local cache records are verified against the disk (or rehydrated from the
//! CAS), remote records publish lazy digest-only outputs, and only then does
//! a spawn happen. Duplicate requests for one action key coalesce onto a
//! single in-flight execution; every waiter receives the same value.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, trace, warn};
use rayon::prelude::*;
use walkdir::WalkDir;

use skein_data::file::StatProxy;
use skein_data::{ContentHasher, Digest, FileState, Fingerprint};
use skein_graph::{Context, Step};

use crate::build::actions::{Action, OutputSpec};
use crate::build::artifact::Artifact;
use crate::build::cache::{ActionRecord, OutputKind, OutputMeta};
use crate::build::keys::{ActionExecKey, ActionOutputs, BuildError, BuildKey, BuildValue};
use crate::build::remote::{with_retries, RemoteActionResult};
use crate::build::BuildEnv;
use crate::config::StagingMode;

type BuildStep = Step<BuildKey, BuildValue, BuildError>;
type Ctx<'a> = Context<'a, BuildKey, BuildValue, BuildError>;

/// One spawn, as handed to a runner.
pub struct SpawnRequest<'a> {
    pub argv: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub cwd: &'a Path,
    pub timeout: Option<Duration>,
}

pub struct SpawnResult {
    /// `None` when the process died to a signal or was killed on timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The pluggable execution seam: local subprocess, sandbox, or a remote
/// worker speaking the wire protocol.
pub trait SpawnRunner: Send + Sync {
    fn spawn(&self, req: SpawnRequest<'_>) -> io::Result<SpawnResult>;
}

/// Runs commands as local subprocesses with exactly the declared env.
pub struct LocalSpawnRunner;

impl SpawnRunner for LocalSpawnRunner {
    fn spawn(&self, req: SpawnRequest<'_>) -> io::Result<SpawnResult> {
        let mut cmd = Command::new(&req.argv[0]);
        cmd.args(&req.argv[1..])
            .env_clear()
            .envs(req.env)
            .current_dir(req.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let drain = |pipe: Option<std::process::ChildStdout>| {
            pipe.map(|mut p| {
                thread::spawn(move || {
                    let mut buf = Vec::new();
                    let _ = p.read_to_end(&mut buf);
                    buf
                })
            })
        };
        let out_thread = drain(stdout);
        let err_thread = stderr.map(|mut p| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = p.read_to_end(&mut buf);
                buf
            })
        });

        let deadline = req.timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break Some(status),
                None => {
                    if deadline.map_or(false, |d| Instant::now() >= d) {
                        let _ = child.kill();
                        let _ = child.wait();
                        timed_out = true;
                        break None;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        };

        let stdout = out_thread.and_then(|t| t.join().ok()).unwrap_or_default();
        let stderr = err_thread.and_then(|t| t.join().ok()).unwrap_or_default();
        Ok(SpawnResult { exit_code: status.and_then(|s| s.code()), timed_out, stdout, stderr })
    }
}

/// Coalesces concurrent executions of one action key. The first claimant
/// executes; everyone else waits for the broadcast result.
#[derive(Default)]
pub(crate) struct InFlightMap {
    inner: Mutex<HashMap<String, Vec<Sender<Result<ActionOutputs, BuildError>>>>>,
}

pub(crate) enum Claim {
    Leader,
    Follower(Receiver<Result<ActionOutputs, BuildError>>),
}

impl InFlightMap {
    pub(crate) fn claim(&self, key: &Fingerprint) -> Claim {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(key.hex()) {
            Some(waiters) => {
                let (tx, rx) = bounded(1);
                waiters.push(tx);
                Claim::Follower(rx)
            }
            None => {
                inner.insert(key.hex().to_owned(), Vec::new());
                Claim::Leader
            }
        }
    }

    pub(crate) fn complete(&self, key: &Fingerprint, result: &Result<ActionOutputs, BuildError>) {
        let waiters = self.inner.lock().unwrap().remove(key.hex()).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }
}

/// Evaluates one `ActionExec` key.
pub(crate) fn execute_action(env: &BuildEnv, key: &ActionExecKey, ctx: &mut Ctx<'_>) -> BuildStep {
    // The owning configured target holds the action description; depending on
    // it keeps us in sync with re-analysis.
    let owner = match ctx.request(&BuildKey::ConfiguredTarget(key.owner.clone())) {
        None => return Step::NotReady,
        Some(Err(e)) => return Step::Forward(e),
        Some(Ok(v)) => match v.into_configured_target() {
            Ok(v) => v,
            Err(e) => return Step::Err(e),
        },
    };
    let action = match owner.actions.get(key.index) {
        Some(a) => a.clone(),
        None => {
            return Step::Err(BuildError::Internal(format!(
                "{} declares {} actions, index {} requested",
                key.owner.label,
                owner.actions.len(),
                key.index
            )));
        }
    };

    // Resolve every input leaf to a file state: sources through their digest
    // keys, derived inputs through their generating actions.
    let leaves = env.sets.flatten(action.inputs);
    let wave: Vec<BuildKey> = leaves
        .iter()
        .map(|leaf| match leaf.generating_action() {
            None => BuildKey::FileDigest(env.workspace.source_path(leaf.exec_path())),
            Some(gen) => BuildKey::ActionExec(gen),
        })
        .collect();
    let results = match ctx.request_and_wait(&wave) {
        None => return Step::NotReady,
        Some(results) => results,
    };
    let mut states: HashMap<Artifact, FileState> = HashMap::with_capacity(leaves.len());
    // Trees fingerprint through their per-child digests, not the directory
    // entry itself.
    let mut tree_fps: HashMap<Artifact, Fingerprint> = HashMap::new();
    for (leaf, result) in leaves.iter().zip(results) {
        let value = match result {
            Err(e) => return Step::Forward(e),
            Ok(v) => v,
        };
        let state = match leaf.generating_action() {
            None => {
                let digest = match value.into_file_digest() {
                    Ok(d) => d,
                    Err(e) => return Step::Err(e),
                };
                FileState::Regular {
                    size: digest.size,
                    proxy: StatProxy { mtime_millis: 0, inode: 0 },
                    digest: Some(digest),
                }
            }
            Some(_) => {
                let outputs = match value.into_action_result() {
                    Ok(o) => o,
                    Err(e) => return Step::Err(e),
                };
                if let Artifact::Tree { path, .. } = leaf {
                    let mut hasher = ContentHasher::new(env.vfs.hash_function());
                    let prefix = format!("{}/", path);
                    for (child, child_state) in outputs.by_path.range(prefix.clone()..) {
                        if !child.starts_with(&prefix) {
                            break;
                        }
                        hasher.input_str(child);
                        child_state.fingerprint_into(&mut hasher);
                    }
                    tree_fps.insert(leaf.clone(), hasher.finish_fingerprint());
                }
                match outputs.by_path.get(leaf.exec_path()) {
                    Some(state) => state.clone(),
                    None => {
                        return Step::Err(BuildError::Internal(format!(
                            "input {:?} is not among its generating action's outputs",
                            leaf
                        )));
                    }
                }
            }
        };
        states.insert(leaf.clone(), state);
    }

    let action_key = fingerprint_action(env, &action, &states, &tree_fps);
    trace!("{:?}: action key {}", key, action_key);

    let self_key = BuildKey::ActionExec(key.clone());

    // 1. Local record, verified against the disk or rehydrated from the CAS.
    match check_local_cache(env, &action, &action_key) {
        Ok(Some(outputs)) => {
            debug!("{:?}: local cache hit", key);
            env.stats.count_cache_hit();
            env.unpoison(&self_key);
            return Step::Ready(BuildValue::ActionResult(std::sync::Arc::new(outputs)));
        }
        Ok(None) => {}
        Err(e) => warn!("{:?}: local cache lookup failed: {}", key, e),
    }

    // 2. Remote record: publish digest-only outputs, bytes fetched on
    // demand. Skipped for rewound actions, whose remote entry just proved
    // unusable.
    if let (Some(remote), false) = (&env.remote, env.is_poisoned(&self_key)) {
        let lookup = with_retries("remote GetActionResult", env.config.io_retries, env.io_retry_delay(), || {
            remote.actions.get_action_result(&action_key)
        });
        match lookup {
            Ok(Some(result)) => {
                if let Some(outputs) = remote_outputs(&action, &result) {
                    debug!("{:?}: remote cache hit (lazy)", key);
                    env.stats.count_cache_hit();
                    env.stats.count_remote_hit();
                    return Step::Ready(BuildValue::ActionResult(std::sync::Arc::new(outputs)));
                }
            }
            Ok(None) => {}
            Err(e) => warn!("{:?}: remote lookup failed: {}", key, e),
        }
    }

    // 3. Execute, coalescing duplicate in-flight requests process-wide.
    if ctx.is_cancelled() {
        return Step::Err(BuildError::Exec {
            mnemonic: action.mnemonic.clone(),
            message: "cancelled before execution".to_owned(),
        });
    }
    let result = match env.in_flight.claim(&action_key) {
        Claim::Follower(rx) => match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(BuildError::Internal("in-flight action leader vanished".to_owned())),
        },
        Claim::Leader => {
            let result = run_action(env, key, &action, &action_key, &states);
            env.in_flight.complete(&action_key, &result);
            result
        }
    };
    match result {
        Ok(outputs) => {
            env.unpoison(&self_key);
            Step::Ready(BuildValue::ActionResult(std::sync::Arc::new(outputs)))
        }
        Err(e) => Step::Err(e),
    }
}

/// `action_key = H(mnemonic, sorted env, argv, H(input_set))`.
fn fingerprint_action(
    env: &BuildEnv,
    action: &Action,
    states: &HashMap<Artifact, FileState>,
    tree_fps: &HashMap<Artifact, Fingerprint>,
) -> Fingerprint {
    let hash = env.vfs.hash_function();
    let leaf_fp = |artifact: &Artifact| -> Fingerprint {
        if let Some(fp) = tree_fps.get(artifact) {
            return fp.clone();
        }
        let mut hasher = ContentHasher::new(hash);
        match states.get(artifact) {
            Some(state) => state.fingerprint_into(&mut hasher),
            None => {
                hasher.input_str("?");
            }
        }
        hasher.finish_fingerprint()
    };
    let input_hash = env.sets.fingerprint(action.inputs, hash, &leaf_fp);

    let mut hasher = ContentHasher::new(hash);
    hasher.input_str(&action.mnemonic);
    hasher.input_u64(action.env.len() as u64);
    for (k, v) in &action.env {
        hasher.input_str(k).input_str(v);
    }
    hasher.input_u64(action.argv.len() as u64);
    for arg in &action.argv {
        hasher.input_str(arg);
    }
    // Declared outputs are part of the spawn spec: same command writing to
    // different paths is a different action.
    hasher.input_u64(action.outputs.len() as u64);
    for output in &action.outputs {
        match output {
            OutputSpec::File(p) => hasher.input_str("f").input_str(p),
            OutputSpec::Tree(p) => hasher.input_str("t").input_str(p),
            OutputSpec::Symlink { path, target } => {
                hasher.input_str("l").input_str(path).input_str(target)
            }
        };
    }
    hasher.input_str(input_hash.hex());
    hasher.finish_fingerprint()
}

/// Checks the local record: valid when every declared output is already on
/// disk with matching content, or can be brought there from the CAS.
fn check_local_cache(
    env: &BuildEnv,
    action: &Action,
    action_key: &Fingerprint,
) -> io::Result<Option<ActionOutputs>> {
    let record = match env.disk_cache.get(action_key)? {
        Some(r) => r,
        None => return Ok(None),
    };
    let mut by_path = BTreeMap::new();
    for output in &action.outputs {
        let meta = match record.outputs.get(output.path()) {
            Some(m) => m,
            None => return Ok(None),
        };
        match rehydrate_output(env, output.path(), meta)? {
            Some(states) => by_path.extend(states),
            None => return Ok(None),
        }
    }
    Ok(Some(ActionOutputs { by_path }))
}

/// Ensures one recorded output exists on disk with the recorded content,
/// fetching from the CAS when it is missing or stale. Returns the resulting
/// states (one entry, plus children for trees), or `None` when the record
/// cannot be realized.
fn rehydrate_output(
    env: &BuildEnv,
    rel_path: &str,
    meta: &OutputMeta,
) -> io::Result<Option<BTreeMap<String, FileState>>> {
    let abs = env.workspace.execroot().join(rel_path);
    let mut out = BTreeMap::new();
    match meta.kind {
        OutputKind::File => {
            let want = match &meta.digest {
                Some(d) => d,
                None => return Ok(None),
            };
            let on_disk = env.vfs.stat_with_digest(&abs)?;
            let state = match &on_disk {
                FileState::Regular { digest: Some(d), .. } if d == want => on_disk.clone(),
                _ => {
                    let bytes = match env.disk_cache.get_blob(want)? {
                        Some(b) => b,
                        None => return Ok(None),
                    };
                    write_file(&abs, &bytes)?;
                    FileState::Regular {
                        size: want.size,
                        proxy: StatProxy { mtime_millis: 0, inode: 0 },
                        digest: Some(want.clone()),
                    }
                }
            };
            out.insert(rel_path.to_owned(), state);
        }
        OutputKind::Symlink => {
            let target = match &meta.symlink_target {
                Some(t) => t.clone(),
                None => return Ok(None),
            };
            make_symlink(&abs, Path::new(&target))?;
            out.insert(
                rel_path.to_owned(),
                FileState::Symlink {
                    target: PathBuf::from(target),
                    proxy: StatProxy { mtime_millis: 0, inode: 0 },
                },
            );
        }
        OutputKind::Tree => {
            for (child, digest) in &meta.children {
                let child_abs = abs.join(child);
                let on_disk = env.vfs.stat_with_digest(&child_abs)?;
                match &on_disk {
                    FileState::Regular { digest: Some(d), .. } if d == digest => {}
                    _ => {
                        let bytes = match env.disk_cache.get_blob(digest)? {
                            Some(b) => b,
                            None => return Ok(None),
                        };
                        write_file(&child_abs, &bytes)?;
                    }
                }
                out.insert(
                    format!("{}/{}", rel_path, child),
                    FileState::Regular {
                        size: digest.size,
                        proxy: StatProxy { mtime_millis: 0, inode: 0 },
                        digest: Some(digest.clone()),
                    },
                );
            }
            out.insert(
                rel_path.to_owned(),
                FileState::Directory { proxy: StatProxy { mtime_millis: 0, inode: 0 } },
            );
        }
    }
    Ok(Some(out))
}

/// Remote record to lazy outputs, provided every output can be represented
/// by digest alone.
fn remote_outputs(action: &Action, result: &RemoteActionResult) -> Option<ActionOutputs> {
    let mut by_path = BTreeMap::new();
    for output in &action.outputs {
        let meta = result.outputs.get(output.path())?;
        let state = meta.as_remote_state(result.expires_at_millis)?;
        by_path.insert(output.path().to_owned(), state);
    }
    Some(ActionOutputs { by_path })
}

fn run_action(
    env: &BuildEnv,
    key: &ActionExecKey,
    action: &Action,
    action_key: &Fingerprint,
    states: &HashMap<Artifact, FileState>,
) -> Result<ActionOutputs, BuildError> {
    let execroot = env.workspace.execroot();
    fs::create_dir_all(&execroot).map_err(|e| BuildError::io(e, execroot.display()))?;

    stage_inputs(env, states)?;

    // Clear stale outputs so a failing command cannot leave yesterday's
    // bytes behind as today's result.
    for output in &action.outputs {
        let abs = execroot.join(output.path());
        match output {
            OutputSpec::Tree(_) => {
                if abs.exists() {
                    fs::remove_dir_all(&abs).map_err(|e| BuildError::io(e, abs.display()))?;
                }
                fs::create_dir_all(&abs).map_err(|e| BuildError::io(e, abs.display()))?;
            }
            _ => {
                if let Some(parent) = abs.parent() {
                    fs::create_dir_all(parent).map_err(|e| BuildError::io(e, parent.display()))?;
                }
                let _ = fs::remove_file(&abs);
            }
        }
    }

    if action.argv.is_empty() {
        // Executor-internal action: symlink creation.
        for output in &action.outputs {
            if let OutputSpec::Symlink { path, target } = output {
                let abs = execroot.join(path);
                make_symlink(&abs, Path::new(target)).map_err(|e| BuildError::io(e, abs.display()))?;
            }
        }
    } else {
        info!("executing {} for {}", action.mnemonic, key.owner.label);
        let result = env
            .runner
            .spawn(SpawnRequest {
                argv: &action.argv,
                env: &action.env,
                cwd: &execroot,
                timeout: env.config.action_timeout_secs.map(Duration::from_secs),
            })
            .map_err(|e| BuildError::io(e, format!("spawning {}", action.mnemonic)))?;
        if result.timed_out {
            return Err(BuildError::Exec {
                mnemonic: action.mnemonic.clone(),
                message: format!(
                    "timed out after {}s",
                    env.config.action_timeout_secs.unwrap_or_default()
                ),
            });
        }
        match result.exit_code {
            Some(0) => {}
            Some(code) => {
                return Err(BuildError::Exec {
                    mnemonic: action.mnemonic.clone(),
                    message: format!(
                        "exit code {}: {}",
                        code,
                        String::from_utf8_lossy(&result.stderr).trim()
                    ),
                });
            }
            None => {
                return Err(BuildError::Exec {
                    mnemonic: action.mnemonic.clone(),
                    message: "terminated by signal".to_owned(),
                });
            }
        }
    }

    let (by_path, metas) = collect_outputs(env, action)?;

    // Persist before publishing: later keys may only observe the cache entry
    // after this node's value lands.
    let record = ActionRecord { outputs: metas, timestamp_millis: env.clock.now_millis() };
    if let Err(e) = env.disk_cache.put(action_key, &record) {
        warn!("failed to store action cache record: {}", e);
    }
    store_blobs(env, action, &record);
    if let Some(remote) = &env.remote {
        let remote_result = RemoteActionResult {
            outputs: record.outputs.clone(),
            expires_at_millis: env
                .config
                .remote_ttl_secs
                .map(|ttl| env.clock.now_millis() + ttl * 1000),
        };
        let upload = with_retries("remote UpdateActionResult", env.config.io_retries, env.io_retry_delay(), || {
            for output in record.outputs.values() {
                if let Some(digest) = &output.digest {
                    if let Some(bytes) = env.disk_cache.get_blob(digest)? {
                        remote.blobs.write_blob(&bytes)?;
                    }
                }
                for digest in output.children.values() {
                    if let Some(bytes) = env.disk_cache.get_blob(digest)? {
                        remote.blobs.write_blob(&bytes)?;
                    }
                }
            }
            remote.actions.put_action_result(action_key, &remote_result)
        });
        if let Err(e) = upload {
            warn!("remote cache upload failed: {}", e);
        }
    }

    env.stats.count_executed();
    Ok(ActionOutputs { by_path })
}

/// Brings every input to its exec-root path. Sources come from the
/// workspace via the configured staging mode; derived inputs are already in
/// the exec root unless they are remote, in which case bytes are fetched --
/// and an expired remote entry reruns the generating action instead.
fn stage_inputs(
    env: &BuildEnv,
    states: &HashMap<Artifact, FileState>,
) -> Result<(), BuildError> {
    let execroot = env.workspace.execroot();
    for (artifact, state) in states {
        let dst = execroot.join(artifact.exec_path());
        match artifact {
            Artifact::Source { path } => {
                let src = env.workspace.source_path(path);
                stage_source(env, &src, &dst, state)
                    .map_err(|e| BuildError::io(e, src.display()))?;
            }
            Artifact::Derived { .. } | Artifact::Tree { .. } | Artifact::Symlink { .. } => {
                match state {
                    FileState::Remote { digest, .. } => {
                        let fetched = with_retries(
                            "remote ReadBlob",
                            env.config.io_retries,
                            env.io_retry_delay(),
                            || match &env.remote {
                                Some(remote) => remote.blobs.read_blob(digest),
                                None => Ok(None),
                            },
                        )
                        .unwrap_or(None);
                        match fetched {
                            Some(bytes) => {
                                write_file(&dst, &bytes)
                                    .map_err(|e| BuildError::io(e, dst.display()))?;
                            }
                            None => {
                                // Entry gone or expired: rerun the producer.
                                if let Some(gen) = artifact.generating_action() {
                                    env.request_rewind(BuildKey::ActionExec(gen));
                                }
                                return Err(BuildError::Io(format!(
                                    "remote entry for {:?} expired or missing; its action will be re-executed",
                                    artifact
                                )));
                            }
                        }
                    }
                    FileState::Regular { digest: Some(want), .. } => {
                        // Usually already materialized by the producing
                        // action; re-check in case the exec root was pruned
                        // under a still-warm graph.
                        let present = matches!(
                            env.vfs.stat_with_digest(&dst),
                            Ok(FileState::Regular { digest: Some(ref have), .. }) if have == want
                        );
                        if !present {
                            match env
                                .disk_cache
                                .get_blob(want)
                                .map_err(|e| BuildError::io(e, dst.display()))?
                            {
                                Some(bytes) => {
                                    write_file(&dst, &bytes)
                                        .map_err(|e| BuildError::io(e, dst.display()))?;
                                }
                                None => {
                                    if let Some(gen) = artifact.generating_action() {
                                        env.request_rewind(BuildKey::ActionExec(gen));
                                    }
                                    return Err(BuildError::Io(format!(
                                        "{:?} vanished from the execution root; its action will be re-executed",
                                        artifact
                                    )));
                                }
                            }
                        }
                    }
                    // Trees and symlinks staged by their producing action.
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn stage_source(env: &BuildEnv, src: &Path, dst: &Path, state: &FileState) -> io::Result<()> {
    if let FileState::Regular { digest: Some(want), .. } = state {
        // Already staged with identical content.
        if let Ok(FileState::Regular { digest: Some(have), .. }) = env.vfs.stat_with_digest(dst) {
            if have == *want {
                return Ok(());
            }
        }
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(dst);
    match env.config.staging {
        StagingMode::Copy => {
            fs::copy(src, dst)?;
        }
        StagingMode::Hardlink => {
            if fs::hard_link(src, dst).is_err() {
                fs::copy(src, dst)?;
            }
        }
        StagingMode::Symlink => {
            make_symlink(dst, src)?;
        }
    }
    Ok(())
}

/// Stats and digests every declared output after a successful run.
fn collect_outputs(
    env: &BuildEnv,
    action: &Action,
) -> Result<(BTreeMap<String, FileState>, BTreeMap<String, OutputMeta>), BuildError> {
    let execroot = env.workspace.execroot();

    // File outputs digest in parallel; trees and symlinks are cheap.
    let file_outputs: Vec<&OutputSpec> =
        action.outputs.iter().filter(|o| matches!(o, OutputSpec::File(_))).collect();
    let digested: Vec<(String, io::Result<FileState>)> = file_outputs
        .par_iter()
        .map(|o| (o.path().to_owned(), env.vfs.stat_with_digest(&execroot.join(o.path()))))
        .collect();

    let mut by_path = BTreeMap::new();
    let mut metas = BTreeMap::new();
    for (path, state) in digested {
        let state = state.map_err(|e| BuildError::io(e, &path))?;
        match &state {
            FileState::Regular { digest: Some(d), .. } => {
                metas.insert(path.clone(), OutputMeta::file(d.clone()));
                by_path.insert(path, state);
            }
            _ => {
                return Err(BuildError::Exec {
                    mnemonic: action.mnemonic.clone(),
                    message: format!("did not create declared output `{}`", path),
                });
            }
        }
    }

    for output in &action.outputs {
        match output {
            OutputSpec::File(_) => {}
            OutputSpec::Symlink { path, target } => {
                let abs = execroot.join(path);
                let read = fs::read_link(&abs).map_err(|e| BuildError::io(e, abs.display()))?;
                by_path.insert(
                    path.clone(),
                    FileState::Symlink {
                        target: read,
                        proxy: StatProxy { mtime_millis: 0, inode: 0 },
                    },
                );
                metas.insert(path.clone(), OutputMeta::symlink(target.clone()));
            }
            OutputSpec::Tree(path) => {
                let abs = execroot.join(path);
                if !abs.is_dir() {
                    return Err(BuildError::Exec {
                        mnemonic: action.mnemonic.clone(),
                        message: format!("did not create declared output directory `{}`", path),
                    });
                }
                let mut children: BTreeMap<String, Digest> = BTreeMap::new();
                for entry in WalkDir::new(&abs).sort_by_file_name() {
                    let entry = entry.map_err(|e| {
                        BuildError::Io(format!("walking {}: {}", abs.display(), e))
                    })?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let rel = entry
                        .path()
                        .strip_prefix(&abs)
                        .map_err(|_| BuildError::Internal("tree child outside tree".to_owned()))?
                        .to_string_lossy()
                        .into_owned();
                    let digest = env
                        .vfs
                        .digest(entry.path())
                        .map_err(|e| BuildError::io(e, entry.path().display()))?;
                    by_path.insert(
                        format!("{}/{}", path, rel),
                        FileState::Regular {
                            size: digest.size,
                            proxy: StatProxy { mtime_millis: 0, inode: 0 },
                            digest: Some(digest.clone()),
                        },
                    );
                    children.insert(rel, digest);
                }
                by_path.insert(
                    path.clone(),
                    FileState::Directory { proxy: StatProxy { mtime_millis: 0, inode: 0 } },
                );
                metas.insert(path.clone(), OutputMeta::tree(children));
            }
        }
    }
    Ok((by_path, metas))
}

/// Mirrors output bytes into the CAS so records can rehydrate later.
fn store_blobs(env: &BuildEnv, _action: &Action, record: &ActionRecord) {
    let execroot = env.workspace.execroot();
    for (path, meta) in &record.outputs {
        let read_and_store = |rel: &str| {
            let abs = execroot.join(rel);
            match fs::read(&abs) {
                Ok(bytes) => {
                    if let Err(e) = env.disk_cache.put_blob(&bytes) {
                        warn!("failed to store blob for {}: {}", rel, e);
                    }
                }
                Err(e) => warn!("failed to read output {} for CAS: {}", rel, e),
            }
        };
        match meta.kind {
            OutputKind::File => read_and_store(path),
            OutputKind::Tree => {
                for child in meta.children.keys() {
                    read_and_store(&format!("{}/{}", path, child));
                }
            }
            OutputKind::Symlink => {}
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(path);
    fs::write(path, bytes)
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(link);
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    // Fall back to a copy where symlinks need privileges.
    if target.is_dir() {
        return Err(io::Error::new(io::ErrorKind::Other, "directory symlinks unsupported"));
    }
    fs::copy(target, link).map(|_| ())
}
