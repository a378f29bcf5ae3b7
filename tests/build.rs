//! End-to-end build scenarios over real workspaces in temp directories:
//! cache hits, surgical re-execution, conflicts, cycles, glob invalidation
//! and remote lazy materialization.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use skein::build::exec::LocalSpawnRunner;
use skein::build::remote::{BlobStore, InMemoryRemote, ManualClock, RemoteActionStore, RemoteCache};
use skein::build::{BuildOutcome, BuildSession};
use skein::config::Config;
use skein::workspace::Workspace;
use skein_data::TargetPattern;
use skein_vfs::StatSweepScanner;

/// Creates a workspace populated with `files` (workspace-relative paths).
fn workspace(files: &[(&str, &str)]) -> (TempDir, Workspace) {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("WORKSPACE.skein"), b"").unwrap();
    write_files(dir.path(), files);
    let ws = Workspace::at_root(dir.path().to_owned());
    (dir, ws)
}

fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let abs = root.join(path);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(abs, content).unwrap();
    }
}

fn config_for(ws: &Workspace) -> Config {
    Config::load(ws.root()).expect("config")
}

fn session(ws: &Workspace) -> BuildSession {
    BuildSession::new(ws.clone(), config_for(ws)).expect("session")
}

fn build(session: &mut BuildSession, pattern: &str) -> BuildOutcome {
    let pattern = TargetPattern::parse(pattern).expect("pattern");
    session.build(&[pattern]).expect("build")
}

fn assert_built(outcome: &BuildOutcome) {
    assert!(outcome.success, "build failed: {:?}", outcome.errors);
}

const CAT_RULE: &str = r#"
[targets.out]
kind = "genrule"
cmd = "cat $(location in.txt) > $@"
srcs = ["in.txt"]
outs = ["out.txt"]
env = ["PATH"]
"#;

#[test]
fn scenario_a_second_build_hits_the_cache() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", CAT_RULE), ("p/in.txt", "hi\n")]);
    let mut session = session(&ws);

    let first = build(&mut session, "//p:out");
    assert_built(&first);
    assert_eq!(first.actions_executed, 1);
    assert_eq!(fs::read_to_string(&first.outputs[0]).unwrap(), "hi\n");

    let second = build(&mut session, "//p:out");
    assert_built(&second);
    assert_eq!(second.actions_executed, 0, "no input changed; nothing may run");
    assert_eq!(fs::read_to_string(&second.outputs[0]).unwrap(), "hi\n");
}

#[test]
fn scenario_a_cold_session_hits_the_disk_cache() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", CAT_RULE), ("p/in.txt", "hi\n")]);
    {
        let mut warm = session(&ws);
        assert_eq!(build(&mut warm, "//p:out").actions_executed, 1);
    }
    // A fresh process has no graph, but the on-disk action cache survives.
    let mut cold = session(&ws);
    let outcome = build(&mut cold, "//p:out");
    assert_built(&outcome);
    assert_eq!(outcome.actions_executed, 0);
    assert!(outcome.cache_hits >= 1);
}

#[test]
fn touching_an_unrelated_file_runs_nothing() {
    let (_dir, ws) = workspace(&[
        ("p/PKG.toml", CAT_RULE),
        ("p/in.txt", "hi\n"),
        ("p/unrelated.txt", "noise"),
    ]);
    let mut session = session(&ws);
    assert_eq!(build(&mut session, "//p:out").actions_executed, 1);

    write_files(ws.root(), &[("p/unrelated.txt", "different noise entirely")]);
    let rebuilt = build(&mut session, "//p:out");
    assert_built(&rebuilt);
    assert_eq!(rebuilt.actions_executed, 0);
}

#[test]
fn modifying_a_dep_source_reruns_exactly_the_consumer() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", CAT_RULE), ("p/in.txt", "one\n")]);
    let mut session = session(&ws);
    assert_eq!(build(&mut session, "//p:out").actions_executed, 1);

    write_files(ws.root(), &[("p/in.txt", "two two\n")]);
    let rebuilt = build(&mut session, "//p:out");
    assert_built(&rebuilt);
    assert_eq!(rebuilt.actions_executed, 1);
    assert_eq!(fs::read_to_string(&rebuilt.outputs[0]).unwrap(), "two two\n");
}

#[test]
fn sweep_scanner_drives_incremental_builds() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", CAT_RULE), ("p/in.txt", "v1\n")]);
    let mut session = session(&ws);
    let vfs = Arc::clone(&session.env().vfs);
    session.set_scanner(Arc::new(StatSweepScanner::new(
        vfs,
        vec![".skein".to_owned(), ".git".to_owned()],
    )));

    assert_eq!(build(&mut session, "//p:out").actions_executed, 1);

    // The first sweep has no baseline and falls back to invalidating every
    // file key; stat equality re-cleans them.
    let second = build(&mut session, "//p:out");
    assert_built(&second);
    assert_eq!(second.actions_executed, 0);

    // With a baseline, only the reported paths are invalidated.
    write_files(ws.root(), &[("p/in.txt", "version two\n")]);
    let third = build(&mut session, "//p:out");
    assert_built(&third);
    assert_eq!(third.actions_executed, 1);
    assert_eq!(fs::read_to_string(&third.outputs[0]).unwrap(), "version two\n");
}

#[test]
fn scenario_b_cross_package_change_is_surgical() {
    let (_dir, ws) = workspace(&[
        (
            "a/PKG.toml",
            r#"
            [targets.gen]
            kind = "genrule"
            cmd = "cat $(location in.txt) > $@"
            srcs = ["in.txt"]
            outs = ["gen.txt"]
            env = ["PATH"]
            "#,
        ),
        ("a/in.txt", "from a\n"),
        (
            "b/PKG.toml",
            r#"
            [targets.use]
            kind = "genrule"
            cmd = "cat $(location //a:gen) $(location extra.txt) > $@"
            srcs = ["//a:gen", "extra.txt"]
            outs = ["use.txt"]
            env = ["PATH"]

            [targets.other]
            kind = "genrule"
            cmd = "cat $(location solo.txt) > $@"
            srcs = ["solo.txt"]
            outs = ["other.txt"]
            env = ["PATH"]
            "#,
        ),
        ("b/extra.txt", "extra\n"),
        ("b/solo.txt", "solo\n"),
    ]);
    let mut session = session(&ws);
    let first = build(&mut session, "//b:all");
    assert_built(&first);
    assert_eq!(first.actions_executed, 3);

    // Modify a source only in //a: its action reruns, and of //b only the
    // target whose inputs transitively include the changed output.
    write_files(ws.root(), &[("a/in.txt", "changed in a!\n")]);
    let rebuilt = build(&mut session, "//b:all");
    assert_built(&rebuilt);
    assert_eq!(rebuilt.actions_executed, 2);
    let use_out = rebuilt
        .outputs
        .iter()
        .find(|p| p.to_string_lossy().ends_with("use.txt"))
        .expect("use.txt output");
    assert_eq!(fs::read_to_string(use_out).unwrap(), "changed in a!\nextra\n");
}

#[test]
fn scenario_c_output_conflict_is_fatal_before_execution() {
    let (_dir, ws) = workspace(&[
        (
            "p/PKG.toml",
            r#"
            [targets.one]
            kind = "genrule"
            cmd = "echo one > $@"
            outs = ["gen/x.o"]

            [targets.two]
            kind = "genrule"
            cmd = "echo two > $@"
            outs = ["gen/x.o"]
            "#,
        ),
    ]);
    let mut session = session(&ws);
    let outcome = build(&mut session, "//p:all");
    assert!(!outcome.success);
    assert_eq!(outcome.actions_executed, 0, "conflicts abort before any execution");
    let message = outcome.errors.join("\n");
    assert!(message.contains("gen/x.o"), "unexpected: {}", message);
    assert!(message.contains("//p:one") && message.contains("//p:two"), "unexpected: {}", message);
}

#[test]
fn scenario_d_dependency_cycle_is_reported_and_sticky() {
    let (_dir, ws) = workspace(&[
        (
            "a/PKG.toml",
            r#"
            [targets.x]
            kind = "filegroup"
            deps = ["//b:y"]
            "#,
        ),
        (
            "b/PKG.toml",
            r#"
            [targets.y]
            kind = "filegroup"
            deps = ["//a:x"]
            "#,
        ),
    ]);
    let mut session = session(&ws);
    let outcome = build(&mut session, "//a:x");
    assert!(!outcome.success);
    let message = outcome.errors.join("\n");
    assert!(message.contains("cycle"), "unexpected: {}", message);
    assert!(message.contains("//a:x") && message.contains("//b:y"), "unexpected: {}", message);

    // The error repeats until an edge is removed.
    let again = build(&mut session, "//a:x");
    assert!(!again.success);
    assert!(again.errors.join("\n").contains("cycle"));

    write_files(
        ws.root(),
        &[(
            "b/PKG.toml",
            r#"
            [targets.y]
            kind = "filegroup"
            "#,
        )],
    );
    assert_built(&build(&mut session, "//a:x"));
}

const GLOB_RULE: &str = r#"
[targets.joined]
kind = "genrule"
cmd = "cat $(SRCS) /dev/null > $@"
outs = ["joined.txt"]
env = ["PATH"]

[targets.joined.glob]
include = ["*.c"]
"#;

#[test]
fn scenario_e_new_file_invalidates_the_glob() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", GLOB_RULE), ("p/a.c", "alpha\n")]);
    let mut session = session(&ws);
    let first = build(&mut session, "//p:joined");
    assert_built(&first);
    assert_eq!(fs::read_to_string(&first.outputs[0]).unwrap(), "alpha\n");

    write_files(ws.root(), &[("p/b.c", "beta\n")]);
    let rebuilt = build(&mut session, "//p:joined");
    assert_built(&rebuilt);
    assert_eq!(rebuilt.actions_executed, 1);
    assert_eq!(fs::read_to_string(&rebuilt.outputs[0]).unwrap(), "alpha\nbeta\n");
}

#[test]
fn empty_glob_still_tracks_its_directory() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", GLOB_RULE)]);
    let mut session = session(&ws);
    let first = build(&mut session, "//p:joined");
    assert_built(&first);
    assert_eq!(fs::read_to_string(&first.outputs[0]).unwrap(), "");

    write_files(ws.root(), &[("p/fresh.c", "fresh\n")]);
    let rebuilt = build(&mut session, "//p:joined");
    assert_built(&rebuilt);
    assert_eq!(fs::read_to_string(&rebuilt.outputs[0]).unwrap(), "fresh\n");
}

#[test]
fn a_new_subpackage_shrinks_enclosing_globs() {
    let (_dir, ws) = workspace(&[
        (
            "p/PKG.toml",
            r#"
            [targets.joined]
            kind = "genrule"
            cmd = "cat $(SRCS) /dev/null > $@"
            outs = ["joined.txt"]
            env = ["PATH"]

            [targets.joined.glob]
            include = ["**/*.c"]
            "#,
        ),
        ("p/top.c", "top\n"),
        ("p/sub/inner.c", "inner\n"),
    ]);
    let mut session = session(&ws);
    let first = build(&mut session, "//p:joined");
    assert_built(&first);
    // Glob matches are lexicographic: sub/inner.c sorts before top.c.
    assert_eq!(fs::read_to_string(&first.outputs[0]).unwrap(), "inner\ntop\n");

    // p/sub becomes its own package: files under it leave //p's globs.
    write_files(ws.root(), &[("p/sub/PKG.toml", "")]);
    let rebuilt = build(&mut session, "//p:joined");
    assert_built(&rebuilt);
    assert_eq!(fs::read_to_string(&rebuilt.outputs[0]).unwrap(), "top\n");
}

#[test]
fn clean_build_reproduces_identical_outputs() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", CAT_RULE), ("p/in.txt", "stable content\n")]);
    let mut session = session(&ws);
    let first = build(&mut session, "//p:out");
    assert_built(&first);
    let bytes_before = fs::read(&first.outputs[0]).unwrap();

    session.clean(false).unwrap();
    let rebuilt = build(&mut session, "//p:out");
    assert_built(&rebuilt);
    assert_eq!(rebuilt.actions_executed, 1, "clean must force re-execution");
    assert_eq!(fs::read(&rebuilt.outputs[0]).unwrap(), bytes_before);
}

#[test]
fn analysis_discard_recomputes_analysis_but_not_actions() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", CAT_RULE), ("p/in.txt", "hi\n")]);
    let mut session = session(&ws);
    assert_eq!(build(&mut session, "//p:out").actions_executed, 1);

    // Dropping the analysis cache forces re-analysis; the re-derived actions
    // fingerprint identically and the action cache answers for them.
    session.discard_analysis();
    let rebuilt = build(&mut session, "//p:out");
    assert_built(&rebuilt);
    assert_eq!(rebuilt.actions_executed, 0);
}

#[test]
fn expunge_forces_a_full_rebuild() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", CAT_RULE), ("p/in.txt", "hi\n")]);
    let mut session = session(&ws);
    let first = build(&mut session, "//p:out");
    assert_built(&first);

    session.clean(true).unwrap();
    assert!(!ws.output_base().exists());

    let rebuilt = build(&mut session, "//p:out");
    assert_built(&rebuilt);
    assert_eq!(rebuilt.actions_executed, 1);
    assert_eq!(fs::read_to_string(&rebuilt.outputs[0]).unwrap(), "hi\n");
}

#[test]
fn keep_going_builds_the_healthy_sibling() {
    let (_dir, ws) = workspace(&[
        (
            "p/PKG.toml",
            r#"
            [targets.bad]
            kind = "genrule"
            cmd = "exit 1"
            outs = ["bad.txt"]

            [targets.good]
            kind = "genrule"
            cmd = "echo fine > $@"
            outs = ["good.txt"]
            env = ["PATH"]
            "#,
        ),
    ]);
    let mut config = config_for(&ws);
    config.keep_going = true;
    let mut session = BuildSession::new(ws.clone(), config).unwrap();
    let outcome = build(&mut session, "//p:all");
    assert!(!outcome.success);
    assert!(outcome.errors.iter().any(|e| e.contains("exit code 1")));
    let good = outcome
        .outputs
        .iter()
        .find(|p| p.to_string_lossy().ends_with("good.txt"))
        .expect("good output path");
    assert_eq!(fs::read_to_string(good).unwrap(), "fine\n");
}

#[test]
fn execution_failures_are_not_cached() {
    let (_dir, ws) = workspace(&[
        (
            "p/PKG.toml",
            r#"
            [targets.pick]
            kind = "genrule"
            cmd = "grep ok $(location in.txt) > $@"
            srcs = ["in.txt"]
            outs = ["picked.txt"]
            env = ["PATH"]
            "#,
        ),
        ("p/in.txt", "bad\n"),
    ]);
    let mut session = session(&ws);
    let first = build(&mut session, "//p:pick");
    assert!(!first.success);
    assert_eq!(first.actions_executed, 1);

    // Nothing changed, but an execution failure must retry.
    let second = build(&mut session, "//p:pick");
    assert!(!second.success);
    assert_eq!(second.actions_executed, 1);

    write_files(ws.root(), &[("p/in.txt", "ok here\n")]);
    let fixed = build(&mut session, "//p:pick");
    assert_built(&fixed);
    assert_eq!(fs::read_to_string(&fixed.outputs[0]).unwrap(), "ok here\n");
}

#[test]
fn actions_receive_exactly_their_declared_env() {
    std::env::set_var("SKEIN_TEST_SECRET", "leaky");
    std::env::set_var("SKEIN_TEST_DECLARED", "visible");
    let (_dir, ws) = workspace(&[
        (
            "p/PKG.toml",
            r#"
            [targets.env_probe]
            kind = "genrule"
            cmd = "echo ${SKEIN_TEST_DECLARED:-unset} ${SKEIN_TEST_SECRET:-unset} > $@"
            outs = ["probe.txt"]
            env = ["SKEIN_TEST_DECLARED"]
            "#,
        ),
    ]);
    let mut config = config_for(&ws);
    config.action_env.push("SKEIN_TEST_DECLARED".to_owned());
    config.action_env.push("SKEIN_TEST_SECRET".to_owned());
    let mut session = BuildSession::new(ws.clone(), config).unwrap();
    let outcome = build(&mut session, "//p:env_probe");
    assert_built(&outcome);
    // SECRET is in the client env but undeclared by the action.
    assert_eq!(fs::read_to_string(&outcome.outputs[0]).unwrap(), "visible unset\n");
}

#[test]
fn aliases_and_filegroups_resolve_to_the_underlying_files() {
    let (_dir, ws) = workspace(&[
        (
            "p/PKG.toml",
            r#"
            [targets.gen]
            kind = "genrule"
            cmd = "echo payload > $@"
            outs = ["gen.txt"]
            env = ["PATH"]

            [targets.group]
            kind = "filegroup"
            srcs = [":gen"]

            [targets.shortcut]
            kind = "alias"
            actual = ":group"
            "#,
        ),
    ]);
    let mut session = session(&ws);
    let outcome = build(&mut session, "//p:shortcut");
    assert_built(&outcome);
    assert_eq!(outcome.actions_executed, 1);
    assert_eq!(outcome.outputs.len(), 1);
    assert_eq!(fs::read_to_string(&outcome.outputs[0]).unwrap(), "payload\n");
}

#[test]
fn symlink_rule_creates_a_link() {
    let (_dir, ws) = workspace(&[
        (
            "p/PKG.toml",
            r#"
            [targets.link]
            kind = "symlink"
            outs = ["latest"]
            link_target = "somewhere/else"
            "#,
        ),
    ]);
    let mut session = session(&ws);
    let outcome = build(&mut session, "//p:link");
    assert_built(&outcome);
    let link = &outcome.outputs[0];
    let target = fs::read_link(link).expect("symlink on disk");
    assert_eq!(target, Path::new("somewhere/else"));

    // Cached on rebuild.
    let again = build(&mut session, "//p:link");
    assert_eq!(again.actions_executed, 0);
}

#[test]
fn tree_outputs_cache_by_children() {
    let (_dir, ws) = workspace(&[
        (
            "p/PKG.toml",
            r#"
            [targets.treegen]
            kind = "genrule"
            cmd = "mkdir -p $@/b && echo one > $@/a.txt && echo two > $@/b/nested.txt"
            out_dirs = ["gen_tree"]
            env = ["PATH"]
            "#,
        ),
    ]);
    let mut session = session(&ws);
    let first = build(&mut session, "//p:treegen");
    assert_built(&first);
    assert_eq!(first.actions_executed, 1);
    let tree = &first.outputs[0];
    assert_eq!(fs::read_to_string(tree.join("a.txt")).unwrap(), "one\n");
    assert_eq!(fs::read_to_string(tree.join("b/nested.txt")).unwrap(), "two\n");

    let second = build(&mut session, "//p:treegen");
    assert_built(&second);
    assert_eq!(second.actions_executed, 0);
}

#[test]
fn split_transitions_fan_one_edge_out() {
    let (_dir, ws) = workspace(&[
        (
            "lib/PKG.toml",
            r#"
            [targets.gen]
            kind = "genrule"
            cmd = "echo built > $@"
            outs = ["gen.txt"]
            env = ["PATH"]
            "#,
        ),
        (
            "top/PKG.toml",
            r#"
            [targets.fan]
            kind = "filegroup"
            deps = ["//lib:gen"]

            [targets.fan.transition]
            kind = "split"
            [targets.fan.transition.branches.arm]
            cpu = "arm"
            [targets.fan.transition.branches.x86]
            cpu = "x86"
            "#,
        ),
    ]);
    let mut session = session(&ws);
    let outcome = build(&mut session, "//top:fan");
    assert_built(&outcome);
    // One declared edge, two configurations, two distinct outputs.
    assert_eq!(outcome.actions_executed, 2);
    assert_eq!(outcome.outputs.len(), 2);
    assert_ne!(outcome.outputs[0], outcome.outputs[1]);
    for output in &outcome.outputs {
        assert_eq!(fs::read_to_string(output).unwrap(), "built\n");
    }
}

#[test]
fn extensions_substitute_into_rules() {
    let (_dir, ws) = workspace(&[
        (
            "tools/defs.toml",
            r#"
            [vars]
            GREETING = "bonjour"
            "#,
        ),
        (
            "p/PKG.toml",
            r#"
            include = ["//tools/defs.toml"]

            [targets.greet]
            kind = "genrule"
            cmd = "echo ${GREETING} > $@"
            outs = ["greeting.txt"]
            env = ["PATH"]
            "#,
        ),
    ]);
    let mut session = session(&ws);
    let outcome = build(&mut session, "//p:greet");
    assert_built(&outcome);
    assert_eq!(fs::read_to_string(&outcome.outputs[0]).unwrap(), "bonjour\n");

    // Editing the extension invalidates the package and its actions.
    write_files(ws.root(), &[("tools/defs.toml", "[vars]\nGREETING = \"hei\"\n")]);
    let rebuilt = build(&mut session, "//p:greet");
    assert_built(&rebuilt);
    assert_eq!(rebuilt.actions_executed, 1);
    assert_eq!(fs::read_to_string(&rebuilt.outputs[0]).unwrap(), "hei\n");
}

#[test]
fn circular_extension_includes_are_cycle_errors() {
    let (_dir, ws) = workspace(&[
        ("defs/a.toml", "include = [\"//defs/b.toml\"]\n"),
        ("defs/b.toml", "include = [\"//defs/a.toml\"]\n"),
        (
            "p/PKG.toml",
            r#"
            include = ["//defs/a.toml"]

            [targets.t]
            kind = "filegroup"
            "#,
        ),
    ]);
    let mut session = session(&ws);
    let outcome = build(&mut session, "//p:t");
    assert!(!outcome.success);
    assert!(outcome.errors.join("\n").contains("cycle"));
}

#[test]
fn malformed_packages_report_errors_and_recover() {
    let (_dir, ws) = workspace(&[("p/PKG.toml", "this is not toml ["), ("p/in.txt", "hi\n")]);
    let mut session = session(&ws);
    let broken = build(&mut session, "//p:out");
    assert!(!broken.success);

    write_files(ws.root(), &[("p/PKG.toml", CAT_RULE)]);
    let fixed = build(&mut session, "//p:out");
    assert_built(&fixed);
    assert_eq!(fs::read_to_string(&fixed.outputs[0]).unwrap(), "hi\n");
}

#[test]
fn queries_report_relationships_without_executing() {
    let (_dir, ws) = workspace(&[
        (
            "a/PKG.toml",
            r#"
            [targets.gen]
            kind = "genrule"
            cmd = "cat $(location in.txt) > $@"
            srcs = ["in.txt"]
            outs = ["gen.txt"]
            env = ["PATH"]
            "#,
        ),
        ("a/in.txt", "x\n"),
        (
            "b/PKG.toml",
            r#"
            [targets.use]
            kind = "filegroup"
            srcs = ["//a:gen"]
            "#,
        ),
    ]);
    let mut session = session(&ws);

    let deps = session.query("deps(//b:use)").unwrap();
    assert_eq!(deps, vec!["//a:gen".to_owned(), "//b:use".to_owned()]);

    let rdeps = session.query("rdeps(//a:gen)").unwrap();
    assert!(rdeps.contains(&"//b:use".to_owned()));

    let sources = session.query("aspect(sources, //b:use)").unwrap();
    assert!(sources.iter().any(|l| l.contains("a/in.txt")), "got {:?}", sources);

    assert_eq!(session.env().stats.executed(), 0, "queries must not execute actions");
}

#[test]
fn scenario_f_remote_entries_publish_lazily_and_rewind_on_loss() {
    let (_dir, ws) = workspace(&[
        (
            "a/PKG.toml",
            r#"
            [targets.gen]
            kind = "genrule"
            cmd = "cat $(location in.txt) > $@"
            srcs = ["in.txt"]
            outs = ["gen.txt"]
            env = ["PATH"]
            "#,
        ),
        ("a/in.txt", "remote payload\n"),
        (
            "b/PKG.toml",
            r#"
            [targets.use]
            kind = "genrule"
            cmd = "cat $(location //a:gen) > $@"
            srcs = ["//a:gen"]
            outs = ["use.txt"]
            env = ["PATH"]
            "#,
        ),
    ]);

    let clock = Arc::new(ManualClock::new(0));
    let clock_handle: Arc<dyn skein::build::remote::Clock> = clock.clone();
    let store = Arc::new(InMemoryRemote::new(
        Arc::clone(&clock_handle),
        skein_data::HashFunction::Sha256,
        Some(60_000),
    ));
    let actions: Arc<dyn RemoteActionStore> = store.clone();
    let blobs: Arc<dyn BlobStore> = store.clone();
    let remote = RemoteCache { actions, blobs };

    let session_with = |cache_suffix: &str| {
        let mut config = config_for(&ws);
        config.remote_ttl_secs = Some(60);
        config.disk_cache = ws.output_base().join(format!("cache-{}", cache_suffix));
        BuildSession::with_parts(
            ws.clone(),
            config,
            Arc::new(LocalSpawnRunner),
            Arc::clone(&clock_handle),
            Some(remote.clone()),
        )
        .unwrap()
    };

    // Populate the remote cache.
    let mut seeder = session_with("seed");
    let seeded = build(&mut seeder, "//b:use");
    assert_built(&seeded);
    assert_eq!(seeded.actions_executed, 2);
    drop(seeder);

    // A cold builder sharing only the remote: zero executions, outputs come
    // back lazily and are materialized on demand.
    fs::remove_dir_all(ws.execroot()).unwrap();
    let mut cold = session_with("cold");
    let outcome = build(&mut cold, "//b:use");
    assert_built(&outcome);
    assert_eq!(outcome.actions_executed, 0);
    assert!(cold.env().stats.remote_hits() >= 1);
    assert_eq!(fs::read_to_string(&outcome.outputs[0]).unwrap(), "remote payload\n");
    drop(cold);

    // The remote loses its blobs but keeps the index: a consumer that needs
    // the bytes forces the generating action to re-execute.
    store.drop_blobs();
    fs::remove_dir_all(ws.execroot()).unwrap();
    let mut rewound = session_with("rewound");
    let outcome = build(&mut rewound, "//b:use");
    assert_built(&outcome);
    assert!(outcome.actions_executed >= 1, "lost blobs must force re-execution");
    assert_eq!(fs::read_to_string(&outcome.outputs[0]).unwrap(), "remote payload\n");
    drop(rewound);

    // Past the TTL the remote index stops answering; a cold build executes.
    clock.advance(120_000);
    fs::remove_dir_all(ws.execroot()).unwrap();
    let mut expired = session_with("expired");
    let outcome = build(&mut expired, "//b:use");
    assert_built(&outcome);
    assert_eq!(outcome.actions_executed, 2);
}
