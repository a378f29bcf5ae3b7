//! The command-line surface: `build`, `query`, `clean`, `shutdown`, `info`.
//!
//! Flags may appear anywhere; the first bare word is the command. Exit code
//! 0 means success, 1 a build/query failure, 2 a usage or environment error.

use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use log::debug;

use skein_data::TargetPattern;

use crate::build::exec::LocalSpawnRunner;
use crate::build::remote::{InMemoryRemote, RemoteCache, SystemClock};
use crate::build::BuildSession;
use crate::config::{Config, ConfigBuilder};
use crate::daemon;
use crate::workspace::Workspace;

pub fn run(args: &[String]) -> i32 {
    match run_inner(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            2
        }
    }
}

fn run_inner(args: &[String]) -> Result<i32> {
    let mut flags: Vec<String> = Vec::new();
    let mut positional: Vec<String> = Vec::new();
    for arg in args {
        if arg.starts_with('-') {
            flags.push(arg.clone());
        } else {
            positional.push(arg.clone());
        }
    }
    let command = positional
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no command given; see `skein --help`"))?;

    // `--expunge` belongs to `clean`, not to the configuration.
    let mut expunge = false;
    flags.retain(|f| {
        if f == "--expunge" {
            expunge = true;
            false
        } else {
            true
        }
    });

    let cwd = std::env::current_dir().context("resolving the working directory")?;
    let workspace = Workspace::discover(&cwd)?;
    // File options first, flags on top, then resolve the rest to defaults.
    let mut builder = ConfigBuilder::from_workspace(workspace.root())?;
    for flag in &flags {
        if !builder.apply_flag(flag)? {
            return Err(anyhow!("unknown flag `{}`; see `skein --help`", flag));
        }
    }
    let config = builder.resolve(workspace.root())?;
    debug!("workspace at {}", workspace.root().display());

    match command.as_str() {
        "build" => cmd_build(workspace, config, &positional[1..]),
        "query" => cmd_query(workspace, config, &positional[1..]),
        "clean" => cmd_clean(workspace, config, expunge),
        "shutdown" => cmd_shutdown(&workspace),
        "info" => cmd_info(&workspace, &config, positional.get(1).map(String::as_str)),
        other => Err(anyhow!("unknown command `{}`; see `skein --help`", other)),
    }
}

fn new_session(workspace: Workspace, config: Config) -> Result<BuildSession> {
    let remote = remote_cache_for(&config)?;
    BuildSession::with_parts(
        workspace,
        config,
        Arc::new(LocalSpawnRunner),
        Arc::new(SystemClock),
        remote,
    )
}

/// Builds the remote cache endpoints from the configured URL. Only the
/// in-process `mem:` scheme is linked into this binary; real transports plug
/// in through the `RemoteActionStore`/`BlobStore` traits.
fn remote_cache_for(config: &Config) -> Result<Option<RemoteCache>> {
    let url = match &config.remote_cache {
        None => return Ok(None),
        Some(url) => url,
    };
    if url.starts_with("mem:") {
        let remote = InMemoryRemote::new(
            Arc::new(SystemClock),
            config.hash_function,
            config.remote_ttl_secs.map(|s| s * 1000),
        );
        return Ok(Some(remote.into_cache()));
    }
    Err(anyhow!(
        "no remote cache transport for `{}` is linked into this binary",
        url
    ))
}

fn cmd_build(workspace: Workspace, config: Config, patterns: &[String]) -> Result<i32> {
    if patterns.is_empty() {
        return Err(anyhow!("`build` requires at least one target pattern"));
    }
    let patterns: Vec<TargetPattern> = patterns
        .iter()
        .map(|p| TargetPattern::parse(p).map_err(|e| anyhow!(e.to_string())))
        .collect::<Result<_>>()?;

    let mut session = new_session(workspace, config)?;
    let outcome = session.build(&patterns)?;

    for error in &outcome.errors {
        eprintln!("ERROR: {}", error);
    }
    if outcome.success {
        println!(
            "Built {} target(s): {} action(s) executed, {} cache hit(s).",
            outcome.targets.len(),
            outcome.actions_executed,
            outcome.cache_hits
        );
        for output in &outcome.outputs {
            println!("  {}", output.display());
        }
        Ok(0)
    } else {
        eprintln!("Build failed.");
        Ok(1)
    }
}

fn cmd_query(workspace: Workspace, config: Config, args: &[String]) -> Result<i32> {
    if args.is_empty() {
        return Err(anyhow!("`query` requires an expression"));
    }
    let expr = args.join(" ");
    let mut session = new_session(workspace, config)?;
    let lines = session.query(&expr)?;
    for line in lines {
        println!("{}", line);
    }
    Ok(0)
}

fn cmd_clean(workspace: Workspace, config: Config, expunge: bool) -> Result<i32> {
    let mut session = new_session(workspace, config)?;
    session.clean(expunge)?;
    println!("{}", if expunge { "Expunged." } else { "Cleaned." });
    Ok(0)
}

fn cmd_shutdown(workspace: &Workspace) -> Result<i32> {
    match daemon::read_pid(workspace) {
        None => {
            println!("No daemon running.");
            Ok(0)
        }
        Some(pid) if !daemon::is_alive(pid) => {
            fs::remove_file(workspace.daemon_pid_file())
                .context("removing the stale daemon pid file")?;
            println!("Removed stale pid file for daemon {}.", pid);
            Ok(0)
        }
        Some(pid) => {
            daemon::request_shutdown(workspace).context("writing the shutdown marker")?;
            println!("Asked daemon {} to shut down.", pid);
            Ok(0)
        }
    }
}

fn cmd_info(workspace: &Workspace, config: &Config, key: Option<&str>) -> Result<i32> {
    let entries: Vec<(&str, String)> = vec![
        ("release", format!("skein {}", crate::version())),
        ("workspace", workspace.root().display().to_string()),
        ("output_base", workspace.output_base().display().to_string()),
        ("execution_root", workspace.execroot().display().to_string()),
        ("disk_cache", config.disk_cache.display().to_string()),
        ("jobs", config.jobs.to_string()),
        ("hash_function", config.hash_function.to_string()),
        ("keep_going", config.keep_going.to_string()),
        (
            "sibling_repository_layout",
            config.experimental_sibling_repository_layout.to_string(),
        ),
    ];
    match key {
        None => {
            for (name, value) in entries {
                println!("{}: {}", name, value);
            }
            Ok(0)
        }
        Some(wanted) => match entries.iter().find(|(name, _)| *name == wanted) {
            Some((_, value)) => {
                println!("{}", value);
                Ok(0)
            }
            None => Err(anyhow!("unknown info key `{}`", wanted)),
        },
    }
}
