//! Cooperative daemon bookkeeping.
//!
//! A long-lived process embedding `BuildSession` (an IDE bridge, a watch
//! loop) advertises itself through a pid file under the output base and
//! polls for the shutdown marker between builds. The `shutdown` command only
//! talks through these files; it never signals.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::workspace::Workspace;

const SHUTDOWN_MARKER: &str = "daemon.shutdown";

fn marker_path(workspace: &Workspace) -> PathBuf {
    workspace.output_base().join(SHUTDOWN_MARKER)
}

/// Registers the calling process as the workspace daemon.
pub fn write_pid_file(workspace: &Workspace) -> io::Result<()> {
    let path = workspace.daemon_pid_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, std::process::id().to_string())
}

/// Removes this process's registration and any pending shutdown marker.
pub fn remove_pid_file(workspace: &Workspace) -> io::Result<()> {
    let _ = fs::remove_file(marker_path(workspace));
    match fs::remove_file(workspace.daemon_pid_file()) {
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub fn read_pid(workspace: &Workspace) -> Option<u32> {
    let text = fs::read_to_string(workspace.daemon_pid_file()).ok()?;
    text.trim().parse().ok()
}

/// Best-effort liveness probe for a recorded daemon pid.
pub fn is_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{}", pid)).exists()
    } else {
        // Without procfs, assume a recorded daemon is alive; the shutdown
        // marker protocol works either way.
        true
    }
}

/// Asks a running daemon to exit at its next idle point.
pub fn request_shutdown(workspace: &Workspace) -> io::Result<()> {
    let path = marker_path(workspace);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, b"")
}

/// Polled by daemons between builds.
pub fn shutdown_requested(workspace: &Workspace) -> bool {
    let requested = marker_path(workspace).exists();
    if requested {
        debug!("shutdown marker present");
    }
    requested
}
