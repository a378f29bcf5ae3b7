//! Workspace discovery and the layout of the scratch directory.
//!
//! A workspace is the directory tree rooted at the nearest ancestor carrying
//! `WORKSPACE.skein`. All tool state lives under `.skein/` inside it: the
//! execution root where inputs are staged and outputs materialize, the action
//! cache, and the daemon pid file.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::build::package::WORKSPACE_FILE;

/// Name of the scratch directory under the workspace root.
pub const OUTPUT_BASE: &str = ".skein";

/// The main (local) workspace's segment inside the execution root.
const MAIN_REPO: &str = "_main";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    output_base: PathBuf,
}

impl Workspace {
    /// Walks up from `start` to the nearest directory containing the marker
    /// file.
    pub fn discover(start: &Path) -> Result<Workspace> {
        let mut dir = start.to_owned();
        loop {
            if dir.join(WORKSPACE_FILE).is_file() {
                return Ok(Workspace::at_root(dir));
            }
            if !dir.pop() {
                return Err(anyhow!(
                    "no {} found above {}; run inside a workspace",
                    WORKSPACE_FILE,
                    start.display()
                ));
            }
        }
    }

    /// Uses `root` as the workspace without looking for the marker. Test
    /// fixtures create the marker themselves.
    pub fn at_root(root: PathBuf) -> Workspace {
        let output_base = root.join(OUTPUT_BASE);
        Workspace { root, output_base }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn output_base(&self) -> &Path {
        &self.output_base
    }

    /// Absolute path of a workspace-relative source path.
    pub fn source_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// The execution root of the main workspace.
    pub fn execroot(&self) -> PathBuf {
        self.output_base.join("execroot").join(MAIN_REPO)
    }

    /// Where an external workspace's files land. The sibling layout places
    /// each external workspace next to the main one; the classic layout
    /// nests them under `external/` inside it.
    pub fn external_root(&self, repo: &str, sibling_layout: bool) -> PathBuf {
        if sibling_layout {
            self.output_base.join("execroot").join(repo)
        } else {
            self.execroot().join("external").join(repo)
        }
    }

    pub fn default_cache_dir(&self) -> PathBuf {
        self.output_base.join("cache")
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.output_base.join("daemon.pid")
    }
}
