//! Workspace change scanning between builds.
//!
//! A scanner tells the build which paths may have changed since the previous
//! build. Without one, the build invalidates every source file key and lets
//! stat-based equality re-clean them.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use rayon::prelude::*;
use walkdir::WalkDir;

use skein_data::FileState;

use crate::{FileLoader, RealFileLoader, Vfs};

/// Reports potentially-changed workspace paths.
pub trait WorkspaceScanner: Send + Sync {
    /// Paths that may have changed since the last call. `None` means the
    /// scanner cannot tell, in which case the caller must invalidate all
    /// source file keys.
    fn changed_paths(&self, workspace: &Path) -> io::Result<Option<Vec<PathBuf>>>;
}

/// Full-sweep scanner: walks the workspace, stats everything in parallel and
/// diffs against the snapshot taken by the previous sweep.
///
/// The first sweep has no snapshot and reports `None`.
pub struct StatSweepScanner<L: FileLoader = RealFileLoader> {
    vfs: Arc<Vfs<L>>,
    /// Directory names never descended into (scratch dirs, VCS metadata).
    skip: Vec<String>,
    snapshot: Mutex<Option<HashMap<PathBuf, FileState>>>,
}

impl<L: FileLoader> StatSweepScanner<L> {
    pub fn new(vfs: Arc<Vfs<L>>, skip: Vec<String>) -> StatSweepScanner<L> {
        StatSweepScanner { vfs, skip, snapshot: Mutex::new(None) }
    }

    fn walk(&self, workspace: &Path) -> Vec<PathBuf> {
        WalkDir::new(workspace)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !self.skip.iter().any(|s| *s == name)
            })
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .collect()
    }
}

impl<L: FileLoader> WorkspaceScanner for StatSweepScanner<L> {
    fn changed_paths(&self, workspace: &Path) -> io::Result<Option<Vec<PathBuf>>> {
        let paths = self.walk(workspace);
        let vfs = &self.vfs;
        let stats: Vec<(PathBuf, FileState)> = paths
            .into_par_iter()
            .filter_map(|p| vfs.stat(&p).ok().map(|s| (p, s)))
            .collect();
        let current: HashMap<PathBuf, FileState> = stats.into_iter().collect();

        let mut snapshot = self.snapshot.lock().unwrap();
        let result = match snapshot.as_ref() {
            None => None,
            Some(prev) => {
                let mut changed: Vec<PathBuf> = Vec::new();
                for (path, state) in &current {
                    match prev.get(path) {
                        Some(old) if old.version_equals(state) => {}
                        _ => changed.push(path.clone()),
                    }
                }
                for path in prev.keys() {
                    if !current.contains_key(path) {
                        changed.push(path.clone());
                    }
                }
                changed.sort();
                debug!("sweep found {} changed paths", changed.len());
                Some(changed)
            }
        };
        *snapshot = Some(current);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_data::HashFunction;
    use std::fs;

    #[test]
    fn sweep_reports_changes_after_first_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"one").unwrap();

        let vfs = Arc::new(Vfs::new(HashFunction::Sha256));
        let scanner = StatSweepScanner::new(vfs, vec![".git".to_owned()]);

        // First sweep: no baseline.
        assert!(scanner.changed_paths(dir.path()).unwrap().is_none());

        // No changes: empty report.
        let unchanged = scanner.changed_paths(dir.path()).unwrap().unwrap();
        assert!(unchanged.is_empty());

        // Add a file and modify the existing one (length change beats mtime
        // granularity).
        fs::write(dir.path().join("b.txt"), b"new").unwrap();
        fs::write(dir.path().join("a.txt"), b"changed!").unwrap();
        let changed = scanner.changed_paths(dir.path()).unwrap().unwrap();
        assert!(changed.contains(&dir.path().join("a.txt")));
        assert!(changed.contains(&dir.path().join("b.txt")));

        // Deletion shows up too.
        fs::remove_file(dir.path().join("b.txt")).unwrap();
        let removed = scanner.changed_paths(dir.path()).unwrap().unwrap();
        assert!(removed.contains(&dir.path().join("b.txt")));
    }
}
