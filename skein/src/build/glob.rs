//! The glob engine.
//!
//! Globs are evaluated against the owning package's directory subtree.
//! Traversal stops at sub-package boundaries: a subdirectory containing its
//! own `PKG.toml` belongs to that package, and nothing under it can match.
//! Every directory listing the traversal observes is a dep, as is the
//! presence check of each candidate sub-package marker, so file creation,
//! deletion and new sub-packages all invalidate the glob.

use std::path::PathBuf;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use log::trace;

use skein_data::{FileKind, FileState};
use skein_graph::{Context, Step};
use skein_vfs::DirEntry;

use crate::build::keys::{BuildError, BuildKey, BuildValue, GlobKey};
use crate::build::package::{package_dir, PKG_FILE};
use crate::build::BuildEnv;

type BuildStep = Step<BuildKey, BuildValue, BuildError>;
type Ctx<'a> = Context<'a, BuildKey, BuildValue, BuildError>;

fn compile(patterns: &[String], what: &str) -> Result<GlobSet, BuildError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if pattern.starts_with('/') || pattern.contains("..") {
            return Err(BuildError::Input(format!(
                "glob {} pattern `{}` must be package-relative",
                what, pattern
            )));
        }
        let glob = Glob::new(pattern).map_err(|e| {
            BuildError::Input(format!("invalid glob {} pattern `{}`: {}", what, pattern, e))
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| BuildError::Input(format!("glob compilation failed: {}", e)))
}

/// Evaluates one `Glob` key: deterministic, deduplicated, lexicographically
/// sorted package-relative matches.
pub(crate) fn evaluate_glob(env: &BuildEnv, key: &GlobKey, ctx: &mut Ctx<'_>) -> BuildStep {
    let include = match compile(&key.include, "include") {
        Ok(set) => set,
        Err(e) => return Step::Err(e),
    };
    let exclude = match compile(&key.exclude, "exclude") {
        Ok(set) => set,
        Err(e) => return Step::Err(e),
    };

    let root = package_dir(env, &key.package);

    // Iterative traversal; directories still waiting on listings park the
    // whole evaluation via NotReady and we restart from the top.
    let mut matches: Vec<String> = Vec::new();
    let mut pending: Vec<String> = vec![String::new()]; // package-relative dirs
    while let Some(rel_dir) = pending.pop() {
        let abs_dir = if rel_dir.is_empty() { root.clone() } else { root.join(&rel_dir) };
        let listing = match ctx.request(&BuildKey::DirListing(abs_dir.clone())) {
            None => return Step::NotReady,
            Some(Err(e)) => return Step::Forward(e),
            Some(Ok(v)) => match v.into_dir_listing() {
                Ok(l) => l,
                Err(e) => return Step::Err(e),
            },
        };
        for entry in listing.iter() {
            let rel = join_rel(&rel_dir, &entry.name);
            match entry.kind {
                FileKind::Directory => {
                    // Sub-package marker check is itself a dep: creating
                    // PKG.toml below us must re-run this glob.
                    let marker: PathBuf = abs_dir.join(&entry.name).join(PKG_FILE);
                    let marker_state = match ctx.request(&BuildKey::FileStat(marker)) {
                        None => return Step::NotReady,
                        Some(Err(e)) => return Step::Forward(e),
                        Some(Ok(v)) => match v.into_file_stat() {
                            Ok(s) => s,
                            Err(e) => return Step::Err(e),
                        },
                    };
                    if let FileState::Regular { .. } = marker_state {
                        trace!("glob //{}: not descending into sub-package {}", key.package, rel);
                        continue;
                    }
                    if !key.exclude_directories && include.is_match(&rel) && !exclude.is_match(&rel)
                    {
                        matches.push(rel.clone());
                    }
                    pending.push(rel);
                }
                FileKind::Regular | FileKind::Symlink => {
                    if include.is_match(&rel) && !exclude.is_match(&rel) {
                        matches.push(rel);
                    }
                }
                FileKind::Absent => {}
            }
        }
    }

    matches.sort();
    matches.dedup();
    Step::Ready(BuildValue::Glob(Arc::new(matches)))
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Listing of one directory, straight from the VFS. The leaf function of the
/// glob engine and of recursive pattern expansion.
pub(crate) fn list_directory(env: &BuildEnv, path: &std::path::Path) -> BuildStep {
    match env.vfs.list_dir(path) {
        Ok(entries) => Step::Ready(BuildValue::DirListing(Arc::new(entries))),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
            Step::Ready(BuildValue::DirListing(Arc::new(Vec::<DirEntry>::new())))
        }
        Err(e) => Step::Err(BuildError::io(e, path.display())),
    }
}
