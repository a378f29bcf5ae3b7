//! The file-state functions: the leaves of the build graph.
//!
//! `FileStat` nodes are the dirty leaves of change detection; everything else
//! reaches the filesystem through them. `FileDigest` depends on the stat so
//! that a content digest is only recomputed when the stat proxy moved.

use std::path::Path;

use skein_data::FileState;
use skein_graph::{Context, Step};

use crate::build::keys::{BuildError, BuildKey, BuildValue};
use crate::build::BuildEnv;

type BuildStep = Step<BuildKey, BuildValue, BuildError>;
type Ctx<'a> = Context<'a, BuildKey, BuildValue, BuildError>;

/// Evaluates a `FileStat` key. No deps: this is a leaf re-read on demand.
pub(crate) fn stat_file(env: &BuildEnv, path: &Path) -> BuildStep {
    match env.vfs.stat(path) {
        Ok(state) => Step::Ready(BuildValue::FileStat(state)),
        Err(e) => Step::Err(BuildError::io(e, path.display())),
    }
}

/// Evaluates a `FileDigest` key: content digest of a regular file.
pub(crate) fn digest_file(env: &BuildEnv, path: &Path, ctx: &mut Ctx<'_>) -> BuildStep {
    let stat = match ctx.request(&BuildKey::FileStat(path.to_owned())) {
        None => return Step::NotReady,
        Some(Err(e)) => return Step::Forward(e),
        Some(Ok(v)) => match v.into_file_stat() {
            Ok(s) => s,
            Err(e) => return Step::Err(e),
        },
    };
    match stat {
        FileState::Regular { digest: Some(d), .. } => Step::Ready(BuildValue::FileDigest(d)),
        FileState::Regular { digest: None, .. } => match env.vfs.digest(path) {
            Ok(d) => Step::Ready(BuildValue::FileDigest(d)),
            Err(e) => Step::Err(BuildError::io(e, path.display())),
        },
        FileState::Absent => {
            Step::Err(BuildError::Input(format!("file not found: {}", path.display())))
        }
        other => Step::Err(BuildError::Input(format!(
            "cannot digest {}: it is a {:?}",
            path.display(),
            other.kind()
        ))),
    }
}
