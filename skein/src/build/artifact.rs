//! Artifacts: semantic handles to the files flowing through the action graph.

use std::fmt;

use crate::build::keys::{ActionExecKey, ConfiguredTargetKey};

/// A file (or tree of files) participating in the action graph. Identity is
/// stable across builds; the file's state is not part of it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Artifact {
    /// A workspace source file, identified by workspace-relative path.
    Source { path: String },
    /// An action output, identified by exec-root-relative path plus the
    /// action that creates it.
    Derived { path: String, owner: ConfiguredTargetKey, index: usize },
    /// A directory output whose contents are only known after execution.
    /// Addressed as a unit; children never escape the executor.
    Tree { path: String, owner: ConfiguredTargetKey, index: usize },
    /// A symlink output; the textual target is part of its identity.
    Symlink { path: String, target: String, owner: ConfiguredTargetKey, index: usize },
}

impl Artifact {
    /// Exec-root-relative path at which the artifact is staged or produced.
    /// Source files are staged at their workspace-relative path.
    pub fn exec_path(&self) -> &str {
        match self {
            Artifact::Source { path }
            | Artifact::Derived { path, .. }
            | Artifact::Tree { path, .. }
            | Artifact::Symlink { path, .. } => path,
        }
    }

    /// The action producing this artifact; `None` for sources.
    pub fn generating_action(&self) -> Option<ActionExecKey> {
        match self {
            Artifact::Source { .. } => None,
            Artifact::Derived { owner, index, .. }
            | Artifact::Tree { owner, index, .. }
            | Artifact::Symlink { owner, index, .. } => {
                Some(ActionExecKey { owner: owner.clone(), index: *index })
            }
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Artifact::Source { .. })
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Source { path } => write!(f, "src:{}", path),
            Artifact::Derived { path, .. } => write!(f, "out:{}", path),
            Artifact::Tree { path, .. } => write!(f, "tree:{}", path),
            Artifact::Symlink { path, target, .. } => write!(f, "link:{} -> {}", path, target),
        }
    }
}
