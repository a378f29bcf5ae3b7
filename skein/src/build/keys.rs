//! Keys, values and errors of the build graph.
//!
//! Every computation the build performs is named by a `BuildKey` variant; the
//! variant is the function name, the payload its argument. `BuildValue`
//! mirrors the keys one-to-one. Both are plain data: the handler in
//! `build::mod` dispatches each key to its function.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use skein_data::{Digest, FileState, Label, TargetPattern};
use skein_vfs::DirEntry;

use crate::build::aspect::AspectValue;
use crate::build::configuration::ConfigRef;
use crate::build::package::Package;
use crate::build::target::ConfiguredTargetValue;

/// Identity of a configured target: (label, configuration). `None` is the
/// null configuration used for source-file targets.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConfiguredTargetKey {
    pub label: Label,
    pub config: Option<ConfigRef>,
}

impl ConfiguredTargetKey {
    pub fn new(label: Label, config: Option<ConfigRef>) -> ConfiguredTargetKey {
        ConfiguredTargetKey { label, config }
    }

    pub fn config_segment(&self) -> String {
        match &self.config {
            Some(c) => c.short_hash().to_owned(),
            None => "source".to_owned(),
        }
    }
}

impl fmt::Debug for ConfiguredTargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.config_segment())
    }
}

/// One declared action of a configured target, by position.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ActionExecKey {
    pub owner: ConfiguredTargetKey,
    pub index: usize,
}

impl fmt::Debug for ActionExecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action #{} of {:?}", self.index, self.owner)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AspectKey {
    pub base: ConfiguredTargetKey,
    pub aspect: String,
}

impl fmt::Debug for AspectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aspect {} on {:?}", self.aspect, self.base)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GlobKey {
    /// Owning package path.
    pub package: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub exclude_directories: bool,
}

impl fmt::Debug for GlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "glob //{} {:?} - {:?}", self.package, self.include, self.exclude)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum BuildKey {
    /// Stat of an absolute path, digest attached when already known.
    FileStat(PathBuf),
    /// Sorted children of an absolute directory path.
    DirListing(PathBuf),
    /// Content digest of a regular file at an absolute path.
    FileDigest(PathBuf),
    /// A glob evaluated inside one package.
    Glob(GlobKey),
    /// The evaluated package at a workspace-relative directory path.
    Package(String),
    /// The evaluated bindings of an extension file (workspace-relative path).
    Extension(String),
    /// Expansion of one command-line target pattern into labels.
    Patterns(TargetPattern),
    ConfiguredTarget(ConfiguredTargetKey),
    Aspect(AspectKey),
    ActionExec(ActionExecKey),
}

impl BuildKey {
    /// True for keys whose value mirrors raw filesystem state. These are the
    /// dirty leaves of change detection.
    pub fn is_file_key(&self) -> bool {
        matches!(self, BuildKey::FileStat(_) | BuildKey::DirListing(_) | BuildKey::FileDigest(_))
    }

    /// True for analysis-layer keys, dropped by the analysis-cache discard.
    pub fn is_analysis_key(&self) -> bool {
        matches!(
            self,
            BuildKey::Package(_)
                | BuildKey::Extension(_)
                | BuildKey::Patterns(_)
                | BuildKey::Glob(_)
                | BuildKey::ConfiguredTarget(_)
                | BuildKey::Aspect(_)
        )
    }
}

impl fmt::Debug for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildKey::FileStat(p) => write!(f, "file {}", p.display()),
            BuildKey::DirListing(p) => write!(f, "dir {}", p.display()),
            BuildKey::FileDigest(p) => write!(f, "digest {}", p.display()),
            BuildKey::Glob(g) => g.fmt(f),
            BuildKey::Package(p) => write!(f, "package //{}", p),
            BuildKey::Extension(p) => write!(f, "extension {}", p),
            BuildKey::Patterns(p) => write!(f, "pattern {}", p),
            BuildKey::ConfiguredTarget(k) => k.fmt(f),
            BuildKey::Aspect(k) => k.fmt(f),
            BuildKey::ActionExec(k) => k.fmt(f),
        }
    }
}

/// Outputs of one executed (or cache-hit) action: declared output path to its
/// resulting file state. Tree outputs carry per-child states keyed by
/// `dir/child` paths in addition to the directory entry itself.
#[derive(Debug, Clone)]
pub struct ActionOutputs {
    pub by_path: BTreeMap<String, FileState>,
}

// Compared with version semantics so that a rehydrated output (or a remote
// one later materialized locally) is the same value as a freshly executed
// one with equal content.
impl PartialEq for ActionOutputs {
    fn eq(&self, other: &ActionOutputs) -> bool {
        self.by_path.len() == other.by_path.len()
            && self
                .by_path
                .iter()
                .zip(other.by_path.iter())
                .all(|((p1, s1), (p2, s2))| p1 == p2 && s1.version_equals(s2))
    }
}

#[derive(Clone)]
pub enum BuildValue {
    FileStat(FileState),
    DirListing(Arc<Vec<DirEntry>>),
    FileDigest(Digest),
    /// Sorted, package-relative match paths.
    Glob(Arc<Vec<String>>),
    Package(Arc<Package>),
    Extension(Arc<BTreeMap<String, String>>),
    Patterns(Arc<Vec<Label>>),
    ConfiguredTarget(Arc<ConfiguredTargetValue>),
    Aspect(Arc<AspectValue>),
    ActionResult(Arc<ActionOutputs>),
}

// Structural equality drives the evaluator's change pruning. File stats use
// `version_equals`, so a lazily attached digest or a touched mtime on an
// already-digested file does not count as a change.
impl PartialEq for BuildValue {
    fn eq(&self, other: &BuildValue) -> bool {
        use BuildValue::*;
        match (self, other) {
            (FileStat(a), FileStat(b)) => a.version_equals(b),
            (DirListing(a), DirListing(b)) => a == b,
            (FileDigest(a), FileDigest(b)) => a == b,
            (Glob(a), Glob(b)) => a == b,
            (Package(a), Package(b)) => a == b,
            (Extension(a), Extension(b)) => a == b,
            (Patterns(a), Patterns(b)) => a == b,
            (ConfiguredTarget(a), ConfiguredTarget(b)) => a == b,
            (Aspect(a), Aspect(b)) => a == b,
            (ActionResult(a), ActionResult(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for BuildValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildValue::FileStat(s) => write!(f, "FileStat({:?})", s.kind()),
            BuildValue::DirListing(l) => write!(f, "DirListing({} entries)", l.len()),
            BuildValue::FileDigest(d) => write!(f, "FileDigest({})", d),
            BuildValue::Glob(g) => write!(f, "Glob({} matches)", g.len()),
            BuildValue::Package(p) => write!(f, "Package(//{})", p.path),
            BuildValue::Extension(e) => write!(f, "Extension({} bindings)", e.len()),
            BuildValue::Patterns(l) => write!(f, "Patterns({} labels)", l.len()),
            BuildValue::ConfiguredTarget(v) => write!(f, "ConfiguredTarget({})", v.label),
            BuildValue::Aspect(_) => write!(f, "Aspect"),
            BuildValue::ActionResult(o) => write!(f, "ActionResult({} outputs)", o.by_path.len()),
        }
    }
}

macro_rules! value_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(self) -> Result<$ty, BuildError> {
            match self {
                BuildValue::$variant(v) => Ok(v),
                other => Err(BuildError::Internal(format!(
                    concat!("expected ", stringify!($variant), " value, got {:?}"),
                    other
                ))),
            }
        }
    };
}

impl BuildValue {
    value_accessor!(into_file_stat, FileStat, FileState);
    value_accessor!(into_dir_listing, DirListing, Arc<Vec<DirEntry>>);
    value_accessor!(into_file_digest, FileDigest, Digest);
    value_accessor!(into_glob, Glob, Arc<Vec<String>>);
    value_accessor!(into_package, Package, Arc<Package>);
    value_accessor!(into_extension, Extension, Arc<BTreeMap<String, String>>);
    value_accessor!(into_patterns, Patterns, Arc<Vec<Label>>);
    value_accessor!(into_configured_target, ConfiguredTarget, Arc<ConfiguredTargetValue>);
    value_accessor!(into_aspect, Aspect, Arc<AspectValue>);
    value_accessor!(into_action_result, ActionResult, Arc<ActionOutputs>);
}

/// Typed function errors, by kind. Execution failures and I/O errors are
/// never cached; the rest are cached as node values and invalidated when
/// inputs change.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildError {
    /// Malformed package file, unknown target, bad label.
    Input(String),
    /// Invalid transition result or conflicting option values.
    Configuration(String),
    /// Two actions declared the same output. Always fatal.
    ActionConflict { output: String, first: String, second: String },
    /// Non-zero exit, timeout, or signal.
    Exec { mnemonic: String, message: String },
    /// Filesystem or remote transport error.
    Io(String),
    /// Broken invariant inside the build tool.
    Internal(String),
}

impl BuildError {
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, BuildError::Exec { .. } | BuildError::Io(_))
    }

    pub fn io(err: std::io::Error, what: impl fmt::Display) -> BuildError {
        BuildError::Io(format!("{}: {}", what, err))
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Input(msg) => write!(f, "{}", msg),
            BuildError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            BuildError::ActionConflict { output, first, second } => write!(
                f,
                "output `{}` is declared by both {} and {}",
                output, first, second
            ),
            BuildError::Exec { mnemonic, message } => {
                write!(f, "action {} failed: {}", mnemonic, message)
            }
            BuildError::Io(msg) => write!(f, "I/O error: {}", msg),
            BuildError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}
