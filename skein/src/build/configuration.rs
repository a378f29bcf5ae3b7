//! Configurations, transitions and dependency edges.
//!
//! A configuration is an immutable record of option values. Configured-target
//! identity is (label, configuration checksum), and the checksum also names
//! the configuration's segment of the output tree.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use skein_data::{ContentHasher, Fingerprint, HashFunction, Label};

use crate::build::keys::BuildError;

/// Shared immutable configuration. Compared by option contents, hashed by
/// checksum.
pub type ConfigRef = Arc<Configuration>;

#[derive(Debug, Clone, Eq)]
pub struct Configuration {
    options: BTreeMap<String, String>,
    checksum: Fingerprint,
}

impl Configuration {
    pub fn new(options: BTreeMap<String, String>) -> Configuration {
        let mut hasher = ContentHasher::new(HashFunction::Sha256);
        for (k, v) in &options {
            hasher.input_str(k).input_str(v);
        }
        let checksum = hasher.finish_fingerprint();
        Configuration { options, checksum }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn checksum(&self) -> &Fingerprint {
        &self.checksum
    }

    /// Short prefix of the checksum, used as the output-tree segment.
    pub fn short_hash(&self) -> &str {
        &self.checksum.hex()[..12]
    }

    /// A child configuration with `changes` applied on top of this one.
    pub fn patched(&self, changes: &BTreeMap<String, String>) -> Configuration {
        let mut options = self.options.clone();
        for (k, v) in changes {
            options.insert(k.clone(), v.clone());
        }
        Configuration::new(options)
    }
}

impl PartialEq for Configuration {
    fn eq(&self, other: &Configuration) -> bool {
        self.options == other.options
    }
}

impl Hash for Configuration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.checksum.hash(state);
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_hash())
    }
}

/// Declared transition on a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Child uses the parent configuration unchanged.
    Keep,
    /// Child configuration is the parent with options overridden.
    Patch(BTreeMap<String, String>),
    /// One edge fans out to several tagged child configurations.
    Split(Vec<(String, BTreeMap<String, String>)>),
}

impl Transition {
    /// Child configurations, each with its branch tag (`None` for unsplit
    /// transitions).
    pub fn apply(
        &self,
        parent: &ConfigRef,
    ) -> Result<Vec<(Option<String>, ConfigRef)>, BuildError> {
        match self {
            Transition::Keep => Ok(vec![(None, Arc::clone(parent))]),
            Transition::Patch(changes) => {
                validate_changes(changes)?;
                Ok(vec![(None, Arc::new(parent.patched(changes)))])
            }
            Transition::Split(branches) => {
                if branches.is_empty() {
                    return Err(BuildError::Configuration(
                        "split transition with no branches".to_owned(),
                    ));
                }
                let mut seen = std::collections::HashSet::new();
                let mut out = Vec::with_capacity(branches.len());
                for (tag, changes) in branches {
                    if !seen.insert(tag.clone()) {
                        return Err(BuildError::Configuration(format!(
                            "split transition repeats branch tag `{}`",
                            tag
                        )));
                    }
                    validate_changes(changes)?;
                    out.push((Some(tag.clone()), Arc::new(parent.patched(changes))));
                }
                Ok(out)
            }
        }
    }
}

fn validate_changes(changes: &BTreeMap<String, String>) -> Result<(), BuildError> {
    for key in changes.keys() {
        if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
            return Err(BuildError::Configuration(format!(
                "invalid option name `{}` in transition",
                key
            )));
        }
    }
    Ok(())
}

/// How one declared edge is configured. The three variants of the dependency
/// model: null configuration for sources, an explicit configuration, or a
/// transition applied to the parent's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DepConfig {
    Null,
    Explicit(ConfigRef),
    Transition(Transition),
}

/// An edge in the configured-target graph before configuration resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub label: Label,
    pub config: DepConfig,
    pub aspects: Vec<String>,
}

impl Dependency {
    pub fn simple(label: Label) -> Dependency {
        Dependency { label, config: DepConfig::Transition(Transition::Keep), aspects: Vec::new() }
    }
}
