//! Declarative actions and the per-target action registry.
//!
//! Rules declare actions during analysis. The registry enforces the action
//! graph invariants at declaration time: outputs stay under the owning
//! target's output prefix and no output is declared twice. Cross-target
//! conflicts are caught by `check_conflicts` once analysis has finished.

use std::collections::{BTreeMap, HashMap};

use crate::build::artifact::Artifact;
use crate::build::keys::{BuildError, ConfiguredTargetKey};
use crate::build::nested::{NestedSetStore, SetHandle};
use crate::build::target::ConfiguredTargetValue;

/// One declared output of an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutputSpec {
    /// A regular file, exec-root-relative.
    File(String),
    /// A directory whose contents are determined at execution time.
    Tree(String),
    /// A symlink with a fixed textual target.
    Symlink { path: String, target: String },
}

impl OutputSpec {
    pub fn path(&self) -> &str {
        match self {
            OutputSpec::File(p) | OutputSpec::Tree(p) | OutputSpec::Symlink { path: p, .. } => p,
        }
    }
}

/// A hermetic, cacheable unit of execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub owner: ConfiguredTargetKey,
    pub index: usize,
    pub mnemonic: String,
    /// Spawn spec. Empty for actions the executor performs itself
    /// (symlink creation).
    pub argv: Vec<String>,
    /// Exactly the env vars the command consumes, with their resolved
    /// values. Nothing else reaches the subprocess.
    pub env: BTreeMap<String, String>,
    pub inputs: SetHandle,
    pub outputs: Vec<OutputSpec>,
}

/// Collects the actions a single rule implementation declares.
pub struct ActionRegistry<'a> {
    owner: ConfiguredTargetKey,
    out_prefix: String,
    sets: &'a NestedSetStore,
    actions: Vec<Action>,
    declared: HashMap<String, usize>,
}

impl<'a> ActionRegistry<'a> {
    pub fn new(owner: ConfiguredTargetKey, sets: &'a NestedSetStore) -> ActionRegistry<'a> {
        let out_prefix = format!("out/{}/{}", owner.config_segment(), owner.label.package);
        ActionRegistry { owner, out_prefix, sets, actions: Vec::new(), declared: HashMap::new() }
    }

    pub fn out_prefix(&self) -> &str {
        &self.out_prefix
    }

    /// Exec-root-relative path for a declared output name. The name must stay
    /// under the rule's output directory prefix.
    pub fn output_path(&self, name: &str) -> Result<String, BuildError> {
        let name = name.trim_end_matches('/');
        if name.is_empty()
            || name.starts_with('/')
            || name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(BuildError::Input(format!(
                "{}: invalid output name `{}`",
                self.owner.label, name
            )));
        }
        Ok(format!("{}/{}", self.out_prefix, name))
    }

    /// Declares one action. Returns the artifacts for its outputs.
    pub fn register(
        &mut self,
        mnemonic: &str,
        argv: Vec<String>,
        env: BTreeMap<String, String>,
        inputs: SetHandle,
        outputs: Vec<OutputSpec>,
    ) -> Result<Vec<Artifact>, BuildError> {
        if outputs.is_empty() {
            return Err(BuildError::Input(format!(
                "{}: action {} declares no outputs",
                self.owner.label, mnemonic
            )));
        }
        let index = self.actions.len();
        let mut artifacts = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let path = output.path().to_owned();
            debug_assert!(path.starts_with(&self.out_prefix));
            if self.declared.insert(path.clone(), index).is_some() {
                return Err(BuildError::ActionConflict {
                    output: path,
                    first: self.owner.label.to_string(),
                    second: self.owner.label.to_string(),
                });
            }
            artifacts.push(match output {
                OutputSpec::File(p) => {
                    Artifact::Derived { path: p.clone(), owner: self.owner.clone(), index }
                }
                OutputSpec::Tree(p) => {
                    Artifact::Tree { path: p.clone(), owner: self.owner.clone(), index }
                }
                OutputSpec::Symlink { path: p, target } => Artifact::Symlink {
                    path: p.clone(),
                    target: target.clone(),
                    owner: self.owner.clone(),
                    index,
                },
            });
        }
        self.actions.push(Action {
            owner: self.owner.clone(),
            index,
            mnemonic: mnemonic.to_owned(),
            argv,
            env,
            inputs,
            outputs,
        });
        Ok(artifacts)
    }

    pub fn sets(&self) -> &NestedSetStore {
        self.sets
    }

    pub fn finish(self) -> Vec<std::sync::Arc<Action>> {
        self.actions.into_iter().map(std::sync::Arc::new).collect()
    }
}

/// Verifies that no two actions across the analyzed graph declare the same
/// output. Reports both owner labels on conflict.
pub fn check_conflicts<'v>(
    values: impl Iterator<Item = &'v ConfiguredTargetValue>,
) -> Result<(), BuildError> {
    let mut owners: HashMap<&str, &ConfiguredTargetKey> = HashMap::new();
    for value in values {
        for action in &value.actions {
            for output in &action.outputs {
                match owners.insert(output.path(), &action.owner) {
                    None => {}
                    Some(first) if *first == action.owner => {}
                    Some(first) => {
                        return Err(BuildError::ActionConflict {
                            output: output.path().to_owned(),
                            first: first.label.to_string(),
                            second: action.owner.label.to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}
