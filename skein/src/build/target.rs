//! Configured-target analysis.
//!
//! Given a (label, configuration) key this resolves the target's declared
//! dependencies, applies configuration transitions, recursively requests the
//! resulting configured targets, and runs the rule implementation over the
//! assembled provider sets. Rule implementations are pure: attribute maps are
//! ordered, nothing reads the clock, and equal inputs produce equal values.

use std::collections::BTreeMap;
use std::sync::Arc;

use itertools::Itertools;
use log::trace;

use skein_data::{FileState, Label};
use skein_graph::{Context, Step};

use crate::build::actions::{Action, ActionRegistry, OutputSpec};
use crate::build::artifact::Artifact;
use crate::build::aspect::AspectValue;
use crate::build::configuration::{DepConfig, Dependency, Transition};
use crate::build::keys::{AspectKey, BuildError, BuildKey, BuildValue, ConfiguredTargetKey};
use crate::build::nested::{Order, SetHandle};
use crate::build::package::{Package, RuleKind, Target};
use crate::build::BuildEnv;

type BuildStep = Step<BuildKey, BuildValue, BuildError>;
type Ctx<'a> = Context<'a, BuildKey, BuildValue, BuildError>;

/// Name of the provider carrying a target's default output files.
pub const FILES_PROVIDER: &str = "files";

#[derive(Debug, Clone, PartialEq)]
pub enum Provider {
    /// A layered set of artifacts.
    Files(SetHandle),
    /// String facts attached by rules and aspects.
    Info(Vec<String>),
}

/// Typed values a rule attaches to its configured target.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderSet {
    providers: BTreeMap<String, Provider>,
}

impl ProviderSet {
    pub fn insert(&mut self, name: impl Into<String>, provider: Provider) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn files(&self) -> Option<SetHandle> {
        match self.providers.get(FILES_PROVIDER) {
            Some(Provider::Files(h)) => Some(*h),
            _ => None,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Provider)> {
        self.providers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Folds another provider set in. Info providers concatenate (deduped,
    /// order kept); anything else keeps the first occurrence.
    pub fn merge_from(&mut self, other: &ProviderSet) {
        for (name, provider) in &other.providers {
            match (self.providers.get_mut(name), provider) {
                (Some(Provider::Info(mine)), Provider::Info(theirs)) => {
                    for item in theirs {
                        if !mine.contains(item) {
                            mine.push(item.clone());
                        }
                    }
                }
                (Some(_), _) => {}
                (None, p) => {
                    self.providers.insert(name.clone(), p.clone());
                }
            }
        }
    }
}

/// The computed value of a configured target.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguredTargetValue {
    pub label: Label,
    pub config_segment: String,
    pub providers: ProviderSet,
    /// Actions this target declared, addressed by index.
    pub actions: Vec<Arc<Action>>,
    /// Resolved rule dep edges (post-transition), for graph traversals.
    pub deps: Vec<ConfiguredTargetKey>,
}

enum DepRole {
    Src,
    Dep,
    Actual,
}

/// A rule dep after configuration and aspect resolution.
struct RuleDep {
    key: ConfiguredTargetKey,
    value: Arc<ConfiguredTargetValue>,
    aspects: Vec<Arc<AspectValue>>,
    /// Attribute text the dep was written as, for `$(location)`.
    written: String,
}

/// Evaluates one `ConfiguredTarget` key.
pub(crate) fn analyze_configured_target(
    env: &BuildEnv,
    key: &ConfiguredTargetKey,
    ctx: &mut Ctx<'_>,
) -> BuildStep {
    let config = match &key.config {
        Some(c) => c,
        None => {
            return Step::Err(BuildError::Internal(format!(
                "source target {} requested as configured target",
                key.label
            )));
        }
    };

    let package = match ctx.request(&BuildKey::Package(key.label.package.clone())) {
        None => return Step::NotReady,
        Some(Err(e)) => return Step::Forward(e),
        Some(Ok(v)) => match v.into_package() {
            Ok(p) => p,
            Err(e) => return Step::Err(e),
        },
    };
    let target = match package.targets.get(&key.label.name) {
        Some(t) => t.clone(),
        None => {
            let mut msg = format!("no such target `{}`", key.label);
            if package.has_errors() {
                msg.push_str(&format!(
                    " (package //{} has errors: {})",
                    package.path,
                    package.errors.iter().join("; ")
                ));
            }
            return Step::Err(BuildError::Input(msg));
        }
    };

    // Split attribute entries into plain source files and label deps.
    let mut file_srcs: Vec<String> = Vec::new();
    let mut edges: Vec<(Dependency, DepRole, String)> = Vec::new();
    let dep_config = DepConfig::Transition(target.transition.clone().unwrap_or(Transition::Keep));
    for src in &target.srcs {
        if src.starts_with(':') || src.starts_with("//") {
            let label = match Label::parse_in_package(src, &key.label.package) {
                Ok(l) => l,
                Err(e) => return Step::Err(BuildError::Input(e.to_string())),
            };
            edges.push((
                Dependency {
                    label,
                    config: dep_config.clone(),
                    aspects: target.aspects.clone(),
                },
                DepRole::Src,
                src.clone(),
            ));
        } else {
            if src.starts_with('/') || src.split('/').any(|s| s.is_empty() || s == "..") {
                return Step::Err(BuildError::Input(format!(
                    "{}: invalid source path `{}`",
                    key.label, src
                )));
            }
            file_srcs.push(src.clone());
        }
    }
    for dep in &target.deps {
        let label = match Label::parse_in_package(dep, &key.label.package) {
            Ok(l) => l,
            Err(e) => return Step::Err(BuildError::Input(e.to_string())),
        };
        edges.push((
            Dependency { label, config: dep_config.clone(), aspects: target.aspects.clone() },
            DepRole::Dep,
            dep.clone(),
        ));
    }
    if let Some(actual) = &target.actual {
        let label = match Label::parse_in_package(actual, &key.label.package) {
            Ok(l) => l,
            Err(e) => return Step::Err(BuildError::Input(e.to_string())),
        };
        edges.push((
            Dependency { label, config: dep_config.clone(), aspects: Vec::new() },
            DepRole::Actual,
            actual.clone(),
        ));
    }

    // Load the packages the dep labels point into, to tell rule targets from
    // source-file references.
    let dep_packages: Vec<String> =
        edges.iter().map(|(d, _, _)| d.label.package.clone()).unique().collect();
    let pkg_keys: Vec<BuildKey> =
        dep_packages.iter().map(|p| BuildKey::Package(p.clone())).collect();
    let mut packages: BTreeMap<String, Arc<Package>> = BTreeMap::new();
    packages.insert(package.path.clone(), Arc::clone(&package));
    match ctx.request_and_wait(&pkg_keys) {
        None => return Step::NotReady,
        Some(results) => {
            for (pkg_path, result) in dep_packages.iter().zip(results) {
                match result {
                    Err(e) => return Step::Forward(e),
                    Ok(v) => match v.into_package() {
                        Ok(p) => {
                            packages.insert(pkg_path.clone(), p);
                        }
                        Err(e) => return Step::Err(e),
                    },
                }
            }
        }
    }

    // Classify each edge and apply transitions. Edges that reach the same
    // (label, configuration) converge on one key via the evaluator.
    enum Classified {
        Rule { keys: Vec<ConfiguredTargetKey>, aspects: Vec<String>, written: String },
        File { artifact: Artifact, abs: std::path::PathBuf },
    }
    let mut classified: Vec<Classified> = Vec::new();
    for (dep, role, written) in &edges {
        let dep_pkg = &packages[&dep.label.package];
        if dep_pkg.targets.contains_key(&dep.label.name) {
            let configs = match &dep.config {
                DepConfig::Null => {
                    return Step::Err(BuildError::Internal(format!(
                        "null configuration on rule dep {}",
                        dep.label
                    )));
                }
                DepConfig::Explicit(c) => vec![(None, Arc::clone(c))],
                DepConfig::Transition(t) => match t.apply(config) {
                    Ok(cs) => cs,
                    Err(e) => return Step::Err(e),
                },
            };
            classified.push(Classified::Rule {
                keys: configs
                    .into_iter()
                    .map(|(_tag, c)| ConfiguredTargetKey::new(dep.label.clone(), Some(c)))
                    .collect(),
                aspects: dep.aspects.clone(),
                written: written.clone(),
            });
        } else {
            // Variant 1: a null-configuration dependency on a source file.
            let rel = format!(
                "{}{}{}",
                dep.label.package,
                if dep.label.package.is_empty() { "" } else { "/" },
                dep.label.name
            );
            let abs = env.workspace.source_path(&rel);
            classified.push(Classified::File {
                artifact: Artifact::Source { path: rel },
                abs,
            });
        }
    }

    // Request everything the classification needs in one wave: dep configured
    // targets, their aspects, and source-file stats.
    let mut wave: Vec<BuildKey> = Vec::new();
    for c in &classified {
        match c {
            Classified::Rule { keys, aspects, .. } => {
                for k in keys {
                    wave.push(BuildKey::ConfiguredTarget(k.clone()));
                    for aspect in aspects {
                        wave.push(BuildKey::Aspect(AspectKey {
                            base: k.clone(),
                            aspect: aspect.clone(),
                        }));
                    }
                }
            }
            Classified::File { abs, .. } => wave.push(BuildKey::FileStat(abs.clone())),
        }
    }
    let wave_results = match ctx.request_and_wait(&wave) {
        None => return Step::NotReady,
        Some(results) => results,
    };
    let mut by_key: BTreeMap<usize, Result<BuildValue, _>> = BTreeMap::new();
    for (i, r) in wave_results.into_iter().enumerate() {
        by_key.insert(i, r);
    }

    // Reassemble in classification order.
    let mut rule_deps: Vec<RuleDep> = Vec::new();
    let mut src_files: Vec<Artifact> = file_srcs
        .iter()
        .map(|name| Artifact::Source {
            path: format!(
                "{}{}{}",
                key.label.package,
                if key.label.package.is_empty() { "" } else { "/" },
                name
            ),
        })
        .collect();
    let mut actual_dep: Option<usize> = None;
    let mut cursor = 0usize;
    for (c, (dep, role, _)) in classified.iter().zip(edges.iter()) {
        match c {
            Classified::Rule { keys, aspects, written } => {
                for k in keys {
                    let value = match by_key.remove(&cursor).expect("wave result missing") {
                        Err(e) => return Step::Forward(e),
                        Ok(v) => match v.into_configured_target() {
                            Ok(v) => v,
                            Err(e) => return Step::Err(e),
                        },
                    };
                    cursor += 1;
                    let mut aspect_values = Vec::new();
                    for _ in aspects {
                        match by_key.remove(&cursor).expect("wave result missing") {
                            Err(e) => return Step::Forward(e),
                            Ok(v) => match v.into_aspect() {
                                Ok(a) => aspect_values.push(a),
                                Err(e) => return Step::Err(e),
                            },
                        }
                        cursor += 1;
                    }
                    if matches!(role, DepRole::Actual) {
                        actual_dep = Some(rule_deps.len());
                    }
                    rule_deps.push(RuleDep {
                        key: k.clone(),
                        value,
                        aspects: aspect_values,
                        written: written.clone(),
                    });
                }
            }
            Classified::File { artifact, abs } => {
                let stat = match by_key.remove(&cursor).expect("wave result missing") {
                    Err(e) => return Step::Forward(e),
                    Ok(v) => match v.into_file_stat() {
                        Ok(s) => s,
                        Err(e) => return Step::Err(e),
                    },
                };
                cursor += 1;
                if let FileState::Absent = stat {
                    return Step::Err(BuildError::Input(format!(
                        "no such target `{}`: not a rule, and {} does not exist",
                        dep.label,
                        abs.display()
                    )));
                }
                src_files.push(artifact.clone());
            }
        }
    }

    trace!("analyzing {:?}: {} rule deps, {} source files", key, rule_deps.len(), src_files.len());

    // Run the rule implementation.
    let result = match target.kind {
        RuleKind::Genrule => analyze_genrule(env, key, &target, &src_files, &rule_deps),
        RuleKind::Filegroup => analyze_filegroup(env, key, &src_files, &rule_deps),
        RuleKind::Alias => analyze_alias(key, actual_dep, &rule_deps),
        RuleKind::Symlink => analyze_symlink(env, key, &target),
    };
    let (mut providers, actions) = match result {
        Ok(pair) => pair,
        Err(e) => return Step::Err(e),
    };

    // Aspect results ride along on the target's provider set.
    for dep in &rule_deps {
        for aspect in &dep.aspects {
            providers.merge_from(&aspect.providers);
        }
    }

    Step::Ready(BuildValue::ConfiguredTarget(Arc::new(ConfiguredTargetValue {
        label: key.label.clone(),
        config_segment: key.config_segment(),
        providers,
        actions,
        deps: rule_deps.iter().map(|d| d.key.clone()).collect(),
    })))
}

type RuleResult = Result<(ProviderSet, Vec<Arc<Action>>), BuildError>;

fn analyze_genrule(
    env: &BuildEnv,
    key: &ConfiguredTargetKey,
    target: &Target,
    src_files: &[Artifact],
    rule_deps: &[RuleDep],
) -> RuleResult {
    let mut registry = ActionRegistry::new(key.clone(), &env.sets);

    let mut outputs = Vec::new();
    let mut out_paths: Vec<(String, String)> = Vec::new();
    for name in &target.outs {
        let path = registry.output_path(name)?;
        outputs.push(OutputSpec::File(path.clone()));
        out_paths.push((name.clone(), path));
    }
    for name in &target.out_dirs {
        let path = registry.output_path(name)?;
        outputs.push(OutputSpec::Tree(path.clone()));
        out_paths.push((name.clone(), path));
    }

    let children: Vec<SetHandle> =
        rule_deps.iter().filter_map(|d| d.value.providers.files()).collect();
    let inputs = env.sets.create(Order::Preorder, src_files.to_vec(), children);

    // Exactly the declared env subset, resolved against the client env.
    let mut action_env = BTreeMap::new();
    for name in &target.env {
        if let Some(value) = env.client_env.get(name) {
            action_env.insert(name.clone(), value.clone());
        }
    }

    let cmd = expand_cmd(
        env,
        key,
        target.cmd.as_deref().unwrap_or_default(),
        src_files,
        rule_deps,
        &out_paths,
    )?;
    let argv = vec!["/bin/sh".to_owned(), "-c".to_owned(), cmd];

    let artifacts = registry.register("Genrule", argv, action_env, inputs, outputs)?;

    let mut providers = ProviderSet::default();
    providers.insert(FILES_PROVIDER, Provider::Files(env.sets.leaf(artifacts)));
    Ok((providers, registry.finish()))
}

fn analyze_filegroup(
    env: &BuildEnv,
    _key: &ConfiguredTargetKey,
    src_files: &[Artifact],
    rule_deps: &[RuleDep],
) -> RuleResult {
    let children: Vec<SetHandle> =
        rule_deps.iter().filter_map(|d| d.value.providers.files()).collect();
    let files = env.sets.create(Order::Preorder, src_files.to_vec(), children);
    let mut providers = ProviderSet::default();
    providers.insert(FILES_PROVIDER, Provider::Files(files));
    Ok((providers, Vec::new()))
}

fn analyze_alias(
    key: &ConfiguredTargetKey,
    actual_dep: Option<usize>,
    rule_deps: &[RuleDep],
) -> RuleResult {
    let actual = actual_dep
        .and_then(|i| rule_deps.get(i))
        .ok_or_else(|| BuildError::Input(format!("{}: alias `actual` is not a rule", key.label)))?;
    Ok((actual.value.providers.clone(), Vec::new()))
}

fn analyze_symlink(env: &BuildEnv, key: &ConfiguredTargetKey, target: &Target) -> RuleResult {
    let mut registry = ActionRegistry::new(key.clone(), &env.sets);
    let path = registry.output_path(&target.outs[0])?;
    let link_target = target.link_target.clone().unwrap_or_default();
    let inputs = env.sets.empty();
    let artifacts = registry.register(
        "Symlink",
        Vec::new(),
        BTreeMap::new(),
        inputs,
        vec![OutputSpec::Symlink { path, target: link_target }],
    )?;
    let mut providers = ProviderSet::default();
    providers.insert(FILES_PROVIDER, Provider::Files(env.sets.leaf(artifacts)));
    Ok((providers, registry.finish()))
}

/// Expands `$(location X)`, `$(SRCS)`, `$(OUTS)`, `$@` and `$<` in a genrule
/// command.
fn expand_cmd(
    env: &BuildEnv,
    key: &ConfiguredTargetKey,
    cmd: &str,
    src_files: &[Artifact],
    rule_deps: &[RuleDep],
    out_paths: &[(String, String)],
) -> Result<String, BuildError> {
    let locate = |token: &str| -> Result<String, BuildError> {
        // Declared output name.
        if let Some((_, path)) = out_paths.iter().find(|(name, _)| name == token) {
            return Ok(path.clone());
        }
        // Plain source file name.
        for artifact in src_files {
            if let Artifact::Source { path } = artifact {
                if path.ends_with(token)
                    && (path.len() == token.len()
                        || path.as_bytes()[path.len() - token.len() - 1] == b'/')
                {
                    return Ok(path.clone());
                }
            }
        }
        // A label the rule depends on; must expand to exactly one file.
        if let Some(dep) = rule_deps.iter().find(|d| d.written == token) {
            let handle = dep.value.providers.files().ok_or_else(|| {
                BuildError::Input(format!(
                    "{}: $(location {}) target provides no files",
                    key.label, token
                ))
            })?;
            let files = env.sets.flatten(handle);
            if files.len() != 1 {
                return Err(BuildError::Input(format!(
                    "{}: $(location {}) expands to {} files, expected exactly 1",
                    key.label,
                    token,
                    files.len()
                )));
            }
            return Ok(files[0].exec_path().to_owned());
        }
        Err(BuildError::Input(format!("{}: unknown $(location {}) token", key.label, token)))
    };

    let mut out = String::with_capacity(cmd.len());
    let mut rest = cmd;
    while let Some(start) = rest.find("$(location ") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "$(location ".len()..];
        let end = after.find(')').ok_or_else(|| {
            BuildError::Input(format!("{}: unterminated $(location ...) in cmd", key.label))
        })?;
        out.push_str(&locate(after[..end].trim())?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    let all_srcs = src_files.iter().map(|a| a.exec_path()).join(" ");
    let all_outs = out_paths.iter().map(|(_, p)| p.as_str()).join(" ");
    let mut expanded = out.replace("$(SRCS)", &all_srcs).replace("$(OUTS)", &all_outs);
    if expanded.contains("$@") {
        if out_paths.len() != 1 {
            return Err(BuildError::Input(format!(
                "{}: `$@` requires exactly one output",
                key.label
            )));
        }
        expanded = expanded.replace("$@", &out_paths[0].1);
    }
    if expanded.contains("$<") {
        if src_files.len() != 1 {
            return Err(BuildError::Input(format!(
                "{}: `$<` requires exactly one direct source",
                key.label
            )));
        }
        expanded = expanded.replace("$<", src_files[0].exec_path());
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildSession;
    use crate::config::Config;
    use crate::workspace::Workspace;
    use std::sync::Arc;

    fn test_env() -> (tempfile::TempDir, std::sync::Arc<BuildEnv>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("WORKSPACE.skein"), b"").unwrap();
        let ws = Workspace::at_root(dir.path().to_owned());
        let config = Config::load(ws.root()).unwrap();
        let session = BuildSession::new(ws, config).unwrap();
        let env = Arc::clone(session.env());
        (dir, env)
    }

    fn key() -> ConfiguredTargetKey {
        let config = Arc::new(crate::build::configuration::Configuration::new(Default::default()));
        ConfiguredTargetKey::new(Label::new("p", "t"), Some(config))
    }

    fn src(path: &str) -> Artifact {
        Artifact::Source { path: path.to_owned() }
    }

    #[test]
    fn provider_sets_merge_info_and_keep_files() {
        let mut a = ProviderSet::default();
        a.insert("sources", Provider::Info(vec!["x".into()]));
        let mut b = ProviderSet::default();
        b.insert("sources", Provider::Info(vec!["x".into(), "y".into()]));
        b.insert("extra", Provider::Info(vec!["z".into()]));
        a.merge_from(&b);
        match a.get("sources") {
            Some(Provider::Info(items)) => assert_eq!(items, &["x".to_owned(), "y".to_owned()]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(a.has("extra"));
    }

    #[test]
    fn cmd_expansion_resolves_sources_and_outputs() {
        let (_dir, env) = test_env();
        let srcs = vec![src("p/in.txt")];
        let outs = vec![("out.txt".to_owned(), "out/cfg/p/out.txt".to_owned())];
        let expanded =
            expand_cmd(&env, &key(), "cat $(location in.txt) > $@", &srcs, &[], &outs).unwrap();
        assert_eq!(expanded, "cat p/in.txt > out/cfg/p/out.txt");

        let expanded = expand_cmd(&env, &key(), "join $(SRCS) into $(OUTS)", &srcs, &[], &outs).unwrap();
        assert_eq!(expanded, "join p/in.txt into out/cfg/p/out.txt");

        let expanded = expand_cmd(&env, &key(), "cp $< $@", &srcs, &[], &outs).unwrap();
        assert_eq!(expanded, "cp p/in.txt out/cfg/p/out.txt");
    }

    #[test]
    fn cmd_expansion_rejects_ambiguity_and_unknowns() {
        let (_dir, env) = test_env();
        let srcs = vec![src("p/a.txt"), src("p/b.txt")];
        let outs = vec![
            ("one".to_owned(), "out/cfg/p/one".to_owned()),
            ("two".to_owned(), "out/cfg/p/two".to_owned()),
        ];
        assert!(expand_cmd(&env, &key(), "echo $@", &srcs, &[], &outs).is_err());
        assert!(expand_cmd(&env, &key(), "echo $<", &srcs, &[], &outs).is_err());
        assert!(expand_cmd(&env, &key(), "echo $(location nope)", &srcs, &[], &outs).is_err());
        assert!(expand_cmd(&env, &key(), "echo $(location broken", &srcs, &[], &outs).is_err());
    }

    #[test]
    fn location_matches_whole_file_names_only() {
        let (_dir, env) = test_env();
        // "in.txt" must not match "main.txt".
        let srcs = vec![src("p/main.txt"), src("p/in.txt")];
        let outs = vec![("o".to_owned(), "out/cfg/p/o".to_owned())];
        let expanded =
            expand_cmd(&env, &key(), "cat $(location in.txt)", &srcs, &[], &outs).unwrap();
        assert_eq!(expanded, "cat p/in.txt");
    }
}
