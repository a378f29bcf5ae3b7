//! Package loading.
//!
//! A package is one directory holding a `PKG.toml` package-definition file.
//! The file is declarative data: each `[targets.<name>]` table is a rule
//! instance. `include` entries name extension files whose `[vars]` bindings
//! substitute into `${NAME}` references in rule attributes.
//!
//! A malformed package still yields a Package value: the errors are recorded
//! and the partial target map kept, so downstream consumers can name the
//! targets that do exist. Packages with errors are re-evaluated every build.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use log::trace;
use serde_derive::Deserialize;

use skein_data::FileState;
use skein_graph::{Context, Step};

use crate::build::configuration::Transition;
use crate::build::keys::{BuildError, BuildKey, BuildValue, GlobKey};
use crate::build::BuildEnv;

/// Name of the package-definition file that marks a directory as a package.
pub const PKG_FILE: &str = "PKG.toml";

/// Name of the workspace marker file.
pub const WORKSPACE_FILE: &str = "WORKSPACE.skein";

type BuildStep = Step<BuildKey, BuildValue, BuildError>;
type Ctx<'a> = Context<'a, BuildKey, BuildValue, BuildError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Genrule,
    Filegroup,
    Alias,
    Symlink,
}

impl RuleKind {
    fn parse(s: &str) -> Option<RuleKind> {
        match s {
            "genrule" => Some(RuleKind::Genrule),
            "filegroup" => Some(RuleKind::Filegroup),
            "alias" => Some(RuleKind::Alias),
            "symlink" => Some(RuleKind::Symlink),
            _ => None,
        }
    }
}

/// A rule instance after variable substitution and glob expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub kind: RuleKind,
    /// Plain file names (package-relative) and labels (`:x`, `//p:x`).
    pub srcs: Vec<String>,
    /// Declared output file names, package-relative.
    pub outs: Vec<String>,
    /// Declared output directories (tree artifacts), package-relative.
    pub out_dirs: Vec<String>,
    pub cmd: Option<String>,
    pub deps: Vec<String>,
    /// Env var names the action consumes from the client environment.
    pub env: Vec<String>,
    /// Alias referent.
    pub actual: Option<String>,
    /// Symlink rule: the textual link target.
    pub link_target: Option<String>,
    pub transition: Option<Transition>,
    /// Aspects applied along this rule's dep edges.
    pub aspects: Vec<String>,
}

/// The evaluated form of one package-definition file.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub path: String,
    pub targets: BTreeMap<String, Target>,
    /// Extension files loaded, workspace-relative.
    pub includes: Vec<String>,
    /// Globs observed while loading.
    pub globs: Vec<GlobKey>,
    pub errors: Vec<String>,
}

impl Package {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

// Raw deserialization shapes for PKG.toml.

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawPackage {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    targets: BTreeMap<String, RawTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    kind: String,
    #[serde(default)]
    srcs: Vec<String>,
    #[serde(default)]
    outs: Vec<String>,
    #[serde(default)]
    out_dirs: Vec<String>,
    cmd: Option<String>,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    actual: Option<String>,
    link_target: Option<String>,
    glob: Option<RawGlob>,
    transition: Option<RawTransition>,
    #[serde(default)]
    aspects: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGlob {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default = "default_true")]
    exclude_directories: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTransition {
    kind: String,
    #[serde(default)]
    set: BTreeMap<String, String>,
    #[serde(default)]
    branches: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawExtension {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    vars: BTreeMap<String, String>,
}

/// Evaluates the `Package` function for one package path.
pub(crate) fn load_package(env: &BuildEnv, pkg_path: &str, ctx: &mut Ctx<'_>) -> BuildStep {
    let pkg_file = env.workspace.source_path(&join_rel(pkg_path, PKG_FILE));

    // Existence is a dep: creating or deleting PKG.toml invalidates us.
    let stat = match ctx.request(&BuildKey::FileStat(pkg_file.clone())) {
        None => return Step::NotReady,
        Some(Err(e)) => return Step::Forward(e),
        Some(Ok(v)) => match v.into_file_stat() {
            Ok(s) => s,
            Err(e) => return Step::Err(e),
        },
    };
    match stat {
        FileState::Regular { .. } => {}
        FileState::Absent => {
            return Step::Err(BuildError::Input(format!("no such package `//{}`", pkg_path)));
        }
        _ => {
            return Step::Err(BuildError::Input(format!(
                "package marker `{}` is not a regular file",
                pkg_file.display()
            )));
        }
    }
    // Content is a dep through the digest, so edits re-run us while touches
    // re-clean.
    match ctx.request(&BuildKey::FileDigest(pkg_file.clone())) {
        None => return Step::NotReady,
        Some(Err(e)) => return Step::Forward(e),
        Some(Ok(_)) => {}
    }

    let bytes = match env.vfs.read(&pkg_file) {
        Ok(b) => b,
        Err(e) => return Step::Err(BuildError::io(e, pkg_file.display())),
    };
    let text = String::from_utf8_lossy(&bytes);
    let raw: RawPackage = match toml::from_str(&text) {
        Ok(raw) => raw,
        Err(e) => {
            // Malformed file: a package value flagged with the error, with
            // whatever could be salvaged (here: nothing).
            return Step::Ready(BuildValue::Package(Arc::new(Package {
                path: pkg_path.to_owned(),
                targets: BTreeMap::new(),
                includes: Vec::new(),
                globs: Vec::new(),
                errors: vec![format!("{}: {}", pkg_file.display(), e)],
            })));
        }
    };

    // Resolve extensions first; each include is a dep key of its own.
    let mut vars = BTreeMap::new();
    let include_keys: Vec<BuildKey> = raw
        .include
        .iter()
        .map(|p| BuildKey::Extension(normalize_include(pkg_path, p)))
        .collect();
    match ctx.request_and_wait(&include_keys) {
        None => return Step::NotReady,
        Some(results) => {
            for result in results {
                match result {
                    Err(e) => return Step::Forward(e),
                    Ok(v) => match v.into_extension() {
                        Ok(bindings) => {
                            for (k, val) in bindings.iter() {
                                vars.insert(k.clone(), val.clone());
                            }
                        }
                        Err(e) => return Step::Err(e),
                    },
                }
            }
        }
    }

    // Request every glob the package declares before assembling targets.
    let mut glob_keys = Vec::new();
    for (name, target) in &raw.targets {
        if let Some(glob) = &target.glob {
            match glob_key_for(pkg_path, name, glob, &vars) {
                Ok(key) => glob_keys.push((name.clone(), key)),
                Err(_) => {} // reported below during assembly
            }
        }
    }
    let mut glob_results: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let request_keys: Vec<BuildKey> =
        glob_keys.iter().map(|(_, k)| BuildKey::Glob(k.clone())).collect();
    match ctx.request_and_wait(&request_keys) {
        None => return Step::NotReady,
        Some(results) => {
            for ((name, _), result) in glob_keys.iter().zip(results) {
                match result {
                    Err(e) => return Step::Forward(e),
                    Ok(v) => match v.into_glob() {
                        Ok(matches) => {
                            glob_results.insert(name.clone(), (*matches).clone());
                        }
                        Err(e) => return Step::Err(e),
                    },
                }
            }
        }
    }

    let mut package = Package {
        path: pkg_path.to_owned(),
        targets: BTreeMap::new(),
        includes: raw.include.iter().map(|p| normalize_include(pkg_path, p)).collect(),
        globs: glob_keys.iter().map(|(_, k)| k.clone()).collect(),
        errors: Vec::new(),
    };

    for (name, raw_target) in &raw.targets {
        match assemble_target(pkg_path, name, raw_target, &vars, glob_results.get(name)) {
            Ok(target) => {
                package.targets.insert(name.clone(), target);
            }
            Err(msg) => package.errors.push(format!("//{}:{}: {}", pkg_path, name, msg)),
        }
    }
    trace!("loaded package //{}: {} targets", pkg_path, package.targets.len());
    Step::Ready(BuildValue::Package(Arc::new(package)))
}

/// Evaluates the `Extension` function: the merged `[vars]` bindings of one
/// extension file, including its own transitive includes. Circular includes
/// surface as cycle errors on these keys.
pub(crate) fn load_extension(env: &BuildEnv, ext_path: &str, ctx: &mut Ctx<'_>) -> BuildStep {
    let abs = env.workspace.source_path(ext_path);
    let stat = match ctx.request(&BuildKey::FileStat(abs.clone())) {
        None => return Step::NotReady,
        Some(Err(e)) => return Step::Forward(e),
        Some(Ok(v)) => match v.into_file_stat() {
            Ok(s) => s,
            Err(e) => return Step::Err(e),
        },
    };
    if let FileState::Absent = stat {
        return Step::Err(BuildError::Input(format!("no such extension file `{}`", ext_path)));
    }
    match ctx.request(&BuildKey::FileDigest(abs.clone())) {
        None => return Step::NotReady,
        Some(Err(e)) => return Step::Forward(e),
        Some(Ok(_)) => {}
    }

    let bytes = match env.vfs.read(&abs) {
        Ok(b) => b,
        Err(e) => return Step::Err(BuildError::io(e, abs.display())),
    };
    let raw: RawExtension = match toml::from_str(&String::from_utf8_lossy(&bytes)) {
        Ok(raw) => raw,
        Err(e) => return Step::Err(BuildError::Input(format!("{}: {}", abs.display(), e))),
    };

    let parent = parent_of(ext_path);
    let include_keys: Vec<BuildKey> = raw
        .include
        .iter()
        .map(|p| BuildKey::Extension(normalize_include(parent, p)))
        .collect();
    let mut vars = BTreeMap::new();
    match ctx.request_and_wait(&include_keys) {
        None => return Step::NotReady,
        Some(results) => {
            for result in results {
                match result {
                    Err(e) => return Step::Forward(e),
                    Ok(v) => match v.into_extension() {
                        Ok(bindings) => vars.extend(bindings.iter().map(|(k, v)| (k.clone(), v.clone()))),
                        Err(e) => return Step::Err(e),
                    },
                }
            }
        }
    }
    // Own bindings override included ones.
    vars.extend(raw.vars);
    Step::Ready(BuildValue::Extension(Arc::new(vars)))
}

fn glob_key_for(
    pkg_path: &str,
    target: &str,
    raw: &RawGlob,
    vars: &BTreeMap<String, String>,
) -> Result<GlobKey, String> {
    if raw.include.is_empty() {
        return Err(format!("target `{}` declares a glob with no include patterns", target));
    }
    let include = substitute_all(&raw.include, vars)?;
    let exclude = substitute_all(&raw.exclude, vars)?;
    Ok(GlobKey {
        package: pkg_path.to_owned(),
        include,
        exclude,
        exclude_directories: raw.exclude_directories,
    })
}

fn assemble_target(
    pkg_path: &str,
    name: &str,
    raw: &RawTarget,
    vars: &BTreeMap<String, String>,
    glob_matches: Option<&Vec<String>>,
) -> Result<Target, String> {
    if name.is_empty() || name.contains('/') || name.contains(':') {
        return Err("invalid target name".to_owned());
    }
    let kind = RuleKind::parse(&raw.kind).ok_or_else(|| format!("unknown rule kind `{}`", raw.kind))?;

    let mut srcs = substitute_all(&raw.srcs, vars)?;
    if let Some(matches) = glob_matches {
        // Glob matches are already sorted and deduplicated.
        for m in matches {
            if !srcs.contains(m) {
                srcs.push(m.clone());
            }
        }
    } else if raw.glob.is_some() && glob_matches.is_none() {
        // Glob key construction failed earlier.
        glob_key_for(pkg_path, name, raw.glob.as_ref().unwrap(), vars)?;
    }

    let outs = substitute_all(&raw.outs, vars)?;
    let out_dirs = substitute_all(&raw.out_dirs, vars)?;
    let cmd = match &raw.cmd {
        Some(c) => Some(substitute(c, vars)?),
        None => None,
    };

    match kind {
        RuleKind::Genrule => {
            if cmd.is_none() {
                return Err("genrule requires `cmd`".to_owned());
            }
            if outs.is_empty() && out_dirs.is_empty() {
                return Err("genrule requires at least one of `outs` or `out_dirs`".to_owned());
            }
        }
        RuleKind::Alias => {
            if raw.actual.is_none() {
                return Err("alias requires `actual`".to_owned());
            }
        }
        RuleKind::Symlink => {
            if raw.link_target.is_none() {
                return Err("symlink requires `link_target`".to_owned());
            }
            if outs.len() != 1 {
                return Err("symlink requires exactly one entry in `outs`".to_owned());
            }
        }
        RuleKind::Filegroup => {
            if !outs.is_empty() {
                return Err("filegroup does not produce outputs".to_owned());
            }
        }
    }

    let transition = match &raw.transition {
        None => None,
        Some(t) => Some(parse_transition(t)?),
    };

    Ok(Target {
        name: name.to_owned(),
        kind,
        srcs,
        outs,
        out_dirs,
        cmd,
        deps: substitute_all(&raw.deps, vars)?,
        env: raw.env.clone(),
        actual: raw.actual.clone(),
        link_target: raw.link_target.clone(),
        transition,
        aspects: raw.aspects.clone(),
    })
}

fn parse_transition(raw: &RawTransition) -> Result<Transition, String> {
    match raw.kind.as_str() {
        "keep" => Ok(Transition::Keep),
        "patch" => Ok(Transition::Patch(raw.set.clone())),
        "split" => {
            if raw.branches.is_empty() {
                return Err("split transition requires `branches`".to_owned());
            }
            Ok(Transition::Split(
                raw.branches.iter().map(|(tag, set)| (tag.clone(), set.clone())).collect(),
            ))
        }
        other => Err(format!("unknown transition kind `{}`", other)),
    }
}

/// Replaces `${NAME}` references from the extension bindings. References to
/// names no extension defines pass through untouched; genrule commands use
/// the same syntax for shell parameters.
pub(crate) fn substitute(s: &str, vars: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = match after.find('}') {
            Some(end) => end,
            None => return Err(format!("unterminated `${{` in `{}`", s)),
        };
        let name = &after[..end];
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn substitute_all(items: &[String], vars: &BTreeMap<String, String>) -> Result<Vec<String>, String> {
    items.iter().map(|s| substitute(s, vars)).collect()
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Include paths starting with `//` are workspace-relative; anything else is
/// relative to the including file's directory.
fn normalize_include(base_dir: &str, include: &str) -> String {
    if let Some(ws_rel) = include.strip_prefix("//") {
        ws_rel.to_owned()
    } else {
        join_rel(base_dir, include)
    }
}

/// A package's directory, joined under the workspace source root.
pub(crate) fn package_dir(env: &BuildEnv, pkg_path: &str) -> std::path::PathBuf {
    if pkg_path.is_empty() {
        env.workspace.root().to_owned()
    } else {
        env.workspace.root().join(Path::new(pkg_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_expands_vars() {
        let vars: BTreeMap<String, String> =
            vec![("CC".to_owned(), "gcc".to_owned())].into_iter().collect();
        assert_eq!(substitute("${CC} -o x", &vars).unwrap(), "gcc -o x");
        assert_eq!(substitute("no vars", &vars).unwrap(), "no vars");
        // Unknown names stay intact: the shell owns that syntax.
        assert_eq!(substitute("${HOME:-x}", &vars).unwrap(), "${HOME:-x}");
        assert!(substitute("${oops", &vars).is_err());
    }

    #[test]
    fn include_paths_resolve_relative_and_absolute() {
        assert_eq!(normalize_include("a/b", "defs.toml"), "a/b/defs.toml");
        assert_eq!(normalize_include("a/b", "//tools/defs.toml"), "tools/defs.toml");
        assert_eq!(normalize_include("", "defs.toml"), "defs.toml");
    }

    #[test]
    fn raw_target_validation() {
        let raw: RawPackage = toml::from_str(
            r#"
            [targets.gen]
            kind = "genrule"
            cmd = "true"
            outs = ["o"]

            [targets.broken]
            kind = "genrule"
            outs = ["x"]
            "#,
        )
        .unwrap();
        let vars = BTreeMap::new();
        assert!(assemble_target("p", "gen", &raw.targets["gen"], &vars, None).is_ok());
        let err = assemble_target("p", "broken", &raw.targets["broken"], &vars, None).unwrap_err();
        assert!(err.contains("cmd"));
    }

    #[test]
    fn unknown_rule_kind_is_an_error() {
        let raw: RawPackage = toml::from_str(
            r#"
            [targets.x]
            kind = "cc_binary"
            "#,
        )
        .unwrap();
        let err = assemble_target("p", "x", &raw.targets["x"], &BTreeMap::new(), None).unwrap_err();
        assert!(err.contains("unknown rule kind"));
    }

    #[test]
    fn transitions_parse() {
        let raw: RawPackage = toml::from_str(
            r#"
            [targets.t]
            kind = "filegroup"
            [targets.t.transition]
            kind = "patch"
            [targets.t.transition.set]
            mode = "opt"
            "#,
        )
        .unwrap();
        let target = assemble_target("p", "t", &raw.targets["t"], &BTreeMap::new(), None).unwrap();
        match target.transition {
            Some(Transition::Patch(set)) => assert_eq!(set.get("mode").unwrap(), "opt"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
