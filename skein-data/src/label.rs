//! Target labels and target patterns.
//!
//! A label is `//path/to/package:name`. `//path/to/package` is shorthand for
//! `//path/to/package:package` (the last path segment). Patterns extend
//! labels with `:all` (every target in a package) and `/...` (every target
//! under a directory).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    /// Workspace-relative package directory, `/`-separated, no leading or
    /// trailing slash. The root package is the empty string.
    pub package: String,
    /// Target name within the package.
    pub name: String,
}

impl Label {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Label {
        Label { package: package.into(), name: name.into() }
    }

    /// Parses an absolute label, applying the `//a/b` == `//a/b:b` shorthand.
    pub fn parse(s: &str) -> Result<Label, LabelError> {
        let rest = s
            .strip_prefix("//")
            .ok_or_else(|| LabelError::new(s, "labels must start with `//`"))?;

        let (package, name) = match rest.find(':') {
            Some(idx) => {
                let (pkg, name) = rest.split_at(idx);
                (pkg, &name[1..])
            }
            None => {
                let name = rest.rsplit('/').next().unwrap_or(rest);
                (rest, name)
            }
        };

        if name.is_empty() {
            return Err(LabelError::new(s, "empty target name"));
        }
        validate_package(s, package)?;
        validate_name(s, name)?;

        Ok(Label { package: package.to_owned(), name: name.to_owned() })
    }

    /// Parses a label that may be package-relative (`:name`).
    pub fn parse_in_package(s: &str, package: &str) -> Result<Label, LabelError> {
        if let Some(name) = s.strip_prefix(':') {
            validate_name(s, name)?;
            return Ok(Label { package: package.to_owned(), name: name.to_owned() });
        }
        Label::parse(s)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}", self.package, self.name)
    }
}

impl FromStr for Label {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Label, LabelError> {
        Label::parse(s)
    }
}

fn validate_package(label: &str, package: &str) -> Result<(), LabelError> {
    if package.starts_with('/') || package.ends_with('/') {
        return Err(LabelError::new(label, "package path must not start or end with `/`"));
    }
    for segment in package.split('/') {
        if package.is_empty() {
            break;
        }
        if segment.is_empty() {
            return Err(LabelError::new(label, "empty package path segment"));
        }
        if segment == "." || segment == ".." {
            return Err(LabelError::new(label, "package path must not contain `.` or `..`"));
        }
    }
    Ok(())
}

fn validate_name(label: &str, name: &str) -> Result<(), LabelError> {
    if name.contains('/') || name.contains(':') {
        return Err(LabelError::new(label, "target name must not contain `/` or `:`"));
    }
    Ok(())
}

/// A malformed label or pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelError {
    pub input: String,
    pub reason: &'static str,
}

impl LabelError {
    fn new(input: &str, reason: &'static str) -> LabelError {
        LabelError { input: input.to_owned(), reason }
    }
}

impl fmt::Display for LabelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid label `{}`: {}", self.input, self.reason)
    }
}

impl std::error::Error for LabelError {}

/// A command-line target pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPattern {
    /// A single target.
    Exact(Label),
    /// `//pkg:all` -- every rule target in one package.
    AllInPackage(String),
    /// `//dir/...` -- every rule target in every package under a directory.
    Recursive(String),
}

impl TargetPattern {
    pub fn parse(s: &str) -> Result<TargetPattern, LabelError> {
        if let Some(dir) = s.strip_suffix("/...") {
            let dir = dir
                .strip_prefix("//")
                .ok_or_else(|| LabelError::new(s, "patterns must start with `//`"))?;
            validate_package(s, dir)?;
            return Ok(TargetPattern::Recursive(dir.to_owned()));
        }
        if let Some(pkg) = s.strip_suffix(":all") {
            let pkg = pkg
                .strip_prefix("//")
                .ok_or_else(|| LabelError::new(s, "patterns must start with `//`"))?;
            validate_package(s, pkg)?;
            return Ok(TargetPattern::AllInPackage(pkg.to_owned()));
        }
        Ok(TargetPattern::Exact(Label::parse(s)?))
    }
}

impl fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPattern::Exact(label) => label.fmt(f),
            TargetPattern::AllInPackage(pkg) => write!(f, "//{}:all", pkg),
            TargetPattern::Recursive(dir) => write!(f, "//{}/...", dir),
        }
    }
}
