//! Target pattern expansion.
//!
//! `//p:t` names one target, `//p:all` every rule in a package, `//dir/...`
//! every rule in every package under a directory. Recursive expansion walks
//! directory listings through the graph, so new packages invalidate it.

use std::sync::Arc;

use skein_data::{FileKind, FileState, Label, TargetPattern};
use skein_graph::{Context, Step};

use crate::build::keys::{BuildError, BuildKey, BuildValue};
use crate::build::package::PKG_FILE;
use crate::build::BuildEnv;

type BuildStep = Step<BuildKey, BuildValue, BuildError>;
type Ctx<'a> = Context<'a, BuildKey, BuildValue, BuildError>;

pub(crate) fn expand_pattern(env: &BuildEnv, pattern: &TargetPattern, ctx: &mut Ctx<'_>) -> BuildStep {
    match pattern {
        TargetPattern::Exact(label) => {
            Step::Ready(BuildValue::Patterns(Arc::new(vec![label.clone()])))
        }
        TargetPattern::AllInPackage(pkg) => {
            let package = match ctx.request(&BuildKey::Package(pkg.clone())) {
                None => return Step::NotReady,
                Some(Err(e)) => return Step::Forward(e),
                Some(Ok(v)) => match v.into_package() {
                    Ok(p) => p,
                    Err(e) => return Step::Err(e),
                },
            };
            let labels: Vec<Label> =
                package.targets.keys().map(|name| Label::new(pkg.clone(), name.clone())).collect();
            Step::Ready(BuildValue::Patterns(Arc::new(labels)))
        }
        TargetPattern::Recursive(dir) => {
            let abs_dir = if dir.is_empty() {
                env.workspace.root().to_owned()
            } else {
                env.workspace.source_path(dir)
            };

            // Does this directory itself hold a package?
            let marker = abs_dir.join(PKG_FILE);
            let marker_state = match ctx.request(&BuildKey::FileStat(marker)) {
                None => return Step::NotReady,
                Some(Err(e)) => return Step::Forward(e),
                Some(Ok(v)) => match v.into_file_stat() {
                    Ok(s) => s,
                    Err(e) => return Step::Err(e),
                },
            };

            // Children first, collecting sub-results in one wave.
            let listing = match ctx.request(&BuildKey::DirListing(abs_dir)) {
                None => return Step::NotReady,
                Some(Err(e)) => return Step::Forward(e),
                Some(Ok(v)) => match v.into_dir_listing() {
                    Ok(l) => l,
                    Err(e) => return Step::Err(e),
                },
            };
            let mut wave: Vec<BuildKey> = Vec::new();
            if let FileState::Regular { .. } = marker_state {
                wave.push(BuildKey::Patterns(TargetPattern::AllInPackage(dir.clone())));
            }
            for entry in listing.iter() {
                if entry.kind != FileKind::Directory || entry.name.starts_with('.') {
                    continue;
                }
                let sub = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir, entry.name)
                };
                wave.push(BuildKey::Patterns(TargetPattern::Recursive(sub)));
            }

            let results = match ctx.request_and_wait(&wave) {
                None => return Step::NotReady,
                Some(results) => results,
            };
            let mut labels: Vec<Label> = Vec::new();
            for result in results {
                match result {
                    Err(e) => return Step::Forward(e),
                    Ok(v) => match v.into_patterns() {
                        Ok(sub) => labels.extend(sub.iter().cloned()),
                        Err(e) => return Step::Err(e),
                    },
                }
            }
            labels.sort();
            labels.dedup();
            Step::Ready(BuildValue::Patterns(Arc::new(labels)))
        }
    }
}
