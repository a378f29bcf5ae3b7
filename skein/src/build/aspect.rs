//! Aspects: second-order computations over configured targets.
//!
//! An aspect runs against a configured-target node and produces additional
//! providers. Application is filtered by the providers actually present on
//! the underlying target; a missing required provider drops the aspect
//! silently, because rules routinely over-approximate their declarations.
//! Aspects may require other aspects on the same node and propagate along
//! the target's dep edges.

use std::sync::Arc;

use skein_graph::{Context, Step};

use crate::build::keys::{AspectKey, BuildError, BuildKey, BuildValue};
use crate::build::target::{ConfiguredTargetValue, Provider, ProviderSet, FILES_PROVIDER};
use crate::build::BuildEnv;

type BuildStep = Step<BuildKey, BuildValue, BuildError>;
type Ctx<'a> = Context<'a, BuildKey, BuildValue, BuildError>;

/// The value of one aspect application. Empty when the aspect was dropped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AspectValue {
    pub providers: ProviderSet,
}

struct AspectDef {
    name: &'static str,
    /// Aspects that must be computed on the same node first.
    requires: &'static [&'static str],
    /// Provider the underlying target must expose, or the aspect is dropped.
    required_provider: &'static str,
    implementation: fn(&AspectInputs<'_>) -> ProviderSet,
}

struct AspectInputs<'a> {
    env: &'a BuildEnv,
    base: &'a ConfiguredTargetValue,
    /// Values of the aspects named in `requires`, same order.
    required: &'a [Arc<AspectValue>],
    /// This aspect's values on the base target's deps.
    dep_values: &'a [Arc<AspectValue>],
}

/// Collects the workspace-relative paths of all transitive source files:
/// sources exposed directly (filegroups) plus sources consumed by the
/// target's actions.
fn sources_impl(inputs: &AspectInputs<'_>) -> ProviderSet {
    let mut paths: Vec<String> = Vec::new();
    if let Some(files) = inputs.base.providers.files() {
        inputs.env.sets.for_each(files, |artifact| {
            if artifact.is_source() {
                paths.push(artifact.exec_path().to_owned());
            }
        });
    }
    for action in &inputs.base.actions {
        inputs.env.sets.for_each(action.inputs, |artifact| {
            if artifact.is_source() {
                paths.push(artifact.exec_path().to_owned());
            }
        });
    }
    for dep in inputs.dep_values {
        if let Some(Provider::Info(theirs)) = dep.providers.get("sources") {
            for p in theirs {
                if !paths.contains(p) {
                    paths.push(p.clone());
                }
            }
        }
    }
    paths.sort();
    paths.dedup();
    let mut out = ProviderSet::default();
    out.insert("sources", Provider::Info(paths));
    out
}

/// Counts the sources collected by the `sources` aspect.
fn source_count_impl(inputs: &AspectInputs<'_>) -> ProviderSet {
    let count = inputs
        .required
        .first()
        .and_then(|v| match v.providers.get("sources") {
            Some(Provider::Info(paths)) => Some(paths.len()),
            _ => None,
        })
        .unwrap_or(0);
    let mut out = ProviderSet::default();
    out.insert("source_count", Provider::Info(vec![count.to_string()]));
    out
}

const ASPECTS: &[AspectDef] = &[
    AspectDef {
        name: "sources",
        requires: &[],
        required_provider: FILES_PROVIDER,
        implementation: sources_impl,
    },
    AspectDef {
        name: "source_count",
        requires: &["sources"],
        required_provider: FILES_PROVIDER,
        implementation: source_count_impl,
    },
];

fn lookup(name: &str) -> Option<&'static AspectDef> {
    ASPECTS.iter().find(|a| a.name == name)
}

/// Evaluates one `Aspect` key.
pub(crate) fn apply_aspect(env: &BuildEnv, key: &AspectKey, ctx: &mut Ctx<'_>) -> BuildStep {
    let def = match lookup(&key.aspect) {
        Some(def) => def,
        None => {
            return Step::Err(BuildError::Input(format!("unknown aspect `{}`", key.aspect)));
        }
    };

    let base = match ctx.request(&BuildKey::ConfiguredTarget(key.base.clone())) {
        None => return Step::NotReady,
        Some(Err(e)) => return Step::Forward(e),
        Some(Ok(v)) => match v.into_configured_target() {
            Ok(v) => v,
            Err(e) => return Step::Err(e),
        },
    };

    // Provider filter: drop silently, no warning.
    if !base.providers.has(def.required_provider) {
        return Step::Ready(BuildValue::Aspect(Arc::new(AspectValue::default())));
    }

    // Required aspects on the same node, then propagation along dep edges.
    let mut wave: Vec<BuildKey> = def
        .requires
        .iter()
        .map(|r| {
            BuildKey::Aspect(AspectKey { base: key.base.clone(), aspect: (*r).to_owned() })
        })
        .collect();
    let required_len = wave.len();
    wave.extend(base.deps.iter().map(|dep| {
        BuildKey::Aspect(AspectKey { base: dep.clone(), aspect: key.aspect.clone() })
    }));

    let results = match ctx.request_and_wait(&wave) {
        None => return Step::NotReady,
        Some(results) => results,
    };
    let mut values = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Err(e) => return Step::Forward(e),
            Ok(v) => match v.into_aspect() {
                Ok(a) => values.push(a),
                Err(e) => return Step::Err(e),
            },
        }
    }
    let (required, dep_values) = values.split_at(required_len);

    let providers = (def.implementation)(&AspectInputs { env, base: &base, required, dep_values });
    Step::Ready(BuildValue::Aspect(Arc::new(AspectValue { providers })))
}
