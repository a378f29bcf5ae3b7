//! Analysis-only queries over target relationships.
//!
//! Supported expressions:
//!   `<pattern>`            -- the targets a pattern matches
//!   `deps(expr)`           -- transitive dependencies, matched targets included
//!   `rdeps(expr)`          -- targets anywhere in the workspace depending on expr
//!   `aspect(name, expr)`   -- providers an aspect computes on the matched targets
//!
//! Queries never execute actions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;

use skein_data::{Label, TargetPattern};

use crate::build::keys::{AspectKey, BuildKey, BuildValue, ConfiguredTargetKey};
use crate::build::target::Provider;
use crate::build::{format_error, BuildSession};

#[derive(Debug, PartialEq)]
enum QueryExpr {
    Pattern(TargetPattern),
    Deps(Box<QueryExpr>),
    Rdeps(Box<QueryExpr>),
    Aspect(String, Box<QueryExpr>),
}

lazy_static! {
    static ref CALL: Regex = Regex::new(r"^(deps|rdeps|aspect)\((.*)\)$").unwrap();
}

fn parse(expr: &str) -> Result<QueryExpr> {
    let expr = expr.trim();
    if let Some(caps) = CALL.captures(expr) {
        let args = caps.get(2).map_or("", |m| m.as_str()).trim();
        return Ok(match caps.get(1).map_or("", |m| m.as_str()) {
            "deps" => QueryExpr::Deps(Box::new(parse(args)?)),
            "rdeps" => QueryExpr::Rdeps(Box::new(parse(args)?)),
            "aspect" => {
                let (name, rest) = args
                    .split_once(',')
                    .ok_or_else(|| anyhow!("aspect(NAME, expr) requires two arguments"))?;
                QueryExpr::Aspect(name.trim().to_owned(), Box::new(parse(rest)?))
            }
            _ => unreachable!(),
        });
    }
    Ok(QueryExpr::Pattern(
        TargetPattern::parse(expr).map_err(|e| anyhow!("bad query expression: {}", e))?,
    ))
}

pub(crate) fn run_query(session: &mut BuildSession, expr: &str) -> Result<Vec<String>> {
    let parsed = parse(expr)?;
    let mut runner = QueryRunner::new(session);
    runner.eval(&parsed)
}

struct QueryRunner<'a> {
    session: &'a mut BuildSession,
}

impl<'a> QueryRunner<'a> {
    fn new(session: &'a mut BuildSession) -> QueryRunner<'a> {
        QueryRunner { session }
    }

    fn eval(&mut self, expr: &QueryExpr) -> Result<Vec<String>> {
        match expr {
            QueryExpr::Pattern(pattern) => {
                Ok(self.expand(pattern)?.iter().map(Label::to_string).collect())
            }
            QueryExpr::Deps(sub) => {
                let roots = self.labels_of(sub)?;
                let analyzed = self.analyze(&roots)?;
                let mut out: BTreeSet<String> = BTreeSet::new();
                let mut pending: Vec<ConfiguredTargetKey> = analyzed.keys().cloned().collect();
                let mut seen: HashSet<ConfiguredTargetKey> = HashSet::new();
                while let Some(key) = pending.pop() {
                    if !seen.insert(key.clone()) {
                        continue;
                    }
                    out.insert(key.label.to_string());
                    if let Some(BuildValue::ConfiguredTarget(value)) = self
                        .session
                        .engine()
                        .value_of(&BuildKey::ConfiguredTarget(key))
                    {
                        pending.extend(value.deps.iter().cloned());
                    }
                }
                Ok(out.into_iter().collect())
            }
            QueryExpr::Rdeps(sub) => {
                let wanted: BTreeSet<String> =
                    self.labels_of(sub)?.iter().map(Label::to_string).collect();
                // Universe: every target in the workspace.
                let universe = self.expand(&TargetPattern::Recursive(String::new()))?;
                let analyzed = self.analyze(&universe)?;
                // A target matches when any of its transitive deps is wanted.
                let mut out: BTreeSet<String> = BTreeSet::new();
                for key in analyzed.keys() {
                    if self.reaches(key, &wanted) {
                        out.insert(key.label.to_string());
                    }
                }
                Ok(out.into_iter().collect())
            }
            QueryExpr::Aspect(name, sub) => {
                let labels = self.labels_of(sub)?;
                let analyzed = self.analyze(&labels)?;
                let aspect_keys: Vec<BuildKey> = analyzed
                    .keys()
                    .map(|base| {
                        BuildKey::Aspect(AspectKey { base: base.clone(), aspect: name.clone() })
                    })
                    .collect();
                let result = self
                    .session
                    .engine()
                    .evaluate(&aspect_keys, self.session_options());
                let mut out = Vec::new();
                for (key, value) in result.roots {
                    let base = match &key {
                        BuildKey::Aspect(a) => a.base.label.to_string(),
                        _ => continue,
                    };
                    match value {
                        Err(e) => return Err(anyhow!(format_error(&e))),
                        Ok(BuildValue::Aspect(aspect)) => {
                            for (pname, provider) in aspect.providers.iter() {
                                if let Provider::Info(items) = provider {
                                    for item in items {
                                        out.push(format!("{}: {} = {}", base, pname, item));
                                    }
                                }
                            }
                        }
                        Ok(_) => {}
                    }
                }
                out.sort();
                Ok(out)
            }
        }
    }

    fn session_options(&self) -> skein_graph::EvalOptions {
        skein_graph::EvalOptions { jobs: self.session.env().config.jobs, keep_going: false }
    }

    fn labels_of(&mut self, expr: &QueryExpr) -> Result<Vec<Label>> {
        match expr {
            QueryExpr::Pattern(pattern) => self.expand(pattern),
            _ => Err(anyhow!("nested query expressions must be target patterns")),
        }
    }

    fn expand(&mut self, pattern: &TargetPattern) -> Result<Vec<Label>> {
        let result = self
            .session
            .engine()
            .evaluate(&[BuildKey::Patterns(pattern.clone())], self.session_options());
        match result.roots.into_iter().next() {
            Some((_, Ok(BuildValue::Patterns(labels)))) => Ok((*labels).clone()),
            Some((_, Ok(_))) => Err(anyhow!("pattern expansion returned a non-pattern value")),
            Some((_, Err(e))) => Err(anyhow!(format_error(&e))),
            None => Ok(Vec::new()),
        }
    }

    fn analyze(
        &mut self,
        labels: &[Label],
    ) -> Result<HashMap<ConfiguredTargetKey, Arc<crate::build::target::ConfiguredTargetValue>>>
    {
        let top = Arc::new(crate::build::configuration::Configuration::new(
            self.session.env().config.options.clone(),
        ));
        let keys: Vec<ConfiguredTargetKey> = labels
            .iter()
            .map(|label| ConfiguredTargetKey::new(label.clone(), Some(Arc::clone(&top))))
            .collect();
        let build_keys: Vec<BuildKey> =
            keys.iter().map(|k| BuildKey::ConfiguredTarget(k.clone())).collect();
        let result = self.session.engine().evaluate(&build_keys, self.session_options());
        let mut out = HashMap::new();
        for (key, value) in keys.into_iter().zip(result.roots.into_iter().map(|(_, r)| r)) {
            match value {
                Ok(BuildValue::ConfiguredTarget(v)) => {
                    out.insert(key, v);
                }
                Ok(_) => return Err(anyhow!("analysis returned a non-target value")),
                Err(e) => return Err(anyhow!(format_error(&e))),
            }
        }
        Ok(out)
    }

    /// Does `key` transitively depend on any of `wanted`?
    fn reaches(&self, key: &ConfiguredTargetKey, wanted: &BTreeSet<String>) -> bool {
        let mut pending = vec![key.clone()];
        let mut seen: HashSet<ConfiguredTargetKey> = HashSet::new();
        while let Some(cur) = pending.pop() {
            if !seen.insert(cur.clone()) {
                continue;
            }
            if wanted.contains(&cur.label.to_string()) {
                return true;
            }
            if let Some(BuildValue::ConfiguredTarget(value)) =
                self.session.engine().value_of(&BuildKey::ConfiguredTarget(cur))
            {
                pending.extend(value.deps.iter().cloned());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_calls() {
        assert_eq!(
            parse("deps(//a:b)").unwrap(),
            QueryExpr::Deps(Box::new(QueryExpr::Pattern(TargetPattern::parse("//a:b").unwrap())))
        );
        match parse("aspect(sources, //p:all)").unwrap() {
            QueryExpr::Aspect(name, sub) => {
                assert_eq!(name, "sources");
                assert_eq!(
                    *sub,
                    QueryExpr::Pattern(TargetPattern::parse("//p:all").unwrap())
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse("aspect(//p:all)").is_err());
        assert!(parse("not a label").is_err());
    }
}
