//! Expands a declarative experiment file into concrete experiments.
//!
//! Document 0 holds the defaults, every further document is an experiment
//! template. For each of `global_repeat` passes, every template is merged
//! over the defaults (template keys first, in their own order, then the
//! remaining default keys), stamped with `RND_IDX`/`REP`/`GLOBAL_REP`, and
//! expanded `repeat` times. Each expansion is then resolved key by key:
//!
//! * nested mappings are resolved recursively, with their parents in scope;
//! * strings starting with `eval` are evaluated (see [`crate::expr`]) in a
//!   scope of ancestors, then the current mapping as resolved so far, then
//!   `E`, the list of experiments already resolved in this pass;
//! * strings that look like numbers become numbers.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use trune_common::spec::{describe, key_to_string, value_as_i64};
use trune_common::{ConfigError, ExperimentSpec};

use crate::expr::{self, ExprError, Scope};
use crate::queue::{QueueError, QueueIter, YamlExperimentQueue};

/// Keys no experiment document may define.
pub const RESERVED_KEYS: [&str; 2] = ["temp", "E"];

const EVAL_TAG: &str = "eval";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot read experiment file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("experiment file is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("experiment file has no defaults document")]
    NoDefaults,

    #[error("evaluating `{key}` ({expr}): {source}")]
    Expr {
        key: String,
        expr: String,
        #[source]
        source: ExprError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Resolved experiments, either persisted or in memory.
pub enum ExperimentSource {
    Queue(YamlExperimentQueue),
    Sequence(std::vec::IntoIter<ExperimentSpec>),
}

impl ExperimentSource {
    /// Iterate; queue mode pops from disk on every step.
    pub fn iter(&mut self) -> SourceIter<'_> {
        match self {
            Self::Queue(q) => SourceIter::Queue(q.iter()),
            Self::Sequence(it) => SourceIter::Sequence(it),
        }
    }

    pub fn queue(&self) -> Option<&YamlExperimentQueue> {
        match self {
            Self::Queue(q) => Some(q),
            Self::Sequence(_) => None,
        }
    }
}

pub enum SourceIter<'a> {
    Queue(QueueIter<'a>),
    Sequence(&'a mut std::vec::IntoIter<ExperimentSpec>),
}

impl Iterator for SourceIter<'_> {
    type Item = std::result::Result<ExperimentSpec, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Queue(q) => q.next(),
            Self::Sequence(it) => it.next().map(Ok),
        }
    }
}

pub struct Resolution {
    pub defaults: ExperimentSpec,
    pub experiments: ExperimentSource,
}

/// Read every YAML document of `path`.
pub fn read_documents(path: &Path) -> Result<Vec<Value>> {
    let text = fs::read_to_string(path).map_err(|source| ResolveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::Deserializer::from_str(&text)
        .map(|doc| Value::deserialize(doc).map_err(ResolveError::from))
        .collect()
}

pub fn load_from_yaml(path: &Path, overrides: &Mapping) -> Result<Resolution> {
    resolve(read_documents(path)?, overrides)
}

pub fn resolve(documents: Vec<Value>, overrides: &Mapping) -> Result<Resolution> {
    resolve_with_rng(documents, overrides, &mut rand::thread_rng())
}

pub fn resolve_with_rng<R: Rng + ?Sized>(
    documents: Vec<Value>,
    overrides: &Mapping,
    rng: &mut R,
) -> Result<Resolution> {
    let mut docs = documents.into_iter();
    let mut defaults = as_mapping(docs.next().ok_or(ResolveError::NoDefaults)?)?;
    let templates = docs.map(as_mapping).collect::<Result<Vec<_>>>()?;
    for (k, v) in overrides {
        defaults.insert(k.clone(), v.clone());
    }
    check_reserved(&defaults)?;
    for t in &templates {
        check_reserved(t)?;
    }
    if !overrides.is_empty() {
        tracing::info!(overrides = ?overrides, "command line overrides applied");
    }

    let global_repeat = count(&defaults, "global_repeat")?;
    let mut expanded = Vec::new();
    for global_rep in 0..global_repeat {
        let mut history: Vec<Value> = Vec::new();
        for template in &templates {
            let mut merged = template.clone();
            for (k, v) in &defaults {
                if !merged.contains_key(k) {
                    merged.insert(k.clone(), v.clone());
                }
            }
            let rnd_idx = match merged.get("RND_IDX") {
                Some(v) => v.clone(),
                None => Value::from(rng.gen_range(100_000..=999_999i64)),
            };
            for rep in 0..count(&merged, "repeat")? {
                let mut exp = merged.clone();
                exp.insert("RND_IDX".into(), rnd_idx.clone());
                exp.insert("REP".into(), Value::from(rep as i64));
                exp.insert("GLOBAL_REP".into(), Value::from(global_rep as i64));
                let resolved = resolve_mapping(exp, &[], &history, "")?;
                history.push(Value::Mapping(resolved.clone()));
                expanded.push(ExperimentSpec::from_mapping(resolved));
            }
        }
    }
    tracing::info!(experiments = expanded.len(), global_repeat, "experiments resolved");

    let experiments = match defaults.get("queue").and_then(Value::as_str) {
        Some(path) => {
            tracing::info!(path, "persisting experiments to queue");
            ExperimentSource::Queue(YamlExperimentQueue::create(path, &expanded)?)
        }
        None => ExperimentSource::Sequence(expanded.into_iter()),
    };
    Ok(Resolution {
        defaults: ExperimentSpec::from_mapping(defaults),
        experiments,
    })
}

fn as_mapping(doc: Value) -> Result<Mapping> {
    Ok(ExperimentSpec::from_value(doc)?.into_mapping())
}

fn check_reserved(map: &Mapping) -> Result<()> {
    for (k, v) in map {
        if let Some(key) = k.as_str().filter(|k| RESERVED_KEYS.contains(k)) {
            return Err(ConfigError::ReservedKey { key: key.to_string() }.into());
        }
        if let Value::Mapping(inner) = v {
            check_reserved(inner)?;
        }
    }
    Ok(())
}

/// A missing, null or zero count means one.
fn count(map: &Mapping, key: &str) -> Result<usize> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(1),
        Some(v) => match value_as_i64(v) {
            Some(n) if n > 0 => Ok(n as usize),
            Some(0) => Ok(1),
            _ => Err(ConfigError::InvalidValue {
                key: key.into(),
                reason: format!("expected a non-negative integer, got {}", describe(v)),
            }
            .into()),
        },
    }
}

fn is_pending(v: &Value) -> bool {
    matches!(v, Value::String(s) if s.starts_with(EVAL_TAG))
}

/// Numeric-looking strings become numbers; everything else is unchanged.
pub fn coerce(v: Value) -> Value {
    let Value::String(s) = &v else {
        return v;
    };
    let t = s.trim();
    if let Ok(i) = t.parse::<i64>() {
        return Value::from(i);
    }
    match t.parse::<f64>() {
        Ok(f) => Value::from(f),
        Err(_) => v,
    }
}

struct Layered<'a> {
    /// Outermost first; the mapping being resolved is last.
    levels: Vec<&'a Mapping>,
    history: &'a [Value],
}

impl Scope for Layered<'_> {
    fn lookup(&self, name: &str) -> std::result::Result<Value, ExprError> {
        if name == "E" {
            return Ok(Value::Sequence(self.history.to_vec()));
        }
        for level in self.levels.iter().rev() {
            if let Some(v) = level.get(name) {
                if is_pending(v) {
                    return Err(ExprError::Unresolved(name.to_string()));
                }
                return Ok(coerce(v.clone()));
            }
        }
        Err(ExprError::UnknownName(name.to_string()))
    }
}

fn resolve_mapping(
    map: Mapping,
    ancestors: &[Mapping],
    history: &[Value],
    prefix: &str,
) -> Result<Mapping> {
    let keys: Vec<Value> = map.keys().cloned().collect();
    let mut current = map;
    for key in keys {
        let Some(raw) = current.get(&key).cloned() else {
            continue;
        };
        let path = format!("{prefix}{}", key_to_string(&key));
        let value = match raw {
            Value::Mapping(inner) => {
                let mut scopes = ancestors.to_vec();
                scopes.push(current.clone());
                Value::Mapping(resolve_mapping(inner, &scopes, history, &format!("{path}."))?)
            }
            Value::String(s) if s.starts_with(EVAL_TAG) => {
                let src = s[EVAL_TAG.len()..].trim();
                let scope = Layered {
                    levels: ancestors.iter().chain(std::iter::once(&current)).collect(),
                    history,
                };
                let v = expr::evaluate(src, &scope).map_err(|source| ResolveError::Expr {
                    key: path.clone(),
                    expr: src.to_string(),
                    source,
                })?;
                tracing::debug!(key = %path, expr = src, value = ?v, "evaluated");
                coerce(v)
            }
            other => coerce(other),
        };
        current.insert(key, value);
    }
    Ok(current)
}

// ── Tests ───────────────────────────────────────────────────────────────────
