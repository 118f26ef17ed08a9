//! Sequential run driver.
//!
//! Pulls experiments one at a time, invokes the module each names, and
//! appends the finished experiment to its result log. Operator cancel
//! aborts only the current experiment; any other failure stops the run and
//! leaves a persistent queue on disk for the next invocation to resume.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use trune_common::{Cancelled, ExperimentSpec, RunContext};

use crate::logs::{append_result, DEFAULT_RESULT_LOG};
use crate::resolver::ExperimentSource;

/// Bookkeeping keys never reported as unused parameters.
pub const USAGE_IGNORED_KEYS: [&str; 10] = [
    "RND_IDX",
    "REP",
    "GLOBAL_REP",
    "HOST",
    "global_repeat",
    "queue",
    "repeat",
    "name",
    "module",
    "yaml_log",
];

/// Experiments named this are listed but never run.
pub const SKIP_NAME: &str = "skip";

pub type ModuleEntry = Box<dyn Fn(&mut ExperimentSpec, &RunContext) -> Result<()>>;

/// Name → training entry point.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, entry: F) -> &mut Self
    where
        F: Fn(&mut ExperimentSpec, &RunContext) -> Result<()> + 'static,
    {
        self.modules.insert(name.to_string(), Box::new(entry));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModuleEntry> {
        self.modules.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Print experiments without running them.
    pub dry: bool,
    /// Zero-based indices to run; `None` runs everything.
    pub pick: Option<Vec<usize>>,
    /// Pause after an operator cancel before moving on.
    pub cancel_pause: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            dry: false,
            pick: None,
            cancel_pause: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

pub fn run(
    mut experiments: ExperimentSource,
    registry: &ModuleRegistry,
    options: &DriverOptions,
    ctx: &RunContext,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for (idx, item) in experiments.iter().enumerate() {
        let mut exp = item?;
        if options.pick.as_ref().is_some_and(|p| !p.contains(&idx)) {
            tracing::info!(index = idx, "skipping experiment (not picked)");
            summary.skipped += 1;
            continue;
        }
        tracing::info!(index = idx, "new experiment\n{exp}");
        if options.dry {
            continue;
        }
        if exp.name() == Some(SKIP_NAME) {
            tracing::info!(index = idx, "skipping experiment (name is {SKIP_NAME})");
            summary.skipped += 1;
            continue;
        }

        exp.reset_usage(USAGE_IGNORED_KEYS);
        let module_name = exp
            .module()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("experiment {idx} names no module"))?;
        let entry = registry.get(&module_name).ok_or_else(|| {
            anyhow!(
                "experiment {idx}: unknown module `{module_name}` (available: {})",
                registry.names().collect::<Vec<_>>().join(", ")
            )
        })?;

        let start = Instant::now();
        match entry(&mut exp, ctx) {
            Ok(()) => {
                exp.set("TIME_ELAPSED", start.elapsed().as_secs_f64());
                let log = PathBuf::from(exp.str_or("yaml_log", DEFAULT_RESULT_LOG)?);
                append_result(&log, &exp)?;
                tracing::info!(index = idx, log = %log.display(), "saved results");
                summary.completed += 1;
            }
            Err(e) if e.downcast_ref::<Cancelled>().is_some() => {
                tracing::warn!(
                    index = idx,
                    pause = ?options.cancel_pause,
                    "experiment cancelled, resuming with the next one"
                );
                std::thread::sleep(options.cancel_pause);
                ctx.cancel.reset();
                summary.cancelled += 1;
            }
            Err(e) => return Err(e.context(format!("experiment {idx} ({module_name}) failed"))),
        }
    }

    if let ExperimentSource::Queue(queue) = experiments {
        tracing::info!(path = %queue.path().display(), "removing finished queue");
        queue.close().context("remove finished queue")?;
    }
    Ok(summary)
}

// ── Tests ───────────────────────────────────────────────────────────────────
