//! # trune-experiment — Experiment Resolution and Driving
//!
//! Turns a multi-document YAML experiment file into a sequence of fully
//! resolved experiments and runs them one by one:
//!
//! | Stage | Module | What happens |
//! |-------|--------|--------------|
//! | Resolve | [`resolver`] | defaults + templates merge, repeats expand, `eval` strings evaluate |
//! | Persist | [`queue`] | optional crash-safe YAML queue, appendable while running |
//! | Drive | [`driver`] | module dispatch, timing, operator-cancel handling |
//! | Record | [`logs`] | per-experiment result log, `collect` across runs |
//!
//! `eval` strings use the small expression language in [`expr`].

pub mod driver;
pub mod expr;
pub mod logs;
pub mod queue;
pub mod resolver;

pub use driver::{run, DriverOptions, ModuleRegistry, RunSummary};
pub use expr::{evaluate, parse_literal, ExprError};
pub use logs::{append_result, collect, DEFAULT_RESULT_LOG};
pub use queue::{QueueError, YamlExperimentQueue};
pub use resolver::{load_from_yaml, resolve, ExperimentSource, Resolution, ResolveError};
