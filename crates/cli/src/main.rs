use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_yaml::{Mapping, Value};

use trune_common::{CancelToken, RunContext};
use trune_experiment::{
    collect, load_from_yaml, parse_literal, run, DriverOptions, ExperimentSource, ModuleRegistry,
    YamlExperimentQueue,
};
use trune_train::builtin_modules;

/// Exit code when the operator cancels twice in a row.
const DOUBLE_CANCEL_EXIT: i32 = 130;

/// Long and short flags the subcommands understand; anything else starting
/// with `-` is reported and dropped before clap sees it.
const KNOWN_FLAGS: [&str; 10] = [
    "--dry", "--exp", "--pick", "--resume", "--dest", "--sort", "--help", "-h", "--version", "-V",
];

#[derive(Parser, Debug)]
#[command(
    name = "trune",
    version,
    about = "Pruning experiments: resolve, queue and run",
    after_help = "Extra `+key=value` (or `+key value`) arguments override experiment defaults."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve an experiment file and run every experiment in it.
    Run(RunArgs),
    /// Merge result logs from many runs into one file.
    Collect(CollectArgs),
}

// ── Run ────────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct RunArgs {
    /// Print the resolved experiments without running them.
    #[arg(long)]
    dry: bool,
    #[arg(long, default_value = "experiment.yaml")]
    exp: PathBuf,
    /// Zero-based indices of the experiments to run.
    #[arg(long, num_args = 1..)]
    pick: Option<Vec<usize>>,
    /// Continue an existing queue file instead of resolving `--exp`.
    #[arg(long)]
    resume: Option<PathBuf>,
}

fn cmd_run(args: RunArgs, overrides: Mapping) -> Result<()> {
    let experiments = match &args.resume {
        Some(path) => {
            if !overrides.is_empty() {
                tracing::warn!("overrides are ignored when resuming a queue");
            }
            let queue = YamlExperimentQueue::open(path)
                .with_context(|| format!("resume queue {}", path.display()))?;
            tracing::info!(path = %path.display(), left = queue.len()?, "resuming queue");
            ExperimentSource::Queue(queue)
        }
        None => {
            let resolution = load_from_yaml(&args.exp, &overrides)
                .with_context(|| format!("resolve {}", args.exp.display()))?;
            tracing::info!("defaults\n{}", resolution.defaults);
            resolution.experiments
        }
    };

    let mut registry = ModuleRegistry::new();
    for (name, entry) in builtin_modules() {
        registry.register(name, entry);
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            tracing::error!("cancelled twice, exiting");
            std::process::exit(DOUBLE_CANCEL_EXIT);
        }
        tracing::warn!("cancel requested, stopping the current experiment");
        handler_token.cancel();
    })
    .context("install cancel handler")?;

    let options = DriverOptions {
        dry: args.dry,
        pick: args.pick,
        ..Default::default()
    };
    let summary = run(experiments, &registry, &options, &RunContext::new(cancel))?;
    tracing::info!(
        completed = summary.completed,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "all experiments done"
    );
    Ok(())
}

// ── Collect ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct CollectArgs {
    /// Files or directories searched recursively for `.yaml` logs.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    #[arg(long, default_value = "yaml_logs")]
    dest: PathBuf,
    /// Sort the merged documents by this key.
    #[arg(long)]
    sort: Option<String>,
}

fn cmd_collect(args: CollectArgs) -> Result<()> {
    let (path, n) = collect(&args.paths, &args.dest, args.sort.as_deref())?;
    println!("{n} logs saved to {}", path.display());
    Ok(())
}

// ── Argument pre-pass ──────────────────────────────────────────────────────────

/// Split `+key=value` / `+key value` overrides out of `args` and drop unknown
/// `-` flags. Returns the arguments left for clap and the override mapping.
fn split_overrides(args: Vec<String>) -> (Vec<String>, Mapping) {
    let mut rest = Vec::with_capacity(args.len());
    let mut overrides = Mapping::new();
    let mut it = args.into_iter().peekable();
    if let Some(program) = it.next() {
        rest.push(program);
    }
    while let Some(arg) = it.next() {
        if let Some(body) = arg.strip_prefix('+') {
            let (key, raw) = match body.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => {
                    let value = it.next_if(|next| !next.starts_with('+') && !next.starts_with("--"));
                    (body.to_string(), value)
                }
            };
            let key = key.replace('-', "_");
            let value = match raw {
                Some(raw) => parse_literal(&raw).unwrap_or(Value::String(raw)),
                None => Value::Bool(true),
            };
            overrides.insert(Value::String(key), value);
        } else if arg.starts_with('-') && arg.parse::<f64>().is_err() {
            let flag = arg.split_once('=').map_or(arg.as_str(), |(f, _)| f);
            if KNOWN_FLAGS.contains(&flag) {
                rest.push(arg);
            } else {
                tracing::warn!(flag = %arg, "ignoring unknown flag");
            }
        } else {
            rest.push(arg);
        }
    }
    (rest, overrides)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (args, overrides) = split_overrides(std::env::args().collect());
    let cli = Cli::parse_from(args);
    match cli.command {
        Command::Run(args) => cmd_run(args, overrides),
        Command::Collect(args) => {
            if !overrides.is_empty() {
                tracing::warn!("overrides have no effect on collect");
            }
            cmd_collect(args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn overrides_take_both_forms() {
        let (rest, o) = split_overrides(argv(
            "trune run --dry +learning-rate=0.05 +name baseline +steps 10 +flag --pick 1 2",
        ));
        assert_eq!(rest, argv("trune run --dry --pick 1 2"));
        assert_eq!(o.get("learning_rate").and_then(Value::as_f64), Some(0.05));
        assert_eq!(o.get("name").and_then(Value::as_str), Some("baseline"));
        assert_eq!(o.get("steps").and_then(Value::as_i64), Some(10));
        assert_eq!(o.get("flag"), Some(&Value::Bool(true)));
    }

    #[test]
    fn unknown_dash_flags_are_dropped() {
        let (rest, o) = split_overrides(argv("trune run --verbose --exp=e.yaml -x +lr -0.5"));
        assert_eq!(rest, argv("trune run --exp=e.yaml"));
        assert_eq!(o.get("lr").and_then(Value::as_f64), Some(-0.5));
    }

    #[test]
    fn cleaned_args_parse() {
        let (rest, _) = split_overrides(argv("trune run --pick 0 3 +x=1"));
        let cli = Cli::try_parse_from(rest).unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.pick, Some(vec![0, 3]));
                assert_eq!(args.exp, PathBuf::from("experiment.yaml"));
            }
            Command::Collect(_) => panic!("expected run"),
        }
    }
}
