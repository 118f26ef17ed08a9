//! Experiment file → resolver → persistent queue → driver → result log.

use std::fs;
use std::time::Duration;

use serde_yaml::{Mapping, Value};
use trune_common::{Cancelled, RunContext};
use trune_experiment::logs::read_log;
use trune_experiment::{
    load_from_yaml, run, DriverOptions, ExperimentSource, ModuleRegistry, YamlExperimentQueue,
};

fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("scale", |exp, ctx| {
        if exp.bool_or("interrupt", false)? {
            ctx.cancel.cancel();
        }
        ctx.cancel.check()?;
        let lr = exp.f64_or("lr", 0.0)?;
        let steps = exp.usize_or("steps", 1)?;
        exp.set("ACC", lr * steps as f64);
        Ok(())
    });
    registry
}

fn options() -> DriverOptions {
    DriverOptions {
        cancel_pause: Duration::ZERO,
        ..Default::default()
    }
}

#[test]
fn resolved_queue_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let queue = dir.path().join("state/queue.yaml");
    let log = dir.path().join("logs/results.yaml");
    let file = dir.path().join("experiment.yaml");
    fs::write(
        &file,
        format!(
            "module: scale\nqueue: {}\nyaml_log: {}\nlr: 0.5\nsteps: 2\n\
             ---\nname: base\n\
             ---\nname: doubled\nrepeat: 2\nsteps: eval len(name) - 3\n\
             ---\nname: interrupted\ninterrupt: true\n",
            queue.display(),
            log.display()
        ),
    )
    .unwrap();

    let mut overrides = Mapping::new();
    overrides.insert("lr".into(), Value::from(0.25));
    let resolution = load_from_yaml(&file, &overrides).unwrap();
    assert!(resolution.experiments.queue().is_some());
    assert_eq!(YamlExperimentQueue::open(&queue).unwrap().len().unwrap(), 4);

    let ctx = RunContext::default();
    let summary = run(resolution.experiments, &registry(), &options(), &ctx).unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.cancelled, 1);
    assert!(!queue.exists());
    assert!(!ctx.cancel.is_cancelled());

    let results = read_log(&log).unwrap();
    let accs: Vec<f64> = results.iter().map(|r| r["ACC"].as_f64().unwrap()).collect();
    assert_eq!(accs, [0.5, 1.0, 1.0]);
    assert_eq!(results[1]["REP"].as_i64(), Some(0));
    assert_eq!(results[2]["REP"].as_i64(), Some(1));
    assert_eq!(results[1]["RND_IDX"], results[2]["RND_IDX"]);
}

#[test]
fn interrupted_queue_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let queue = dir.path().join("queue.yaml");
    let log = dir.path().join("results.yaml");
    let file = dir.path().join("experiment.yaml");
    fs::write(
        &file,
        format!(
            "module: scale\nqueue: {}\nyaml_log: {}\nlr: 1\n---\nsteps: 1\n---\nsteps: 2\n---\nsteps: 3\n",
            queue.display(),
            log.display()
        ),
    )
    .unwrap();
    let resolution = load_from_yaml(&file, &Mapping::new()).unwrap();
    drop(resolution);

    // A process that died after finishing the first experiment.
    let popped = YamlExperimentQueue::open(&queue).unwrap().pop().unwrap().unwrap();
    assert_eq!(popped.peek("steps").and_then(Value::as_i64), Some(1));

    let resumed = ExperimentSource::Queue(YamlExperimentQueue::open(&queue).unwrap());
    let summary = run(resumed, &registry(), &options(), &RunContext::default()).unwrap();
    assert_eq!(summary.completed, 2);
    let accs: Vec<f64> = read_log(&log)
        .unwrap()
        .iter()
        .map(|r| r["ACC"].as_f64().unwrap())
        .collect();
    assert_eq!(accs, [2.0, 3.0]);
}

#[test]
fn cancelled_error_is_recognised_through_anyhow() {
    let err: anyhow::Error = Cancelled.into();
    assert!(err.downcast_ref::<Cancelled>().is_some());
}
