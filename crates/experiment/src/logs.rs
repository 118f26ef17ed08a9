//! Result logs: appending finished experiments and collecting logs from
//! many runs into one file.

use std::cmp::Ordering;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use trune_common::ExperimentSpec;

pub const DEFAULT_RESULT_LOG: &str = "logs/results.yaml";

/// Append `spec` to `path` as one more YAML document, keeping key order.
pub fn append_result(path: &Path, spec: &ExperimentSpec) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let doc = spec.to_yaml()?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open result log {}", path.display()))?;
    write!(file, "---\n{doc}").with_context(|| format!("write result log {}", path.display()))?;
    Ok(())
}

/// Every non-empty document in `path`.
pub fn read_log(path: &Path) -> Result<Vec<Value>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let value = Value::deserialize(doc).with_context(|| format!("parse {}", path.display()))?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Recursively gather the documents of every `.yaml` file under `root`,
/// skipping documents already collected.
pub fn collect_logs(root: &Path, into: &mut Vec<Value>) -> Result<usize> {
    let before = into.len();
    let mut entries: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("list {}", root.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            collect_logs(&path, into)?;
        } else if path.extension().is_some_and(|e| e == "yaml") {
            for doc in read_log(&path)? {
                if !into.contains(&doc) {
                    into.push(doc);
                }
            }
        }
    }
    let found = into.len() - before;
    if found > 0 {
        tracing::debug!(path = %root.display(), found, "collected logs");
    }
    Ok(found)
}

/// Order by `key`; documents without it go last, ties keep their order.
pub fn sort_logs(logs: &mut [Value], key: &str) {
    logs.sort_by(|a, b| match (a.get(key), b.get(key)) {
        (Some(x), Some(y)) => compare_values(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

/// Gather logs under `paths` into `dest/logs_<timestamp>.yaml`.
pub fn collect(paths: &[PathBuf], dest: &Path, sort_key: Option<&str>) -> Result<(PathBuf, usize)> {
    let mut logs = Vec::new();
    for path in paths {
        let found = collect_logs(path, &mut logs)?;
        tracing::info!(path = %path.display(), found, "gathered logs");
    }
    if let Some(key) = sort_key {
        sort_logs(&mut logs, key);
    }
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let out = dest.join(format!("logs_{stamp}.yaml"));
    let mut text = String::new();
    for doc in &logs {
        text.push_str("---\n");
        text.push_str(&serde_yaml::to_string(doc)?);
    }
    fs::write(&out, text).with_context(|| format!("write {}", out.display()))?;
    tracing::info!(dest = %out.display(), logs = logs.len(), "saved collected logs");
    Ok((out, logs.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> ExperimentSpec {
        ExperimentSpec::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn appended_documents_keep_order_and_separators() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("nested/results.yaml");
        append_result(&log, &spec("z: 1\na: 2\n")).unwrap();
        append_result(&log, &spec("z: 3\na: 4\n")).unwrap();
        let text = fs::read_to_string(&log).unwrap();
        assert_eq!(text.matches("---\n").count(), 2);
        let docs = read_log(&log).unwrap();
        assert_eq!(docs.len(), 2);
        let keys: Vec<_> = docs[1].as_mapping().unwrap().keys().cloned().collect();
        assert_eq!(keys, [Value::from("z"), Value::from("a")]);
    }

    #[test]
    fn collect_dedups_recursively_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("runs");
        append_result(&root.join("a/results.yaml"), &spec("ACC: 0.5\n")).unwrap();
        append_result(&root.join("a/results.yaml"), &spec("ACC: 0.9\n")).unwrap();
        append_result(&root.join("b/deeper/results.yaml"), &spec("ACC: 0.5\n")).unwrap();
        append_result(&root.join("b/results.yaml"), &spec("ACC: 0.1\n")).unwrap();
        fs::write(root.join("notes.txt"), "ACC: 7").unwrap();

        let dest = dir.path().join("out");
        let (file, n) = collect(&[root], &dest, Some("ACC")).unwrap();
        assert_eq!(n, 3);
        let name = file.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("logs_") && name.ends_with(".yaml"));
        let accs: Vec<f64> = read_log(&file)
            .unwrap()
            .iter()
            .map(|d| d["ACC"].as_f64().unwrap())
            .collect();
        assert_eq!(accs, [0.1, 0.5, 0.9]);
    }
}
