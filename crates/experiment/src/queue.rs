//! File-backed FIFO of experiments.
//!
//! The backing file is a multi-document YAML stream, one experiment per
//! document. Every mutation rewrites the whole file, so the file on disk is
//! always the exact remaining work: a process killed between experiments
//! resumes from it, and an external producer may [`append`] while a driver
//! is consuming.
//!
//! At most one consumer may pop at a time.
//!
//! [`append`]: YamlExperimentQueue::append

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use trune_common::ExperimentSpec;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("queue file {} is not valid YAML: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("queue file {} holds a document that is not a mapping", path.display())]
    NotAMapping { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone)]
pub struct YamlExperimentQueue {
    path: PathBuf,
}

impl YamlExperimentQueue {
    /// Create (or overwrite) the queue at `path` holding `experiments`.
    pub fn create(path: impl Into<PathBuf>, experiments: &[ExperimentSpec]) -> Result<Self> {
        let queue = Self { path: path.into() };
        if let Some(parent) = queue.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| queue.io(source))?;
        }
        queue.write_content(experiments)?;
        Ok(queue)
    }

    /// Attach to a queue left on disk by an earlier run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let queue = Self { path: path.into() };
        fs::metadata(&queue.path).map_err(|source| queue.io(source))?;
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self, source: std::io::Error) -> QueueError {
        QueueError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Every experiment currently on disk. Empty documents are ignored.
    pub fn read_content(&self) -> Result<Vec<ExperimentSpec>> {
        let text = fs::read_to_string(&self.path).map_err(|source| self.io(source))?;
        let mut out = Vec::new();
        if text.trim().is_empty() {
            return Ok(out);
        }
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = Value::deserialize(doc).map_err(|source| QueueError::Yaml {
                path: self.path.clone(),
                source,
            })?;
            match value {
                Value::Null => {}
                Value::Mapping(m) => out.push(ExperimentSpec::from_mapping(m)),
                _ => {
                    return Err(QueueError::NotAMapping {
                        path: self.path.clone(),
                    })
                }
            }
        }
        Ok(out)
    }

    /// Replace the file content; written to a sibling file and renamed into place.
    pub fn write_content(&self, experiments: &[ExperimentSpec]) -> Result<()> {
        let mut text = String::new();
        for exp in experiments {
            let doc = exp.to_yaml().map_err(|source| QueueError::Yaml {
                path: self.path.clone(),
                source,
            })?;
            text.push_str("---\n");
            text.push_str(&doc);
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, text).map_err(|source| self.io(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io(source))?;
        Ok(())
    }

    /// Add `experiments` at the tail, after whatever is on disk now.
    pub fn append(&self, experiments: &[ExperimentSpec]) -> Result<()> {
        let mut content = self.read_content()?;
        content.extend_from_slice(experiments);
        self.write_content(&content)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read_content()?.is_empty())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read_content()?.len())
    }

    /// Remove and return the head, or `None` when no work is left.
    pub fn pop(&self) -> Result<Option<ExperimentSpec>> {
        let mut content = self.read_content()?;
        if content.is_empty() {
            return Ok(None);
        }
        let head = content.remove(0);
        self.write_content(&content)?;
        Ok(Some(head))
    }

    /// Pops on every step, so experiments appended meanwhile are seen.
    pub fn iter(&self) -> QueueIter<'_> {
        tracing::info!(path = %self.path.display(), "consuming experiment queue");
        QueueIter { queue: self }
    }

    /// Delete the backing file: no work and no resumable state remain.
    pub fn close(self) -> Result<()> {
        fs::remove_file(&self.path).map_err(|source| self.io(source))
    }
}

pub struct QueueIter<'a> {
    queue: &'a YamlExperimentQueue,
}

impl Iterator for QueueIter<'_> {
    type Item = Result<ExperimentSpec>;

    fn next(&mut self) -> Option<Self::Item> {
        self.queue.pop().transpose()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
