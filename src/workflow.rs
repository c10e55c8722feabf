//! Workflow configuration and registry.
//!
//! Each workflow kind is described by a TOML file: which executable performs
//! one attempt, how long an attempt may take, and the retry policy that
//! wraps it.

use crate::error::{Error, Result};
use crate::model::WorkflowKind;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    workflow: WorkflowSpec,
}

/// One workflow kind's execution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    pub kind: WorkflowKind,
    /// Executable performing one attempt.
    pub command: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_secs() -> u64 {
    15 * 60
}

impl WorkflowSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Registry of loaded workflow specs, indexed by kind.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    specs: HashMap<WorkflowKind, WorkflowSpec>,
}

impl WorkflowRegistry {
    /// Create an empty registry. Every kind falls back to the default policy.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register (or replace) a spec.
    pub fn insert(&mut self, spec: WorkflowSpec) {
        self.specs.insert(spec.kind, spec);
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read workflow dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: WorkflowFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad workflow config {}: {e}", path.display()))
                })?;
                if registry.specs.contains_key(&file.workflow.kind) {
                    return Err(Error::Config(format!(
                        "workflow kind {} configured twice (second in {})",
                        file.workflow.kind,
                        path.display()
                    )));
                }
                registry.insert(file.workflow);
            }
        }

        Ok(registry)
    }

    /// Look up a spec by kind.
    pub fn get(&self, kind: WorkflowKind) -> Option<&WorkflowSpec> {
        self.specs.get(&kind)
    }

    /// Retry policy for a kind, or the default when unconfigured.
    pub fn policy(&self, kind: WorkflowKind) -> RetryPolicy {
        self.get(kind).map(|s| s.retry.clone()).unwrap_or_default()
    }
}
