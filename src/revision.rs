use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::RevisionConfig;
use crate::error::{BenchError, Result};

/// Resolves the source snapshot a new run benchmarks.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct StaticRevision(pub String);

#[async_trait]
impl RevisionSource for StaticRevision {
    async fn resolve(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// `git rev-parse --verify <reference>` in a local checkout.
#[derive(Debug, Clone)]
pub struct GitRevision {
    repo: PathBuf,
    reference: String,
}

impl GitRevision {
    pub fn new(repo: impl Into<PathBuf>, reference: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            reference: reference.into(),
        }
    }
}

#[async_trait]
impl RevisionSource for GitRevision {
    async fn resolve(&self) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(["rev-parse", "--verify", &self.reference])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BenchError::Revision(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(BenchError::Revision(format!(
                "git rev-parse {} in {}: {}",
                self.reference,
                self.repo.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if revision.is_empty() {
            return Err(BenchError::Revision(format!(
                "git returned no revision for {}",
                self.reference
            )));
        }
        Ok(revision)
    }
}

pub fn revision_source(config: &RevisionConfig) -> Arc<dyn RevisionSource> {
    match config {
        RevisionConfig::Static(value) => Arc::new(StaticRevision(value.clone())),
        RevisionConfig::Git { repo, reference } => {
            Arc::new(GitRevision::new(repo.clone(), reference.clone()))
        }
    }
}
