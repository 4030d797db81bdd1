use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::collector::RunReport;
use crate::error::{BenchError, Result};

/// Receives every closed run report. Rendering and deployment of the
/// results page live behind this trait.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, report: &RunReport) -> Result<()>;
}

/// Writes `<run_id>.json` and refreshes `latest.json` in a directory.
#[derive(Debug, Clone)]
pub struct JsonFilePublisher {
    dir: PathBuf,
}

impl JsonFilePublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Publisher for JsonFilePublisher {
    async fn publish(&self, report: &RunReport) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(report)?;

        let path = self.dir.join(format!("{}.json", report.run_id));
        tokio::fs::write(&path, &body).await?;

        // Write then rename so readers never see a half-written latest.json
        let tmp = self.dir.join("latest.json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, self.dir.join("latest.json")).await?;

        tracing::info!(run_id = %report.run_id, path = %path.display(), "Report published");
        Ok(())
    }
}

/// Most recent reports, newest last, for the admin API.
#[derive(Debug)]
pub struct ReportHistory {
    reports: RwLock<VecDeque<RunReport>>,
    limit: usize,
}

impl ReportHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            reports: RwLock::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    pub fn latest(&self) -> Option<RunReport> {
        self.reports.read().back().cloned()
    }

    pub fn all(&self) -> Vec<RunReport> {
        self.reports.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.read().is_empty()
    }
}

#[async_trait]
impl Publisher for ReportHistory {
    async fn publish(&self, report: &RunReport) -> Result<()> {
        let mut reports = self.reports.write();
        if reports.len() == self.limit {
            reports.pop_front();
        }
        reports.push_back(report.clone());
        Ok(())
    }
}

/// Publishes to several targets. Every target is attempted; the first
/// error is returned.
#[derive(Default)]
pub struct FanoutPublisher {
    targets: Vec<Arc<dyn Publisher>>,
}

impl FanoutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: Arc<dyn Publisher>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl Publisher for FanoutPublisher {
    async fn publish(&self, report: &RunReport) -> Result<()> {
        let mut first_error: Option<BenchError> = None;
        for target in &self.targets {
            if let Err(e) = target.publish(report).await {
                tracing::error!(run_id = %report.run_id, error = %e, "Publisher failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(BenchError::Publish(e.to_string())),
            None => Ok(()),
        }
    }
}
