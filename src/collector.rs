use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::scheduler::{FailureCounts, FailureKind, Job, JobState, ResultPayload, Run, RunState};

/// Final outcome of one job, as handed from the dispatcher to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub name: String,
    pub state: JobState,
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    pub failures: FailureCounts,
    pub error: Option<String>,
    pub payload: Option<ResultPayload>,
    /// Cancelled because the run closed before the job finished.
    #[serde(default)]
    pub closed_by_run: bool,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            state: job.state(),
            attempts: job.attempt(),
            failure: job.last_failure,
            failures: job.failures,
            error: job.error.clone(),
            payload: job.result.clone(),
            closed_by_run: false,
        }
    }

    /// Record of a job the run closed on.
    pub fn closed_by_run(job: &Job) -> Self {
        Self {
            closed_by_run: true,
            ..Self::from_job(job)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportState {
    Succeeded,
    /// Failed or timed out on every allowed attempt.
    PermanentFailure,
    Cancelled,
}

impl ReportState {
    fn from_job_state(state: JobState) -> Option<Self> {
        match state {
            JobState::Succeeded => Some(ReportState::Succeeded),
            JobState::Failed | JobState::TimedOut => Some(ReportState::PermanentFailure),
            JobState::Cancelled => Some(ReportState::Cancelled),
            JobState::Queued | JobState::Assigned | JobState::Running => None,
        }
    }
}

impl std::fmt::Display for ReportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportState::Succeeded => write!(f, "succeeded"),
            ReportState::PermanentFailure => write!(f, "permanent_failure"),
            ReportState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub job_id: Uuid,
    pub name: String,
    pub state: ReportState,
    pub failure: Option<FailureKind>,
    pub attempts: u32,
    pub failures: FailureCounts,
    pub metrics: BTreeMap<String, f64>,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
}

impl ReportEntry {
    fn cancelled(job_id: Uuid, name: String) -> Self {
        Self {
            job_id,
            name,
            state: ReportState::Cancelled,
            failure: None,
            attempts: 0,
            failures: FailureCounts::default(),
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
            error: Some("run closed before the job finished".to_string()),
        }
    }
}

/// The aggregated, order-preserving summary of a closed run. This is the
/// document handed to publishers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunState,
    pub revision: String,
    pub created_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub jobs: Vec<ReportEntry>,
}

impl RunReport {
    pub fn entry(&self, name: &str) -> Option<&ReportEntry> {
        self.jobs.iter().find(|e| e.name == name)
    }

    pub fn count(&self, state: ReportState) -> usize {
        self.jobs.iter().filter(|e| e.state == state).count()
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            run_id: self.run_id,
            status: self.status,
            revision: self.revision.clone(),
            generated_at: self.generated_at,
            succeeded: self.count(ReportState::Succeeded),
            permanent_failures: self.count(ReportState::PermanentFailure),
            cancelled: self.count(ReportState::Cancelled),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub run_id: Uuid,
    pub status: RunState,
    pub revision: String,
    pub generated_at: DateTime<Utc>,
    pub succeeded: usize,
    pub permanent_failures: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted,
    /// The job was already final; the record was dropped.
    Duplicate,
    UnknownJob,
    /// Only terminal states are recorded.
    NotTerminal,
}

/// Accumulates final job outcomes of one run into its report.
///
/// Records arrive in completion order; the report lists jobs in submission
/// order.
pub struct ResultCollector {
    run_id: Uuid,
    revision: String,
    created_at: DateTime<Utc>,
    order: Vec<(Uuid, String)>,
    entries: HashMap<Uuid, ReportEntry>,
    closed_partial: bool,
    records: mpsc::Receiver<JobRecord>,
}

impl ResultCollector {
    /// Creates the collector for `run` and the sender the dispatcher uses to
    /// deliver records. The channel holds one record per job, so senders
    /// never wait.
    pub fn new(run: &Run) -> (Self, mpsc::Sender<JobRecord>) {
        let (tx, rx) = mpsc::channel(run.len().max(1));
        let collector = Self {
            run_id: run.id,
            revision: run.revision.clone(),
            created_at: run.created_at,
            order: run.jobs().iter().map(|j| (j.id, j.name.clone())).collect(),
            entries: HashMap::new(),
            closed_partial: false,
            records: rx,
        };
        (collector, tx)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Idempotent per job: a second record for a finalized job is dropped.
    pub fn record(&mut self, record: JobRecord) -> RecordOutcome {
        if !self.order.iter().any(|(id, _)| *id == record.job_id) {
            tracing::warn!(run_id = %self.run_id, job_id = %record.job_id, "Record for unknown job dropped");
            return RecordOutcome::UnknownJob;
        }
        let Some(state) = ReportState::from_job_state(record.state) else {
            tracing::warn!(job_id = %record.job_id, state = %record.state, "Non-terminal record dropped");
            return RecordOutcome::NotTerminal;
        };
        if let Some(existing) = self.entries.get(&record.job_id) {
            tracing::warn!(
                run_id = %self.run_id,
                job_id = %record.job_id,
                recorded = %existing.state,
                duplicate = %state,
                "Duplicate terminal report dropped"
            );
            return RecordOutcome::Duplicate;
        }

        let (metrics, artifacts) = match record.payload {
            Some(payload) => (payload.metrics, payload.artifacts),
            None => (BTreeMap::new(), Vec::new()),
        };
        tracing::debug!(job_id = %record.job_id, job = %record.name, state = %state, "Job recorded");
        self.closed_partial |= record.closed_by_run;
        self.entries.insert(
            record.job_id,
            ReportEntry {
                job_id: record.job_id,
                name: record.name,
                state,
                failure: record.failure,
                attempts: record.attempts,
                failures: record.failures,
                metrics,
                artifacts,
                error: record.error,
            },
        );
        RecordOutcome::Accepted
    }

    pub fn recorded(&self) -> usize {
        self.entries.len()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.len() == self.order.len()
    }

    /// Waits for every job to be recorded, at most until `deadline`. Jobs
    /// still missing at that point are listed as cancelled and the report is
    /// `PartialComplete`, as is a report with any job the run closed on.
    /// Also returns early when all senders are gone.
    pub async fn close(mut self, deadline: Instant) -> RunReport {
        while !self.is_complete() {
            match tokio::time::timeout_at(deadline, self.records.recv()).await {
                Ok(Some(record)) => {
                    self.record(record);
                }
                Ok(None) => {
                    tracing::debug!(run_id = %self.run_id, "Record channel closed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        run_id = %self.run_id,
                        missing = self.order.len() - self.entries.len(),
                        "Run deadline elapsed with jobs outstanding"
                    );
                    break;
                }
            }
        }
        // Drain anything already delivered before giving up on stragglers
        while let Ok(record) = self.records.try_recv() {
            self.record(record);
        }
        self.records.close();

        let status = if self.is_complete() && !self.closed_partial {
            RunState::Complete
        } else {
            RunState::PartialComplete
        };
        let mut entries = std::mem::take(&mut self.entries);
        let jobs = self
            .order
            .iter()
            .map(|(id, name)| {
                entries
                    .remove(id)
                    .unwrap_or_else(|| ReportEntry::cancelled(*id, name.clone()))
            })
            .collect();

        let report = RunReport {
            run_id: self.run_id,
            status,
            revision: self.revision.clone(),
            created_at: self.created_at,
            generated_at: Utc::now(),
            jobs,
        };
        tracing::info!(
            run_id = %report.run_id,
            status = %report.status,
            succeeded = report.count(ReportState::Succeeded),
            permanent_failures = report.count(ReportState::PermanentFailure),
            cancelled = report.count(ReportState::Cancelled),
            "Run closed"
        );
        report
    }
}
