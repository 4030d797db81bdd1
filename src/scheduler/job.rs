use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BenchError, Result};

/// How a benchmark is invoked. The dispatcher never looks inside; only the
/// agent runner interprets the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// Run through the configured shell (`sh -c <command>`).
    Shell(String),
    /// Spawn a program directly with an argument list.
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// In-process benchmark registered under this name.
    Callable(String),
    /// Forward a shell command to a remote agent.
    Remote { endpoint: String, command: String },
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invocation::Shell(cmd) => write!(f, "shell:{}", cmd),
            Invocation::Exec { program, args } => write!(f, "exec:{} {}", program, args.join(" ")),
            Invocation::Callable(name) => write!(f, "callable:{}", name),
            Invocation::Remote { endpoint, command } => write!(f, "remote:{}:{}", endpoint, command),
        }
    }
}

/// One entry of the benchmark suite, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub name: String,
    pub command: Invocation,
    /// Pins the job to a revision instead of the run's resolved one.
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(rename = "time_budget_secs", with = "crate::config::duration_secs")]
    pub time_budget: Duration,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

impl JobSpec {
    pub fn new(name: impl Into<String>, command: Invocation, time_budget: Duration) -> Self {
        Self {
            name: name.into(),
            command,
            revision: None,
            time_budget,
            priority: 0,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }

    /// Assigned or Running: the job holds a worker slot.
    pub fn holds_worker(&self) -> bool {
        matches!(self, JobState::Assigned | JobState::Running)
    }

    fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Assigned)
                | (Assigned, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
                | (Queued, Cancelled)
                | (Assigned, Cancelled)
                | (Failed, Queued)
                | (TimedOut, Queued)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::TimedOut => write!(f, "timed_out"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-zero exit or malformed result payload.
    Command,
    /// Time budget exceeded.
    Timeout,
    /// Worker lost or agent unreachable; not attributed to the benchmark.
    Infrastructure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Command => write!(f, "command"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

/// Structured result emitted by a benchmark on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl ResultPayload {
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }
}

/// The single terminal report of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded { payload: ResultPayload },
    Failed { kind: FailureKind, reason: String },
    TimedOut { budget_ms: u64 },
    Cancelled,
}

impl AttemptOutcome {
    pub fn command_failure(reason: impl Into<String>) -> Self {
        AttemptOutcome::Failed {
            kind: FailureKind::Command,
            reason: reason.into(),
        }
    }

    pub fn infrastructure_failure(reason: impl Into<String>) -> Self {
        AttemptOutcome::Failed {
            kind: FailureKind::Infrastructure,
            reason: reason.into(),
        }
    }

    pub fn timed_out(budget: Duration) -> Self {
        AttemptOutcome::TimedOut {
            budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            AttemptOutcome::Succeeded { .. } => JobState::Succeeded,
            AttemptOutcome::Failed { .. } => JobState::Failed,
            AttemptOutcome::TimedOut { .. } => JobState::TimedOut,
            AttemptOutcome::Cancelled => JobState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    pub command: u32,
    pub timeout: u32,
    pub infrastructure: u32,
}

impl FailureCounts {
    fn bump(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Command => self.command += 1,
            FailureKind::Timeout => self.timeout += 1,
            FailureKind::Infrastructure => self.infrastructure += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.command + self.timeout + self.infrastructure
    }
}

/// What the dispatcher must do after an attempt has been settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The job re-entered the backlog as a new attempt.
    Retry,
    /// The job reached its final state for this run.
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub command: Invocation,
    pub revision: String,
    pub time_budget: Duration,
    pub priority: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    state: JobState,
    pub assigned_worker: Option<u64>,
    pub failures: FailureCounts,
    pub last_failure: Option<FailureKind>,
    pub error: Option<String>,
    pub result: Option<ResultPayload>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: &JobSpec, run_revision: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            command: spec.command.clone(),
            revision: spec
                .revision
                .clone()
                .unwrap_or_else(|| run_revision.to_string()),
            time_budget: spec.time_budget,
            priority: spec.priority,
            retry_count: 0,
            max_retries: spec.max_retries,
            state: JobState::Queued,
            assigned_worker: None,
            failures: FailureCounts::default(),
            last_failure: None,
            error: None,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Compare-and-set on the state field. Fails if the job is not in `from`
    /// or the edge is not part of the lifecycle.
    pub fn transition(&mut self, from: JobState, to: JobState) -> Result<()> {
        if self.state != from || !from.can_transition_to(to) {
            return Err(BenchError::IllegalTransition {
                job_id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn assign(&mut self, worker_id: u64) -> Result<()> {
        self.transition(JobState::Queued, JobState::Assigned)?;
        self.assigned_worker = Some(worker_id);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(JobState::Assigned, JobState::Running)
    }

    /// Applies the terminal outcome of the current attempt. Failures and
    /// timeouts are retried while `retry_count < max_retries`.
    pub fn settle(&mut self, outcome: AttemptOutcome) -> Result<Settlement> {
        let to = outcome.state();
        self.transition(JobState::Running, to)?;
        self.assigned_worker = None;

        let kind = match outcome {
            AttemptOutcome::Succeeded { payload } => {
                self.result = Some(payload);
                self.error = None;
                None
            }
            AttemptOutcome::Failed { kind, reason } => {
                self.error = Some(reason);
                Some(kind)
            }
            AttemptOutcome::TimedOut { budget_ms } => {
                self.error = Some(format!("time budget of {}ms exceeded", budget_ms));
                Some(FailureKind::Timeout)
            }
            AttemptOutcome::Cancelled => None,
        };

        if let Some(kind) = kind {
            self.failures.bump(kind);
            self.last_failure = Some(kind);
            if self.retry_count < self.max_retries {
                self.transition(to, JobState::Queued)?;
                self.retry_count += 1;
                return Ok(Settlement::Retry);
            }
        }

        self.completed_at = Some(Utc::now());
        Ok(Settlement::Final)
    }

    /// Cancels a job that has not reached a terminal state. Returns false if
    /// it already had.
    pub fn cancel(&mut self) -> Result<bool> {
        if self.state.is_terminal() {
            return Ok(false);
        }
        self.transition(self.state, JobState::Cancelled)?;
        self.assigned_worker = None;
        self.completed_at = Some(Utc::now());
        Ok(true)
    }

    /// Final failure after retries were exhausted.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self.state, JobState::Failed | JobState::TimedOut)
    }
}
