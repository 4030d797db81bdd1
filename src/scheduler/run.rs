use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::job::{Job, JobSpec, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Some jobs have not reached a terminal state.
    Pending,
    /// Every job is terminal.
    Complete,
    /// Closed by the run deadline with stragglers.
    PartialComplete,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Complete => write!(f, "complete"),
            RunState::PartialComplete => write!(f, "partial_complete"),
        }
    }
}

/// A batch of jobs sharing one revision and one report.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub revision: String,
    pub created_at: DateTime<Utc>,
    jobs: Vec<Job>,
    #[serde(skip_serializing)]
    index: HashMap<Uuid, usize>,
    closed_partial: bool,
}

impl Run {
    pub fn new(revision: impl Into<String>, specs: &[JobSpec]) -> Self {
        Self::with_id(Uuid::new_v4(), revision, specs)
    }

    pub fn with_id(id: Uuid, revision: impl Into<String>, specs: &[JobSpec]) -> Self {
        let revision = revision.into();
        let jobs: Vec<Job> = specs.iter().map(|spec| Job::new(spec, &revision)).collect();
        let index = jobs.iter().enumerate().map(|(i, j)| (j.id, i)).collect();
        Self {
            id,
            revision,
            created_at: Utc::now(),
            jobs,
            index,
            closed_partial: false,
        }
    }

    /// Jobs in submission order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: &Uuid) -> Option<&Job> {
        self.index.get(id).map(|&i| &self.jobs[i])
    }

    pub fn job_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.index.get(id).map(|&i| &mut self.jobs[i])
    }

    /// Position of the job in submission order.
    pub fn submission_index(&self, id: &Uuid) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn job_by_name(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn count_in(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state() == state).count()
    }

    /// Jobs currently holding a worker slot.
    pub fn holding_worker(&self) -> usize {
        self.jobs.iter().filter(|j| j.state().holds_worker()).count()
    }

    pub fn mark_partial(&mut self) {
        self.closed_partial = true;
    }

    pub fn state(&self) -> RunState {
        if self.closed_partial {
            RunState::PartialComplete
        } else if self.jobs.iter().all(|j| j.state().is_terminal()) {
            RunState::Complete
        } else {
            RunState::Pending
        }
    }
}
