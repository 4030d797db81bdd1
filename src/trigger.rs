use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collector::{ReportSummary, ResultCollector, RunReport};
use crate::config::ScheduleConfig;
use crate::error::{BenchError, Result};
use crate::publisher::Publisher;
use crate::revision::RevisionSource;
use crate::scheduler::{Dispatcher, JobSpec, Run};

/// How long shutdown waits for the active run to cancel and publish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    Idle,
    Preparing,
    Running,
    Closing,
}

impl std::fmt::Display for TriggerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerPhase::Idle => write!(f, "idle"),
            TriggerPhase::Preparing => write!(f, "preparing"),
            TriggerPhase::Running => write!(f, "running"),
            TriggerPhase::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Cadence,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerResponse {
    Started { run_id: Uuid },
    /// Will start once the active run closes.
    Queued { position: usize },
    /// A run is active; the trigger was a no-op.
    Coalesced { active_run: Option<Uuid> },
    /// Scheduling stopped after an invariant violation.
    Halted { reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopStatus {
    pub phase: Option<TriggerPhase>,
    pub active_run: Option<Uuid>,
    pub pending_runs: usize,
    pub runs_started: u64,
    pub runs_completed: u64,
    pub coalesced_triggers: u64,
    pub last_report: Option<ReportSummary>,
    pub halted: Option<String>,
}

impl LoopStatus {
    pub fn phase(&self) -> TriggerPhase {
        self.phase.unwrap_or(TriggerPhase::Idle)
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// None: manual triggers only
    pub cadence: Option<Duration>,
    pub run_deadline: Duration,
    pub max_pending_runs: usize,
}

impl From<&ScheduleConfig> for TriggerConfig {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            cadence: config.cadence(),
            run_deadline: config.run_deadline(),
            max_pending_runs: config.max_pending_runs,
        }
    }
}

/// Executes one run end to end: resolve the revision, dispatch, close the
/// collector at the run deadline and publish the report.
pub struct RunExecutor {
    specs: Arc<Vec<JobSpec>>,
    revision: Arc<dyn RevisionSource>,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<dyn Publisher>,
    run_deadline: Duration,
    status: Arc<watch::Sender<LoopStatus>>,
}

impl RunExecutor {
    pub fn new(
        specs: Vec<JobSpec>,
        revision: Arc<dyn RevisionSource>,
        dispatcher: Arc<Dispatcher>,
        publisher: Arc<dyn Publisher>,
        run_deadline: Duration,
    ) -> Self {
        let (status, _) = watch::channel(LoopStatus::default());
        Self {
            specs: Arc::new(specs),
            revision,
            dispatcher,
            publisher,
            run_deadline,
            status: Arc::new(status),
        }
    }

    fn set_phase(&self, phase: TriggerPhase, run_id: Option<Uuid>) {
        self.status.send_modify(|s| {
            s.phase = Some(phase);
            s.active_run = run_id;
        });
    }

    /// Returns `Ok(None)` if no run could be prepared. Errors are fatal
    /// scheduler faults; everything else is logged and absorbed.
    pub async fn execute(&self, run_id: Uuid, cancel: CancellationToken) -> Result<Option<RunReport>> {
        self.set_phase(TriggerPhase::Preparing, Some(run_id));
        let revision = match self.revision.resolve().await {
            Ok(revision) => revision,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Could not resolve revision, run skipped");
                return Ok(None);
            }
        };

        let run = Run::with_id(run_id, revision, &self.specs);
        let (collector, records) = ResultCollector::new(&run);
        let deadline = Instant::now() + self.run_deadline;
        tracing::info!(
            run_id = %run_id,
            revision = %run.revision,
            jobs = run.len(),
            deadline_secs = self.run_deadline.as_secs(),
            "Run started"
        );

        self.set_phase(TriggerPhase::Running, Some(run_id));
        let dispatch_token = cancel.child_token();
        let dispatcher = self.dispatcher.clone();
        let token = dispatch_token.clone();
        let dispatch = tokio::spawn(async move { dispatcher.dispatch(run, records, token).await });

        let report = collector.close(deadline).await;

        self.set_phase(TriggerPhase::Closing, Some(run_id));
        dispatch_token.cancel();
        let run = dispatch
            .await
            .map_err(|e| BenchError::Internal(format!("dispatcher task failed: {}", e)))??;
        tracing::debug!(run_id = %run_id, state = %run.state(), "Dispatcher released run");

        if let Err(e) = self.publisher.publish(&report).await {
            tracing::error!(run_id = %run_id, error = %e, "Publishing report failed");
        }
        Ok(Some(report))
    }
}

struct TriggerRequest {
    source: TriggerSource,
    respond: oneshot::Sender<TriggerResponse>,
}

/// Client side of the trigger loop.
#[derive(Clone)]
pub struct TriggerHandle {
    requests: mpsc::Sender<TriggerRequest>,
    status: watch::Receiver<LoopStatus>,
}

impl TriggerHandle {
    pub async fn trigger(&self, source: TriggerSource) -> Result<TriggerResponse> {
        let (respond, response) = oneshot::channel();
        self.requests
            .send(TriggerRequest { source, respond })
            .await
            .map_err(|_| BenchError::Internal("trigger loop stopped".to_string()))?;
        response
            .await
            .map_err(|_| BenchError::Internal("trigger loop dropped the request".to_string()))
    }

    pub fn status(&self) -> LoopStatus {
        self.status.borrow().clone()
    }

    /// Resolves once at least `count` runs have completed.
    pub async fn wait_for_runs(&self, count: u64) -> Result<LoopStatus> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.runs_completed >= count)
            .await
            .map(|s| s.clone())
            .map_err(|_| BenchError::Internal("trigger loop stopped".to_string()))
    }
}

struct ActiveRun {
    run_id: Uuid,
    handle: JoinHandle<Result<Option<RunReport>>>,
}

/// Top-level control loop. Starts a run on every cadence tick or manual
/// trigger unless one is already active, in which case the trigger is
/// coalesced (or queued up to `max_pending_runs`). Runs never overlap.
pub struct TriggerLoop {
    config: TriggerConfig,
    executor: Arc<RunExecutor>,
    requests: mpsc::Receiver<TriggerRequest>,
    active: Option<ActiveRun>,
    pending: VecDeque<TriggerSource>,
}

impl TriggerLoop {
    pub fn new(config: TriggerConfig, executor: RunExecutor) -> (Self, TriggerHandle) {
        let (requests_tx, requests) = mpsc::channel(32);
        let handle = TriggerHandle {
            requests: requests_tx,
            status: executor.status.subscribe(),
        };
        let trigger_loop = Self {
            config,
            executor: Arc::new(executor),
            requests,
            active: None,
            pending: VecDeque::new(),
        };
        (trigger_loop, handle)
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut cadence = self.config.cadence.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        self.executor.set_phase(TriggerPhase::Idle, None);
        tracing::info!(
            cadence_secs = ?self.config.cadence.map(|c| c.as_secs()),
            run_deadline_secs = self.config.run_deadline.as_secs(),
            "Trigger loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(request) = self.requests.recv() => {
                    let response = self.on_trigger(request.source, &shutdown);
                    let _ = request.respond.send(response);
                }

                _ = next_tick(&mut cadence) => {
                    let response = self.on_trigger(TriggerSource::Cadence, &shutdown);
                    tracing::debug!(response = ?response, "Cadence tick");
                }

                (run_id, result) = join_active(&mut self.active) => {
                    self.active = None;
                    self.on_run_finished(run_id, result);
                    if let Some(source) = self.next_pending() {
                        self.start_run(source, &shutdown);
                    }
                }
            }
        }

        if let Some(active) = self.active.take() {
            tracing::info!(run_id = %active.run_id, "Shutting down, waiting for active run to close");
            match tokio::time::timeout(SHUTDOWN_GRACE, active.handle).await {
                Ok(result) => self.on_run_finished(active.run_id, result),
                Err(_) => tracing::warn!(run_id = %active.run_id, "Active run did not close in time"),
            }
        }
        tracing::info!("Trigger loop stopped");
    }

    fn on_trigger(&mut self, source: TriggerSource, shutdown: &CancellationToken) -> TriggerResponse {
        if let Some(reason) = self.executor.status.borrow().halted.clone() {
            tracing::warn!(source = ?source, "Trigger rejected, scheduling halted");
            return TriggerResponse::Halted { reason };
        }

        if let Some(ref active) = self.active {
            if self.pending.len() < self.config.max_pending_runs {
                self.pending.push_back(source);
                let position = self.pending.len();
                self.executor.status.send_modify(|s| s.pending_runs = position);
                tracing::info!(source = ?source, position, "Run queued behind active run");
                return TriggerResponse::Queued { position };
            }
            let active_run = active.run_id;
            self.executor
                .status
                .send_modify(|s| s.coalesced_triggers += 1);
            tracing::info!(source = ?source, active_run = %active_run, "Run active, trigger coalesced");
            return TriggerResponse::Coalesced {
                active_run: Some(active_run),
            };
        }

        let run_id = self.start_run(source, shutdown);
        TriggerResponse::Started { run_id }
    }

    fn next_pending(&mut self) -> Option<TriggerSource> {
        if self.executor.status.borrow().halted.is_some() {
            return None;
        }
        let next = self.pending.pop_front();
        let remaining = self.pending.len();
        self.executor.status.send_modify(|s| s.pending_runs = remaining);
        next
    }

    fn start_run(&mut self, source: TriggerSource, shutdown: &CancellationToken) -> Uuid {
        let run_id = Uuid::new_v4();
        let executor = self.executor.clone();
        let token = shutdown.child_token();
        tracing::info!(run_id = %run_id, source = ?source, "Triggering run");
        self.executor.status.send_modify(|s| s.runs_started += 1);
        let handle = tokio::spawn(async move { executor.execute(run_id, token).await });
        self.active = Some(ActiveRun { run_id, handle });
        run_id
    }

    fn on_run_finished(
        &mut self,
        run_id: Uuid,
        result: std::result::Result<Result<Option<RunReport>>, JoinError>,
    ) {
        let (summary, halted) = match result {
            Ok(Ok(report)) => (report.map(|r| r.summary()), None),
            Ok(Err(e)) if e.is_fatal() => {
                tracing::error!(
                    run_id = %run_id,
                    error = %e,
                    "Scheduler state corrupted, halting new runs pending investigation"
                );
                (None, Some(e.to_string()))
            }
            Ok(Err(e)) => {
                tracing::error!(run_id = %run_id, error = %e, "Run failed");
                (None, None)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Run task panicked");
                (None, None)
            }
        };

        self.executor.status.send_modify(|s| {
            s.phase = Some(TriggerPhase::Idle);
            s.active_run = None;
            s.runs_completed += 1;
            if summary.is_some() {
                s.last_report = summary;
            }
            if halted.is_some() {
                s.halted = halted;
            }
        });
    }
}

async fn next_tick(cadence: &mut Option<Interval>) {
    match cadence {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn join_active(
    active: &mut Option<ActiveRun>,
) -> (Uuid, std::result::Result<Result<Option<RunReport>>, JoinError>) {
    match active {
        Some(active) => {
            let result = (&mut active.handle).await;
            (active.run_id, result)
        }
        None => std::future::pending().await,
    }
}
