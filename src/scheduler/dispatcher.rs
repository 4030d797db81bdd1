use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collector::JobRecord;
use crate::error::{BenchError, Result};
use crate::scheduler::job::{AttemptOutcome, Settlement};
use crate::scheduler::pool::{PoolEvent, SlotClaim, WorkerPool};
use crate::scheduler::queue::Backlog;
use crate::scheduler::run::Run;
use crate::worker::{InvocationRequest, Invoker};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often in-flight jobs are checked against worker liveness, in
    /// addition to offline events.
    pub sweep_interval: Duration,
    pub report_channel_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(500),
            report_channel_size: 256,
        }
    }
}

/// Terminal report of one attempt, sent by its task.
#[derive(Debug)]
struct AttemptReport {
    job_id: Uuid,
    attempt: u32,
    claim: SlotClaim,
    outcome: AttemptOutcome,
}

#[derive(Debug)]
struct InFlight {
    claim: SlotClaim,
    attempt: u32,
    cancel: CancellationToken,
    // Detached: cancellation never waits for the attempt to acknowledge
    _handle: JoinHandle<()>,
}

/// Assigns the queued jobs of a run to worker slots and drives every job to
/// a final state.
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    invoker: Arc<dyn Invoker>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(pool: Arc<WorkerPool>, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            pool,
            invoker,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Dispatch every job of `run` until all of them are final or `cancel`
    /// fires. Final jobs are sent to `records` as they settle. On
    /// cancellation all unfinished jobs are cancelled, their workers
    /// released, and the run is returned without waiting for the attempts
    /// to stop.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if scheduler bookkeeping is found inconsistent
    /// (illegal job transition, double claim or release).
    pub async fn dispatch(
        &self,
        run: Run,
        records: mpsc::Sender<JobRecord>,
        cancel: CancellationToken,
    ) -> Result<Run> {
        let (reports_tx, reports_rx) = mpsc::channel(self.config.report_channel_size);
        let mut state = RunDispatch {
            pool: self.pool.clone(),
            invoker: self.invoker.clone(),
            backlog: Backlog::with_capacity(run.len().max(1)),
            in_flight: HashMap::new(),
            reports_tx,
            reports_rx,
            records,
            attempt_tokens: cancel.child_token(),
            run,
        };

        let submissions: Vec<(Uuid, u32)> =
            state.run.jobs().iter().map(|j| (j.id, j.priority)).collect();
        for (index, (job_id, priority)) in submissions.into_iter().enumerate() {
            state.backlog.push(job_id, priority, index);
        }

        tracing::info!(
            run_id = %state.run.id,
            jobs = state.run.len(),
            revision = %state.run.revision,
            "Dispatching run"
        );

        match self.drive(&mut state, &cancel).await {
            Ok(()) => Ok(state.run),
            Err(e) => {
                tracing::error!(run_id = %state.run.id, error = %e, "Dispatcher stopped on invariant violation");
                state.attempt_tokens.cancel();
                Err(e)
            }
        }
    }

    async fn drive(&self, state: &mut RunDispatch, cancel: &CancellationToken) -> Result<()> {
        let mut capacity = self.pool.capacity_signal();
        let mut events = self.pool.subscribe();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            capacity.borrow_and_update();
            state.assign_ready()?;
            state.check_bookkeeping()?;

            if state.backlog.is_empty() && state.in_flight.is_empty() {
                tracing::info!(run_id = %state.run.id, "All jobs final");
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    state.cancel_all().await?;
                    return Ok(());
                }

                Some(report) = state.reports_rx.recv() => {
                    state.handle_report(report).await?;
                }

                event = events.recv() => match event {
                    Ok(PoolEvent::WorkerOffline { worker_id, generation, .. }) => {
                        state.recover_worker(SlotClaim { worker_id, generation }).await?;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Pool events lagged, sweeping worker liveness");
                        state.sweep_offline().await?;
                    }
                    Err(RecvError::Closed) => {
                        return Err(BenchError::Internal("worker pool event channel closed".to_string()));
                    }
                },

                // Wait for capacity instead of polling
                _ = capacity.changed(), if !state.backlog.is_empty() => {}

                _ = sweep.tick(), if !state.in_flight.is_empty() => {
                    state.sweep_offline().await?;
                }
            }
        }
    }
}

/// Dispatcher state for one run. The dispatcher is the only writer of the
/// run's jobs while it is active.
struct RunDispatch {
    pool: Arc<WorkerPool>,
    invoker: Arc<dyn Invoker>,
    run: Run,
    backlog: Backlog,
    in_flight: HashMap<Uuid, InFlight>,
    reports_tx: mpsc::Sender<AttemptReport>,
    reports_rx: mpsc::Receiver<AttemptReport>,
    records: mpsc::Sender<JobRecord>,
    attempt_tokens: CancellationToken,
}

impl RunDispatch {
    /// Greedily claims workers for the head of the backlog.
    fn assign_ready(&mut self) -> Result<()> {
        while let Some(job_id) = self.backlog.peek() {
            let Some(claim) = self.pool.try_claim(job_id)? else {
                break;
            };
            self.backlog.pop();
            self.start_attempt(job_id, claim)?;
        }
        Ok(())
    }

    fn start_attempt(&mut self, job_id: Uuid, claim: SlotClaim) -> Result<()> {
        let worker_id = claim.worker_id;
        let endpoint = self.pool.endpoint(worker_id);
        let job = self
            .run
            .job_mut(&job_id)
            .ok_or(BenchError::JobNotFound(job_id))?;
        job.assign(worker_id)?;
        job.start()?;

        let request = InvocationRequest::for_job(job, endpoint);
        let attempt = request.attempt;
        tracing::info!(
            job_id = %job_id,
            job = %job.name,
            worker_id,
            attempt,
            "Job assigned"
        );

        let cancel = self.attempt_tokens.child_token();
        let invoker = self.invoker.clone();
        let reports = self.reports_tx.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = invoker.invoke(request, token).await;
            // The dispatcher is gone once the run closed
            let _ = reports
                .send(AttemptReport {
                    job_id,
                    attempt,
                    claim,
                    outcome,
                })
                .await;
        });

        self.in_flight.insert(
            job_id,
            InFlight {
                claim,
                attempt,
                cancel,
                _handle: handle,
            },
        );
        Ok(())
    }

    async fn handle_report(&mut self, report: AttemptReport) -> Result<()> {
        let current = self
            .in_flight
            .get(&report.job_id)
            .map(|f| (f.claim, f.attempt));
        if current != Some((report.claim, report.attempt)) {
            tracing::debug!(
                job_id = %report.job_id,
                attempt = report.attempt,
                worker_id = report.claim.worker_id,
                "Report from superseded attempt dropped"
            );
            return Ok(());
        }
        self.in_flight.remove(&report.job_id);
        self.pool.release(report.claim, &report.job_id)?;
        self.settle(report.job_id, report.outcome).await
    }

    async fn settle(&mut self, job_id: Uuid, outcome: AttemptOutcome) -> Result<()> {
        let submission = self
            .run
            .submission_index(&job_id)
            .ok_or(BenchError::JobNotFound(job_id))?;
        let job = self
            .run
            .job_mut(&job_id)
            .ok_or(BenchError::JobNotFound(job_id))?;

        match job.settle(outcome)? {
            Settlement::Retry => {
                tracing::info!(
                    job_id = %job_id,
                    job = %job.name,
                    retry_count = job.retry_count,
                    max_retries = job.max_retries,
                    last_failure = ?job.last_failure,
                    "Job requeued for retry"
                );
                let priority = job.priority;
                if !self.backlog.push(job_id, priority, submission) {
                    return Err(BenchError::InvariantViolation(format!(
                        "job {} requeued while already queued",
                        job_id
                    )));
                }
                Ok(())
            }
            Settlement::Final => {
                if job.is_permanent_failure() {
                    tracing::warn!(
                        job_id = %job_id,
                        job = %job.name,
                        failures = ?job.failures,
                        "Job failed permanently"
                    );
                }
                self.finalize(job_id).await
            }
        }
    }

    async fn finalize(&mut self, job_id: Uuid) -> Result<()> {
        let job = self.run.job(&job_id).ok_or(BenchError::JobNotFound(job_id))?;
        self.deliver(JobRecord::from_job(job)).await;
        Ok(())
    }

    async fn deliver(&self, record: JobRecord) {
        let job_id = record.job_id;
        if self.records.send(record).await.is_err() {
            tracing::debug!(job_id = %job_id, "Collector closed, record not delivered");
        }
    }

    /// Treats every in-flight job on a lost worker registration as an
    /// infrastructure failure; the usual retry policy applies.
    async fn recover_worker(&mut self, claim: SlotClaim) -> Result<()> {
        let worker_id = claim.worker_id;
        let lost: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.claim == claim)
            .map(|(id, _)| *id)
            .collect();

        for job_id in lost {
            if let Some(flight) = self.in_flight.remove(&job_id) {
                flight.cancel.cancel();
            }
            self.pool.release(claim, &job_id)?;
            tracing::warn!(job_id = %job_id, worker_id, "Job orphaned by lost worker");
            self.settle(
                job_id,
                AttemptOutcome::infrastructure_failure(format!("worker {} went offline", worker_id)),
            )
            .await?;
        }
        Ok(())
    }

    async fn sweep_offline(&mut self) -> Result<()> {
        let lost: HashSet<SlotClaim> = self
            .in_flight
            .values()
            .map(|f| f.claim)
            .filter(|claim| !self.pool.is_claim_live(claim))
            .collect();
        for claim in lost {
            self.recover_worker(claim).await?;
        }
        Ok(())
    }

    /// Cancels everything that is not final. Running attempts are signalled
    /// but not awaited.
    async fn cancel_all(&mut self) -> Result<()> {
        let in_flight: Vec<(Uuid, InFlight)> = self.in_flight.drain().collect();
        let queued = self.backlog.drain();
        tracing::info!(
            run_id = %self.run.id,
            running = in_flight.len(),
            queued = queued.len(),
            "Cancelling unfinished jobs"
        );
        if !in_flight.is_empty() || !queued.is_empty() {
            self.run.mark_partial();
        }

        for (job_id, flight) in in_flight {
            flight.cancel.cancel();
            self.pool.release(flight.claim, &job_id)?;
            self.cancel_job(job_id).await?;
        }
        for job_id in queued {
            self.cancel_job(job_id).await?;
        }
        Ok(())
    }

    async fn cancel_job(&mut self, job_id: Uuid) -> Result<()> {
        let job = self
            .run
            .job_mut(&job_id)
            .ok_or(BenchError::JobNotFound(job_id))?;
        if job.cancel()? {
            let record = JobRecord::closed_by_run(job);
            self.deliver(record).await;
        }
        Ok(())
    }

    /// Every job holding a worker must be tracked as in flight.
    fn check_bookkeeping(&self) -> Result<()> {
        let holding = self.run.holding_worker();
        if holding != self.in_flight.len() {
            return Err(BenchError::InvariantViolation(format!(
                "{} jobs hold workers but {} attempts are in flight",
                holding,
                self.in_flight.len()
            )));
        }
        Ok(())
    }
}
