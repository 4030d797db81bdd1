//! Integration tests for the trigger loop.
//!
//! These tests validate that:
//! - Runs never overlap: triggers during an active run are coalesced or
//!   queued up to the configured bound.
//! - Cadence ticks start runs on their own.
//! - A scheduler invariant violation halts all further runs.
//! - Revision failures skip a run without halting.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nightbench::collector::ReportState;
use nightbench::error::{BenchError, Result};
use nightbench::publisher::ReportHistory;
use nightbench::revision::RevisionSource;
use nightbench::scheduler::{AttemptOutcome, ResultPayload, RunState, SlotClaim, WorkerPool};
use nightbench::trigger::{
    RunExecutor, TriggerConfig, TriggerHandle, TriggerLoop, TriggerPhase, TriggerResponse,
    TriggerSource,
};
use nightbench::worker::{InvocationRequest, Invoker};
use test_harness::{dispatcher, executor, pool_with_workers, spec, ScriptedInvoker, Step};

fn manual_only(max_pending_runs: usize) -> TriggerConfig {
    TriggerConfig {
        cadence: None,
        run_deadline: Duration::from_secs(10),
        max_pending_runs,
    }
}

fn start_loop(config: TriggerConfig, executor: RunExecutor) -> (TriggerHandle, CancellationToken) {
    let (trigger_loop, handle) = TriggerLoop::new(config, executor);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { trigger_loop.run(token).await });
    (handle, shutdown)
}

async fn wait_for_runs(handle: &TriggerHandle, count: u64) {
    tokio::time::timeout(Duration::from_secs(5), handle.wait_for_runs(count))
        .await
        .expect("runs should complete")
        .unwrap();
}

#[tokio::test]
async fn test_trigger_runs_and_publishes() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let history = Arc::new(ReportHistory::new(10));
    let exec = executor(
        vec![spec("a"), spec("b")],
        dispatcher(pool_with_workers(2, 1), invoker),
        history.clone(),
        Duration::from_secs(10),
    );
    let (handle, shutdown) = start_loop(manual_only(0), exec);

    let response = handle.trigger(TriggerSource::Manual).await.unwrap();
    let run_id = match response {
        TriggerResponse::Started { run_id } => run_id,
        other => panic!("expected a started run, got {:?}", other),
    };
    wait_for_runs(&handle, 1).await;

    let report = history.latest().unwrap();
    assert_eq!(report.run_id, run_id);
    assert_eq!(report.revision, "rev-test");
    assert_eq!(report.status, RunState::Complete);
    assert_eq!(report.count(ReportState::Succeeded), 2);

    let status = handle.status();
    assert_eq!(status.phase(), TriggerPhase::Idle);
    assert!(status.active_run.is_none());
    assert_eq!(status.runs_started, 1);
    assert_eq!(status.last_report.unwrap().run_id, run_id);

    shutdown.cancel();
}

#[tokio::test]
async fn test_trigger_while_running_is_coalesced() {
    let invoker = Arc::new(
        ScriptedInvoker::new().script("slow", vec![Step::succeed(200, "reward", 1.0)]),
    );
    let history = Arc::new(ReportHistory::new(10));
    let exec = executor(
        vec![spec("slow")],
        dispatcher(pool_with_workers(4, 1), invoker.clone()),
        history.clone(),
        Duration::from_secs(10),
    );
    let (handle, shutdown) = start_loop(manual_only(0), exec);

    let first = handle.trigger(TriggerSource::Manual).await.unwrap();
    let TriggerResponse::Started { run_id } = first else {
        panic!("expected a started run, got {:?}", first);
    };
    for source in [TriggerSource::Manual, TriggerSource::Cadence] {
        assert_eq!(
            handle.trigger(source).await.unwrap(),
            TriggerResponse::Coalesced {
                active_run: Some(run_id)
            }
        );
    }

    wait_for_runs(&handle, 1).await;
    let status = handle.status();
    assert_eq!(status.runs_started, 1);
    assert_eq!(status.coalesced_triggers, 2);
    assert_eq!(history.len(), 1);
    // Only one run's job was ever executing
    assert_eq!(invoker.calls_for("slow"), 1);
    assert_eq!(invoker.max_running(), 1);

    // Idle again: the next trigger starts a fresh run
    assert!(matches!(
        handle.trigger(TriggerSource::Manual).await.unwrap(),
        TriggerResponse::Started { .. }
    ));
    wait_for_runs(&handle, 2).await;
    assert_eq!(history.len(), 2);

    shutdown.cancel();
}

#[tokio::test]
async fn test_pending_runs_are_queued() {
    let invoker = Arc::new(
        ScriptedInvoker::new().script("slow", vec![Step::succeed(150, "reward", 1.0)]),
    );
    let history = Arc::new(ReportHistory::new(10));
    let exec = executor(
        vec![spec("slow")],
        dispatcher(pool_with_workers(2, 1), invoker.clone()),
        history.clone(),
        Duration::from_secs(10),
    );
    let (handle, shutdown) = start_loop(manual_only(1), exec);

    assert!(matches!(
        handle.trigger(TriggerSource::Manual).await.unwrap(),
        TriggerResponse::Started { .. }
    ));
    assert_eq!(
        handle.trigger(TriggerSource::Manual).await.unwrap(),
        TriggerResponse::Queued { position: 1 }
    );
    assert_eq!(handle.status().pending_runs, 1);
    assert!(matches!(
        handle.trigger(TriggerSource::Manual).await.unwrap(),
        TriggerResponse::Coalesced { .. }
    ));

    wait_for_runs(&handle, 2).await;
    let status = handle.status();
    assert_eq!(status.runs_started, 2);
    assert_eq!(status.pending_runs, 0);
    assert_eq!(history.len(), 2);
    // The queued run started only after the first closed
    assert_eq!(invoker.max_running(), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_cadence_starts_runs() {
    let history = Arc::new(ReportHistory::new(10));
    let exec = executor(
        vec![spec("a")],
        dispatcher(pool_with_workers(1, 1), Arc::new(ScriptedInvoker::new())),
        history.clone(),
        Duration::from_secs(10),
    );
    let config = TriggerConfig {
        cadence: Some(Duration::from_millis(50)),
        run_deadline: Duration::from_secs(10),
        max_pending_runs: 0,
    };
    let (handle, shutdown) = start_loop(config, exec);

    wait_for_runs(&handle, 2).await;
    assert!(history.len() >= 2);

    shutdown.cancel();
}

/// Frees its own worker slot behind the dispatcher's back, corrupting the
/// pool bookkeeping.
struct SlotThief {
    pool: Arc<WorkerPool>,
}

#[async_trait]
impl Invoker for SlotThief {
    async fn invoke(&self, request: InvocationRequest, _cancel: CancellationToken) -> AttemptOutcome {
        if let Some(worker) = self
            .pool
            .workers()
            .into_iter()
            .find(|w| w.jobs.contains(&request.job_id))
        {
            let claim = SlotClaim {
                worker_id: worker.id,
                generation: worker.generation,
            };
            self.pool.release(claim, &request.job_id).unwrap();
        }
        AttemptOutcome::Succeeded {
            payload: ResultPayload::default(),
        }
    }
}

#[tokio::test]
async fn test_invariant_violation_halts_loop() {
    let pool = pool_with_workers(1, 1);
    let dispatcher = Arc::new(nightbench::scheduler::Dispatcher::new(
        pool.clone(),
        Arc::new(SlotThief { pool: pool.clone() }),
    ));
    let history = Arc::new(ReportHistory::new(10));
    let exec = executor(
        vec![spec("a")],
        dispatcher,
        history.clone(),
        Duration::from_secs(10),
    );
    let (handle, shutdown) = start_loop(manual_only(1), exec);

    assert!(matches!(
        handle.trigger(TriggerSource::Manual).await.unwrap(),
        TriggerResponse::Started { .. }
    ));
    wait_for_runs(&handle, 1).await;

    let status = handle.status();
    let reason = status.halted.clone().expect("loop should be halted");
    assert!(reason.contains("Invariant violation"));
    // A corrupted run is never published
    assert!(history.is_empty());

    match handle.trigger(TriggerSource::Manual).await.unwrap() {
        TriggerResponse::Halted { reason: r } => assert_eq!(r, reason),
        other => panic!("expected halted, got {:?}", other),
    }
    assert_eq!(handle.status().runs_started, 1);

    shutdown.cancel();
}

struct BrokenRevision;

#[async_trait]
impl RevisionSource for BrokenRevision {
    async fn resolve(&self) -> Result<String> {
        Err(BenchError::Revision("checkout missing".to_string()))
    }
}

#[tokio::test]
async fn test_revision_failure_skips_run() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let history = Arc::new(ReportHistory::new(10));
    let exec = RunExecutor::new(
        vec![spec("a")],
        Arc::new(BrokenRevision),
        dispatcher(pool_with_workers(1, 1), invoker.clone()),
        history.clone(),
        Duration::from_secs(10),
    );
    let (handle, shutdown) = start_loop(manual_only(0), exec);

    handle.trigger(TriggerSource::Manual).await.unwrap();
    wait_for_runs(&handle, 1).await;

    let status = handle.status();
    assert!(status.halted.is_none());
    assert!(status.last_report.is_none());
    assert!(history.is_empty());
    assert!(invoker.calls().is_empty());

    // Not fatal: later triggers still start runs
    assert!(matches!(
        handle.trigger(TriggerSource::Manual).await.unwrap(),
        TriggerResponse::Started { .. }
    ));

    shutdown.cancel();
}

#[tokio::test]
async fn test_execute_closes_at_run_deadline() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .script("done", vec![Step::succeed(5, "reward", 2.0)])
            .script("stuck", vec![Step::hang()]),
    );
    let history = Arc::new(ReportHistory::new(10));
    let exec = executor(
        vec![spec("done"), spec("stuck")],
        dispatcher(pool_with_workers(2, 1), invoker),
        history.clone(),
        Duration::from_millis(200),
    );

    let run_id = Uuid::new_v4();
    let report = exec
        .execute(run_id, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.run_id, run_id);
    assert_eq!(report.status, RunState::PartialComplete);
    assert_eq!(report.entry("done").unwrap().state, ReportState::Succeeded);
    assert_eq!(report.entry("stuck").unwrap().state, ReportState::Cancelled);
    assert_eq!(history.latest().unwrap().run_id, run_id);
}

#[tokio::test]
async fn test_shutdown_cancels_active_run() {
    let invoker = Arc::new(ScriptedInvoker::new().script("stuck", vec![Step::hang()]));
    let history = Arc::new(ReportHistory::new(10));
    let exec = executor(
        vec![spec("stuck")],
        dispatcher(pool_with_workers(1, 1), invoker.clone()),
        history.clone(),
        Duration::from_secs(3600),
    );
    let (trigger_loop, handle) = TriggerLoop::new(manual_only(0), exec);
    let shutdown = CancellationToken::new();
    let loop_task = tokio::spawn(trigger_loop.run(shutdown.clone()));

    handle.trigger(TriggerSource::Manual).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(5), loop_task)
        .await
        .expect("loop should stop")
        .unwrap();
    let report = history.latest().expect("cancelled run still published");
    assert_eq!(report.entry("stuck").unwrap().state, ReportState::Cancelled);
    assert_eq!(report.status, RunState::PartialComplete);
    assert_eq!(report.summary().cancelled, 1);
}
