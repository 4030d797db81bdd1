use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nightbench::config::RunnerConfig;
use nightbench::scheduler::{AttemptOutcome, FailureKind, Invocation, ResultPayload};
use nightbench::worker::server::{agent_router, AgentState};
use nightbench::worker::{
    parse_payload, AgentRunner, CallContext, Callable, CallableRegistry, InvocationRequest,
    Invoker,
};

/// Create a test runner with the default runner config
fn test_runner() -> AgentRunner {
    AgentRunner::new(RunnerConfig::default())
}

fn request(command: Invocation, budget_ms: u64) -> InvocationRequest {
    InvocationRequest {
        job_id: Uuid::new_v4(),
        job_name: "bench".to_string(),
        attempt: 1,
        command,
        revision: "abc123".to_string(),
        time_budget_ms: budget_ms,
        worker_endpoint: None,
    }
}

fn shell(script: &str) -> Invocation {
    Invocation::Shell(script.to_string())
}

fn failure_reason(outcome: &AttemptOutcome) -> (FailureKind, String) {
    match outcome {
        AttemptOutcome::Failed { kind, reason } => (*kind, reason.clone()),
        other => panic!("expected a failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_json_payload() {
    let runner = test_runner();
    let outcome = runner
        .invoke(
            request(
                shell(r#"echo training; echo '{"metrics": {"mean_reward": 812.5}, "artifacts": ["curve.png"]}'"#),
                5_000,
            ),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(
        outcome,
        AttemptOutcome::Succeeded {
            payload: ResultPayload::default()
                .with_metric("mean_reward", 812.5)
                .with_artifact("curve.png"),
        }
    );
}

#[tokio::test]
async fn test_execute_exec_invocation() {
    let runner = test_runner();
    let outcome = runner
        .invoke(
            request(
                Invocation::Exec {
                    program: "echo".to_string(),
                    args: vec![r#"{"metrics": {"fps": 60}}"#.to_string()],
                },
                5_000,
            ),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(
        outcome,
        AttemptOutcome::Succeeded {
            payload: ResultPayload::default().with_metric("fps", 60.0),
        }
    );
}

#[tokio::test]
async fn test_execute_exposes_job_environment() {
    let runner = test_runner();
    let outcome = runner
        .invoke(
            request(
                shell(r#"echo "{\"metrics\": {\"attempt\": $NIGHTBENCH_ATTEMPT}, \"artifacts\": [\"$NIGHTBENCH_REVISION\"]}""#),
                5_000,
            ),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(
        outcome,
        AttemptOutcome::Succeeded {
            payload: ResultPayload::default()
                .with_metric("attempt", 1.0)
                .with_artifact("abc123"),
        }
    );
}

#[tokio::test]
async fn test_execute_malformed_result() {
    let runner = test_runner();
    let outcome = runner
        .invoke(request(shell("echo 'not json'"), 5_000), CancellationToken::new())
        .await;

    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Command);
    assert!(reason.starts_with("malformed result"));
}

#[tokio::test]
async fn test_execute_empty_output() {
    let runner = test_runner();
    let outcome = runner
        .invoke(request(shell("true"), 5_000), CancellationToken::new())
        .await;

    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Command);
    assert_eq!(reason, "malformed result: no output");
}

#[tokio::test]
async fn test_execute_command_failure_with_stderr() {
    let runner = test_runner();
    let outcome = runner
        .invoke(
            request(shell("echo 'cuda out of memory' >&2 && exit 3"), 5_000),
            CancellationToken::new(),
        )
        .await;

    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Command);
    assert!(reason.contains("cuda out of memory"));
}

#[tokio::test]
async fn test_execute_command_failure_without_stderr() {
    let runner = test_runner();
    let outcome = runner
        .invoke(request(shell("exit 1"), 5_000), CancellationToken::new())
        .await;

    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Command);
    assert!(reason.contains("exit code"));
}

#[tokio::test]
async fn test_execute_invalid_program() {
    let runner = test_runner();
    let outcome = runner
        .invoke(
            request(
                Invocation::Exec {
                    program: "nonexistent_command_12345".to_string(),
                    args: vec![],
                },
                5_000,
            ),
            CancellationToken::new(),
        )
        .await;

    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Command);
    assert!(reason.contains("failed to spawn"));
}

#[tokio::test]
async fn test_execute_time_budget() {
    let runner = test_runner();
    let start = Instant::now();
    let outcome = runner
        .invoke(request(shell("sleep 10"), 200), CancellationToken::new())
        .await;

    assert_eq!(outcome, AttemptOutcome::TimedOut { budget_ms: 200 });
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_execute_cancel() {
    let runner = test_runner();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let outcome = runner
        .invoke(request(shell("sleep 10"), 30_000), cancel)
        .await;

    assert_eq!(outcome, AttemptOutcome::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(5));
}

/// Whether `pid` is still a live process. Zombies count as stopped.
#[cfg(target_os = "linux")]
fn is_alive(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Runs a shell benchmark that backgrounds a long sleep, records its pid
/// and waits on it. Returns the outcome and the background pid.
#[cfg(target_os = "linux")]
async fn run_with_background_child(
    budget_ms: u64,
    cancel: CancellationToken,
) -> (AttemptOutcome, String) {
    let dir = tempfile::TempDir::new().unwrap();
    let pid_file = dir.path().join("child.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let outcome = test_runner()
        .invoke(request(shell(&script), budget_ms), cancel)
        .await;
    let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
    (outcome, pid)
}

#[cfg(target_os = "linux")]
async fn assert_stopped(pid: &str) {
    let start = Instant::now();
    while is_alive(pid) {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "descendant {} outlived the benchmark",
            pid
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_time_budget_kills_descendants() {
    let (outcome, pid) = run_with_background_child(500, CancellationToken::new()).await;

    assert_eq!(outcome, AttemptOutcome::TimedOut { budget_ms: 500 });
    assert_stopped(&pid).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancel_kills_descendants() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let (outcome, pid) = run_with_background_child(30_000, cancel).await;

    assert_eq!(outcome, AttemptOutcome::Cancelled);
    assert_stopped(&pid).await;
}

struct RewardBench;

#[async_trait]
impl Callable for RewardBench {
    async fn call(&self, ctx: CallContext) -> Result<ResultPayload, String> {
        Ok(ResultPayload::default().with_metric("attempt", ctx.attempt as f64))
    }
}

struct StuckBench;

#[async_trait]
impl Callable for StuckBench {
    async fn call(&self, ctx: CallContext) -> Result<ResultPayload, String> {
        ctx.cancel.cancelled().await;
        Err("cancelled".to_string())
    }
}

fn runner_with_callables() -> AgentRunner {
    let mut callables = CallableRegistry::new();
    callables.register("reward", Arc::new(RewardBench));
    callables.register("stuck", Arc::new(StuckBench));
    test_runner().with_callables(callables)
}

#[tokio::test]
async fn test_execute_callable() {
    let runner = runner_with_callables();
    let outcome = runner
        .invoke(
            request(Invocation::Callable("reward".to_string()), 5_000),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(
        outcome,
        AttemptOutcome::Succeeded {
            payload: ResultPayload::default().with_metric("attempt", 1.0),
        }
    );
}

#[tokio::test]
async fn test_execute_callable_time_budget() {
    let runner = runner_with_callables();
    let outcome = runner
        .invoke(
            request(Invocation::Callable("stuck".to_string()), 100),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome, AttemptOutcome::TimedOut { budget_ms: 100 });
}

#[tokio::test]
async fn test_execute_unknown_callable() {
    let runner = runner_with_callables();
    let outcome = runner
        .invoke(
            request(Invocation::Callable("missing".to_string()), 5_000),
            CancellationToken::new(),
        )
        .await;

    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Command);
    assert!(reason.contains("missing"));
}

#[test]
fn test_parse_payload_uses_last_line() {
    let payload = parse_payload("step 1\n{\"metrics\": {\"a\": 1}}\n\n").unwrap();
    assert_eq!(payload, ResultPayload::default().with_metric("a", 1.0));

    // Earlier JSON lines are ignored
    let err = parse_payload("{\"metrics\": {\"a\": 1}}\ndone\n").unwrap_err();
    assert!(err.starts_with("malformed result"));

    // Metrics are required
    assert!(parse_payload("{\"artifacts\": []}").is_err());
}

/// Serve an agent on an ephemeral port and return its base URL.
async fn spawn_agent() -> String {
    spawn_agent_with_shutdown(CancellationToken::new()).await
}

async fn spawn_agent_with_shutdown(shutdown: CancellationToken) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = agent_router(AgentState {
        runner: Arc::new(test_runner()),
        shutdown,
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_agent_shutdown_stops_running_job() {
    let shutdown = CancellationToken::new();
    let endpoint = spawn_agent_with_shutdown(shutdown.clone()).await;
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
    });

    let mut req = request(shell("sleep 30"), 30_000);
    req.worker_endpoint = Some(endpoint);
    let start = Instant::now();
    let outcome = test_runner().invoke(req, CancellationToken::new()).await;

    // The job was not ours to cancel, so it counts as lost infrastructure
    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Infrastructure);
    assert!(reason.contains("stopped the attempt"));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_remote_invocation_through_agent() {
    let endpoint = spawn_agent().await;
    let runner = test_runner();

    let outcome = runner
        .invoke(
            request(
                Invocation::Remote {
                    endpoint,
                    command: r#"echo '{"metrics": {"loss": 0.25}}'"#.to_string(),
                },
                5_000,
            ),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(
        outcome,
        AttemptOutcome::Succeeded {
            payload: ResultPayload::default().with_metric("loss", 0.25),
        }
    );
}

#[tokio::test]
async fn test_worker_endpoint_forwards_to_agent() {
    let endpoint = spawn_agent().await;
    let runner = test_runner();

    let mut req = request(shell("exit 7"), 5_000);
    req.worker_endpoint = Some(endpoint);
    let outcome = runner.invoke(req, CancellationToken::new()).await;

    // The agent's command failure is passed through unchanged
    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Command);
    assert!(reason.contains("exit code"));
}

#[tokio::test]
async fn test_unreachable_agent_is_infrastructure_failure() {
    // Bind and drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let runner = test_runner();
    let mut req = request(shell("true"), 5_000);
    req.worker_endpoint = Some(format!("http://{}", addr));
    let outcome = runner.invoke(req, CancellationToken::new()).await;

    let (kind, reason) = failure_reason(&outcome);
    assert_eq!(kind, FailureKind::Infrastructure);
    assert!(reason.contains("unreachable"));
}
