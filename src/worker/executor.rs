use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::scheduler::{AttemptOutcome, Invocation, Job, ResultPayload};

/// Everything an agent needs to execute one attempt. Also the body of the
/// remote agent protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub job_id: Uuid,
    pub job_name: String,
    pub attempt: u32,
    pub command: Invocation,
    pub revision: String,
    pub time_budget_ms: u64,
    /// Agent of the claimed worker, if it executes remotely.
    #[serde(skip)]
    pub worker_endpoint: Option<String>,
}

impl InvocationRequest {
    pub fn for_job(job: &Job, worker_endpoint: Option<String>) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            attempt: job.attempt(),
            command: job.command.clone(),
            revision: job.revision.clone(),
            time_budget_ms: u64::try_from(job.time_budget.as_millis()).unwrap_or(u64::MAX),
            worker_endpoint,
        }
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

/// Executes one attempt and reports exactly one terminal outcome. The
/// dispatcher only talks to this trait.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest, cancel: CancellationToken) -> AttemptOutcome;
}

/// Context handed to in-process benchmarks.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub job_id: Uuid,
    pub job_name: String,
    pub attempt: u32,
    pub revision: String,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(&self, ctx: CallContext) -> std::result::Result<ResultPayload, String>;
}

#[derive(Clone, Default)]
pub struct CallableRegistry {
    entries: HashMap<String, Arc<dyn Callable>>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, callable: Arc<dyn Callable>) {
        self.entries.insert(name.into(), callable);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Callable>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableRegistry")
            .field("entries", &self.names())
            .finish()
    }
}

/// Runs benchmark commands with a hard wall-clock budget.
///
/// Shell and exec commands are spawned as child processes that are killed
/// when the budget elapses or the attempt is cancelled. On a clean exit the
/// last non-empty stdout line must be the JSON result payload. Callables run
/// in-process. Remote invocations, and any job whose worker advertises an
/// agent endpoint, are posted to that agent's `/run` route.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    config: RunnerConfig,
    callables: CallableRegistry,
    http: reqwest::Client,
}

impl AgentRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            callables: CallableRegistry::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_callables(mut self, callables: CallableRegistry) -> Self {
        self.callables = callables;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs locally, never forwarding. Used by the agent server.
    pub async fn execute_local(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> AttemptOutcome {
        match &request.command {
            Invocation::Shell(script) => {
                let mut command = Command::new(&self.config.shell);
                command.arg("-c").arg(script);
                self.run_process(request, command, cancel).await
            }
            Invocation::Exec { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                self.run_process(request, command, cancel).await
            }
            Invocation::Callable(name) => self.run_callable(name, request, cancel).await,
            Invocation::Remote { endpoint, .. } => AttemptOutcome::command_failure(format!(
                "remote invocation for {} cannot run locally",
                endpoint
            )),
        }
    }

    async fn run_process(
        &self,
        request: &InvocationRequest,
        mut command: Command,
        cancel: CancellationToken,
    ) -> AttemptOutcome {
        command
            .env("NIGHTBENCH_JOB_ID", request.job_id.to_string())
            .env("NIGHTBENCH_JOB_NAME", &request.job_name)
            .env("NIGHTBENCH_ATTEMPT", request.attempt.to_string())
            .env("NIGHTBENCH_REVISION", &request.revision)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.workdir {
            command.current_dir(dir);
        }
        own_process_group(&mut command);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "Failed to spawn benchmark");
                return AttemptOutcome::command_failure(format!("failed to spawn: {}", e));
            }
        };
        // Killed on every path except a normal exit, including this future
        // being dropped mid-attempt.
        let mut group = ProcessGroup::new(request.job_id, child.id());

        let budget = request.time_budget();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            result = tokio::time::timeout(budget, child.wait_with_output()) => match result {
                Ok(Ok(output)) => {
                    group.disarm();
                    Self::process_output(request.job_id, output)
                }
                Ok(Err(e)) => AttemptOutcome::command_failure(e.to_string()),
                Err(_) => AttemptOutcome::timed_out(budget),
            },
        }
    }

    async fn run_callable(
        &self,
        name: &str,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> AttemptOutcome {
        let Some(callable) = self.callables.get(name) else {
            return AttemptOutcome::command_failure(format!("unknown callable '{}'", name));
        };
        let ctx = CallContext {
            job_id: request.job_id,
            job_name: request.job_name.clone(),
            attempt: request.attempt,
            revision: request.revision.clone(),
            cancel: cancel.child_token(),
        };
        let budget = request.time_budget();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            result = tokio::time::timeout(budget, callable.call(ctx)) => match result {
                Ok(Ok(payload)) => AttemptOutcome::Succeeded { payload },
                Ok(Err(reason)) => AttemptOutcome::command_failure(reason),
                Err(_) => AttemptOutcome::timed_out(budget),
            },
        }
    }

    async fn run_remote(
        &self,
        endpoint: &str,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> AttemptOutcome {
        let url = format!("{}/run", endpoint.trim_end_matches('/'));
        let budget = request.time_budget();
        // The agent enforces the budget itself; the grace covers transport.
        let deadline = budget + Duration::from_millis(self.config.remote_grace_ms);

        let call = async {
            let response = match self
                .http
                .post(&url)
                .json(request)
                .timeout(deadline)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_timeout() => return AttemptOutcome::timed_out(budget),
                Err(e) => {
                    return AttemptOutcome::infrastructure_failure(format!(
                        "agent {} unreachable: {}",
                        url, e
                    ))
                }
            };
            let status = response.status();
            if !status.is_success() {
                return AttemptOutcome::infrastructure_failure(format!(
                    "agent {} answered {}",
                    url, status
                ));
            }
            match response.json::<AttemptOutcome>().await {
                // Only we cancel our attempts; an agent stopping one is lost
                // infrastructure and the job is retried.
                Ok(AttemptOutcome::Cancelled) => AttemptOutcome::infrastructure_failure(format!(
                    "agent {} stopped the attempt",
                    url
                )),
                Ok(outcome) => outcome,
                Err(e) if e.is_timeout() => AttemptOutcome::timed_out(budget),
                Err(e) => AttemptOutcome::infrastructure_failure(format!(
                    "agent {} sent an unreadable outcome: {}",
                    url, e
                )),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            outcome = call => outcome,
        }
    }

    fn process_output(job_id: Uuid, output: std::process::Output) -> AttemptOutcome {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code();

        if !output.status.success() {
            tracing::debug!(job_id = %job_id, exit_code = ?exit_code, "Benchmark exited unsuccessfully");
            let stderr = stderr.trim();
            return AttemptOutcome::command_failure(if stderr.is_empty() {
                format!("exit code: {:?}", exit_code)
            } else {
                stderr.to_string()
            });
        }

        match parse_payload(&stdout) {
            Ok(payload) => AttemptOutcome::Succeeded { payload },
            Err(reason) => AttemptOutcome::command_failure(reason),
        }
    }
}

/// Extracts the result payload from the last non-empty stdout line.
pub fn parse_payload(stdout: &str) -> std::result::Result<ResultPayload, String> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or_else(|| "malformed result: no output".to_string())?;
    serde_json::from_str::<ResultPayload>(line).map_err(|e| format!("malformed result: {}", e))
}

#[async_trait]
impl Invoker for AgentRunner {
    async fn invoke(&self, request: InvocationRequest, cancel: CancellationToken) -> AttemptOutcome {
        tracing::info!(
            job_id = %request.job_id,
            job = %request.job_name,
            attempt = request.attempt,
            command = %request.command,
            budget_ms = request.time_budget_ms,
            "Executing job"
        );

        let outcome = match (&request.command, &request.worker_endpoint) {
            (Invocation::Remote { endpoint, command }, _) => {
                let forwarded = InvocationRequest {
                    command: Invocation::Shell(command.clone()),
                    ..request.clone()
                };
                self.run_remote(endpoint, &forwarded, cancel).await
            }
            (Invocation::Callable(_), _) | (_, None) => self.execute_local(&request, cancel).await,
            (_, Some(endpoint)) => self.run_remote(endpoint, &request, cancel).await,
        };

        match &outcome {
            AttemptOutcome::Succeeded { payload } => tracing::info!(
                job_id = %request.job_id,
                metrics = payload.metrics.len(),
                artifacts = payload.artifacts.len(),
                "Job succeeded"
            ),
            AttemptOutcome::Failed { kind, reason } => tracing::warn!(
                job_id = %request.job_id,
                kind = %kind,
                reason = %reason,
                "Job failed"
            ),
            AttemptOutcome::TimedOut { budget_ms } => {
                tracing::warn!(job_id = %request.job_id, budget_ms, "Job exceeded its time budget")
            }
            AttemptOutcome::Cancelled => tracing::info!(job_id = %request.job_id, "Job cancelled"),
        }
        outcome
    }
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// The process group a benchmark was started in. Force-stopping the
/// benchmark kills the whole group, so nothing it spawned outlives its time
/// budget.
struct ProcessGroup {
    job_id: Uuid,
    leader: Option<u32>,
}

impl ProcessGroup {
    fn new(job_id: Uuid, leader: Option<u32>) -> Self {
        Self { job_id, leader }
    }

    /// The benchmark exited on its own; leave the group alone.
    fn disarm(&mut self) {
        self.leader = None;
    }

    #[cfg(unix)]
    fn kill(&self, leader: u32) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Ok(pgid) = i32::try_from(leader) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => tracing::debug!(job_id = %self.job_id, pgid, "Benchmark process group killed"),
            // Everything in the group already exited
            Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, pgid, error = %e, "Failed to kill benchmark process group")
            }
        }
    }

    #[cfg(not(unix))]
    fn kill(&self, _leader: u32) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(leader) = self.leader.take() {
            self.kill(leader);
        }
    }
}
