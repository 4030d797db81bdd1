use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collector::RunReport;
use crate::config::SuiteConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{BenchError, Result};
use crate::publisher::{FanoutPublisher, JsonFilePublisher, Publisher, ReportHistory};
use crate::revision::revision_source;
use crate::scheduler::{Dispatcher, WorkerPool, WorkerRegistration};
use crate::trigger::{RunExecutor, TriggerConfig, TriggerLoop, TriggerSource};
use crate::worker::{AgentRunner, CallableRegistry, HeartbeatSender, LivenessMonitor};

/// Wires every component of the orchestrator from one suite config.
pub struct Node {
    config: SuiteConfig,
    admin_addr: Option<SocketAddr>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    history: Arc<ReportHistory>,
    publisher: Arc<dyn Publisher>,
}

impl Node {
    pub fn new(config: SuiteConfig, admin_addr: Option<SocketAddr>) -> Result<Self> {
        Self::with_callables(config, admin_addr, CallableRegistry::new())
    }

    /// Build a node whose agent can also run in-process benchmarks.
    pub fn with_callables(
        config: SuiteConfig,
        admin_addr: Option<SocketAddr>,
        callables: CallableRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(WorkerPool::new(config.workers.heartbeat_timeout()));
        for id in 1..=u64::from(config.workers.local_slots) {
            pool.register(WorkerRegistration::local(id, config.workers.local_capacity))?;
        }

        let runner = AgentRunner::new(config.runner.clone()).with_callables(callables);
        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), Arc::new(runner)));

        let history = Arc::new(ReportHistory::new(config.publish.history));
        let mut fanout = FanoutPublisher::new().with(history.clone());
        if let Some(ref dir) = config.publish.dir {
            fanout = fanout.with(Arc::new(JsonFilePublisher::new(dir.clone())));
        }

        Ok(Self {
            config,
            admin_addr,
            pool,
            dispatcher,
            history,
            publisher: Arc::new(fanout),
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn history(&self) -> &Arc<ReportHistory> {
        &self.history
    }

    fn executor(&self) -> RunExecutor {
        RunExecutor::new(
            self.config.jobs.clone(),
            revision_source(&self.config.revision),
            self.dispatcher.clone(),
            self.publisher.clone(),
            self.config.schedule.run_deadline(),
        )
    }

    /// Heartbeats for the in-process workers plus the liveness sweep.
    fn spawn_liveness(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let interval_ms = self.config.workers.heartbeat_interval_ms;
        let mut tasks = Vec::new();
        for id in 1..=u64::from(self.config.workers.local_slots) {
            let pool = self.pool.clone();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                HeartbeatSender::new(interval_ms).run(id, pool, token).await;
            }));
        }
        let pool = self.pool.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            LivenessMonitor::new(interval_ms).run(pool, token).await;
        }));
        tasks
    }

    /// Run the orchestrator until shutdown.
    ///
    /// Starts the local worker heartbeats, the liveness monitor, the admin
    /// API (if configured) and the trigger loop. With `trigger_now` a run
    /// starts immediately instead of waiting for the first cadence tick.
    pub async fn run(self, shutdown: CancellationToken, trigger_now: bool) -> Result<()> {
        let liveness = self.spawn_liveness(&shutdown);

        let (trigger_loop, handle) =
            TriggerLoop::new(TriggerConfig::from(&self.config.schedule), self.executor());
        let loop_token = shutdown.clone();
        let trigger_task = tokio::spawn(async move { trigger_loop.run(loop_token).await });

        if let Some(admin_addr) = self.admin_addr {
            let state = DashboardState {
                trigger: handle.clone(),
                pool: self.pool.clone(),
                history: self.history.clone(),
            };
            let token = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(admin_addr, state, token).await;
            });
        }

        tracing::info!(
            jobs = self.config.jobs.len(),
            workers = self.pool.len(),
            admin_addr = ?self.admin_addr,
            "Orchestrator started"
        );

        if trigger_now {
            let response = handle.trigger(TriggerSource::Manual).await?;
            tracing::info!(response = ?response, "Initial run requested");
        }

        trigger_task
            .await
            .map_err(|e| BenchError::Internal(format!("trigger loop failed: {}", e)))?;
        for task in liveness {
            let _ = task.await;
        }
        Ok(())
    }

    /// Execute a single run to completion and return its report.
    pub async fn run_once(self, shutdown: CancellationToken) -> Result<RunReport> {
        let liveness_token = shutdown.child_token();
        let liveness = self.spawn_liveness(&liveness_token);

        let result = self.executor().execute(Uuid::new_v4(), shutdown).await;

        liveness_token.cancel();
        for task in liveness {
            let _ = task.await;
        }
        result?.ok_or_else(|| BenchError::Revision("revision could not be resolved".to_string()))
    }
}
