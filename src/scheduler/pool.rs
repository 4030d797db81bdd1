use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::{BenchError, Result};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Registration request from the provisioning side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: u64,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Agent endpoint for remote execution; local execution when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_capacity() -> u32 {
    1
}

impl WorkerRegistration {
    pub fn local(id: u64, capacity: u32) -> Self {
        Self {
            id,
            capacity,
            endpoint: None,
        }
    }
}

/// A slot held on one registration of a worker. A worker id that is
/// deregistered and registered again gets a new generation, so claims from
/// the old registration never touch the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotClaim {
    pub worker_id: u64,
    pub generation: u64,
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: u64,
    pub generation: u64,
    pub capacity: u32,
    pub current_load: u32,
    pub status: WorkerStatus,
    pub endpoint: Option<String>,
    pub jobs: Vec<Uuid>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Registered { worker_id: u64 },
    /// The worker stopped being claimable while holding `jobs`. Holders must
    /// recover those jobs themselves.
    WorkerOffline {
        worker_id: u64,
        generation: u64,
        jobs: Vec<Uuid>,
    },
    WorkerOnline { worker_id: u64 },
    Deregistered { worker_id: u64 },
}

#[derive(Debug)]
struct WorkerSlot {
    id: u64,
    generation: u64,
    capacity: u32,
    endpoint: Option<String>,
    load: AtomicU32,
    offline: AtomicBool,
    jobs: Mutex<HashSet<Uuid>>,
    last_heartbeat: Mutex<Instant>,
    registered_at: DateTime<Utc>,
}

impl WorkerSlot {
    fn new(registration: WorkerRegistration, generation: u64) -> Self {
        Self {
            id: registration.id,
            generation,
            capacity: registration.capacity,
            endpoint: registration.endpoint,
            load: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            jobs: Mutex::new(HashSet::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            registered_at: Utc::now(),
        }
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    fn claim(&self) -> SlotClaim {
        SlotClaim {
            worker_id: self.id,
            generation: self.generation,
        }
    }

    /// Compare-and-set on the load counter: never exceeds capacity.
    fn try_reserve(&self) -> bool {
        let mut current = self.load.load(Ordering::Acquire);
        loop {
            if self.is_offline() || current >= self.capacity {
                return false;
            }
            match self.load.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn unreserve(&self) -> Result<()> {
        self.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| load.checked_sub(1))
            .map(|_| ())
            .map_err(|_| {
                BenchError::InvariantViolation(format!(
                    "worker {} released below zero load",
                    self.id
                ))
            })
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat.lock().elapsed() < timeout
    }

    fn status(&self) -> WorkerStatus {
        if self.is_offline() {
            WorkerStatus::Offline
        } else if self.load.load(Ordering::Acquire) == 0 {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        }
    }

    fn info(&self) -> WorkerInfo {
        let mut jobs: Vec<Uuid> = self.jobs.lock().iter().copied().collect();
        jobs.sort();
        WorkerInfo {
            id: self.id,
            generation: self.generation,
            capacity: self.capacity,
            current_load: self.load.load(Ordering::Acquire),
            status: self.status(),
            endpoint: self.endpoint.clone(),
            jobs,
            registered_at: self.registered_at,
            last_heartbeat_ms: u64::try_from(self.last_heartbeat.lock().elapsed().as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

/// Tracks the worker fleet and its capacity. Workers are registered by an
/// external provisioner; the pool only claims and releases their slots.
#[derive(Debug)]
pub struct WorkerPool {
    workers: RwLock<HashMap<u64, Arc<WorkerSlot>>>,
    generations: AtomicU64,
    heartbeat_timeout: Duration,
    epoch: watch::Sender<u64>,
    events: broadcast::Sender<PoolEvent>,
}

impl WorkerPool {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        let (epoch, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            workers: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
            heartbeat_timeout,
            epoch,
            events,
        }
    }

    /// Receiver that changes whenever capacity may have become available.
    pub fn capacity_signal(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn register(&self, registration: WorkerRegistration) -> Result<()> {
        if registration.capacity == 0 {
            return Err(BenchError::ZeroCapacity(registration.id));
        }
        let worker_id = registration.id;
        {
            let mut workers = self.workers.write();
            if workers.contains_key(&worker_id) {
                return Err(BenchError::WorkerExists(worker_id));
            }
            let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
            workers.insert(worker_id, Arc::new(WorkerSlot::new(registration, generation)));
        }
        tracing::info!(worker_id, "Worker registered");
        self.emit(PoolEvent::Registered { worker_id });
        self.bump_epoch();
        Ok(())
    }

    /// Remove a worker. Jobs it still held are announced as lost.
    pub fn deregister(&self, worker_id: u64) -> Result<WorkerInfo> {
        let slot = self
            .workers
            .write()
            .remove(&worker_id)
            .ok_or(BenchError::WorkerNotFound(worker_id))?;
        let info = slot.info();
        if !info.jobs.is_empty() {
            tracing::warn!(worker_id, jobs = info.jobs.len(), "Worker deregistered while holding jobs");
            self.emit(PoolEvent::WorkerOffline {
                worker_id,
                generation: info.generation,
                jobs: info.jobs.clone(),
            });
        }
        tracing::info!(worker_id, "Worker deregistered");
        self.emit(PoolEvent::Deregistered { worker_id });
        Ok(info)
    }

    /// Claim one slot for `job_id` on the least loaded claimable worker.
    /// Returns `Ok(None)` when no worker has spare capacity.
    pub fn try_claim(&self, job_id: Uuid) -> Result<Option<SlotClaim>> {
        let mut candidates: Vec<Arc<WorkerSlot>> = self
            .workers
            .read()
            .values()
            .filter(|w| !w.is_offline())
            .cloned()
            .collect();
        candidates.sort_by_key(|w| (w.load.load(Ordering::Acquire), w.id));

        for slot in candidates {
            if !slot.try_reserve() {
                continue;
            }
            if !slot.jobs.lock().insert(job_id) {
                slot.unreserve()?;
                return Err(BenchError::InvariantViolation(format!(
                    "job {} claimed twice on worker {}",
                    job_id, slot.id
                )));
            }
            tracing::debug!(job_id = %job_id, worker_id = slot.id, "Worker slot claimed");
            return Ok(Some(slot.claim()));
        }
        Ok(None)
    }

    /// Return the slot held by `job_id`. Releasing a claim whose registration
    /// is gone is a no-op; releasing a job the worker does not hold is
    /// corruption.
    pub fn release(&self, claim: SlotClaim, job_id: &Uuid) -> Result<()> {
        let worker_id = claim.worker_id;
        let slot = self
            .workers
            .read()
            .get(&worker_id)
            .filter(|slot| slot.generation == claim.generation)
            .cloned();
        let Some(slot) = slot else {
            tracing::debug!(
                worker_id,
                generation = claim.generation,
                job_id = %job_id,
                "Release on deregistered worker ignored"
            );
            return Ok(());
        };
        if !slot.jobs.lock().remove(job_id) {
            return Err(BenchError::InvariantViolation(format!(
                "worker {} released job {} it does not hold",
                worker_id, job_id
            )));
        }
        slot.unreserve()?;
        tracing::debug!(worker_id, job_id = %job_id, "Worker slot released");
        self.bump_epoch();
        Ok(())
    }

    /// Refresh liveness. An offline worker comes back online.
    pub fn heartbeat(&self, worker_id: u64) -> Result<()> {
        let slot = self
            .workers
            .read()
            .get(&worker_id)
            .cloned()
            .ok_or(BenchError::WorkerNotFound(worker_id))?;
        *slot.last_heartbeat.lock() = Instant::now();
        if slot.offline.swap(false, Ordering::AcqRel) {
            tracing::info!(worker_id, "Worker back online");
            self.emit(PoolEvent::WorkerOnline { worker_id });
            self.bump_epoch();
        }
        Ok(())
    }

    /// Exclude a worker from claims. Returns the jobs it held at that moment;
    /// they are not failed here.
    pub fn mark_offline(&self, worker_id: u64) -> Result<Vec<Uuid>> {
        let slot = self
            .workers
            .read()
            .get(&worker_id)
            .cloned()
            .ok_or(BenchError::WorkerNotFound(worker_id))?;
        if slot.offline.swap(true, Ordering::AcqRel) {
            return Ok(Vec::new());
        }
        let jobs: Vec<Uuid> = slot.jobs.lock().iter().copied().collect();
        tracing::warn!(worker_id, jobs = jobs.len(), "Worker marked offline");
        self.emit(PoolEvent::WorkerOffline {
            worker_id,
            generation: slot.generation,
            jobs: jobs.clone(),
        });
        Ok(jobs)
    }

    /// Mark every worker whose heartbeat is older than the timeout offline.
    /// Returns the ids that changed state.
    pub fn sweep_stale(&self) -> Vec<u64> {
        let stale: Vec<u64> = self
            .workers
            .read()
            .values()
            .filter(|w| !w.is_offline() && !w.is_alive(self.heartbeat_timeout))
            .map(|w| w.id)
            .collect();
        stale
            .into_iter()
            .filter(|&id| self.mark_offline(id).is_ok())
            .collect()
    }

    pub fn is_online(&self, worker_id: u64) -> bool {
        self.workers
            .read()
            .get(&worker_id)
            .map(|w| !w.is_offline())
            .unwrap_or(false)
    }

    /// Whether `claim` still refers to the current, claimable registration.
    pub fn is_claim_live(&self, claim: &SlotClaim) -> bool {
        self.workers
            .read()
            .get(&claim.worker_id)
            .map(|w| w.generation == claim.generation && !w.is_offline())
            .unwrap_or(false)
    }

    pub fn endpoint(&self, worker_id: u64) -> Option<String> {
        self.workers
            .read()
            .get(&worker_id)
            .and_then(|w| w.endpoint.clone())
    }

    pub fn worker(&self, worker_id: u64) -> Option<WorkerInfo> {
        self.workers.read().get(&worker_id).map(|w| w.info())
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.workers.read().values().map(|w| w.info()).collect();
        infos.sort_by_key(|w| w.id);
        infos
    }

    /// Sum of `current_load` over all workers.
    pub fn total_load(&self) -> u32 {
        self.workers
            .read()
            .values()
            .map(|w| w.load.load(Ordering::Acquire))
            .sum()
    }

    /// Free slots on claimable workers.
    pub fn available_capacity(&self) -> u32 {
        self.workers
            .read()
            .values()
            .filter(|w| !w.is_offline())
            .map(|w| w.capacity.saturating_sub(w.load.load(Ordering::Acquire)))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}
