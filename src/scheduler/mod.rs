pub mod dispatcher;
pub mod job;
pub mod pool;
pub mod queue;
pub mod run;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use job::{
    AttemptOutcome, FailureCounts, FailureKind, Invocation, Job, JobSpec, JobState, ResultPayload,
    Settlement,
};
pub use pool::{PoolEvent, SlotClaim, WorkerInfo, WorkerPool, WorkerRegistration, WorkerStatus};
pub use queue::Backlog;
pub use run::{Run, RunState};
