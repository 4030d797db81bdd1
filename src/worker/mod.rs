//! Agent side of the scheduler: runs one attempt of a job.
//!
//! - **Execution**: [`AgentRunner`] spawns the benchmark command (or calls an
//!   in-process benchmark, or forwards to a remote agent), enforces the time
//!   budget and parses the JSON result payload.
//! - **Liveness**: [`heartbeat`] keeps workers registered as alive and marks
//!   silent ones offline.
//! - **Remote agents**: [`server`] exposes a local runner over HTTP so a
//!   worker machine can execute jobs posted by the scheduler.
//!
//! # Result contract
//!
//! A benchmark that exits with status 0 must print a JSON object as its last
//! non-empty stdout line:
//!
//! ```text
//! {"metrics": {"mean_reward": 812.5}, "artifacts": ["s3://bench/ppo/curve.png"]}
//! ```
//!
//! Anything else is reported as a failed attempt with a `malformed result`
//! reason.

pub mod executor;
pub mod heartbeat;
pub mod server;

pub use executor::{
    parse_payload, AgentRunner, CallContext, Callable, CallableRegistry, InvocationRequest, Invoker,
};
pub use heartbeat::{HeartbeatSender, LivenessMonitor};
