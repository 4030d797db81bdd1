pub mod collector;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod node;
pub mod publisher;
pub mod revision;
pub mod scheduler;
pub mod shutdown;
pub mod trigger;
pub mod worker;
