//! Core orchestration logic.
//!
//! This module contains:
//! - Registry: durable per-recording state with compare-and-swap transitions
//! - Policy: per-stage retry budgets, backoff and timeouts
//! - Coordinator: the per-recording state machine
//! - Pool: fixed-size workers pulling from the ingestion queue

pub mod coordinator;
pub mod policy;
pub mod pool;
pub mod registry;

// Re-export commonly used types
pub use coordinator::{Coordinator, Outcome, PipelineError};
pub use policy::{RetryPolicy, StagePolicies};
pub use pool::{PoolReport, WorkerPool};
pub use registry::{Registry, RegistryError};
