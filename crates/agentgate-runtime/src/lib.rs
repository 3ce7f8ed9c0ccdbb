//! `agentgate` Runtime Library
//!
//! Safe, bounded concurrent execution of agent work:
//! - Resilience: retry with backoff, shared throttling, circuit breakers
//! - Bounded-parallelism pool with cancellation propagation
//! - Admission control with expiring capacity reservations
//! - Cross-process locks and instance registry over a shared directory
//! - Dependency-ordered task plan execution
//!
//! Hosts create one [`RuntimeContext`] per process and go through it.

pub mod admission;
pub mod context;
pub mod coordinator;
pub mod dag;
pub mod persist;
pub mod pool;
pub mod resilience;
pub mod unit;

pub use context::{ContextError, RuntimeContext};
pub use unit::{UnitError, execute_unit};
