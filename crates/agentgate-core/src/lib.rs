//! `agentgate` Core Library
//!
//! Shared functionality for `agentgate` components:
//! - Configuration resolution and hierarchy
//! - Static capacity ceilings (`RuntimeLimits`)
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, ParallelismScope, RuntimeLimits};
pub use error::{Error, Result};
