//! Task plans: validation, scheduling and dependency-ordered execution.

pub mod executor;
pub mod plan;
pub mod scheduler;

pub use executor::{
    DagExecutor, ExecutorOptions, PlanReport, PlanStatus, TaskInput, TaskResult, TaskRunner, TaskStatus,
};
pub use plan::{PlanError, TaskNode, TaskPlan};
pub use scheduler::{DagScheduler, TaskState};
