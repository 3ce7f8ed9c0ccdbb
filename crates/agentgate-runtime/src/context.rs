//! The runtime context: every piece of shared state one process needs,
//! created once by [`RuntimeContext::start`] and torn down by
//! [`RuntimeContext::shutdown`].
//!
//! This is also the host-facing surface: admit and run one unit of work,
//! run a validated plan, and take or release a named cross-process lock.

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use agentgate_core::Config;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::{AdmissionController, AdmissionRequest};
use crate::coordinator::{Coordinator, CoordinatorError, LockHandle, ReleaseOutcome};
use crate::dag::{DagExecutor, ExecutorOptions, PlanError, PlanReport, TaskPlan, TaskRunner};
use crate::resilience::{Classify, Resilience};
use crate::unit::{UnitError, execute_unit};

/// File under the state directory holding shared throttle windows.
const THROTTLE_FILE: &str = "throttle.json";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] agentgate_core::Error),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("cross-process coordination is disabled")]
    CoordinatorDisabled,
}

#[derive(Debug)]
pub struct RuntimeContext {
    config: Config,
    admission: AdmissionController,
    resilience: Arc<Resilience>,
    coordinator: Option<Arc<Coordinator>>,
    executor: DagExecutor,
    root: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeContext {
    /// Validate `config` and bring every component up.
    ///
    /// With coordination enabled this registers the instance, sizes the
    /// admission fair share from the live instance count and starts the
    /// maintenance loop.
    pub async fn start(config: Config) -> Result<Self, ContextError> {
        config.validate()?;
        let root = CancellationToken::new();
        let admission = AdmissionController::from_config(&config);

        let state_dir: Option<PathBuf> = if config.coordinator.enabled {
            let dir = config.coordinator.resolved_state_dir().ok_or_else(|| {
                agentgate_core::Error::Config("coordinator enabled but no state directory could be resolved".into())
            })?;
            Some(dir)
        } else {
            None
        };

        let resilience = Arc::new(Resilience::from_config(
            &config,
            state_dir.as_ref().map(|dir| dir.join(THROTTLE_FILE)),
        ));

        let mut maintenance = None;
        let coordinator = match state_dir {
            Some(dir) => {
                let coordinator = Arc::new(Coordinator::new(dir, config.coordinator.clone()));
                coordinator.register().await?;
                admission.set_instance_count(coordinator.live_instance_count().await?);
                maintenance = coordinator.start_maintenance(root.child_token(), Some(admission.clone()));
                Some(coordinator)
            }
            None => None,
        };

        info!(
            coordinated = coordinator.is_some(),
            instance_id = coordinator.as_ref().map(|c| c.instance_id()),
            "Runtime started"
        );
        let executor = DagExecutor::new(admission.clone(), Arc::clone(&resilience));
        Ok(Self {
            config,
            admission,
            resilience,
            coordinator,
            executor,
            root,
            maintenance: Mutex::new(maintenance),
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    /// A token cancelled when the runtime shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Admit and run one unit of agent work.
    pub async fn execute_unit<T, E, F, Fut>(
        &self,
        request: &AdmissionRequest,
        key: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, UnitError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        execute_unit(&self.admission, &self.resilience, request, key, cancel, work).await
    }

    /// Validate and run a task plan.
    pub async fn run_plan<R: TaskRunner>(
        &self,
        plan: &TaskPlan,
        runner: Arc<R>,
        options: ExecutorOptions,
    ) -> Result<PlanReport, PlanError> {
        self.executor.run(plan, runner, options).await
    }

    /// Take `resource` with the configured TTL and retry budget.
    pub async fn acquire_lock(&self, resource: &str) -> Result<LockHandle, ContextError> {
        let coordinator = self.coordinator.as_ref().ok_or(ContextError::CoordinatorDisabled)?;
        let retries = self.config.coordinator.lock_max_retries;
        coordinator
            .try_acquire_lock(resource, coordinator.lock_ttl(), retries)
            .await?
            .ok_or_else(|| {
                CoordinatorError::LockAcquisitionFailed {
                    resource: resource.to_string(),
                    attempts: retries.saturating_add(1),
                }
                .into()
            })
    }

    pub async fn release_lock(&self, handle: LockHandle) -> Result<ReleaseOutcome, ContextError> {
        let coordinator = self.coordinator.as_ref().ok_or(ContextError::CoordinatorDisabled)?;
        Ok(coordinator.release_lock(handle).await)
    }

    /// Stop background loops, fail pending admissions and unregister this
    /// instance. Locks still held are left to expire.
    pub async fn shutdown(&self) -> Result<(), ContextError> {
        info!("Runtime shutting down");
        self.root.cancel();
        self.admission.shutdown();

        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Maintenance loop ended abnormally");
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.unregister().await?;
        }
        Ok(())
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.root.cancel();
        self.admission.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::admission::AdmissionError;
    use crate::dag::{PlanStatus, TaskInput, TaskNode};
    use crate::resilience::WorkError;
    use agentgate_core::config::CoordinatorConfig;

    fn config(state_dir: Option<PathBuf>) -> Config {
        Config {
            coordinator: CoordinatorConfig {
                enabled: state_dir.is_some(),
                state_dir,
                lock_max_retries: 0,
                ..CoordinatorConfig::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn start_registers_and_shutdown_unregisters() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = RuntimeContext::start(config(Some(dir.path().to_path_buf()))).await.unwrap();

        let coordinator = Arc::clone(ctx.coordinator().unwrap());
        assert!(coordinator.maintenance_running());
        assert_eq!(coordinator.list_instances().await.unwrap().len(), 1);

        ctx.shutdown().await.unwrap();
        assert!(coordinator.list_instances().await.unwrap().is_empty());
        assert!(!coordinator.maintenance_running());

        let err = ctx
            .admission()
            .admit(&AdmissionRequest::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Cancelled);
    }

    #[tokio::test]
    async fn lock_facade_excludes_second_runtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = RuntimeContext::start(config(Some(dir.path().to_path_buf()))).await.unwrap();
        let b = RuntimeContext::start(config(Some(dir.path().to_path_buf()))).await.unwrap();

        let handle = a.acquire_lock("repo:main").await.unwrap();
        let err = b.acquire_lock("repo:main").await.unwrap_err();
        assert!(matches!(
            err,
            ContextError::Coordinator(CoordinatorError::LockAcquisitionFailed { attempts: 1, .. })
        ));

        assert_eq!(a.release_lock(handle).await.unwrap(), ReleaseOutcome::Released);
        let handle = b.acquire_lock("repo:main").await.unwrap();
        assert_eq!(b.release_lock(handle).await.unwrap(), ReleaseOutcome::Released);

        // Two live instances halve the request ceiling.
        assert_eq!(b.admission().snapshot().request_limit, 4);
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn uncoordinated_runtime_still_runs_work() {
        let ctx = RuntimeContext::start(config(None)).await.unwrap();
        assert!(ctx.coordinator().is_none());
        assert!(matches!(
            ctx.acquire_lock("x").await,
            Err(ContextError::CoordinatorDisabled)
        ));

        let value = ctx
            .execute_unit(&AdmissionRequest::agent_run(), "llm", &ctx.child_token(), |attempt| async move {
                Ok::<_, WorkError>(attempt)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);

        let plan = TaskPlan::new(vec![TaskNode::new("a", ""), TaskNode::new("b", "").depends_on(["a"])]);
        let runner = Arc::new(|input: TaskInput, _: CancellationToken| async move {
            Ok::<_, WorkError>(format!("{}+{}", input.task.id, input.dependency_outputs.len()))
        });
        let report = ctx
            .run_plan(&plan, runner, ExecutorOptions::default().with_cancel(ctx.child_token()))
            .await
            .unwrap();
        assert_eq!(report.status, PlanStatus::Completed);
        assert_eq!(report.result("b").unwrap().output.as_deref(), Some("b+1"));
        ctx.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut bad = config(None);
        bad.limits.max_total_active_requests = 0;
        assert!(matches!(
            RuntimeContext::start(bad).await,
            Err(ContextError::Config(_))
        ));
    }
}
