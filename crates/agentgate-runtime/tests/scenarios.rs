#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end acceptance scenarios, one per component:
//! - A: pool partial failure without abort
//! - B: concurrent lock acquisition has exactly one winner
//! - C: an expired lock is cleaned up and re-acquirable
//! - D: a join task runs after both roots, with their outputs
//! - E: breaker opens, fails fast, then allows a single half-open trial

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agentgate_core::config::{AdmissionConfig, CoordinatorConfig};
use agentgate_core::RuntimeLimits;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use agentgate_runtime::admission::AdmissionController;
use agentgate_runtime::coordinator::Coordinator;
use agentgate_runtime::dag::{DagExecutor, ExecutorOptions, PlanStatus, TaskInput, TaskNode, TaskPlan};
use agentgate_runtime::pool::{PoolOptions, run_bounded};
use agentgate_runtime::resilience::{
    BreakerRegistry, BreakerStatus, Resilience, ResilienceError, RetryPolicy, ThrottleGate, WorkError,
};

#[tokio::test(start_paused = true)]
async fn scenario_a_pool_reports_partial_failure() {
    let report = run_bounded((0..5).collect(), PoolOptions::with_limit(3), |_, i: usize, _| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if i == 2 { Err(format!("item {i} threw")) } else { Ok(i * 10) }
    })
    .await
    .unwrap();

    assert_eq!(report.len(), 5);
    assert_eq!(report.succeeded(), 4);
    assert_eq!(report.failed_indices, vec![2]);
    assert!(report.results[2].as_ref().unwrap().is_err());
    assert_eq!(*report.results[4].as_ref().unwrap().as_ref().unwrap(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_b_concurrent_acquire_has_one_winner() {
    let dir = tempfile::TempDir::new().unwrap();
    let a = Coordinator::with_instance_id(dir.path(), "a", CoordinatorConfig::default());
    let b = Coordinator::with_instance_id(dir.path(), "b", CoordinatorConfig::default());

    let ttl = Duration::from_millis(30_000);
    let (ra, rb) = tokio::join!(a.try_acquire_lock("R", ttl, 0), b.try_acquire_lock("R", ttl, 0));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert!(ra.is_some() != rb.is_some(), "exactly one coordinator must win");
    let handle = ra.or(rb).unwrap();
    let locks = a.list_locks().await.unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].lock_id, handle.lock_id());
}

#[tokio::test]
async fn scenario_c_expired_lock_is_cleaned_and_reacquired() {
    let dir = tempfile::TempDir::new().unwrap();
    let holder = Coordinator::with_instance_id(dir.path(), "holder", CoordinatorConfig::default());
    let sweeper = Coordinator::with_instance_id(dir.path(), "sweeper", CoordinatorConfig::default());
    let next = Coordinator::with_instance_id(dir.path(), "next", CoordinatorConfig::default());

    let _abandoned = holder
        .try_acquire_lock("R", Duration::from_millis(100), 0)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let report = sweeper.cleanup_expired_locks().await.unwrap();
    assert_eq!(report.removed, vec!["R".to_string()]);

    let handle = next
        .try_acquire_lock("R", Duration::from_secs(30), 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.record().owner_instance_id, "next");
}

#[tokio::test(start_paused = true)]
async fn scenario_d_join_waits_for_both_roots() {
    let admission = AdmissionController::new(RuntimeLimits::default(), &AdmissionConfig::default());
    let resilience = Resilience::new(
        RetryPolicy::no_retry(),
        BreakerRegistry::new(5, Duration::from_secs(30)),
        ThrottleGate::in_memory(),
    );
    let executor = DagExecutor::new(admission, Arc::new(resilience));

    let finished = Arc::new(Mutex::new(Vec::<String>::new()));
    let c_input = Arc::new(Mutex::new(None::<TaskInput>));
    let (f, ci) = (Arc::clone(&finished), Arc::clone(&c_input));
    let runner = Arc::new(move |input: TaskInput, _: CancellationToken| {
        let (finished, c_input) = (Arc::clone(&f), Arc::clone(&ci));
        async move {
            let id = input.task.id.clone();
            if id == "C" {
                // Both roots must be done before C starts.
                assert_eq!(finished.lock().len(), 2);
                *c_input.lock() = Some(input);
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            finished.lock().push(id.clone());
            Ok::<_, WorkError>(format!("{id} output"))
        }
    });

    let plan = TaskPlan::new(vec![
        TaskNode::new("A", "first root"),
        TaskNode::new("B", "second root"),
        TaskNode::new("C", "join").depends_on(["A", "B"]),
    ]);
    let report = executor.run(&plan, runner, ExecutorOptions::default()).await.unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    let finished = finished.lock().clone();
    assert_eq!(finished.last().map(String::as_str), Some("C"));
    // A and B ran in one batch: total time is one sleep, not two.
    assert!(report.duration < Duration::from_millis(40), "{:?}", report.duration);

    let input = c_input.lock().clone().unwrap();
    assert_eq!(input.output_of("A"), Some("A output"));
    assert_eq!(input.output_of("B"), Some("B output"));
    let context = input.render_context();
    assert!(context.contains("### A") && context.contains("### B"), "{context}");
}

#[tokio::test(start_paused = true)]
async fn scenario_e_breaker_opens_then_allows_one_trial() {
    let cooldown = Duration::from_secs(10);
    let layer = Arc::new(Resilience::new(
        RetryPolicy::no_retry(),
        BreakerRegistry::new(5, cooldown),
        ThrottleGate::in_memory(),
    ));
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let c = Arc::clone(&calls);
        let result: Result<(), _> = layer
            .call("provider", &cancel, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(WorkError::Fatal("500 from upstream parser".into())) }
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::Failed(_))));
    }
    assert_eq!(
        layer.breakers().snapshot("provider").unwrap().status,
        BreakerStatus::Open
    );

    // Sixth call fails fast without invoking the operation.
    let c = Arc::clone(&calls);
    let result: Result<(), ResilienceError<WorkError>> = layer
        .call("provider", &cancel, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    tokio::time::sleep(cooldown).await;

    // The first call after the cooldown is the single trial; a concurrent
    // call during the trial is still rejected.
    let release = Arc::new(tokio::sync::Notify::new());
    let trial = {
        let layer = Arc::clone(&layer);
        let c = Arc::clone(&calls);
        let release = Arc::clone(&release);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            layer
                .call("provider", &cancel, move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    let release = Arc::clone(&release);
                    async move {
                        release.notified().await;
                        Ok::<_, WorkError>("recovered")
                    }
                })
                .await
        })
    };
    // Lets the trial reach its operation; the clock only advances once it is parked.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    let c = Arc::clone(&calls);
    let concurrent: Result<(), ResilienceError<WorkError>> = layer
        .call("provider", &cancel, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
    assert!(matches!(concurrent, Err(ResilienceError::CircuitOpen { .. })));

    release.notify_one();
    assert_eq!(trial.await.unwrap().unwrap(), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(
        layer.breakers().snapshot("provider").unwrap().status,
        BreakerStatus::Closed
    );
}
