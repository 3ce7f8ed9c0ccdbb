#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end runs through `RuntimeContext`: plans loaded from disk, partial
//! failure reporting and the global capacity ceiling across concurrent plans.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agentgate_core::Config;
use agentgate_core::config::{CoordinatorConfig, RetryConfig};
use tokio_util::sync::CancellationToken;

use agentgate_runtime::RuntimeContext;
use agentgate_runtime::dag::{ExecutorOptions, PlanError, PlanStatus, TaskInput, TaskPlan, TaskStatus};
use agentgate_runtime::resilience::WorkError;

fn config(state_dir: PathBuf, max_requests: u32) -> Config {
    let mut config = Config {
        coordinator: CoordinatorConfig {
            state_dir: Some(state_dir),
            ..CoordinatorConfig::default()
        },
        retry: RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
            ..RetryConfig::default()
        },
        ..Config::default()
    };
    config.limits.max_total_active_requests = max_requests;
    config.limits.max_total_active_llm = max_requests;
    config
}

const RESEARCH_PLAN: &str = r#"{
  "tasks": [
    {"id": "collect", "description": "Collect sources", "assigned_role": "researcher"},
    {"id": "summarise", "description": "Summarise sources", "dependencies": ["collect"]},
    {"id": "review", "description": "Review summary", "dependencies": ["summarise"], "assigned_role": "reviewer"},
    {"id": "benchmarks", "description": "Run benchmarks", "priority": 2},
    {"id": "report", "description": "Write report", "dependencies": ["review", "benchmarks"]}
  ]
}"#;

#[tokio::test]
async fn plan_from_disk_with_flaky_and_failing_tasks() {
    let dir = tempfile::TempDir::new().unwrap();
    let plan_path = dir.path().join("plan.json");
    std::fs::write(&plan_path, RESEARCH_PLAN).unwrap();
    let plan = TaskPlan::load(&plan_path).await.unwrap();
    assert_eq!(plan.batches().unwrap().len(), 4);

    let ctx = RuntimeContext::start(config(dir.path().join("state"), 4)).await.unwrap();
    let flaky_attempts = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&flaky_attempts);
    let runner = Arc::new(move |input: TaskInput, _: CancellationToken| {
        let attempts = Arc::clone(&attempts);
        async move {
            match input.task.id.as_str() {
                // Fails once with a transient error, then succeeds.
                "collect" if attempts.fetch_add(1, Ordering::SeqCst) == 0 => {
                    Err(WorkError::classify_message("connection reset by peer"))
                }
                "review" => Err(WorkError::Fatal("reviewer rejected summary".into())),
                id => Ok(format!("{id}: done ({} inputs)", input.dependency_outputs.len())),
            }
        }
    });

    let report = ctx
        .run_plan(&plan, runner, ExecutorOptions::default().with_cancel(ctx.child_token()))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Partial);
    assert_eq!(flaky_attempts.load(Ordering::SeqCst), 2);
    let status = |id: &str| report.result(id).unwrap().status;
    assert_eq!(status("collect"), TaskStatus::Completed);
    assert_eq!(status("summarise"), TaskStatus::Completed);
    assert_eq!(status("benchmarks"), TaskStatus::Completed);
    assert_eq!(status("review"), TaskStatus::Failed);
    assert_eq!(status("report"), TaskStatus::Skipped);
    assert_eq!(
        report.result("summarise").unwrap().output.as_deref(),
        Some("summarise: done (1 inputs)")
    );
    assert_eq!(ctx.admission().snapshot().committed_requests(), 0);
    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_running() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = RuntimeContext::start(config(dir.path().to_path_buf(), 4)).await.unwrap();
    let plan = TaskPlan::from_json(
        r#"{"tasks": [{"id": "a", "dependencies": ["b"]}, {"id": "b", "dependencies": ["a"]}]}"#,
    )
    .unwrap();
    let runner = Arc::new(|_: TaskInput, _: CancellationToken| async {
        Ok::<_, WorkError>(String::new())
    });

    let err = ctx.run_plan(&plan, runner, ExecutorOptions::default()).await.unwrap_err();
    match err {
        PlanError::CycleDetected { remaining } => assert_eq!(remaining, vec!["a", "b"]),
        other => panic!("expected a cycle, got {other}"),
    }
    ctx.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_plans_share_the_global_ceiling() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = Arc::new(RuntimeContext::start(config(dir.path().to_path_buf(), 3)).await.unwrap());

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (c, p) = (Arc::clone(&current), Arc::clone(&peak));
    let runner = Arc::new(move |input: TaskInput, _: CancellationToken| {
        let (current, peak) = (Arc::clone(&c), Arc::clone(&p));
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, WorkError>(input.task.id)
        }
    });

    let wide = TaskPlan::from_json(
        r#"{"tasks": [{"id": "t1"}, {"id": "t2"}, {"id": "t3"}, {"id": "t4"}, {"id": "t5"}, {"id": "t6"}]}"#,
    )
    .unwrap();
    let mut runs = Vec::new();
    for _ in 0..3 {
        let ctx = Arc::clone(&ctx);
        let runner = Arc::clone(&runner);
        let plan = wide.clone();
        runs.push(tokio::spawn(async move {
            ctx.run_plan(&plan, runner, ExecutorOptions::default()).await.unwrap()
        }));
    }
    for run in runs {
        assert_eq!(run.await.unwrap().status, PlanStatus::Completed);
    }

    // Three plans of up to four parallel tasks each, never more than three
    // running at once across all of them.
    assert!(peak.load(Ordering::SeqCst) <= 3, "peak {}", peak.load(Ordering::SeqCst));
    assert_eq!(ctx.admission().snapshot().committed_requests(), 0);
    ctx.shutdown().await.unwrap();
}
