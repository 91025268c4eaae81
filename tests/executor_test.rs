//! Executor cycle behavior: deterministic failures, shadow mode,
//! rate limiting, eligibility, and idle classification.

mod common;

use basalt::domain::models::action::{ActionResponse, ExecutorMode, FailureCode};
use basalt::domain::models::task::{Step, TaskKind, TaskSource, TaskStatus};
use basalt::domain::models::verification::VerificationStatus;
use basalt::domain::models::world::InventoryItem;
use basalt::services::event_bus::IdleReason;
use basalt::services::{CycleOutcome, NewTaskRequest};
use chrono::{Duration, Utc};
use common::{build_harness, settle};
use serde_json::json;

fn gather_step() -> Step {
    Step::leaf("gather oak logs", 0, "acquire_material")
        .with_args(json!({"item": "oak_log", "count": 1}))
}

fn gather_request() -> NewTaskRequest {
    let mut request = NewTaskRequest::new(
        "Gather oak logs",
        TaskKind::new(TaskKind::GATHERING),
        TaskSource::Manual,
    );
    request.steps = Some(vec![gather_step()]);
    request
}

#[tokio::test]
async fn deterministic_failure_fast_path() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(gather_request()).await.unwrap();

    // Seed retry state to prove it is untouched by the fast path.
    harness
        .service
        .mutate_task(id, |t| t.metadata.retry_count = 1)
        .await
        .unwrap();

    harness.bot.push_response(ActionResponse::failed(
        "arg contract violated",
        Some(FailureCode::new(FailureCode::CONTRACT_VIOLATION)),
    ));

    let outcome = harness.executor.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::TaskFailed { .. }));

    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.metadata.retry_count, 1, "fast path must not retry");
    assert!(task.metadata.next_eligible_at.is_none());
    assert_eq!(
        task.metadata.blocked_reason.as_deref(),
        Some("deterministic-failure:CONTRACT_VIOLATION")
    );
    assert!(task
        .metadata
        .failure_code
        .as_ref()
        .is_some_and(FailureCode::is_deterministic));

    let stats = harness.executor.stats();
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.failures, 1);
}

#[tokio::test]
async fn nondeterministic_failure_backs_off() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(gather_request()).await.unwrap();

    harness.bot.push_response(ActionResponse::failed(
        "path blocked",
        Some(FailureCode::new("PATH_BLOCKED")),
    ));

    harness.executor.run_cycle().await;

    let task = harness.service.get_task(id).await.unwrap();
    assert!(!task.is_terminal());
    assert_eq!(task.metadata.retry_count, 1);
    let next = task.metadata.next_eligible_at.expect("backoff must be set");
    assert!(next > Utc::now());
}

#[tokio::test]
async fn shadow_mode_observes_without_dispatch() {
    let harness = build_harness(ExecutorMode::Shadow);
    let id = harness.service.add_task(gather_request()).await.unwrap();

    let outcome = harness.executor.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::ShadowObserved { task_id: id });

    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(task.metadata.blocked_reason.as_deref(), Some("shadow_mode"));
    assert_eq!(task.metadata.shadow_observation_count, 1);
    assert_eq!(harness.bot.dispatch_count(), 0, "shadow must not dispatch");
}

#[tokio::test]
async fn shadow_block_auto_clears_on_live_switch() {
    let harness = build_harness(ExecutorMode::Shadow);
    let id = harness.service.add_task(gather_request()).await.unwrap();

    harness.executor.run_cycle().await;
    let blocked = harness.service.get_task(id).await.unwrap();
    assert_eq!(blocked.metadata.blocked_reason.as_deref(), Some("shadow_mode"));

    // Operator flips to live; the pre-loop clears the block and the
    // observation count survives.
    harness.executor.set_mode(ExecutorMode::Live).await;
    // Make the verifier pass immediately so the cycle completes.
    harness
        .bot
        .set_inventory(vec![InventoryItem::new("oak_log", 2)]);

    let outcome = harness.executor.run_cycle().await;
    let task = harness.service.get_task(id).await.unwrap();
    assert_ne!(task.metadata.blocked_reason.as_deref(), Some("shadow_mode"));
    assert_eq!(task.metadata.shadow_observation_count, 1);
    assert!(!matches!(outcome, CycleOutcome::Idle(_)));
}

#[tokio::test]
async fn verified_step_completes_task() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(gather_request()).await.unwrap();

    // The unscripted dispatch simulates the acquisition, so the
    // inventory-delta verifier observes the new log.
    let outcome = harness.executor.run_cycle().await;
    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::StepDispatched {
            task_id: id,
            step_id: task.steps[0].id.clone(),
            verification: VerificationStatus::Verified,
        }
    );
    assert!(task.steps[0].done);
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn blocked_task_never_selected() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(gather_request()).await.unwrap();
    harness
        .service
        .mutate_task(id, |t| t.set_blocked("waiting_on_prereq"))
        .await
        .unwrap();

    let outcome = harness.executor.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Idle(IdleReason::BlockedOnPrereq));
    assert_eq!(harness.bot.dispatch_count(), 0);
}

#[tokio::test]
async fn backoff_task_never_selected() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(gather_request()).await.unwrap();
    harness
        .service
        .mutate_task(id, |t| {
            t.metadata.next_eligible_at = Some(Utc::now() + Duration::seconds(60));
        })
        .await
        .unwrap();

    let outcome = harness.executor.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Idle(IdleReason::AllInBackoff));
}

#[tokio::test]
async fn empty_store_is_idle_no_tasks() {
    let harness = build_harness(ExecutorMode::Live);
    let outcome = harness.executor.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Idle(IdleReason::NoTasks));
}

#[tokio::test]
async fn stats_aggregate_across_cycles() {
    let harness = build_harness(ExecutorMode::Live);

    // Idle cycle, then a verified dispatch.
    harness.executor.run_cycle().await;
    harness.service.add_task(gather_request()).await.unwrap();
    harness.executor.run_cycle().await;

    let stats = harness.executor.stats();
    assert_eq!(stats.cycles, 2);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.verified, 1);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn highest_priority_oldest_wins() {
    let harness = build_harness(ExecutorMode::Shadow);

    let mut low = gather_request();
    low.title = "gather low priority birch".into();
    low.priority = Some(json!(0.3));
    harness.service.add_task(low).await.unwrap();

    let mut high = gather_request();
    high.title = "gather high priority diamond ore".into();
    high.priority = Some(json!(0.9));
    let high_id = harness.service.add_task(high).await.unwrap();

    let outcome = harness.executor.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::ShadowObserved { task_id: high_id });
}

#[tokio::test]
async fn blocked_ttl_auto_fails() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(gather_request()).await.unwrap();
    harness
        .service
        .mutate_task(id, |t| {
            t.set_blocked("waiting_on_prereq");
            // Backdate past the TTL.
            t.metadata.blocked_at = Some(Utc::now() - Duration::minutes(10));
        })
        .await
        .unwrap();

    harness.executor.run_cycle().await;

    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .metadata
        .fail_reason
        .as_deref()
        .unwrap()
        .starts_with("blocked_ttl_expired"));
}

#[tokio::test]
async fn unknown_leaf_rejected_and_blocked() {
    let harness = build_harness(ExecutorMode::Live);
    let mut request = NewTaskRequest::new(
        "mystery action",
        TaskKind::new("mystery"),
        TaskSource::Manual,
    );
    request.steps = Some(vec![Step::leaf("do the thing", 0, "teleport_home")]);
    let id = harness.service.add_task(request).await.unwrap();

    let outcome = harness.executor.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Blocked { .. }));

    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(
        task.metadata.blocked_reason.as_deref(),
        Some("unknown-leaf:teleport_home")
    );
    assert!(!task.steps[0].meta.executable);
    assert_eq!(harness.bot.dispatch_count(), 0);
}

#[tokio::test]
async fn invalid_args_block_without_dispatch() {
    let harness = build_harness(ExecutorMode::Live);
    let mut request = gather_request();
    request.steps = Some(vec![
        Step::leaf("gather", 0, "acquire_material").with_args(json!({"count": 1}))
    ]);
    let id = harness.service.add_task(request).await.unwrap();

    let outcome = harness.executor.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Blocked { .. }));

    let task = harness.service.get_task(id).await.unwrap();
    assert!(task
        .metadata
        .blocked_reason
        .as_deref()
        .unwrap()
        .starts_with("invalid-args:"));
    assert_eq!(harness.bot.dispatch_count(), 0);
}

#[tokio::test]
async fn verify_failure_backs_off_then_skips() {
    let harness = build_harness(ExecutorMode::Live);

    // Use a move step whose verifier needs position delta; the scripted
    // bot never moves, so verification fails.
    let mut request = NewTaskRequest::new(
        "walk east",
        TaskKind::new("navigation"),
        TaskSource::Manual,
    );
    request.steps = Some(vec![Step::leaf("walk", 0, "move_to")
        .with_args(json!({"pos": {"x": 10.0, "y": 64.0, "z": 0.0}}))]);
    let id = harness.service.add_task(request).await.unwrap();

    for cycle in 1..=5 {
        // Clear the verify backoff so the next cycle picks it again.
        harness
            .service
            .mutate_task(id, |t| t.metadata.next_eligible_at = None)
            .await
            .unwrap();
        let outcome = harness.executor.run_cycle().await;
        let task = harness.service.get_task(id).await.unwrap();
        if cycle < 5 {
            assert_eq!(
                outcome,
                CycleOutcome::StepDispatched {
                    task_id: id,
                    step_id: task.steps[0].id.clone(),
                    verification: VerificationStatus::Failed,
                }
            );
            assert_eq!(task.metadata.verify_fail_count, cycle);
        } else {
            // Fifth failure force-completes the step with a skip.
            assert_eq!(
                outcome,
                CycleOutcome::StepDispatched {
                    task_id: id,
                    step_id: task.steps[0].id.clone(),
                    verification: VerificationStatus::Skipped,
                }
            );
            assert!(task.steps[0].done);
        }
    }
}

#[tokio::test]
async fn stopped_executor_refuses_cycles() {
    let harness = build_harness(ExecutorMode::Live);
    harness.service.add_task(gather_request()).await.unwrap();

    harness.stop.engage();
    settle().await;
    let outcome = harness.executor.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Stopped);
    assert_eq!(harness.bot.dispatch_count(), 0);
}
