//! Rig G feasibility gate and replan digest comparison.

mod common;

use basalt::domain::models::action::ExecutorMode;
use basalt::domain::models::task::{Step, TaskKind, TaskSource, TaskStatus};
use basalt::domain::ports::solver::PlanResponse;
use basalt::services::{CycleOutcome, NewTaskRequest};
use common::{build_harness, settle};
use serde_json::json;

fn module_step(label: &str) -> Step {
    let mut step = Step::leaf(label, 0, "building_step");
    step.meta.module_id = Some("m1".into());
    step.meta.args = Some(json!({"moduleId": "m1", "item": "cobblestone", "count": 4}));
    step
}

fn infeasible_request() -> NewTaskRequest {
    let mut request = NewTaskRequest::new(
        "Build bridge across ravine",
        TaskKind::new(TaskKind::BUILDING),
        TaskSource::Manual,
    );
    request.steps = Some(vec![module_step("place module")]);
    request.metadata = json!({
        "solver": {"rigG": {"feasible": false, "reason": "unreachable site"}}
    })
    .as_object()
    .cloned()
    .unwrap();
    request
}

#[tokio::test]
async fn rig_g_rejection_goes_unplannable() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(infeasible_request()).await.unwrap();

    let outcome = harness.executor.run_cycle().await;
    assert_eq!(
        outcome,
        CycleOutcome::Blocked {
            task_id: id,
            reason: "rig_g_rejected".to_string(),
        }
    );

    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Unplannable);
    assert!(task.metadata.solver.rig_g_checked);
    assert_eq!(
        task.metadata.solver.rig_g_replan.as_ref().unwrap().attempt,
        1
    );
    assert_eq!(harness.bot.dispatch_count(), 0, "rejected step never dispatches");
}

#[tokio::test]
async fn replan_with_new_digest_requeues() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(infeasible_request()).await.unwrap();
    harness.executor.run_cycle().await;

    // The regenerated plan has a different step label, hence a new digest.
    harness.solver.push_plan(PlanResponse {
        steps: vec![module_step("place module via north approach")],
        no_steps_reason: None,
        route: None,
    });
    harness.executor.execute_rig_g_replan(id).await;

    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.metadata.blocked_reason.is_none());
    assert!(!task.metadata.solver.rig_g_checked, "gate re-evaluates the new plan");
    assert_eq!(task.steps[0].label, "place module via north approach");
}

#[tokio::test]
async fn identical_digest_replans_exhaust() {
    let harness = build_harness(ExecutorMode::Live);
    let id = harness.service.add_task(infeasible_request()).await.unwrap();

    // The solver keeps producing the same plan; every regeneration has
    // an identical digest.
    harness.solver.set_default_steps(vec![module_step("place module")]);

    let outcome = harness.executor.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Blocked { .. }));
    let attempt = |task: &basalt::domain::models::task::Task| {
        task.metadata
            .solver
            .rig_g_replan
            .as_ref()
            .map_or(0, |r| r.attempt)
    };

    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(attempt(&task), 1);

    // Attempt 1 runs: identical digest, escalates to attempt 2.
    harness.executor.execute_rig_g_replan(id).await;
    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(attempt(&task), 2);
    assert_eq!(task.status, TaskStatus::Unplannable, "status untouched");

    // Attempt 2: identical again, escalates to attempt 3.
    harness.executor.execute_rig_g_replan(id).await;
    let task = harness.service.get_task(id).await.unwrap();
    assert_eq!(attempt(&task), 3);

    // Attempt 3: identical again; the schedule is exhausted.
    harness.executor.execute_rig_g_replan(id).await;
    settle().await;
    let task = harness.service.get_task(id).await.unwrap();
    assert!(task
        .metadata
        .blocked_reason
        .as_deref()
        .unwrap()
        .starts_with("rig_g_replan_exhausted"));
    assert_eq!(attempt(&task), 3, "attempt counter stops at the cap");
}
