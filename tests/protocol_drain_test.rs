//! Protocol effect ordering: self-holds before persist, cross-entity
//! effects serialized through the drain.

mod common;

use basalt::domain::models::action::ExecutorMode;
use basalt::domain::models::goal::HoldReason;
use basalt::domain::models::task::{Step, TaskKind, TaskSource, TaskStatus};
use basalt::services::event_bus::EventPayload;
use basalt::services::{MutationOrigin, NewTaskRequest};
use common::{build_harness, settle, Harness};
use serde_json::json;

fn building_steps() -> Vec<Step> {
    let mut step = Step::leaf("place module", 0, "building_step");
    step.meta.module_id = Some("m1".into());
    step.meta.args = Some(json!({"moduleId": "m1", "item": "cobblestone", "count": 4}));
    vec![step]
}

async fn bound_pair(harness: &Harness) -> (uuid::Uuid, uuid::Uuid) {
    harness.solver.set_default_steps(building_steps());
    let mut request_a = NewTaskRequest::new(
        "Build shelter east",
        TaskKind::new(TaskKind::BUILDING),
        TaskSource::Goal,
    );
    request_a.parameters.goal_type = Some("build_shelter".into());
    request_a.parameters.intent_params = Some(json!({"site": "east"}));
    request_a.parameters.extra.insert("goalId".into(), json!("goal-1"));
    let a = harness.service.add_task(request_a).await.unwrap();

    let mut request_b = NewTaskRequest::new(
        "Build shelter west",
        TaskKind::new(TaskKind::BUILDING),
        TaskSource::Goal,
    );
    request_b.parameters.goal_type = Some("build_shelter".into());
    request_b.parameters.intent_params = Some(json!({"site": "west"}));
    request_b.parameters.extra.insert("goalId".into(), json!("goal-1"));
    let b = harness.service.add_task(request_b).await.unwrap();
    assert_ne!(a, b);
    (a, b)
}

#[tokio::test]
async fn pause_applies_self_hold_before_persist() {
    let harness = build_harness(ExecutorMode::Shadow);
    let (a, _) = bound_pair(&harness).await;

    harness
        .service
        .update_status(a, TaskStatus::Paused, MutationOrigin::Runtime)
        .await
        .unwrap();

    // Immediately after the mutation returns, the hold must already be
    // visible: observers never see paused without a hold.
    let task = harness.service.get_task(a).await.unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    let hold = task.metadata.goal_binding.unwrap().hold.unwrap();
    assert_eq!(hold.reason, HoldReason::ManualPause);
}

#[tokio::test]
async fn activation_preempts_sibling_through_drain() {
    let harness = build_harness(ExecutorMode::Shadow);
    let (a, b) = bound_pair(&harness).await;
    let mut events = harness.bus.subscribe();

    harness
        .service
        .update_status(a, TaskStatus::Active, MutationOrigin::Runtime)
        .await
        .unwrap();
    settle().await;

    // The drain paused the sibling and stamped its preemption hold.
    let sibling = harness.service.get_task(b).await.unwrap();
    assert_eq!(sibling.status, TaskStatus::Paused);
    let hold = sibling.metadata.goal_binding.unwrap().hold.unwrap();
    assert_eq!(hold.reason, HoldReason::Preempted);

    // Observable order: A's status change lands before the sibling's.
    let mut saw_a_active = false;
    let mut order_ok = false;
    while let Ok(event) = events.try_recv() {
        match event.payload {
            EventPayload::TaskStatusChanged { task_id, to, .. } => {
                if task_id == a && to == TaskStatus::Active {
                    saw_a_active = true;
                }
                if task_id == b && to == TaskStatus::Paused {
                    order_ok = saw_a_active;
                }
            }
            _ => {}
        }
    }
    assert!(saw_a_active);
    assert!(order_ok, "sibling pause must come after the originating change");
}

#[tokio::test]
async fn goal_status_effect_emitted_after_drain() {
    let harness = build_harness(ExecutorMode::Shadow);
    let (a, _) = bound_pair(&harness).await;
    let mut events = harness.bus.subscribe();

    harness
        .service
        .update_status(a, TaskStatus::Paused, MutationOrigin::Runtime)
        .await
        .unwrap();
    settle().await;

    let mut saw_goal_update = false;
    while let Ok(event) = events.try_recv() {
        if let EventPayload::GoalStatusUpdated { goal_id, .. } = event.payload {
            assert_eq!(goal_id, "goal-1");
            saw_goal_update = true;
        }
    }
    assert!(saw_goal_update);
}

#[tokio::test]
async fn management_pause_resume_roundtrip() {
    let harness = build_harness(ExecutorMode::Shadow);
    let (a, _) = bound_pair(&harness).await;

    harness.service.pause(a).await.unwrap();
    let paused = harness.service.get_task(a).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert_eq!(
        paused
            .metadata
            .goal_binding
            .as_ref()
            .unwrap()
            .hold
            .as_ref()
            .unwrap()
            .reason,
        HoldReason::ManualPause
    );

    harness.service.resume(a).await.unwrap();
    let resumed = harness.service.get_task(a).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Pending);
    assert!(resumed.metadata.goal_binding.unwrap().hold.is_none());
}

#[tokio::test]
async fn rejected_management_action_restores_prior_hold() {
    let harness = build_harness(ExecutorMode::Shadow);
    let (a, _) = bound_pair(&harness).await;

    // Drive the task terminal so a pause transition is rejected.
    harness
        .service
        .update_status(a, TaskStatus::Completed, MutationOrigin::Runtime)
        .await
        .unwrap();
    settle().await;

    let before = harness.service.get_task(a).await.unwrap();
    let prior_hold = before.metadata.goal_binding.as_ref().unwrap().hold.clone();

    assert!(harness.service.pause(a).await.is_err());

    let after = harness.service.get_task(a).await.unwrap();
    assert_eq!(
        after.metadata.goal_binding.unwrap().hold, prior_hold,
        "rejected pause must restore the preconditioned hold"
    );
}

#[tokio::test]
async fn metadata_patch_strips_binding_and_origin() {
    let harness = build_harness(ExecutorMode::Shadow);
    let (a, _) = bound_pair(&harness).await;

    let before = harness.service.get_task(a).await.unwrap();
    let patch = basalt::domain::models::metadata::MetadataPatch {
        tags: Some(vec!["priority".into()]),
        goal_binding: None,
        origin: Some(basalt::domain::models::origin::TaskOrigin::new(
            basalt::domain::models::origin::OriginKind::Unknown,
        )),
        ..Default::default()
    };
    harness.service.update_metadata(a, patch).await.unwrap();

    let after = harness.service.get_task(a).await.unwrap();
    assert_eq!(after.metadata.tags, vec!["priority".to_string()]);
    assert_eq!(after.metadata.origin, before.metadata.origin);
    assert_eq!(
        after.metadata.goal_binding.unwrap().goal_key,
        before.metadata.goal_binding.unwrap().goal_key
    );
}
