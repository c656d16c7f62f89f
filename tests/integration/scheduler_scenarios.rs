//! End-to-end scheduling scenarios through the public orchestrator API.

use crate::helpers::{Call, ScriptedBackend, in_memory, test_config};
use chrono::{Duration, Utc};
use std::sync::Arc;
use vigil::resource::FixedProbe;
use vigil::workload::{WorkloadBackend, WorkloadUnit};
use vigil::{Goal, GoalPriority, LifecycleState, Orchestrator, Schedule, TaskStatus, TickOutcome};

fn every_30m(description: &str, priority: GoalPriority) -> Goal {
    Goal::new(description, Schedule::parse("30m").unwrap(), priority)
}

fn executed_status(outcome: TickOutcome) -> TaskStatus {
    match outcome {
        TickOutcome::Executed { status, .. } => status,
        other => panic!("expected an executed tick, got {other}"),
    }
}

#[tokio::test]
async fn first_run_completes_goal_and_waits_for_interval() {
    let backend = ScriptedBackend::new();
    let mut orch = in_memory(&backend, 0, 16_384);

    let t0 = Utc::now();
    let id = orch
        .register_goal(every_30m("rotate logs", GoalPriority::Normal))
        .unwrap()
        .id()
        .to_owned();
    assert!(orch.goals().get(&id).unwrap().is_due_at(t0));

    let status = executed_status(orch.tick().await.unwrap());
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(orch.tasks().tasks().len(), 1);

    let goal = orch.goals().get(&id).unwrap();
    let t1 = goal.last_run.expect("last_run set");
    assert!(t1 >= t0);
    assert_eq!(goal.success_count, 1);
    assert!(!goal.is_due_at(t1 + Duration::minutes(30)));
    assert!(goal.is_due_at(t1 + Duration::minutes(30) + Duration::seconds(1)));

    assert_eq!(orch.tick().await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn critical_goal_runs_before_normal_goal() {
    let backend = ScriptedBackend::new();
    let mut orch = in_memory(&backend, 0, 16_384);

    let normal = orch
        .register_goal(every_30m("tidy downloads", GoalPriority::Normal))
        .unwrap()
        .id()
        .to_owned();
    let critical = orch
        .register_goal(every_30m("check backups", GoalPriority::Critical))
        .unwrap()
        .id()
        .to_owned();

    let TickOutcome::Executed { task_id, .. } = orch.tick().await.unwrap() else {
        panic!("expected execution");
    };
    let first = orch.tasks().get(&task_id).unwrap();
    assert_eq!(first.goal_id.as_deref(), Some(critical.as_str()));

    let pending = orch.tasks().next().unwrap();
    assert_eq!(pending.goal_id.as_deref(), Some(normal.as_str()));
}

#[tokio::test]
async fn exhausted_retries_end_in_failed() {
    let backend = ScriptedBackend::new();
    for _ in 0..3 {
        backend.script_run(Err("segfault in kernel"));
    }
    let mut orch = in_memory(&backend, 0, 16_384);
    let goal_id = orch
        .register_goal(every_30m("flaky job", GoalPriority::High))
        .unwrap()
        .id()
        .to_owned();

    let mut observed = Vec::new();
    for _ in 0..3 {
        let TickOutcome::Executed { task_id, status } = orch.tick().await.unwrap() else {
            panic!("expected execution");
        };
        let task = orch.tasks().get(&task_id).unwrap();
        assert!(task.retries <= task.max_retries);
        observed.push((status, task.retries));
    }

    assert_eq!(
        observed,
        vec![
            (TaskStatus::Pending, 1),
            (TaskStatus::Pending, 2),
            (TaskStatus::Failed, 3),
        ]
    );

    let failed = &orch.tasks().tasks()[0];
    assert_eq!(failed.error.as_deref().map(|e| e.contains("segfault")), Some(true));

    let goal = orch.goals().get(&goal_id).unwrap();
    assert_eq!(goal.failure_count, 1);
    assert_eq!(goal.success_count, 0);

    // Terminal: later ticks never resurrect it.
    assert_eq!(orch.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(orch.tasks().tasks()[0].status, TaskStatus::Failed);
    assert_eq!(orch.tasks().tasks().len(), 1);
}

#[tokio::test]
async fn admission_denial_never_loads() {
    let backend = ScriptedBackend::new();
    let mut config = test_config();
    config.workloads = vec![WorkloadUnit::new("alpha", 2_000)];
    let mut orch = Orchestrator::in_memory(
        &config,
        Arc::clone(&backend) as Arc<dyn WorkloadBackend>,
        Box::new(FixedProbe::new(7_000, 8_192)),
    )
    .unwrap();
    orch.register_goal(every_30m("big job", GoalPriority::Normal))
        .unwrap();

    match orch.tick().await.unwrap() {
        TickOutcome::Deferred { reason, .. } => assert!(reason.contains("exceeds"), "{reason}"),
        other => panic!("expected deferral, got {other}"),
    }
    assert_eq!(backend.load_count(), 0);
    assert_eq!(orch.tasks().counts().pending, 1);
}

#[tokio::test]
async fn deferred_goal_never_gets_a_second_outstanding_task() {
    let backend = ScriptedBackend::new();
    let mut orch = in_memory(&backend, 7_900, 8_192);
    let goal_id = orch
        .register_goal(every_30m("waits for room", GoalPriority::Normal))
        .unwrap()
        .id()
        .to_owned();

    for _ in 0..5 {
        assert!(matches!(
            orch.tick().await.unwrap(),
            TickOutcome::Deferred { .. }
        ));
    }

    let outstanding = orch
        .tasks()
        .tasks()
        .iter()
        .filter(|t| t.goal_id.as_deref() == Some(goal_id.as_str()) && t.status.is_outstanding())
        .count();
    assert_eq!(outstanding, 1);
    assert_eq!(backend.load_count(), 0);
}

#[tokio::test]
async fn release_failure_leaves_lifecycle_idle() {
    let backend = ScriptedBackend::new();
    backend.fail_unload(true);
    let mut orch = in_memory(&backend, 0, 16_384);
    orch.register_goal(every_30m("first", GoalPriority::High))
        .unwrap();
    orch.register_goal(every_30m("second", GoalPriority::Normal))
        .unwrap();

    assert_eq!(executed_status(orch.tick().await.unwrap()), TaskStatus::Completed);
    assert_eq!(orch.lifecycle_state(), LifecycleState::Idle);
    assert!(
        orch.health()
            .recent_errors
            .iter()
            .any(|e| e.contains("device busy"))
    );

    // The next tick acquires again instead of tripping over a stuck unit.
    assert_eq!(executed_status(orch.tick().await.unwrap()), TaskStatus::Completed);
    assert_eq!(backend.load_count(), 2);
    assert_eq!(
        backend.calls(),
        vec![
            Call::Load("alpha".to_owned()),
            Call::Prime("alpha".to_owned()),
            Call::Run("alpha".to_owned()),
            Call::Unload("alpha".to_owned()),
            Call::Load("beta".to_owned()),
            Call::Prime("beta".to_owned()),
            Call::Run("beta".to_owned()),
            Call::Unload("beta".to_owned()),
        ]
    );
}

#[tokio::test]
async fn successor_receives_at_most_three_insights() {
    let backend = ScriptedBackend::new();
    backend.script_run(Ok(
        "The key point is A. The key point is B. The key point is C. The key point is D.",
    ));
    let mut orch = in_memory(&backend, 0, 16_384);
    orch.register_goal(every_30m("producer", GoalPriority::High))
        .unwrap();
    orch.register_goal(every_30m("consumer", GoalPriority::Normal))
        .unwrap();

    orch.tick().await.unwrap();
    orch.tick().await.unwrap();

    let inputs = backend.inputs();
    assert_eq!(inputs.len(), 2);
    assert!(inputs[0].context.is_none());

    let context = inputs[1].context.as_ref().expect("relayed context");
    assert_eq!(context.producer_id, "alpha");
    assert_eq!(context.insights.len(), 3);
    assert_eq!(context.insights[0], "The key point is A.");
    assert!(inputs[1].prompt().contains("The key point is C."));
    assert!(!inputs[1].prompt().contains("The key point is D."));
}
