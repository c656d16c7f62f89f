//! Only one process writes a data directory at a time.

use crate::helpers::{ScriptedBackend, test_config};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vigil::authority::LeaderLease;
use vigil::goals::load_goals_snapshot;
use vigil::inbox::{StoreCommand, Submission, submit};
use vigil::resource::FixedProbe;
use vigil::tasks::{INTERRUPTED_ERROR, load_tasks_snapshot};
use vigil::workload::WorkloadBackend;
use vigil::{
    DataPaths, Goal, GoalPriority, Orchestrator, Schedule, Task, TaskQueue, TaskStatus,
    TickOutcome, VigilError,
};

fn open(paths: &DataPaths, backend: &Arc<ScriptedBackend>) -> vigil::Result<Orchestrator> {
    Orchestrator::open(
        &test_config(),
        paths,
        Arc::clone(backend) as Arc<dyn WorkloadBackend>,
        Box::new(FixedProbe::new(0, 16_384)),
    )
}

#[tokio::test]
async fn second_scheduler_is_refused_while_first_runs_a_task() {
    let dir = TempDir::new().unwrap();
    let paths = DataPaths::new(dir.path());
    let backend = ScriptedBackend::new();
    let other_backend = ScriptedBackend::new();
    let gate = backend.gate_next_run();

    let mut first = open(&paths, &backend).unwrap();
    let task_id = first.enqueue_task(Task::new("long analysis", 3)).unwrap();

    let second_attempt = async {
        gate.entered.notified().await;
        let second = open(&paths, &other_backend);
        let on_disk = load_tasks_snapshot(&paths.tasks_file()).unwrap();
        gate.release.notify_one();
        (second, on_disk)
    };
    let (outcome, (second, on_disk)) = tokio::join!(first.tick(), second_attempt);

    let err = second.err().expect("second scheduler must be refused");
    assert!(matches!(err, VigilError::Lease(_)), "{err}");

    // The running task was not put through restart recovery.
    let during_run = on_disk.iter().find(|t| t.id == task_id).unwrap();
    assert_eq!(during_run.status, TaskStatus::Running);
    assert_eq!(during_run.retries, 0);
    assert!(during_run.error.is_none());

    assert_eq!(
        outcome.unwrap(),
        TickOutcome::Executed {
            task_id: task_id.clone(),
            status: TaskStatus::Completed
        }
    );
    assert_eq!(backend.load_count(), 1);
    assert!(other_backend.calls().is_empty());
}

#[tokio::test]
async fn shutdown_hands_the_directory_to_the_next_scheduler() {
    let dir = TempDir::new().unwrap();
    let paths = DataPaths::new(dir.path());
    let backend = ScriptedBackend::new();

    let mut first = open(&paths, &backend).unwrap();
    first.run_once().await.unwrap();

    let second = open(&paths, &backend).expect("lease released by shutdown");
    drop(second);
    drop(first);
    assert!(!paths.lease_file().exists());
}

#[tokio::test]
async fn expired_lease_of_crashed_scheduler_is_taken_over() {
    let dir = TempDir::new().unwrap();
    let paths = DataPaths::new(dir.path());

    let task_id = {
        let mut queue = TaskQueue::open(paths.tasks_file(), 3).unwrap();
        let id = queue.enqueue(Task::new("half done", 3)).unwrap();
        queue
            .update_status(&id, TaskStatus::Running, None, None)
            .unwrap();
        id
    };
    // A process that died long ago without releasing its lease.
    let crashed = LeaderLease::new(paths.lease_file(), Duration::from_secs(60));
    crashed.try_acquire_or_renew_at(1_000).unwrap();
    std::mem::forget(crashed);

    let orch = open(&paths, &ScriptedBackend::new()).unwrap();

    let task = orch.tasks().get(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.error.as_deref(), Some(INTERRUPTED_ERROR));
}

#[tokio::test]
async fn goal_added_during_a_run_survives_the_daemon_writes() {
    let dir = TempDir::new().unwrap();
    let paths = DataPaths::new(dir.path());
    let backend = ScriptedBackend::new();
    let gate = backend.gate_next_run();

    let mut daemon = open(&paths, &backend).unwrap();
    daemon
        .register_goal(Goal::new(
            "rotate logs",
            Schedule::Interval { secs: 3600 },
            GoalPriority::Normal,
        ))
        .unwrap();

    let cli = async {
        gate.entered.notified().await;
        let submission = submit(
            &test_config(),
            &paths,
            StoreCommand::RegisterGoal {
                goal: Goal::new("compact database", Schedule::OneShot, GoalPriority::High),
            },
        );
        gate.release.notify_one();
        submission
    };
    let (first_tick, submission) = tokio::join!(daemon.tick(), cli);
    first_tick.unwrap();
    assert!(matches!(submission.unwrap(), Submission::Queued { .. }));

    // The next tick applies the queued registration and runs it.
    let second_tick = daemon.tick().await.unwrap();
    assert!(matches!(
        second_tick,
        TickOutcome::Executed { status: TaskStatus::Completed, .. }
    ));

    let on_disk = load_goals_snapshot(&paths.goals_file()).unwrap();
    let mut descriptions: Vec<&str> = on_disk.iter().map(|g| g.description.as_str()).collect();
    descriptions.sort_unstable();
    assert_eq!(descriptions, vec!["compact database", "rotate logs"]);
    assert!(on_disk.iter().all(|g| g.success_count == 1));
    assert!(!paths.inbox_file().exists());
}
