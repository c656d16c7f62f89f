//! State written by one process is what the next process sees.

use crate::helpers::{ScriptedBackend, test_config};
use std::sync::Arc;
use tempfile::TempDir;
use vigil::goals::load_goals_snapshot;
use vigil::resource::FixedProbe;
use vigil::tasks::{INTERRUPTED_ERROR, load_tasks_snapshot};
use vigil::workload::WorkloadBackend;
use vigil::{
    DataPaths, Goal, GoalPriority, GoalStore, Orchestrator, Schedule, Task, TaskQueue, TaskStatus,
};

fn open(paths: &DataPaths, backend: &Arc<ScriptedBackend>) -> Orchestrator {
    Orchestrator::open(
        &test_config(),
        paths,
        Arc::clone(backend) as Arc<dyn WorkloadBackend>,
        Box::new(FixedProbe::new(0, 16_384)),
    )
    .expect("open orchestrator")
}

#[tokio::test]
async fn reopened_stores_match_what_was_written() {
    let dir = TempDir::new().unwrap();
    let paths = DataPaths::new(dir.path());
    let backend = ScriptedBackend::new();

    let (goals, tasks) = {
        let mut orch = open(&paths, &backend);
        orch.register_goal(Goal::new(
            "summarise inbox",
            Schedule::parse("6h").unwrap(),
            GoalPriority::High,
        ))
        .unwrap();
        orch.register_goal(
            Goal::new("index photos", Schedule::OneShot, GoalPriority::Low).with_unit("beta"),
        )
        .unwrap();
        orch.enqueue_task(Task::new("ad hoc cleanup", 3)).unwrap();

        orch.tick().await.unwrap();
        orch.shutdown().await.unwrap();
        (orch.goals().goals().to_vec(), orch.tasks().tasks().to_vec())
    };

    let store = GoalStore::open(paths.goals_file()).unwrap();
    assert_eq!(store.goals(), goals.as_slice());
    assert_eq!(load_goals_snapshot(&paths.goals_file()).unwrap(), goals);

    let queue = TaskQueue::open(paths.tasks_file(), 3).unwrap();
    assert_eq!(queue.tasks(), tasks.as_slice());
    assert_eq!(load_tasks_snapshot(&paths.tasks_file()).unwrap(), tasks);
    assert_eq!(queue.counts().completed, 1);
    assert_eq!(queue.counts().pending, 2);

    let pinned = store
        .goals()
        .iter()
        .find(|g| g.description == "index photos")
        .unwrap();
    assert_eq!(pinned.unit.as_deref(), Some("beta"));
    assert_eq!(pinned.schedule, Schedule::OneShot);
}

#[tokio::test]
async fn running_task_is_recovered_through_failure_path() {
    let dir = TempDir::new().unwrap();
    let paths = DataPaths::new(dir.path());

    let task_id = {
        let mut queue = TaskQueue::open(paths.tasks_file(), 3).unwrap();
        let id = queue.enqueue(Task::new("interrupted work", 3)).unwrap();
        queue
            .update_status(&id, TaskStatus::Running, None, None)
            .unwrap();
        id
    };

    let orch = open(&paths, &ScriptedBackend::new());

    let task = orch.tasks().get(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retries, 1);
    assert_eq!(task.error.as_deref(), Some(INTERRUPTED_ERROR));

    // The recovery itself was persisted.
    let on_disk = load_tasks_snapshot(&paths.tasks_file()).unwrap();
    assert_eq!(on_disk[0].status, TaskStatus::Pending);
    assert_eq!(on_disk[0].retries, 1);
}

#[tokio::test]
async fn recovered_task_runs_on_the_next_tick() {
    let dir = TempDir::new().unwrap();
    let paths = DataPaths::new(dir.path());

    let task_id = {
        let mut queue = TaskQueue::open(paths.tasks_file(), 3).unwrap();
        let id = queue.enqueue(Task::new("resume me", 3)).unwrap();
        queue
            .update_status(&id, TaskStatus::Running, None, None)
            .unwrap();
        id
    };

    let backend = ScriptedBackend::new();
    let mut orch = open(&paths, &backend);
    orch.tick().await.unwrap();

    let task = orch.tasks().get(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retries, 1);
    assert_eq!(backend.load_count(), 1);
}

#[tokio::test]
async fn health_counters_survive_restart() {
    let dir = TempDir::new().unwrap();
    let paths = DataPaths::new(dir.path());
    let backend = ScriptedBackend::new();
    backend.script_run(Err("out of memory"));

    {
        let mut orch = open(&paths, &backend);
        orch.enqueue_task(Task::new("fails once", 1)).unwrap();
        orch.enqueue_task(Task::new("succeeds", 3)).unwrap();
        orch.tick().await.unwrap();
        orch.tick().await.unwrap();
        orch.shutdown().await.unwrap();
        assert!(!orch.health().alive);
    }

    let orch = open(&paths, &backend);
    let health = orch.health();
    assert_eq!(health.tasks_completed, 1);
    assert_eq!(health.tasks_failed, 1);
    assert!(health.recent_errors.iter().any(|e| e.contains("out of memory")));
}
