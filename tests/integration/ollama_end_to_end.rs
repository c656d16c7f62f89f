//! A full tick against a mocked Ollama server.

use crate::helpers::test_config;
use serde_json::json;
use std::sync::Arc;
use vigil::resource::FixedProbe;
use vigil::{
    Goal, GoalPriority, OllamaBackend, Orchestrator, Schedule, TaskStatus, TickOutcome,
    VigilConfig,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> VigilConfig {
    let mut config = test_config();
    config.backend.base_url = server.uri();
    config
}

fn orchestrator(server: &MockServer) -> Orchestrator {
    let config = config_for(server);
    let backend = Arc::new(OllamaBackend::new(&config.backend));
    Orchestrator::in_memory(&config, backend, Box::new(FixedProbe::new(0, 16_384))).unwrap()
}

/// Mount `/api/tags` plus the unload, prime and load handlers. The run
/// handler is left to each test.
async fn mount_common(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "model": "alpha", "keep_alive": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "", "done": true })))
        .with_priority(1)
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "prompt": "ok", "options": { "num_predict": 1 } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "o", "done": true })))
        .with_priority(2)
        .expect(1)
        .mount(server)
        .await;

    // Load carries only model and keep_alive, so it falls through to here.
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "", "done": true })))
        .with_priority(10)
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn tick_drives_full_lifecycle_over_http() {
    let server = MockServer::start().await;
    mount_common(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "alpha",
            "prompt": "audit disk usage",
            "stream": false,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "Disk is 40% full. The key result is that /var grows fastest.",
            "done": true,
            "prompt_eval_count": 12,
            "eval_count": 30,
            "total_duration": 2_000_000_000u64,
        })))
        .with_priority(3)
        .expect(1)
        .mount(&server)
        .await;

    let mut orch = orchestrator(&server);
    orch.register_goal(Goal::new(
        "audit disk usage",
        Schedule::OneShot,
        GoalPriority::Normal,
    ))
    .unwrap();

    let TickOutcome::Executed { task_id, status } = orch.tick().await.unwrap() else {
        panic!("expected execution");
    };
    assert_eq!(status, TaskStatus::Completed);

    let task = orch.tasks().get(&task_id).unwrap();
    assert!(task.result.as_deref().unwrap().contains("/var grows fastest"));

    let context = orch.relay().get("alpha").expect("insights extracted");
    assert_eq!(
        context.insights,
        vec!["The key result is that /var grows fastest.".to_owned()]
    );

    let outcomes = orch.metrics().outcomes_for_task(&task_id).unwrap();
    assert_eq!(outcomes, vec!["completed".to_owned()]);
    assert!(orch.health().dependencies_ok);

    // One-shot goal: nothing left to do.
    assert_eq!(orch.tick().await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn failed_run_still_unloads_and_requeues() {
    let server = MockServer::start().await;
    mount_common(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "prompt": "summarise logs", "stream": false })))
        .respond_with(ResponseTemplate::new(500).set_body_string("model runner crashed"))
        .with_priority(3)
        .expect(1)
        .mount(&server)
        .await;

    let mut orch = orchestrator(&server);
    orch.register_goal(Goal::new(
        "summarise logs",
        Schedule::OneShot,
        GoalPriority::Normal,
    ))
    .unwrap();

    let TickOutcome::Executed { task_id, status } = orch.tick().await.unwrap() else {
        panic!("expected execution");
    };
    assert_eq!(status, TaskStatus::Pending);

    let task = orch.tasks().get(&task_id).unwrap();
    assert_eq!(task.retries, 1);
    assert!(task.error.as_deref().unwrap().contains("500"));
    assert_eq!(orch.health().tasks_failed, 0);
    // Unload expectation is verified when the server drops.
}
