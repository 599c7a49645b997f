//! HTTP and WebSocket acceptance tests.
//!
//! Covers: health, metrics, ontology writes, submit with and without
//! capacity, error bodies, the agent lane (welcome, assignment, reports,
//! error frames, deregistration) and the observers stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mothership_middleware::{AgentClient, ServerMessage, TaskReport};
use mothership_runtime::HashingEmbedder;
use mothership_server::{AppState, ServiceConfig};
use mothership_types::{Agent, Event, EventPayload, Task, TaskStatus};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a server on an ephemeral port with in-memory stores.
async fn start_server() -> std::net::SocketAddr {
    let state = AppState::open(
        None,
        ServiceConfig::default(),
        Arc::new(HashingEmbedder::default()),
    )
    .unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mothership_server::serve(listener, state, std::future::pending()));
    addr
}

async fn seed_fairness(http: &reqwest::Client, addr: std::net::SocketAddr) {
    let resp = http
        .post(format!("http://{addr}/api/ontology/values"))
        .json(&json!({
            "name": "Fairness",
            "description": "solve every math problem fairly",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
}

async fn register(http: &reqwest::Client, addr: std::net::SocketAddr, name: &str) -> Agent {
    let resp = http
        .post(format!("http://{addr}/api/agents"))
        .json(&json!({ "name": name, "agent_type": "math", "status": "active" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

async fn submit(http: &reqwest::Client, addr: std::net::SocketAddr) -> reqwest::Response {
    http.post(format!("http://{addr}/api/tasks/submit"))
        .json(&json!({ "agent_type": "math", "context": "solve 2x+3=7 in math" }))
        .send()
        .await
        .unwrap()
}

/// Next non-heartbeat frame from the server.
async fn next_frame(client: &mut AgentClient) -> ServerMessage {
    loop {
        let msg = timeout(TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if !matches!(msg, ServerMessage::Heartbeat { .. }) {
            return msg;
        }
    }
}

#[tokio::test]
async fn health_and_ready() {
    let addr = start_server().await;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let ready = http.get(format!("http://{addr}/ready")).send().await.unwrap();
    assert_eq!(ready.status(), 200);
}

#[tokio::test]
async fn submit_without_agents_is_service_unavailable() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    seed_fairness(&http, addr).await;

    let resp = submit(&http, addr).await;
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "no_eligible_agent");

    let recent: Vec<Task> = http
        .get(format!("http://{addr}/api/tasks/recent"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(recent.is_empty());
}

#[tokio::test]
async fn submit_with_empty_ontology_is_unprocessable() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    register(&http, addr, "math-1").await;

    let resp = submit(&http, addr).await;
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "no_applicable_knowledge");
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    let id = uuid::Uuid::new_v4();

    for path in [
        format!("/api/agents/{id}"),
        format!("/api/tasks/{id}"),
        format!("/api/directives/{id}"),
    ] {
        let resp = http.get(format!("http://{addr}{path}")).send().await.unwrap();
        assert_eq!(resp.status(), 404, "{path}");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "not_found");
    }

    let ws = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/agents/{id}")).await;
    assert!(ws.is_err(), "upgrade for an unknown agent must be refused");
}

#[tokio::test]
async fn duplicate_agent_name_conflicts() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    register(&http, addr, "math-1").await;

    let resp = http
        .post(format!("http://{addr}/api/agents"))
        .json(&json!({ "name": "math-1", "agent_type": "math" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn referenced_value_cannot_be_deleted() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    seed_fairness(&http, addr).await;

    let directive: Value = http
        .post(format!("http://{addr}/api/directives"))
        .json(&json!({ "task_description": "solve 2x+3=7 in math", "task_type": "math" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let value_id = directive["source_values"][0].as_str().unwrap().to_string();

    let resp = http
        .delete(format!("http://{addr}/api/ontology/values/{value_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let summary: Value = http
        .get(format!("http://{addr}/api/ontology/summary"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["total_values"], 1);
}

#[tokio::test]
async fn agent_lane_carries_assignment_and_reports() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    seed_fairness(&http, addr).await;
    let agent = register(&http, addr, "math-1").await;

    let mut client = AgentClient::connect(&format!("ws://{addr}/ws/agents/{}", agent.id))
        .await
        .unwrap();
    match next_frame(&mut client).await {
        ServerMessage::Welcome { agent_id, .. } => assert_eq!(agent_id, agent.id),
        other => panic!("expected welcome, got {other:?}"),
    }

    let resp = submit(&http, addr).await;
    assert_eq!(resp.status(), 201);
    let task: Task = resp.json().await.unwrap();
    assert_eq!(task.agent_id, agent.id);

    let assignment = match next_frame(&mut client).await {
        ServerMessage::Assignment(a) => a,
        other => panic!("expected assignment, got {other:?}"),
    };
    assert_eq!(assignment.task_id, task.id);
    assert_eq!(assignment.directive.id, task.directive_id);

    client
        .report(TaskReport {
            task_id: task.id,
            status: TaskStatus::InProgress,
            output_data: None,
            error_message: None,
        })
        .await
        .unwrap();
    client
        .report(TaskReport {
            task_id: task.id,
            status: TaskStatus::Completed,
            output_data: Some(json!({ "result": "x=2" })),
            error_message: None,
        })
        .await
        .unwrap();

    let done = timeout(TIMEOUT, async {
        loop {
            let task: Task = http
                .get(format!("http://{addr}/api/tasks/{}", task.id))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    let output = done.output_data.unwrap();
    assert_eq!(output.data["result"], "x=2");
    assert!(!output.compliance.requires_human_review);

    client.close().await.unwrap();
}

#[tokio::test]
async fn malformed_agent_frame_gets_error_and_socket_stays_open() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    let agent = register(&http, addr, "math-1").await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/agents/{}", agent.id))
        .await
        .unwrap();

    let mut frames = Vec::new();
    ws.send(Message::Text("not json at all".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"heartbeat"}"#.into())).await.unwrap();
    while frames.len() < 3 {
        match timeout(TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["type"] != "heartbeat" {
                    frames.push(frame["type"].as_str().unwrap_or_default().to_string());
                }
            }
            Some(Ok(_)) => {}
            other => panic!("socket ended early: {other:?}"),
        }
    }
    assert_eq!(frames, ["welcome", "error", "heartbeat_ack"]);
}

#[tokio::test]
async fn observers_see_task_status_events() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    seed_fairness(&http, addr).await;
    register(&http, addr, "math-1").await;

    let (mut observer, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/observers"))
        .await
        .unwrap();
    // Give the server a moment to subscribe before the event fires.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task: Task = submit(&http, addr).await.json().await.unwrap();

    let seen = timeout(TIMEOUT, async {
        loop {
            let Some(Ok(Message::Text(text))) = observer.next().await else {
                continue;
            };
            let event: Event = serde_json::from_str(text.as_str()).unwrap();
            if let EventPayload::TaskStatus { task_id, status, .. } = event.payload {
                return (task_id, status);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, (task.id, TaskStatus::Pending));
}

#[tokio::test]
async fn metrics_expose_tasks_agents_and_ontology() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    seed_fairness(&http, addr).await;
    let agent = register(&http, addr, "math-1").await;
    assert_eq!(submit(&http, addr).await.status(), 201);
    let beat = http
        .post(format!("http://{addr}/api/agents/{}/heartbeat", agent.id))
        .send()
        .await
        .unwrap();
    assert_eq!(beat.status(), 200);

    // Task counters follow the observers topic, so poll until they land.
    let text = timeout(TIMEOUT, async {
        loop {
            let resp = http.get(format!("http://{addr}/metrics")).send().await.unwrap();
            assert_eq!(resp.status(), 200);
            let text = resp.text().await.unwrap();
            if text.contains(r#"mothership_tasks_total{status="pending"} 1"#) {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task transition never counted");

    assert!(text.contains(r#"mothership_agents{status="active"} 1"#), "{text}");
    assert!(text.contains(r#"mothership_ontology_size{kind="value"} 1"#), "{text}");
    assert!(text.contains("mothership_agent_heartbeats_total 1"), "{text}");
    assert!(
        text.contains(
            r#"mothership_requests_total{method="POST",path="/api/tasks/submit",status="201"} 1"#
        ),
        "{text}"
    );
}

#[tokio::test]
async fn deregistering_an_agent_closes_its_lane() {
    let addr = start_server().await;
    let http = reqwest::Client::new();
    let agent = register(&http, addr, "math-1").await;

    let mut client = AgentClient::connect(&format!("ws://{addr}/ws/agents/{}", agent.id))
        .await
        .unwrap();
    assert!(matches!(next_frame(&mut client).await, ServerMessage::Welcome { .. }));

    let resp = http
        .delete(format!("http://{addr}/api/agents/{}", agent.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let closed = timeout(TIMEOUT, async {
        loop {
            match client.next().await {
                None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "lane stayed open after deregistration");
}
