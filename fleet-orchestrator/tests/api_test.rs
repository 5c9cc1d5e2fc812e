// Integration tests for the admin HTTP API
// IMPORTANT: All provisioning goes through the Mock provider only

mod common;

use axum_test::TestServer;
use common::{harness, ADMIN_ID, HOST_ID};
use fleet_common::bus::{LifecycleEventKind, OutcomeKind};
use fleet_common::PowerStatus;
use fleet_orchestrator::api::{create_router, USER_ID_HEADER, USER_NAME_HEADER};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_root_and_status() {
    let h = harness();
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    let response = server.get("/").await;
    assert_eq!(response.status_code(), 200);

    h.seed("a", None, PowerStatus::Running, false);
    let response = server.get("/admin/status").await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["provider"], "mock");
    assert_eq!(body["instances_active"], 1);
    assert_eq!(body["self_guard"]["probed_id"], HOST_ID);
}

#[tokio::test]
async fn test_list_instances() {
    let h = harness();
    h.mock.insert_instance("a", json!({}));
    h.mock.insert_instance(HOST_ID, json!({}));
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    let response = server.get("/instances").await;

    assert_eq!(response.status_code(), 200);
    let body: Vec<serde_json::Value> = response.json();
    assert_eq!(body.len(), 1);
    assert_eq!(body[0]["id"], "a");
    assert_eq!(body[0]["power_status"], "running");
}

#[tokio::test]
async fn test_get_instance_not_found() {
    let h = harness();
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    assert_eq!(server.get("/instances/missing").await.status_code(), 404);

    h.mock.insert_instance(HOST_ID, json!({}));
    assert_eq!(
        server.get(&format!("/instances/{}", HOST_ID)).await.status_code(),
        404
    );
}

#[tokio::test]
async fn test_list_snapshots() {
    let h = harness();
    h.mock.insert_snapshot("s-1", json!({ "description": "golden" }));
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    let response = server.get("/snapshots").await;

    assert_eq!(response.status_code(), 200);
    let body: Vec<serde_json::Value> = response.json();
    assert_eq!(body[0]["id"], "s-1");
    assert_eq!(body[0]["status"], "complete");
}

#[tokio::test]
async fn test_commands_require_user_header() {
    let h = harness();
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    let response = server.post("/internal/instances/a/start").await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn test_create_validates_input() {
    let h = harness();
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    let response = server
        .post("/internal/instances")
        .add_header(USER_ID_HEADER, "u-alice")
        .json(&json!({ "snapshot_id": "", "label": "web", "region": "dfw" }))
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(h.mock.calls().len(), 0);
}

#[tokio::test]
async fn test_create_is_accepted_and_reported_by_event() {
    let h = harness();
    h.mock.insert_snapshot("snap-1", json!({}));
    let mut rx = h.orchestrator.events().subscribe();
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    let response = server
        .post("/internal/instances")
        .add_header(USER_ID_HEADER, "u-alice")
        .add_header(USER_NAME_HEADER, "alice")
        .json(&json!({ "snapshot_id": "snap-1", "label": "web", "region": "dfw" }))
        .await;
    assert_eq!(response.status_code(), 202);

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let evt = rx.recv().await.unwrap();
            if let LifecycleEventKind::OperationFinished { outcome, .. } = evt.kind {
                return (evt.resource_id, outcome);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(finished.1, OutcomeKind::Succeeded);

    let inst = h.orchestrator.registry().get(&finished.0).unwrap();
    assert_eq!(inst.creator.unwrap().user_name, "alice");
}

#[tokio::test]
async fn test_snapshot_rejects_unknown_visibility() {
    let h = harness();
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    let response = server
        .post("/internal/instances/a/snapshots")
        .add_header(USER_ID_HEADER, "u-alice")
        .json(&json!({ "description": "backup", "visibility": "shared" }))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_protection_is_admin_only() {
    let h = harness();
    h.seed("p", None, PowerStatus::Running, false);
    let server = TestServer::new(create_router(h.orchestrator.clone())).unwrap();

    let response = server
        .put("/internal/instances/p/protection")
        .add_header(USER_ID_HEADER, "u-alice")
        .json(&json!({ "protected": true }))
        .await;
    assert_eq!(response.status_code(), 403);

    let response = server
        .put("/internal/instances/p/protection")
        .add_header(USER_ID_HEADER, ADMIN_ID)
        .json(&json!({ "protected": true }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["protected"], true);

    let response = server
        .put("/internal/instances/nope/protection")
        .add_header(USER_ID_HEADER, ADMIN_ID)
        .json(&json!({ "protected": true }))
        .await;
    assert_eq!(response.status_code(), 404);
}
