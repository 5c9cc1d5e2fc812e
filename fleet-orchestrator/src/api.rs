use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use fleet_common::{Actor, Visibility};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{ApiFailure, Rejection};
use crate::orchestrator::{CreateRequest, Orchestrator};

pub const USER_ID_HEADER: &str = "x-fleet-user-id";
pub const USER_NAME_HEADER: &str = "x-fleet-user-name";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .route("/instances", get(list_instances))
        .route("/instances/{id}", get(get_instance))
        .route("/snapshots", get(list_snapshots))
        .route("/events", get(events_stream))
        .route("/internal/instances", post(create_instance))
        .route("/internal/instances/{id}", axum::routing::delete(destroy_instance))
        .route("/internal/instances/{id}/start", post(start_instance))
        .route("/internal/instances/{id}/stop", post(stop_instance))
        .route("/internal/instances/{id}/snapshots", post(snapshot_instance))
        .route("/internal/instances/{id}/protection", put(set_protection))
        .with_state(AppState { orchestrator })
}

async fn root() -> &'static str {
    "Fleet Orchestrator Online"
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}

fn provider_error(e: ApiFailure) -> Response {
    let status = if e.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_GATEWAY
    };
    (
        status,
        Json(json!({"error": "provider_error", "message": e.to_string()})),
    )
        .into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "bad_request", "message": message.into()})),
    )
        .into_response()
}

/// Caller identity from request headers. Admin rights are looked up, never
/// taken from the request.
fn actor_from(headers: &HeaderMap, orchestrator: &Orchestrator) -> Result<Actor, Response> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let Some(user_id) = header(USER_ID_HEADER) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized", "message": format!("missing {}", USER_ID_HEADER)})),
        )
            .into_response());
    };
    let user_name = header(USER_NAME_HEADER).unwrap_or(user_id);
    Ok(orchestrator.actor(user_id, user_name))
}

fn accepted(operation: &str, instance_id: Option<&str>) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "operation": operation,
            "instance_id": instance_id,
        })),
    )
        .into_response()
}

async fn list_instances(State(state): State<AppState>) -> Response {
    match state.orchestrator.list_instances().await {
        Ok(items) => Json(items).into_response(),
        Err(e) => provider_error(e),
    }
}

async fn get_instance(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get_instance(&id).await {
        Ok(Some(inst)) => Json(inst).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "instance_id": id})),
        )
            .into_response(),
        Err(e) => provider_error(e),
    }
}

async fn list_snapshots(State(state): State<AppState>) -> Response {
    match state.orchestrator.list_snapshots().await {
        Ok(items) => Json(items).into_response(),
        Err(e) => provider_error(e),
    }
}

#[derive(Deserialize)]
pub struct EventsStreamParams {
    // Optional: only events about this instance or snapshot
    resource_id: Option<String>,
}

async fn events_stream(
    State(state): State<AppState>,
    Query(params): Query<EventsStreamParams>,
) -> impl IntoResponse {
    let mut events = state.orchestrator.events().subscribe();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);

    tokio::spawn(async move {
        let hello = Event::default().event("hello").data(r#"{"ok":true}"#);
        if tx.send(Ok(hello)).await.is_err() {
            return;
        }
        loop {
            let evt = match events.recv().await {
                Ok(evt) => evt,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("[events] subscriber lagged, {} event(s) dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            if params
                .resource_id
                .as_deref()
                .is_some_and(|id| id != evt.resource_id)
            {
                continue;
            }
            let sse = match Event::default().event(evt.kind.as_str()).json_data(&evt) {
                Ok(sse) => sse,
                Err(e) => {
                    tracing::warn!("[events] failed to encode event: {}", e);
                    continue;
                }
            };
            if tx.send(Ok(sse)).await.is_err() {
                return;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    )
}

async fn create_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRequest>,
) -> Response {
    let actor = match actor_from(&headers, &state.orchestrator) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    for (field, value) in [
        ("snapshot_id", &req.snapshot_id),
        ("label", &req.label),
        ("region", &req.region),
    ] {
        if value.trim().is_empty() {
            return bad_request(format!("{} is required", field));
        }
    }

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.create(&actor, req).await;
    });
    accepted("create", None)
}

async fn start_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let actor = match actor_from(&headers, &state.orchestrator) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let orchestrator = state.orchestrator.clone();
    let instance_id = id.clone();
    tokio::spawn(async move {
        orchestrator.start(&actor, &instance_id).await;
    });
    accepted("start", Some(&id))
}

async fn stop_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let actor = match actor_from(&headers, &state.orchestrator) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let orchestrator = state.orchestrator.clone();
    let instance_id = id.clone();
    tokio::spawn(async move {
        orchestrator.stop(&actor, &instance_id).await;
    });
    accepted("stop", Some(&id))
}

async fn destroy_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let actor = match actor_from(&headers, &state.orchestrator) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let orchestrator = state.orchestrator.clone();
    let instance_id = id.clone();
    tokio::spawn(async move {
        orchestrator.destroy(&actor, &instance_id).await;
    });
    accepted("destroy", Some(&id))
}

#[derive(Deserialize)]
pub struct SnapshotBody {
    pub description: String,
    #[serde(default)]
    pub visibility: Option<String>,
}

async fn snapshot_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SnapshotBody>,
) -> Response {
    let actor = match actor_from(&headers, &state.orchestrator) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let visibility = match body.visibility.as_deref().map(str::parse::<Visibility>) {
        None => Visibility::default(),
        Some(Ok(v)) => v,
        Some(Err(e)) => return bad_request(e),
    };
    let orchestrator = state.orchestrator.clone();
    let instance_id = id.clone();
    tokio::spawn(async move {
        orchestrator
            .snapshot(&actor, &instance_id, &body.description, visibility)
            .await;
    });
    accepted("snapshot", Some(&id))
}

#[derive(Deserialize)]
pub struct ProtectionBody {
    pub protected: bool,
}

async fn set_protection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ProtectionBody>,
) -> Response {
    let actor = match actor_from(&headers, &state.orchestrator) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match state
        .orchestrator
        .set_protected(&actor, &id, body.protected)
        .await
    {
        Ok(inst) => Json(inst.summary()).into_response(),
        Err(e @ Rejection::Forbidden { .. }) => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "forbidden", "message": e.to_string()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "message": e.to_string()})),
        )
            .into_response(),
    }
}
