use axum::{
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::str::FromStr;
use tower_http::trace::TraceLayer;
use tracing::debug;

use common::api::{
    CancelTaskResponse, CreateTaskResponse, ListNodesResponse, ListTasksRequest,
    ListTasksResponse, ServiceInfo, UpdateNodeResponse, WriteEventResponse,
};
use common::{Event, Node, State as TaskState, Task, View};

use crate::auth::require_auth;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::store::NodeRegistry;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // TES
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/service-info", get(service_info))
        .route("/v1/tasks/:id", get(get_task).post(task_action))
        // internos: eventos de workers y registro de nodos
        .route("/v1/service-info", get(service_info))
        .route("/v1/events", post(write_event))
        .route("/v1/nodes", get(list_nodes))
        .route(
            "/v1/nodes/:id",
            get(get_node).put(update_node).delete(delete_node),
        )
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn create_task(
    State(state): State<AppState>,
    Json(task): Json<Task>,
) -> ApiResult<Json<CreateTaskResponse>> {
    state.create_task(task).await.map(Json)
}

#[derive(Debug, Default, Deserialize)]
struct ViewParams {
    view: Option<String>,
}

fn parse_view(v: Option<&str>) -> ApiResult<View> {
    match v {
        None | Some("") => Ok(View::Minimal),
        Some(s) => View::from_str(s).map_err(|_| ApiError::bad_request(format!("unknown view: {s}"))),
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ViewParams>,
) -> ApiResult<Json<Task>> {
    let view = parse_view(params.view.as_deref())?;
    state.get_task(&id, view).await.map(Json)
}

// POST /v1/tasks/{id}:cancel (el ":cancel" llega dentro del segmento)
async fn task_action(
    State(state): State<AppState>,
    Path(segment): Path<String>,
) -> ApiResult<Json<CancelTaskResponse>> {
    let Some(id) = segment.strip_suffix(":cancel") else {
        return Err(ApiError::not_found(format!("unknown action on {segment}")));
    };
    state.cancel_task(id).await.map(Json)
}

/// Query de ListTasks; tag_key/tag_value se repiten y se emparejan por posición.
fn parse_list_query(pairs: &[(String, String)]) -> ApiResult<ListTasksRequest> {
    let mut req = ListTasksRequest::default();
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut view = None;

    for (k, v) in pairs {
        match k.as_str() {
            "page_size" | "pageSize" => {
                req.page_size = v
                    .parse()
                    .map_err(|_| ApiError::bad_request(format!("invalid page_size: {v}")))?;
            }
            "page_token" | "pageToken" => req.page_token = v.clone(),
            "view" => view = Some(v.as_str()),
            "state" => {
                let s = TaskState::from_str(v)
                    .map_err(|_| ApiError::bad_request(format!("invalid state: {v}")))?;
                req.state = Some(s);
            }
            "tag_key" | "tagKey" | "tag_key[]" => keys.push(v.clone()),
            "tag_value" | "tagValue" | "tag_value[]" => values.push(v.clone()),
            other => debug!("parámetro de ListTasks ignorado: {other}"),
        }
    }
    req.view = parse_view(view)?;
    if values.len() > keys.len() {
        return Err(ApiError::bad_request("tag_value without tag_key"));
    }
    for (i, k) in keys.into_iter().enumerate() {
        req.tags.insert(k, values.get(i).cloned().unwrap_or_default());
    }
    Ok(req)
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ListTasksResponse>> {
    let req = parse_list_query(&pairs)?;
    state.list_tasks(&req).await.map(Json)
}

async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(state.service_info())
}

async fn write_event(
    State(state): State<AppState>,
    Json(ev): Json<Event>,
) -> ApiResult<Json<WriteEventResponse>> {
    state.writer.write_event(&ev).await?;
    Ok(Json(WriteEventResponse {}))
}

async fn list_nodes(State(state): State<AppState>) -> Json<ListNodesResponse> {
    Json(ListNodesResponse {
        nodes: state.store.list_nodes().await,
    })
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.store.get_node(&id).await?))
}

async fn update_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut node): Json<Node>,
) -> ApiResult<Json<UpdateNodeResponse>> {
    if node.id.is_empty() {
        node.id = id.clone();
    }
    if node.id != id {
        return Err(ApiError::bad_request(format!(
            "node id {} does not match path {id}",
            node.id
        )));
    }
    state.store.update_node(node).await?;
    Ok(Json(UpdateNodeResponse {}))
}

async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<UpdateNodeResponse>> {
    state.store.delete_node(&id).await?;
    Ok(Json(UpdateNodeResponse {}))
}
