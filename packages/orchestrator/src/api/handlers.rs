// ABOUTME: HTTP request handlers for sandbox lifecycle, templates, health and the proxy surface
// ABOUTME: Thin adapters from axum extractors to SandboxService and ProxyRouter calls

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::types::{
    CreateSandboxRequest, DeleteSandboxResponse, SandboxListResponse, SandboxResponse,
    SandboxStatus, UpdateSandboxRequest,
};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tracing::info;

pub const OWNER_HEADER: &str = "x-owner-ref";
pub const DEFAULT_OWNER: &str = "anonymous";

/// Caller identity taken from the `X-Owner-Ref` header
#[derive(Debug, Clone)]
pub struct OwnerRef(pub String);

impl<S> FromRequestParts<S> for OwnerRef
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_OWNER);
        Ok(OwnerRef(owner.to_string()))
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let service = &state.service;
    Json(json!({
        "status": "healthy",
        "service": "mockbox",
        "version": env!("CARGO_PKG_VERSION"),
        "launcher": service.launcher().kind().as_str(),
        "sandboxes": service.registry().len().await,
        "free_ports": service.ports().free_count(),
    }))
}

pub async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "templates": state.service.renderer().catalog() }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner_ref: Option<String>,
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<SandboxListResponse> {
    let base = &state.service.settings().public_base_url;
    let sandboxes = state
        .service
        .list(query.owner_ref.as_deref())
        .await
        .iter()
        .map(|sandbox| SandboxResponse::from_sandbox(sandbox, base))
        .collect();
    Json(SandboxListResponse { sandboxes })
}

pub async fn create_sandbox(
    State(state): State<AppState>,
    OwnerRef(owner): OwnerRef,
    payload: Result<Json<CreateSandboxRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SandboxResponse>)> {
    let Json(request) = payload?;
    info!("Creating sandbox for owner: {}", owner);

    let sandbox = state.service.create(&owner, request).await?;
    let response = SandboxResponse::from_sandbox(&sandbox, &state.service.settings().public_base_url);
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<SandboxResponse>> {
    let sandbox = state.service.get(&sandbox_id).await?;
    Ok(Json(SandboxResponse::from_sandbox(
        &sandbox,
        &state.service.settings().public_base_url,
    )))
}

pub async fn update_sandbox(
    State(state): State<AppState>,
    OwnerRef(owner): OwnerRef,
    Path(sandbox_id): Path<String>,
    payload: Result<Json<UpdateSandboxRequest>, JsonRejection>,
) -> ApiResult<Json<SandboxResponse>> {
    let Json(request) = payload?;
    info!("Updating sandbox {} for owner: {}", sandbox_id, owner);

    let sandbox = state.service.update(&owner, &sandbox_id, request).await?;
    Ok(Json(SandboxResponse::from_sandbox(
        &sandbox,
        &state.service.settings().public_base_url,
    )))
}

pub async fn delete_sandbox(
    State(state): State<AppState>,
    OwnerRef(owner): OwnerRef,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<DeleteSandboxResponse>> {
    info!("Deleting sandbox {} for owner: {}", sandbox_id, owner);
    state.service.delete(&owner, &sandbox_id).await?;
    Ok(Json(DeleteSandboxResponse {
        status: SandboxStatus::Deleted,
    }))
}

pub async fn refresh_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<SandboxResponse>> {
    let sandbox = state.service.touch(&sandbox_id).await?;
    Ok(Json(SandboxResponse::from_sandbox(
        &sandbox,
        &state.service.settings().public_base_url,
    )))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn sandbox_events(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = state.service.events(&sandbox_id, query.limit).await?;
    Ok(Json(json!({ "sandbox_id": sandbox_id, "events": events })))
}

pub async fn proxy_service_root(
    State(state): State<AppState>,
    Path((sandbox_id, service)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    state.proxy.forward(&sandbox_id, &service, "", req).await
}

pub async fn proxy_service_path(
    State(state): State<AppState>,
    Path((sandbox_id, service, path)): Path<(String, String, String)>,
    req: Request<Body>,
) -> Response {
    state.proxy.forward(&sandbox_id, &service, &path, req).await
}
