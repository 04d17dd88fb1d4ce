use crate::templates::{RenderedArtifact, HEALTH_PATH};
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Router answering every rendered endpoint with its fixed response.
///
/// Matching is exact on method and path; the query string is ignored.
pub fn mock_router(artifact: RenderedArtifact) -> Router {
    let state = Arc::new(artifact);

    Router::new()
        .route(HEALTH_PATH, get(health))
        .fallback(serve_endpoint)
        .with_state(state)
}

async fn health(State(artifact): State<Arc<RenderedArtifact>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": artifact.service_name,
        "endpoints": artifact.endpoints.len(),
    }))
}

async fn serve_endpoint(
    State(artifact): State<Arc<RenderedArtifact>>,
    method: Method,
    uri: Uri,
) -> Response {
    let path = normalize_path(uri.path());
    let lookup_method = if method == Method::HEAD {
        Method::GET
    } else {
        method.clone()
    };

    let Some(endpoint) = artifact.find(lookup_method.as_str(), path) else {
        debug!("Mock {} has no endpoint for {} {}", artifact.service_name, method, path);
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "not_found",
                "message": format!("No mock endpoint for {} {}", method, path),
            })),
        )
            .into_response();
    };

    let status = StatusCode::from_u16(endpoint.status).unwrap_or(StatusCode::OK);
    let mut headers = HeaderMap::new();
    for (name, value) in &endpoint.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return (status, headers).into_response();
    }

    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    (status, headers, endpoint.body.to_string()).into_response()
}

fn normalize_path(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}
