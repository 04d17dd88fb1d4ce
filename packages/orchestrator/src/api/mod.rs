//! HTTP surface of the orchestrator: sandbox management under `/sandboxes`
//! and the mock traffic proxy under `/sandbox/{id}/{service}`.

use crate::proxy::ProxyRouter;
use crate::service::SandboxService;
use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod handlers;

pub use error::{ApiError, ApiResult};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub service: SandboxService,
    pub proxy: Arc<ProxyRouter>,
}

impl AppState {
    pub fn new(service: SandboxService) -> Self {
        let proxy = Arc::new(ProxyRouter::new(service.clone()));
        Self { service, proxy }
    }
}

/// Creates the management and proxy routes. CORS is layered on by the binary.
pub fn create_router(state: AppState) -> Router {
    let sandbox_routes = Router::new()
        .route(
            "/",
            get(handlers::list_sandboxes).post(handlers::create_sandbox),
        )
        .route(
            "/{sandbox_id}",
            get(handlers::get_sandbox)
                .patch(handlers::update_sandbox)
                .delete(handlers::delete_sandbox),
        )
        .route("/{sandbox_id}/refresh", post(handlers::refresh_sandbox))
        .route("/{sandbox_id}/events", get(handlers::sandbox_events));

    let proxy_routes = Router::new()
        .route(
            "/{sandbox_id}/{service}",
            any(handlers::proxy_service_root),
        )
        .route(
            "/{sandbox_id}/{service}/",
            any(handlers::proxy_service_root),
        )
        .route(
            "/{sandbox_id}/{service}/{*path}",
            any(handlers::proxy_service_path),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .route("/templates", get(handlers::list_templates))
        .nest("/sandboxes", sandbox_routes)
        .nest("/sandbox", proxy_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
