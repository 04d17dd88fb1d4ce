// ABOUTME: Reverse proxy mapping /sandbox/{id}/{service}/{path} to the live mock port
// ABOUTME: Fresh registry lookup per request and distinct responses for missing, gone and down targets

use crate::service::SandboxService;
use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, HeaderName, Request, Response, StatusCode},
};
use chrono::Utc;
use http_body_util::LengthLimitError;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Request body size limit: 10MB
pub const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Why a request was answered by the proxy itself instead of a mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyError {
    SandboxNotFound,
    ServiceNotFound,
    SandboxGone,
    ServiceUnavailable,
    UpstreamUnreachable,
    PayloadTooLarge,
    UnreadableBody,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::SandboxNotFound | ProxyError::ServiceNotFound => StatusCode::NOT_FOUND,
            ProxyError::SandboxGone => StatusCode::GONE,
            ProxyError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::UnreadableBody => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::SandboxNotFound => "SANDBOX_NOT_FOUND",
            ProxyError::ServiceNotFound => "SERVICE_NOT_FOUND",
            ProxyError::SandboxGone => "SANDBOX_GONE",
            ProxyError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ProxyError::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyError::UnreadableBody => "UNREADABLE_BODY",
        }
    }

    fn message(&self, sandbox_id: &str, service: &str) -> String {
        match self {
            ProxyError::SandboxNotFound => format!("Sandbox {} does not exist", sandbox_id),
            ProxyError::ServiceNotFound => {
                format!("Sandbox {} has no service named {}", sandbox_id, service)
            }
            ProxyError::SandboxGone => format!("Sandbox {} was deleted or expired", sandbox_id),
            ProxyError::ServiceUnavailable => {
                format!("Service {} in sandbox {} is not running", service, sandbox_id)
            }
            ProxyError::UpstreamUnreachable => {
                format!("Service {} in sandbox {} did not respond", service, sandbox_id)
            }
            ProxyError::PayloadTooLarge => {
                format!("Request body too large (max {} bytes)", MAX_REQUEST_SIZE)
            }
            ProxyError::UnreadableBody => "Request body could not be read".to_string(),
        }
    }

    pub fn into_response(self, sandbox_id: &str, service: &str) -> Response<Body> {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.message(sandbox_id, service),
            }
        });
        Response::builder()
            .status(self.status())
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

pub struct ProxyRouter {
    service: SandboxService,
    client: reqwest::Client,
}

impl ProxyRouter {
    pub fn new(service: SandboxService) -> Self {
        let timeout = service.settings().proxy_timeout;
        Self {
            service,
            client: build_client(timeout),
        }
    }

    /// Resolve the live port for `(sandbox_id, service_name)`. Never cached.
    pub async fn resolve(&self, sandbox_id: &str, service_name: &str) -> Result<u16, ProxyError> {
        let registry = self.service.registry();
        let Some(sandbox) = registry.get(sandbox_id).await else {
            return Err(if registry.is_tombstoned(sandbox_id) {
                ProxyError::SandboxGone
            } else {
                ProxyError::SandboxNotFound
            });
        };

        if !sandbox.status.is_routable() || sandbox.is_expired(Utc::now()) {
            return Err(ProxyError::SandboxGone);
        }

        let instance = sandbox
            .services
            .get(service_name)
            .ok_or(ProxyError::ServiceNotFound)?;
        match instance.port {
            Some(port) if instance.is_running() => Ok(port),
            _ => Err(ProxyError::ServiceUnavailable),
        }
    }

    /// Forward `req` to the service, relaying the upstream response unchanged.
    ///
    /// The upstream path is cut from the raw request path so percent-encoded
    /// bytes reach the mock as sent. `sub_path` is only used when the raw path
    /// does not contain the sandbox and service segments verbatim.
    pub async fn forward(
        &self,
        sandbox_id: &str,
        service_name: &str,
        sub_path: &str,
        req: Request<Body>,
    ) -> Response<Body> {
        let port = match self.resolve(sandbox_id, service_name).await {
            Ok(port) => port,
            Err(e) => {
                debug!(
                    sandbox_id = %sandbox_id,
                    service = %service_name,
                    "Proxy target unavailable: {}",
                    e.code()
                );
                return e.into_response(sandbox_id, service_name);
            }
        };

        let (parts, body) = req.into_parts();
        let body_bytes = match to_bytes(body, MAX_REQUEST_SIZE).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let rejection = if exceeds_length_limit(&e) {
                    ProxyError::PayloadTooLarge
                } else {
                    ProxyError::UnreadableBody
                };
                warn!("Failed to read proxied request body: {}", e);
                return rejection.into_response(sandbox_id, service_name);
            }
        };

        let path = raw_sub_path(parts.uri.path(), sandbox_id, service_name).unwrap_or(sub_path);
        let target_url = target_url(port, path, parts.uri.query());
        debug!(
            sandbox_id = %sandbox_id,
            service = %service_name,
            "Proxying {} {}",
            parts.method,
            target_url
        );

        let mut upstream = self
            .client
            .request(parts.method.clone(), &target_url)
            .body(body_bytes);
        for (key, value) in parts.headers.iter() {
            if forwardable_request_header(key) {
                upstream = upstream.header(key, value);
            }
        }

        let response = match upstream.send().await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    sandbox_id = %sandbox_id,
                    service = %service_name,
                    "Failed to proxy request to port {}: {}",
                    port,
                    e
                );
                return ProxyError::UpstreamUnreachable.into_response(sandbox_id, service_name);
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to read upstream response body: {}", e);
                return ProxyError::UpstreamUnreachable.into_response(sandbox_id, service_name);
            }
        };

        if self.service.settings().refresh_ttl_on_access {
            let _ = self.service.touch(sandbox_id).await;
        }

        let mut builder = Response::builder().status(status);
        if let Some(out) = builder.headers_mut() {
            copy_response_headers(&headers, out);
        }
        builder.body(Body::from(body_bytes)).unwrap_or_else(|e| {
            error!("Failed to build proxied response: {}", e);
            ProxyError::UpstreamUnreachable.into_response(sandbox_id, service_name)
        })
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn target_url(port: u16, sub_path: &str, query: Option<&str>) -> String {
    let path = sub_path.trim_start_matches('/');
    match query {
        Some(q) if !q.is_empty() => format!("http://127.0.0.1:{}/{}?{}", port, path, q),
        _ => format!("http://127.0.0.1:{}/{}", port, path),
    }
}

/// Everything after the `{sandbox_id}/{service}` segments of a still-encoded path.
///
/// Works with or without the `/sandbox` prefix, since nested routers see the
/// path with their mount point removed.
fn raw_sub_path<'a>(path: &'a str, sandbox_id: &str, service: &str) -> Option<&'a str> {
    let slashes: Vec<usize> = path.match_indices('/').map(|(i, _)| i).collect();
    let segments: Vec<(usize, usize)> = slashes
        .iter()
        .enumerate()
        .map(|(k, &slash)| (slash + 1, slashes.get(k + 1).copied().unwrap_or(path.len())))
        .collect();

    segments.windows(2).find_map(|pair| {
        let ((id_start, id_end), (svc_start, svc_end)) = (pair[0], pair[1]);
        (&path[id_start..id_end] == sandbox_id && &path[svc_start..svc_end] == service)
            .then(|| &path[svc_end..])
    })
}

fn exceeds_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn forwardable_request_header(name: &HeaderName) -> bool {
    !is_hop_by_hop(name) && !matches!(name.as_str(), "host" | "content-length")
}

fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (key, value) in from.iter() {
        // Body is fully buffered, so the upstream length header is recomputed
        if is_hop_by_hop(key) || key.as_str() == "content-length" {
            continue;
        }
        to.append(key.clone(), value.clone());
    }
}
