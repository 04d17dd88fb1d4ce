// ABOUTME: Error taxonomy for the sandbox orchestrator
// ABOUTME: Component errors (ports, templates, launch, storage) and the facade-level SandboxError

use serde::Serialize;
use thiserror::Error;

/// Port pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("No free ports left in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
    #[error("{probed} candidate ports in range {start}-{end} are in use by other processes")]
    Busy { start: u16, end: u16, probed: usize },
}

/// Distinguishes caller mistakes in template rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateErrorKind {
    UnknownService,
    InvalidConfig,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TemplateError {
    pub kind: TemplateErrorKind,
    pub service: String,
    pub message: String,
}

impl TemplateError {
    pub fn unknown_service(service: &str) -> Self {
        Self {
            kind: TemplateErrorKind::UnknownService,
            service: service.to_string(),
            message: format!("Unknown service type: {}", service),
        }
    }

    pub fn invalid_config(service: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: TemplateErrorKind::InvalidConfig,
            service: service.to_string(),
            message: format!("Invalid config for {}: {}", service, reason.into()),
        }
    }
}

/// Errors raised while starting or stopping a mock service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Failed to bind port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Failed to spawn mock process '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Service on port {port} was not ready after {timeout_ms}ms")]
    ReadinessTimeout { port: u16, timeout_ms: u64 },

    #[error("Failed to stop service on port {port}: {reason}")]
    Stop { port: u16, reason: String },

    #[error("Launcher I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LaunchError {
    fn from(e: std::io::Error) -> Self {
        LaunchError::Io(e.to_string())
    }
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("Unknown launcher backend: {0}")]
    UnknownLauncher(String),
}

/// Failures while assembling an orchestrator from settings
#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to prepare launcher: {0}")]
    Launcher(#[from] LaunchError),
}

/// Per-service failure reported when a create could not start anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceFailure {
    pub service: String,
    pub reason: String,
}

/// Errors surfaced by the orchestration facade
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unknown service type: {0}")]
    UnknownService(String),

    #[error("Invalid config for {service}: {reason}")]
    InvalidConfig { service: String, reason: String },

    #[error("Service {service} failed to start: {reason}")]
    Launch { service: String, reason: String },

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox expired: {0}")]
    Expired(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Owner {owner_ref} reached the limit of {limit} sandboxes")]
    QuotaExceeded { owner_ref: String, limit: usize },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No requested service could be started")]
    AllServicesFailed(Vec<ServiceFailure>),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Whether a caller may retry the same request after backing off
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::ResourceExhausted(_))
    }
}

impl From<TemplateError> for SandboxError {
    fn from(e: TemplateError) -> Self {
        match e.kind {
            TemplateErrorKind::UnknownService => SandboxError::UnknownService(e.service),
            TemplateErrorKind::InvalidConfig => SandboxError::InvalidConfig {
                service: e.service,
                reason: e.message,
            },
        }
    }
}

impl From<PortError> for SandboxError {
    fn from(e: PortError) -> Self {
        SandboxError::ResourceExhausted(e.to_string())
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
