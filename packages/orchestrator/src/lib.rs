//! Mockbox Orchestrator - on-demand sandboxes of mock third-party services
//!
//! This crate renders mock service templates, launches them on ports from a
//! managed pool, tracks every sandbox in a registry, proxies traffic to the
//! right port and reaps sandboxes whose time-to-live has passed.

pub mod api;
pub mod error;
pub mod events;
pub mod launcher;
pub mod policy;
pub mod ports;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod settings;
pub mod storage;
pub mod templates;
pub mod types;

// Re-export key types and functions for easier use
pub use api::{create_router, AppState};
pub use error::{
    InitError, LaunchError, PortError, SandboxError, SandboxResult, ServiceFailure, StoreError,
    TemplateError,
};
pub use launcher::{mock_router, InProcessLauncher, ProcessLauncher, ServiceLauncher};
pub use policy::{AllowAllPolicy, OwnerAllowlistPolicy, PolicyCheck, PolicyDecision};
pub use ports::PortAllocator;
pub use proxy::ProxyRouter;
pub use reaper::{ReapReport, TtlReaper};
pub use registry::SandboxRegistry;
pub use service::{HealthOutcome, RecoveryReport, SandboxService, TeardownReport};
pub use settings::OrchestratorSettings;
pub use storage::{MemoryStore, SandboxStore, SqliteStore};
pub use templates::{RenderedArtifact, TemplateRenderer};
pub use types::{
    CreateSandboxRequest, LauncherKind, Sandbox, SandboxResponse, SandboxStatus, ServiceStatus,
    UpdateSandboxRequest,
};

use std::sync::Arc;
use tracing::info;

/// Assemble a [`SandboxService`] from settings.
///
/// Picks the registry store (SQLite when `database_path` is set, memory otherwise),
/// the launcher backend and the owner policy. Nothing is recovered here; call
/// [`SandboxService::recover`] once the caller is ready to adopt old services.
pub async fn init(settings: OrchestratorSettings) -> Result<SandboxService, InitError> {
    settings.validate()?;

    let store: Arc<dyn SandboxStore> = match &settings.database_path {
        Some(path) => {
            info!("Using SQLite sandbox store at {:?}", path);
            Arc::new(SqliteStore::open(path).await?)
        }
        None => {
            info!("Using in-memory sandbox store");
            Arc::new(MemoryStore::new())
        }
    };

    let launcher: Arc<dyn ServiceLauncher> = match settings.launcher {
        LauncherKind::InProcess => Arc::new(InProcessLauncher::new(
            settings.readiness_timeout,
            settings.stop_grace_period,
        )),
        LauncherKind::Process => {
            let launcher = match &settings.mock_binary {
                Some(program) => ProcessLauncher::new(
                    program.clone(),
                    &settings.state_dir,
                    settings.readiness_timeout,
                    settings.stop_grace_period,
                ),
                None => ProcessLauncher::current_exe(
                    &settings.state_dir,
                    settings.readiness_timeout,
                    settings.stop_grace_period,
                )?,
            };
            Arc::new(launcher)
        }
    };

    let policy: Arc<dyn PolicyCheck> = if settings.allowed_owners.is_empty() {
        Arc::new(AllowAllPolicy)
    } else {
        Arc::new(OwnerAllowlistPolicy::new(settings.allowed_owners.clone()))
    };

    info!(
        "Orchestrator ready: ports {}-{}, launcher {}",
        settings.port_range_start,
        settings.port_range_end,
        settings.launcher.as_str()
    );
    Ok(SandboxService::new(settings, store, launcher, policy))
}
