// ABOUTME: Shared fixtures for orchestrator integration tests
// ABOUTME: A scripted launcher that never binds sockets plus service builders over small port pools

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use mockbox_orchestrator::{
    AllowAllPolicy, LaunchError, LauncherKind, MemoryStore, OrchestratorSettings, PolicyCheck,
    PortAllocator, RenderedArtifact, SandboxService, SandboxStore, ServiceLauncher,
};
use mockbox_orchestrator::types::ServiceHandle;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const POOL_START: u16 = 46000;

/// Launcher whose outcomes are decided by the test instead of real sockets
#[derive(Default)]
pub struct ScriptedLauncher {
    /// Services whose start always fails
    failing: Mutex<HashSet<String>>,
    /// Services whose first start fails and later starts succeed
    flaky: Mutex<HashSet<String>>,
    /// Live handles keyed by handle id, with the artifact they serve
    running: Mutex<HashMap<Uuid, RenderedArtifact>>,
    /// Handles that report unhealthy
    unhealthy: Mutex<HashSet<Uuid>>,
    /// Handles a restarted orchestrator may adopt
    adoptable: Mutex<HashSet<Uuid>>,
    start_delay: Mutex<Option<Duration>>,
    /// Stops still take effect but report an error
    stop_errors: Mutex<bool>,
    pub starts: Mutex<Vec<(String, u16)>>,
    pub stops: Mutex<Vec<Uuid>>,
}

impl ScriptedLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_service(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_once(&self, name: &str) {
        self.flaky.lock().unwrap().insert(name.to_string());
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_stops(&self) {
        *self.stop_errors.lock().unwrap() = true;
    }

    pub fn mark_unhealthy(&self, handle: &ServiceHandle) {
        self.unhealthy.lock().unwrap().insert(handle.id);
    }

    pub fn allow_adopt(&self, handle: &ServiceHandle) {
        self.adoptable.lock().unwrap().insert(handle.id);
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn artifact_for(&self, handle: &ServiceHandle) -> Option<RenderedArtifact> {
        self.running.lock().unwrap().get(&handle.id).cloned()
    }

    pub fn start_ports(&self, name: &str) -> Vec<u16> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(service, _)| service == name)
            .map(|(_, port)| *port)
            .collect()
    }
}

#[async_trait]
impl ServiceLauncher for ScriptedLauncher {
    async fn start(
        &self,
        artifact: &RenderedArtifact,
        port: u16,
    ) -> Result<ServiceHandle, LaunchError> {
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.starts
            .lock()
            .unwrap()
            .push((artifact.service_name.clone(), port));

        if self.failing.lock().unwrap().contains(&artifact.service_name) {
            return Err(LaunchError::Spawn {
                command: artifact.service_name.clone(),
                reason: "refused to start".into(),
            });
        }
        if self.flaky.lock().unwrap().remove(&artifact.service_name) {
            return Err(LaunchError::Bind {
                port,
                reason: "address in use".into(),
            });
        }

        let handle = ServiceHandle {
            id: Uuid::new_v4(),
            port,
            kind: LauncherKind::InProcess,
            pid: None,
            started_at: Utc::now(),
        };
        self.running
            .lock()
            .unwrap()
            .insert(handle.id, artifact.clone());
        Ok(handle)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), LaunchError> {
        self.running.lock().unwrap().remove(&handle.id);
        self.stops.lock().unwrap().push(handle.id);
        if *self.stop_errors.lock().unwrap() {
            return Err(LaunchError::Stop {
                port: handle.port,
                reason: "signal refused".into(),
            });
        }
        Ok(())
    }

    async fn health(&self, handle: &ServiceHandle) -> bool {
        self.running.lock().unwrap().contains_key(&handle.id)
            && !self.unhealthy.lock().unwrap().contains(&handle.id)
    }

    async fn adopt(&self, handle: &ServiceHandle) -> bool {
        self.adoptable.lock().unwrap().contains(&handle.id)
    }

    fn kind(&self) -> LauncherKind {
        LauncherKind::InProcess
    }
}

pub fn settings(pool_size: u16) -> OrchestratorSettings {
    OrchestratorSettings {
        port_range_start: POOL_START,
        port_range_end: POOL_START + pool_size - 1,
        public_base_url: "http://mockbox.test".to_string(),
        ..OrchestratorSettings::default()
    }
}

pub fn service_with(
    settings: OrchestratorSettings,
    store: Arc<dyn SandboxStore>,
    launcher: Arc<ScriptedLauncher>,
    policy: Arc<dyn PolicyCheck>,
) -> SandboxService {
    let ports = Arc::new(
        PortAllocator::new(settings.port_range_start, settings.port_range_end)
            .without_bind_probe(),
    );
    SandboxService::new(settings, store, launcher, policy).with_port_allocator(ports)
}

/// Orchestrator over a scripted launcher and an in-memory store
pub fn scripted_service(pool_size: u16) -> (SandboxService, Arc<ScriptedLauncher>) {
    let launcher = ScriptedLauncher::new();
    let service = service_with(
        settings(pool_size),
        Arc::new(MemoryStore::new()),
        launcher.clone(),
        Arc::new(AllowAllPolicy),
    );
    (service, launcher)
}
