// ABOUTME: Sandbox orchestration facade coordinating templates, ports, launcher and registry
// ABOUTME: Create, update, delete, expire and recover flows with port-leak-free error paths

use crate::error::{
    LaunchError, PortError, SandboxError, SandboxResult, ServiceFailure, TemplateError,
};
use crate::events::{EventLog, SandboxEvent};
use crate::launcher::ServiceLauncher;
use crate::policy::{PolicyCheck, PolicyDecision};
use crate::ports::{holder_label, PortAllocator};
use crate::registry::SandboxRegistry;
use crate::settings::OrchestratorSettings;
use crate::storage::SandboxStore;
use crate::templates::{RenderedArtifact, TemplateRenderer};
use crate::types::{
    CreateSandboxRequest, Operation, Sandbox, SandboxStatus, ServiceInstance, ServiceStatus,
    UpdateSandboxRequest,
};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

/// A failed start is retried once on a fresh port
const LAUNCH_ATTEMPTS: usize = 2;

/// Outcome of stopping every service of a sandbox
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub sandbox_id: String,
    pub services_stopped: usize,
    pub ports_released: Vec<u16>,
    /// Stop calls that errored; their ports were released anyway
    pub stop_failures: Vec<ServiceFailure>,
}

impl TeardownReport {
    pub fn is_partial_failure(&self) -> bool {
        !self.stop_failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub restored: usize,
    pub services_adopted: usize,
    pub dropped: usize,
}

/// Result of a health pass over one sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Degraded { failed: usize },
    /// Nothing was left running and the sandbox was torn down
    Orphaned,
    Missing,
}

enum FailureCause {
    Render(TemplateError),
    Exhausted(PortError),
    Launch(LaunchError),
}

struct StartFailure {
    instance: ServiceInstance,
    cause: FailureCause,
}

impl StartFailure {
    fn new(name: &str, config: Value, cause: FailureCause) -> Self {
        let reason = match &cause {
            FailureCause::Render(e) => e.to_string(),
            FailureCause::Exhausted(e) => e.to_string(),
            FailureCause::Launch(e) => e.to_string(),
        };
        Self {
            instance: ServiceInstance::failed(name, config, reason),
            cause,
        }
    }

    fn failure(&self) -> ServiceFailure {
        ServiceFailure {
            service: self.instance.service_name.clone(),
            reason: self.instance.error.clone().unwrap_or_default(),
        }
    }
}

/// Removes a sandbox id from the in-flight set when its create finishes, however it finishes
struct InflightGuard {
    inflight: Arc<Mutex<HashMap<String, String>>>,
    sandbox_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.sandbox_id);
    }
}

/// The only entry point the API layer and the reaper use to change sandboxes
#[derive(Clone)]
pub struct SandboxService {
    settings: Arc<OrchestratorSettings>,
    registry: Arc<SandboxRegistry>,
    ports: Arc<PortAllocator>,
    renderer: Arc<TemplateRenderer>,
    launcher: Arc<dyn ServiceLauncher>,
    policy: Arc<dyn PolicyCheck>,
    events: Arc<EventLog>,
    /// Sandbox id -> owner for creates that have not been published yet
    inflight: Arc<Mutex<HashMap<String, String>>>,
    /// Held while counting an owner's sandboxes and while publishing a new one
    quota_gate: Arc<AsyncMutex<()>>,
}

impl SandboxService {
    pub fn new(
        settings: OrchestratorSettings,
        store: Arc<dyn SandboxStore>,
        launcher: Arc<dyn ServiceLauncher>,
        policy: Arc<dyn PolicyCheck>,
    ) -> Self {
        let ports = PortAllocator::new(settings.port_range_start, settings.port_range_end);
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(SandboxRegistry::new(store)),
            ports: Arc::new(ports),
            renderer: Arc::new(TemplateRenderer::new()),
            launcher,
            policy,
            events: Arc::new(EventLog::new()),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            quota_gate: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn with_port_allocator(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    pub fn launcher(&self) -> &Arc<dyn ServiceLauncher> {
        &self.launcher
    }

    pub fn is_inflight(&self, sandbox_id: &str) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(sandbox_id)
    }

    async fn authorize(
        &self,
        owner_ref: &str,
        operation: Operation,
        sandbox_id: Option<&str>,
    ) -> SandboxResult<()> {
        match self.policy.authorize(owner_ref, operation, sandbox_id).await {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny(reason) => {
                warn!(
                    owner_ref = %owner_ref,
                    operation = operation.as_str(),
                    "Policy denied sandbox operation: {}",
                    reason
                );
                Err(SandboxError::Forbidden(reason))
            }
        }
    }

    fn ensure_owner(sandbox: &Sandbox, owner_ref: &str) -> SandboxResult<()> {
        if sandbox.owner_ref == owner_ref {
            Ok(())
        } else {
            Err(SandboxError::Forbidden(format!(
                "sandbox {} belongs to another owner",
                sandbox.id
            )))
        }
    }

    /// Create a sandbox running every requested service that could be started.
    ///
    /// The work runs on its own task: if the caller goes away mid-flight, services that
    /// did start are torn down instead of being left behind without a registry entry.
    pub async fn create(
        &self,
        owner_ref: &str,
        request: CreateSandboxRequest,
    ) -> SandboxResult<Sandbox> {
        self.authorize(owner_ref, Operation::Create, None).await?;

        let ttl_minutes = self
            .settings
            .effective_ttl_minutes(request.ttl_minutes)
            .ok_or_else(|| SandboxError::Validation("ttl_minutes must not be negative".into()))?;
        let services = self.validate_create(&request)?;

        let sandbox = Sandbox::new(owner_ref, ttl_minutes);
        let guard = self.reserve_inflight(&sandbox).await?;

        info!(
            sandbox_id = %sandbox.id,
            owner_ref = %owner_ref,
            "Creating sandbox with services: {:?}",
            request.required_services
        );

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let sandbox_id = sandbox.id.clone();
            let result = this.build_sandbox(sandbox, services).await;

            match result {
                Ok(sandbox) if tx.is_closed() => {
                    warn!(
                        sandbox_id = %sandbox_id,
                        "Create was abandoned by its caller, tearing down started services"
                    );
                    let report = this.stop_services(&sandbox).await;
                    this.events.drop_sandbox(&sandbox_id).await;
                    drop(guard);
                    debug!("Abandoned create cleanup: {:?}", report);
                }
                Ok(sandbox) => {
                    {
                        let _gate = this.quota_gate.lock().await;
                        this.registry.insert(sandbox.clone()).await;
                        drop(guard);
                    }
                    info!(
                        sandbox_id = %sandbox_id,
                        status = %sandbox.status,
                        "Sandbox ready with {}/{} services running",
                        sandbox.running_count(),
                        sandbox.services.len()
                    );
                    let _ = tx.send(Ok(sandbox));
                }
                Err(e) => {
                    this.events.drop_sandbox(&sandbox_id).await;
                    drop(guard);
                    let _ = tx.send(Err(e));
                }
            }
        });

        rx.await
            .map_err(|_| SandboxError::Internal("sandbox creation task aborted".into()))?
    }

    fn validate_create(
        &self,
        request: &CreateSandboxRequest,
    ) -> SandboxResult<Vec<(String, Value)>> {
        if request.required_services.is_empty() {
            return Err(SandboxError::Validation(
                "required_services must not be empty".into(),
            ));
        }

        let mut seen = HashSet::new();
        for name in &request.required_services {
            if !self.renderer.is_known(name) {
                return Err(SandboxError::UnknownService(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(SandboxError::InvalidConfig {
                    service: name.clone(),
                    reason: "service requested more than once".into(),
                });
            }
        }

        for name in request.custom_configs.keys() {
            if !seen.contains(name.as_str()) {
                return Err(SandboxError::InvalidConfig {
                    service: name.clone(),
                    reason: "config supplied for a service that was not requested".into(),
                });
            }
        }

        Ok(request
            .required_services
            .iter()
            .map(|name| {
                let config = request
                    .custom_configs
                    .get(name)
                    .cloned()
                    .unwrap_or_else(empty_config);
                (name.clone(), config)
            })
            .collect())
    }

    async fn reserve_inflight(&self, sandbox: &Sandbox) -> SandboxResult<InflightGuard> {
        let _gate = self.quota_gate.lock().await;
        let registered = self.registry.count_for_owner(&sandbox.owner_ref).await;
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(limit) = self.settings.max_sandboxes_per_owner {
            let pending = inflight
                .values()
                .filter(|owner| **owner == sandbox.owner_ref)
                .count();
            if pending + registered >= limit {
                return Err(SandboxError::QuotaExceeded {
                    owner_ref: sandbox.owner_ref.clone(),
                    limit,
                });
            }
        }

        inflight.insert(sandbox.id.clone(), sandbox.owner_ref.clone());
        Ok(InflightGuard {
            inflight: self.inflight.clone(),
            sandbox_id: sandbox.id.clone(),
        })
    }

    async fn build_sandbox(
        &self,
        mut sandbox: Sandbox,
        services: Vec<(String, Value)>,
    ) -> SandboxResult<Sandbox> {
        let starts = services
            .into_iter()
            .map(|(name, config)| {
                let sandbox_id = sandbox.id.clone();
                async move { self.start_service(&sandbox_id, &name, config).await }
            })
            .collect::<Vec<_>>();
        let results = join_all(starts).await;

        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(instance) => {
                    sandbox
                        .services
                        .insert(instance.service_name.clone(), instance);
                }
                Err(failure) => {
                    sandbox
                        .services
                        .insert(failure.instance.service_name.clone(), failure.instance.clone());
                    failures.push(failure);
                }
            }
        }

        match sandbox.derived_status() {
            Some(status) => {
                sandbox.status = status;
                if status == SandboxStatus::Degraded {
                    warn!(
                        sandbox_id = %sandbox.id,
                        "Sandbox degraded: {} of {} services failed",
                        failures.len(),
                        sandbox.services.len()
                    );
                }
                self.events
                    .info(
                        &sandbox.id,
                        None,
                        format!("Sandbox created ({})", sandbox.status),
                    )
                    .await;
                Ok(sandbox)
            }
            None => {
                error!(
                    sandbox_id = %sandbox.id,
                    "No requested service could be started"
                );
                Err(total_failure(failures))
            }
        }
    }

    /// Render, allocate and launch one service. Every failure path leaves no port held.
    async fn start_service(
        &self,
        sandbox_id: &str,
        name: &str,
        config: Value,
    ) -> Result<ServiceInstance, StartFailure> {
        let artifact = match self.renderer.render(name, &config) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, service = %name, "Failed to render template: {}", e);
                self.events
                    .warn(sandbox_id, Some(name), format!("Render failed: {}", e))
                    .await;
                return Err(StartFailure::new(name, config, FailureCause::Render(e)));
            }
        };
        self.launch_artifact(sandbox_id, name, config, &artifact).await
    }

    async fn launch_artifact(
        &self,
        sandbox_id: &str,
        name: &str,
        config: Value,
        artifact: &RenderedArtifact,
    ) -> Result<ServiceInstance, StartFailure> {
        let holder = holder_label(sandbox_id, name);
        let mut failed_port: Option<u16> = None;
        let mut last_error: Option<LaunchError> = None;

        for attempt in 1..=LAUNCH_ATTEMPTS {
            // The failed port is returned only after a fresh one is taken
            let allocated = self.ports.allocate(&holder);
            if let Some(port) = failed_port.take() {
                self.ports.release(port);
            }
            let port = match allocated {
                Ok(port) => port,
                Err(e) => {
                    warn!(sandbox_id = %sandbox_id, service = %name, "Failed to allocate port: {}", e);
                    self.events
                        .warn(sandbox_id, Some(name), e.to_string())
                        .await;
                    let cause = match last_error {
                        Some(launch) => FailureCause::Launch(launch),
                        None => FailureCause::Exhausted(e),
                    };
                    return Err(StartFailure::new(name, config, cause));
                }
            };

            match self.launcher.start(artifact, port).await {
                Ok(handle) => {
                    debug!(
                        sandbox_id = %sandbox_id,
                        service = %name,
                        "Service started on port {} (attempt {})",
                        port,
                        attempt
                    );
                    self.events
                        .info(sandbox_id, Some(name), format!("Started on port {}", port))
                        .await;
                    return Ok(ServiceInstance {
                        service_name: name.to_string(),
                        port: Some(port),
                        status: ServiceStatus::Running,
                        endpoints: artifact.endpoint_paths(),
                        custom_config: config,
                        handle: Some(handle),
                        error: None,
                        started_at: Some(Utc::now()),
                    });
                }
                Err(e) => {
                    warn!(
                        sandbox_id = %sandbox_id,
                        service = %name,
                        "Failed to start service on port {} (attempt {}/{}): {}",
                        port,
                        attempt,
                        LAUNCH_ATTEMPTS,
                        e
                    );
                    self.events
                        .warn(
                            sandbox_id,
                            Some(name),
                            format!("Start attempt {} failed: {}", attempt, e),
                        )
                        .await;
                    failed_port = Some(port);
                    last_error = Some(e);
                }
            }
        }

        if let Some(port) = failed_port {
            self.ports.release(port);
        }
        let cause = match last_error {
            Some(e) => FailureCause::Launch(e),
            None => FailureCause::Launch(LaunchError::Io("no launch attempt made".into())),
        };
        Err(StartFailure::new(name, config, cause))
    }

    pub async fn get(&self, sandbox_id: &str) -> SandboxResult<Sandbox> {
        match self.registry.get(sandbox_id).await {
            Some(sandbox) if sandbox.status != SandboxStatus::Deleted => Ok(sandbox),
            _ => Err(SandboxError::NotFound(sandbox_id.to_string())),
        }
    }

    pub async fn list(&self, owner_ref: Option<&str>) -> Vec<Sandbox> {
        self.registry.list(owner_ref).await
    }

    pub async fn events(
        &self,
        sandbox_id: &str,
        limit: Option<usize>,
    ) -> SandboxResult<Vec<SandboxEvent>> {
        if !self.registry.contains(sandbox_id).await {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        Ok(self.events.recent(sandbox_id, limit).await)
    }

    /// Push out the expiry of a live sandbox. A lapsed TTL cannot be revived.
    pub async fn touch(&self, sandbox_id: &str) -> SandboxResult<Sandbox> {
        let now = Utc::now();
        let sandbox = self
            .registry
            .touch(sandbox_id, now)
            .await
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
        if sandbox.status == SandboxStatus::Expired || sandbox.is_expired(now) {
            return Err(SandboxError::Expired(sandbox_id.to_string()));
        }
        Ok(sandbox)
    }

    /// Add services and re-render changed ones.
    ///
    /// A config change restarts that one service from scratch; its port may change.
    pub async fn update(
        &self,
        owner_ref: &str,
        sandbox_id: &str,
        request: UpdateSandboxRequest,
    ) -> SandboxResult<Sandbox> {
        self.authorize(owner_ref, Operation::Update, Some(sandbox_id))
            .await?;

        let _guard = self
            .registry
            .lock(sandbox_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
        let current = self.get(sandbox_id).await?;
        Self::ensure_owner(&current, owner_ref)?;

        if current.status == SandboxStatus::Expired || current.is_expired(Utc::now()) {
            return Err(SandboxError::Expired(sandbox_id.to_string()));
        }

        let add_services = request.add_services.unwrap_or_default();
        let mut update_configs = request.update_configs.unwrap_or_default();

        let mut adding = HashSet::new();
        for name in &add_services {
            if !self.renderer.is_known(name) {
                return Err(SandboxError::UnknownService(name.clone()));
            }
            if current.services.contains_key(name) || !adding.insert(name.as_str()) {
                return Err(SandboxError::InvalidConfig {
                    service: name.clone(),
                    reason: "service already present in sandbox".into(),
                });
            }
        }
        for name in update_configs.keys() {
            if !current.services.contains_key(name) && !adding.contains(name.as_str()) {
                return Err(SandboxError::InvalidConfig {
                    service: name.clone(),
                    reason: "service not present in sandbox".into(),
                });
            }
        }

        // Re-rendered configs are checked before anything live is touched
        let mut rerenders = Vec::new();
        for (name, instance) in &current.services {
            if let Some(config) = update_configs.remove(name) {
                let artifact = self.renderer.render(name, &config)?;
                rerenders.push((name.clone(), instance.clone(), config, artifact));
            }
        }

        let additions: Vec<(String, Value)> = add_services
            .into_iter()
            .map(|name| {
                let config = update_configs.remove(&name).unwrap_or_else(empty_config);
                (name, config)
            })
            .collect();

        let mut replaced: BTreeMap<String, ServiceInstance> = BTreeMap::new();

        for (name, old, config, artifact) in rerenders {
            self.retire_instance(sandbox_id, &name, &old).await;
            self.events
                .info(sandbox_id, Some(&name), "Config updated, restarting")
                .await;
            let instance = match self
                .launch_artifact(sandbox_id, &name, config, &artifact)
                .await
            {
                Ok(instance) => instance,
                Err(failure) => failure.instance,
            };
            replaced.insert(name, instance);
        }

        let starts = additions
            .into_iter()
            .map(|(name, config)| async move {
                match self.start_service(sandbox_id, &name, config).await {
                    Ok(instance) => instance,
                    Err(failure) => failure.instance,
                }
            })
            .collect::<Vec<_>>();
        for instance in join_all(starts).await {
            replaced.insert(instance.service_name.clone(), instance);
        }

        let updated = self
            .registry
            .update(sandbox_id, |sandbox| {
                sandbox.services.extend(replaced);
                if let Some(next) = sandbox.derived_status() {
                    if sandbox.status.can_transition_to(next) {
                        sandbox.status = next;
                    }
                }
                sandbox.refresh_expiry(Utc::now());
            })
            .await
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;

        if updated.running_count() == 0 {
            let failures = updated
                .services
                .values()
                .map(|s| ServiceFailure {
                    service: s.service_name.clone(),
                    reason: s.error.clone().unwrap_or_else(|| "not running".into()),
                })
                .collect();
            warn!(
                sandbox_id = %sandbox_id,
                "Update left no service running, deleting sandbox"
            );
            self.teardown_locked(sandbox_id).await;
            return Err(SandboxError::AllServicesFailed(failures));
        }

        info!(
            sandbox_id = %sandbox_id,
            status = %updated.status,
            "Sandbox updated"
        );
        Ok(updated)
    }

    /// Take one instance out of routing, then stop it and give its port back.
    async fn retire_instance(&self, sandbox_id: &str, name: &str, old: &ServiceInstance) {
        self.registry
            .update(sandbox_id, |sandbox| {
                if let Some(instance) = sandbox.services.get_mut(name) {
                    instance.status = ServiceStatus::Stopped;
                    instance.port = None;
                    instance.handle = None;
                }
            })
            .await;

        if let Some(handle) = &old.handle {
            if let Err(e) = self.launcher.stop(handle).await {
                warn!(
                    sandbox_id = %sandbox_id,
                    service = %name,
                    "Failed to stop service: {}",
                    e
                );
            }
        }
        if let Some(port) = old.port {
            self.ports.release(port);
        }
    }

    /// Delete a sandbox. Deleting something already gone succeeds without side effects.
    pub async fn delete(&self, owner_ref: &str, sandbox_id: &str) -> SandboxResult<()> {
        self.authorize(owner_ref, Operation::Delete, Some(sandbox_id))
            .await?;

        if let Some(existing) = self.registry.get(sandbox_id).await {
            Self::ensure_owner(&existing, owner_ref)?;
        }

        let Some(_guard) = self.registry.lock(sandbox_id).await else {
            debug!(sandbox_id = %sandbox_id, "Delete of absent sandbox is a no-op");
            return Ok(());
        };
        self.teardown_locked(sandbox_id).await;
        Ok(())
    }

    /// Expire and tear down a sandbox whose TTL has passed.
    ///
    /// Returns `None` when the sandbox vanished or was refreshed in the meantime.
    pub async fn expire(&self, sandbox_id: &str) -> Option<TeardownReport> {
        let _guard = self.registry.lock(sandbox_id).await?;
        let sandbox = self.registry.get(sandbox_id).await?;
        if !sandbox.is_expired(Utc::now()) {
            return None;
        }

        self.registry
            .transition(sandbox_id, SandboxStatus::Expired)
            .await;
        info!(
            sandbox_id = %sandbox_id,
            "Sandbox expired at {}",
            sandbox.expires_at
        );
        self.teardown_locked(sandbox_id).await
    }

    /// Probe every running service; mark dead ones failed and reap sandboxes left empty.
    pub async fn check_health(&self, sandbox_id: &str) -> HealthOutcome {
        let Some(snapshot) = self.registry.get(sandbox_id).await else {
            return HealthOutcome::Missing;
        };
        if !snapshot.status.is_routable() {
            return HealthOutcome::Healthy;
        }

        let probes = snapshot
            .services
            .values()
            .filter(|s| s.is_running())
            .filter_map(|s| s.handle.clone().map(|h| (s.service_name.clone(), h)))
            .map(|(name, handle)| async move {
                let healthy = self.launcher.health(&handle).await;
                (name, healthy)
            })
            .collect::<Vec<_>>();
        let dead: Vec<String> = join_all(probes)
            .await
            .into_iter()
            .filter(|(_, healthy)| !healthy)
            .map(|(name, _)| name)
            .collect();

        if dead.is_empty() {
            return HealthOutcome::Healthy;
        }

        let Some(_guard) = self.registry.lock(sandbox_id).await else {
            return HealthOutcome::Missing;
        };
        let Some(current) = self.registry.get(sandbox_id).await else {
            return HealthOutcome::Missing;
        };

        for name in &dead {
            // Skip instances restarted since the probe
            let Some(old) = current.services.get(name) else {
                continue;
            };
            let same_handle = old.handle.as_ref().map(|h| h.id)
                == snapshot.services.get(name).and_then(|s| s.handle.as_ref().map(|h| h.id));
            if !same_handle {
                continue;
            }
            warn!(
                sandbox_id = %sandbox_id,
                service = %name,
                "Service stopped answering health checks"
            );
            self.retire_instance(sandbox_id, name, old).await;
            self.registry
                .update(sandbox_id, |sandbox| {
                    if let Some(instance) = sandbox.services.get_mut(name) {
                        instance.status = ServiceStatus::Failed;
                        instance.error = Some("health check failed".into());
                    }
                })
                .await;
            self.events
                .warn(sandbox_id, Some(name), "Health check failed")
                .await;
        }

        let Some(after) = self.registry.get(sandbox_id).await else {
            return HealthOutcome::Missing;
        };
        match after.derived_status() {
            None => {
                self.teardown_locked(sandbox_id).await;
                HealthOutcome::Orphaned
            }
            Some(next) => {
                self.registry.transition(sandbox_id, next).await;
                HealthOutcome::Degraded { failed: dead.len() }
            }
        }
    }

    /// Stop services, release ports and drop the record. Caller holds the sandbox lock.
    async fn teardown_locked(&self, sandbox_id: &str) -> Option<TeardownReport> {
        // Unroutable before anything is stopped
        self.registry
            .transition(sandbox_id, SandboxStatus::Deleted)
            .await;
        let sandbox = self.registry.get(sandbox_id).await?;

        let report = self.stop_services(&sandbox).await;
        self.registry.remove(sandbox_id).await;
        self.events.drop_sandbox(sandbox_id).await;

        if report.is_partial_failure() {
            warn!(
                sandbox_id = %sandbox_id,
                "Teardown partially failed: {:?}",
                report.stop_failures
            );
        } else {
            info!(
                sandbox_id = %sandbox_id,
                "Sandbox torn down, released {} ports",
                report.ports_released.len()
            );
        }
        Some(report)
    }

    /// Best-effort stop of every service; every held port is released regardless.
    async fn stop_services(&self, sandbox: &Sandbox) -> TeardownReport {
        let stops = sandbox
            .services
            .values()
            .filter_map(|s| s.handle.clone().map(|h| (s.service_name.clone(), h)))
            .map(|(name, handle)| async move {
                let result = self.launcher.stop(&handle).await;
                (name, result)
            })
            .collect::<Vec<_>>();

        let mut report = TeardownReport {
            sandbox_id: sandbox.id.clone(),
            ..Default::default()
        };
        for (name, result) in join_all(stops).await {
            match result {
                Ok(()) => report.services_stopped += 1,
                Err(e) => report.stop_failures.push(ServiceFailure {
                    service: name,
                    reason: e.to_string(),
                }),
            }
        }

        for port in sandbox.held_ports() {
            self.ports.release(port);
            report.ports_released.push(port);
        }
        report
    }

    /// Release leases whose sandbox is neither published nor still being created.
    pub async fn reclaim_orphan_ports(&self) -> Vec<u16> {
        let mut reclaimed = Vec::new();
        for lease in self.ports.leases() {
            let sandbox_id = lease.sandbox_id();
            // In-flight first: a create publishes to the registry before leaving the set
            if self.is_inflight(sandbox_id) {
                continue;
            }
            if !self.registry.contains(sandbox_id).await {
                warn!(
                    "Reclaiming orphaned port {} held by {}",
                    lease.port, lease.held_by
                );
                self.ports.release(lease.port);
                reclaimed.push(lease.port);
            }
        }
        reclaimed
    }

    /// Restore persisted sandboxes after a restart, adopting services that still run.
    pub async fn recover(&self) -> SandboxResult<RecoveryReport> {
        let store = self.registry.store().clone();
        let persisted = store.load_all().await?;
        let mut report = RecoveryReport::default();

        for mut sandbox in persisted {
            if !sandbox.status.is_routable() {
                if let Err(e) = store.remove(&sandbox.id).await {
                    warn!("Failed to drop sandbox {} from store: {}", sandbox.id, e);
                }
                report.dropped += 1;
                continue;
            }

            for instance in sandbox.services.values_mut() {
                let Some(handle) = instance.handle.clone() else {
                    continue;
                };
                let holder = holder_label(&sandbox.id, &instance.service_name);
                let adopted = self.launcher.adopt(&handle).await;
                if adopted && self.ports.reserve(handle.port, &holder) {
                    instance.port = Some(handle.port);
                    report.services_adopted += 1;
                    continue;
                }
                if adopted {
                    if let Err(e) = self.launcher.stop(&handle).await {
                        warn!(
                            "Failed to stop adopted {} whose port {} is taken: {}",
                            holder, handle.port, e
                        );
                    }
                }
                instance.status = ServiceStatus::Failed;
                instance.port = None;
                instance.handle = None;
                instance.error = Some("not recovered after restart".into());
            }

            match sandbox.derived_status() {
                Some(status) => {
                    sandbox.status = status;
                    self.events
                        .info(&sandbox.id, None, "Sandbox recovered after restart")
                        .await;
                    self.registry.insert(sandbox).await;
                    report.restored += 1;
                }
                None => {
                    debug!("Dropping unrecoverable sandbox {}", sandbox.id);
                    if let Err(e) = store.remove(&sandbox.id).await {
                        warn!("Failed to drop sandbox {} from store: {}", sandbox.id, e);
                    }
                    report.dropped += 1;
                }
            }
        }

        info!(
            "Recovered {} sandboxes ({} services adopted, {} dropped)",
            report.restored, report.services_adopted, report.dropped
        );
        Ok(report)
    }

    /// Tear down everything, used on shutdown by in-process deployments
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<String> = self
            .registry
            .list(None)
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut stopped = 0;
        for id in ids {
            if let Some(_guard) = self.registry.lock(&id).await {
                if self.teardown_locked(&id).await.is_some() {
                    stopped += 1;
                }
            }
        }
        stopped
    }
}

fn empty_config() -> Value {
    Value::Object(Map::new())
}

/// Error for a create where nothing started.
///
/// Pure caller mistakes surface as such; pure exhaustion stays retryable.
fn total_failure(failures: Vec<StartFailure>) -> SandboxError {
    let all_render = failures
        .iter()
        .all(|f| matches!(f.cause, FailureCause::Render(_)));
    if all_render {
        if let Some(FailureCause::Render(e)) = failures.first().map(|f| &f.cause) {
            return e.clone().into();
        }
    }

    if !failures.is_empty()
        && failures
            .iter()
            .all(|f| matches!(f.cause, FailureCause::Exhausted(_)))
    {
        let message = failures
            .first()
            .map(|f| f.failure().reason)
            .unwrap_or_default();
        return SandboxError::ResourceExhausted(message);
    }

    SandboxError::AllServicesFailed(failures.iter().map(StartFailure::failure).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_failure(name: &str) -> StartFailure {
        StartFailure::new(
            name,
            empty_config(),
            FailureCause::Render(TemplateError::invalid_config(name, "bad")),
        )
    }

    fn exhausted_failure(name: &str) -> StartFailure {
        StartFailure::new(
            name,
            empty_config(),
            FailureCause::Exhausted(PortError::Exhausted {
                start: 1,
                end: 1,
            }),
        )
    }

    #[test]
    fn test_total_failure_precedence() {
        let render_only = total_failure(vec![render_failure("slack")]);
        assert!(matches!(render_only, SandboxError::InvalidConfig { .. }));

        let exhausted = total_failure(vec![exhausted_failure("a"), exhausted_failure("b")]);
        assert!(exhausted.is_retryable());

        let mixed = total_failure(vec![render_failure("slack"), exhausted_failure("figma")]);
        match mixed {
            SandboxError::AllServicesFailed(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
