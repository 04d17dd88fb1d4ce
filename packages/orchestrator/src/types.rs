use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Lifecycle state of a sandbox.
///
/// ```text
/// creating -> running | degraded
/// running | degraded -> expired      (reaper only)
/// expired -> deleted                 (teardown finished)
/// any -> deleted                     (explicit delete)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Running,
    Degraded,
    Expired,
    Deleted,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Degraded => "degraded",
            SandboxStatus::Expired => "expired",
            SandboxStatus::Deleted => "deleted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "running" => Some(Self::Running),
            "degraded" => Some(Self::Degraded),
            "expired" => Some(Self::Expired),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Creating, Running) | (Creating, Degraded) => true,
            (Running, Degraded) | (Degraded, Running) => true,
            (Running, Expired) | (Degraded, Expired) => true,
            _ => false,
        }
    }

    /// Whether requests may be proxied into a sandbox in this state.
    pub fn is_routable(&self) -> bool {
        matches!(self, SandboxStatus::Running | SandboxStatus::Degraded)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single mock service inside a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Running,
    Failed,
    Stopped,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Stopped => "stopped",
        }
    }
}

/// Which launcher backend owns a running service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    InProcess,
    Process,
}

impl LauncherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LauncherKind::InProcess => "in_process",
            LauncherKind::Process => "process",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "in_process" | "in-process" | "inprocess" => Some(Self::InProcess),
            "process" | "subprocess" => Some(Self::Process),
            _ => None,
        }
    }
}

/// Opaque reference to a started mock service, returned by a launcher.
///
/// Handles are plain data so they can be persisted and offered back to the
/// launcher for adoption after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub id: Uuid,
    pub port: u16,
    pub kind: LauncherKind,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// One rendered mock bound to one allocated port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    /// Held exclusively while the instance is running; `None` once released.
    pub port: Option<u16>,
    pub status: ServiceStatus,
    pub endpoints: Vec<String>,
    pub custom_config: Value,
    pub handle: Option<ServiceHandle>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    pub fn failed(service_name: &str, custom_config: Value, error: String) -> Self {
        Self {
            service_name: service_name.to_string(),
            port: None,
            status: ServiceStatus::Failed,
            endpoints: Vec::new(),
            custom_config,
            handle: None,
            error: Some(error),
            started_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running && self.port.is_some()
    }
}

/// A named collection of mock services sharing one lifecycle and expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub owner_ref: String,
    pub status: SandboxStatus,
    pub services: BTreeMap<String, ServiceInstance>,
    pub ttl_minutes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn new(owner_ref: &str, ttl_minutes: u64) -> Self {
        let now = Utc::now();
        Self {
            id: generate_sandbox_id(),
            owner_ref: owner_ref.to_string(),
            status: SandboxStatus::Creating,
            services: BTreeMap::new(),
            ttl_minutes,
            created_at: now,
            last_accessed_at: now,
            expires_at: expiry_from(now, ttl_minutes),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn running_count(&self) -> usize {
        self.services.values().filter(|s| s.is_running()).count()
    }

    /// Ports currently held by this sandbox's services
    pub fn held_ports(&self) -> Vec<u16> {
        self.services.values().filter_map(|s| s.port).collect()
    }

    /// Status implied by the services map: `None` when nothing is running.
    pub fn derived_status(&self) -> Option<SandboxStatus> {
        let running = self.running_count();
        if running == 0 {
            None
        } else if running == self.services.len() {
            Some(SandboxStatus::Running)
        } else {
            Some(SandboxStatus::Degraded)
        }
    }

    pub fn refresh_expiry(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
        let refreshed = expiry_from(now, self.ttl_minutes);
        if refreshed > self.expires_at {
            self.expires_at = refreshed;
        }
    }
}

pub fn generate_sandbox_id() -> String {
    format!("sbx_{}", Uuid::new_v4().simple())
}

fn expiry_from(now: DateTime<Utc>, ttl_minutes: u64) -> DateTime<Utc> {
    i64::try_from(ttl_minutes)
        .ok()
        .and_then(Duration::try_minutes)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Operations gated by the policy collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Request/Response types for API endpoints

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub required_services: Vec<String>,
    #[serde(default)]
    pub custom_configs: HashMap<String, Value>,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSandboxRequest {
    #[serde(default)]
    pub add_services: Option<Vec<String>>,
    #[serde(default)]
    pub update_configs: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceView {
    pub url: String,
    pub status: ServiceStatus,
    pub endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub sandbox_id: String,
    pub owner_ref: String,
    pub status: SandboxStatus,
    pub services: BTreeMap<String, ServiceView>,
    pub proxy_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SandboxResponse {
    pub fn from_sandbox(sandbox: &Sandbox, public_base_url: &str) -> Self {
        let base = public_base_url.trim_end_matches('/');
        let proxy_url = format!("{}/sandbox/{}", base, sandbox.id);
        let services = sandbox
            .services
            .iter()
            .map(|(name, instance)| {
                let view = ServiceView {
                    url: format!("{}/{}", proxy_url, name),
                    status: instance.status,
                    endpoints: instance.endpoints.clone(),
                    port: instance.port,
                    error: instance.error.clone(),
                };
                (name.clone(), view)
            })
            .collect();

        Self {
            sandbox_id: sandbox.id.clone(),
            owner_ref: sandbox.owner_ref.clone(),
            status: sandbox.status,
            services,
            proxy_url,
            created_at: sandbox.created_at,
            expires_at: sandbox.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSandboxResponse {
    pub status: SandboxStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SandboxListResponse {
    pub sandboxes: Vec<SandboxResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_instance(name: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            service_name: name.to_string(),
            port: Some(port),
            status: ServiceStatus::Running,
            endpoints: vec!["/items".to_string()],
            custom_config: json!({}),
            handle: None,
            error: None,
            started_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_deleted_is_terminal() {
        for next in [
            SandboxStatus::Creating,
            SandboxStatus::Running,
            SandboxStatus::Degraded,
            SandboxStatus::Expired,
            SandboxStatus::Deleted,
        ] {
            assert!(!SandboxStatus::Deleted.can_transition_to(next));
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(SandboxStatus::Creating.can_transition_to(SandboxStatus::Running));
        assert!(SandboxStatus::Creating.can_transition_to(SandboxStatus::Degraded));
        assert!(SandboxStatus::Running.can_transition_to(SandboxStatus::Expired));
        assert!(SandboxStatus::Degraded.can_transition_to(SandboxStatus::Expired));
        assert!(SandboxStatus::Expired.can_transition_to(SandboxStatus::Deleted));
        assert!(SandboxStatus::Creating.can_transition_to(SandboxStatus::Deleted));

        assert!(!SandboxStatus::Creating.can_transition_to(SandboxStatus::Expired));
        assert!(!SandboxStatus::Expired.can_transition_to(SandboxStatus::Running));
    }

    #[test]
    fn test_derived_status() {
        let mut sandbox = Sandbox::new("agent-1", 60);
        assert_eq!(sandbox.derived_status(), None);

        sandbox
            .services
            .insert("figma".to_string(), running_instance("figma", 40001));
        assert_eq!(sandbox.derived_status(), Some(SandboxStatus::Running));

        sandbox.services.insert(
            "slack".to_string(),
            ServiceInstance::failed("slack", json!({}), "boom".to_string()),
        );
        assert_eq!(sandbox.derived_status(), Some(SandboxStatus::Degraded));
        assert_eq!(sandbox.held_ports(), vec![40001]);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let sandbox = Sandbox::new("agent-1", 0);
        assert!(sandbox.is_expired(Utc::now() + Duration::milliseconds(1)));
    }

    #[test]
    fn test_refresh_expiry_never_shortens() {
        let mut sandbox = Sandbox::new("agent-1", 10);
        let original = sandbox.expires_at;
        sandbox.refresh_expiry(sandbox.created_at - Duration::minutes(5));
        assert_eq!(sandbox.expires_at, original);

        let later = sandbox.created_at + Duration::minutes(5);
        sandbox.refresh_expiry(later);
        assert_eq!(sandbox.expires_at, later + Duration::minutes(10));
        assert_eq!(sandbox.last_accessed_at, later);
    }

    #[test]
    fn test_response_shape() {
        let mut sandbox = Sandbox::new("agent-1", 60);
        sandbox.status = SandboxStatus::Running;
        sandbox
            .services
            .insert("generic".to_string(), running_instance("generic", 40010));

        let response = SandboxResponse::from_sandbox(&sandbox, "http://localhost:4080/");
        assert_eq!(
            response.proxy_url,
            format!("http://localhost:4080/sandbox/{}", sandbox.id)
        );
        let view = &response.services["generic"];
        assert_eq!(
            view.url,
            format!("http://localhost:4080/sandbox/{}/generic", sandbox.id)
        );
        assert_eq!(view.endpoints, vec!["/items".to_string()]);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["services"]["generic"]["status"], "running");
        assert!(json["services"]["generic"].get("error").is_none());
    }

    #[test]
    fn test_launcher_kind_parsing() {
        assert_eq!(LauncherKind::from_str("in-process"), Some(LauncherKind::InProcess));
        assert_eq!(LauncherKind::from_str("PROCESS"), Some(LauncherKind::Process));
        assert_eq!(LauncherKind::from_str("docker"), None);
    }
}
