// ABOUTME: ServiceLauncher trait and backends for running rendered mocks on allocated ports
// ABOUTME: Shared readiness probing against the mock health path with a bounded timeout

use crate::error::LaunchError;
use crate::templates::{RenderedArtifact, HEALTH_PATH};
use crate::types::{LauncherKind, ServiceHandle};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

pub mod in_process;
pub mod mock_server;
pub mod process;

pub use in_process::InProcessLauncher;
pub use mock_server::mock_router;
pub use process::ProcessLauncher;

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(50);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Backend that turns a rendered artifact into a live service on a port
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    /// Start serving `artifact` on `port`, returning only once the service answers its health path.
    async fn start(&self, artifact: &RenderedArtifact, port: u16)
        -> Result<ServiceHandle, LaunchError>;

    /// Stop a service. Stopping an unknown or already stopped handle is not an error.
    async fn stop(&self, handle: &ServiceHandle) -> Result<(), LaunchError>;

    /// Whether the service still answers its health path
    async fn health(&self, handle: &ServiceHandle) -> bool;

    /// Take ownership of a service started by a previous orchestrator process.
    async fn adopt(&self, _handle: &ServiceHandle) -> bool {
        false
    }

    fn kind(&self) -> LauncherKind;
}

pub(crate) fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .no_proxy()
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn health_url(port: u16) -> String {
    format!("http://127.0.0.1:{}{}", port, HEALTH_PATH)
}

/// Single health probe
pub async fn probe_health(client: &reqwest::Client, port: u16) -> bool {
    match client.get(health_url(port)).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Poll the health path until it answers 200 or `timeout` elapses.
pub async fn wait_until_ready(
    client: &reqwest::Client,
    port: u16,
    timeout: Duration,
) -> Result<(), LaunchError> {
    let deadline = Instant::now() + timeout;
    loop {
        if probe_health(client, port).await {
            debug!("Mock on port {} is ready", port);
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(LaunchError::ReadinessTimeout {
                port,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        sleep(READINESS_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_until_ready_times_out_on_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let started = Instant::now();
        let result = wait_until_ready(&probe_client(), port, Duration::from_millis(200)).await;
        assert_eq!(
            result,
            Err(LaunchError::ReadinessTimeout {
                port,
                timeout_ms: 200
            })
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
