use super::{mock_router, probe_client, probe_health, wait_until_ready, ServiceLauncher};
use crate::error::LaunchError;
use crate::templates::RenderedArtifact;
use crate::types::{LauncherKind, ServiceHandle};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct RunningServer {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Serves mocks as tokio tasks inside the orchestrator process
pub struct InProcessLauncher {
    servers: Mutex<HashMap<Uuid, RunningServer>>,
    readiness_timeout: Duration,
    grace_period: Duration,
    client: reqwest::Client,
}

impl InProcessLauncher {
    pub fn new(readiness_timeout: Duration, grace_period: Duration) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            readiness_timeout,
            grace_period,
            client: probe_client(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.servers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    fn take(&self, id: &Uuid) -> Option<RunningServer> {
        self.servers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id)
    }

    async fn shutdown(&self, server: RunningServer, port: u16) {
        let RunningServer { shutdown, mut task } = server;
        let _ = shutdown.send(());

        match tokio::time::timeout(self.grace_period, &mut task).await {
            Ok(_) => debug!("Mock on port {} shut down gracefully", port),
            Err(_) => {
                warn!(
                    "Mock on port {} did not stop within {:?}, aborting",
                    port, self.grace_period
                );
                task.abort();
                let _ = task.await;
            }
        }
    }
}

#[async_trait]
impl ServiceLauncher for InProcessLauncher {
    async fn start(
        &self,
        artifact: &RenderedArtifact,
        port: u16,
    ) -> Result<ServiceHandle, LaunchError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr).await.map_err(|e| LaunchError::Bind {
            port,
            reason: e.to_string(),
        })?;

        let router = mock_router(artifact.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let service_name = artifact.service_name.clone();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!("Mock {} on port {} exited with error: {}", service_name, port, e);
            }
        });

        let handle = ServiceHandle {
            id: Uuid::new_v4(),
            port,
            kind: LauncherKind::InProcess,
            pid: None,
            started_at: Utc::now(),
        };

        let server = RunningServer {
            shutdown: shutdown_tx,
            task,
        };

        if let Err(e) = wait_until_ready(&self.client, port, self.readiness_timeout).await {
            self.shutdown(server, port).await;
            return Err(e);
        }

        self.servers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(handle.id, server);

        info!(
            "Started in-process mock {} on port {}",
            artifact.service_name, port
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), LaunchError> {
        match self.take(&handle.id) {
            Some(server) => {
                self.shutdown(server, handle.port).await;
                info!("Stopped in-process mock on port {}", handle.port);
            }
            None => debug!("Mock {} on port {} already stopped", handle.id, handle.port),
        }
        Ok(())
    }

    async fn health(&self, handle: &ServiceHandle) -> bool {
        let tracked = self
            .servers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&handle.id)
            .map(|server| !server.task.is_finished())
            .unwrap_or(false);
        tracked && probe_health(&self.client, handle.port).await
    }

    fn kind(&self) -> LauncherKind {
        LauncherKind::InProcess
    }
}
