use super::{probe_client, probe_health, wait_until_ready, ServiceLauncher};
use crate::error::LaunchError;
use crate::templates::RenderedArtifact;
use crate::types::{LauncherKind, ServiceHandle};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Tracked {
    /// Spawned by this launcher
    Child(Child),
    /// Adopted after a restart; only the pid is known
    Pid(u32),
}

/// Runs each mock as a `mockbox serve-mock` subprocess
pub struct ProcessLauncher {
    program: PathBuf,
    artifact_dir: PathBuf,
    readiness_timeout: Duration,
    grace_period: Duration,
    processes: Mutex<HashMap<Uuid, Tracked>>,
    client: reqwest::Client,
}

impl ProcessLauncher {
    pub fn new(
        program: PathBuf,
        state_dir: &Path,
        readiness_timeout: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            program,
            artifact_dir: state_dir.join("artifacts"),
            readiness_timeout,
            grace_period,
            processes: Mutex::new(HashMap::new()),
            client: probe_client(),
        }
    }

    /// Launcher that re-executes the running binary
    pub fn current_exe(
        state_dir: &Path,
        readiness_timeout: Duration,
        grace_period: Duration,
    ) -> Result<Self, LaunchError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, state_dir, readiness_timeout, grace_period))
    }

    fn artifact_path(&self, id: &Uuid) -> PathBuf {
        self.artifact_dir.join(format!("{}.json", id))
    }

    async fn write_artifact(&self, id: &Uuid, artifact: &RenderedArtifact) -> Result<PathBuf, LaunchError> {
        tokio::fs::create_dir_all(&self.artifact_dir).await?;
        let path = self.artifact_path(id);
        let json = serde_json::to_vec_pretty(artifact).map_err(|e| LaunchError::Io(e.to_string()))?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    async fn terminate(&self, tracked: Tracked, port: u16) -> Result<(), LaunchError> {
        match tracked {
            Tracked::Child(mut child) => {
                if let Some(pid) = child.id() {
                    send_sigterm(pid);
                }
                let deadline = Instant::now() + self.grace_period;
                while Instant::now() < deadline {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            debug!("Mock process on port {} exited with {}", port, status);
                            return Ok(());
                        }
                        Ok(None) => sleep(EXIT_POLL_INTERVAL).await,
                        Err(e) => {
                            return Err(LaunchError::Stop {
                                port,
                                reason: e.to_string(),
                            })
                        }
                    }
                }
                warn!(
                    "Mock process on port {} ignored SIGTERM for {:?}, killing",
                    port, self.grace_period
                );
                child.kill().await.map_err(|e| LaunchError::Stop {
                    port,
                    reason: e.to_string(),
                })
            }
            Tracked::Pid(pid) => {
                if !pid_alive(pid) {
                    return Ok(());
                }
                send_sigterm(pid);
                let deadline = Instant::now() + self.grace_period;
                while Instant::now() < deadline {
                    if !pid_alive(pid) {
                        return Ok(());
                    }
                    sleep(EXIT_POLL_INTERVAL).await;
                }
                warn!("Adopted mock process {} ignored SIGTERM, killing", pid);
                send_sigkill(pid).map_err(|reason| LaunchError::Stop { port, reason })
            }
        }
    }
}

#[async_trait]
impl ServiceLauncher for ProcessLauncher {
    async fn start(
        &self,
        artifact: &RenderedArtifact,
        port: u16,
    ) -> Result<ServiceHandle, LaunchError> {
        let id = Uuid::new_v4();
        let artifact_path = self.write_artifact(&id, artifact).await?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("serve-mock")
            .arg("--artifact")
            .arg(&artifact_path)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&artifact_path).await;
                error!("Failed to spawn mock process: {}", e);
                return Err(LaunchError::Spawn {
                    command: self.program.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let handle = ServiceHandle {
            id,
            port,
            kind: LauncherKind::Process,
            pid: child.id(),
            started_at: Utc::now(),
        };

        if let Err(e) = wait_until_ready(&self.client, port, self.readiness_timeout).await {
            warn!(
                "Mock process for {} on port {} never became ready",
                artifact.service_name, port
            );
            if let Err(stop_err) = self.terminate(Tracked::Child(child), port).await {
                warn!("Failed to stop unready mock on port {}: {}", port, stop_err);
            }
            let _ = tokio::fs::remove_file(&artifact_path).await;
            return Err(e);
        }

        self.processes.lock().await.insert(id, Tracked::Child(child));
        info!(
            "Started mock process for {} on port {} (pid {:?})",
            artifact.service_name, port, handle.pid
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), LaunchError> {
        let tracked = self.processes.lock().await.remove(&handle.id);
        let result = match tracked {
            Some(tracked) => self.terminate(tracked, handle.port).await,
            None => {
                debug!("Mock process {} already stopped", handle.id);
                Ok(())
            }
        };
        let _ = tokio::fs::remove_file(self.artifact_path(&handle.id)).await;
        result
    }

    async fn health(&self, handle: &ServiceHandle) -> bool {
        let alive = {
            let mut processes = self.processes.lock().await;
            match processes.get_mut(&handle.id) {
                Some(Tracked::Child(child)) => matches!(child.try_wait(), Ok(None)),
                Some(Tracked::Pid(pid)) => pid_alive(*pid),
                None => false,
            }
        };
        alive && probe_health(&self.client, handle.port).await
    }

    async fn adopt(&self, handle: &ServiceHandle) -> bool {
        let Some(pid) = handle.pid else {
            return false;
        };
        if handle.kind != LauncherKind::Process || !pid_alive(pid) {
            return false;
        }
        if !probe_health(&self.client, handle.port).await {
            return false;
        }
        self.processes.lock().await.insert(handle.id, Tracked::Pid(pid));
        info!("Adopted mock process {} on port {}", pid, handle.port);
        true
    }

    fn kind(&self) -> LauncherKind {
        LauncherKind::Process
    }
}

fn pid_alive(pid: u32) -> bool {
    use sysinfo::{Pid, System};

    let mut system = System::new();
    system.refresh_processes();
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("Failed to send SIGTERM to PID {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(unix)]
fn send_sigkill(pid: u32) -> Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| format!("Failed to send SIGKILL: {}", e))
}

#[cfg(not(unix))]
fn send_sigkill(pid: u32) -> Result<(), String> {
    Err(format!("Cannot signal adopted process {} on this platform", pid))
}
