// ABOUTME: Background TTL reaper for expired and orphaned sandboxes
// ABOUTME: Interval loop with a cancellation token, sharing the facade's teardown path

use crate::service::{HealthOutcome, SandboxService};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a single sweep reclaimed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub expired: usize,
    pub orphaned: usize,
    pub ports_reclaimed: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired == 0 && self.orphaned == 0 && self.ports_reclaimed == 0
    }
}

pub struct TtlReaper {
    service: SandboxService,
    interval: Duration,
    cancel: CancellationToken,
}

impl TtlReaper {
    pub fn new(service: SandboxService) -> Self {
        let interval = service.settings().reaper_interval;
        Self {
            service,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Token that stops the loop started by [`TtlReaper::spawn`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run sweeps on the configured interval until cancelled.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("TTL reaper started (every {:?})", self.interval);
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("TTL reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep_once().await;
                        if !report.is_empty() {
                            info!(
                                "Reaper sweep: {} expired, {} orphaned, {} ports reclaimed",
                                report.expired, report.orphaned, report.ports_reclaimed
                            );
                        }
                    }
                }
            }
        })
    }

    /// One pass: expire overdue sandboxes, reap orphans, reclaim stray port leases.
    pub async fn sweep_once(&self) -> ReapReport {
        let mut report = ReapReport::default();

        let registry = self.service.registry();
        for id in registry.expired_ids(Utc::now()).await {
            if self.service.expire(&id).await.is_some() {
                report.expired += 1;
            }
        }

        for sandbox in registry.list(None).await {
            match self.service.check_health(&sandbox.id).await {
                HealthOutcome::Orphaned => report.orphaned += 1,
                HealthOutcome::Degraded { failed } => {
                    debug!("Sandbox {} lost {} services", sandbox.id, failed)
                }
                HealthOutcome::Healthy | HealthOutcome::Missing => {}
            }
        }

        report.ports_reclaimed = self.service.reclaim_orphan_ports().await.len();
        report
    }
}
