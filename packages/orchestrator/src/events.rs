use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Entries kept per sandbox
pub const MAX_EVENTS_PER_SANDBOX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Lifecycle event recorded against a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
}

/// Bounded per-sandbox event history
#[derive(Default)]
pub struct EventLog {
    events: RwLock<HashMap<String, VecDeque<SandboxEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(
        &self,
        sandbox_id: &str,
        level: EventLevel,
        service: Option<&str>,
        message: impl Into<String>,
    ) {
        let event = SandboxEvent {
            timestamp: Utc::now(),
            level,
            service: service.map(str::to_string),
            message: message.into(),
        };

        let mut events = self.events.write().await;
        let history = events.entry(sandbox_id.to_string()).or_default();
        history.push_back(event);
        while history.len() > MAX_EVENTS_PER_SANDBOX {
            history.pop_front();
        }
    }

    pub async fn info(&self, sandbox_id: &str, service: Option<&str>, message: impl Into<String>) {
        self.record(sandbox_id, EventLevel::Info, service, message).await;
    }

    pub async fn warn(&self, sandbox_id: &str, service: Option<&str>, message: impl Into<String>) {
        self.record(sandbox_id, EventLevel::Warn, service, message).await;
    }

    /// Most recent events, oldest first. `limit` keeps only the newest N.
    pub async fn recent(&self, sandbox_id: &str, limit: Option<usize>) -> Vec<SandboxEvent> {
        let events = self.events.read().await;
        match events.get(sandbox_id) {
            Some(history) => {
                let skip = limit
                    .map(|n| history.len().saturating_sub(n))
                    .unwrap_or(0);
                history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn drop_sandbox(&self, sandbox_id: &str) {
        self.events.write().await.remove(sandbox_id);
    }
}
