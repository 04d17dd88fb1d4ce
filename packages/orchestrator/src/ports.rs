// ABOUTME: Port pool handing out unique ports from a bounded range
// ABOUTME: Single mutex-guarded allocation path with idempotent release and lease inspection

use crate::error::PortError;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bind probes allowed per allocation while the pool lock is held
const MAX_BIND_PROBES: usize = 32;

/// How long a port that failed the bind probe is skipped
const BUSY_PORT_COOLDOWN: Duration = Duration::from_secs(30);

/// A port currently handed out, and to whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortLease {
    pub port: u16,
    pub held_by: String,
}

impl PortLease {
    /// Sandbox id part of a `{sandbox_id}/{service}` holder
    pub fn sandbox_id(&self) -> &str {
        self.held_by
            .split_once('/')
            .map(|(sandbox, _)| sandbox)
            .unwrap_or(&self.held_by)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: BTreeSet<u16>,
    held: HashMap<u16, String>,
    /// Free ports another process was listening on, with when that was seen
    busy: HashMap<u16, Instant>,
}

/// Hands out ports from `[start, end]`; a held port is never handed out twice.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    probe_bind: bool,
    probe_limit: usize,
    busy_cooldown: Duration,
    state: Mutex<PoolState>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        let free = (start..=end).collect();
        Self {
            start,
            end,
            probe_bind: true,
            probe_limit: MAX_BIND_PROBES,
            busy_cooldown: BUSY_PORT_COOLDOWN,
            state: Mutex::new(PoolState {
                free,
                held: HashMap::new(),
                busy: HashMap::new(),
            }),
        }
    }

    /// Skip the OS bind probe; the pool then only tracks its own bookkeeping.
    pub fn without_bind_probe(mut self) -> Self {
        self.probe_bind = false;
        self
    }

    pub fn with_probe_limit(mut self, limit: usize) -> Self {
        self.probe_limit = limit.max(1);
        self
    }

    pub fn with_busy_cooldown(mut self, cooldown: Duration) -> Self {
        self.busy_cooldown = cooldown;
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lowest free port for `holder`.
    ///
    /// Ports another process already listens on are skipped but stay in the pool.
    /// They are not probed again until the busy cooldown passes, and a single call
    /// probes at most `probe_limit` ports.
    pub fn allocate(&self, holder: &str) -> Result<u16, PortError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let now = Instant::now();
        let cooldown = self.busy_cooldown;
        state
            .busy
            .retain(|_, seen| now.duration_since(*seen) < cooldown);

        let mut probed = 0;
        let mut found = None;
        for port in state.free.iter().copied() {
            if state.busy.contains_key(&port) {
                continue;
            }
            if !self.probe_bind {
                found = Some(port);
                break;
            }
            if probed == self.probe_limit {
                break;
            }
            probed += 1;
            if is_port_bindable(port) {
                found = Some(port);
                break;
            }
            state.busy.insert(port, now);
        }

        match found {
            Some(port) => {
                state.free.remove(&port);
                state.held.insert(port, holder.to_string());
                debug!("Allocated port {} to {}", port, holder);
                Ok(port)
            }
            None if probed == self.probe_limit => {
                warn!(
                    "Gave up after probing {} busy ports in {}-{}",
                    probed, self.start, self.end
                );
                Err(PortError::Busy {
                    start: self.start,
                    end: self.end,
                    probed,
                })
            }
            None => {
                warn!(
                    "Port pool {}-{} exhausted ({} held, {} busy)",
                    self.start,
                    self.end,
                    state.held.len(),
                    state.busy.len()
                );
                Err(PortError::Exhausted {
                    start: self.start,
                    end: self.end,
                })
            }
        }
    }

    /// Return a port to the pool. Releasing a port that is not held is a no-op.
    pub fn release(&self, port: u16) {
        let mut state = self.lock();
        if let Some(holder) = state.held.remove(&port) {
            state.free.insert(port);
            debug!("Released port {} from {}", port, holder);
        }
    }

    /// Mark a specific port as held, used when re-adopting services after a restart.
    pub fn reserve(&self, port: u16, holder: &str) -> bool {
        let mut state = self.lock();
        if state.free.remove(&port) {
            state.held.insert(port, holder.to_string());
            true
        } else {
            false
        }
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.lock().held.contains_key(&port)
    }

    pub fn leases(&self) -> Vec<PortLease> {
        let state = self.lock();
        let mut leases: Vec<PortLease> = state
            .held
            .iter()
            .map(|(port, held_by)| PortLease {
                port: *port,
                held_by: held_by.clone(),
            })
            .collect();
        leases.sort_by_key(|lease| lease.port);
        leases
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }
}

fn is_port_bindable(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Lease holder label tying a port to one service of one sandbox
pub fn holder_label(sandbox_id: &str, service_name: &str) -> String {
    format!("{}/{}", sandbox_id, service_name)
}
