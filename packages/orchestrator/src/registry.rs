// ABOUTME: Sandbox registry, the single source of truth for sandbox records
// ABOUTME: Snapshot reads, per-sandbox operation locks, write-through persistence and tombstones

use crate::storage::SandboxStore;
use crate::types::{Sandbox, SandboxStatus};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

/// Removed ids remembered so the proxy can answer "gone" instead of "never existed"
const MAX_TOMBSTONES: usize = 1024;

struct Slot {
    sandbox: Sandbox,
    op_lock: Arc<AsyncMutex<()>>,
}

#[derive(Default)]
struct Tombstones {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl Tombstones {
    fn add(&mut self, id: &str) {
        if self.ids.insert(id.to_string()) {
            self.order.push_back(id.to_string());
        }
        while self.order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

pub struct SandboxRegistry {
    entries: RwLock<HashMap<String, Slot>>,
    tombstones: Mutex<Tombstones>,
    store: Arc<dyn SandboxStore>,
    /// Serializes store writes so a stale snapshot never lands after a newer one
    persist_lock: AsyncMutex<()>,
}

impl SandboxRegistry {
    pub fn new(store: Arc<dyn SandboxStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(Tombstones::default()),
            store,
            persist_lock: AsyncMutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SandboxStore> {
        &self.store
    }

    /// Publish a fully constructed sandbox. This is the only way a record becomes visible.
    pub async fn insert(&self, sandbox: Sandbox) {
        let id = sandbox.id.clone();
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                id.clone(),
                Slot {
                    sandbox,
                    op_lock: Arc::new(AsyncMutex::new(())),
                },
            );
        }
        debug!("Registered sandbox {}", id);
        self.persist(&id).await;
    }

    pub async fn get(&self, id: &str) -> Option<Sandbox> {
        self.entries.read().await.get(id).map(|slot| slot.sandbox.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Snapshot of all sandboxes, optionally for one owner, oldest first
    pub async fn list(&self, owner_ref: Option<&str>) -> Vec<Sandbox> {
        let entries = self.entries.read().await;
        let mut sandboxes: Vec<Sandbox> = entries
            .values()
            .filter(|slot| owner_ref.map_or(true, |owner| slot.sandbox.owner_ref == owner))
            .map(|slot| slot.sandbox.clone())
            .collect();
        sandboxes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sandboxes
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn count_for_owner(&self, owner_ref: &str) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|slot| slot.sandbox.owner_ref == owner_ref)
            .count()
    }

    /// Acquire the operation lock of one sandbox.
    ///
    /// Returns `None` if the sandbox is absent, including when it was removed while waiting.
    pub async fn lock(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        let op_lock = {
            let entries = self.entries.read().await;
            entries.get(id).map(|slot| slot.op_lock.clone())?
        };
        let guard = op_lock.lock_owned().await;
        if self.contains(id).await {
            Some(guard)
        } else {
            None
        }
    }

    /// Mutate a sandbox in place and return the new snapshot.
    ///
    /// Missing or deleted sandboxes are left alone and yield `None`.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Option<Sandbox>
    where
        F: FnOnce(&mut Sandbox),
    {
        let snapshot = {
            let mut entries = self.entries.write().await;
            let slot = entries.get_mut(id)?;
            if slot.sandbox.status == SandboxStatus::Deleted {
                return None;
            }
            mutate(&mut slot.sandbox);
            slot.sandbox.clone()
        };
        self.persist(id).await;
        Some(snapshot)
    }

    /// Move a sandbox to `next` if the state machine allows it. Invalid moves are no-ops.
    pub async fn transition(&self, id: &str, next: SandboxStatus) -> bool {
        let changed = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(id) {
                Some(slot) if slot.sandbox.status == next => false,
                Some(slot) if slot.sandbox.status.can_transition_to(next) => {
                    debug!(
                        "Sandbox {} transitioning {} -> {}",
                        id, slot.sandbox.status, next
                    );
                    slot.sandbox.status = next;
                    true
                }
                Some(slot) => {
                    debug!(
                        "Ignoring transition {} -> {} for sandbox {}",
                        slot.sandbox.status, next, id
                    );
                    false
                }
                None => false,
            }
        };
        if changed {
            self.persist(id).await;
        }
        changed
    }

    /// Refresh access time and push out expiry
    pub async fn touch(&self, id: &str, now: DateTime<Utc>) -> Option<Sandbox> {
        self.update(id, |sandbox| {
            if sandbox.status.is_routable() && !sandbox.is_expired(now) {
                sandbox.refresh_expiry(now);
            }
        })
        .await
    }

    /// Drop a sandbox from the table and remember its id as gone.
    pub async fn remove(&self, id: &str) -> Option<Sandbox> {
        let removed = self.entries.write().await.remove(id).map(|slot| slot.sandbox);
        if removed.is_some() {
            self.tombstones
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .add(id);

            let _persist = self.persist_lock.lock().await;
            if let Err(e) = self.store.remove(id).await {
                warn!("Failed to remove sandbox {} from store: {}", id, e);
            }
        }
        removed
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ids
            .contains(id)
    }

    /// Ids of live sandboxes whose expiry has passed
    pub async fn expired_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .read()
            .await
            .values()
            .filter(|slot| {
                slot.sandbox.status != SandboxStatus::Deleted && slot.sandbox.is_expired(now)
            })
            .map(|slot| slot.sandbox.id.clone())
            .collect()
    }

    async fn persist(&self, id: &str) {
        let _persist = self.persist_lock.lock().await;
        let Some(snapshot) = self.get(id).await else {
            return;
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!("Failed to persist sandbox {}: {}", id, e);
        }
    }
}
