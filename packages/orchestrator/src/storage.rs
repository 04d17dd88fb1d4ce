// ABOUTME: Persistence backends for sandbox records
// ABOUTME: In-memory store for tests and single-process use, SQLite store for restart durability

use crate::error::StoreError;
use crate::types::Sandbox;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable backing for the sandbox registry
#[async_trait]
pub trait SandboxStore: Send + Sync {
    async fn save(&self, sandbox: &Sandbox) -> StoreResult<()>;
    async fn remove(&self, sandbox_id: &str) -> StoreResult<()>;
    async fn load_all(&self) -> StoreResult<Vec<Sandbox>>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Sandbox>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    async fn save(&self, sandbox: &Sandbox) -> StoreResult<()> {
        self.records
            .write()
            .await
            .insert(sandbox.id.clone(), sandbox.clone());
        Ok(())
    }

    async fn remove(&self, sandbox_id: &str) -> StoreResult<()> {
        self.records.write().await.remove(sandbox_id);
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<Vec<Sandbox>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// SQLite-backed store; one row per sandbox with the full record as JSON
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create database directory {:?}: {}", parent, e);
            }
        }
        Self::connect(&format!("sqlite:{}", path.display())).await
    }

    pub async fn connect(url: &str) -> StoreResult<Self> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Every connection to ":memory:" is a separate database
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        if !in_memory {
            sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        }

        let store = Self { pool };
        store.migrate().await?;
        debug!("Connected sandbox store at {}", url);
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sandboxes (
                id TEXT PRIMARY KEY,
                owner_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sandboxes_owner ON sandboxes(owner_ref)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxStore for SqliteStore {
    async fn save(&self, sandbox: &Sandbox) -> StoreResult<()> {
        let payload = serde_json::to_string(sandbox)?;

        sqlx::query(
            r#"
            INSERT INTO sandboxes (id, owner_ref, status, payload, created_at, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.owner_ref)
        .bind(sandbox.status.as_str())
        .bind(payload)
        .bind(sandbox.created_at.to_rfc3339())
        .bind(sandbox.expires_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, sandbox_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sandboxes WHERE id = ?1")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<Vec<Sandbox>> {
        let rows = sqlx::query("SELECT id, payload FROM sandboxes ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        let mut sandboxes = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;
            match serde_json::from_str::<Sandbox>(&payload) {
                Ok(sandbox) => sandboxes.push(sandbox),
                Err(e) => warn!("Skipping unreadable sandbox record {}: {}", id, e),
            }
        }
        Ok(sandboxes)
    }
}
