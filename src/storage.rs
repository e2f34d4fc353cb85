use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}, Row};
use tokio::sync::RwLock;
use tracing::warn;

use crate::session::{Session, SessionId};

pub const SESSIONS_KEY: &str = "studio-sessions";
pub const ACTIVE_SESSION_KEY: &str = "studio-active-session-id";

/// String-valued durable storage, one value per key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SqliteKeyValueStore {
    pool: Pool<Sqlite>,
}

impl SqliteKeyValueStore {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("vision_studio");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("studio.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?1").bind(key).execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// Everything the session store needs to come back after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSessions {
    pub sessions: Vec<Session>,
    pub active_id: Option<SessionId>,
}

pub async fn save_sessions(kv: &dyn KeyValueStore, state: &PersistedSessions) -> anyhow::Result<()> {
    if !state.sessions.is_empty() {
        kv.set(SESSIONS_KEY, &serde_json::to_string(&state.sessions)?).await?;
    }
    if let Some(id) = state.active_id {
        kv.set(ACTIVE_SESSION_KEY, &id.to_string()).await?;
    }
    Ok(())
}

/// Reads saved sessions. Missing, unreadable, or malformed data all mean "no saved state".
pub async fn load_sessions(kv: &dyn KeyValueStore) -> Option<PersistedSessions> {
    let raw = match kv.get(SESSIONS_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "failed to read saved sessions");
            return None;
        }
    };
    let sessions: Vec<Session> = match serde_json::from_str(&raw) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "saved sessions are malformed, starting fresh");
            return None;
        }
    };
    if sessions.is_empty() {
        return None;
    }
    let active_id = kv
        .get(ACTIVE_SESSION_KEY)
        .await
        .ok()
        .flatten()
        .and_then(|s| s.parse::<SessionId>().ok());
    Some(PersistedSessions { sessions, active_id })
}
