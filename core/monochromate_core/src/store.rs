use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context};
use rusqlite::Connection;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::settings::{self, Settings, CURRENT_VERSION};

/// Storage key of the settings record.
pub const SETTINGS_KEY: &str = "monofilter";

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub version: u32,
    pub value_json: String,
}

/// Key-value blob storage for the settings record.
pub trait SettingsBackend: Send + Sync {
    fn read(&self, key: &str) -> anyhow::Result<Option<StoredRecord>>;
    fn write(&self, key: &str, record: &StoredRecord) -> anyhow::Result<()>;
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("settings db lock poisoned"))
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS kv_store (
  key TEXT PRIMARY KEY,
  version INTEGER NOT NULL,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
    )
}

impl SettingsBackend for SqliteBackend {
    fn read(&self, key: &str) -> anyhow::Result<Option<StoredRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT version, value_json FROM kv_store WHERE key = ?1")?;
        match stmt.query_row([key], |row| {
            Ok(StoredRecord {
                version: row.get(0)?,
                value_json: row.get(1)?,
            })
        }) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, record: &StoredRecord) -> anyhow::Result<()> {
        let updated_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let conn = self.lock()?;
        conn.execute(
            r#"
INSERT INTO kv_store (key, version, value_json, updated_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(key) DO UPDATE SET
  version=excluded.version,
  value_json=excluded.value_json,
  updated_at=excluded.updated_at
            "#,
            (key, record.version, record.value_json.as_str(), updated_at),
        )?;
        Ok(())
    }
}

/// In-process backend, used by tests and for ephemeral runs.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, StoredRecord>>,
}

impl MemoryBackend {
    pub fn with_record(key: &str, version: u32, value_json: &str) -> Self {
        let backend = Self::default();
        if let Ok(mut records) = backend.records.lock() {
            records.insert(
                key.to_string(),
                StoredRecord {
                    version,
                    value_json: value_json.to_string(),
                },
            );
        }
        backend
    }
}

impl SettingsBackend for MemoryBackend {
    fn read(&self, key: &str) -> anyhow::Result<Option<StoredRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?;
        Ok(records.get(key).cloned())
    }

    fn write(&self, key: &str, record: &StoredRecord) -> anyhow::Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?;
        records.insert(key.to_string(), record.clone());
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SettingsChange {
    pub old: Settings,
    pub new: Settings,
}

/// Keeps a watch callback alive; dropping it unsubscribes.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owner of the settings record. Every mutation goes through [`SettingsStore::set`]
/// or [`SettingsStore::update`] and is announced to subscribers.
pub struct SettingsStore {
    backend: Arc<dyn SettingsBackend>,
    key: String,
    current: AsyncMutex<Settings>,
    changes: broadcast::Sender<SettingsChange>,
}

fn encode(settings: &Settings) -> anyhow::Result<StoredRecord> {
    Ok(StoredRecord {
        version: CURRENT_VERSION,
        value_json: serde_json::to_string(settings)?,
    })
}

fn decode_record(record: &StoredRecord) -> anyhow::Result<Settings> {
    if record.version > CURRENT_VERSION {
        warn!(
            "stored settings use schema v{} (newer than v{CURRENT_VERSION}); reading as current",
            record.version
        );
    }
    let value: serde_json::Value = serde_json::from_str(&record.value_json)?;
    Ok(settings::decode(record.version, value)?)
}

impl SettingsStore {
    pub fn open(backend: Arc<dyn SettingsBackend>) -> anyhow::Result<Self> {
        Self::open_with_key(backend, SETTINGS_KEY)
    }

    pub fn open_with_key(backend: Arc<dyn SettingsBackend>, key: &str) -> anyhow::Result<Self> {
        let loaded = match backend.read(key)? {
            None => {
                info!("no stored settings; writing defaults");
                let defaults = Settings::default();
                backend.write(key, &encode(&defaults)?)?;
                defaults
            }
            Some(record) => match decode_record(&record) {
                Ok(settings) => {
                    if record.version != CURRENT_VERSION {
                        info!(
                            "migrated settings from v{} to v{CURRENT_VERSION}",
                            record.version
                        );
                        if let Err(err) = backend.write(key, &encode(&settings)?) {
                            warn!("write back migrated settings failed: {err}");
                        }
                    }
                    settings
                }
                Err(err) => {
                    warn!("stored settings unreadable ({err}); falling back to defaults");
                    let defaults = Settings::default();
                    if let Err(err) = backend.write(key, &encode(&defaults)?) {
                        warn!("write defaults failed: {err}");
                    }
                    defaults
                }
            },
        };

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            backend,
            key: key.to_string(),
            current: AsyncMutex::new(loaded),
            changes,
        })
    }

    pub async fn get(&self) -> Settings {
        self.current.lock().await.clone()
    }

    /// Replaces the whole record. Returns the stored (normalized) value.
    pub async fn set(&self, settings: Settings) -> anyhow::Result<Settings> {
        let mut guard = self.current.lock().await;
        self.commit(&mut guard, settings)
    }

    /// Read-modify-write under the store lock.
    pub async fn update<F>(&self, f: F) -> anyhow::Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.current.lock().await;
        let mut next = guard.clone();
        f(&mut next);
        self.commit(&mut guard, next)
    }

    fn commit(&self, current: &mut Settings, next: Settings) -> anyhow::Result<Settings> {
        let next = next.normalized();
        if next == *current {
            return Ok(next);
        }
        self.backend.write(&self.key, &encode(&next)?)?;
        let old = std::mem::replace(current, next.clone());
        // No receivers is fine.
        let _ = self.changes.send(SettingsChange {
            old,
            new: next.clone(),
        });
        Ok(next)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }

    /// Calls `callback(new, old)` for every change until the returned
    /// [`Subscription`] is dropped.
    pub fn watch<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(&Settings, &Settings) + Send + 'static,
    {
        let mut rx = self.changes.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => callback(&change.new, &change.old),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("settings watcher skipped {n} changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}
