//! SQLite-backed registry.
//!
//! Records live in one table keyed by their registry key, each with an
//! absolute expiry. Expired rows are swept on every read and reported to
//! watchers as deletions. Change notifications are delivered in-process
//! only, so watchers see the writes made through the same `SqliteRegistry`
//! (or its clones); readers in other processes still see the data.

use super::{service_key, Action, Registry, Service, WatchEvent, Watcher};
use crate::config::RegistryConfig;
use crate::{DodoError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Local registry stored in a SQLite database.
#[derive(Clone)]
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<WatchEvent>,
}

impl SqliteRegistry {
    /// Open the registry at a specific path.
    ///
    /// Creates the database and parent directories if they don't exist.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| DodoError::Io {
                    message: format!("Failed to create registry directory: {}", parent.display()),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory registry.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::ensure_schema(&conn)?;
        let (events, _) = broadcast::channel(RegistryConfig::WATCH_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA temp_store=MEMORY;",
            RegistryConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS services (
                key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                side TEXT NOT NULL,
                record TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_services_name ON services(name);",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DodoError::Database {
            message: "Failed to acquire registry connection lock".to_string(),
            source: None,
        })
    }

    fn notify(&self, action: Action, service: Service) {
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(WatchEvent { action, service });
    }

    /// Delete expired rows and report them as deletions.
    fn sweep_expired(&self, conn: &Connection) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = {
            let mut stmt = conn.prepare("SELECT record FROM services WHERE expires_at <= ?1")?;
            let rows = stmt.query_map(params![now], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        if expired.is_empty() {
            return Ok(());
        }

        conn.execute("DELETE FROM services WHERE expires_at <= ?1", params![now])?;
        for record in expired {
            match serde_json::from_str::<Service>(&record) {
                Ok(service) => {
                    debug!("Registry entry expired: {}", service);
                    self.notify(Action::Delete, service);
                }
                Err(e) => warn!("Dropped unreadable expired registry entry: {}", e),
            }
        }
        Ok(())
    }

    fn query(&self, name: Option<&str>) -> Result<Vec<Service>> {
        let conn = self.lock_conn()?;
        self.sweep_expired(&conn)?;

        let records: Vec<String> = match name {
            Some(name) => {
                let mut stmt =
                    conn.prepare("SELECT record FROM services WHERE name = ?1 ORDER BY key")?;
                let rows = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
                rows.collect::<std::result::Result<_, _>>()?
            }
            None => {
                let mut stmt = conn.prepare("SELECT record FROM services ORDER BY key")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<std::result::Result<_, _>>()?
            }
        };

        let mut services = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_str::<Service>(&record) {
                Ok(service) => services.push(service),
                Err(e) => warn!("Skipping unreadable registry entry: {}", e),
            }
        }
        Ok(services)
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn register(&self, service: &Service, ttl: Duration) -> Result<()> {
        service.validate()?;
        let key = service_key(service);
        let record = serde_json::to_string(service)?;
        let now = Utc::now();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.timestamp_millis().saturating_add(ttl_ms);

        let existed = {
            let conn = self.lock_conn()?;
            let existed = conn
                .query_row(
                    "SELECT 1 FROM services WHERE key = ?1 AND expires_at > ?2",
                    params![key, now.timestamp_millis()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            conn.execute(
                "INSERT INTO services (key, name, side, record, registered_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    record = excluded.record,
                    registered_at = excluded.registered_at,
                    expires_at = excluded.expires_at",
                params![key, service.name, service.side, record, now.to_rfc3339(), expires_at],
            )?;
            existed
        };

        let action = if existed { Action::Update } else { Action::Create };
        debug!("Registry {} {}", action, service);
        self.notify(action, service.clone());
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let key = service_key(service);
        let removed = {
            let conn = self.lock_conn()?;
            conn.execute("DELETE FROM services WHERE key = ?1", params![key])?
        };
        if removed > 0 {
            debug!("Registry delete {}", service);
            self.notify(Action::Delete, service.clone());
        }
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        self.query(Some(name))
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.query(None)
    }

    async fn watch(&self) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(SqliteWatcher {
            events: Some(self.events.subscribe()),
        }))
    }
}

impl std::fmt::Debug for SqliteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRegistry")
            .field("watchers", &self.events.receiver_count())
            .finish()
    }
}

struct SqliteWatcher {
    events: Option<broadcast::Receiver<WatchEvent>>,
}

#[async_trait]
impl Watcher for SqliteWatcher {
    async fn next(&mut self) -> Result<WatchEvent> {
        let events = self.events.as_mut().ok_or(DodoError::WatcherStopped)?;
        match events.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => Err(DodoError::registry(format!(
                "watcher fell behind by {} events",
                missed
            ))),
            Err(broadcast::error::RecvError::Closed) => Err(DodoError::WatcherStopped),
        }
    }

    fn stop(&mut self) {
        self.events = None;
    }
}
