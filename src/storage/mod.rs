//! Visit store
//!
//! Persists one row per consumed [`VisitEvent`] and answers the two query
//! shapes the HTTP API needs. Inserts are not idempotent: a redelivered
//! event becomes a second row.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, params_from_iter, types::Value, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::event::{VisitEvent, VisitsByKey};

/// Errors raised by a visit store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be opened or initialized.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A statement failed.
    #[error("Query failed: {0}")]
    Query(String),

    /// A stored timestamp could not be converted back.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence capability used by the insert callback and the query path.
#[async_trait]
pub trait VisitStore: Send + Sync {
    /// Appends one row for `event`.
    async fn insert_event(&self, event: &VisitEvent) -> Result<(), StoreError>;

    /// Returns every stored visit grouped by origin key.
    async fn get_visits(&self) -> Result<VisitsByKey, StoreError>;

    /// Returns the visits of one key in chronological order.
    ///
    /// Bounds are inclusive; `None` leaves that side unbounded.
    async fn get_visits_by_key(
        &self,
        key: &str,
        weekday: Option<&str>,
        gt: Option<DateTime<Utc>>,
        lt: Option<DateTime<Utc>>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;
}

/// SQLite-backed visit store
///
/// Every call opens its own connection on the blocking pool, so one
/// instance can be shared freely between request handlers and workers.
#[derive(Debug, Clone)]
pub struct SqliteVisitStore {
    db_path: Arc<PathBuf>,
}

impl SqliteVisitStore {
    /// Opens the store at the default location in the user's data directory.
    pub fn new() -> crate::error::Result<Self> {
        Self::new_with_path(Self::default_path()?)
    }

    /// Returns `visits.db` inside the platform data directory.
    pub fn default_path() -> crate::error::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "visitstream", "visitstream")
            .ok_or_else(|| StoreError::Unavailable("Could not determine data directory".into()))?;
        Ok(proj_dirs.data_dir().join("visits.db"))
    }

    /// Opens (and if needed creates) the store at `db_path`.
    ///
    /// # Examples
    ///
    /// ```
    /// use visitstream::storage::SqliteVisitStore;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let store = SqliteVisitStore::new_with_path(dir.path().join("visits.db")).unwrap();
    /// assert!(store.db_path().ends_with("visits.db"));
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> crate::error::Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        init(&db_path)?;
        debug!(db_path = %db_path.display(), "Visit store ready");

        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn open(db_path: &Path) -> Result<Connection, StoreError> {
    Connection::open(db_path).map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn init(db_path: &Path) -> Result<(), StoreError> {
    let conn = open(db_path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS visits (
            origin_key TEXT NOT NULL,
            visited_at INTEGER NOT NULL,
            weekday TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_visits_key_time ON visits (origin_key, visited_at);
        CREATE INDEX IF NOT EXISTS idx_visits_weekday ON visits (weekday);",
    )
    .map_err(|e| StoreError::Unavailable(format!("Failed to create tables: {}", e)))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", micros)))
}

fn query_err(e: rusqlite::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

#[async_trait]
impl VisitStore for SqliteVisitStore {
    async fn insert_event(&self, event: &VisitEvent) -> Result<(), StoreError> {
        let origin_key = event.origin_key().to_string();
        let visited_at = event.visited_at().timestamp_micros();
        let weekday = event.weekday().to_string();

        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO visits (origin_key, visited_at, weekday) VALUES (?1, ?2, ?3)",
                params![origin_key, visited_at, weekday],
            )
            .map_err(query_err)?;
            Ok(())
        })
        .await
    }

    async fn get_visits(&self) -> Result<VisitsByKey, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT origin_key, visited_at FROM visits")
                .map_err(query_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(query_err)?;

            let mut visits = VisitsByKey::new();
            for row in rows {
                let (key, micros) = row.map_err(query_err)?;
                visits.entry(key).or_default().push(from_micros(micros)?);
            }
            Ok(visits)
        })
        .await
    }

    async fn get_visits_by_key(
        &self,
        key: &str,
        weekday: Option<&str>,
        gt: Option<DateTime<Utc>>,
        lt: Option<DateTime<Utc>>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let mut sql = String::from("SELECT visited_at FROM visits WHERE origin_key = ?");
        let mut args = vec![Value::Text(key.to_string())];

        if let Some(day) = weekday {
            sql.push_str(" AND weekday = ?");
            args.push(Value::Text(day.to_string()));
        }
        if let Some(gt) = gt {
            sql.push_str(" AND visited_at >= ?");
            args.push(Value::Integer(gt.timestamp_micros()));
        }
        if let Some(lt) = lt {
            sql.push_str(" AND visited_at <= ?");
            args.push(Value::Integer(lt.timestamp_micros()));
        }
        sql.push_str(" ORDER BY visited_at");

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(query_err)?;
            let rows = stmt
                .query_map(params_from_iter(args), |row| row.get::<_, i64>(0))
                .map_err(query_err)?;

            let mut visits = Vec::new();
            for row in rows {
                visits.push(from_micros(row.map_err(query_err)?)?);
            }
            Ok(visits)
        })
        .await
    }
}
