//! Persistence store: one JSON blob per named collection in SQLite.
//!
//! Every write is a single transaction over one blob and is durable on commit.
//! Committed writes are announced on a broadcast channel so observers (session
//! watchers, dashboards) never need to poll.

pub mod collection;

pub use collection::Collection;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::model::{CalendarEntry, PipelineItem, User};

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {collection} blob: {source}")]
    Json {
        collection: Collection,
        #[source]
        source: serde_json::Error,
    },
    #[error("rejected import into {collection}: {reason}")]
    Validation {
        collection: Collection,
        reason: String,
    },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Records addressable by a stable identifier.
pub trait Identified {
    fn id(&self) -> &str;
}

impl Identified for CalendarEntry {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for PipelineItem {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for User {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Emitted after a write to `collection` has been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreEvent {
    pub collection: Collection,
}

#[derive(Clone)]
pub struct Store {
    pool: Pool,
    events: broadcast::Sender<StoreEvent>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { pool, events }
    }

    /// Open (creating if needed) the database at `database_url` and migrate it.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// A private in-memory store on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Receive an event for every committed write.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, collection: Collection) {
        // No subscribers is the common case.
        let _ = self.events.send(StoreEvent { collection });
    }

    /// Full ordered collection; empty when the key has never been written.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn list<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>> {
        let raw = self.export_raw(collection).await?;
        match raw {
            Some(raw) => decode(collection, &raw),
            None => Ok(Vec::new()),
        }
    }

    /// Record with the given id, if present.
    pub async fn get<T>(&self, collection: Collection, id: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Identified,
    {
        let records: Vec<T> = self.list(collection).await?;
        Ok(records.into_iter().find(|r| r.id() == id))
    }

    /// Add to the end of the collection. No de-duplication.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn append<T>(&self, collection: Collection, record: &T) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        self.mutate_list(collection, |records: &mut Vec<T>| {
            records.push(record.clone());
            (true, ())
        })
        .await
    }

    /// Replace the first record matching `same_key` in place, else append.
    /// Returns `true` when a new record was added.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn upsert<T, F>(&self, collection: Collection, record: &T, same_key: F) -> Result<bool>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: Fn(&T) -> bool,
    {
        self.mutate_list(collection, |records: &mut Vec<T>| {
            match records.iter().position(|r| same_key(r)) {
                Some(i) => {
                    records[i] = record.clone();
                    (true, false)
                }
                None => {
                    records.push(record.clone());
                    (true, true)
                }
            }
        })
        .await
    }

    /// Update a record in place by id. Returns `false` (and writes nothing) when
    /// the id is absent.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn replace<T>(&self, collection: Collection, record: &T) -> Result<bool>
    where
        T: Serialize + DeserializeOwned + Clone + Identified,
    {
        self.mutate_list(collection, |records: &mut Vec<T>| {
            match records.iter_mut().find(|r| r.id() == record.id()) {
                Some(existing) => {
                    *existing = record.clone();
                    (true, true)
                }
                None => (false, false),
            }
        })
        .await
    }

    /// Apply `f` to the record with `id` inside one transaction. The change is
    /// committed only when `f` returns `true`; the committed record is returned.
    #[instrument(skip_all, fields(collection = %collection, id = %id))]
    pub async fn modify<T, F>(&self, collection: Collection, id: &str, f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Identified,
        F: FnOnce(&mut T) -> bool,
    {
        self.mutate_list(collection, |records: &mut Vec<T>| {
            let Some(record) = records.iter_mut().find(|r| r.id() == id) else {
                return (false, None);
            };
            let mut candidate = record.clone();
            if f(&mut candidate) {
                *record = candidate.clone();
                (true, Some(candidate))
            } else {
                (false, None)
            }
        })
        .await
    }

    /// Delete the record with `id`. Returns how many records were removed.
    pub async fn remove<T>(&self, collection: Collection, id: &str) -> Result<usize>
    where
        T: Serialize + DeserializeOwned + Identified,
    {
        self.remove_where(collection, |r: &T| r.id() == id).await
    }

    /// Delete every record matching `pred`. Returns how many were removed.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn remove_where<T, F>(&self, collection: Collection, pred: F) -> Result<usize>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        self.mutate_list(collection, |records: &mut Vec<T>| {
            let before = records.len();
            records.retain(|r| !pred(r));
            let removed = before - records.len();
            (removed > 0, removed)
        })
        .await
    }

    /// Read a single-object key such as the active session.
    pub async fn get_value<T: DeserializeOwned>(&self, collection: Collection) -> Result<Option<T>> {
        match self.export_raw(collection).await? {
            Some(raw) => Ok(Some(decode(collection, &raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_value<T: Serialize>(&self, collection: Collection, value: &T) -> Result<()> {
        let raw = encode(collection, value)?;
        let mut tx = self.pool.begin().await?;
        write_raw(&mut tx, collection, &raw).await?;
        tx.commit().await?;
        self.notify(collection);
        Ok(())
    }

    /// Remove a key entirely. Returns whether it existed.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn delete_value(&self, collection: Collection) -> Result<bool> {
        let res = sqlx::query("DELETE FROM collections WHERE key = ?")
            .bind(collection.key())
            .execute(&self.pool)
            .await?;
        let existed = res.rows_affected() > 0;
        if existed {
            self.notify(collection);
        }
        Ok(existed)
    }

    /// Serialized form of a collection exactly as stored.
    pub async fn export_raw(&self, collection: Collection) -> Result<Option<String>> {
        let raw = sqlx::query_scalar::<_, String>("SELECT value FROM collections WHERE key = ?")
            .bind(collection.key())
            .fetch_optional(&self.pool)
            .await?;
        Ok(raw)
    }

    /// Every stored collection with its serialized form.
    pub async fn export_all(&self) -> Result<Vec<(Collection, String)>> {
        let mut out = Vec::new();
        for collection in Collection::ALL {
            if let Some(raw) = self.export_raw(collection).await? {
                out.push((collection, raw));
            }
        }
        Ok(out)
    }

    /// Overwrite a collection from an edited serialized form. Malformed input is
    /// rejected and the stored bytes stay untouched.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn import_raw(&self, collection: Collection, raw: &str) -> Result<()> {
        if let Err(err) = collection.validate(raw) {
            warn!(%err, "rejecting raw import");
            return Err(StoreError::Validation {
                collection,
                reason: err.to_string(),
            });
        }
        let mut tx = self.pool.begin().await?;
        write_raw(&mut tx, collection, raw).await?;
        tx.commit().await?;
        self.notify(collection);
        Ok(())
    }

    /// Read-modify-write of one list blob in a single transaction. `f` returns
    /// whether it changed anything plus the caller's result.
    async fn mutate_list<T, R, F>(&self, collection: Collection, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> (bool, R),
    {
        let mut tx = self.pool.begin().await?;
        let raw = sqlx::query_scalar::<_, String>("SELECT value FROM collections WHERE key = ?")
            .bind(collection.key())
            .fetch_optional(&mut *tx)
            .await?;
        let mut records: Vec<T> = match raw {
            Some(raw) => decode(collection, &raw)?,
            None => Vec::new(),
        };
        let (dirty, out) = f(&mut records);
        if dirty {
            let raw = encode(collection, &records)?;
            write_raw(&mut tx, collection, &raw).await?;
            tx.commit().await?;
            debug!(len = records.len(), "collection written");
            self.notify(collection);
        } else {
            tx.rollback().await?;
        }
        Ok(out)
    }
}

async fn write_raw(tx: &mut Transaction<'_, Sqlite>, collection: Collection, raw: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO collections (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(collection.key())
    .bind(raw)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn decode<T: DeserializeOwned>(collection: Collection, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|source| StoreError::Json { collection, source })
}

fn encode<T: Serialize + ?Sized>(collection: Collection, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|source| StoreError::Json { collection, source })
}
