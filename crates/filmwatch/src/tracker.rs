//! Persistent first-seen tracking.
//!
//! The store is a single SQLite table, `seen_bookable(slug, first_seen)`. A row is
//! written the first time a slug is observed and never touched again; later
//! observations of the same slug are no-ops.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};

use crate::types::{SeenRecord, format_timestamp, parse_timestamp};

// Primary result codes that mean the file could not be reached, as opposed to
// being reached and found unreadable.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_READONLY: i32 = 8;
const SQLITE_IOERR: i32 = 10;
const SQLITE_FULL: i32 = 13;
const SQLITE_CANTOPEN: i32 = 14;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS seen_bookable (
    slug TEXT PRIMARY KEY,
    first_seen TEXT NOT NULL
)";

const INSERT_IF_NEW: &str = "INSERT INTO seen_bookable (slug, first_seen) VALUES (?1, ?2)
     ON CONFLICT (slug) DO NOTHING";

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),
    #[error("Storage corrupt: {0}")]
    StorageCorrupt(String),
    #[error("Duplicate write attempt for slug '{0}'")]
    DuplicateWriteAttempt(String),
}

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        let corrupt = match &err {
            sqlx::Error::Database(db) => {
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                let transient = matches!(
                    primary,
                    Some(
                        SQLITE_BUSY
                            | SQLITE_LOCKED
                            | SQLITE_READONLY
                            | SQLITE_IOERR
                            | SQLITE_FULL
                            | SQLITE_CANTOPEN
                    )
                );
                (!transient).then(|| db.message().to_string())
            }
            sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::Protocol(_) => Some(err.to_string()),
            _ => None,
        };

        match corrupt {
            Some(detail) => TrackerError::StorageCorrupt(detail),
            None => TrackerError::StorageUnavailable(err),
        }
    }
}

impl TrackerError {
    /// Like `From<sqlx::Error>`, but a unique-constraint violation on `slug` is a
    /// lost race on the insert and is reported as such.
    fn from_write(err: sqlx::Error, slug: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                TrackerError::DuplicateWriteAttempt(slug.to_string())
            }
            _ => err.into(),
        }
    }
}

/// Key-presence-gated append store for [`SeenRecord`]s.
///
/// The pool holds a single connection, so every write in this process goes
/// through one writer.
#[derive(Debug, Clone)]
pub struct NoveltyTracker {
    pool: SqlitePool,
}

impl NoveltyTracker {
    /// Opens the store at `path`, creating the file and table when missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let path = path.as_ref();
        log::debug!("Opening seen store at {}", path.display());
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        Self::connect(options).await
    }

    pub async fn open_in_memory() -> Result<Self, TrackerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(TrackerError::StorageUnavailable)?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, TrackerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .inspect_err(|e| log::error!("Failed to open seen store: {e}"))?;

        let tracker = Self { pool };
        tracker.ensure_schema().await?;
        Ok(tracker)
    }

    async fn ensure_schema(&self) -> Result<(), TrackerError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;

        let columns = sqlx::query("PRAGMA table_info(seen_bookable)")
            .fetch_all(&self.pool)
            .await?;

        let mut layout = columns
            .iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("name")?,
                    row.try_get::<i64, _>("pk")?,
                ))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        layout.sort();

        let expected: Vec<(String, i64)> =
            vec![("first_seen".to_string(), 0), ("slug".to_string(), 1)];
        if layout != expected {
            let found = layout
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(TrackerError::StorageCorrupt(format!(
                "seen_bookable has columns ({found}), expected (slug PRIMARY KEY, first_seen)"
            )));
        }
        Ok(())
    }

    /// Records `slug` as first seen at `observed_at` unless it is already known.
    ///
    /// Returns `true` when this call inserted the record. An existing record is
    /// left untouched, whatever `observed_at` is.
    pub async fn record_if_new(
        &self,
        slug: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        let mut conn = self.pool.acquire().await?;
        let inserted = insert_if_new(&mut *conn, slug, &observed_at).await?;
        if inserted {
            log::debug!("New slug '{slug}' first seen at {observed_at}");
        }
        Ok(inserted)
    }

    /// Records a batch of candidate records in one transaction.
    ///
    /// Returns the records this batch inserted, in input order. If any write
    /// fails the transaction is rolled back and the store is left as it was.
    pub async fn record_all(
        &self,
        candidates: &[SeenRecord],
    ) -> Result<Vec<SeenRecord>, TrackerError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for candidate in candidates {
            if insert_if_new(&mut *tx, &candidate.slug, &candidate.first_seen).await? {
                inserted.push(candidate.clone());
            }
        }

        tx.commit().await?;
        log::info!(
            "Recorded {} new slug(s) out of {} observation(s)",
            inserted.len(),
            candidates.len()
        );
        Ok(inserted)
    }

    pub async fn get(&self, slug: &str) -> Result<Option<SeenRecord>, TrackerError> {
        let row = sqlx::query("SELECT slug, first_seen FROM seen_bookable WHERE slug = ?1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_record).transpose()
    }

    /// All records, oldest `first_seen` first. Ties are ordered by slug.
    pub async fn list_all(&self) -> Result<Vec<SeenRecord>, TrackerError> {
        let rows = sqlx::query("SELECT slug, first_seen FROM seen_bookable")
            .fetch_all(&self.pool)
            .await?;

        let mut records = rows
            .iter()
            .map(decode_record)
            .collect::<Result<Vec<_>, _>>()?;

        // Rows from older tooling may not share the fixed-width format, so order
        // by the parsed time rather than the stored text.
        records.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.slug.cmp(&b.slug))
        });
        Ok(records)
    }

    /// Records first seen at or after `cutoff`, oldest first.
    pub async fn seen_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SeenRecord>, TrackerError> {
        let mut records = self.list_all().await?;
        records.retain(|r| r.first_seen >= cutoff);
        Ok(records)
    }

    pub async fn count(&self) -> Result<u64, TrackerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_bookable")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Closes the store. Later calls fail with [`TrackerError::StorageUnavailable`].
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_if_new(
    conn: &mut SqliteConnection,
    slug: &str,
    observed_at: &DateTime<Utc>,
) -> Result<bool, TrackerError> {
    let stamp = format_timestamp(observed_at);
    let result = sqlx::query(INSERT_IF_NEW)
        .bind(slug)
        .bind(stamp.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| TrackerError::from_write(e, slug))?;

    let inserted = result.rows_affected() == 1;

    if cfg!(debug_assertions) && inserted {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT first_seen FROM seen_bookable WHERE slug = ?1")
                .bind(slug)
                .fetch_optional(&mut *conn)
                .await?;
        debug_assert_eq!(
            stored.as_deref().and_then(parse_timestamp),
            Some(*observed_at),
            "first_seen for '{slug}' does not read back as the observed time"
        );
    }

    Ok(inserted)
}

fn decode_record(row: &sqlx::sqlite::SqliteRow) -> Result<SeenRecord, TrackerError> {
    let slug: String = row.try_get("slug")?;
    let raw: String = row.try_get("first_seen")?;
    let first_seen = parse_timestamp(&raw).ok_or_else(|| {
        TrackerError::StorageCorrupt(format!("unreadable first_seen '{raw}' for slug '{slug}'"))
    })?;
    Ok(SeenRecord { slug, first_seen })
}
