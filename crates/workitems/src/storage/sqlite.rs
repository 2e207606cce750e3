//! SQLite-based record storage with zstd-compressed bodies and payloads

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use rusqlite_migration::{M, Migrations};

use super::{IntegrityError, RecordQuery, RecordStore, UpdateOutcome};
use crate::models::{
    AccountId, CanonicalRecord, CursorKey, JobLock, Payload, RecordId, RecordKey, RecordKind,
    SourceId, SyncCursor, UserId,
};
use crate::reconcile::{NewRecord, RecordFilter, RecordUpdate};

/// zstd level 3 = good balance of speed vs compression
const ZSTD_LEVEL: i32 = 3;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Canonical records, unique per (user, external id, source)
            CREATE TABLE records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                ordering_key INTEGER NOT NULL DEFAULT 0,
                section_id TEXT,
                has_been_reordered INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT,
                created_at_external TEXT,
                title TEXT NOT NULL,
                body BLOB NOT NULL,     -- zstd compressed
                deeplink TEXT,
                payload BLOB NOT NULL,  -- zstd compressed JSON
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, external_id, source_id)
            );

            CREATE INDEX idx_records_user_completed_kind
                ON records(user_id, completed, kind);

            -- One incremental cursor per (user, provider, account)
            CREATE TABLE sync_cursors (
                user_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                cursor TEXT NOT NULL,
                last_sync_at TEXT NOT NULL,
                PRIMARY KEY (user_id, source_id, account_id)
            );

            -- Write-once job locks
            CREATE TABLE job_locks (
                job_name TEXT NOT NULL,
                bucket TEXT NOT NULL,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                PRIMARY KEY (job_name, bucket)
            );
            "#,
        ),
    ])
}

const RECORD_COLUMNS: &str = "id, user_id, external_id, source_id, account_id, kind,
    ordering_key, section_id, has_been_reordered, completed, completed_at, deleted,
    deleted_at, created_at_external, title, body, deeplink, payload, created_at, updated_at";

/// A records row as stored, before decompression and decoding
struct RawRecord {
    id: i64,
    user_id: String,
    external_id: String,
    source_id: String,
    account_id: String,
    kind: String,
    ordering_key: i64,
    section_id: Option<String>,
    has_been_reordered: bool,
    completed: bool,
    completed_at: Option<String>,
    deleted: bool,
    deleted_at: Option<String>,
    created_at_external: Option<String>,
    title: String,
    body: Vec<u8>,
    deeplink: Option<String>,
    payload: Vec<u8>,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            external_id: row.get(2)?,
            source_id: row.get(3)?,
            account_id: row.get(4)?,
            kind: row.get(5)?,
            ordering_key: row.get(6)?,
            section_id: row.get(7)?,
            has_been_reordered: row.get(8)?,
            completed: row.get(9)?,
            completed_at: row.get(10)?,
            deleted: row.get(11)?,
            deleted_at: row.get(12)?,
            created_at_external: row.get(13)?,
            title: row.get(14)?,
            body: row.get(15)?,
            deeplink: row.get(16)?,
            payload: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }

    /// Decompress and decode; any mismatch is an integrity failure
    fn decode(self) -> Result<CanonicalRecord> {
        let body = decompress_text(&self.body)?;
        let payload_json = decompress_text(&self.payload)?;
        let payload: Payload = serde_json::from_str(&payload_json).map_err(|e| {
            IntegrityError(format!("record {} payload does not decode: {}", self.id, e))
        })?;

        let kind = RecordKind::parse(&self.kind)
            .ok_or_else(|| IntegrityError(format!("record {} has unknown kind {:?}", self.id, self.kind)))?;
        if kind != payload.kind() {
            return Err(IntegrityError(format!(
                "record {} is tagged {} but holds a {} payload",
                self.id,
                kind,
                payload.kind()
            ))
            .into());
        }

        Ok(CanonicalRecord {
            id: RecordId(self.id),
            user_id: UserId(self.user_id),
            external_id: self.external_id,
            source_id: SourceId::from(self.source_id),
            account_id: AccountId(self.account_id),
            ordering_key: self.ordering_key,
            section_id: self.section_id,
            has_been_reordered: self.has_been_reordered,
            completed: self.completed,
            completed_at: parse_optional_time(self.completed_at)?,
            deleted: self.deleted,
            deleted_at: parse_optional_time(self.deleted_at)?,
            created_at_external: parse_optional_time(self.created_at_external)?,
            title: self.title,
            body,
            deeplink: self.deeplink,
            payload,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn compress_text(text: &str) -> Result<Vec<u8>> {
    zstd::encode_all(text.as_bytes(), ZSTD_LEVEL).context("Failed to compress column")
}

fn decompress_text(data: &[u8]) -> Result<String> {
    let bytes = zstd::decode_all(data)
        .map_err(|e| IntegrityError(format!("failed to decompress column: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| IntegrityError(format!("column is not valid UTF-8: {}", e)).into())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IntegrityError(format!("bad timestamp {:?}: {}", s, e)).into())
}

fn parse_optional_time(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

fn encode_payload(payload: &Payload) -> Result<Vec<u8>> {
    let json = serde_json::to_string(payload).context("Failed to serialize payload")?;
    compress_text(&json)
}

/// SQLite-based record storage
///
/// Conditional writes run inside `BEGIN IMMEDIATE` transactions so that
/// other processes sharing the database file cannot interleave.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) a store at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets readers proceed during writes; busy_timeout makes
        // competing writers from other processes wait instead of failing.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_by_key(conn: &Connection, key: &RecordKey) -> Result<Option<CanonicalRecord>> {
        let sql = format!(
            "SELECT {} FROM records WHERE user_id = ? AND external_id = ? AND source_id = ?",
            RECORD_COLUMNS
        );
        let raw = conn
            .query_row(
                &sql,
                params![key.user_id.as_str(), key.external_id, key.source_id.as_str()],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    fn load_by_id(conn: &Connection, user_id: &UserId, id: RecordId) -> Result<Option<CanonicalRecord>> {
        let sql = format!(
            "SELECT {} FROM records WHERE id = ? AND user_id = ?",
            RECORD_COLUMNS
        );
        let raw = conn
            .query_row(&sql, params![id.0, user_id.as_str()], RawRecord::from_row)
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Write every mutable column of `record` back by id
    fn write_record(conn: &Connection, record: &CanonicalRecord) -> Result<()> {
        conn.execute(
            "UPDATE records SET
                account_id = ?, kind = ?, ordering_key = ?, section_id = ?,
                has_been_reordered = ?, completed = ?, completed_at = ?, deleted = ?,
                deleted_at = ?, created_at_external = ?, title = ?, body = ?, deeplink = ?,
                payload = ?, updated_at = ?
             WHERE id = ?",
            params![
                record.account_id.as_str(),
                record.kind().as_str(),
                record.ordering_key,
                record.section_id,
                record.has_been_reordered,
                record.completed,
                record.completed_at.map(|t| t.to_rfc3339()),
                record.deleted,
                record.deleted_at.map(|t| t.to_rfc3339()),
                record.created_at_external.map(|t| t.to_rfc3339()),
                record.title,
                compress_text(&record.body)?,
                record.deeplink,
                encode_payload(&record.payload)?,
                record.updated_at.to_rfc3339(),
                record.id.0,
            ],
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert_if_absent(&self, key: &RecordKey, new: &NewRecord) -> Result<bool> {
        let body = compress_text(&new.body)?;
        let payload = encode_payload(&new.payload)?;
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT INTO records
             (user_id, external_id, source_id, account_id, kind, ordering_key, section_id,
              has_been_reordered, completed, completed_at, deleted, created_at_external,
              title, body, deeplink, payload, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, external_id, source_id) DO NOTHING",
            params![
                key.user_id.as_str(),
                key.external_id,
                key.source_id.as_str(),
                new.account_id.as_str(),
                new.payload.kind().as_str(),
                new.ordering_key,
                new.section_id,
                new.completed,
                new.completed.then(|| now.clone()),
                new.created_at_external.map(|t| t.to_rfc3339()),
                new.title,
                body,
                new.deeplink,
                payload,
                now,
                now,
            ],
        )?;

        Ok(inserted == 1)
    }

    fn find_and_update(
        &self,
        key: &RecordKey,
        filters: &[RecordFilter],
        update: &RecordUpdate,
    ) -> Result<Option<UpdateOutcome>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(before) = Self::load_by_key(&tx, key)? else {
            return Ok(None);
        };
        if !RecordFilter::matches_all(filters, &before) {
            return Ok(None);
        }

        let mut after = before.clone();
        let ordering_reset = update.apply(&mut after, Utc::now())?;
        Self::write_record(&tx, &after)?;
        tx.commit()?;

        Ok(Some(UpdateOutcome {
            before,
            after,
            ordering_reset,
        }))
    }

    fn find_one(&self, key: &RecordKey, filters: &[RecordFilter]) -> Result<Option<CanonicalRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(Self::load_by_key(&conn, key)?
            .filter(|record| RecordFilter::matches_all(filters, record)))
    }

    fn get_record(&self, user_id: &UserId, id: RecordId) -> Result<Option<CanonicalRecord>> {
        let conn = self.conn.lock().unwrap();
        Self::load_by_id(&conn, user_id, id)
    }

    fn update_by_id(
        &self,
        user_id: &UserId,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<CanonicalRecord>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut record) = Self::load_by_id(&tx, user_id, id)? else {
            return Ok(None);
        };
        update.apply(&mut record, Utc::now())?;
        Self::write_record(&tx, &record)?;
        tx.commit()?;

        Ok(Some(record))
    }

    fn set_ordering(
        &self,
        user_id: &UserId,
        id: RecordId,
        ordering_key: i64,
        section_id: Option<String>,
    ) -> Result<Option<CanonicalRecord>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE records SET
                ordering_key = ?,
                has_been_reordered = 1,
                section_id = COALESCE(?, section_id),
                updated_at = ?
             WHERE id = ? AND user_id = ?",
            params![
                ordering_key,
                section_id,
                Utc::now().to_rfc3339(),
                id.0,
                user_id.as_str()
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let record = Self::load_by_id(&tx, user_id, id)?;
        tx.commit()?;
        Ok(record)
    }

    fn list_records(&self, query: &RecordQuery) -> Result<Vec<CanonicalRecord>> {
        let conn = self.conn.lock().unwrap();

        // Indexed columns narrow in SQL; source and account are checked after decoding
        let sql = format!(
            "SELECT {} FROM records
             WHERE user_id = ?1
               AND (?2 IS NULL OR completed = ?2)
               AND (?3 IS NULL OR kind = ?3)
               AND (?4 OR deleted = 0)
             ORDER BY id",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(
                params![
                    query.user_id.as_str(),
                    query.completed,
                    query.kind.map(|k| k.as_str()),
                    query.include_deleted,
                ],
                RawRecord::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(raws.len());
        for raw in raws {
            let record = raw.decode()?;
            if query.matches(&record) {
                records.push(record);
            }
        }

        Ok(records)
    }

    fn count_records(&self, query: &RecordQuery) -> Result<usize> {
        Ok(self.list_records(query)?.len())
    }

    fn get_cursor(&self, key: &CursorKey) -> Result<Option<SyncCursor>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT cursor, last_sync_at FROM sync_cursors
                 WHERE user_id = ? AND source_id = ? AND account_id = ?",
                params![key.user.as_str(), key.source.as_str(), key.account.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((cursor, last_sync_at)) = row else {
            return Ok(None);
        };

        Ok(Some(SyncCursor {
            user: key.user.clone(),
            source: key.source.clone(),
            account: key.account.clone(),
            cursor,
            last_sync_at: parse_time(&last_sync_at)?,
        }))
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_cursors (user_id, source_id, account_id, cursor, last_sync_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, source_id, account_id) DO UPDATE SET
                cursor = excluded.cursor,
                last_sync_at = excluded.last_sync_at",
            params![
                cursor.user.as_str(),
                cursor.source.as_str(),
                cursor.account.as_str(),
                cursor.cursor,
                cursor.last_sync_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_cursor(&self, key: &CursorKey) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sync_cursors WHERE user_id = ? AND source_id = ? AND account_id = ?",
            params![key.user.as_str(), key.source.as_str(), key.account.as_str()],
        )?;
        Ok(())
    }

    fn insert_job_lock(&self, lock: &JobLock) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO job_locks (job_name, bucket, holder, acquired_at) VALUES (?, ?, ?, ?)",
            params![
                lock.job_name,
                lock.bucket,
                lock.holder,
                lock.acquired_at.to_rfc3339()
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_job_lock(&self, job_name: &str, bucket: &str) -> Result<Option<JobLock>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT holder, acquired_at FROM job_locks WHERE job_name = ? AND bucket = ?",
                params![job_name, bucket],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((holder, acquired_at)) = row else {
            return Ok(None);
        };

        Ok(Some(JobLock {
            job_name: job_name.to_string(),
            bucket: bucket.to_string(),
            holder,
            acquired_at: parse_time(&acquired_at)?,
        }))
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            DELETE FROM records;
            DELETE FROM sync_cursors;
            DELETE FROM job_locks;
            "#,
        )?;
        Ok(())
    }
}
