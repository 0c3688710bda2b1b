//! SQLite metadata store: chunk rows, slot tombstones, directory registry.
//!
//! Tables:
//! - `chunks`: one row per `(source_id, chunk_index)`, pointing at a vector slot
//! - `tombstones`: slots whose vector no row references any more
//! - `directories`: scanned root directories and their status
//!
//! Transactions are explicit ([`MetadataStore::begin`] / `commit` /
//! `rollback`) so the coordinator can keep a metadata transaction open while
//! it mutates the vector index. Mutating helpers join an open transaction or
//! wrap their own.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags, OptionalExtension, ToSql, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::vector_index::Slot;
use crate::{Error, Result};

/// Metadata attached to a chunk.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// A chunk row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub source_id: String,
    pub chunk_index: u64,
    pub text: String,
    pub metadata: Metadata,
    pub slot: Slot,
}

/// Why a slot was tombstoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TombstoneReason {
    /// The row was re-inserted and now points at a newer slot
    Replaced,
    /// The row was deleted (document or directory removal)
    Removed,
}

impl TombstoneReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::Removed => "removed",
        }
    }
}

/// A registered root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRegistration {
    pub path: String,
    pub enabled: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub doc_count: u64,
}

/// Counts from a batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub replaced: usize,
}

/// Persistent metadata store.
pub struct MetadataStore {
    conn: Connection,
    path: PathBuf,
    in_transaction: bool,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            in_transaction: false,
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Transactions ────────────────────────────────────────────────────

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Start a write transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::TransactionState(
                "begin called while a transaction is open".to_string(),
            ));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::TransactionState(
                "commit called without an open transaction".to_string(),
            ));
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::TransactionState(
                "rollback called without an open transaction".to_string(),
            ));
        }
        // Whatever happens, SQLite has no usable transaction left after this.
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Run `f` inside the open transaction, or inside a fresh one that is
    /// committed on success and rolled back on error.
    fn within_transaction<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.in_transaction {
            return f(&self.conn);
        }
        self.begin()?;
        match f(&self.conn) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(error = %rollback_err, "Metadata rollback failed");
                }
                Err(err)
            }
        }
    }

    // ── Chunks ──────────────────────────────────────────────────────────

    /// Insert or replace one chunk row. A displaced slot is tombstoned.
    pub fn upsert_chunk(
        &mut self,
        source_id: &str,
        chunk_index: u64,
        text: &str,
        metadata: &Metadata,
        slot: Slot,
    ) -> Result<UpsertSummary> {
        let now = now_epoch_seconds();
        self.within_transaction(|conn| {
            upsert_row(conn, source_id, chunk_index, text, metadata, slot, now)
        })
    }

    /// Insert or replace many chunk rows in one transaction.
    pub fn upsert_chunks_batch(&mut self, rows: &[ChunkRecord]) -> Result<UpsertSummary> {
        let now = now_epoch_seconds();
        self.within_transaction(|conn| {
            let mut summary = UpsertSummary::default();
            for row in rows {
                let one = upsert_row(
                    conn,
                    &row.source_id,
                    row.chunk_index,
                    &row.text,
                    &row.metadata,
                    row.slot,
                    now,
                )?;
                summary.inserted += one.inserted;
                summary.replaced += one.replaced;
            }
            Ok(summary)
        })
    }

    /// Row referencing `slot`, if any.
    pub fn lookup_by_slot(&self, slot: Slot) -> Result<Option<ChunkRecord>> {
        let slot = u64_to_i64(slot, "slot")?;
        self.conn
            .query_row(
                "SELECT source_id, chunk_index, text, metadata, slot
                 FROM chunks
                 WHERE slot = ?1
                 ORDER BY source_id, chunk_index
                 LIMIT 1",
                params![slot],
                decode_chunk_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// All rows for one source, in chunk order.
    pub fn chunks_for_source(&self, source_id: &str) -> Result<Vec<ChunkRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_id, chunk_index, text, metadata, slot
             FROM chunks
             WHERE source_id = ?1
             ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![source_id], decode_chunk_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Delete every row of `source_id`, tombstoning the freed slots.
    pub fn delete_by_source(&mut self, source_id: &str) -> Result<Vec<Slot>> {
        let now = now_epoch_seconds();
        self.within_transaction(|conn| {
            delete_matching(
                conn,
                "SELECT slot FROM chunks WHERE source_id = ?1 ORDER BY slot",
                "DELETE FROM chunks WHERE source_id = ?1",
                params![source_id],
                now,
            )
        })
    }

    /// Delete the rows of `source_id` whose chunk index is `keep_chunks` or
    /// higher, tombstoning the freed slots.
    pub fn truncate_source(&mut self, source_id: &str, keep_chunks: u64) -> Result<Vec<Slot>> {
        let keep_chunks = u64_to_i64(keep_chunks, "chunk_index")?;
        let now = now_epoch_seconds();
        self.within_transaction(|conn| {
            delete_matching(
                conn,
                "SELECT slot FROM chunks WHERE source_id = ?1 AND chunk_index >= ?2 ORDER BY slot",
                "DELETE FROM chunks WHERE source_id = ?1 AND chunk_index >= ?2",
                params![source_id, keep_chunks],
                now,
            )
        })
    }

    /// Number of distinct slots referenced by rows.
    pub fn count_distinct_slots(&self) -> Result<u64> {
        self.count("SELECT COUNT(DISTINCT slot) FROM chunks")
    }

    /// Number of chunk rows.
    pub fn count_rows(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM chunks")
    }

    /// Smallest and largest referenced slot.
    pub fn slot_range(&self) -> Result<Option<(Slot, Slot)>> {
        self.range("SELECT MIN(slot), MAX(slot) FROM chunks")
    }

    /// Slots referenced by more than one row.
    pub fn duplicate_slots(&self) -> Result<Vec<Slot>> {
        self.slots("SELECT slot FROM chunks GROUP BY slot HAVING COUNT(*) > 1 ORDER BY slot")
    }

    /// Distinct referenced slots, ascending.
    pub fn live_slots(&self) -> Result<Vec<Slot>> {
        self.slots("SELECT DISTINCT slot FROM chunks ORDER BY slot")
    }

    /// Distinct source ids, sorted.
    pub fn source_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT source_id FROM chunks ORDER BY source_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Delete all chunk rows and tombstones. Directories are kept.
    pub fn clear_chunks(&mut self) -> Result<()> {
        self.within_transaction(|conn| {
            conn.execute("DELETE FROM chunks", [])?;
            conn.execute("DELETE FROM tombstones", [])?;
            Ok(())
        })
    }

    /// Move the rows at `keep[i]` to slot `i` and drop every tombstone.
    ///
    /// `keep` must be strictly ascending, which makes each new slot no
    /// larger than its old one so the in-place updates never collide.
    pub fn renumber_slots(&mut self, keep: &[Slot]) -> Result<usize> {
        if keep.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidPayload(
                "renumber_slots requires strictly ascending slots".to_string(),
            ));
        }
        self.within_transaction(|conn| {
            let mut moved = 0;
            let mut stmt = conn.prepare("UPDATE chunks SET slot = ?2 WHERE slot = ?1")?;
            for (new_slot, &old_slot) in keep.iter().enumerate() {
                let new_slot = usize_to_i64(new_slot, "slot")?;
                let old_slot = u64_to_i64(old_slot, "slot")?;
                if new_slot != old_slot {
                    moved += stmt.execute(params![old_slot, new_slot])?;
                }
            }
            conn.execute("DELETE FROM tombstones", [])?;
            Ok(moved)
        })
    }

    // ── Tombstones ──────────────────────────────────────────────────────

    pub fn is_tombstoned(&self, slot: Slot) -> Result<bool> {
        let slot = u64_to_i64(slot, "slot")?;
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tombstones WHERE slot = ?1)",
            params![slot],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    pub fn tombstone_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM tombstones")
    }

    pub fn tombstoned_slots(&self) -> Result<Vec<Slot>> {
        self.slots("SELECT slot FROM tombstones ORDER BY slot")
    }

    pub fn tombstone_range(&self) -> Result<Option<(Slot, Slot)>> {
        self.range("SELECT MIN(slot), MAX(slot) FROM tombstones")
    }

    /// Slots that are both tombstoned and referenced by a row.
    pub fn overlapping_tombstones(&self) -> Result<Vec<Slot>> {
        self.slots(
            "SELECT t.slot FROM tombstones t
             WHERE EXISTS(SELECT 1 FROM chunks c WHERE c.slot = t.slot)
             ORDER BY t.slot",
        )
    }

    // ── Directory registry ──────────────────────────────────────────────

    /// Register a directory (enabled, no documents yet). Returns false if it
    /// was already registered.
    pub fn add_directory(&mut self, path: &str) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO directories (path, enabled, last_update, doc_count)
             VALUES (?1, 1, NULL, 0)",
            params![path],
        )?;
        Ok(inserted == 1)
    }

    /// Unregister `path` and delete every chunk at or beneath it,
    /// tombstoning the freed slots.
    ///
    /// A bare separator (`/`) is the filesystem root and matches every
    /// absolute source id.
    pub fn remove_directory(&mut self, path: &str) -> Result<Vec<Slot>> {
        if path.is_empty() {
            return Err(Error::InvalidPayload("directory path is empty".to_string()));
        }
        let root = normalize_root(path);
        let now = now_epoch_seconds();
        self.within_transaction(|conn| {
            conn.execute(
                "DELETE FROM directories WHERE path = ?1 OR path = ?2",
                params![path, root],
            )?;
            delete_matching(
                conn,
                "SELECT slot FROM chunks
                 WHERE source_id = ?1
                    OR substr(source_id, 1, length(?1) + 1) IN (?1 || '/', ?1 || '\\')
                 ORDER BY slot",
                "DELETE FROM chunks
                 WHERE source_id = ?1
                    OR substr(source_id, 1, length(?1) + 1) IN (?1 || '/', ?1 || '\\')",
                params![root],
                now,
            )
        })
    }

    /// Create or update a directory's status.
    pub fn set_directory_status(
        &mut self,
        path: &str,
        enabled: bool,
        last_update: Option<DateTime<Utc>>,
        doc_count: u64,
    ) -> Result<()> {
        let doc_count = u64_to_i64(doc_count, "doc_count")?;
        self.conn.execute(
            "INSERT INTO directories (path, enabled, last_update, doc_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
                enabled = excluded.enabled,
                last_update = excluded.last_update,
                doc_count = excluded.doc_count",
            params![
                path,
                enabled,
                last_update.map(|t| t.to_rfc3339()),
                doc_count
            ],
        )?;
        Ok(())
    }

    pub fn directory(&self, path: &str) -> Result<Option<DirectoryRegistration>> {
        self.conn
            .query_row(
                "SELECT path, enabled, last_update, doc_count FROM directories WHERE path = ?1",
                params![path],
                decode_directory_row,
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn list_directories(&self) -> Result<Vec<DirectoryRegistration>> {
        self.directories("SELECT path, enabled, last_update, doc_count FROM directories ORDER BY path")
    }

    pub fn enabled_directories(&self) -> Result<Vec<DirectoryRegistration>> {
        self.directories(
            "SELECT path, enabled, last_update, doc_count FROM directories
             WHERE enabled = 1 ORDER BY path",
        )
    }

    // ── Staged index marker ─────────────────────────────────────────────

    /// Record that a rewritten index file of `vector_count` vectors waits
    /// next to the live one. Written in the same transaction as the slot
    /// renumbering it belongs to.
    pub fn mark_staged_index(&mut self, vector_count: u64) -> Result<()> {
        let vector_count = u64_to_i64(vector_count, "vector_count")?;
        let now = now_epoch_seconds();
        self.within_transaction(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO staged_index (id, vector_count, created_at)
                 VALUES (1, ?1, ?2)",
                params![vector_count, now],
            )?;
            Ok(())
        })
    }

    /// Vector count of the pending staged index, if any.
    pub fn staged_index(&self) -> Result<Option<u64>> {
        let count: Option<i64> = self
            .conn
            .query_row("SELECT vector_count FROM staged_index WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        count.map(|n| i64_to_u64(n, "vector_count")).transpose()
    }

    pub fn clear_staged_index(&mut self) -> Result<()> {
        self.within_transaction(|conn| {
            conn.execute("DELETE FROM staged_index", [])?;
            Ok(())
        })
    }

    // ── Whole-database operations ───────────────────────────────────────

    /// Copy the live database to `dest` with SQLite's online backup API.
    pub fn backup_to(&self, dest: &Path) -> Result<()> {
        let mut dest_conn = Connection::open(dest)?;
        run_backup(&self.conn, &mut dest_conn)?;
        debug!(path = %dest.display(), "Metadata backup written");
        Ok(())
    }

    /// Replace the live database contents with the database at `src`.
    pub fn restore_from(&mut self, src: &Path) -> Result<()> {
        if self.in_transaction {
            return Err(Error::TransactionState(
                "restore attempted inside a transaction".to_string(),
            ));
        }
        let src_conn = Connection::open_with_flags(src, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        run_backup(&src_conn, &mut self.conn)?;
        // Snapshots from older layouts may lack the auxiliary tables.
        self.conn.execute_batch(SCHEMA_SQL)?;
        debug!(path = %src.display(), "Metadata restored");
        Ok(())
    }

    /// `PRAGMA integrity_check` on the live database.
    pub fn integrity_check(&self) -> Result<()> {
        integrity_check(&self.conn)
    }

    /// Check that the file at `path` is a healthy database holding a
    /// `chunks` table, without modifying it.
    pub fn verify_file(path: &Path) -> Result<()> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        integrity_check(&conn)?;
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('chunks')")?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for required in ["source_id", "chunk_index", "text", "metadata", "slot"] {
            if !columns.iter().any(|c| c == required) {
                return Err(Error::TransferFailure(format!(
                    "{} has no chunks.{required} column",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    // ── Query helpers ───────────────────────────────────────────────────

    fn count(&self, sql: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        i64_to_u64(n, "count")
    }

    fn range(&self, sql: &str) -> Result<Option<(Slot, Slot)>> {
        let (min, max): (Option<i64>, Option<i64>) =
            self.conn
                .query_row(sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
        match (min, max) {
            (Some(min), Some(max)) => Ok(Some((i64_to_u64(min, "slot")?, i64_to_u64(max, "slot")?))),
            _ => Ok(None),
        }
    }

    fn slots(&self, sql: &str) -> Result<Vec<Slot>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(i64_to_u64(row?, "slot")?);
        }
        Ok(out)
    }

    fn directories(&self, sql: &str) -> Result<Vec<DirectoryRegistration>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], decode_directory_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS chunks (
    source_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    slot INTEGER NOT NULL CHECK(slot >= 0),
    updated_at INTEGER NOT NULL,
    PRIMARY KEY(source_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_slot ON chunks(slot);

CREATE TABLE IF NOT EXISTS tombstones (
    slot INTEGER PRIMARY KEY CHECK(slot >= 0),
    reason TEXT NOT NULL CHECK(reason IN ('replaced', 'removed')),
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS staged_index (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    vector_count INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS directories (
    path TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_update TEXT,
    doc_count INTEGER NOT NULL DEFAULT 0
);
";

fn upsert_row(
    conn: &Connection,
    source_id: &str,
    chunk_index: u64,
    text: &str,
    metadata: &Metadata,
    slot: Slot,
    now: i64,
) -> Result<UpsertSummary> {
    let chunk_index = u64_to_i64(chunk_index, "chunk_index")?;
    let slot = u64_to_i64(slot, "slot")?;
    let metadata_json = serde_json::to_string(metadata)?;

    let displaced: Option<i64> = conn
        .query_row(
            "SELECT slot FROM chunks WHERE source_id = ?1 AND chunk_index = ?2",
            params![source_id, chunk_index],
            |row| row.get(0),
        )
        .optional()?;

    conn.execute(
        "INSERT INTO chunks (source_id, chunk_index, text, metadata, slot, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(source_id, chunk_index) DO UPDATE SET
            text = excluded.text,
            metadata = excluded.metadata,
            slot = excluded.slot,
            updated_at = excluded.updated_at",
        params![source_id, chunk_index, text, metadata_json, slot, now],
    )?;

    match displaced {
        Some(old) if old != slot => {
            tombstone(conn, old, TombstoneReason::Replaced, now)?;
            Ok(UpsertSummary {
                inserted: 0,
                replaced: 1,
            })
        }
        Some(_) => Ok(UpsertSummary {
            inserted: 0,
            replaced: 1,
        }),
        None => Ok(UpsertSummary {
            inserted: 1,
            replaced: 0,
        }),
    }
}

fn tombstone(conn: &Connection, slot: i64, reason: TombstoneReason, now: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tombstones (slot, reason, created_at) VALUES (?1, ?2, ?3)",
        params![slot, reason.as_str(), now],
    )?;
    Ok(())
}

/// Collect the slots selected by `select_sql`, run `delete_sql`, and
/// tombstone the slots no remaining row references.
fn delete_matching(
    conn: &Connection,
    select_sql: &str,
    delete_sql: &str,
    args: &[&dyn ToSql],
    now: i64,
) -> Result<Vec<Slot>> {
    let mut stmt = conn.prepare(select_sql)?;
    let slots = stmt
        .query_map(args, |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    conn.execute(delete_sql, args)?;

    let mut freed = Vec::with_capacity(slots.len());
    for slot in slots {
        let still_referenced: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM chunks WHERE slot = ?1)",
            params![slot],
            |row| row.get(0),
        )?;
        if still_referenced == 0 {
            tombstone(conn, slot, TombstoneReason::Removed, now)?;
            freed.push(i64_to_u64(slot, "slot")?);
        }
    }
    freed.dedup();
    Ok(freed)
}

fn run_backup(src: &Connection, dest: &mut Connection) -> Result<()> {
    let backup = Backup::new(src, dest)?;
    match backup.step(-1)? {
        StepResult::Done => Ok(()),
        other => Err(Error::Io(std::io::Error::other(format!(
            "online backup did not complete: {other:?}"
        )))),
    }
}

fn integrity_check(conn: &Connection) -> Result<()> {
    let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if result == "ok" {
        Ok(())
    } else {
        Err(Error::TransferFailure(format!(
            "integrity check returned: {result}"
        )))
    }
}

/// Strip trailing path separators so `docs/` and `docs` name the same root.
/// The filesystem root becomes the empty prefix.
fn normalize_root(path: &str) -> String {
    path.trim_end_matches(['/', '\\']).to_string()
}

fn decode_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let chunk_index: i64 = row.get(1)?;
    let metadata_raw: String = row.get(3)?;
    let slot: i64 = row.get(4)?;
    let metadata: Metadata = serde_json::from_str(&metadata_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(ChunkRecord {
        source_id: row.get(0)?,
        chunk_index: u64::try_from(chunk_index)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(1, chunk_index))?,
        text: row.get(2)?,
        metadata,
        slot: u64::try_from(slot).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(4, slot))?,
    })
}

fn decode_directory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectoryRegistration> {
    let last_update_raw: Option<String> = row.get(2)?;
    let last_update = last_update_raw
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })
        })
        .transpose()?;
    let doc_count: i64 = row.get(3)?;
    Ok(DirectoryRegistration {
        path: row.get(0)?,
        enabled: row.get(1)?,
        last_update,
        doc_count: u64::try_from(doc_count)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, doc_count))?,
    })
}

fn now_epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

fn usize_to_i64(value: usize, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidPayload(format!("{field} out of range")))
}

fn u64_to_i64(value: u64, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidPayload(format!("{field} out of range")))
}

fn i64_to_u64(value: i64, field: &'static str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::ConsistencyViolation(format!("negative {field} in database: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("documents.db")).unwrap();
        (dir, store)
    }

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    fn record(source_id: &str, chunk_index: u64, slot: Slot) -> ChunkRecord {
        ChunkRecord {
            source_id: source_id.to_string(),
            chunk_index,
            text: format!("{source_id}#{chunk_index}"),
            metadata: meta(json!({"page": chunk_index})),
            slot,
        }
    }

    #[test]
    fn upsert_and_lookup() {
        let (_dir, mut store) = store();
        store
            .upsert_chunk("a.txt", 0, "hello", &meta(json!({"k": "v"})), 0)
            .unwrap();
        let row = store.lookup_by_slot(0).unwrap().unwrap();
        assert_eq!(row.source_id, "a.txt");
        assert_eq!(row.text, "hello");
        assert_eq!(row.metadata.get("k"), Some(&json!("v")));
        assert!(store.lookup_by_slot(1).unwrap().is_none());
    }

    #[test]
    fn reinsert_tombstones_displaced_slot() {
        let (_dir, mut store) = store();
        store.upsert_chunks_batch(&[record("a", 0, 0)]).unwrap();
        let summary = store.upsert_chunks_batch(&[record("a", 0, 1)]).unwrap();
        assert_eq!(summary, UpsertSummary { inserted: 0, replaced: 1 });
        assert_eq!(store.count_distinct_slots().unwrap(), 1);
        assert_eq!(store.tombstoned_slots().unwrap(), vec![0]);
        assert!(store.is_tombstoned(0).unwrap());
        assert!(store.overlapping_tombstones().unwrap().is_empty());
    }

    #[test]
    fn nested_begin_is_rejected() {
        let (_dir, mut store) = store();
        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(Error::TransactionState(_))));
        store.rollback().unwrap();
        assert!(matches!(store.commit(), Err(Error::TransactionState(_))));
        assert!(matches!(store.rollback(), Err(Error::TransactionState(_))));
    }

    #[test]
    fn batch_joins_open_transaction_and_rolls_back() {
        let (_dir, mut store) = store();
        store.begin().unwrap();
        store
            .upsert_chunks_batch(&[record("a", 0, 0), record("a", 1, 1)])
            .unwrap();
        assert!(store.in_transaction());
        store.rollback().unwrap();
        assert_eq!(store.count_rows().unwrap(), 0);
    }

    #[test]
    fn slot_range_and_counts() {
        let (_dir, mut store) = store();
        assert_eq!(store.slot_range().unwrap(), None);
        store
            .upsert_chunks_batch(&[record("a", 0, 3), record("b", 0, 5)])
            .unwrap();
        assert_eq!(store.slot_range().unwrap(), Some((3, 5)));
        assert_eq!(store.count_rows().unwrap(), 2);
        assert_eq!(store.source_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn delete_by_source_frees_slots() {
        let (_dir, mut store) = store();
        store
            .upsert_chunks_batch(&[record("a", 0, 0), record("a", 1, 1), record("b", 0, 2)])
            .unwrap();
        let freed = store.delete_by_source("a").unwrap();
        assert_eq!(freed, vec![0, 1]);
        assert_eq!(store.tombstone_range().unwrap(), Some((0, 1)));
        assert_eq!(store.chunks_for_source("b").unwrap().len(), 1);
    }

    #[test]
    fn truncate_source_drops_trailing_chunks() {
        let (_dir, mut store) = store();
        store
            .upsert_chunks_batch(&[record("a", 0, 0), record("a", 1, 1), record("a", 2, 2)])
            .unwrap();
        assert_eq!(store.truncate_source("a", 1).unwrap(), vec![1, 2]);
        assert_eq!(store.chunks_for_source("a").unwrap().len(), 1);
        assert!(store.truncate_source("a", 1).unwrap().is_empty());
    }

    #[test]
    fn remove_directory_cascades_only_beneath_root() {
        let (_dir, mut store) = store();
        store.add_directory("/docs").unwrap();
        store
            .upsert_chunks_batch(&[
                record("/docs/a.txt", 0, 0),
                record("/docs/sub/b.txt", 0, 1),
                record("/docs2/c.txt", 0, 2),
                record("/docs", 0, 3),
                record("C:\\x", 0, 4),
            ])
            .unwrap();
        let freed = store.remove_directory("/docs/").unwrap();
        assert_eq!(freed, vec![0, 1, 3]);
        assert_eq!(store.source_ids().unwrap(), vec!["/docs2/c.txt", "C:\\x"]);
        assert!(store.list_directories().unwrap().is_empty());
    }

    #[test]
    fn remove_directory_handles_backslash_roots() {
        let (_dir, mut store) = store();
        store
            .upsert_chunks_batch(&[record("C:\\docs\\a.txt", 0, 0), record("C:\\docsx", 0, 1)])
            .unwrap();
        assert_eq!(store.remove_directory("C:\\docs").unwrap(), vec![0]);
    }

    #[test]
    fn directory_status_roundtrip() {
        let (_dir, mut store) = store();
        assert!(store.add_directory("/docs").unwrap());
        assert!(!store.add_directory("/docs").unwrap());
        let when = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        store
            .set_directory_status("/docs", false, Some(when), 12)
            .unwrap();
        store.add_directory("/notes").unwrap();

        let dir = store.directory("/docs").unwrap().unwrap();
        assert!(!dir.enabled);
        assert_eq!(dir.last_update, Some(when));
        assert_eq!(dir.doc_count, 12);
        let enabled: Vec<String> = store
            .enabled_directories()
            .unwrap()
            .into_iter()
            .map(|d| d.path)
            .collect();
        assert_eq!(enabled, vec!["/notes"]);
    }

    #[test]
    fn clear_chunks_keeps_directories() {
        let (_dir, mut store) = store();
        store.add_directory("/docs").unwrap();
        store.upsert_chunks_batch(&[record("a", 0, 0)]).unwrap();
        store.upsert_chunks_batch(&[record("a", 0, 1)]).unwrap();
        store.clear_chunks().unwrap();
        assert_eq!(store.count_rows().unwrap(), 0);
        assert_eq!(store.tombstone_count().unwrap(), 0);
        assert_eq!(store.list_directories().unwrap().len(), 1);
    }

    #[test]
    fn renumber_slots_compacts() {
        let (_dir, mut store) = store();
        store
            .upsert_chunks_batch(&[record("a", 0, 1), record("b", 0, 3), record("c", 0, 4)])
            .unwrap();
        store.delete_by_source("b").unwrap();
        let live = store.live_slots().unwrap();
        assert_eq!(live, vec![1, 4]);
        store.renumber_slots(&live).unwrap();
        assert_eq!(store.live_slots().unwrap(), vec![0, 1]);
        assert_eq!(store.lookup_by_slot(1).unwrap().unwrap().source_id, "c");
        assert_eq!(store.tombstone_count().unwrap(), 0);
        assert!(store.renumber_slots(&[2, 1]).is_err());
    }

    #[test]
    fn backup_restore_and_verify() {
        let (dir, mut store) = store();
        store.upsert_chunks_batch(&[record("a", 0, 0)]).unwrap();
        let copy = dir.path().join("copy.db");
        store.backup_to(&copy).unwrap();
        MetadataStore::verify_file(&copy).unwrap();

        store.clear_chunks().unwrap();
        store.restore_from(&copy).unwrap();
        assert_eq!(store.count_rows().unwrap(), 1);
        store.integrity_check().unwrap();
    }

    #[test]
    fn verify_file_rejects_foreign_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE notes (id INTEGER);").unwrap();
        drop(conn);
        assert!(matches!(
            MetadataStore::verify_file(&path),
            Err(Error::TransferFailure(_))
        ));
    }

    #[test]
    fn normalize_root_trims_separators() {
        assert_eq!(normalize_root("/docs//"), "/docs");
        assert_eq!(normalize_root("C:\\docs\\"), "C:\\docs");
        assert_eq!(normalize_root("/"), "");
    }

    #[test]
    fn remove_filesystem_root_cascades_everything_absolute() {
        let (_dir, mut store) = store();
        store.add_directory("/").unwrap();
        store
            .upsert_chunks_batch(&[
                record("/docs/a.txt", 0, 0),
                record("/b.txt", 0, 1),
                record("\\\\share\\c.txt", 0, 2),
            ])
            .unwrap();
        assert_eq!(store.remove_directory("/").unwrap(), vec![0, 1, 2]);
        assert_eq!(store.count_rows().unwrap(), 0);
        assert_eq!(store.tombstone_count().unwrap(), 3);
        assert!(store.list_directories().unwrap().is_empty());
    }

    #[test]
    fn remove_empty_directory_path_is_rejected() {
        let (_dir, mut store) = store();
        store.upsert_chunks_batch(&[record("/a.txt", 0, 0)]).unwrap();
        assert!(matches!(
            store.remove_directory(""),
            Err(Error::InvalidPayload(_))
        ));
        assert_eq!(store.count_rows().unwrap(), 1);
    }

    #[test]
    fn staged_index_marker_roundtrip() {
        let (_dir, mut store) = store();
        assert_eq!(store.staged_index().unwrap(), None);
        store.begin().unwrap();
        store.mark_staged_index(7).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.staged_index().unwrap(), None);

        store.mark_staged_index(7).unwrap();
        assert_eq!(store.staged_index().unwrap(), Some(7));
        store.clear_staged_index().unwrap();
        assert_eq!(store.staged_index().unwrap(), None);
    }
}
