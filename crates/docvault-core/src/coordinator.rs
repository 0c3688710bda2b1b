//! Consistency coordinator for the vector index and the metadata store.
//!
//! One [`ConsistencyCoordinator`] owns both stores behind a single mutex.
//! Every mutation either lands in both stores or in neither:
//!
//! 1. reserve `start_slot = index.size()`
//! 2. append all vectors (truncate back to `start_slot` on failure)
//! 3. write one metadata row per chunk inside a transaction
//! 4. rewrite the index file
//! 5. commit, or roll back the transaction and truncate the index
//!
//! The index file is always ahead of the committed rows: a crash between
//! steps 4 and 5 leaves vectors no row references, which search skips and
//! compaction drops. Compaction stages its rewritten index next to the live
//! one and records the staging in the same transaction as the renumbering;
//! [`ConsistencyCoordinator::open`] finishes or discards an interrupted one.
//!
//! Rows pointing past the end of the index would collide with newly
//! reserved slots, so writes are refused with
//! [`Error::ConsistencyViolation`] until the state is cleared or replaced
//! by an import.
//!
//! Invariant checked by [`ConsistencyCoordinator::audit_consistency`]: the
//! slots referenced by chunk rows and the tombstoned slots are disjoint, no
//! slot is referenced twice, and together they cover `0..index.size()`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::lock::WorkspaceLock;
use crate::metadata_store::{
    ChunkRecord, DirectoryRegistration, Metadata, MetadataStore, UpsertSummary,
};
use crate::snapshot::{self, MANIFEST_VERSION, SnapshotManifest};
use crate::vector_index::{Slot, VectorIndex};
use crate::{Error, Result};

/// Issues listed in an audit report are capped at this many slots each.
const ISSUE_SAMPLE: usize = 16;

/// One document's chunks with their vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub source_id: String,
    pub chunks: Vec<String>,
    pub vectors: Vec<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DocumentPayload {
    pub fn new(
        source_id: impl Into<String>,
        chunks: Vec<String>,
        vectors: Vec<Vec<f32>>,
        metadata: Metadata,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            chunks,
            vectors,
            metadata,
        }
    }

    fn check_shape(&self) -> Result<()> {
        if self.chunks.len() == self.vectors.len() {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                source_id: self.source_id.clone(),
                chunks: self.chunks.len(),
                vectors: self.vectors.len(),
            })
        }
    }
}

/// Where an insertion currently is. Exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Reserving,
    VectorsAppended,
    MetadataWritten,
    Committed,
    RollingBack,
}

/// Shared cancellation flag for long-running batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a committed insertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    /// First slot assigned by this batch
    pub start_slot: Slot,
    /// Number of vectors appended
    pub vectors: usize,
    /// Rows that replaced an existing `(source_id, chunk_index)`
    pub replaced: usize,
}

/// A hydrated search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub source_id: String,
    pub chunk_index: u64,
    /// `1 / (1 + distance)`
    pub similarity_score: f32,
    pub chunk_text: String,
    pub metadata: Metadata,
    pub slot: Slot,
    pub distance: f32,
}

/// A single finding of the consistency audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyIssue {
    /// Rows reference slots the index does not have
    SlotBeyondIndex { max_slot: Slot, vector_count: u64 },
    /// Tombstones name slots the index does not have
    TombstoneBeyondIndex { max_slot: Slot, vector_count: u64 },
    /// More than one row points at the same slot
    SharedSlots { slots: Vec<Slot> },
    /// A tombstoned slot is still referenced by a row
    TombstonedSlotReferenced { slots: Vec<Slot> },
    /// Vectors that neither a row nor a tombstone accounts for
    UnaccountedSlots { count: u64, sample: Vec<Slot> },
}

impl ConsistencyIssue {
    /// Issues under which a new slot reservation could reuse a slot the
    /// metadata already names.
    pub fn blocks_writes(&self) -> bool {
        matches!(
            self,
            Self::SlotBeyondIndex { .. } | Self::TombstoneBeyondIndex { .. }
        )
    }
}

impl std::fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlotBeyondIndex {
                max_slot,
                vector_count,
            } => write!(
                f,
                "rows reference slot {max_slot} but the index holds {vector_count} vectors"
            ),
            Self::TombstoneBeyondIndex {
                max_slot,
                vector_count,
            } => write!(
                f,
                "tombstone for slot {max_slot} but the index holds {vector_count} vectors"
            ),
            Self::SharedSlots { slots } => write!(f, "slots shared by several rows: {slots:?}"),
            Self::TombstonedSlotReferenced { slots } => {
                write!(f, "tombstoned slots still referenced: {slots:?}")
            }
            Self::UnaccountedSlots { count, sample } => {
                write!(f, "{count} unaccounted slots, e.g. {sample:?}")
            }
        }
    }
}

/// Read-only comparison of the two stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub ok: bool,
    pub vector_count: u64,
    pub distinct_slot_count: u64,
    pub row_count: u64,
    pub tombstone_count: u64,
    pub slot_range: Option<(Slot, Slot)>,
    pub issues: Vec<ConsistencyIssue>,
}

/// Result of an import. A failed audit after a successful swap is reported
/// as `degraded` rather than as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub report: ConsistencyReport,
    pub degraded: bool,
    pub manifest: Option<SnapshotManifest>,
    pub metadata_backup: PathBuf,
    pub index_backup: PathBuf,
}

/// Result of physically dropping tombstoned vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionOutcome {
    pub removed_vectors: usize,
    pub moved_rows: usize,
    pub vector_count: usize,
}

/// Result of removing a registered directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalOutcome {
    pub path: String,
    pub freed_slots: usize,
    pub compaction: Option<CompactionOutcome>,
}

/// Summary counters for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub dimension: usize,
    pub vector_count: u64,
    pub row_count: u64,
    pub distinct_slot_count: u64,
    pub tombstone_count: u64,
    pub source_count: u64,
    pub directory_count: u64,
    pub dirty: bool,
    pub index_path: PathBuf,
    pub metadata_path: PathBuf,
}

struct Stores {
    index: VectorIndex,
    metadata: MetadataStore,
    index_path: PathBuf,
    dirty: bool,
    state: CoordinatorState,
}

/// Owner of both stores. Share it across threads with `Arc`.
pub struct ConsistencyCoordinator {
    config: Config,
    stores: Mutex<Stores>,
    _lock: WorkspaceLock,
}

impl std::fmt::Debug for ConsistencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyCoordinator")
            .field("data_dir", &self.config.data_dir())
            .finish_non_exhaustive()
    }
}

impl ConsistencyCoordinator {
    /// Open the data directory named by `config`, locking it for this
    /// process.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let data_dir = config.data_dir();
        let lock = WorkspaceLock::acquire(&data_dir)?;

        let index_path = config.index_path();
        let mut metadata = MetadataStore::open(config.metadata_path())?;
        recover_staged_index(&mut metadata, &index_path)?;
        let index = if index_path.exists() {
            let loaded = VectorIndex::load(&index_path)?;
            if loaded.dimension() != config.storage.dimension {
                return Err(Error::DimensionMismatch {
                    expected: config.storage.dimension,
                    actual: loaded.dimension(),
                });
            }
            loaded
        } else {
            VectorIndex::new(config.storage.dimension)
        };

        let stores = Stores {
            index,
            metadata,
            index_path,
            dirty: false,
            state: CoordinatorState::Idle,
        };

        let report = stores.audit()?;
        if report.ok {
            info!(
                data_dir = %data_dir.display(),
                vectors = report.vector_count,
                rows = report.row_count,
                "Opened docvault"
            );
        } else {
            warn!(
                data_dir = %data_dir.display(),
                issues = report.issues.len(),
                "Opened docvault with an inconsistent state; run `dv audit`"
            );
            if report.issues.iter().any(ConsistencyIssue::blocks_writes) {
                warn!(
                    "Metadata references slots beyond the vector index; \
                     writes are refused until `dv clear`, `dv rebuild` or `dv import`"
                );
            }
        }

        Ok(Self {
            config,
            stores: Mutex::new(stores),
            _lock: lock,
        })
    }

    /// Flush pending index writes and release the data directory.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.storage.dimension
    }

    fn stores(&self) -> MutexGuard<'_, Stores> {
        self.stores.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CoordinatorState {
        self.stores().state
    }

    /// Rewrite the index file if an earlier write failed.
    pub fn flush(&self) -> Result<()> {
        let mut stores = self.stores();
        stores.settle_staged_index()?;
        if stores.dirty {
            stores.index.save(&stores.index_path)?;
            stores.dirty = false;
            debug!(path = %stores.index_path.display(), "Flushed vector index");
        }
        Ok(())
    }

    // ── Insertion ───────────────────────────────────────────────────────

    /// Insert all payloads atomically.
    pub fn insert_batch(&self, payloads: &[DocumentPayload]) -> Result<InsertOutcome> {
        self.insert_inner(payloads, None)
    }

    pub fn insert_one(&self, payload: &DocumentPayload) -> Result<InsertOutcome> {
        self.insert_inner(std::slice::from_ref(payload), None)
    }

    /// Like [`Self::insert_batch`], aborting and rolling back the whole
    /// batch if `cancel` is set at any payload boundary.
    pub fn insert_batch_cancellable(
        &self,
        payloads: &[DocumentPayload],
        cancel: &CancelFlag,
    ) -> Result<InsertOutcome> {
        self.insert_inner(payloads, Some(cancel))
    }

    fn insert_inner(
        &self,
        payloads: &[DocumentPayload],
        cancel: Option<&CancelFlag>,
    ) -> Result<InsertOutcome> {
        for payload in payloads {
            payload.check_shape()?;
        }
        let mut stores = self.stores();
        stores.insert(payloads, cancel)
    }

    // ── Search ──────────────────────────────────────────────────────────

    /// Nearest chunks to `query`, best first. An empty index yields no hits.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let stores = self.stores();
        // Tombstoned and unaccounted vectors are never returned.
        let dead = (stores.index.size() as u64).saturating_sub(stores.metadata.count_distinct_slots()?);
        let dead = usize::try_from(dead).unwrap_or(usize::MAX);
        let candidates = match stores.index.search(query, k.saturating_add(dead)) {
            Ok(candidates) => candidates,
            Err(Error::EmptyIndex) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut hits = Vec::with_capacity(k);
        for (slot, distance) in candidates {
            if hits.len() == k {
                break;
            }
            match stores.metadata.lookup_by_slot(slot)? {
                Some(row) => hits.push(SearchHit {
                    source_id: row.source_id,
                    chunk_index: row.chunk_index,
                    similarity_score: 1.0 / (1.0 + distance),
                    chunk_text: row.text,
                    metadata: row.metadata,
                    slot,
                    distance,
                }),
                None if stores.metadata.is_tombstoned(slot)? => {}
                None => warn!(slot, "Vector slot has no metadata row; skipping"),
            }
        }
        Ok(hits)
    }

    // ── Audit ───────────────────────────────────────────────────────────

    pub fn audit_consistency(&self) -> Result<ConsistencyReport> {
        self.stores().audit()
    }

    /// Audit and turn a failed report into [`Error::ConsistencyViolation`].
    pub fn ensure_consistent(&self) -> Result<ConsistencyReport> {
        let report = self.audit_consistency()?;
        if report.ok {
            Ok(report)
        } else {
            let summary: Vec<String> = report.issues.iter().map(ToString::to_string).collect();
            Err(Error::ConsistencyViolation(summary.join("; ")))
        }
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Write the current state to `index_path` + `metadata_path` (plus a
    /// manifest next to the index file). Live state is not modified.
    pub fn export_snapshot(&self, index_path: &Path, metadata_path: &Path) -> Result<SnapshotManifest> {
        let stores = self.stores();
        stores.reject_live_paths(index_path, metadata_path)?;
        snapshot::ensure_parent(metadata_path)?;

        let index_tmp = snapshot::write_temp(index_path, &stores.index.serialize())?;
        let metadata_tmp = snapshot::temp_path(metadata_path);
        let finished = snapshot::remove_if_exists(&metadata_tmp)
            .and_then(|()| stores.metadata.backup_to(&metadata_tmp))
            .and_then(|()| stores.manifest_for(index_path, metadata_path, &index_tmp, &metadata_tmp))
            .and_then(|manifest| {
                snapshot::rename_into_place(&index_tmp, index_path)?;
                snapshot::rename_into_place(&metadata_tmp, metadata_path)?;
                Ok(manifest)
            });
        let manifest = match finished {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = std::fs::remove_file(&index_tmp);
                let _ = std::fs::remove_file(&metadata_tmp);
                return Err(e);
            }
        };
        manifest.write(&snapshot::manifest_path(index_path))?;

        info!(
            index = %index_path.display(),
            metadata = %metadata_path.display(),
            vectors = manifest.vector_count,
            rows = manifest.row_count,
            "Snapshot exported"
        );
        Ok(manifest)
    }

    /// Replace the live state with a snapshot pair.
    ///
    /// Both files are validated before anything live is touched. The
    /// current state is backed up to `.bak` siblings; if the swap fails it
    /// is restored from them once, and a failed restore is reported as
    /// [`Error::RestoreFailed`].
    pub fn import_snapshot(&self, index_path: &Path, metadata_path: &Path) -> Result<ImportOutcome> {
        let mut stores = self.stores();
        stores.reject_live_paths(index_path, metadata_path)?;
        stores.settle_staged_index()?;

        let (imported, manifest) = validate_snapshot(index_path, metadata_path, stores.index.dimension())?;

        let metadata_backup = snapshot::bak_path(stores.metadata.path());
        let index_backup = snapshot::bak_path(&stores.index_path);
        snapshot::remove_if_exists(&metadata_backup)?;
        stores.metadata.backup_to(&metadata_backup)?;
        stores.index.save(&index_backup)?;
        debug!(
            metadata = %metadata_backup.display(),
            index = %index_backup.display(),
            "Pre-import backup written"
        );

        if let Err(original) = stores.swap_in(metadata_path, imported) {
            warn!(error = %original, "Import failed; restoring from backup");
            return match stores.restore_from_backup(&metadata_backup, &index_backup) {
                Ok(()) => Err(original),
                Err(restore) => Err(Error::RestoreFailed {
                    original: original.to_string(),
                    restore: restore.to_string(),
                }),
            };
        }

        let report = stores.audit()?;
        let degraded = !report.ok;
        if degraded {
            warn!(issues = report.issues.len(), "Imported snapshot failed the consistency audit");
        } else {
            info!(
                vectors = report.vector_count,
                rows = report.row_count,
                "Snapshot imported"
            );
        }
        Ok(ImportOutcome {
            report,
            degraded,
            manifest,
            metadata_backup,
            index_backup,
        })
    }

    // ── Destructive maintenance ─────────────────────────────────────────

    /// Drop every vector, chunk row and tombstone. Directories are kept.
    pub fn clear_all(&self) -> Result<()> {
        let mut stores = self.stores();
        stores.metadata.clear_chunks()?;
        stores.metadata.clear_staged_index()?;
        stores.index.reset();
        stores.dirty = true;
        snapshot::remove_if_exists(&snapshot::staged_path(&stores.index_path))?;
        snapshot::remove_if_exists(&stores.index_path)?;
        stores.dirty = false;
        info!("Cleared all indexed content");
        Ok(())
    }

    /// Physically remove tombstoned (and unaccounted) vectors and renumber
    /// the remaining slots densely.
    pub fn compact(&self) -> Result<CompactionOutcome> {
        self.stores().compact()
    }

    /// Delete one document's rows, tombstoning its slots.
    pub fn delete_source(&self, source_id: &str) -> Result<usize> {
        let freed = self.stores().metadata.delete_by_source(source_id)?;
        debug!(source_id, slots = freed.len(), "Deleted source");
        Ok(freed.len())
    }

    /// Unregister a directory and delete everything indexed beneath it.
    ///
    /// Compacts afterwards when `storage.auto_compact_ratio` is set and
    /// tombstones exceed that share of the index.
    pub fn remove_directory(&self, path: &str) -> Result<RemovalOutcome> {
        let mut stores = self.stores();
        let freed = stores.metadata.remove_directory(path)?;
        info!(path, slots = freed.len(), "Removed directory");

        let ratio = self.config.storage.auto_compact_ratio;
        let size = stores.index.size();
        let compaction = if ratio > 0.0 && size > 0 {
            let tombstones = stores.metadata.tombstone_count()?;
            if tombstones as f64 / size as f64 > ratio {
                Some(stores.compact()?)
            } else {
                None
            }
        } else {
            None
        };

        Ok(RemovalOutcome {
            path: path.to_string(),
            freed_slots: freed.len(),
            compaction,
        })
    }

    // ── Directory registry ──────────────────────────────────────────────

    pub fn add_directory(&self, path: &str) -> Result<bool> {
        self.stores().metadata.add_directory(path)
    }

    pub fn set_directory_status(
        &self,
        path: &str,
        enabled: bool,
        last_update: Option<DateTime<Utc>>,
        doc_count: u64,
    ) -> Result<()> {
        self.stores()
            .metadata
            .set_directory_status(path, enabled, last_update, doc_count)
    }

    pub fn directory(&self, path: &str) -> Result<Option<DirectoryRegistration>> {
        self.stores().metadata.directory(path)
    }

    pub fn list_directories(&self) -> Result<Vec<DirectoryRegistration>> {
        self.stores().metadata.list_directories()
    }

    pub fn enabled_directories(&self) -> Result<Vec<DirectoryRegistration>> {
        self.stores().metadata.enabled_directories()
    }

    /// Rows stored for one source.
    pub fn chunks_for_source(&self, source_id: &str) -> Result<Vec<ChunkRecord>> {
        self.stores().metadata.chunks_for_source(source_id)
    }

    pub fn stats(&self) -> Result<CoordinatorStats> {
        let stores = self.stores();
        Ok(CoordinatorStats {
            dimension: stores.index.dimension(),
            vector_count: stores.index.size() as u64,
            row_count: stores.metadata.count_rows()?,
            distinct_slot_count: stores.metadata.count_distinct_slots()?,
            tombstone_count: stores.metadata.tombstone_count()?,
            source_count: stores.metadata.source_ids()?.len() as u64,
            directory_count: stores.metadata.list_directories()?.len() as u64,
            dirty: stores.dirty,
            index_path: stores.index_path.clone(),
            metadata_path: stores.metadata.path().to_path_buf(),
        })
    }
}

/// Open a coordinator, run `f`, and flush before returning on every path.
pub fn with_coordinator<T>(
    config: Config,
    f: impl FnOnce(&ConsistencyCoordinator) -> Result<T>,
) -> Result<T> {
    let coordinator = ConsistencyCoordinator::open(config)?;
    let result = f(&coordinator);
    let flushed = coordinator.close();
    match (result, flushed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), flushed) => {
            if let Err(flush_err) = flushed {
                warn!(error = %flush_err, "Flush failed after an earlier error");
            }
            Err(e)
        }
    }
}

impl Stores {
    fn insert(
        &mut self,
        payloads: &[DocumentPayload],
        cancel: Option<&CancelFlag>,
    ) -> Result<InsertOutcome> {
        self.ensure_writable()?;
        self.state = CoordinatorState::Reserving;
        let start = self.index.size();
        let start_slot = start as Slot;

        for payload in payloads {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                self.roll_back(start);
                return Err(Error::Cancelled(format!(
                    "batch cancelled before {}",
                    payload.source_id
                )));
            }
            if let Err(e) = self.index.append(&payload.vectors) {
                self.roll_back(start);
                return Err(e);
            }
        }
        self.state = CoordinatorState::VectorsAppended;

        let mut rows = Vec::with_capacity(self.index.size() - start);
        let mut next = start_slot;
        for payload in payloads {
            for (chunk_index, text) in payload.chunks.iter().enumerate() {
                rows.push(ChunkRecord {
                    source_id: payload.source_id.clone(),
                    chunk_index: chunk_index as u64,
                    text: text.clone(),
                    metadata: payload.metadata.clone(),
                    slot: next,
                });
                next += 1;
            }
        }

        let summary = match self.write_rows(payloads, &rows) {
            Ok(summary) => summary,
            Err(e) => {
                self.roll_back(start);
                return Err(e);
            }
        };
        if let Err(e) = self.index.save(&self.index_path) {
            self.roll_back(start);
            return Err(e);
        }
        if let Err(e) = self.metadata.commit() {
            self.roll_back(start);
            // The file already holds this batch's vectors.
            self.persist_index();
            return Err(e);
        }

        self.dirty = false;
        self.state = CoordinatorState::Committed;
        debug!(
            start_slot,
            slots = rows.len(),
            payloads = payloads.len(),
            replaced = summary.replaced,
            "Batch committed"
        );
        self.state = CoordinatorState::Idle;
        Ok(InsertOutcome {
            start_slot,
            vectors: rows.len(),
            replaced: summary.replaced,
        })
    }

    /// Open the transaction and write every row, leaving it uncommitted.
    fn write_rows(
        &mut self,
        payloads: &[DocumentPayload],
        rows: &[ChunkRecord],
    ) -> Result<UpsertSummary> {
        self.metadata.begin()?;
        // A shorter re-insert leaves no stale trailing chunks behind.
        for payload in payloads {
            self.metadata
                .truncate_source(&payload.source_id, payload.chunks.len() as u64)?;
        }
        let summary = self.metadata.upsert_chunks_batch(rows)?;
        self.state = CoordinatorState::MetadataWritten;
        Ok(summary)
    }

    /// Refuse slot reservations while the metadata names slots the index
    /// does not have.
    fn ensure_writable(&mut self) -> Result<()> {
        self.settle_staged_index()?;
        let size = self.index.size() as u64;
        let beyond = |range: Option<(Slot, Slot)>| range.is_some_and(|(_, max)| max >= size);
        if beyond(self.metadata.slot_range()?) || beyond(self.metadata.tombstone_range()?) {
            return Err(Error::ConsistencyViolation(format!(
                "metadata references slots beyond the {size} vectors in the index; \
                 clear, rebuild or import a snapshot before writing"
            )));
        }
        Ok(())
    }

    /// Move a compacted index staged by an earlier call into place.
    fn settle_staged_index(&mut self) -> Result<()> {
        if self.metadata.staged_index()?.is_none() {
            return Ok(());
        }
        let staged = snapshot::staged_path(&self.index_path);
        if staged.exists() {
            std::fs::rename(&staged, &self.index_path)
                .map_err(|e| Error::snapshot_io(&self.index_path, e))?;
        } else {
            self.index.save(&self.index_path)?;
        }
        self.metadata.clear_staged_index()?;
        self.dirty = false;
        debug!(path = %self.index_path.display(), "Staged index moved into place");
        Ok(())
    }

    fn roll_back(&mut self, start: usize) {
        self.state = CoordinatorState::RollingBack;
        if self.metadata.in_transaction() {
            if let Err(e) = self.metadata.rollback() {
                warn!(error = %e, "Metadata rollback failed");
            }
        }
        if let Err(e) = self.index.truncate(start) {
            warn!(error = %e, "Vector truncation failed");
        }
        debug!(start_slot = start, "Batch rolled back");
        self.state = CoordinatorState::Idle;
    }

    fn persist_index(&mut self) {
        match self.index.save(&self.index_path) {
            Ok(()) => self.dirty = false,
            Err(e) => {
                self.dirty = true;
                warn!(
                    path = %self.index_path.display(),
                    error = %e,
                    "Failed to persist vector index; will retry on flush"
                );
            }
        }
    }

    fn audit(&self) -> Result<ConsistencyReport> {
        let vector_count = self.index.size() as u64;
        let distinct_slot_count = self.metadata.count_distinct_slots()?;
        let row_count = self.metadata.count_rows()?;
        let tombstone_count = self.metadata.tombstone_count()?;
        let slot_range = self.metadata.slot_range()?;
        let mut issues = Vec::new();

        if let Some((_, max_slot)) = slot_range {
            if max_slot >= vector_count {
                issues.push(ConsistencyIssue::SlotBeyondIndex {
                    max_slot,
                    vector_count,
                });
            }
        }
        if let Some((_, max_slot)) = self.metadata.tombstone_range()? {
            if max_slot >= vector_count {
                issues.push(ConsistencyIssue::TombstoneBeyondIndex {
                    max_slot,
                    vector_count,
                });
            }
        }
        let shared = self.metadata.duplicate_slots()?;
        if !shared.is_empty() {
            issues.push(ConsistencyIssue::SharedSlots {
                slots: sample(shared),
            });
        }
        let overlapping = self.metadata.overlapping_tombstones()?;
        if !overlapping.is_empty() {
            issues.push(ConsistencyIssue::TombstonedSlotReferenced {
                slots: sample(overlapping),
            });
        }

        let size = self.index.size();
        let mut covered = vec![false; size];
        for slot in self
            .metadata
            .live_slots()?
            .into_iter()
            .chain(self.metadata.tombstoned_slots()?)
        {
            if let Some(flag) = usize::try_from(slot).ok().and_then(|s| covered.get_mut(s)) {
                *flag = true;
            }
        }
        let unaccounted: Vec<Slot> = covered
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(slot, _)| slot as Slot)
            .collect();
        if !unaccounted.is_empty() {
            issues.push(ConsistencyIssue::UnaccountedSlots {
                count: unaccounted.len() as u64,
                sample: sample(unaccounted),
            });
        }

        Ok(ConsistencyReport {
            ok: issues.is_empty(),
            vector_count,
            distinct_slot_count,
            row_count,
            tombstone_count,
            slot_range,
            issues,
        })
    }

    fn compact(&mut self) -> Result<CompactionOutcome> {
        self.ensure_writable()?;
        let live = self.metadata.live_slots()?;
        let before = self.index.size();
        let tombstones = self.metadata.tombstone_count()?;
        if tombstones == 0 && live.len() == before && live.last().is_none_or(|&s| s as usize + 1 == before) {
            return Ok(CompactionOutcome {
                removed_vectors: 0,
                moved_rows: 0,
                vector_count: before,
            });
        }

        let compacted = self.index.retain_slots(&live)?;
        let staged = snapshot::staged_path(&self.index_path);
        compacted.save(&staged)?;
        let committed = self
            .metadata
            .begin()
            .and_then(|()| self.metadata.renumber_slots(&live))
            .and_then(|moved| {
                self.metadata
                    .mark_staged_index(compacted.size() as u64)
                    .map(|()| moved)
            })
            .and_then(|moved| self.metadata.commit().map(|()| moved));
        let moved = match committed {
            Ok(moved) => moved,
            Err(e) => {
                if self.metadata.in_transaction() {
                    if let Err(rollback_err) = self.metadata.rollback() {
                        warn!(error = %rollback_err, "Metadata rollback failed");
                    }
                }
                if let Err(cleanup) = snapshot::remove_if_exists(&staged) {
                    warn!(error = %cleanup, "Failed to remove staged index");
                }
                return Err(e);
            }
        };

        self.index = compacted;
        if let Err(e) = self.settle_staged_index() {
            self.dirty = true;
            warn!(
                path = %self.index_path.display(),
                error = %e,
                "Compacted index not yet in place; will retry on flush"
            );
        }
        let outcome = CompactionOutcome {
            removed_vectors: before - self.index.size(),
            moved_rows: moved,
            vector_count: self.index.size(),
        };
        info!(
            removed = outcome.removed_vectors,
            moved = outcome.moved_rows,
            vectors = outcome.vector_count,
            "Compacted vector index"
        );
        Ok(outcome)
    }

    fn manifest_for(
        &self,
        index_path: &Path,
        metadata_path: &Path,
        index_tmp: &Path,
        metadata_tmp: &Path,
    ) -> Result<SnapshotManifest> {
        Ok(SnapshotManifest {
            manifest_version: MANIFEST_VERSION,
            docvault_version: crate::VERSION.to_string(),
            created_at: Utc::now().to_rfc3339(),
            dimension: self.index.dimension(),
            vector_count: self.index.size() as u64,
            row_count: self.metadata.count_rows()?,
            tombstone_count: self.metadata.tombstone_count()?,
            index_file: file_name(index_path),
            index_sha256: snapshot::sha256_file(index_tmp)?,
            metadata_file: file_name(metadata_path),
            metadata_sha256: snapshot::sha256_file(metadata_tmp)?,
        })
    }

    fn reject_live_paths(&self, index_path: &Path, metadata_path: &Path) -> Result<()> {
        let live = [self.index_path.as_path(), self.metadata.path()];
        for candidate in [index_path, metadata_path] {
            if live.iter().any(|l| snapshot::same_file(l, candidate)) {
                return Err(Error::TransferFailure(format!(
                    "{} is a live data file",
                    candidate.display()
                )));
            }
        }
        Ok(())
    }

    fn swap_in(&mut self, metadata_path: &Path, imported: VectorIndex) -> Result<()> {
        self.metadata.restore_from(metadata_path)?;
        // A snapshot taken mid-compaction carries a marker for a file that
        // only existed at its source.
        self.metadata.clear_staged_index()?;
        imported.save(&self.index_path)?;
        self.index = imported;
        self.dirty = false;
        Ok(())
    }

    fn restore_from_backup(&mut self, metadata_backup: &Path, index_backup: &Path) -> Result<()> {
        self.metadata.restore_from(metadata_backup)?;
        let prior = VectorIndex::load(index_backup)?;
        prior.save(&self.index_path)?;
        self.index = prior;
        self.dirty = false;
        info!("Restored pre-import state from backup");
        Ok(())
    }
}

/// Finish a compaction whose renumbering committed before its staged index
/// was renamed, or discard one whose renumbering never committed.
fn recover_staged_index(metadata: &mut MetadataStore, index_path: &Path) -> Result<()> {
    let staged = snapshot::staged_path(index_path);
    match metadata.staged_index()? {
        Some(vector_count) => {
            if staged.exists() {
                std::fs::rename(&staged, index_path)
                    .map_err(|e| Error::snapshot_io(index_path, e))?;
            }
            metadata.clear_staged_index()?;
            info!(vector_count, "Finished interrupted compaction");
        }
        None if staged.exists() => {
            snapshot::remove_if_exists(&staged)?;
            info!(path = %staged.display(), "Discarded index staged by an uncommitted compaction");
        }
        None => {}
    }
    Ok(())
}

/// Validate a snapshot pair without touching live state.
fn validate_snapshot(
    index_path: &Path,
    metadata_path: &Path,
    dimension: usize,
) -> Result<(VectorIndex, Option<SnapshotManifest>)> {
    for path in [index_path, metadata_path] {
        if !path.is_file() {
            return Err(Error::TransferFailure(format!(
                "{} does not exist",
                path.display()
            )));
        }
    }

    let imported = VectorIndex::load(index_path).map_err(|e| {
        Error::TransferFailure(format!("{} is not a vector index: {e}", index_path.display()))
    })?;
    if imported.dimension() != dimension {
        return Err(Error::TransferFailure(format!(
            "snapshot dimension {} does not match index dimension {dimension}",
            imported.dimension()
        )));
    }

    MetadataStore::verify_file(metadata_path).map_err(|e| match e {
        Error::TransferFailure(msg) => Error::TransferFailure(msg),
        other => Error::TransferFailure(format!(
            "{} is not a metadata database: {other}",
            metadata_path.display()
        )),
    })?;

    let manifest = SnapshotManifest::load_optional(&snapshot::manifest_path(index_path))?;
    if let Some(manifest) = &manifest {
        manifest.verify(index_path, metadata_path)?;
    }
    Ok((imported, manifest))
}

fn sample(mut slots: Vec<Slot>) -> Vec<Slot> {
    slots.truncate(ISSUE_SAMPLE);
    slots
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
