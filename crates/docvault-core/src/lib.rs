//! docvault-core: consistency engine for local document search
//!
//! Keeps an append-only vector index and a SQLite metadata store in
//! lockstep so that every vector slot is accounted for by exactly one
//! chunk row or one tombstone.
//!
//! # Architecture
//!
//! ```text
//! files → DocumentParser → Embedder → IndexingPipeline (batches)
//!                                          ↓
//!                              ConsistencyCoordinator
//!                              ↙                    ↘
//!                    VectorIndex (.dvvi)     MetadataStore (SQLite)
//! ```
//!
//! # Modules
//!
//! - `vector_index`: flat exact L2 index and its on-disk format
//! - `metadata_store`: chunk rows, tombstones, directory registry
//! - `coordinator`: atomic insertion, search, audit, snapshots, compaction
//! - `pipeline`: validation and batching, background worker
//! - `collab`: document parser and embedder traits with built-in versions
//! - `snapshot`: atomic file writes, checksums, export manifest
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `lock`: per-data-directory process lock
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod collab;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod logging;
pub mod metadata_store;
pub mod pipeline;
pub mod snapshot;
pub mod vector_index;

pub use coordinator::{
    CancelFlag, CompactionOutcome, ConsistencyCoordinator, ConsistencyIssue, ConsistencyReport,
    CoordinatorState, CoordinatorStats, DocumentPayload, ImportOutcome, InsertOutcome,
    RemovalOutcome, SearchHit, with_coordinator,
};
pub use error::{ConfigError, Error, Remediation, Result};
pub use metadata_store::{ChunkRecord, DirectoryRegistration, Metadata};
pub use pipeline::{IndexingPipeline, PipelineReport, spawn_indexing_worker};
pub use vector_index::{Slot, VectorIndex};

/// Crate version, recorded in snapshot manifests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
