//! Batching front-end for the coordinator.
//!
//! Payloads are validated one by one, grouped into batches of
//! `batch_size`, and each batch is committed with a single
//! [`ConsistencyCoordinator::insert_batch_cancellable`] call. A rejected
//! payload never takes its neighbours down with it; a failed batch is
//! reported against every payload it contained.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collab::{DocumentParser, Embedder};
use crate::coordinator::{CancelFlag, ConsistencyCoordinator, DocumentPayload};
use crate::{Error, Result};

/// Capacity of the channel feeding a background worker.
const WORKER_QUEUE_DEPTH: usize = 64;

/// Why a payload was refused before reaching the stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub source_id: String,
    pub reason: String,
}

/// A batch whose insertion failed and was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub source_ids: Vec<String>,
    pub error: String,
}

/// A file that could not be parsed or embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Everything a pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub submitted: usize,
    pub indexed_documents: usize,
    pub indexed_chunks: usize,
    pub batches_committed: usize,
    pub skipped_empty: usize,
    pub rejected: Vec<Rejection>,
    pub failed_batches: Vec<BatchFailure>,
    pub failed_files: Vec<FileFailure>,
    pub cancelled: bool,
}

impl PipelineReport {
    /// Payloads that did not make it into the stores.
    pub fn failed_documents(&self) -> usize {
        self.rejected.len()
            + self
                .failed_batches
                .iter()
                .map(|b| b.source_ids.len())
                .sum::<usize>()
            + self.failed_files.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_documents() == 0 && !self.cancelled
    }
}

/// Accumulates payloads and commits them in batches.
pub struct IndexingPipeline<'a> {
    coordinator: &'a ConsistencyCoordinator,
    batch_size: usize,
    pending: Vec<DocumentPayload>,
    cancel: CancelFlag,
    report: PipelineReport,
}

impl<'a> IndexingPipeline<'a> {
    pub fn new(coordinator: &'a ConsistencyCoordinator, batch_size: usize) -> Self {
        Self {
            coordinator,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            cancel: CancelFlag::new(),
            report: PipelineReport::default(),
        }
    }

    /// Use `cancel` to stop the run from another thread.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Check a payload against the coordinator's dimension.
    pub fn validate(&self, payload: &DocumentPayload) -> Result<()> {
        validate_payload(payload, self.coordinator.dimension())
    }

    /// Queue one payload, committing the batch once it is full.
    pub fn submit(&mut self, payload: DocumentPayload) {
        self.report.submitted += 1;
        if self.cancel.is_cancelled() {
            self.report.cancelled = true;
            self.report.rejected.push(Rejection {
                source_id: payload.source_id,
                reason: "cancelled".to_string(),
            });
            return;
        }
        if let Err(e) = self.validate(&payload) {
            warn!(source_id = %payload.source_id, error = %e, "Rejected payload");
            self.report.rejected.push(Rejection {
                source_id: payload.source_id,
                reason: e.to_string(),
            });
            return;
        }
        self.pending.push(payload);
        if self.pending.len() >= self.batch_size {
            self.flush_batch();
        }
    }

    /// Parse, embed and submit each file. The file path is the source id.
    pub fn index_files(
        &mut self,
        parser: &dyn DocumentParser,
        embedder: &dyn Embedder,
        files: &[PathBuf],
    ) {
        for path in files {
            if self.cancel.is_cancelled() {
                self.report.cancelled = true;
                break;
            }
            match build_payload(parser, embedder, path) {
                Ok(Some(payload)) => self.submit(payload),
                Ok(None) => {
                    debug!(path = %path.display(), "No text to index");
                    self.report.skipped_empty += 1;
                }
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "Failed to prepare file");
                    self.report.failed_files.push(FileFailure {
                        path: path.clone(),
                        error,
                    });
                }
            }
        }
    }

    /// Submit every payload, then commit the remainder.
    pub fn run(mut self, payloads: impl IntoIterator<Item = DocumentPayload>) -> PipelineReport {
        for payload in payloads {
            self.submit(payload);
        }
        self.finish()
    }

    /// Commit any partial batch and return the report.
    pub fn finish(mut self) -> PipelineReport {
        self.flush_batch();
        info!(
            submitted = self.report.submitted,
            documents = self.report.indexed_documents,
            chunks = self.report.indexed_chunks,
            failed = self.report.failed_documents(),
            "Indexing finished"
        );
        self.report
    }

    fn flush_batch(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        match self
            .coordinator
            .insert_batch_cancellable(&batch, &self.cancel)
        {
            Ok(outcome) => {
                self.report.batches_committed += 1;
                self.report.indexed_documents += batch.len();
                self.report.indexed_chunks += outcome.vectors;
            }
            Err(e) => {
                if matches!(e, Error::Cancelled(_)) {
                    self.report.cancelled = true;
                }
                warn!(payloads = batch.len(), error = %e, "Batch rolled back");
                self.report.failed_batches.push(BatchFailure {
                    source_ids: batch.into_iter().map(|p| p.source_id).collect(),
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Shape, dimension, finiteness and source id checks.
pub fn validate_payload(payload: &DocumentPayload, dimension: usize) -> Result<()> {
    if payload.source_id.trim().is_empty() {
        return Err(Error::InvalidPayload("source_id is empty".to_string()));
    }
    if payload.chunks.len() != payload.vectors.len() {
        return Err(Error::ShapeMismatch {
            source_id: payload.source_id.clone(),
            chunks: payload.chunks.len(),
            vectors: payload.vectors.len(),
        });
    }
    for (i, vector) in payload.vectors.iter().enumerate() {
        if vector.len() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidPayload(format!(
                "vector {i} of {} has a non-finite component",
                payload.source_id
            )));
        }
    }
    Ok(())
}

fn build_payload(
    parser: &dyn DocumentParser,
    embedder: &dyn Embedder,
    path: &Path,
) -> std::result::Result<Option<DocumentPayload>, String> {
    let parsed = parser.parse(path).map_err(|e| e.to_string())?;
    if parsed.chunks.is_empty() {
        return Ok(None);
    }
    let vectors = embedder
        .embed_batch(&parsed.chunks)
        .map_err(|e| e.to_string())?;
    Ok(Some(DocumentPayload::new(
        path.display().to_string(),
        parsed.chunks,
        vectors,
        parsed.metadata,
    )))
}

/// Handle to a background indexing thread.
pub struct IndexingWorker {
    sender: Option<Sender<DocumentPayload>>,
    cancel: CancelFlag,
    handle: JoinHandle<PipelineReport>,
}

/// Start a worker thread that indexes payloads sent to it.
pub fn spawn_indexing_worker(
    coordinator: Arc<ConsistencyCoordinator>,
    batch_size: usize,
) -> IndexingWorker {
    let (sender, receiver) = channel::bounded::<DocumentPayload>(WORKER_QUEUE_DEPTH);
    let cancel = CancelFlag::new();
    let worker_cancel = cancel.clone();
    let handle = thread::spawn(move || {
        let mut pipeline =
            IndexingPipeline::new(&coordinator, batch_size).with_cancel(worker_cancel);
        for payload in receiver {
            pipeline.submit(payload);
        }
        pipeline.finish()
    });
    IndexingWorker {
        sender: Some(sender),
        cancel,
        handle,
    }
}

impl IndexingWorker {
    /// Queue a payload. Fails once the worker has stopped.
    pub fn send(&self, payload: DocumentPayload) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::Cancelled("worker input closed".to_string()))?;
        sender
            .send(payload)
            .map_err(|_| Error::Cancelled("indexing worker stopped".to_string()))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close the input, wait for the worker, and return its report.
    pub fn join(mut self) -> Result<PipelineReport> {
        drop(self.sender.take());
        self.handle
            .join()
            .map_err(|_| Error::Cancelled("indexing worker panicked".to_string()))
    }
}
