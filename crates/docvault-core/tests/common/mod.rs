//! Shared fixtures for docvault-core integration tests.

#![allow(dead_code)]

use std::path::Path;

use docvault_core::config::Config;
use docvault_core::{ConsistencyCoordinator, DocumentPayload, Metadata};
use serde_json::json;
use tempfile::TempDir;

/// Config rooted at `dir` with the given vector dimension.
pub fn config_in(dir: &Path, dimension: usize) -> Config {
    Config::default()
        .with_data_dir(dir)
        .with_dimension(dimension)
}

/// A fresh coordinator in its own temp directory.
pub fn open_fresh(dimension: usize) -> (TempDir, ConsistencyCoordinator) {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = ConsistencyCoordinator::open(config_in(dir.path(), dimension)).unwrap();
    (dir, coordinator)
}

/// Unit vector along `axis`.
pub fn axis(dimension: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[axis % dimension] = 1.0;
    v
}

/// Payload whose chunk texts are derived from the source id.
pub fn payload(source_id: &str, vectors: Vec<Vec<f32>>) -> DocumentPayload {
    let chunks = (0..vectors.len())
        .map(|i| format!("{source_id} / chunk {i}"))
        .collect();
    let mut metadata = Metadata::new();
    metadata.insert("title".to_string(), json!(source_id));
    DocumentPayload::new(source_id, chunks, vectors, metadata)
}
