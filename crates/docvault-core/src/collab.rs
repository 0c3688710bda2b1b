//! External collaborators: document parsing and embedding.
//!
//! The engine only consumes chunks and vectors. These traits describe where
//! they come from; [`PlainTextParser`] and [`HashEmbedder`] are small
//! built-in implementations so the CLI works without external models.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::config::IndexingConfig;
use crate::metadata_store::Metadata;

// ── Embedding ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedder misconfigured: {0}")]
    InvalidConfig(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Maps chunk text to fixed-dimension vectors.
pub trait Embedder: Send + Sync {
    fn name(&self) -> String;
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// FNV-1a feature-hashing embedder over words and character trigrams.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let bucket = (h % self.dimension as u64) as usize;
        let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

impl Embedder for HashEmbedder {
    fn name(&self) -> String {
        format!("fnv1a-hash-{}", self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if self.dimension == 0 {
            return Err(EmbedError::InvalidConfig("dimension must be > 0".to_string()));
        }
        let mut vector = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();

        for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            self.add_feature(&mut vector, word, 1.0);
            let chars: Vec<char> = word.chars().collect();
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                self.add_feature(&mut vector, &trigram, 0.5);
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }
}

// ── Parsing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A parsed document: ordered chunks plus document-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub chunks: Vec<String>,
    pub metadata: Metadata,
}

/// Turns a file into chunks.
pub trait DocumentParser: Send + Sync {
    /// Whether this parser handles `path`.
    fn supports(&self, path: &Path) -> bool;
    fn parse(&self, path: &Path) -> Result<ParsedDocument, ParseError>;
}

/// UTF-8 text parser with sliding-window chunking.
///
/// Windows are `chunk_size` characters; a window that is not the last one
/// is stretched to the next `.` when that lies within 100 characters, and
/// consecutive windows overlap by `chunk_overlap` characters.
#[derive(Debug, Clone)]
pub struct PlainTextParser {
    chunk_size: usize,
    chunk_overlap: usize,
    extensions: Vec<String>,
}

const SENTENCE_LOOKAHEAD: usize = 100;

impl PlainTextParser {
    pub fn new(chunk_size: usize, chunk_overlap: usize, extensions: Vec<String>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &IndexingConfig) -> Self {
        Self::new(
            config.chunk_size,
            config.chunk_overlap,
            config.file_extensions.clone(),
        )
    }

    /// Split `text` into overlapping windows.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let mut end = (start + self.chunk_size).min(chars.len());
            if end < chars.len() {
                let horizon = (end + SENTENCE_LOOKAHEAD).min(chars.len());
                if let Some(offset) = chars[end..horizon].iter().position(|&c| c == '.') {
                    end += offset + 1;
                }
            }
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start = end - self.chunk_overlap;
        }
        chunks
    }

    /// Recursively list supported files beneath `root`, sorted.
    pub fn scan_directory(&self, root: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                } else if self.supports(&path) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl DocumentParser for PlainTextParser {
    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    fn parse(&self, path: &Path) -> Result<ParsedDocument, ParseError> {
        if !self.supports(path) {
            return Err(ParseError::Unsupported(path.to_path_buf()));
        }
        let bytes = fs::read(path).map_err(|source| ParseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let content = String::from_utf8_lossy(&bytes);

        let mut metadata = Metadata::new();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            metadata.insert("title".to_string(), Value::String(name.to_string()));
        }
        metadata.insert("chars".to_string(), Value::from(content.chars().count()));

        Ok(ParsedDocument {
            chunks: self.chunk(&content),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(chunk_size: usize, overlap: usize) -> PlainTextParser {
        PlainTextParser::new(chunk_size, overlap, vec![".txt".to_string(), "md".to_string()])
    }

    #[test]
    fn hash_embedder_is_normalized_and_deterministic() {
        let emb = HashEmbedder::new(64);
        let v = emb.embed("Rust vector index").unwrap();
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
        assert_eq!(v, emb.embed("rust VECTOR index").unwrap());
    }

    #[test]
    fn hash_embedder_empty_text_is_zero() {
        let v = HashEmbedder::new(8).embed("  ").unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn hash_embedder_zero_dimension_errors() {
        assert!(HashEmbedder::new(0).embed("x").is_err());
    }

    #[test]
    fn embed_batch_preserves_order() {
        let emb = HashEmbedder::new(16);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let batch = emb.embed_batch(&texts).unwrap();
        assert_eq!(batch[1], emb.embed("beta").unwrap());
    }

    #[test]
    fn chunk_short_text_is_single_chunk() {
        assert_eq!(parser(10, 2).chunk("hello"), vec!["hello"]);
        assert!(parser(10, 2).chunk("").is_empty());
    }

    #[test]
    fn chunk_windows_overlap() {
        let chunks = parser(4, 1).chunk("abcdefghij");
        assert_eq!(chunks, vec!["abcd", "defg", "ghij"]);
    }

    #[test]
    fn chunk_extends_to_sentence_end() {
        let chunks = parser(5, 0).chunk("abcdefg. hij");
        assert_eq!(chunks[0], "abcdefg.");
        assert_eq!(chunks[1], " hij");
    }

    #[test]
    fn chunk_handles_multibyte_text() {
        let chunks = parser(2, 0).chunk("日本語です");
        assert_eq!(chunks, vec!["日本", "語で", "す"]);
    }

    #[test]
    fn parse_reads_file_with_title() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        fs::write(&path, "first. second.").unwrap();
        let doc = parser(512, 50).parse(&path).unwrap();
        assert_eq!(doc.chunks, vec!["first. second."]);
        assert_eq!(doc.metadata.get("title"), Some(&Value::from("note.txt")));
        assert!(matches!(
            parser(512, 50).parse(&dir.path().join("x.pdf")),
            Err(ParseError::Unsupported(_))
        ));
    }

    #[test]
    fn scan_directory_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("sub").join("b.MD"), "b").unwrap();
        fs::write(dir.path().join("c.bin"), "c").unwrap();
        let files = parser(10, 0).scan_directory(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() != "bin"));
    }
}
