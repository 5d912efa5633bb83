//! Ingest pipeline
//!
//! Turns raw text or a file into one or more engrams: chunk, insert, embed,
//! index. Chunking is strategy-driven; byte and chunk caps are enforced
//! before anything is written. Embedding failures are retried with backoff
//! and never lose the engram - it stays lexically searchable until a later
//! backfill succeeds.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::embeddings::Embedder;
use crate::engram::{Category, EngramDraft};
use crate::error::{EngineError, Result};
use crate::search::VectorIndex;
use crate::storage::EngramStore;

/// Base delay between embedder retries
const RETRY_BASE_DELAY_MS: u64 = 50;

/// Chunking strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// One engram for the whole input
    Whole,
    /// Split on blank lines
    Paragraphs,
    /// Split on sentence terminators
    Sentences,
    /// One engram per line
    Lines,
    /// Split on markdown heading boundaries
    Markdown,
    /// Pick a strategy from the content's structure and size
    #[default]
    Auto,
}

impl ChunkStrategy {
    /// String representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Whole => "whole",
            ChunkStrategy::Paragraphs => "paragraphs",
            ChunkStrategy::Sentences => "sentences",
            ChunkStrategy::Lines => "lines",
            ChunkStrategy::Markdown => "markdown",
            ChunkStrategy::Auto => "auto",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "whole" => Some(ChunkStrategy::Whole),
            "paragraphs" => Some(ChunkStrategy::Paragraphs),
            "sentences" => Some(ChunkStrategy::Sentences),
            "lines" => Some(ChunkStrategy::Lines),
            "markdown" => Some(ChunkStrategy::Markdown),
            "auto" => Some(ChunkStrategy::Auto),
            _ => None,
        }
    }
}

/// Bounds applied before chunking
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    /// Per-input byte cap
    pub max_bytes: u64,
    /// Per-input chunk cap
    pub max_chunks: usize,
}

/// Result of one ingest call
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// Number of engrams created
    pub chunks_created: usize,
    /// Their ids, in input order
    pub ids: Vec<i64>,
    /// Chunks whose embedding did not arrive within the retry cap
    ///
    /// Those engrams stay lexically searchable and are backfilled by the
    /// sleep cycle.
    pub embedding_failures: usize,
}

// ============================================================================
// CHUNKING
// ============================================================================

/// Split content according to a strategy
///
/// Empty chunks are dropped; surrounding whitespace is trimmed.
pub fn chunk(content: &str, strategy: ChunkStrategy) -> Vec<String> {
    let chunks: Vec<String> = match strategy {
        ChunkStrategy::Whole => vec![content.to_string()],
        ChunkStrategy::Paragraphs => content
            .split("\n\n")
            .map(|p| p.to_string())
            .collect(),
        ChunkStrategy::Sentences => split_sentences(content),
        ChunkStrategy::Lines => content.lines().map(|l| l.to_string()).collect(),
        ChunkStrategy::Markdown => split_markdown(content),
        ChunkStrategy::Auto => return chunk(content, pick_auto_strategy(content)),
    };
    chunks
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn split_sentences(content: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in content.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }
    sentences
}

fn split_markdown(content: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.starts_with('#') && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

/// Heuristic strategy choice for `auto`
fn pick_auto_strategy(content: &str) -> ChunkStrategy {
    if content.lines().any(|l| l.starts_with('#')) {
        ChunkStrategy::Markdown
    } else if content.contains("\n\n") {
        ChunkStrategy::Paragraphs
    } else if content.len() > 2000 {
        ChunkStrategy::Sentences
    } else {
        ChunkStrategy::Whole
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Write path from raw input to stored, embedded, indexed engrams
pub struct IngestPipeline {
    store: Arc<EngramStore>,
    index: Arc<RwLock<VectorIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
    limits: IngestLimits,
    retry_cap: u32,
}

impl IngestPipeline {
    /// Wire a pipeline over the engine's shared components
    pub fn new(
        store: Arc<EngramStore>,
        index: Arc<RwLock<VectorIndex>>,
        embedder: Option<Arc<dyn Embedder>>,
        limits: IngestLimits,
        retry_cap: u32,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            limits,
            retry_cap,
        }
    }

    /// Ingest raw content as one or more engrams
    pub fn ingest(
        &self,
        content: &str,
        strategy: ChunkStrategy,
        category: Category,
        importance: f64,
        metadata: Option<&serde_json::Value>,
    ) -> Result<IngestOutcome> {
        let size = content.len() as u64;
        if size > self.limits.max_bytes {
            return Err(EngineError::FileTooLarge {
                size,
                cap: self.limits.max_bytes,
            });
        }

        let chunks = chunk(content, strategy);
        if chunks.len() > self.limits.max_chunks {
            return Err(EngineError::TooManyChunks {
                count: chunks.len(),
                cap: self.limits.max_chunks,
            });
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(chunks.len());
        let mut embedding_failures = 0;

        for chunk_content in &chunks {
            let mut draft = EngramDraft::new(chunk_content.clone())
                .category(category.clone())
                .importance(importance);
            if let Some(metadata) = metadata {
                draft = draft.metadata(metadata.clone());
            }
            let engram = self.store.insert(&draft, now)?;

            if !self.embed_with_retry(engram.id, chunk_content) {
                embedding_failures += 1;
            }
            ids.push(engram.id);
        }

        tracing::info!(
            chunks = ids.len(),
            strategy = strategy.as_str(),
            embedding_failures,
            "ingest complete"
        );

        Ok(IngestOutcome {
            chunks_created: ids.len(),
            ids,
            embedding_failures,
        })
    }

    /// Embed and index one chunk, retrying with exponential backoff
    ///
    /// Returns false when the retry cap is exhausted; the engram remains
    /// stored and lexically searchable.
    fn embed_with_retry(&self, id: i64, content: &str) -> bool {
        let Some(embedder) = &self.embedder else {
            return true; // nothing to do without an embedder
        };

        for attempt in 0..=self.retry_cap {
            match embedder.embed(content) {
                Ok(vector) => {
                    let stored = self.store.set_embedding(id, &vector);
                    let indexed = self
                        .index
                        .write()
                        .map_err(|_| {
                            EngineError::Corruption("vector index lock poisoned".to_string())
                        })
                        .and_then(|mut index| Ok(index.insert(id, &vector)?));
                    if let Err(e) = stored.and(indexed) {
                        tracing::warn!(engram_id = id, error = %e, "indexing chunk failed");
                        return false;
                    }
                    return true;
                }
                Err(e) if attempt < self.retry_cap => {
                    let delay = RETRY_BASE_DELAY_MS << attempt;
                    tracing::debug!(
                        engram_id = id,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "embedder retry"
                    );
                    std::thread::sleep(std::time::Duration::from_millis(delay));
                }
                Err(e) => {
                    tracing::warn!(
                        engram_id = id,
                        attempts = self.retry_cap + 1,
                        error = %e,
                        "embedding failed, leaving chunk lexical-only"
                    );
                    return false;
                }
            }
        }
        false
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbedderError, HashEmbedder};
    use crate::search::VectorIndexConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn pipeline_with(
        embedder: Option<Arc<dyn Embedder>>,
        limits: IngestLimits,
    ) -> (TempDir, Arc<EngramStore>, Arc<RwLock<VectorIndex>>, IngestPipeline) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EngramStore::open(&dir.path().join("engram.db")).unwrap());
        let index = Arc::new(RwLock::new(
            VectorIndex::new(VectorIndexConfig {
                dimensions: 64,
                ..Default::default()
            })
            .unwrap(),
        ));
        let pipeline =
            IngestPipeline::new(store.clone(), index.clone(), embedder, limits, 2);
        (dir, store, index, pipeline)
    }

    fn default_limits() -> IngestLimits {
        IngestLimits {
            max_bytes: 1024 * 1024,
            max_chunks: 64,
        }
    }

    // ---- chunking ----

    #[test]
    fn test_chunk_whole() {
        assert_eq!(chunk("one\n\ntwo", ChunkStrategy::Whole), vec!["one\n\ntwo"]);
    }

    #[test]
    fn test_chunk_paragraphs() {
        let chunks = chunk("first para\n\nsecond para\n\n\n", ChunkStrategy::Paragraphs);
        assert_eq!(chunks, vec!["first para", "second para"]);
    }

    #[test]
    fn test_chunk_sentences() {
        let chunks = chunk(
            "It failed. We retried! Did it work? Yes",
            ChunkStrategy::Sentences,
        );
        assert_eq!(
            chunks,
            vec!["It failed.", "We retried!", "Did it work?", "Yes"]
        );
    }

    #[test]
    fn test_chunk_lines() {
        assert_eq!(
            chunk("a\nb\n\nc", ChunkStrategy::Lines),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_chunk_markdown() {
        let content = "# Intro\nsome text\n# Details\nmore text\n";
        let chunks = chunk(content, ChunkStrategy::Markdown);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("# Intro"));
        assert!(chunks[1].starts_with("# Details"));
    }

    #[test]
    fn test_chunk_auto_picks_markdown() {
        let content = "# Heading\nbody\n# Another\nbody";
        assert_eq!(chunk(content, ChunkStrategy::Auto).len(), 2);
    }

    #[test]
    fn test_chunk_auto_small_plain_is_whole() {
        assert_eq!(chunk("just a note", ChunkStrategy::Auto).len(), 1);
    }

    #[test]
    fn test_chunk_deterministic() {
        let content = "alpha\n\nbeta\n\ngamma";
        let first = chunk(content, ChunkStrategy::Paragraphs);
        let second = chunk(content, ChunkStrategy::Paragraphs);
        assert_eq!(first, second);
    }

    // ---- pipeline ----

    #[test]
    fn test_ingest_stores_and_indexes() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let (_dir, store, index, pipeline) = pipeline_with(Some(embedder), default_limits());

        let outcome = pipeline
            .ingest(
                "first fact\n\nsecond fact",
                ChunkStrategy::Paragraphs,
                Category::Fact,
                0.5,
                None,
            )
            .unwrap();

        assert_eq!(outcome.chunks_created, 2);
        assert_eq!(outcome.embedding_failures, 0);
        for id in &outcome.ids {
            assert!(store.get(*id).unwrap().has_embedding());
            assert!(index.read().unwrap().contains(*id));
        }
    }

    #[test]
    fn test_ingest_too_large() {
        let (_dir, _store, _index, pipeline) = pipeline_with(
            None,
            IngestLimits {
                max_bytes: 10,
                max_chunks: 64,
            },
        );
        let result = pipeline.ingest(
            "this is longer than ten bytes",
            ChunkStrategy::Whole,
            Category::Fact,
            0.5,
            None,
        );
        assert!(matches!(result, Err(EngineError::FileTooLarge { .. })));
    }

    #[test]
    fn test_ingest_too_many_chunks() {
        let (_dir, store, _index, pipeline) = pipeline_with(
            None,
            IngestLimits {
                max_bytes: 1024 * 1024,
                max_chunks: 3,
            },
        );
        let result = pipeline.ingest(
            "a\nb\nc\nd\ne",
            ChunkStrategy::Lines,
            Category::Fact,
            0.5,
            None,
        );
        assert!(matches!(result, Err(EngineError::TooManyChunks { count: 5, cap: 3 })));
        // Caps are checked before any write
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_ingest_same_input_same_chunk_count() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let (_dir, _store, _index, pipeline) = pipeline_with(Some(embedder), default_limits());
        let content = "alpha\n\nbeta\n\ngamma";

        let first = pipeline
            .ingest(content, ChunkStrategy::Auto, Category::Fact, 0.5, None)
            .unwrap();
        let second = pipeline
            .ingest(content, ChunkStrategy::Auto, Category::Fact, 0.5, None)
            .unwrap();
        assert_eq!(first.chunks_created, second.chunks_created);
    }

    /// Fails a fixed number of times, then succeeds
    struct FlakyEmbedder {
        inner: HashEmbedder,
        failures_left: AtomicU32,
    }

    impl Embedder for FlakyEmbedder {
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedderError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EmbedderError("synthetic outage".to_string()));
            }
            self.inner.embed(text)
        }
    }

    #[test]
    fn test_embedder_retries_then_succeeds() {
        let embedder: Arc<dyn Embedder> = Arc::new(FlakyEmbedder {
            inner: HashEmbedder::new(64),
            failures_left: AtomicU32::new(2),
        });
        let (_dir, store, _index, pipeline) = pipeline_with(Some(embedder), default_limits());

        let outcome = pipeline
            .ingest("resilient fact", ChunkStrategy::Whole, Category::Fact, 0.5, None)
            .unwrap();
        assert_eq!(outcome.embedding_failures, 0);
        assert!(store.get(outcome.ids[0]).unwrap().has_embedding());
    }

    #[test]
    fn test_embedder_exhaustion_keeps_engram_lexical() {
        let embedder: Arc<dyn Embedder> = Arc::new(FlakyEmbedder {
            inner: HashEmbedder::new(64),
            failures_left: AtomicU32::new(100),
        });
        let (_dir, store, index, pipeline) = pipeline_with(Some(embedder), default_limits());

        let outcome = pipeline
            .ingest(
                "stubborn lexical fact",
                ChunkStrategy::Whole,
                Category::Fact,
                0.5,
                None,
            )
            .unwrap();
        assert_eq!(outcome.embedding_failures, 1);
        let engram = store.get(outcome.ids[0]).unwrap();
        assert!(!engram.has_embedding());
        assert!(!index.read().unwrap().contains(engram.id));
        // Still reachable lexically
        assert_eq!(
            store.fts_candidates("stubborn lexical", 5).unwrap(),
            vec![engram.id]
        );
    }
}
