//! Semantic retrieval over generational snapshots.
//!
//! # Architecture
//!
//! - `chunker`: Splits units into chunks with stable ids
//! - `embeddings`: Embedding backends (fastembed or feature hashing)
//! - `index`: HNSW approximate nearest neighbour index
//! - `storage`: Binary `vectors.bin` / `graph.bin` persistence
//! - `snapshot`: Generations on disk and the `CURRENT` pointer
//! - `rebuild`: Rebuild sessions and their state machine
//! - `query`: Confidence scoring and ranking
//! - `service`: The `Engine` tying it together

pub mod chunker;
pub mod embeddings;
pub mod index;
pub mod query;
pub mod rebuild;
pub mod service;
pub mod snapshot;
pub mod storage;

pub use embeddings::{load_embedder, Embedder, EmbeddingError, HashingEmbedder};
pub use index::{HnswParams, IndexError, SearchResult, VectorIndex};
pub use query::{QueryResponse, ScoredChunk};
pub use rebuild::{RebuildEvent, RebuildMode, RebuildState, RebuildSummary};
pub use service::{CleanReport, Engine, RebuildHandle, Settings, Status};
pub use snapshot::{GenerationId, SnapshotManager, VerifyReport};
pub use storage::{VectorStorage, VectorStorageError};
