use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::index::IndexError;
use crate::semantic::rebuild::RebuildState;
use crate::semantic::snapshot::GenerationId;
use crate::semantic::storage::VectorStorageError;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("index is busy: another rebuild holds the write lock ({0})")]
    IndexBusy(String),

    #[error("embedding unavailable for chunk {chunk_id} of {unit_id}: {reason}")]
    EmbeddingUnavailable {
        unit_id: String,
        chunk_id: u64,
        reason: String,
    },

    #[error("embedding backend down after {consecutive} consecutive failures: {last_error}")]
    EmbeddingBackendDown {
        consecutive: usize,
        last_error: String,
    },

    #[error(
        "generation {generation} was built with model '{index_model}' but the active model is '{active_model}'; run a full rebuild"
    )]
    ModelMismatch {
        generation: GenerationId,
        index_model: String,
        active_model: String,
    },

    #[error("generation {generation} is corrupt: {reason}")]
    CorruptGeneration {
        generation: GenerationId,
        reason: String,
    },

    #[error("confidence threshold must be a number between 0 and 100, got {0}")]
    InvalidThreshold(f32),

    #[error("index has not been built yet")]
    NotIndexed,

    #[error("rebuild cancelled")]
    Cancelled,

    #[error("illegal rebuild transition {from:?} -> {to:?}")]
    InvalidTransition { from: RebuildState, to: RebuildState },

    #[error("config error: {0}")]
    Config(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
