//! Embedding backends.
//!
//! The engine only talks to the [`Embedder`] trait. Two backends ship:
//! - `FastEmbedModel`: fastembed ONNX models, downloaded on first use
//! - `HashingEmbedder`: character-trigram feature hashing, deterministic and
//!   offline, model ids of the form `hash-trigram-<dim>`

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Model id prefix selecting the hashing backend
pub const HASHING_MODEL_PREFIX: &str = "hash-trigram-";

/// Dimensions used by the hashing backend when the model id carries none
pub const DEFAULT_HASHING_DIMENSIONS: usize = 512;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Text → vector function, versioned by model id.
///
/// Implementations must be deterministic for a given model id and callable
/// from several threads at once.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Open the backend named by `model_name`.
pub fn load_embedder(
    model_name: &str,
    cache_dir: PathBuf,
    download_timeout: Option<Duration>,
) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    if model_name.starts_with(HASHING_MODEL_PREFIX) {
        return Ok(Arc::new(HashingEmbedder::from_model_id(model_name)?));
    }
    Ok(Arc::new(FastEmbedModel::new(
        model_name,
        cache_dir,
        download_timeout,
    )?))
}

/// Compute SHA256 hash of a model id for storage identification.
pub fn model_id_hash(model_id: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.finalize().into()
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastEmbedModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let (model_enum, canonical) = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        // Ensure cache directory exists
        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        // the first load downloads the model; give up waiting after `timeout`
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("gendex-model-load".to_string())
            .spawn(move || {
                let _ = tx.send(TextEmbedding::try_new(options));
            })
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let mut model = match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(|e| EmbeddingError::InitFailed(e.to_string()))?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(EmbeddingError::Unavailable(format!(
                    "model '{canonical}' was not ready after {}s",
                    timeout.as_secs()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(EmbeddingError::InitFailed(format!(
                    "loader for model '{canonical}' exited"
                )))
            }
        };

        // Get model dimensions by embedding a test string
        let dimensions = Self::probe_dimensions(&mut model)?;

        log::info!("Loaded embedding model '{}' ({} dims)", canonical, dimensions);

        Ok(Self {
            model: Mutex::new(model),
            model_name: canonical.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum and its canonical id.
    fn parse_model_name(
        name: &str,
    ) -> Result<(fastembed::EmbeddingModel, &'static str), EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => {
                Ok((fastembed::EmbeddingModel::AllMiniLML6V2, "all-minilm-l6-v2"))
            }
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok((fastembed::EmbeddingModel::AllMiniLML6V2Q, "all-minilm-l6-v2-q"))
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => {
                Ok((fastembed::EmbeddingModel::BGESmallENV15, "bge-small-en-v1.5"))
            }
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok((fastembed::EmbeddingModel::BGESmallENV15Q, "bge-small-en-v1.5-q"))
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => {
                Ok((fastembed::EmbeddingModel::BGEBaseENV15, "bge-base-en-v1.5"))
            }
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok((fastembed::EmbeddingModel::BGEBaseENV15Q, "bge-base-en-v1.5-q"))
            }
            "bge-large-en-v1.5" | "bgelargeenv15" => {
                Ok((fastembed::EmbeddingModel::BGELargeENV15, "bge-large-en-v1.5"))
            }
            "bge-large-en-v1.5-q" | "bgelargeenv15q" => {
                Ok((fastembed::EmbeddingModel::BGELargeENV15Q, "bge-large-en-v1.5-q"))
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized), hash-trigram-<dim>",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for FastEmbedModel {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::Unavailable(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::Unavailable(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

/// Feature-hashing embedder over padded character trigrams of each word.
///
/// Words are lowercased runs of alphanumeric characters; `"add"` yields the
/// features `^ad`, `add`, `dd$`. Each feature adds ±1 to one bucket (FNV-1a
/// picks bucket and sign) and the result is L2-normalized.
pub struct HashingEmbedder {
    model_id: String,
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            model_id: format!("{HASHING_MODEL_PREFIX}{dimensions}"),
            dimensions,
        }
    }

    /// Build from an id such as `hash-trigram-512`; a bare prefix uses the
    /// default dimensions.
    pub fn from_model_id(model_id: &str) -> Result<Self, EmbeddingError> {
        let suffix = model_id
            .strip_prefix(HASHING_MODEL_PREFIX)
            .ok_or_else(|| EmbeddingError::InvalidModel(model_id.to_string()))?;

        if suffix.is_empty() {
            return Ok(Self::new(DEFAULT_HASHING_DIMENSIONS));
        }

        match suffix.parse::<usize>() {
            Ok(dimensions) if dimensions > 0 => Ok(Self::new(dimensions)),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "{model_id}: dimensions must be a positive integer"
            ))),
        }
    }

    fn features(text: &str) -> Vec<String> {
        let mut features = Vec::new();
        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty());

        for word in words {
            let padded: Vec<char> = std::iter::once('^')
                .chain(word.chars().flat_map(char::to_lowercase))
                .chain(std::iter::once('$'))
                .collect();
            for window in padded.windows(3) {
                features.push(window.iter().collect());
            }
        }

        if features.is_empty() {
            features.push("<empty>".to_string());
        }
        features
    }

    fn fnv1a(feature: &str) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in feature.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimensions];

        for feature in Self::features(text) {
            let hash = Self::fnv1a(&feature);
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            // every feature cancelled out; fall back to a fixed direction
            vector[0] = 1.0;
            return Ok(vector);
        }
        for value in vector.iter_mut() {
            *value /= norm;
        }
        Ok(vector)
    }
}
