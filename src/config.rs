use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::lock::LockOptions;
use crate::storage::BackendLocal;

pub const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model (bge-small keeps rebuilds of large trees tolerable)
const DEFAULT_MODEL: &str = "bge-small-en-v1.5";
/// Default minimum confidence, in percent
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 60.0;
const DEFAULT_SOFT_MAX_BYTES: usize = 1500;
const DEFAULT_HARD_MAX_BYTES: usize = 4000;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 8;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 0;
const DEFAULT_STALE_GRACE_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2000;
const DEFAULT_KEEP_GENERATIONS: usize = 1;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Chunk size policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPolicy {
    /// Chunks grow block by block while they stay under this size
    #[serde(default = "default_soft_max_bytes")]
    pub soft_max_bytes: usize,

    /// Embedded text of an oversized atomic block is cut to this size
    #[serde(default = "default_hard_max_bytes")]
    pub hard_max_bytes: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            soft_max_bytes: DEFAULT_SOFT_MAX_BYTES,
            hard_max_bytes: DEFAULT_HARD_MAX_BYTES,
        }
    }
}

fn default_soft_max_bytes() -> usize {
    DEFAULT_SOFT_MAX_BYTES
}

fn default_hard_max_bytes() -> usize {
    DEFAULT_HARD_MAX_BYTES
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Model name for embeddings (e.g., "bge-small-en-v1.5", "hash-trigram-256")
    #[serde(default = "default_model")]
    pub model: String,

    /// Default minimum confidence for queries [0, 100]
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default)]
    pub chunk: ChunkPolicy,

    /// Parallelism for embedding generation: "auto" or a positive integer
    #[serde(default = "default_embedding_parallelism")]
    pub embedding_parallelism: String,

    /// Consecutive chunk embedding failures that abort a rebuild
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,

    /// How long a rebuild waits for the write lock; 0 fails immediately
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Age a dead holder's heartbeat must reach before its lock is reclaimed
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Superseded generations kept on disk after a commit
    #[serde(default = "default_keep_generations")]
    pub keep_generations: usize,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(skip_serializing, skip_deserializing)]
    store: Option<BackendLocal>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            chunk: ChunkPolicy::default(),
            embedding_parallelism: "auto".to_string(),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            stale_grace_secs: DEFAULT_STALE_GRACE_SECS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            keep_generations: DEFAULT_KEEP_GENERATIONS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            store: None,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_confidence_threshold() -> f32 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_embedding_parallelism() -> String {
    "auto".to_string()
}

fn default_max_consecutive_failures() -> usize {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_stale_grace_secs() -> u64 {
    DEFAULT_STALE_GRACE_SECS
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_keep_generations() -> usize {
    DEFAULT_KEEP_GENERATIONS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

/// Reject thresholds outside [0, 100].
pub fn validate_threshold(value: f32) -> Result<f32> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(EngineError::InvalidThreshold(value))
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        validate_threshold(self.confidence_threshold)?;

        if self.model.trim().is_empty() {
            return Err(EngineError::Config("model must not be empty".to_string()));
        }

        if self.chunk.soft_max_bytes == 0 {
            return Err(EngineError::Config(
                "chunk.soft_max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.chunk.hard_max_bytes < self.chunk.soft_max_bytes {
            return Err(EngineError::Config(format!(
                "chunk.hard_max_bytes ({}) must be at least chunk.soft_max_bytes ({})",
                self.chunk.hard_max_bytes, self.chunk.soft_max_bytes
            )));
        }

        // "auto" or positive integer
        if self.embedding_parallelism != "auto" {
            match self.embedding_parallelism.parse::<u32>() {
                Ok(0) | Err(_) => {
                    return Err(EngineError::Config(format!(
                        "embedding_parallelism must be 'auto' or a positive integer, got '{}'",
                        self.embedding_parallelism
                    )))
                }
                Ok(_) => {}
            }
        }

        if self.max_consecutive_failures == 0 {
            return Err(EngineError::Config(
                "max_consecutive_failures must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(EngineError::Config(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.download_timeout_secs == 0 {
            return Err(EngineError::Config(
                "download_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of chunks embedded concurrently.
    pub fn parallelism(&self) -> usize {
        self.embedding_parallelism
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.lock_timeout_ms),
            stale_grace: Duration::from_secs(self.stale_grace_secs),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        }
    }

    /// Load the config record of an index location, creating it with
    /// defaults when missing.
    pub fn load_with(base_path: &Path) -> Result<Self> {
        let store = BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            let defaults = serde_yml::to_string(&Self::default())
                .map_err(|e| EngineError::Config(e.to_string()))?;
            store.write(CONFIG_FILE, defaults.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .map_err(|_| EngineError::Config("config file is not valid utf8".to_string()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .map_err(|e| EngineError::Config(format!("config is malformed: {e}")))?;

        config.validate()?;
        config.store = Some(store);

        // resave in case config version needs an upgrade
        let normalized =
            serde_yml::to_string(&config).map_err(|e| EngineError::Config(e.to_string()))?;
        if config_str != normalized {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Err(EngineError::Config(
                "config was not loaded from an index location".to_string(),
            ));
        };

        let config_str =
            serde_yml::to_string(&self).map_err(|e| EngineError::Config(e.to_string()))?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    /// Persist a new default confidence threshold. Out-of-range values are
    /// rejected and the stored value is left untouched.
    pub fn set_confidence_threshold(&mut self, value: f32) -> Result<()> {
        let value = validate_threshold(value)?;
        let previous = self.confidence_threshold;
        self.confidence_threshold = value;
        if let Err(err) = self.save() {
            self.confidence_threshold = previous;
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert_eq!(config.model, DEFAULT_MODEL);
        assert!((config.confidence_threshold - DEFAULT_CONFIDENCE_THRESHOLD).abs() < f32::EPSILON);
        assert!(tmp.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_threshold_persists_across_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::load_with(tmp.path()).unwrap();
        config.set_confidence_threshold(75.0).unwrap();

        let reloaded = Config::load_with(tmp.path()).unwrap();
        assert!((reloaded.confidence_threshold - 75.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_threshold_keeps_previous_value() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::load_with(tmp.path()).unwrap();
        config.set_confidence_threshold(42.0).unwrap();

        for bad in [-1.0, 100.5, f32::NAN, f32::INFINITY] {
            let result = config.set_confidence_threshold(bad);
            assert!(matches!(result, Err(EngineError::InvalidThreshold(_))));
        }

        assert!((config.confidence_threshold - 42.0).abs() < f32::EPSILON);
        let reloaded = Config::load_with(tmp.path()).unwrap();
        assert!((reloaded.confidence_threshold - 42.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "model: hash-trigram-64\n").unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.model, "hash-trigram-64");
        assert_eq!(config.chunk, ChunkPolicy::default());
        assert_eq!(config.keep_generations, DEFAULT_KEEP_GENERATIONS);
    }

    #[test]
    fn test_rejects_bad_parallelism() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "embedding_parallelism: '0'\n").unwrap();

        let result = Config::load_with(tmp.path());
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_hard_max_below_soft_max() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "chunk:\n  soft_max_bytes: 100\n  hard_max_bytes: 50\n",
        )
        .unwrap();

        assert!(Config::load_with(tmp.path()).is_err());
    }

    #[test]
    fn test_parallelism_parses_integer() {
        let config = Config {
            embedding_parallelism: "3".to_string(),
            ..Config::default()
        };
        assert_eq!(config.parallelism(), 3);
        assert!(Config::default().parallelism() >= 1);
    }
}
