use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analytics::{
    BuildAnalytics, QueryAnalytics, QueryEvent, QueryStats, BUILD_ANALYTICS_FILE, QUERY_LOG_FILE,
    QUERY_TOTALS_FILE,
};
use crate::config::{validate_threshold, Config};
use crate::error::{EngineError, Result};
use crate::lock::{LockState, WriteLock};
use crate::semantic::embeddings::{load_embedder, Embedder};
use crate::semantic::query::{confidence_from_similarity, rank, QueryResponse};
use crate::semantic::rebuild::{
    CancelFlag, RebuildContext, RebuildEvent, RebuildMode, RebuildState, RebuildSummary,
    SessionState,
};
use crate::semantic::snapshot::{GenerationId, SnapshotManager, VerifyReport};
use crate::sources::UnitSource;
use crate::storage::BackendLocal;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub model: String,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub dir: PathBuf,
    pub model_id: String,
    pub generation: Option<GenerationId>,
    /// Model the served generation was built with
    pub generation_model: Option<String>,
    pub chunk_count: usize,
    pub unit_count: usize,
    pub skipped_chunks: usize,
    pub confidence_threshold: f32,
    pub last_rebuild: Option<DateTime<Utc>>,
    pub last_rebuild_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub build_count: u64,
    pub lock: LockState,
    pub rebuild_required: bool,
    pub rebuild_reasons: Vec<String>,
    pub queries: QueryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanReport {
    pub removed_generations: usize,
}

/// A semantic index living in one directory.
///
/// Queries are lock-free and may run while a rebuild is in progress; they
/// always read the last committed generation.
pub struct Engine {
    dir: PathBuf,
    config: RwLock<Config>,
    embedder: Arc<dyn Embedder>,
    snapshots: SnapshotManager,
    analytics: QueryAnalytics,
}

impl Engine {
    /// Open `dir` with the embedding backend named in its config.
    pub fn load(dir: &Path) -> Result<Self> {
        let config = Config::load_with(dir)?;
        let embedder = load_embedder(
            &config.model,
            dir.to_path_buf(),
            Some(Duration::from_secs(config.download_timeout_secs)),
        )?;
        Self::open(dir, embedder)
    }

    pub fn open(dir: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let config = Config::load_with(dir)?;
        if config.model != embedder.model_id() {
            log::debug!(
                "configured model '{}' overridden by '{}'",
                config.model,
                embedder.model_id()
            );
        }

        let snapshots = SnapshotManager::open(dir, config.keep_generations)?;
        let analytics = QueryAnalytics::with_log(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            config: RwLock::new(config),
            embedder,
            snapshots,
            analytics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Build a new generation from `source` on the calling thread.
    pub fn rebuild(
        &self,
        mode: RebuildMode,
        source: &dyn UnitSource,
        on_event: &mut dyn FnMut(RebuildEvent),
    ) -> Result<RebuildSummary> {
        self.rebuild_with(mode, source, &CancelFlag::new(), &SessionState::default(), on_event)
    }

    fn rebuild_with(
        &self,
        mode: RebuildMode,
        source: &dyn UnitSource,
        cancel: &CancelFlag,
        state: &SessionState,
        on_event: &mut dyn FnMut(RebuildEvent),
    ) -> Result<RebuildSummary> {
        let config = self.config();
        let ctx = RebuildContext {
            snapshots: &self.snapshots,
            embedder: self.embedder.as_ref(),
            config: &config,
            cancel,
            state,
        };
        ctx.run(mode, source, on_event)
    }

    /// Run a rebuild on a background thread.
    pub fn spawn_rebuild(
        self: &Arc<Self>,
        mode: RebuildMode,
        source: Arc<dyn UnitSource>,
        mut on_event: impl FnMut(RebuildEvent) + Send + 'static,
    ) -> Result<RebuildHandle> {
        let cancel = CancelFlag::new();
        let state = SessionState::default();

        let engine = Arc::clone(self);
        let thread_cancel = cancel.clone();
        let thread_state = state.clone();
        let thread = std::thread::Builder::new()
            .name("gendex-rebuild".to_string())
            .spawn(move || {
                engine.rebuild_with(
                    mode,
                    source.as_ref(),
                    &thread_cancel,
                    &thread_state,
                    &mut on_event,
                )
            })?;

        Ok(RebuildHandle {
            cancel,
            state,
            thread,
        })
    }

    pub fn query(&self, text: &str, k: usize, min_confidence: Option<f32>) -> Result<QueryResponse> {
        let min_confidence = match min_confidence {
            Some(value) => validate_threshold(value)?,
            None => self.config().confidence_threshold,
        };

        let generation = self
            .snapshots
            .current_generation()?
            .ok_or(EngineError::NotIndexed)?;
        if generation.manifest.model_id != self.embedder.model_id() {
            return Err(EngineError::ModelMismatch {
                generation: generation.id,
                index_model: generation.manifest.model_id.clone(),
                active_model: self.embedder.model_id().to_string(),
            });
        }

        let started = Instant::now();
        let vector = self.embedder.embed(text)?;
        let hits = generation.index().search(&vector, k)?;
        let results = rank(&generation, &hits, min_confidence);
        let latency_us = started.elapsed().as_micros() as u64;

        log::debug!(
            "query returned {} of {} candidates at min confidence {} in {}us",
            results.len(),
            hits.len(),
            min_confidence,
            latency_us
        );

        self.analytics.record(&QueryEvent {
            ts: Utc::now(),
            generation: Some(generation.id),
            k,
            min_confidence,
            candidate_confidences: hits
                .iter()
                .map(|hit| confidence_from_similarity(hit.score))
                .collect(),
            returned: results.len(),
            latency_us,
        });

        Ok(QueryResponse {
            query: text.to_string(),
            generation: generation.id,
            model_id: generation.manifest.model_id.clone(),
            k,
            min_confidence,
            candidates: hits.len(),
            results,
        })
    }

    pub fn get_settings(&self) -> Settings {
        let config = self.config();
        Settings {
            model: config.model,
            confidence_threshold: config.confidence_threshold,
        }
    }

    /// Persist a new default confidence threshold.
    pub fn set_settings(&self, confidence_threshold: f32) -> Result<Settings> {
        {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            config.set_confidence_threshold(confidence_threshold)?;
        }
        log::info!("default confidence threshold set to {confidence_threshold}");
        Ok(self.get_settings())
    }

    /// Counters of queries answered by this process.
    pub fn query_stats(&self) -> QueryStats {
        self.analytics.stats()
    }

    pub fn status(&self) -> Result<Status> {
        let config = self.config();
        let generation = self.snapshots.current_generation()?;
        let recovery = self.snapshots.recovery();
        let build = BuildAnalytics::load(&BackendLocal::new(&self.dir)?);
        let queries = QueryAnalytics::from_dir(&self.dir)?.stats();
        let lock = WriteLock::new(&self.dir, config.lock_options()).inspect();

        Ok(Status {
            dir: self.dir.clone(),
            model_id: self.embedder.model_id().to_string(),
            generation: generation.as_ref().map(|g| g.id),
            generation_model: generation.as_ref().map(|g| g.manifest.model_id.clone()),
            chunk_count: generation.as_ref().map_or(0, |g| g.manifest.chunk_count),
            unit_count: generation.as_ref().map_or(0, |g| g.manifest.unit_count),
            skipped_chunks: generation.as_ref().map_or(0, |g| g.manifest.skipped_chunks),
            confidence_threshold: config.confidence_threshold,
            last_rebuild: build.last_success_ts,
            last_rebuild_duration_ms: build.last_duration_ms,
            last_error: build.last_error,
            build_count: build.build_count,
            lock,
            rebuild_required: recovery.rebuild_required,
            rebuild_reasons: recovery.reasons,
            queries,
        })
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        self.snapshots.verify()
    }

    /// Remove every generation and the analytics records. Settings are
    /// kept. Fails with `IndexBusy` while a rebuild holds the lock.
    pub fn clean(&self) -> Result<CleanReport> {
        let token = WriteLock::new(&self.dir, self.config().lock_options()).acquire()?;

        let removed_generations = self.snapshots.clean()?;
        let store = BackendLocal::new(&self.dir)?;
        for name in [BUILD_ANALYTICS_FILE, QUERY_LOG_FILE, QUERY_TOTALS_FILE] {
            match store.delete(name) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        token.release();
        Ok(CleanReport {
            removed_generations,
        })
    }
}

/// A rebuild running on its own thread.
pub struct RebuildHandle {
    cancel: CancelFlag,
    state: SessionState,
    thread: JoinHandle<Result<RebuildSummary>>,
}

impl RebuildHandle {
    /// Ask the rebuild to stop at the next unit or batch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> RebuildState {
        self.state.get()
    }

    pub fn join(self) -> Result<RebuildSummary> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::other("rebuild thread panicked").into()),
        }
    }
}
