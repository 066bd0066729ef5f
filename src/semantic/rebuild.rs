//! Rebuild sessions.
//!
//! A rebuild takes the write lock, turns every unit of a source into chunk
//! records and vectors, and commits them as a new generation. Queries keep
//! reading the previous generation until the commit swaps `CURRENT`.
//!
//! State machine of one session:
//!
//! ```text
//! Idle -> LockAcquiring -> Building -> Committing -> Idle
//!              |              |            |
//!              v              v            v
//!          Rejected -> Idle  Aborted -> Idle
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::analytics::BuildAnalytics;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::lock::{LockToken, WriteLock};
use crate::semantic::chunker::{chunk_id, chunk_unit};
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::index::IndexError;
use crate::semantic::snapshot::{BuildSession, ChunkRecord, Generation, GenerationId, SnapshotManager};
use crate::sources::{UnitInput, UnitSource};
use crate::storage::BackendLocal;

/// Texts per `embed_batch` call
const EMBED_GROUP_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildState {
    Idle,
    LockAcquiring,
    Building,
    Committing,
    Aborted,
    Rejected,
}

impl RebuildState {
    pub fn can_transition_to(self, next: RebuildState) -> bool {
        use RebuildState::*;
        matches!(
            (self, next),
            (Idle, LockAcquiring)
                | (LockAcquiring, Building)
                | (LockAcquiring, Rejected)
                | (Building, Committing)
                | (Building, Aborted)
                | (Committing, Idle)
                | (Committing, Aborted)
                | (Aborted, Idle)
                | (Rejected, Idle)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildMode {
    /// Re-embed every chunk
    Full,
    /// Reuse vectors of chunks that did not change
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildSummary {
    pub generation_id: GenerationId,
    pub mode: RebuildMode,
    pub units: usize,
    pub chunks: usize,
    /// Chunks whose vector came from the previous generation
    pub reused: usize,
    /// Units whose revision had not moved and were carried over unchanged
    pub unchanged_units: usize,
    pub embedded: usize,
    /// Chunks left out because no embedding could be produced
    pub skipped: usize,
    pub duration_ms: u64,
    pub model_id: String,
    pub embedding_dim: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RebuildEvent {
    StateChanged {
        state: RebuildState,
    },
    Started {
        total_units: usize,
        mode: RebuildMode,
    },
    Progress {
        processed_units: usize,
        total_units: usize,
        chunks: usize,
        current_unit: String,
    },
    Completed {
        summary: RebuildSummary,
    },
    Error {
        message: String,
    },
}

/// Shared cancellation request, checked between units and between
/// embedding batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// State of one rebuild session, readable from other threads.
#[derive(Debug, Clone)]
pub struct SessionState(Arc<Mutex<RebuildState>>);

impl Default for SessionState {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(RebuildState::Idle)))
    }
}

impl SessionState {
    pub fn get(&self) -> RebuildState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transition(&self, next: RebuildState) -> Result<()> {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        log::debug!("rebuild state {:?} -> {:?}", *state, next);
        *state = next;
        Ok(())
    }
}

struct PendingChunk {
    record: ChunkRecord,
    text: String,
}

#[derive(Default)]
struct Counters {
    reused: usize,
    unchanged_units: usize,
    embedded: usize,
    skipped: usize,
    consecutive_failures: usize,
    last_failure: Option<String>,
}

/// Everything one rebuild session needs.
pub struct RebuildContext<'a> {
    pub snapshots: &'a SnapshotManager,
    pub embedder: &'a dyn Embedder,
    pub config: &'a Config,
    pub cancel: &'a CancelFlag,
    pub state: &'a SessionState,
}

impl RebuildContext<'_> {
    /// Run one session to completion. Every path ends in `Idle`.
    pub fn run(
        &self,
        mode: RebuildMode,
        source: &dyn UnitSource,
        on_event: &mut dyn FnMut(RebuildEvent),
    ) -> Result<RebuildSummary> {
        let started = Instant::now();
        let store = BackendLocal::new(self.snapshots.dir())?;

        self.enter(RebuildState::LockAcquiring, on_event)?;
        let lock = WriteLock::new(self.snapshots.dir(), self.config.lock_options());
        let token = match lock.acquire() {
            Ok(token) => token,
            Err(err) => {
                log::warn!("rebuild rejected: {err}");
                self.enter(RebuildState::Rejected, on_event)?;
                self.enter(RebuildState::Idle, on_event)?;
                on_event(RebuildEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };
        self.enter(RebuildState::Building, on_event)?;
        record_analytics(&store, |a| a.last_attempt_ts = Some(Utc::now()));

        match self.build(mode, source, on_event, started) {
            Ok(summary) => {
                self.enter(RebuildState::Idle, on_event)?;
                record_analytics(&store, |a| {
                    a.last_success_ts = Some(Utc::now());
                    a.last_duration_ms = Some(summary.duration_ms);
                    a.build_count += 1;
                    a.last_error = None;
                    a.last_generation = Some(summary.generation_id);
                });
                log::info!(
                    "rebuild committed generation {} ({} chunks, {} reused, {} embedded, {} skipped) in {}ms",
                    summary.generation_id,
                    summary.chunks,
                    summary.reused,
                    summary.embedded,
                    summary.skipped,
                    summary.duration_ms
                );
                release(token);
                on_event(RebuildEvent::Completed {
                    summary: summary.clone(),
                });
                Ok(summary)
            }
            Err(err) => {
                log::error!("rebuild aborted: {err}");
                if let Err(transition) = self
                    .enter(RebuildState::Aborted, on_event)
                    .and_then(|_| self.enter(RebuildState::Idle, on_event))
                {
                    log::error!("{transition}");
                }
                record_analytics(&store, |a| {
                    a.last_duration_ms = Some(started.elapsed().as_millis() as u64);
                    a.last_error = Some(err.to_string());
                });
                release(token);
                on_event(RebuildEvent::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn enter(&self, next: RebuildState, on_event: &mut dyn FnMut(RebuildEvent)) -> Result<()> {
        self.state.transition(next)?;
        on_event(RebuildEvent::StateChanged { state: next });
        Ok(())
    }

    fn build(
        &self,
        requested: RebuildMode,
        source: &dyn UnitSource,
        on_event: &mut dyn FnMut(RebuildEvent),
        started: Instant,
    ) -> Result<RebuildSummary> {
        let model_id = self.embedder.model_id().to_string();
        let dimensions = self.embedder.dimensions();

        let previous = match self.snapshots.current_generation() {
            Ok(previous) => previous,
            Err(err) => {
                log::warn!("previous generation unusable, rebuilding from scratch: {err}");
                None
            }
        };
        let previous = match (requested, previous) {
            (RebuildMode::Incremental, Some(previous)) => {
                let manifest = &previous.manifest;
                if manifest.model_id != model_id
                    || manifest.embedding_dim != dimensions
                    || manifest.chunk_policy != self.config.chunk
                {
                    log::info!(
                        "generation {} was built with different model or chunk settings, running a full rebuild",
                        previous.id
                    );
                    None
                } else {
                    Some(previous)
                }
            }
            _ => None,
        };
        let mode = if previous.is_some() {
            RebuildMode::Incremental
        } else {
            RebuildMode::Full
        };

        let mut units = source.units()?;
        units.sort_by(|a, b| a.unit.unit_id.cmp(&b.unit.unit_id));
        units.dedup_by(|later, first| {
            let duplicate = later.unit.unit_id == first.unit.unit_id;
            if duplicate {
                log::warn!("ignoring duplicate unit {}", later.unit.unit_id);
            }
            duplicate
        });
        let total_units = units.len();
        log::info!("{:?} rebuild of {} units with {}", mode, total_units, model_id);
        on_event(RebuildEvent::Started { total_units, mode });

        let mut session = self.snapshots.begin_build(
            &model_id,
            dimensions,
            self.config.chunk,
            self.config.confidence_threshold,
        )?;

        let by_hash: HashMap<&str, u64> = previous
            .as_deref()
            .map(|generation| {
                generation
                    .chunks()
                    .iter()
                    .map(|c| (c.content_hash.as_str(), c.chunk_id))
                    .collect()
            })
            .unwrap_or_default();

        // a generation with skipped chunks must re-chunk to retry them
        let revisions: HashMap<&str, &str> = previous
            .as_deref()
            .filter(|generation| generation.manifest.skipped_chunks == 0)
            .map(Generation::unit_revisions)
            .unwrap_or_default();

        let parallelism = self.config.parallelism();
        let batch_size = parallelism * EMBED_GROUP_SIZE;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("gendex-embed-{i}"))
            .build()
            .map_err(std::io::Error::other)?;

        let mut counters = Counters::default();
        let mut pending: Vec<PendingChunk> = Vec::new();

        for (processed, input) in units.iter().enumerate() {
            self.cancel.check()?;
            session.add_unit(&input.unit.unit_id);

            let unchanged =
                revisions.get(input.unit.unit_id.as_str()) == Some(&input.unit.revision.as_str());
            if let Some(generation) = previous.as_deref().filter(|_| unchanged) {
                if let Some(carried) = carry_unit(generation, input, &mut session)? {
                    counters.reused += carried;
                    counters.unchanged_units += 1;
                    on_event(RebuildEvent::Progress {
                        processed_units: processed + 1,
                        total_units,
                        chunks: session.chunk_count() + pending.len(),
                        current_unit: input.unit.unit_id.clone(),
                    });
                    continue;
                }
            }

            for chunk in self.plan_unit(input, &model_id) {
                let reusable = previous.as_deref().and_then(|generation| {
                    reusable_vector(generation, &by_hash, &chunk.record)
                });
                match reusable {
                    Some(vector) => {
                        session.add_chunk(chunk.record, vector)?;
                        counters.reused += 1;
                    }
                    None => pending.push(chunk),
                }
            }

            while pending.len() >= batch_size {
                self.cancel.check()?;
                self.embed_pending(&pool, &mut pending, &mut session, &mut counters)?;
            }

            on_event(RebuildEvent::Progress {
                processed_units: processed + 1,
                total_units,
                chunks: session.chunk_count() + pending.len(),
                current_unit: input.unit.unit_id.clone(),
            });
        }

        while !pending.is_empty() {
            self.cancel.check()?;
            self.embed_pending(&pool, &mut pending, &mut session, &mut counters)?;
        }
        self.cancel.check()?;

        // nothing but failures means the backend is down, however few there were
        if counters.embedded == 0 && counters.reused == 0 && counters.skipped > 0 {
            return Err(EngineError::EmbeddingBackendDown {
                consecutive: counters.consecutive_failures,
                last_error: counters.last_failure.unwrap_or_default(),
            });
        }

        let units = session.unit_count();
        let chunks = session.chunk_count();

        self.enter(RebuildState::Committing, on_event)?;
        let generation_id = self.snapshots.commit(session, self.cancel)?;

        Ok(RebuildSummary {
            generation_id,
            mode,
            units,
            chunks,
            reused: counters.reused,
            unchanged_units: counters.unchanged_units,
            embedded: counters.embedded,
            skipped: counters.skipped,
            duration_ms: started.elapsed().as_millis() as u64,
            model_id,
            embedding_dim: dimensions,
        })
    }

    /// Chunks of one unit. Blank spans are dropped unless the whole unit is
    /// blank, which still gets one chunk.
    fn plan_unit(&self, input: &UnitInput, model_id: &str) -> Vec<PendingChunk> {
        let mut spans = chunk_unit(&input.content, &self.config.chunk);
        if spans.iter().any(|span| !span.text.trim().is_empty()) {
            spans.retain(|span| !span.text.trim().is_empty());
        } else {
            spans.truncate(1);
        }

        spans
            .into_iter()
            .map(|span| {
                let id = chunk_id(
                    &input.unit.unit_id,
                    span.start,
                    span.end,
                    &span.content_hash,
                    model_id,
                );
                PendingChunk {
                    record: ChunkRecord {
                        chunk_id: id,
                        unit_id: input.unit.unit_id.clone(),
                        unit_revision: input.unit.revision.clone(),
                        unit_fingerprint: input.unit.fingerprint.clone(),
                        start_offset: span.start,
                        end_offset: span.end,
                        content_hash: span.content_hash.clone(),
                        model_id: model_id.to_string(),
                        truncated: span.truncated,
                        snippet: span.snippet(),
                    },
                    text: span.text,
                }
            })
            .collect()
    }

    /// Embed up to one batch of pending chunks on the pool and add them to
    /// the session. A chunk that cannot be embedded is skipped; too many
    /// failures in a row abort the session.
    fn embed_pending(
        &self,
        pool: &rayon::ThreadPool,
        pending: &mut Vec<PendingChunk>,
        session: &mut BuildSession,
        counters: &mut Counters,
    ) -> Result<()> {
        let take = pending.len().min(self.config.parallelism() * EMBED_GROUP_SIZE);
        let batch: Vec<PendingChunk> = pending.drain(..take).collect();
        let embedder = self.embedder;

        let results: Vec<Vec<std::result::Result<Vec<f32>, EmbeddingError>>> = pool.install(|| {
            batch
                .par_chunks(EMBED_GROUP_SIZE)
                .map(|group| embed_group(embedder, group))
                .collect()
        });

        for (chunk, result) in batch.into_iter().zip(results.into_iter().flatten()) {
            let failure = match result {
                Ok(vector) => match session.add_chunk(chunk.record.clone(), vector) {
                    Ok(()) => None,
                    Err(EngineError::Index(
                        err @ (IndexError::ZeroNormVector | IndexError::DimensionMismatch { .. }),
                    )) => Some(err.to_string()),
                    Err(err) => return Err(err),
                },
                Err(err) => Some(err.to_string()),
            };

            match failure {
                None => {
                    counters.embedded += 1;
                    counters.consecutive_failures = 0;
                }
                Some(reason) => {
                    let unavailable = EngineError::EmbeddingUnavailable {
                        unit_id: chunk.record.unit_id.clone(),
                        chunk_id: chunk.record.chunk_id,
                        reason: reason.clone(),
                    };
                    log::warn!("{unavailable}");
                    session.record_skipped(1);
                    counters.skipped += 1;
                    counters.consecutive_failures += 1;

                    if counters.consecutive_failures >= self.config.max_consecutive_failures {
                        return Err(EngineError::EmbeddingBackendDown {
                            consecutive: counters.consecutive_failures,
                            last_error: reason,
                        });
                    }
                    counters.last_failure = Some(reason);
                }
            }
        }
        Ok(())
    }
}

/// Copy the records and vectors of a unit from the previous generation.
/// Returns `None` when the previous chunks no longer match the unit's
/// content, in which case the unit is chunked again.
fn carry_unit(
    previous: &Generation,
    input: &UnitInput,
    session: &mut BuildSession,
) -> Result<Option<usize>> {
    let mut carried = Vec::new();
    for record in previous.unit_chunks(&input.unit.unit_id) {
        if record.unit_fingerprint != input.unit.fingerprint {
            return Ok(None);
        }
        let Some(vector) = previous.vector(record.chunk_id) else {
            return Ok(None);
        };
        carried.push((record.clone(), vector.to_vec()));
    }
    if carried.is_empty() {
        return Ok(None);
    }

    let count = carried.len();
    for (record, vector) in carried {
        session.add_chunk(record, vector)?;
    }
    Ok(Some(count))
}

/// Vector of an unchanged chunk (same id) or of identical text elsewhere in
/// the previous generation.
fn reusable_vector(
    previous: &Generation,
    by_hash: &HashMap<&str, u64>,
    record: &ChunkRecord,
) -> Option<Vec<f32>> {
    if let Some(vector) = previous.vector(record.chunk_id) {
        return Some(vector.to_vec());
    }
    let id = by_hash.get(record.content_hash.as_str())?;
    previous.vector(*id).map(<[f32]>::to_vec)
}

/// One `embed_batch` call, falling back to per-text calls so a single bad
/// text does not fail its neighbours.
fn embed_group(
    embedder: &dyn Embedder,
    group: &[PendingChunk],
) -> Vec<std::result::Result<Vec<f32>, EmbeddingError>> {
    let texts: Vec<String> = group.iter().map(|c| c.text.clone()).collect();
    match embedder.embed_batch(&texts) {
        Ok(vectors) if vectors.len() == texts.len() => vectors.into_iter().map(Ok).collect(),
        Ok(vectors) => {
            log::debug!(
                "embed_batch returned {} vectors for {} texts, retrying one by one",
                vectors.len(),
                texts.len()
            );
            texts.iter().map(|text| embedder.embed(text)).collect()
        }
        Err(err) => {
            log::debug!("embed_batch failed ({err}), retrying one by one");
            texts.iter().map(|text| embedder.embed(text)).collect()
        }
    }
}

fn record_analytics(store: &BackendLocal, update: impl FnOnce(&mut BuildAnalytics)) {
    if let Err(err) = BuildAnalytics::update(store, update) {
        log::warn!("failed to update build analytics: {err}");
    }
}

fn release(token: LockToken) {
    log::debug!("releasing write lock of session {}", token.session_id());
    token.release();
}
