//! Generations on disk and the `CURRENT` pointer.
//!
//! Layout of an index directory:
//! - `CURRENT` holds the id of the committed generation readers should use
//! - `gen-<id>/` is an immutable generation: `manifest.json`, `chunks.jsonl`,
//!   `vectors.bin`, `graph.bin`
//! - `gen-<id>.partial/` is a generation still being written
//!
//! A commit writes everything into the partial directory, reloads it to make
//! sure it is complete, renames it into place and only then swaps `CURRENT`.
//! Readers therefore see either the old or the new generation.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ChunkPolicy;
use crate::error::{EngineError, Result};
use crate::lock::{LockOptions, LockState, WriteLock};
use crate::semantic::embeddings::model_id_hash;
use crate::semantic::index::{HnswParams, IndexError, VectorIndex};
use crate::semantic::rebuild::CancelFlag;
use crate::semantic::storage::{VectorStorage, VectorStorageError};
use crate::storage::{sync_dir, BackendLocal};

pub const CURRENT_FILE: &str = "CURRENT";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CHUNKS_FILE: &str = "chunks.jsonl";
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const GENERATION_PREFIX: &str = "gen-";
const PARTIAL_SUFFIX: &str = ".partial";

/// Monotonically increasing generation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(pub u64);

impl GenerationId {
    pub fn dir_name(self) -> String {
        format!("{GENERATION_PREFIX}{}", self.0)
    }

    pub fn partial_dir_name(self) -> String {
        format!("{GENERATION_PREFIX}{}{PARTIAL_SUFFIX}", self.0)
    }
}

impl Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenerationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(GenerationId)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation_id: GenerationId,
    pub model_id: String,
    pub embedding_dim: usize,
    pub chunk_count: usize,
    pub unit_count: usize,
    pub created_at: DateTime<Utc>,
    /// Default minimum confidence at the time of the build
    pub confidence_threshold: f32,
    pub chunk_policy: ChunkPolicy,
    pub skipped_chunks: usize,
}

/// One row of `chunks.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: u64,
    pub unit_id: String,
    pub unit_revision: String,
    pub unit_fingerprint: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub content_hash: String,
    pub model_id: String,
    pub truncated: bool,
    pub snippet: String,
}

/// A committed generation, fully loaded in memory.
#[derive(Debug)]
pub struct Generation {
    pub id: GenerationId,
    pub manifest: Manifest,
    chunks: Vec<ChunkRecord>,
    by_id: HashMap<u64, usize>,
    by_unit: HashMap<String, Vec<usize>>,
    index: VectorIndex,
}

impl Generation {
    pub fn chunk(&self, chunk_id: u64) -> Option<&ChunkRecord> {
        self.by_id.get(&chunk_id).map(|&i| &self.chunks[i])
    }

    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn vector(&self, chunk_id: u64) -> Option<&[f32]> {
        self.index.get(chunk_id)
    }

    /// Last indexed revision per unit.
    pub fn unit_revisions(&self) -> HashMap<&str, &str> {
        self.chunks
            .iter()
            .map(|c| (c.unit_id.as_str(), c.unit_revision.as_str()))
            .collect()
    }

    /// Chunks of one unit, in offset order.
    pub fn unit_chunks(&self, unit_id: &str) -> impl Iterator<Item = &ChunkRecord> + '_ {
        self.by_unit
            .get(unit_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.chunks[i])
    }
}

/// Outcome of inspecting the index directory on open.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Recovery {
    /// Generation readers are served from
    pub current: Option<GenerationId>,
    /// Generation named by `CURRENT`
    pub pointer: Option<GenerationId>,
    pub rebuild_required: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationCheck {
    pub generation: GenerationId,
    pub ok: bool,
    pub chunk_count: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    pub pointer: Option<GenerationId>,
    pub generations: Vec<GenerationCheck>,
    pub partial_dirs: Vec<String>,
}

/// A generation being written. Dropping it without committing removes
/// its partial directory.
pub struct BuildSession {
    id: GenerationId,
    dir: PathBuf,
    model_id: String,
    dimensions: usize,
    chunk_policy: ChunkPolicy,
    confidence_threshold: f32,
    chunks: Vec<ChunkRecord>,
    vectors: Vec<Vec<f32>>,
    seen: HashSet<u64>,
    units: HashSet<String>,
    skipped_chunks: usize,
    committed: bool,
}

impl BuildSession {
    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn skipped_chunks(&self) -> usize {
        self.skipped_chunks
    }

    pub fn add_unit(&mut self, unit_id: &str) {
        self.units.insert(unit_id.to_string());
    }

    pub fn record_skipped(&mut self, count: usize) {
        self.skipped_chunks += count;
    }

    /// Add a chunk and its vector. The record must carry the session's
    /// model id and the vector must be usable by the index.
    pub fn add_chunk(&mut self, record: ChunkRecord, vector: Vec<f32>) -> Result<()> {
        if record.model_id != self.model_id {
            return Err(EngineError::ModelMismatch {
                generation: self.id,
                index_model: self.model_id.clone(),
                active_model: record.model_id,
            });
        }
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            }
            .into());
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON || !norm.is_finite() {
            return Err(IndexError::ZeroNormVector.into());
        }
        if !self.seen.insert(record.chunk_id) {
            return Err(IndexError::DuplicateId(record.chunk_id).into());
        }

        self.units.insert(record.unit_id.clone());
        self.chunks.push(record);
        self.vectors.push(vector);
        Ok(())
    }
}

impl Drop for BuildSession {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = std::fs::remove_dir_all(&self.dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove abandoned build {:?}: {err}", self.dir);
                }
            } else {
                log::debug!("discarded uncommitted generation {}", self.id);
            }
        }
    }
}

enum Pointer {
    Missing,
    Valid(GenerationId),
    Invalid(String),
}

enum GenerationDir {
    Complete(GenerationId),
    Partial(GenerationId),
}

pub struct SnapshotManager {
    dir: PathBuf,
    store: BackendLocal,
    keep_generations: usize,
    cache: RwLock<Option<Arc<Generation>>>,
    recovery: Mutex<Recovery>,
    bad: Mutex<HashSet<GenerationId>>,
}

impl SnapshotManager {
    /// Open an index directory, load the current generation and work out
    /// whether an interrupted write left a rebuild to do.
    pub fn open(dir: &Path, keep_generations: usize) -> Result<Self> {
        let manager = Self {
            dir: dir.to_path_buf(),
            store: BackendLocal::new(dir)?,
            keep_generations,
            cache: RwLock::new(None),
            recovery: Mutex::new(Recovery::default()),
            bad: Mutex::new(HashSet::new()),
        };

        let current = manager.current_generation()?;

        // a live writer explains partial or unpublished generations
        let writer_active = matches!(
            WriteLock::new(dir, LockOptions::default()).inspect(),
            LockState::Held { stale: false, .. }
        );

        let pointer = match manager.read_pointer() {
            Pointer::Valid(id) => Some(id),
            _ => None,
        };

        let mut reasons = Vec::new();
        if !writer_active {
            for entry in manager.list_generation_dirs()? {
                match entry {
                    GenerationDir::Complete(id) if pointer.map_or(true, |p| id > p) => {
                        reasons.push(format!(
                            "generation {id} was written but never published (interrupted commit)"
                        ));
                    }
                    GenerationDir::Partial(id) => {
                        reasons.push(format!("generation {id} was left partially written"));
                    }
                    _ => {}
                }
            }
        }

        {
            let mut recovery = lock_recovery(&manager.recovery);
            recovery.current = current.as_ref().map(|g| g.id);
            recovery.pointer = pointer;
            if !reasons.is_empty() {
                recovery.rebuild_required = true;
                recovery.reasons.extend(reasons);
            }
            if recovery.rebuild_required {
                log::warn!("index at {:?} needs a rebuild: {}", dir, recovery.reasons.join("; "));
            }
        }

        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn recovery(&self) -> Recovery {
        lock_recovery(&self.recovery).clone()
    }

    /// The newest committed generation readers may use.
    ///
    /// Never returns a generation older than one it already returned.
    pub fn current_generation(&self) -> Result<Option<Arc<Generation>>> {
        let pointer = self.read_pointer();

        {
            let cache = self.cache.read().map_err(poisoned)?;
            if let Some(cached) = cache.as_ref() {
                let fresh = match pointer {
                    Pointer::Valid(id) => cached.id >= id,
                    Pointer::Missing | Pointer::Invalid(_) => true,
                };
                if fresh {
                    return Ok(Some(cached.clone()));
                }
            }
        }

        let cached_id = self
            .cache
            .read()
            .map_err(poisoned)?
            .as_ref()
            .map(|g| g.id);

        let resolved = match pointer {
            Pointer::Missing => None,
            Pointer::Valid(id) => self.resolve(id, cached_id)?,
            Pointer::Invalid(reason) => {
                self.flag_rebuild(format!("CURRENT is unreadable: {reason}"));
                self.resolve(GenerationId(u64::MAX), cached_id)?
            }
        };

        let mut cache = self.cache.write().map_err(poisoned)?;
        if let Some(loaded) = resolved {
            let newer = cache.as_ref().map_or(true, |c| loaded.id > c.id);
            if newer {
                log::debug!("serving generation {}", loaded.id);
                *cache = Some(loaded);
            }
        }
        let current = cache.clone();
        drop(cache);

        lock_recovery(&self.recovery).current = current.as_ref().map(|g| g.id);
        Ok(current)
    }

    /// Load `target`, or the newest complete generation older than it.
    fn resolve(
        &self,
        target: GenerationId,
        cached: Option<GenerationId>,
    ) -> Result<Option<Arc<Generation>>> {
        let mut candidates: Vec<GenerationId> = self
            .list_generation_dirs()?
            .into_iter()
            .filter_map(|d| match d {
                GenerationDir::Complete(id) if id <= target => Some(id),
                _ => None,
            })
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        if target != GenerationId(u64::MAX) && candidates.first() != Some(&target) {
            self.flag_rebuild(format!("CURRENT names generation {target} which does not exist"));
        }

        for id in candidates {
            if Some(id) <= cached {
                // nothing newer than what is already served
                return Ok(None);
            }
            if self.bad.lock().map_err(poisoned)?.contains(&id) {
                continue;
            }

            match Self::load_generation(&self.dir.join(id.dir_name()), id) {
                Ok(generation) => {
                    if id != target && target != GenerationId(u64::MAX) {
                        log::warn!("falling back from generation {target} to {id}");
                    }
                    return Ok(Some(Arc::new(generation)));
                }
                Err(err @ EngineError::CorruptGeneration { .. }) => {
                    log::warn!("{err}");
                    self.bad.lock().map_err(poisoned)?.insert(id);
                    self.flag_rebuild(err.to_string());
                }
                Err(err) => {
                    // may be transient, try this generation again next time
                    log::warn!("could not load generation {id}: {err}");
                }
            }
        }

        Ok(None)
    }

    fn flag_rebuild(&self, reason: String) {
        let mut recovery = lock_recovery(&self.recovery);
        recovery.rebuild_required = true;
        if !recovery.reasons.contains(&reason) {
            recovery.reasons.push(reason);
        }
    }

    fn read_pointer(&self) -> Pointer {
        match self.store.read(CURRENT_FILE) {
            Ok(bytes) => match String::from_utf8_lossy(&bytes).parse::<GenerationId>() {
                Ok(id) => Pointer::Valid(id),
                Err(err) => Pointer::Invalid(err.to_string()),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Pointer::Missing,
            Err(err) => Pointer::Invalid(err.to_string()),
        }
    }

    fn list_generation_dirs(&self) -> Result<Vec<GenerationDir>> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(rest) = name.to_str().and_then(|n| n.strip_prefix(GENERATION_PREFIX)) else {
                continue;
            };
            if let Some(id) = rest.strip_suffix(PARTIAL_SUFFIX) {
                if let Ok(id) = id.parse() {
                    dirs.push(GenerationDir::Partial(id));
                }
            } else if let Ok(id) = rest.parse() {
                dirs.push(GenerationDir::Complete(id));
            }
        }
        Ok(dirs)
    }

    /// Start writing a new generation. The caller must hold the write lock.
    pub fn begin_build(
        &self,
        model_id: &str,
        dimensions: usize,
        chunk_policy: ChunkPolicy,
        confidence_threshold: f32,
    ) -> Result<BuildSession> {
        let mut highest = match self.read_pointer() {
            Pointer::Valid(id) => id.0,
            _ => 0,
        };
        for entry in self.list_generation_dirs()? {
            let (GenerationDir::Complete(id) | GenerationDir::Partial(id)) = entry;
            highest = highest.max(id.0);
        }

        let id = GenerationId(highest + 1);
        let dir = self.dir.join(id.partial_dir_name());
        std::fs::create_dir(&dir)?;
        log::debug!("building generation {id} in {:?}", dir);

        Ok(BuildSession {
            id,
            dir,
            model_id: model_id.to_string(),
            dimensions,
            chunk_policy,
            confidence_threshold,
            chunks: Vec::new(),
            vectors: Vec::new(),
            seen: HashSet::new(),
            units: HashSet::new(),
            skipped_chunks: 0,
            committed: false,
        })
    }

    /// Durably write the session and publish it as the current generation.
    ///
    /// `cancel` is checked between the writes. A cancelled commit removes
    /// what it wrote and leaves `CURRENT` untouched.
    pub fn commit(&self, mut session: BuildSession, cancel: &CancelFlag) -> Result<GenerationId> {
        let id = session.id;
        cancel.check()?;

        let mut order: Vec<usize> = (0..session.chunks.len()).collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&session.chunks[a], &session.chunks[b]);
            (a.unit_id.as_str(), a.start_offset).cmp(&(b.unit_id.as_str(), b.start_offset))
        });
        let chunks: Vec<ChunkRecord> = order.iter().map(|&i| session.chunks[i].clone()).collect();
        let vectors: Vec<(u64, Vec<f32>)> = order
            .iter()
            .map(|&i| (session.chunks[i].chunk_id, std::mem::take(&mut session.vectors[i])))
            .collect();

        let index = VectorIndex::build(session.dimensions, HnswParams::default(), vectors)?;

        let manifest = Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            generation_id: id,
            model_id: session.model_id.clone(),
            embedding_dim: session.dimensions,
            chunk_count: chunks.len(),
            unit_count: session.units.len(),
            created_at: Utc::now(),
            confidence_threshold: session.confidence_threshold,
            chunk_policy: session.chunk_policy,
            skipped_chunks: session.skipped_chunks,
        };

        cancel.check()?;
        write_chunks(&session.dir.join(CHUNKS_FILE), &chunks)?;
        cancel.check()?;
        VectorStorage::new(&session.dir).save(&index, &model_id_hash(&manifest.model_id))?;
        cancel.check()?;
        write_json(&session.dir.join(MANIFEST_FILE), &manifest)?;
        sync_dir(&session.dir)?;

        // never publish something that would not load
        let generation = Self::load_generation(&session.dir, id)?;
        cancel.check()?;

        let final_dir = self.dir.join(id.dir_name());
        std::fs::rename(&session.dir, &final_dir)?;
        session.committed = true;

        if let Err(err) = cancel.check() {
            self.remove_dir(&id.dir_name())?;
            log::debug!("commit of generation {id} cancelled before publishing");
            return Err(err);
        }
        sync_dir(&self.dir)?;

        self.store.write(CURRENT_FILE, id.to_string().as_bytes())?;

        {
            let mut cache = self.cache.write().map_err(poisoned)?;
            if cache.as_ref().map_or(true, |c| c.id < id) {
                *cache = Some(Arc::new(generation));
            }
        }
        {
            let mut recovery = lock_recovery(&self.recovery);
            *recovery = Recovery {
                current: Some(id),
                pointer: Some(id),
                rebuild_required: false,
                reasons: Vec::new(),
            };
        }

        log::info!(
            "committed generation {id} ({} chunks, {} units, model {})",
            manifest.chunk_count,
            manifest.unit_count,
            manifest.model_id
        );

        if let Err(err) = self.collect_garbage(id) {
            log::warn!("garbage collection after generation {id} failed: {err}");
        }

        Ok(id)
    }

    /// Remove generations after a commit, keeping the configured number of
    /// superseded ones.
    fn collect_garbage(&self, committed: GenerationId) -> Result<()> {
        let mut older: Vec<GenerationId> = Vec::new();
        for entry in self.list_generation_dirs()? {
            match entry {
                GenerationDir::Complete(id) if id < committed => older.push(id),
                GenerationDir::Partial(id) if id < committed => {
                    self.remove_dir(&id.partial_dir_name())?;
                }
                _ => {}
            }
        }
        older.sort_unstable_by(|a, b| b.cmp(a));

        let cutoff = if self.keep_generations == 0 {
            committed
        } else {
            match older.get(self.keep_generations - 1) {
                Some(&oldest_kept) => oldest_kept,
                None => return Ok(()),
            }
        };

        let removed = self.discard_stale(cutoff)?;
        if removed > 0 {
            log::debug!("removed {removed} superseded generation(s)");
        }
        Ok(())
    }

    /// Delete every generation older than `before`. Returns how many were
    /// removed. The served generation is never removed.
    pub fn discard_stale(&self, before: GenerationId) -> Result<usize> {
        let served = self.cache.read().map_err(poisoned)?.as_ref().map(|g| g.id);

        let mut removed = 0;
        for entry in self.list_generation_dirs()? {
            match entry {
                GenerationDir::Complete(id) if id < before && Some(id) != served => {
                    self.remove_dir(&id.dir_name())?;
                    removed += 1;
                }
                GenerationDir::Partial(id) if id < before => {
                    self.remove_dir(&id.partial_dir_name())?;
                    removed += 1;
                }
                _ => {}
            }
        }
        Ok(removed)
    }

    fn remove_dir(&self, name: &str) -> Result<()> {
        match std::fs::remove_dir_all(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Check every generation on disk.
    pub fn verify(&self) -> Result<VerifyReport> {
        let pointer = match self.read_pointer() {
            Pointer::Valid(id) => Some(id),
            _ => None,
        };

        let mut generations = Vec::new();
        let mut partial_dirs = Vec::new();
        for entry in self.list_generation_dirs()? {
            match entry {
                GenerationDir::Complete(id) => {
                    let check = match Self::load_generation(&self.dir.join(id.dir_name()), id) {
                        Ok(generation) => GenerationCheck {
                            generation: id,
                            ok: true,
                            chunk_count: Some(generation.manifest.chunk_count),
                            error: None,
                        },
                        Err(err) => GenerationCheck {
                            generation: id,
                            ok: false,
                            chunk_count: None,
                            error: Some(err.to_string()),
                        },
                    };
                    generations.push(check);
                }
                GenerationDir::Partial(id) => partial_dirs.push(id.partial_dir_name()),
            }
        }
        generations.sort_by_key(|c| c.generation);
        partial_dirs.sort();

        let pointer_ok = match pointer {
            Some(id) => generations.iter().any(|c| c.generation == id && c.ok),
            None => generations.is_empty(),
        };

        Ok(VerifyReport {
            ok: pointer_ok && generations.iter().all(|c| c.ok),
            pointer,
            generations,
            partial_dirs,
        })
    }

    /// Remove every generation and the pointer. The caller must hold the
    /// write lock.
    pub fn clean(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self.list_generation_dirs()? {
            let name = match entry {
                GenerationDir::Complete(id) => id.dir_name(),
                GenerationDir::Partial(id) => id.partial_dir_name(),
            };
            self.remove_dir(&name)?;
            removed += 1;
        }

        match self.store.delete(CURRENT_FILE) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        sync_dir(&self.dir)?;

        *self.cache.write().map_err(poisoned)? = None;
        *lock_recovery(&self.recovery) = Recovery::default();
        self.bad.lock().map_err(poisoned)?.clear();

        log::info!("removed {removed} generation(s) from {:?}", self.dir);
        Ok(removed)
    }

    /// Load and validate one generation directory.
    pub fn load_generation(dir: &Path, id: GenerationId) -> Result<Generation> {
        let corrupt = |reason: String| EngineError::CorruptGeneration {
            generation: id,
            reason,
        };

        let manifest_bytes = std::fs::read(dir.join(MANIFEST_FILE)).map_err(|e| {
            if is_transient(&e) {
                EngineError::Io(e)
            } else {
                corrupt(format!("manifest unreadable: {e}"))
            }
        })?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| corrupt(format!("manifest malformed: {e}")))?;

        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported manifest version {}",
                manifest.format_version
            )));
        }
        if manifest.generation_id != id {
            return Err(corrupt(format!(
                "manifest belongs to generation {}",
                manifest.generation_id
            )));
        }

        let chunks = read_chunks(&dir.join(CHUNKS_FILE)).map_err(|e| match e {
            EngineError::Io(io) if is_transient(&io) => EngineError::Io(io),
            e => corrupt(format!("chunk table unreadable: {e}")),
        })?;
        if chunks.len() != manifest.chunk_count {
            return Err(corrupt(format!(
                "chunk table has {} rows, manifest says {}",
                chunks.len(),
                manifest.chunk_count
            )));
        }

        let mut by_id = HashMap::with_capacity(chunks.len());
        let mut by_unit: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.model_id != manifest.model_id {
                return Err(corrupt(format!(
                    "chunk {} was embedded with '{}'",
                    chunk.chunk_id, chunk.model_id
                )));
            }
            if by_id.insert(chunk.chunk_id, i).is_some() {
                return Err(corrupt(format!("chunk {} appears twice", chunk.chunk_id)));
            }
            by_unit.entry(chunk.unit_id.clone()).or_default().push(i);
        }
        for rows in by_unit.values_mut() {
            rows.sort_by_key(|&i| chunks[i].start_offset);
        }

        let index = VectorStorage::new(dir)
            .load(&model_id_hash(&manifest.model_id), manifest.embedding_dim)
            .map_err(|e| match e {
                VectorStorageError::Io(io) if is_transient(&io) => EngineError::Io(io),
                e => corrupt(format!("vector index: {e}")),
            })?;

        if index.len() != chunks.len() {
            return Err(corrupt(format!(
                "{} vectors for {} chunks",
                index.len(),
                chunks.len()
            )));
        }
        if let Some(orphan) = chunks.iter().find(|c| !index.contains(c.chunk_id)) {
            return Err(corrupt(format!("chunk {} has no vector", orphan.chunk_id)));
        }

        Ok(Generation {
            id,
            manifest,
            chunks,
            by_id,
            by_unit,
            index,
        })
    }
}

/// Read failures that say nothing about the files' contents.
fn is_transient(err: &std::io::Error) -> bool {
    !matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
    )
}

fn lock_recovery(recovery: &Mutex<Recovery>) -> std::sync::MutexGuard<'_, Recovery> {
    recovery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> EngineError {
    EngineError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "generation cache lock poisoned",
    ))
}

fn write_chunks(path: &Path, chunks: &[ChunkRecord]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for chunk in chunks {
        serde_json::to_writer(&mut writer, chunk)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn read_chunks(path: &Path) -> Result<Vec<ChunkRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut chunks = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        chunks.push(serde_json::from_str(&line)?);
    }
    Ok(chunks)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&serde_json::to_vec_pretty(value)?)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "hash-trigram-3";

    fn record(chunk_id: u64, unit_id: &str, start: usize) -> ChunkRecord {
        ChunkRecord {
            chunk_id,
            unit_id: unit_id.to_string(),
            unit_revision: "r1".to_string(),
            unit_fingerprint: "f1".to_string(),
            start_offset: start,
            end_offset: start + 10,
            content_hash: format!("hash-{chunk_id}"),
            model_id: MODEL.to_string(),
            truncated: false,
            snippet: format!("chunk {chunk_id}"),
        }
    }

    fn commit_chunks(manager: &SnapshotManager, ids: &[u64]) -> GenerationId {
        let mut session = manager
            .begin_build(MODEL, 3, ChunkPolicy::default(), 60.0)
            .unwrap();
        for (i, &id) in ids.iter().enumerate() {
            let vector = vec![1.0, i as f32, (id % 7) as f32];
            session.add_chunk(record(id, "unit", i * 10), vector).unwrap();
        }
        manager.commit(session, &CancelFlag::new()).unwrap()
    }

    fn gen_dirs(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(GENERATION_PREFIX))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_empty_directory_has_no_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();

        assert!(manager.current_generation().unwrap().is_none());
        let recovery = manager.recovery();
        assert!(!recovery.rebuild_required);
        assert_eq!(recovery.current, None);
    }

    #[test]
    fn test_commit_publishes_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();

        let id = commit_chunks(&manager, &[11, 22, 33]);
        assert_eq!(id, GenerationId(1));

        let current = manager.current_generation().unwrap().unwrap();
        assert_eq!(current.id, id);
        assert_eq!(current.manifest.chunk_count, 3);
        assert_eq!(current.manifest.unit_count, 1);
        assert_eq!(current.chunk(22).unwrap().snippet, "chunk 22");
        assert!(current.vector(33).is_some());

        assert_eq!(std::fs::read_to_string(tmp.path().join(CURRENT_FILE)).unwrap(), "1");
        assert_eq!(gen_dirs(tmp.path()), vec!["gen-1".to_string()]);
    }

    #[test]
    fn test_empty_generation_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        let id = commit_chunks(&manager, &[]);

        let reopened = SnapshotManager::open(tmp.path(), 1).unwrap();
        let current = reopened.current_generation().unwrap().unwrap();
        assert_eq!(current.id, id);
        assert!(current.chunks().is_empty());
        assert!(current.index().is_empty());
    }

    #[test]
    fn test_dropped_session_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();

        let mut session = manager
            .begin_build(MODEL, 3, ChunkPolicy::default(), 60.0)
            .unwrap();
        session.add_chunk(record(1, "a", 0), vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(gen_dirs(tmp.path()), vec!["gen-1.partial".to_string()]);

        drop(session);
        assert!(gen_dirs(tmp.path()).is_empty());
        assert!(manager.current_generation().unwrap().is_none());
    }

    #[test]
    fn test_add_chunk_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        let mut session = manager
            .begin_build(MODEL, 3, ChunkPolicy::default(), 60.0)
            .unwrap();

        session.add_chunk(record(1, "a", 0), vec![1.0, 0.0, 0.0]).unwrap();

        let duplicate = session.add_chunk(record(1, "a", 0), vec![1.0, 0.0, 0.0]);
        assert!(matches!(duplicate, Err(EngineError::Index(IndexError::DuplicateId(1)))));

        let wrong_dim = session.add_chunk(record(2, "a", 10), vec![1.0, 0.0]);
        assert!(matches!(wrong_dim, Err(EngineError::Index(IndexError::DimensionMismatch { .. }))));

        let zero = session.add_chunk(record(3, "a", 20), vec![0.0, 0.0, 0.0]);
        assert!(matches!(zero, Err(EngineError::Index(IndexError::ZeroNormVector))));

        let mut other_model = record(4, "a", 30);
        other_model.model_id = "other".to_string();
        let mixed = session.add_chunk(other_model, vec![1.0, 0.0, 0.0]);
        assert!(matches!(mixed, Err(EngineError::ModelMismatch { .. })));

        assert_eq!(session.chunk_count(), 1);
    }

    #[test]
    fn test_garbage_collection_keeps_previous_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();

        commit_chunks(&manager, &[1]);
        commit_chunks(&manager, &[2]);
        assert_eq!(gen_dirs(tmp.path()), vec!["gen-1".to_string(), "gen-2".to_string()]);

        commit_chunks(&manager, &[3]);
        assert_eq!(gen_dirs(tmp.path()), vec!["gen-2".to_string(), "gen-3".to_string()]);
    }

    #[test]
    fn test_garbage_collection_with_zero_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 0).unwrap();

        commit_chunks(&manager, &[1]);
        commit_chunks(&manager, &[2]);
        assert_eq!(gen_dirs(tmp.path()), vec!["gen-2".to_string()]);
    }

    #[test]
    fn test_interrupted_commit_keeps_prior_generation() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
            commit_chunks(&manager, &[1, 2]);
            commit_chunks(&manager, &[3, 4, 5]);
        }
        // generation 2 is on disk but the pointer never moved
        std::fs::write(tmp.path().join(CURRENT_FILE), "1").unwrap();

        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        let current = manager.current_generation().unwrap().unwrap();
        assert_eq!(current.id, GenerationId(1));
        assert_eq!(current.manifest.chunk_count, 2);

        let recovery = manager.recovery();
        assert!(recovery.rebuild_required);
        assert_eq!(recovery.current, Some(GenerationId(1)));
    }

    #[test]
    fn test_partial_directory_flags_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
            commit_chunks(&manager, &[1]);
        }
        std::fs::create_dir(tmp.path().join("gen-2.partial")).unwrap();

        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        assert!(manager.recovery().rebuild_required);
        assert_eq!(manager.current_generation().unwrap().unwrap().id, GenerationId(1));

        // the next commit skips past the abandoned id and clears it
        let id = commit_chunks(&manager, &[2]);
        assert_eq!(id, GenerationId(3));
        assert!(!manager.recovery().rebuild_required);
        assert!(!tmp.path().join("gen-2.partial").exists());
    }

    #[test]
    fn test_corrupt_current_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
            commit_chunks(&manager, &[1]);
            commit_chunks(&manager, &[2, 3]);
        }
        let vectors = tmp.path().join("gen-2").join("vectors.bin");
        let len = std::fs::metadata(&vectors).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&vectors)
            .unwrap()
            .set_len(len / 2)
            .unwrap();

        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        let current = manager.current_generation().unwrap().unwrap();
        assert_eq!(current.id, GenerationId(1));

        let recovery = manager.recovery();
        assert!(recovery.rebuild_required);
        assert_eq!(recovery.pointer, Some(GenerationId(2)));
        assert!(recovery.reasons.iter().any(|r| r.contains("generation 2 is corrupt")));

        let report = manager.verify().unwrap();
        assert!(!report.ok);
        assert!(report.generations.iter().any(|c| c.generation == GenerationId(2) && !c.ok));
    }

    #[test]
    fn test_missing_manifest_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
            commit_chunks(&manager, &[1]);
        }
        std::fs::remove_file(tmp.path().join("gen-1").join(MANIFEST_FILE)).unwrap();

        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        assert!(manager.current_generation().unwrap().is_none());
        assert!(manager.recovery().rebuild_required);
    }

    #[test]
    fn test_reader_sees_commit_from_another_manager() {
        let tmp = tempfile::tempdir().unwrap();
        let reader = SnapshotManager::open(tmp.path(), 1).unwrap();
        let writer = SnapshotManager::open(tmp.path(), 1).unwrap();

        commit_chunks(&writer, &[1]);
        assert_eq!(reader.current_generation().unwrap().unwrap().id, GenerationId(1));

        commit_chunks(&writer, &[2]);
        assert_eq!(reader.current_generation().unwrap().unwrap().id, GenerationId(2));

        // a pointer moving backwards is ignored
        std::fs::write(tmp.path().join(CURRENT_FILE), "1").unwrap();
        assert_eq!(reader.current_generation().unwrap().unwrap().id, GenerationId(2));
    }

    #[test]
    fn test_verify_and_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        commit_chunks(&manager, &[1]);
        commit_chunks(&manager, &[2]);

        let report = manager.verify().unwrap();
        assert!(report.ok);
        assert_eq!(report.pointer, Some(GenerationId(2)));
        assert_eq!(report.generations.len(), 2);

        assert_eq!(manager.clean().unwrap(), 2);
        assert!(gen_dirs(tmp.path()).is_empty());
        assert!(!tmp.path().join(CURRENT_FILE).exists());
        assert!(manager.current_generation().unwrap().is_none());
    }

    #[test]
    fn test_discard_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 5).unwrap();
        for i in 1..=4 {
            commit_chunks(&manager, &[i]);
        }
        assert_eq!(gen_dirs(tmp.path()).len(), 4);

        assert_eq!(manager.discard_stale(GenerationId(3)).unwrap(), 2);
        assert_eq!(gen_dirs(tmp.path()), vec!["gen-3".to_string(), "gen-4".to_string()]);
    }

    #[test]
    fn test_cancelled_commit_keeps_previous_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        commit_chunks(&manager, &[1]);

        let mut session = manager
            .begin_build(MODEL, 3, ChunkPolicy::default(), 60.0)
            .unwrap();
        session.add_chunk(record(2, "unit", 0), vec![1.0, 0.0, 0.0]).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = manager.commit(session, &cancel);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(gen_dirs(tmp.path()), vec!["gen-1".to_string()]);
        assert_eq!(std::fs::read_to_string(tmp.path().join(CURRENT_FILE)).unwrap(), "1");
        assert_eq!(manager.current_generation().unwrap().unwrap().id, GenerationId(1));
        assert!(!manager.recovery().rebuild_required);
    }

    #[test]
    fn test_unit_chunks_in_offset_order() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        let mut session = manager
            .begin_build(MODEL, 3, ChunkPolicy::default(), 60.0)
            .unwrap();
        session.add_chunk(record(3, "b", 20), vec![1.0, 0.0, 1.0]).unwrap();
        session.add_chunk(record(1, "a", 0), vec![1.0, 0.0, 0.0]).unwrap();
        session.add_chunk(record(2, "b", 0), vec![1.0, 1.0, 0.0]).unwrap();
        manager.commit(session, &CancelFlag::new()).unwrap();

        let current = manager.current_generation().unwrap().unwrap();
        let b: Vec<u64> = current.unit_chunks("b").map(|c| c.chunk_id).collect();
        assert_eq!(b, vec![2, 3]);
        assert_eq!(current.unit_chunks("missing").count(), 0);
        assert_eq!(current.unit_revisions().get("a"), Some(&"r1"));
    }

    #[test]
    fn test_unreadable_generation_is_retried() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
            commit_chunks(&manager, &[1]);
        }
        let manifest = tmp.path().join("gen-1").join(MANIFEST_FILE);
        let saved = std::fs::read(&manifest).unwrap();

        // reading a directory fails without saying anything about the data
        std::fs::remove_file(&manifest).unwrap();
        std::fs::create_dir(&manifest).unwrap();
        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        assert!(manager.current_generation().unwrap().is_none());
        assert!(!manager.bad.lock().unwrap().contains(&GenerationId(1)));

        std::fs::remove_dir(&manifest).unwrap();
        std::fs::write(&manifest, &saved).unwrap();
        assert_eq!(manager.current_generation().unwrap().unwrap().id, GenerationId(1));
    }

    #[test]
    fn test_corrupt_generation_stays_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
            commit_chunks(&manager, &[1]);
        }
        let chunks = tmp.path().join("gen-1").join(CHUNKS_FILE);
        let saved = std::fs::read(&chunks).unwrap();
        std::fs::remove_file(&chunks).unwrap();

        let manager = SnapshotManager::open(tmp.path(), 1).unwrap();
        assert!(manager.current_generation().unwrap().is_none());
        assert!(manager.bad.lock().unwrap().contains(&GenerationId(1)));

        std::fs::write(&chunks, &saved).unwrap();
        assert!(manager.current_generation().unwrap().is_none());
    }

    #[test]
    fn test_generation_id_parse_and_display() {
        assert_eq!("42\n".parse::<GenerationId>().unwrap(), GenerationId(42));
        assert!("x".parse::<GenerationId>().is_err());
        assert_eq!(GenerationId(7).to_string(), "7");
        assert_eq!(GenerationId(7).dir_name(), "gen-7");
        assert_eq!(GenerationId(7).partial_dir_name(), "gen-7.partial");
    }
}
