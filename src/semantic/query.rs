//! Confidence scoring and result ranking.
//!
//! Confidence is the cosine similarity clamped to [0, 1] and scaled to a
//! percentage: `clamp(cos, 0, 1) * 100`. Negative similarity maps to 0.
//! Thresholds tuned against one model stay meaningful as long as that model
//! is in use, so this mapping must not change.

use serde::Serialize;

use crate::semantic::index::SearchResult;
use crate::semantic::snapshot::{Generation, GenerationId};

/// Map raw cosine similarity to a 0-100 confidence.
pub fn confidence_from_similarity(similarity: f32) -> f32 {
    if !similarity.is_finite() {
        return 0.0;
    }
    similarity.clamp(0.0, 1.0) * 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: u64,
    pub unit_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// 0-100
    pub confidence: f32,
    /// Raw cosine similarity
    pub similarity: f32,
    pub snippet: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub generation: GenerationId,
    pub model_id: String,
    pub k: usize,
    pub min_confidence: f32,
    /// Candidates returned by the index before filtering
    pub candidates: usize,
    pub results: Vec<ScoredChunk>,
}

/// Score `hits` against `generation`, drop those under `min_confidence`
/// and order by confidence (highest first), ties by chunk id.
///
/// Hits whose chunk is missing from the generation's chunk table are
/// dropped; a loaded generation never has any.
pub fn rank(generation: &Generation, hits: &[SearchResult], min_confidence: f32) -> Vec<ScoredChunk> {
    let mut results: Vec<ScoredChunk> = hits
        .iter()
        .filter_map(|hit| {
            let confidence = confidence_from_similarity(hit.score);
            if confidence < min_confidence {
                return None;
            }
            let chunk = generation.chunk(hit.id)?;
            Some(ScoredChunk {
                chunk_id: hit.id,
                unit_id: chunk.unit_id.clone(),
                start_offset: chunk.start_offset,
                end_offset: chunk.end_offset,
                confidence,
                similarity: hit.score,
                snippet: chunk.snippet.clone(),
                truncated: chunk.truncated,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    results
}
