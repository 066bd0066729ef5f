//! Approximate nearest-neighbor index (HNSW) with cosine similarity.
//!
//! Vectors are L2-normalized on insert, so similarity is a dot product in
//! [-1, 1]. Node levels are derived from the chunk id, and `build` inserts in
//! chunk id order, so the same vector set always produces the same graph.
//! The index is built once per generation and never mutated afterwards;
//! removing a chunk means building a new index without it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Graph construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    /// Max neighbors per node on upper layers (layer 0 keeps twice as many)
    pub m: usize,
    /// Candidate list size while inserting
    pub ef_construction: usize,
    /// Highest layer a node may be assigned to
    pub max_level: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
            max_level: 16,
        }
    }
}

impl HnswParams {
    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Chunk ID
    pub id: u64,
    /// Cosine similarity (-1.0 to 1.0)
    pub score: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Chunk {0} is already in the index")]
    DuplicateId(u64),

    #[error("Malformed graph: {0}")]
    MalformedGraph(String),
}

/// One node as stored on disk.
#[derive(Debug, Clone)]
pub struct NodeParts {
    pub id: u64,
    pub vector: Vec<f32>,
    /// Neighbor node positions, one list per layer (0..=level)
    pub links: Vec<Vec<u32>>,
}

/// HNSW vector index keyed by chunk id.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimensions: usize,
    params: HnswParams,
    ids: Vec<u64>,
    vectors: Vec<Vec<f32>>,
    links: Vec<Vec<Vec<u32>>>,
    positions: HashMap<u64, u32>,
    entry_point: Option<u32>,
    top_layer: usize,
}

/// Heap entry ordered by similarity, ties broken so that the lower chunk id
/// ranks higher.
#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    id: u64,
    node: u32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self::with_params(dimensions, HnswParams::default())
    }

    pub fn with_params(dimensions: usize, params: HnswParams) -> Self {
        Self {
            dimensions,
            params,
            ids: Vec::new(),
            vectors: Vec::new(),
            links: Vec::new(),
            positions: HashMap::new(),
            entry_point: None,
            top_layer: 0,
        }
    }

    /// Build an index from a full vector set, inserting in chunk id order.
    pub fn build(
        dimensions: usize,
        params: HnswParams,
        mut records: Vec<(u64, Vec<f32>)>,
    ) -> Result<Self, IndexError> {
        records.sort_by_key(|(id, _)| *id);
        let mut index = Self::with_params(dimensions, params);
        for (id, vector) in records {
            index.insert(id, vector)?;
        }
        Ok(index)
    }

    /// Get the expected embedding dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Get the number of entries in the index.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Check if an entry exists for the given ID.
    pub fn contains(&self, id: u64) -> bool {
        self.positions.contains_key(&id)
    }

    /// Normalized vector stored for a chunk.
    pub fn get(&self, id: u64) -> Option<&[f32]> {
        self.positions
            .get(&id)
            .map(|&node| self.vectors[node as usize].as_slice())
    }

    /// Get all chunk IDs in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.ids.iter().copied()
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    pub fn top_layer(&self) -> usize {
        self.top_layer
    }

    /// Nodes in position order, for persistence.
    pub fn nodes(&self) -> impl Iterator<Item = (u64, &[f32], &[Vec<u32>])> + '_ {
        self.ids
            .iter()
            .zip(self.vectors.iter())
            .zip(self.links.iter())
            .map(|((id, vector), links)| (*id, vector.as_slice(), links.as_slice()))
    }

    /// Reassemble a persisted index, checking that every link points at an
    /// existing node on a layer that node lives on.
    pub fn from_parts(
        dimensions: usize,
        params: HnswParams,
        nodes: Vec<NodeParts>,
        entry_point: Option<u32>,
    ) -> Result<Self, IndexError> {
        let mut index = Self::with_params(dimensions, params);
        let levels: Vec<usize> = nodes.iter().map(|n| n.links.len().saturating_sub(1)).collect();

        for (position, node) in nodes.into_iter().enumerate() {
            if node.vector.len() != dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    got: node.vector.len(),
                });
            }
            if node.links.is_empty() {
                return Err(IndexError::MalformedGraph(format!(
                    "node {position} has no layers"
                )));
            }
            for (layer, neighbors) in node.links.iter().enumerate() {
                for &neighbor in neighbors {
                    match levels.get(neighbor as usize) {
                        Some(&level) if level >= layer => {}
                        _ => {
                            return Err(IndexError::MalformedGraph(format!(
                                "node {position} links to invalid node {neighbor} on layer {layer}"
                            )))
                        }
                    }
                }
            }
            if index.positions.insert(node.id, position as u32).is_some() {
                return Err(IndexError::DuplicateId(node.id));
            }
            index.ids.push(node.id);
            index.vectors.push(node.vector);
            index.links.push(node.links);
        }

        match entry_point {
            Some(entry) if (entry as usize) < index.len() => {
                index.entry_point = Some(entry);
                index.top_layer = levels[entry as usize];
            }
            None if index.is_empty() => {}
            _ => {
                return Err(IndexError::MalformedGraph(
                    "entry point does not match node set".to_string(),
                ))
            }
        }

        Ok(index)
    }

    /// Insert a chunk vector.
    ///
    /// Returns an error if the embedding has zero norm (cannot be normalized)
    /// or the chunk is already present.
    pub fn insert(&mut self, id: u64, embedding: Vec<f32>) -> Result<(), IndexError> {
        let vector = self.normalized(embedding)?;
        if self.positions.contains_key(&id) {
            return Err(IndexError::DuplicateId(id));
        }

        let node = self.ids.len() as u32;
        let level = self.level_for(id);
        self.ids.push(id);
        self.vectors.push(vector);
        self.links.push(vec![Vec::new(); level + 1]);
        self.positions.insert(id, node);

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(node);
            self.top_layer = level;
            return Ok(());
        };

        let query = self.vectors[node as usize].clone();

        // greedy descent through the layers above the new node
        for layer in (level + 1..=self.top_layer).rev() {
            entry = self.greedy_closest(&query, entry, layer);
        }

        for layer in (0..=level.min(self.top_layer)).rev() {
            let candidates = self.search_layer(&query, &[entry], self.params.ef_construction, layer);
            let max_conn = self.params.max_connections(layer);

            let neighbors: Vec<u32> = candidates
                .iter()
                .filter(|c| c.node != node)
                .take(max_conn)
                .map(|c| c.node)
                .collect();

            self.links[node as usize][layer] = neighbors.clone();
            for neighbor in neighbors {
                self.links[neighbor as usize][layer].push(node);
                if self.links[neighbor as usize][layer].len() > max_conn {
                    self.prune(neighbor, layer, max_conn);
                }
            }

            if let Some(best) = candidates.first() {
                entry = best.node;
            }
        }

        if level > self.top_layer {
            self.top_layer = level;
            self.entry_point = Some(node);
        }

        Ok(())
    }

    /// Find the `k` most similar chunks.
    ///
    /// Results are sorted by similarity (highest first), ties by chunk id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, IndexError> {
        let ef = (k.max(1) * 4).max(64);
        self.search_with_ef(query, k, ef)
    }

    pub fn search_with_ef(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let query = self.normalized(query.to_vec())?;
        let Some(mut entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        for layer in (1..=self.top_layer).rev() {
            entry = self.greedy_closest(&query, entry, layer);
        }

        let found = self.search_layer(&query, &[entry], ef.max(k), 0);
        Ok(found
            .into_iter()
            .take(k)
            .map(|c| SearchResult {
                id: c.id,
                score: c.score,
            })
            .collect())
    }

    fn normalized(&self, mut vector: Vec<f32>) -> Result<Vec<f32>, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }

        // Check for zero norm
        let norm = Self::l2_norm(&vector);
        if norm < f32::EPSILON || !norm.is_finite() {
            return Err(IndexError::ZeroNormVector);
        }

        for value in vector.iter_mut() {
            *value /= norm;
        }
        Ok(vector)
    }

    /// Compute L2 norm of a vector.
    fn l2_norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    fn similarity(&self, query: &[f32], node: u32) -> f32 {
        query
            .iter()
            .zip(self.vectors[node as usize].iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    fn scored(&self, query: &[f32], node: u32) -> Scored {
        Scored {
            score: self.similarity(query, node),
            id: self.ids[node as usize],
            node,
        }
    }

    /// Geometric level distribution with p = 1/m, driven by the chunk id.
    fn level_for(&self, id: u64) -> usize {
        // splitmix64 finalizer
        let mut x = id.wrapping_add(0x9e37_79b9_7f4a_7c15);
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^= x >> 31;

        // uniform in (0, 1]
        let uniform = ((x >> 11) as f64 + 1.0) / (1u64 << 53) as f64;
        let m = self.params.m.max(2) as f64;
        let level = (-uniform.ln() / m.ln()).floor() as usize;
        level.min(self.params.max_level)
    }

    fn greedy_closest(&self, query: &[f32], entry: u32, layer: usize) -> u32 {
        let mut best = self.scored(query, entry);
        loop {
            let mut improved = false;
            for &neighbor in self.neighbors(best.node, layer) {
                let candidate = self.scored(query, neighbor);
                if candidate > best {
                    best = candidate;
                    improved = true;
                }
            }
            if !improved {
                return best.node;
            }
        }
    }

    fn neighbors(&self, node: u32, layer: usize) -> &[u32] {
        self.links[node as usize]
            .get(layer)
            .map(|l| l.as_slice())
            .unwrap_or(&[])
    }

    /// Beam search on one layer; returns up to `ef` nodes, best first.
    fn search_layer(&self, query: &[f32], entries: &[u32], ef: usize, layer: usize) -> Vec<Scored> {
        let ef = ef.max(1);
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        // min-heap of the current best `ef`
        let mut results: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::new();

        for &entry in entries {
            if visited.insert(entry) {
                let scored = self.scored(query, entry);
                candidates.push(scored);
                results.push(std::cmp::Reverse(scored));
            }
        }

        while let Some(current) = candidates.pop() {
            if let Some(std::cmp::Reverse(worst)) = results.peek() {
                if results.len() >= ef && current < *worst {
                    break;
                }
            }

            for &neighbor in self.neighbors(current.node, layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let scored = self.scored(query, neighbor);
                let admit = results.len() < ef
                    || results
                        .peek()
                        .map(|std::cmp::Reverse(worst)| scored > *worst)
                        .unwrap_or(true);
                if admit {
                    candidates.push(scored);
                    results.push(std::cmp::Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
        found.sort_by(|a, b| b.cmp(a));
        found
    }

    /// Keep only the `max_conn` closest neighbors of `node` on `layer`.
    fn prune(&mut self, node: u32, layer: usize, max_conn: usize) {
        let base = self.vectors[node as usize].clone();
        let mut scored: Vec<Scored> = self.links[node as usize][layer]
            .iter()
            .map(|&n| self.scored(&base, n))
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(max_conn);
        self.links[node as usize][layer] = scored.into_iter().map(|s| s.node).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic xorshift vectors for recall tests.
    fn pseudo_random_vectors(count: usize, dimensions: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut state = seed.max(1);
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state >> 11) as f64 / (1u64 << 53) as f64) as f32 * 2.0 - 1.0
        };
        (0..count)
            .map(|_| (0..dimensions).map(|_| next()).collect())
            .collect()
    }

    fn brute_force(vectors: &[(u64, Vec<f32>)], query: &[f32], k: usize) -> Vec<u64> {
        let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
        let qn = norm(query);
        let mut scored: Vec<(f32, u64)> = vectors
            .iter()
            .map(|(id, v)| {
                let dot: f32 = v.iter().zip(query).map(|(a, b)| a * b).sum();
                (dot / (norm(v) * qn), *id)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.into_iter().take(k).map(|(_, id)| id).collect()
    }

    #[test]
    fn test_new_index() {
        let index = VectorIndex::new(384);
        assert_eq!(index.dimensions(), 384);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_empty_index_search_returns_nothing() {
        let index = VectorIndex::new(3);
        let results = index.search(&[1.0, 0.0, 0.0], 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_single_entry() {
        let mut index = VectorIndex::new(3);
        index.insert(7, vec![0.0, 2.0, 0.0]).unwrap();

        let results = index.search(&[0.0, 1.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 7);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut index = VectorIndex::new(3);
        let result = index.insert(1, vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_insert_zero_norm_rejected() {
        let mut index = VectorIndex::new(3);
        let result = index.insert(1, vec![0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut index = VectorIndex::new(3);
        index.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
        let result = index.insert(1, vec![0.0, 1.0, 0.0]);
        assert!(matches!(result, Err(IndexError::DuplicateId(1))));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_search_basic() {
        let mut index = VectorIndex::new(3);

        // Insert two orthogonal vectors
        index.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(2, vec![0.0, 1.0, 0.0]).unwrap();

        // Query similar to first vector
        let results = index.search(&[1.0, 0.1, 0.0], 10).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 1); // Should be most similar
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_ties_break_by_chunk_id() {
        let mut index = VectorIndex::new(2);
        index.insert(30, vec![1.0, 0.0]).unwrap();
        index.insert(10, vec![1.0, 0.0]).unwrap();
        index.insert(20, vec![1.0, 0.0]).unwrap();

        let ids: Vec<u64> = index
            .search(&[1.0, 0.0], 3)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_search_with_limit() {
        let mut index = VectorIndex::new(3);
        for i in 0..10 {
            index.insert(i, vec![1.0, i as f32 * 0.1, 0.0]).unwrap();
        }

        let results = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, 0);
    }

    #[test]
    fn test_build_is_order_independent() {
        let vectors = pseudo_random_vectors(200, 8, 7);
        let records: Vec<(u64, Vec<f32>)> = vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u64 * 31 + 5, v))
            .collect();
        let mut reversed = records.clone();
        reversed.reverse();

        let a = VectorIndex::build(8, HnswParams::default(), records).unwrap();
        let b = VectorIndex::build(8, HnswParams::default(), reversed).unwrap();

        assert_eq!(a.ids().collect::<Vec<_>>(), b.ids().collect::<Vec<_>>());
        assert_eq!(a.entry_point(), b.entry_point());
        let a_links: Vec<_> = a.nodes().map(|(_, _, l)| l.to_vec()).collect();
        let b_links: Vec<_> = b.nodes().map(|(_, _, l)| l.to_vec()).collect();
        assert_eq!(a_links, b_links);
    }

    #[test]
    fn test_recall_against_brute_force() {
        let dims = 16;
        let records: Vec<(u64, Vec<f32>)> = pseudo_random_vectors(800, dims, 42)
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u64, v))
            .collect();
        let index = VectorIndex::build(dims, HnswParams::default(), records.clone()).unwrap();
        assert_eq!(index.len(), 800);

        let queries = pseudo_random_vectors(20, dims, 99);
        let k = 10;
        let mut hits = 0usize;
        for query in &queries {
            let expected = brute_force(&records, query, k);
            let found: Vec<u64> = index
                .search(query, k)
                .unwrap()
                .into_iter()
                .map(|r| r.id)
                .collect();
            hits += found.iter().filter(|id| expected.contains(id)).count();
        }

        let recall = hits as f32 / (queries.len() * k) as f32;
        assert!(recall >= 0.9, "recall too low: {recall}");
    }

    #[test]
    fn test_from_parts_round_trip() {
        let records: Vec<(u64, Vec<f32>)> = pseudo_random_vectors(50, 4, 3)
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u64, v))
            .collect();
        let index = VectorIndex::build(4, HnswParams::default(), records).unwrap();

        let nodes: Vec<NodeParts> = index
            .nodes()
            .map(|(id, vector, links)| NodeParts {
                id,
                vector: vector.to_vec(),
                links: links.to_vec(),
            })
            .collect();
        let rebuilt =
            VectorIndex::from_parts(4, index.params(), nodes, index.entry_point()).unwrap();

        let query = [0.3, -0.2, 0.9, 0.1];
        assert_eq!(index.search(&query, 5).unwrap(), rebuilt.search(&query, 5).unwrap());
        assert_eq!(index.top_layer(), rebuilt.top_layer());
    }

    #[test]
    fn test_from_parts_rejects_dangling_links() {
        let nodes = vec![NodeParts {
            id: 1,
            vector: vec![1.0, 0.0],
            links: vec![vec![5]],
        }];
        let result = VectorIndex::from_parts(2, HnswParams::default(), nodes, Some(0));
        assert!(matches!(result, Err(IndexError::MalformedGraph(_))));
    }

    #[test]
    fn test_get_returns_normalized_vector() {
        let mut index = VectorIndex::new(2);
        index.insert(4, vec![3.0, 4.0]).unwrap();
        let stored = index.get(4).unwrap();
        assert!((stored[0] - 0.6).abs() < 1e-6);
        assert!((stored[1] - 0.8).abs() < 1e-6);
        assert!(index.get(5).is_none());
    }
}
