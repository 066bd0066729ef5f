//! Binary storage for a generation's vectors and HNSW graph.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (2)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, in graph node order):
//! - chunk_id: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian, L2-normalized)
//!
//! Trailer: u32 CRC32 of all entry bytes
//!
//! File format: graph.bin
//!
//! Header (22 bytes):
//! - version: u8 (1)
//! - m: u16, ef_construction: u16, max_level: u8
//! - node_count: u64
//! - entry_point: u32 (u32::MAX when empty)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Nodes (repeated): layer_count: u8, then per layer a u32 neighbor count
//! followed by u32 neighbor positions.
//!
//! Trailer: u32 CRC32 of all node bytes

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::{HnswParams, NodeParts, VectorIndex};

/// Current vectors.bin format version
const FORMAT_VERSION: u8 = 2;
/// Current graph.bin format version
const GRAPH_FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;
/// version(1) + m(2) + ef_construction(2) + max_level(1) + node_count(8) + entry_point(4) + checksum(4)
const GRAPH_HEADER_SIZE: usize = 22;

const NO_ENTRY_POINT: u32 = u32::MAX;

pub const VECTORS_FILE: &str = "vectors.bin";
pub const GRAPH_FILE: &str = "graph.bin";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for one generation directory.
pub struct VectorStorage {
    dir: PathBuf,
}

impl VectorStorage {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    pub fn graph_path(&self) -> PathBuf {
        self.dir.join(GRAPH_FILE)
    }

    /// Load the vector index from storage.
    ///
    /// Fails if the files are corrupt, disagree with each other, or were
    /// written for a different model or dimension.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let vectors = self.read_vectors(expected_model_id, expected_dimensions)?;
        let (params, entry_point, links) = self.read_graph()?;

        if links.len() != vectors.len() {
            return Err(VectorStorageError::InvalidFormat(format!(
                "graph has {} nodes, vectors file has {}",
                links.len(),
                vectors.len()
            )));
        }

        let nodes = vectors
            .into_iter()
            .zip(links)
            .map(|((id, vector), links)| NodeParts { id, vector, links })
            .collect();

        VectorIndex::from_parts(expected_dimensions, params, nodes, entry_point)
            .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))
    }

    /// Save the vector index to storage.
    ///
    /// Uses atomic write per file: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        if index.dimensions() > u16::MAX as usize {
            return Err(VectorStorageError::InvalidFormat(format!(
                "dimensions {} do not fit the header",
                index.dimensions()
            )));
        }

        Self::atomic_write(&self.vectors_path(), |w| Self::write_vectors(w, index, model_id))?;
        Self::atomic_write(&self.graph_path(), |w| Self::write_graph(w, index))?;
        Ok(())
    }

    fn atomic_write<F>(path: &Path, write: F) -> Result<(), VectorStorageError>
    where
        F: FnOnce(&mut BufWriter<File>) -> Result<(), VectorStorageError>,
    {
        let temp_path = path.with_extension("tmp");

        let result: Result<(), VectorStorageError> = (|| {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            write(&mut writer)?;

            // Flush and sync
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            Ok(())
        })();

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        // Atomic rename
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn write_vectors(
        writer: &mut BufWriter<File>,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes[0] = FORMAT_VERSION;
        header_bytes[1..33].copy_from_slice(model_id);
        header_bytes[33..35].copy_from_slice(&(index.dimensions() as u16).to_le_bytes());
        header_bytes[35..43].copy_from_slice(&(index.len() as u64).to_le_bytes());
        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header_bytes)?;

        let mut payload = crc32fast::Hasher::new();
        let mut entry = Vec::with_capacity(8 + index.dimensions() * 4);
        for (id, vector, _) in index.nodes() {
            entry.clear();
            entry.extend_from_slice(&id.to_le_bytes());
            for &value in vector {
                entry.extend_from_slice(&value.to_le_bytes());
            }
            payload.update(&entry);
            writer.write_all(&entry)?;
        }

        writer.write_all(&payload.finalize().to_le_bytes())?;
        Ok(())
    }

    fn read_vectors(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<Vec<(u64, Vec<f32>)>, VectorStorageError> {
        let file = File::open(self.vectors_path())?;
        let mut reader = BufReader::new(file);

        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        // Version check first
        let version = header_bytes[0];
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        // Verify checksum (computed over header without checksum field)
        let stored_checksum = u32::from_le_bytes(array(&header_bytes[43..47]));
        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        if header_bytes[1..33] != expected_model_id[..] {
            return Err(VectorStorageError::ModelMismatch);
        }

        let dimensions = u16::from_le_bytes(array(&header_bytes[33..35])) as usize;
        if dimensions != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let entry_count = u64::from_le_bytes(array(&header_bytes[35..43]));
        let mut payload = crc32fast::Hasher::new();
        let mut entries = Vec::new();
        let mut entry = vec![0u8; 8 + dimensions * 4];

        for _ in 0..entry_count {
            reader.read_exact(&mut entry)?;
            payload.update(&entry);

            let id = u64::from_le_bytes(array(&entry[0..8]));
            let vector = entry[8..]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes(array(b)))
                .collect();
            entries.push((id, vector));
        }

        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != payload.finalize() {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        Ok(entries)
    }

    fn write_graph(writer: &mut BufWriter<File>, index: &VectorIndex) -> Result<(), VectorStorageError> {
        let params = index.params();
        let mut header_bytes = [0u8; GRAPH_HEADER_SIZE];
        header_bytes[0] = GRAPH_FORMAT_VERSION;
        header_bytes[1..3].copy_from_slice(&(params.m as u16).to_le_bytes());
        header_bytes[3..5].copy_from_slice(&(params.ef_construction as u16).to_le_bytes());
        header_bytes[5] = params.max_level as u8;
        header_bytes[6..14].copy_from_slice(&(index.len() as u64).to_le_bytes());
        let entry_point = index.entry_point().unwrap_or(NO_ENTRY_POINT);
        header_bytes[14..18].copy_from_slice(&entry_point.to_le_bytes());
        let checksum = crc32fast::hash(&header_bytes[0..18]);
        header_bytes[18..22].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header_bytes)?;

        let mut payload = crc32fast::Hasher::new();
        let mut node_bytes = Vec::new();
        for (_, _, layers) in index.nodes() {
            node_bytes.clear();
            node_bytes.push(layers.len() as u8);
            for neighbors in layers {
                node_bytes.extend_from_slice(&(neighbors.len() as u32).to_le_bytes());
                for neighbor in neighbors {
                    node_bytes.extend_from_slice(&neighbor.to_le_bytes());
                }
            }
            payload.update(&node_bytes);
            writer.write_all(&node_bytes)?;
        }

        writer.write_all(&payload.finalize().to_le_bytes())?;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn read_graph(&self) -> Result<(HnswParams, Option<u32>, Vec<Vec<Vec<u32>>>), VectorStorageError> {
        let file = File::open(self.graph_path())?;
        let mut reader = BufReader::new(file);

        let mut header_bytes = [0u8; GRAPH_HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version != GRAPH_FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, GRAPH_FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(array(&header_bytes[18..22]));
        if stored_checksum != crc32fast::hash(&header_bytes[0..18]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let params = HnswParams {
            m: u16::from_le_bytes(array(&header_bytes[1..3])) as usize,
            ef_construction: u16::from_le_bytes(array(&header_bytes[3..5])) as usize,
            max_level: header_bytes[5] as usize,
        };
        let node_count = u64::from_le_bytes(array(&header_bytes[6..14]));
        let entry_point = match u32::from_le_bytes(array(&header_bytes[14..18])) {
            NO_ENTRY_POINT => None,
            entry => Some(entry),
        };

        let mut payload = crc32fast::Hasher::new();
        let mut nodes = Vec::new();
        for _ in 0..node_count {
            let mut layer_count = [0u8; 1];
            reader.read_exact(&mut layer_count)?;
            payload.update(&layer_count);

            let mut layers = Vec::with_capacity(layer_count[0] as usize);
            for _ in 0..layer_count[0] {
                let mut count = [0u8; 4];
                reader.read_exact(&mut count)?;
                payload.update(&count);

                let count = u32::from_le_bytes(count) as usize;
                if count > node_count as usize {
                    return Err(VectorStorageError::InvalidFormat(format!(
                        "neighbor list of {count} exceeds node count"
                    )));
                }
                let mut neighbor_bytes = vec![0u8; count * 4];
                reader.read_exact(&mut neighbor_bytes)?;
                payload.update(&neighbor_bytes);

                layers.push(
                    neighbor_bytes
                        .chunks_exact(4)
                        .map(|b| u32::from_le_bytes(array(b)))
                        .collect(),
                );
            }
            nodes.push(layers);
        }

        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != payload.finalize() {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        Ok((params, entry_point, nodes))
    }
}

/// Copy a slice of known length into a fixed array.
fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
