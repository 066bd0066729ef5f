//! Persistent semantic retrieval over text units.
//!
//! Units are split into chunks, embedded, and indexed with HNSW into an
//! immutable generation. A rebuild writes a new generation under an
//! exclusive cross-process lock and publishes it by swapping the `CURRENT`
//! pointer, so queries never observe a half-written index.

pub mod analytics;
pub mod config;
pub mod eid;
pub mod error;
pub mod lock;
pub mod semantic;
pub mod sources;
pub mod storage;


pub use config::Config;
pub use error::{EngineError, Result};
pub use semantic::{Engine, RebuildMode};
pub use sources::{FsTreeSource, NoteSource, StaticSource, TextUnit, UnitInput, UnitSource};
