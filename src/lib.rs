//! # sediment
//!
//! Embeddable vector database engine: an LSM-style store of memory-mapped
//! segment files behind an in-memory memtable, a product-quantization codec
//! for compressed storage and asymmetric distance, and an HNSW graph for
//! approximate nearest neighbor search.
//!
//! The crate is synchronous and thread-safe — a single logical writer,
//! arbitrarily many readers — with zero async dependencies, so it embeds
//! directly in a host process; a replication or sharding layer can sit on
//! top of the engine's change-stream/snapshot/apply-write boundary.
//!
//! ```no_run
//! use sediment::{Engine, EngineConfig, Metric};
//!
//! # fn main() -> sediment::Result<()> {
//! let mut config = EngineConfig::new(4);
//! config.metric = Metric::Euclidean;
//! let engine = Engine::open("./data", config)?;
//!
//! engine.store(b"a", &[1.0, 0.0, 0.0, 0.0])?;
//! engine.store(b"b", &[0.0, 1.0, 0.0, 0.0])?;
//! let hits = engine.search(&[1.0, 0.0, 0.0, 0.0], 2, None)?;
//! assert_eq!(hits[0].id, b"a");
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

/// Global tuning constants and validation limits.
pub mod config;
/// Engine façade: open/store/get/delete/search and background work.
pub mod engine;
/// Crate-wide error type.
pub mod error;
/// HNSW approximate nearest neighbor index.
pub mod hnsw;
/// Distance metrics.
pub mod metric;
/// Product quantization codec.
pub mod pq;
/// Memtable, segments, manifest, and compaction.
pub mod store;

pub use engine::{routing_hash, Change, Engine, EngineConfig, SearchHit};
pub use error::{Error, Result};
pub use hnsw::HnswConfig;
pub use metric::Metric;
pub use pq::PqCodebook;
