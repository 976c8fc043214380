//! Global configuration constants for sediment.
//!
//! Tuning parameters and input validation limits live here as compile-time
//! constants; per-engine knobs are fields on `EngineConfig` and `HnswConfig`
//! and default to the values below.

/// Default number of bidirectional links per HNSW node.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default candidate list size during HNSW index construction.
///
/// Higher values produce a better graph at the cost of insert latency.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default candidate list size during HNSW search.
///
/// Higher values improve recall at the cost of query latency.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 50;

/// Maximum level any HNSW node may be assigned.
pub const HNSW_DEFAULT_ML_MAX: usize = 16;

/// Default maximum number of records held in the memtable before a seal.
pub const DEFAULT_MEMTABLE_MAX_RECORDS: usize = 1_000;

/// Default maximum payload bytes held in the memtable before a seal (4 MiB).
pub const DEFAULT_MEMTABLE_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Default live-segment count above which compaction is triggered.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 5;

/// Default number of (oldest) segments merged per compaction run.
pub const DEFAULT_COMPACTION_INPUT_COUNT: usize = 4;

/// Cap on Lloyd iterations during product-quantization training.
pub const PQ_KMEANS_MAX_ITERATIONS: usize = 25;

/// Seed for the k-means++ RNG.
///
/// Training is deterministic for identical samples, so retraining on the same
/// corpus reproduces the same codebook and content hash.
pub const PQ_TRAIN_SEED: u64 = 0x5eed_1e55_c0de_b00c;

/// Maximum supported vector dimension.
pub const MAX_DIMENSION: usize = 4_096;

/// Maximum length of a record identifier in bytes.
///
/// Identifiers are length-prefixed with a u16 on disk; this limit keeps id
/// index entries small.
pub const MAX_ID_LEN: usize = 512;
