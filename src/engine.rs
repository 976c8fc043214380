//! Engine façade: orchestrates the store, PQ codec, and HNSW index.
//!
//! One engine owns one directory. Writes land in the memtable and the graph
//! under a single writer guard; readers share the guard and resolve vectors
//! through pinned `Arc` segment handles, so a concurrent compaction can
//! retire a segment without unmapping it under a reader. Every durable state
//! transition — seal, compaction, codebook publish — commits by atomically
//! replacing the manifest.
//!
//! Crash model: sealed segments referenced by the last durable manifest are
//! the recovery set; unsealed writes are lost by design (there is no WAL),
//! and orphan segment files are ignored on open and unlinked by the next
//! compaction commit.

use crate::config;
use crate::error::{Error, Result};
use crate::hnsw::{self, HnswConfig, HnswGraph, NodeVectors, Traversal};
use crate::metric::Metric;
use crate::pq::{self, DistanceTable, PqCodebook, CODEBOOK_EXT};
use crate::store::compact::{merge_segments, MergeResult};
use crate::store::manifest::{Manifest, ManifestSegment};
use crate::store::memtable::{MemRecord, Memtable};
use crate::store::segment::{decode_raw_payload, segment_file_name, Segment, SegmentBuilder, SEGMENT_EXT};
use crate::store;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Name of the single-writer lock file inside the store directory.
const LOCK_NAME: &str = "LOCK";

/// Suffix appended to quarantined segment files so orphan cleanup skips them.
const QUARANTINE_SUFFIX: &str = "quarantined";

/// How long the background worker sleeps between unprompted checks.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(200);

/// Stable routing hash over an identifier, for sharding consumers.
pub fn routing_hash(id: &[u8]) -> u64 {
    crc32fast::hash(id) as u64
}

/// Engine construction parameters. `dim` and `metric` are fixed for the life
/// of the store; the rest are tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Vector dimension; every stored and queried vector must match.
    pub dim: usize,
    /// Distance metric used for search and graph construction.
    pub metric: Metric,
    /// Memtable record-count seal threshold.
    pub memtable_max_records: usize,
    /// Memtable payload-byte seal threshold.
    pub memtable_max_bytes: usize,
    /// Live-segment count above which compaction triggers.
    pub compaction_threshold: usize,
    /// How many oldest segments one compaction merges (at least 2).
    pub compaction_input_count: usize,
    /// Run compaction from a background thread instead of only on demand.
    pub background_compaction: bool,
    /// HNSW tuning parameters.
    pub hnsw: HnswConfig,
}

impl EngineConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            metric: Metric::Euclidean,
            memtable_max_records: config::DEFAULT_MEMTABLE_MAX_RECORDS,
            memtable_max_bytes: config::DEFAULT_MEMTABLE_MAX_BYTES,
            compaction_threshold: config::DEFAULT_COMPACTION_THRESHOLD,
            compaction_input_count: config::DEFAULT_COMPACTION_INPUT_COUNT,
            background_compaction: false,
            hnsw: HnswConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.dim > config::MAX_DIMENSION {
            return Err(Error::shape(format!(
                "dimension must be in 1..={}, got {}",
                config::MAX_DIMENSION,
                self.dim
            )));
        }
        if self.memtable_max_records == 0 || self.memtable_max_bytes == 0 {
            return Err(Error::shape("memtable thresholds must be positive"));
        }
        if self.compaction_input_count < 2 {
            return Err(Error::shape("compaction_input_count must be at least 2"));
        }
        self.hnsw.validate()
    }
}

/// One search result: external id and exact metric distance.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: Vec<u8>,
    pub distance: f32,
}

/// One entry of the sealed change stream / snapshot boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub seq: u64,
    pub id: Vec<u8>,
    pub tombstone: bool,
    /// Decoded payload; `None` for tombstones.
    pub vector: Option<Vec<f32>>,
}

/// Where a node's vector currently lives.
#[derive(Debug, Clone)]
enum NodeLoc {
    /// The latest record sits in the memtable.
    Mem,
    /// The latest record sits in a sealed segment at this payload offset.
    Seg { segment: u64, payload_offset: u64 },
    /// A ghost whose memtable record was deleted or overwritten before any
    /// seal; the vector is pinned so the ghost stays navigable.
    Pinned(Arc<Vec<f32>>),
}

struct EngineState {
    memtable: Memtable,
    /// Active segments in recency order, oldest first.
    segments: Vec<Arc<Segment>>,
    manifest: Manifest,
    /// Compaction generation per segment id.
    generations: HashMap<u64, u32>,
    graph: HnswGraph,
    /// Parallel to graph nodes; stale for ghosts.
    node_locs: Vec<NodeLoc>,
    /// Internal id → external id.
    node_ids: Vec<Box<[u8]>>,
    /// External id → live internal id.
    live_nodes: HashMap<Box<[u8]>, u32>,
    codebooks: HashMap<[u8; 16], Arc<PqCodebook>>,
    active_codec: Option<Arc<PqCodebook>>,
    /// Writer-side visit ledger, reused across inserts under the write guard.
    traversal: Traversal,
    degraded: bool,
    quarantined: Vec<PathBuf>,
}

struct Shared {
    dir: PathBuf,
    config: EngineConfig,
    state: RwLock<EngineState>,
    next_seq: AtomicU64,
    next_segment_id: AtomicU64,
    compacting: AtomicBool,
    cancel: AtomicBool,
    worker_wake: (Mutex<bool>, Condvar),
    closed: AtomicBool,
}

impl Shared {
    fn notify_worker(&self) {
        let (lock, cvar) = &self.worker_wake;
        *lock.lock() = true;
        cvar.notify_one();
    }
}

/// Resolves node vectors against the current memtable + segment snapshot.
struct StateVectors<'a> {
    memtable: &'a Memtable,
    segments: &'a [Arc<Segment>],
    codebooks: &'a HashMap<[u8; 16], Arc<PqCodebook>>,
    node_locs: &'a [NodeLoc],
    node_ids: &'a [Box<[u8]>],
}

impl NodeVectors for StateVectors<'_> {
    fn vector_into(&self, node: u32, out: &mut Vec<f32>) -> bool {
        match self.node_locs.get(node as usize) {
            Some(NodeLoc::Mem) => {
                let id = &self.node_ids[node as usize];
                match self.memtable.get(id).and_then(|r| r.vector.as_ref()) {
                    Some(v) => {
                        out.clear();
                        out.extend_from_slice(v);
                        true
                    }
                    None => false,
                }
            }
            Some(NodeLoc::Seg { segment, payload_offset }) => {
                let Some(seg) = self.segments.iter().find(|s| s.id() == *segment) else {
                    return false;
                };
                let payload = seg.payload_at(*payload_offset);
                if seg.meta().pq {
                    let Some(cb) = self.codebooks.get(&seg.meta().codec_hash) else {
                        return false;
                    };
                    let (codes, _) = seg.codes_and_norm(payload);
                    cb.decode_into(codes, out);
                } else {
                    decode_raw_payload(payload, out);
                }
                true
            }
            Some(NodeLoc::Pinned(vector)) => {
                out.clear();
                out.extend_from_slice(vector);
                true
            }
            None => false,
        }
    }
}

/// The embeddable vector database engine.
pub struct Engine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open (or create) a store directory and recover its durable state.
    ///
    /// Fails with [`Error::ConcurrentModification`] when another live engine
    /// holds the directory lock. Corrupt segments are quarantined rather than
    /// failing the open; [`is_degraded`](Engine::is_degraded) reports it.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Engine> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        acquire_lock(&dir)?;
        match Self::open_locked(dir.clone(), config) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                let _ = fs::remove_file(dir.join(LOCK_NAME));
                Err(e)
            }
        }
    }

    fn open_locked(dir: PathBuf, config: EngineConfig) -> Result<Engine> {
        let manifest = match Manifest::load(&dir)? {
            Some(m) => m,
            None => {
                let fresh = Manifest::default();
                fresh.write(&dir)?;
                fresh
            }
        };

        // Codebooks first: segments are validated against them.
        let mut codebooks: HashMap<[u8; 16], Arc<PqCodebook>> = HashMap::new();
        for (hash, file_name) in &manifest.codebooks {
            let path = dir.join(file_name);
            match PqCodebook::load(&path) {
                Ok(cb) if cb.hash() == *hash && cb.dim() == config.dim => {
                    codebooks.insert(*hash, Arc::new(cb));
                }
                Ok(cb) if cb.hash() != *hash => {
                    tracing::warn!(
                        expected = %pq::hex16(hash),
                        actual = %cb.hash_hex(),
                        "codebook content hash mismatch; skipping"
                    );
                }
                Ok(cb) => {
                    tracing::warn!(
                        codebook_dim = cb.dim(),
                        engine_dim = config.dim,
                        "codebook dimension mismatch; skipping"
                    );
                }
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "failed to load codebook");
                }
            }
        }
        let mut degraded = false;
        let active_codec = match manifest.active_codec {
            Some(hash) => match codebooks.get(&hash) {
                Some(cb) => Some(cb.clone()),
                None => {
                    tracing::warn!(
                        hash = %pq::hex16(&hash),
                        "active codebook unavailable; new seals fall back to raw encoding"
                    );
                    degraded = true;
                    None
                }
            },
            None => None,
        };

        // Open segments in manifest (recency) order, quarantining failures.
        let mut segments: Vec<Arc<Segment>> = Vec::new();
        let mut generations = HashMap::new();
        let mut quarantined = Vec::new();
        for entry in &manifest.segments {
            let path = dir.join(&entry.file_name);
            match Segment::open(entry.id, &path) {
                Ok(seg) => {
                    let validation = validate_segment(&seg, &config, &codebooks);
                    match validation {
                        Ok(()) => {
                            generations.insert(entry.id, entry.generation);
                            segments.push(Arc::new(seg));
                        }
                        Err(e) => {
                            tracing::warn!(segment = entry.id, error = %e, "quarantining segment");
                            quarantined.push(quarantine_file(&dir, &entry.file_name)?);
                            degraded = true;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(segment = entry.id, error = %e, "quarantining unreadable segment");
                    if path.exists() {
                        quarantined.push(quarantine_file(&dir, &entry.file_name)?);
                    }
                    degraded = true;
                }
            }
        }

        let max_seq = segments.iter().map(|s| s.meta().max_seq).max().unwrap_or(0);
        let next_segment_id = manifest.max_segment_id() + 1;

        let mut state = EngineState {
            memtable: Memtable::new(),
            segments,
            manifest,
            generations,
            graph: HnswGraph::new(config.hnsw.clone()),
            node_locs: Vec::new(),
            node_ids: Vec::new(),
            live_nodes: HashMap::new(),
            codebooks,
            active_codec,
            traversal: Traversal::new(),
            degraded,
            quarantined,
        };
        rebuild_graph(&mut state, &config);

        let shared = Arc::new(Shared {
            dir: dir.clone(),
            config,
            next_seq: AtomicU64::new(max_seq + 1),
            next_segment_id: AtomicU64::new(next_segment_id),
            compacting: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            worker_wake: (Mutex::new(false), Condvar::new()),
            closed: AtomicBool::new(false),
            state: RwLock::new(state),
        });

        // Quarantines changed the active set; make the exclusion durable.
        {
            let mut state = shared.state.write();
            if state.degraded {
                Self::commit_manifest(&shared, &mut state)?;
            }
            tracing::info!(
                segments = state.segments.len(),
                live = state.graph.live_count(),
                next_seq = max_seq + 1,
                degraded = state.degraded,
                "opened engine"
            );
        }

        let worker = if shared.config.background_compaction {
            Some(spawn_worker(shared.clone()))
        } else {
            None
        };
        Ok(Engine {
            shared,
            worker: Mutex::new(worker),
        })
    }

    // ── Write path ───────────────────────────────────────────────────

    /// Store a vector under `id`, overwriting any earlier record. Returns
    /// the assigned sequence number once in-memory state reflects the write.
    pub fn store(&self, id: &[u8], vector: &[f32]) -> Result<u64> {
        self.ensure_open()?;
        self.validate_id(id)?;
        self.validate_dim(vector)?;
        let shared = &self.shared;
        let mut guard = shared.state.write();
        let state = &mut *guard;
        let seq = shared.next_seq.fetch_add(1, Ordering::SeqCst);
        pin_displaced(state, id);
        state.memtable.insert(
            id,
            MemRecord {
                seq,
                tombstone: false,
                vector: Some(vector.to_vec()),
            },
        );
        link_node(state, shared.config.metric, id, vector);
        self.maybe_seal(state)?;
        Ok(seq)
    }

    /// Install a tombstone for `id`. Idempotent: deleting an absent id is
    /// not an error.
    pub fn delete(&self, id: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.validate_id(id)?;
        let shared = &self.shared;
        let mut guard = shared.state.write();
        let state = &mut *guard;
        let seq = shared.next_seq.fetch_add(1, Ordering::SeqCst);
        pin_displaced(state, id);
        state.memtable.insert(
            id,
            MemRecord {
                seq,
                tombstone: true,
                vector: None,
            },
        );
        if let Some(old) = state.live_nodes.remove(id) {
            state.graph.mark_ghost(old);
        }
        self.maybe_seal(state)?;
        Ok(())
    }

    /// Replication entry point: apply a record with an externally assigned
    /// sequence. Idempotent — a record at or below the id's visible sequence
    /// is ignored.
    pub fn apply_write(
        &self,
        seq: u64,
        id: &[u8],
        tombstone: bool,
        vector: Option<&[f32]>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.validate_id(id)?;
        let vector = match (tombstone, vector) {
            (true, _) => None,
            (false, Some(v)) => {
                self.validate_dim(v)?;
                Some(v)
            }
            (false, None) => return Err(Error::shape("live record requires a vector")),
        };
        let shared = &self.shared;
        let mut guard = shared.state.write();
        let state = &mut *guard;
        if let Some(existing) = visible_seq(state, id) {
            if existing >= seq {
                return Ok(());
            }
        }
        shared.next_seq.fetch_max(seq + 1, Ordering::SeqCst);
        pin_displaced(state, id);
        state.memtable.insert(
            id,
            MemRecord {
                seq,
                tombstone,
                vector: vector.map(|v| v.to_vec()),
            },
        );
        if tombstone {
            if let Some(old) = state.live_nodes.remove(id) {
                state.graph.mark_ghost(old);
            }
        } else if let Some(v) = vector {
            link_node(state, shared.config.metric, id, v);
        }
        self.maybe_seal(state)?;
        Ok(())
    }

    /// Seal the memtable now, regardless of thresholds.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.shared.state.write();
        Self::seal_locked(&self.shared, &mut guard)
    }

    /// Seal, stop background work, and release the directory lock. Safe to
    /// call more than once; also invoked on drop.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.shared.notify_worker();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        {
            let mut guard = self.shared.state.write();
            Self::seal_locked(&self.shared, &mut guard)?;
        }
        match fs::remove_file(self.shared.dir.join(LOCK_NAME)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("closed engine");
        Ok(())
    }

    // ── Read path ────────────────────────────────────────────────────

    /// Fetch the visible vector for `id` (decoded when PQ-encoded).
    pub fn get(&self, id: &[u8]) -> Result<Vec<f32>> {
        self.ensure_open()?;
        let state = self.shared.state.read();
        if let Some(rec) = state.memtable.get(id) {
            return match (&rec.vector, rec.tombstone) {
                (_, true) => Err(Error::NotFound),
                (Some(v), false) => Ok(v.clone()),
                (None, false) => Err(Error::NotFound),
            };
        }
        for seg in state.segments.iter().rev() {
            if let Some(view) = seg.lookup(id) {
                if view.tombstone {
                    return Err(Error::NotFound);
                }
                let mut out = Vec::with_capacity(self.shared.config.dim);
                if seg.meta().pq {
                    let cb = state.codebooks.get(&seg.meta().codec_hash).ok_or_else(|| {
                        Error::corrupt(seg.path(), "segment codebook not loaded")
                    })?;
                    let (codes, _) = seg.codes_and_norm(view.payload);
                    cb.decode_into(codes, &mut out);
                } else {
                    decode_raw_payload(view.payload, &mut out);
                }
                return Ok(out);
            }
        }
        Err(Error::NotFound)
    }

    /// Top-k approximate nearest neighbor search.
    ///
    /// Navigation uses asymmetric PQ distance where segments are encoded and
    /// exact distance elsewhere; the final `k` are reranked with exact
    /// (decoded) distances. Reflects every write that completed before the
    /// call started.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        self.validate_dim(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let state = self.shared.state.read();
        let metric = self.shared.config.metric;
        let ef = ef.unwrap_or(self.shared.config.hnsw.ef_search).max(k);

        let tables: HashMap<[u8; 16], DistanceTable> = state
            .codebooks
            .iter()
            .map(|(hash, cb)| (*hash, cb.distance_table(query, metric)))
            .collect();
        let by_id: HashMap<u64, &Arc<Segment>> =
            state.segments.iter().map(|s| (s.id(), s)).collect();

        let mut scratch = Vec::with_capacity(query.len());
        let mut dist = |node: u32| -> f32 {
            match &state.node_locs[node as usize] {
                NodeLoc::Mem => {
                    let id = &state.node_ids[node as usize];
                    match state.memtable.get(id).and_then(|r| r.vector.as_ref()) {
                        Some(v) => metric.distance(query, v),
                        None => f32::MAX,
                    }
                }
                NodeLoc::Seg { segment, payload_offset } => {
                    let Some(seg) = by_id.get(segment) else { return f32::MAX };
                    let payload = seg.payload_at(*payload_offset);
                    if seg.meta().pq {
                        match tables.get(&seg.meta().codec_hash) {
                            Some(table) => {
                                let (codes, norm) = seg.codes_and_norm(payload);
                                table.estimate(codes, norm)
                            }
                            None => f32::MAX,
                        }
                    } else {
                        decode_raw_payload(payload, &mut scratch);
                        metric.distance(query, &scratch)
                    }
                }
                NodeLoc::Pinned(vector) => metric.distance(query, vector),
            }
        };
        let mut traversal = Traversal::new();
        let pool = hnsw::search(&state.graph, &mut dist, ef, &mut traversal);
        drop(dist);

        // Exact rerank of the pool before trimming to k.
        let src = StateVectors {
            memtable: &state.memtable,
            segments: &state.segments,
            codebooks: &state.codebooks,
            node_locs: &state.node_locs,
            node_ids: &state.node_ids,
        };
        let mut buf = Vec::with_capacity(query.len());
        let mut hits = Vec::with_capacity(pool.len());
        for (_, node) in pool {
            if src.vector_into(node, &mut buf) {
                hits.push(SearchHit {
                    id: state.node_ids[node as usize].to_vec(),
                    distance: metric.distance(query, &buf),
                });
            }
        }
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    // ── Codec ────────────────────────────────────────────────────────

    /// Train and publish a new active codebook. Existing segments keep their
    /// codec; new seals (and future compactions) encode under this one.
    /// Returns the codebook's content hash.
    pub fn train_compression(&self, samples: &[Vec<f32>], m: usize, nbits: u8) -> Result<String> {
        self.ensure_open()?;
        let codebook = pq::train(
            samples,
            self.shared.config.dim,
            m,
            nbits,
            config::PQ_KMEANS_MAX_ITERATIONS,
        )?;
        codebook.save(&self.shared.dir)?;
        let hex = codebook.hash_hex();
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let arc = Arc::new(codebook);
        state.codebooks.insert(arc.hash(), arc.clone());
        state.active_codec = Some(arc);
        Self::commit_manifest(&self.shared, state)?;
        tracing::info!(hash = %hex, "published active codebook");
        Ok(hex)
    }

    // ── Compaction ───────────────────────────────────────────────────

    /// Merge the oldest segments when more than `threshold` (default: the
    /// configured threshold) are live. Returns whether a compaction ran.
    pub fn maybe_compact(&self, threshold: Option<usize>) -> Result<bool> {
        self.ensure_open()?;
        let threshold = threshold.unwrap_or(self.shared.config.compaction_threshold);
        Self::compact_once(&self.shared, threshold)
    }

    fn compact_once(shared: &Shared, threshold: usize) -> Result<bool> {
        if shared.compacting.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let _guard = CompactingGuard(shared);

        let (inputs, later, codebooks, active, output_id, generation) = {
            let state = shared.state.read();
            if state.segments.len() <= threshold || state.segments.len() < 2 {
                return Ok(false);
            }
            let k = shared.config.compaction_input_count.min(state.segments.len());
            let inputs: Vec<Arc<Segment>> = state.segments[..k].to_vec();
            let later: Vec<Arc<Segment>> = state.segments[k..].to_vec();
            let generation = inputs
                .iter()
                .map(|s| state.generations.get(&s.id()).copied().unwrap_or(0))
                .max()
                .unwrap_or(0)
                + 1;
            let output_id = shared.next_segment_id.fetch_add(1, Ordering::SeqCst);
            (
                inputs,
                later,
                state.codebooks.clone(),
                state.active_codec.clone(),
                output_id,
                generation,
            )
        };

        tracing::info!(
            inputs = inputs.len(),
            output = output_id,
            "starting compaction"
        );
        let result = merge_segments(
            &shared.dir,
            output_id,
            generation,
            &inputs,
            &later,
            &codebooks,
            active.as_deref(),
            shared.config.metric,
            shared.config.dim,
            &shared.cancel,
        )?;

        let output = match result {
            MergeResult::Cancelled => return Ok(false),
            MergeResult::Empty => None,
            MergeResult::Written(outcome) => {
                let seg = Segment::open(outcome.output_id, &outcome.path)?;
                Some((Arc::new(seg), outcome.generation))
            }
        };

        let mut guard = shared.state.write();
        let state = &mut *guard;
        let k = inputs.len();
        debug_assert!(state
            .segments
            .iter()
            .take(k)
            .zip(&inputs)
            .all(|(a, b)| a.id() == b.id()));

        let mut new_segments: Vec<Arc<Segment>> = Vec::with_capacity(state.segments.len());
        if let Some((seg, gen)) = &output {
            state.generations.insert(seg.id(), *gen);
            new_segments.push(seg.clone());
        }
        new_segments.extend(state.segments[k..].iter().cloned());
        let input_names: Vec<String> = inputs
            .iter()
            .map(|s| file_name_of(s.path()))
            .collect();
        for input in &inputs {
            state.generations.remove(&input.id());
        }
        state.segments = new_segments;
        Self::commit_manifest(shared, state)?;

        // Inputs are safe to unlink only now that the manifest is durable.
        for input in &inputs {
            input.mark_defunct();
        }
        remove_orphan_segments(&shared.dir, &state.manifest, &input_names);
        rebind_compacted(state, &inputs, output.as_ref().map(|(seg, _)| seg));
        tracing::info!(
            merged = k,
            output = output.as_ref().map(|(seg, _)| seg.id()),
            remaining = state.segments.len(),
            "compaction committed"
        );
        Ok(true)
    }

    /// Rebuild the HNSW graph from live records, dropping accumulated ghosts.
    pub fn reindex(&self) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.shared.state.write();
        rebuild_graph(&mut guard, &self.shared.config);
        Ok(())
    }

    // ── Replication boundary ─────────────────────────────────────────

    /// Change stream derived from sealed segments: every surviving record
    /// with a sequence greater than `seq`, ordered by sequence. Compaction
    /// drops shadowed intermediate versions, so consumers resync from the
    /// snapshot when they fall behind the oldest surviving change.
    pub fn changes_since(&self, seq: u64) -> Result<Vec<Change>> {
        self.ensure_open()?;
        let state = self.shared.state.read();
        let mut out = Vec::new();
        for seg in &state.segments {
            for rec in seg.iter() {
                if rec.seq > seq {
                    out.push(self.change_from(&state, seg, rec)?);
                }
            }
        }
        out.sort_by_key(|c| c.seq);
        Ok(out)
    }

    /// Snapshot of sealed state: the latest sealed record per id, tombstones
    /// included so a bootstrapping follower can shadow stale replicated
    /// records. Ordered by id.
    pub fn sealed_snapshot(&self) -> Result<Vec<Change>> {
        self.ensure_open()?;
        let state = self.shared.state.read();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut out = Vec::new();
        for seg in state.segments.iter().rev() {
            for rec in seg.iter() {
                if seen.insert(rec.id.to_vec()) {
                    out.push(self.change_from(&state, seg, rec)?);
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn change_from(
        &self,
        state: &EngineState,
        seg: &Segment,
        rec: crate::store::segment::RecordView<'_>,
    ) -> Result<Change> {
        let vector = if rec.tombstone {
            None
        } else if seg.meta().pq {
            let cb = state
                .codebooks
                .get(&seg.meta().codec_hash)
                .ok_or_else(|| Error::corrupt(seg.path(), "segment codebook not loaded"))?;
            let mut out = Vec::with_capacity(self.shared.config.dim);
            let (codes, _) = seg.codes_and_norm(rec.payload);
            cb.decode_into(codes, &mut out);
            Some(out)
        } else {
            let mut out = Vec::with_capacity(self.shared.config.dim);
            decode_raw_payload(rec.payload, &mut out);
            Some(out)
        };
        Ok(Change {
            seq: rec.seq,
            id: rec.id.to_vec(),
            tombstone: rec.tombstone,
            vector,
        })
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Number of live (visible, non-tombstoned) identifiers.
    pub fn len(&self) -> usize {
        self.shared.state.read().live_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of active sealed segments.
    pub fn segment_count(&self) -> usize {
        self.shared.state.read().segments.len()
    }

    /// True after a corrupt segment or codebook was quarantined at open.
    pub fn is_degraded(&self) -> bool {
        self.shared.state.read().degraded
    }

    /// Paths of files quarantined at open.
    pub fn quarantined(&self) -> Vec<PathBuf> {
        self.shared.state.read().quarantined.clone()
    }

    /// Hash of the codebook new seals encode under, if any.
    pub fn active_codec(&self) -> Option<String> {
        self.shared
            .state
            .read()
            .active_codec
            .as_ref()
            .map(|cb| cb.hash_hex())
    }

    pub fn dim(&self) -> usize {
        self.shared.config.dim
    }

    pub fn metric(&self) -> Metric {
        self.shared.config.metric
    }

    // ── Internals ────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("engine is closed")));
        }
        Ok(())
    }

    fn validate_id(&self, id: &[u8]) -> Result<()> {
        if id.is_empty() || id.len() > config::MAX_ID_LEN {
            return Err(Error::shape(format!(
                "id length must be in 1..={}, got {}",
                config::MAX_ID_LEN,
                id.len()
            )));
        }
        Ok(())
    }

    fn validate_dim(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.shared.config.dim {
            return Err(Error::shape(format!(
                "vector dimension {} does not match engine dimension {}",
                vector.len(),
                self.shared.config.dim
            )));
        }
        Ok(())
    }

    fn maybe_seal(&self, state: &mut EngineState) -> Result<()> {
        if state.memtable.exceeds(
            self.shared.config.memtable_max_records,
            self.shared.config.memtable_max_bytes,
        ) {
            Self::seal_locked(&self.shared, state)?;
        }
        Ok(())
    }

    /// Seal the memtable into a new segment and commit the manifest. The
    /// calling writer blocks on the disk I/O; readers are excluded by the
    /// held write guard.
    fn seal_locked(shared: &Shared, state: &mut EngineState) -> Result<()> {
        if state.memtable.is_empty() {
            return Ok(());
        }
        let metric = shared.config.metric;
        let dim = shared.config.dim;
        let seg_id = shared.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let active = state.active_codec.clone();
        let (stride, codec) = match &active {
            Some(cb) => (
                (cb.m() + if metric.needs_stored_norm() { 4 } else { 0 }) as u32,
                Some((cb.hash(), cb.m() as u32)),
            ),
            None => ((dim * 4) as u32, None),
        };

        let mut builder = SegmentBuilder::new(dim as u32, stride, codec);
        let mut payload = Vec::new();
        for (id, rec) in state.memtable.iter() {
            if rec.tombstone {
                builder.push(id, rec.seq, true, &[])?;
                continue;
            }
            let Some(vector) = rec.vector.as_ref() else { continue };
            match &active {
                Some(cb) => {
                    cb.encode_into(vector, &mut payload);
                    if metric.needs_stored_norm() {
                        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
                        payload.extend_from_slice(&norm.to_le_bytes());
                    }
                }
                None => {
                    payload.clear();
                    for &x in vector {
                        payload.extend_from_slice(&x.to_le_bytes());
                    }
                }
            }
            builder.push(id, rec.seq, false, &payload)?;
        }
        let records = builder.record_count();
        let path = shared.dir.join(segment_file_name(seg_id));
        builder.finish(&path)?;
        store::fsync_dir(&shared.dir)?;

        let segment = Arc::new(Segment::open(seg_id, &path)?);
        state.generations.insert(seg_id, 0);
        state.segments.push(segment.clone());
        Self::commit_manifest(shared, state)?;

        // Rebind memtable-resident nodes to their sealed location.
        {
            let EngineState {
                ref memtable,
                ref live_nodes,
                ref mut node_locs,
                ..
            } = *state;
            for (id, rec) in memtable.iter() {
                if rec.tombstone {
                    continue;
                }
                if let Some(&node) = live_nodes.get(id) {
                    if let Some(view) = segment.lookup(id) {
                        node_locs[node as usize] = NodeLoc::Seg {
                            segment: seg_id,
                            payload_offset: view.payload_offset,
                        };
                    }
                }
            }
        }
        state.memtable.clear();
        tracing::info!(segment = seg_id, records, "sealed memtable");
        shared.notify_worker();
        Ok(())
    }

    /// Write the manifest reflecting current in-memory state, then unlink
    /// codebook files nothing references anymore.
    fn commit_manifest(shared: &Shared, state: &mut EngineState) -> Result<()> {
        let mut referenced: HashSet<[u8; 16]> = state
            .segments
            .iter()
            .filter(|s| s.meta().pq)
            .map(|s| s.meta().codec_hash)
            .collect();
        if let Some(active) = &state.active_codec {
            referenced.insert(active.hash());
        }

        let manifest = Manifest {
            segments: state
                .segments
                .iter()
                .map(|s| ManifestSegment {
                    id: s.id(),
                    file_name: file_name_of(s.path()),
                    generation: state.generations.get(&s.id()).copied().unwrap_or(0),
                })
                .collect(),
            codebooks: {
                let mut books: Vec<([u8; 16], String)> = referenced
                    .iter()
                    .map(|hash| (*hash, format!("{}.{}", pq::hex16(hash), CODEBOOK_EXT)))
                    .collect();
                books.sort_by_key(|(hash, _)| *hash);
                books
            },
            active_codec: state.active_codec.as_ref().map(|cb| cb.hash()),
        };
        manifest.write(&shared.dir)?;

        // Unreferenced codebooks are unlinked only after the durable write.
        let dropped: Vec<[u8; 16]> = state
            .codebooks
            .keys()
            .filter(|hash| !referenced.contains(*hash))
            .copied()
            .collect();
        for hash in dropped {
            state.codebooks.remove(&hash);
            let path = shared
                .dir
                .join(format!("{}.{}", pq::hex16(&hash), CODEBOOK_EXT));
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = ?path, error = %e, "failed to unlink codebook");
                }
            } else {
                tracing::info!(hash = %pq::hex16(&hash), "unlinked unreferenced codebook");
            }
        }
        state.manifest = manifest;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "engine close on drop failed");
            }
        }
    }
}

/// Resets the compaction flag when a compaction attempt unwinds.
struct CompactingGuard<'a>(&'a Shared);

impl Drop for CompactingGuard<'_> {
    fn drop(&mut self) {
        self.0.compacting.store(false, Ordering::SeqCst);
    }
}

// ── Free helpers ─────────────────────────────────────────────────────

/// Register a (possibly replacing) live node for `id` and link it into the
/// graph. The record must already be in the memtable so the graph can
/// resolve the new node during reverse-edge pruning.
fn link_node(state: &mut EngineState, metric: Metric, id: &[u8], vector: &[f32]) {
    if let Some(&old) = state.live_nodes.get(id) {
        state.graph.mark_ghost(old);
    }
    let internal = state.graph.node_count();
    state.node_locs.push(NodeLoc::Mem);
    state.node_ids.push(id.into());
    state.live_nodes.insert(id.into(), internal);

    let EngineState {
        ref memtable,
        ref segments,
        ref codebooks,
        ref mut graph,
        ref node_locs,
        ref node_ids,
        ref mut traversal,
        ..
    } = *state;
    let src = StateVectors {
        memtable,
        segments,
        codebooks,
        node_locs,
        node_ids,
    };
    hnsw::insert(graph, &src, metric, internal, vector, traversal);
}

/// Rebuild the graph from the latest visible record per id (memtable first,
/// then segments newest-first).
fn rebuild_graph(state: &mut EngineState, config: &EngineConfig) {
    state.graph = HnswGraph::new(config.hnsw.clone());
    state.node_locs.clear();
    state.node_ids.clear();
    state.live_nodes.clear();
    let mut seen: HashSet<Vec<u8>> = HashSet::new();

    let mem_entries: Vec<(Box<[u8]>, Option<Vec<f32>>)> = state
        .memtable
        .iter()
        .map(|(id, rec)| {
            (
                Box::<[u8]>::from(id),
                if rec.tombstone { None } else { rec.vector.clone() },
            )
        })
        .collect();
    for (id, vector) in mem_entries {
        seen.insert(id.to_vec());
        if let Some(vector) = vector {
            register_node(state, config.metric, &id, NodeLoc::Mem, &vector);
        }
    }

    let segments: Vec<Arc<Segment>> = state.segments.clone();
    let mut decoded = Vec::with_capacity(config.dim);
    for seg in segments.iter().rev() {
        for rec in seg.iter() {
            if !seen.insert(rec.id.to_vec()) {
                continue;
            }
            if rec.tombstone {
                continue;
            }
            if seg.meta().pq {
                let Some(cb) = state.codebooks.get(&seg.meta().codec_hash) else {
                    continue;
                };
                let (codes, _) = seg.codes_and_norm(rec.payload);
                cb.decode_into(codes, &mut decoded);
            } else {
                decode_raw_payload(rec.payload, &mut decoded);
            }
            let loc = NodeLoc::Seg {
                segment: seg.id(),
                payload_offset: rec.payload_offset,
            };
            let id: Box<[u8]> = rec.id.into();
            let vector = decoded.clone();
            register_node(state, config.metric, &id, loc, &vector);
        }
    }
    tracing::debug!(live = state.graph.live_count(), "rebuilt graph");
}

fn register_node(state: &mut EngineState, metric: Metric, id: &[u8], loc: NodeLoc, vector: &[f32]) {
    let internal = state.graph.node_count();
    state.node_locs.push(loc);
    state.node_ids.push(id.into());
    state.live_nodes.insert(id.into(), internal);
    let EngineState {
        ref memtable,
        ref segments,
        ref codebooks,
        ref mut graph,
        ref node_locs,
        ref node_ids,
        ref mut traversal,
        ..
    } = *state;
    let src = StateVectors {
        memtable,
        segments,
        codebooks,
        node_locs,
        node_ids,
    };
    hnsw::insert(graph, &src, metric, internal, vector, traversal);
}

/// Repoint live nodes whose vectors lived in compaction inputs at the output
/// segment.
fn rebind_compacted(state: &mut EngineState, inputs: &[Arc<Segment>], output: Option<&Arc<Segment>>) {
    let input_ids: HashSet<u64> = inputs.iter().map(|s| s.id()).collect();
    let EngineState {
        ref mut node_locs,
        ref node_ids,
        ..
    } = *state;
    for node in 0..node_locs.len() {
        let NodeLoc::Seg { segment, .. } = &node_locs[node] else { continue };
        if !input_ids.contains(segment) {
            continue;
        }
        // Live nodes always resolve: the input held their visible record, so
        // the merge preserved it. A ghost's shadowed payload may be gone; it
        // then keeps its stale location and only costs navigation quality.
        let resolved = output.and_then(|out| {
            out.lookup(&node_ids[node]).map(|view| NodeLoc::Seg {
                segment: out.id(),
                payload_offset: view.payload_offset,
            })
        });
        if let Some(loc) = resolved {
            node_locs[node] = loc;
        }
    }
}

/// Before a memtable record for `id` is replaced or tombstoned, pin the
/// displaced vector to its (about to become ghost) node so the node stays
/// navigable until the next rebuild.
fn pin_displaced(state: &mut EngineState, id: &[u8]) {
    let Some(&node) = state.live_nodes.get(id) else { return };
    if !matches!(state.node_locs[node as usize], NodeLoc::Mem) {
        return;
    }
    if let Some(vector) = state.memtable.get(id).and_then(|r| r.vector.clone()) {
        state.node_locs[node as usize] = NodeLoc::Pinned(Arc::new(vector));
    }
}

/// Latest visible sequence for `id` across memtable and segments.
fn visible_seq(state: &EngineState, id: &[u8]) -> Option<u64> {
    if let Some(rec) = state.memtable.get(id) {
        return Some(rec.seq);
    }
    for seg in state.segments.iter().rev() {
        if let Some(view) = seg.lookup(id) {
            return Some(view.seq);
        }
    }
    None
}

fn validate_segment(
    seg: &Segment,
    config: &EngineConfig,
    codebooks: &HashMap<[u8; 16], Arc<PqCodebook>>,
) -> Result<()> {
    let meta = seg.meta();
    if meta.dim as usize != config.dim {
        return Err(Error::corrupt(
            seg.path(),
            format!("segment dimension {} != engine dimension {}", meta.dim, config.dim),
        ));
    }
    if meta.pq {
        let Some(cb) = codebooks.get(&meta.codec_hash) else {
            return Err(Error::corrupt(seg.path(), "referenced codebook is not loadable"));
        };
        let expected = cb.m() as u32 + if config.metric.needs_stored_norm() { 4 } else { 0 };
        if meta.stride != expected {
            return Err(Error::corrupt(
                seg.path(),
                format!("stride {} does not match codec layout {expected}", meta.stride),
            ));
        }
    }
    Ok(())
}

fn quarantine_file(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let from = dir.join(file_name);
    let to = dir.join(format!("{file_name}.{QUARANTINE_SUFFIX}"));
    fs::rename(&from, &to)?;
    Ok(to)
}

/// Unlink segment files on disk that the durable manifest does not reference.
/// Compaction inputs are excluded; their `Arc` handles unlink them on drop.
fn remove_orphan_segments(dir: &Path, manifest: &Manifest, skip: &[String]) {
    let referenced: HashSet<&str> = manifest.segments.iter().map(|s| s.file_name.as_str()).collect();
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(&format!(".{SEGMENT_EXT}")) {
            continue;
        }
        if referenced.contains(name) || skip.iter().any(|s| s == name) {
            continue;
        }
        let path = entry.path();
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(path = ?path, error = %e, "failed to unlink orphan segment");
        } else {
            tracing::info!(path = ?path, "unlinked orphan segment");
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn spawn_worker(shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let threshold = shared.config.compaction_threshold;
        loop {
            {
                let (lock, cvar) = &shared.worker_wake;
                let mut pending = lock.lock();
                if !*pending {
                    cvar.wait_for(&mut pending, WORKER_IDLE_WAIT);
                }
                *pending = false;
            }
            if shared.cancel.load(Ordering::SeqCst) {
                break;
            }
            match Engine::compact_once(&shared, threshold) {
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "background compaction failed"),
            }
        }
    })
}

fn acquire_lock(dir: &Path) -> Result<()> {
    let path = dir.join(LOCK_NAME);
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(&path) {
                    tracing::warn!(path = ?path, "removing stale lock file");
                    let _ = fs::remove_file(&path);
                    continue;
                }
                return Err(Error::ConcurrentModification);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::ConcurrentModification)
}

/// A lock is stale when its recorded process no longer exists. A lock held
/// by this very process is never stale: that is a second in-process engine.
fn lock_is_stale(path: &Path) -> bool {
    let Ok(text) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = text.trim().parse::<u32>() else {
        return true;
    };
    if pid == std::process::id() {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        !Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
