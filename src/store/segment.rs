//! Immutable on-disk segment files.
//!
//! A segment is produced by sealing a memtable or by compaction and never
//! changes afterwards. Layout (all little-endian):
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (72 bytes)                                           │
//! │   magic "SDBS", version u16, flags u16 (bit0=pq),           │
//! │   dim u32, record_count u32, min_seq u64, max_seq u64,      │
//! │   codec_hash [u8;16] (0 if raw), m u32, stride u32,         │
//! │   id_index_offset u64, graph_fragment_offset u64 (0)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Records: u16 id_len, id, u8 flags (bit0=tombstone),         │
//! │          u64 sequence, stride payload bytes                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Id index: sorted (u16 id_len, id, u64 record_offset)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ CRC32 (u32) over everything above                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Files are written to a temp name, fsynced, and renamed into place. Readers
//! map the file read-only and keep the parsed id index in memory for binary
//! search. A segment handle marked defunct unlinks its file once the last
//! reference drops.

use crate::error::{Error, Result};
use crate::store::fsync_file;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) const SEGMENT_MAGIC: &[u8; 4] = b"SDBS";
pub(crate) const SEGMENT_VERSION: u16 = 1;
pub(crate) const SEGMENT_HEADER_LEN: usize = 72;

/// Header flag: payloads are PQ codes.
const FLAG_PQ: u16 = 1;

/// Record flag: the record is a tombstone.
const RECORD_FLAG_TOMBSTONE: u8 = 1;

/// File extension for segment files.
pub const SEGMENT_EXT: &str = "sdbs";

/// Canonical file name for a segment id.
pub fn segment_file_name(id: u64) -> String {
    format!("segment-{id:06}.{SEGMENT_EXT}")
}

/// Parsed segment header.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub dim: u32,
    pub record_count: u32,
    pub min_seq: u64,
    pub max_seq: u64,
    /// Codebook content hash, all zeros for raw segments.
    pub codec_hash: [u8; 16],
    /// PQ subspace count, 0 for raw segments.
    pub m: u32,
    /// Payload bytes per record.
    pub stride: u32,
    /// True when payloads are PQ codes.
    pub pq: bool,
}

/// A borrowed view of one record inside a segment.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub id: &'a [u8],
    pub tombstone: bool,
    pub seq: u64,
    pub payload: &'a [u8],
    /// Offset of the payload within the segment file.
    pub payload_offset: u64,
}

/// An open, memory-mapped segment.
pub struct Segment {
    id: u64,
    path: PathBuf,
    meta: SegmentMeta,
    mmap: Mmap,
    /// Sorted (id, record offset) pairs parsed from the in-file index.
    index: Vec<(Box<[u8]>, u64)>,
    defunct: AtomicBool,
}

impl Segment {
    /// Open and validate a segment file.
    pub fn open(id: u64, path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the file is immutable once renamed into place; the engine
        // never maps a file it is still writing.
        let mmap = unsafe { Mmap::map(&file)? };
        let data: &[u8] = &mmap;

        if data.len() < SEGMENT_HEADER_LEN + 4 {
            return Err(Error::corrupt(path, format!("file too short: {} bytes", data.len())));
        }
        let (body, footer) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let computed_crc = crc32fast::hash(body);
        if stored_crc != computed_crc {
            return Err(Error::corrupt(
                path,
                format!("CRC32 mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"),
            ));
        }
        if &body[..4] != SEGMENT_MAGIC {
            return Err(Error::corrupt(path, "bad magic"));
        }
        let version = read_u16(body, 4);
        if version != SEGMENT_VERSION {
            return Err(Error::corrupt(path, format!("unsupported version {version}")));
        }
        let flags = read_u16(body, 6);
        let mut codec_hash = [0u8; 16];
        codec_hash.copy_from_slice(&body[32..48]);
        let meta = SegmentMeta {
            dim: read_u32(body, 8),
            record_count: read_u32(body, 12),
            min_seq: read_u64(body, 16),
            max_seq: read_u64(body, 24),
            codec_hash,
            m: read_u32(body, 48),
            stride: read_u32(body, 52),
            pq: flags & FLAG_PQ != 0,
        };
        let id_index_offset = read_u64(body, 56) as usize;
        let graph_fragment_offset = read_u64(body, 64);
        if graph_fragment_offset != 0 {
            return Err(Error::corrupt(path, "unexpected graph fragment"));
        }
        if id_index_offset < SEGMENT_HEADER_LEN || id_index_offset > body.len() {
            return Err(Error::corrupt(path, format!("id index offset {id_index_offset} out of range")));
        }
        if meta.pq {
            let with_norm = meta.m + 4;
            if meta.m == 0 || (meta.stride != meta.m && meta.stride != with_norm) {
                return Err(Error::corrupt(path, "inconsistent PQ stride"));
            }
        } else if meta.stride != meta.dim * 4 {
            return Err(Error::corrupt(path, "raw stride does not match dimension"));
        }

        // Parse the id index and verify every referenced record.
        let mut index: Vec<(Box<[u8]>, u64)> = Vec::with_capacity(meta.record_count as usize);
        let mut cursor = id_index_offset;
        for _ in 0..meta.record_count {
            if cursor + 2 > body.len() {
                return Err(Error::corrupt(path, "truncated id index"));
            }
            let id_len = read_u16(body, cursor) as usize;
            cursor += 2;
            if cursor + id_len + 8 > body.len() {
                return Err(Error::corrupt(path, "truncated id index entry"));
            }
            let rec_id: Box<[u8]> = body[cursor..cursor + id_len].into();
            cursor += id_len;
            let offset = read_u64(body, cursor);
            cursor += 8;
            if let Some((prev, _)) = index.last() {
                if prev.as_ref() >= rec_id.as_ref() {
                    return Err(Error::corrupt(path, "id index not strictly sorted"));
                }
            }
            index.push((rec_id, offset));
        }
        if cursor != body.len() {
            return Err(Error::corrupt(path, "trailing bytes after id index"));
        }

        let segment = Self {
            id,
            path: path.to_path_buf(),
            meta,
            mmap,
            index,
            defunct: AtomicBool::new(false),
        };
        for (rec_id, offset) in &segment.index {
            let rec = segment
                .record_at(*offset)
                .ok_or_else(|| Error::corrupt(path, "id index points at malformed record"))?;
            if rec.id != rec_id.as_ref() {
                return Err(Error::corrupt(path, "id index does not match record block"));
            }
        }
        Ok(segment)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn record_count(&self) -> usize {
        self.index.len()
    }

    /// Binary-search the id index.
    pub fn lookup(&self, id: &[u8]) -> Option<RecordView<'_>> {
        let pos = self
            .index
            .binary_search_by(|(k, _)| k.as_ref().cmp(id))
            .ok()?;
        self.record_at(self.index[pos].1)
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.index.binary_search_by(|(k, _)| k.as_ref().cmp(id)).is_ok()
    }

    /// Iterate all records in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = RecordView<'_>> {
        self.index.iter().filter_map(|(_, off)| self.record_at(*off))
    }

    /// Parse the record starting at `offset`. Returns `None` on any bounds
    /// violation; `open` verifies every indexed record so this cannot fire
    /// afterwards.
    fn record_at(&self, offset: u64) -> Option<RecordView<'_>> {
        let body = &self.mmap[..self.mmap.len() - 4];
        let stride = self.meta.stride as usize;
        let mut cursor = offset as usize;
        if cursor + 2 > body.len() {
            return None;
        }
        let id_len = read_u16(body, cursor) as usize;
        cursor += 2;
        if cursor + id_len + 1 + 8 + stride > body.len() {
            return None;
        }
        let id = &body[cursor..cursor + id_len];
        cursor += id_len;
        let flags = body[cursor];
        cursor += 1;
        let seq = read_u64(body, cursor);
        cursor += 8;
        let payload = &body[cursor..cursor + stride];
        Some(RecordView {
            id,
            tombstone: flags & RECORD_FLAG_TOMBSTONE != 0,
            seq,
            payload,
            payload_offset: cursor as u64,
        })
    }

    /// Payload slice at a known payload offset (hot path for search).
    pub fn payload_at(&self, payload_offset: u64) -> &[u8] {
        let start = payload_offset as usize;
        &self.mmap[start..start + self.meta.stride as usize]
    }

    /// Split a PQ payload into its code bytes and optional stored norm.
    pub fn codes_and_norm<'a>(&self, payload: &'a [u8]) -> (&'a [u8], Option<f32>) {
        debug_assert!(self.meta.pq);
        let m = self.meta.m as usize;
        let codes = &payload[..m];
        let norm = if payload.len() == m + 4 {
            Some(f32::from_le_bytes([
                payload[m],
                payload[m + 1],
                payload[m + 2],
                payload[m + 3],
            ]))
        } else {
            None
        };
        (codes, norm)
    }

    /// Mark this segment for unlinking once the last handle drops.
    pub fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.defunct.load(Ordering::Acquire) {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = ?self.path, error = %e, "failed to unlink defunct segment");
            } else {
                tracing::debug!(segment = self.id, path = ?self.path, "unlinked defunct segment");
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("records", &self.index.len())
            .finish()
    }
}

/// Decode a raw (uncompressed) payload into f32s.
///
/// Record payloads land at arbitrary offsets in the map, so this goes through
/// `from_le_bytes` instead of transmuting a possibly unaligned slice.
pub fn decode_raw_payload(payload: &[u8], out: &mut Vec<f32>) {
    out.clear();
    for chunk in payload.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
}

/// Incrementally assembles a segment file from id-sorted records.
pub struct SegmentBuilder {
    dim: u32,
    stride: u32,
    codec: Option<([u8; 16], u32)>,
    records: Vec<BuiltRecord>,
    last_id: Option<Box<[u8]>>,
}

struct BuiltRecord {
    id: Box<[u8]>,
    tombstone: bool,
    seq: u64,
    payload: Vec<u8>,
}

impl SegmentBuilder {
    /// `codec` is `(codebook hash, m)` for PQ segments, `None` for raw.
    pub fn new(dim: u32, stride: u32, codec: Option<([u8; 16], u32)>) -> Self {
        Self {
            dim,
            stride,
            codec,
            records: Vec::new(),
            last_id: None,
        }
    }

    /// Append a record. Ids must arrive in strictly ascending order; an empty
    /// payload (tombstones) is zero-filled to the stride.
    pub fn push(&mut self, id: &[u8], seq: u64, tombstone: bool, payload: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_id {
            if last.as_ref() >= id {
                return Err(Error::shape("segment records must be pushed in ascending id order"));
            }
        }
        if !payload.is_empty() && payload.len() != self.stride as usize {
            return Err(Error::shape(format!(
                "payload length {} does not match stride {}",
                payload.len(),
                self.stride
            )));
        }
        let mut owned = payload.to_vec();
        owned.resize(self.stride as usize, 0);
        self.last_id = Some(id.into());
        self.records.push(BuiltRecord {
            id: id.into(),
            tombstone,
            seq,
            payload: owned,
        });
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Write the segment to `path` atomically (temp + fsync + rename). The
    /// caller is responsible for fsyncing the containing directory.
    pub fn finish(self, path: &Path) -> Result<()> {
        let (min_seq, max_seq) = self
            .records
            .iter()
            .fold((u64::MAX, 0u64), |(lo, hi), r| (lo.min(r.seq), hi.max(r.seq)));
        let (min_seq, max_seq) = if self.records.is_empty() { (0, 0) } else { (min_seq, max_seq) };

        let mut body = Vec::new();
        body.extend_from_slice(SEGMENT_MAGIC);
        body.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        let flags: u16 = if self.codec.is_some() { FLAG_PQ } else { 0 };
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&self.dim.to_le_bytes());
        body.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        body.extend_from_slice(&min_seq.to_le_bytes());
        body.extend_from_slice(&max_seq.to_le_bytes());
        let (hash, m) = self.codec.unwrap_or(([0u8; 16], 0));
        body.extend_from_slice(&hash);
        body.extend_from_slice(&m.to_le_bytes());
        body.extend_from_slice(&self.stride.to_le_bytes());
        // Patched below once the record block length is known.
        let id_index_offset_at = body.len();
        body.extend_from_slice(&0u64.to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes()); // graph_fragment_offset
        debug_assert_eq!(body.len(), SEGMENT_HEADER_LEN);

        let mut offsets = Vec::with_capacity(self.records.len());
        for rec in &self.records {
            offsets.push(body.len() as u64);
            body.extend_from_slice(&(rec.id.len() as u16).to_le_bytes());
            body.extend_from_slice(&rec.id);
            body.push(if rec.tombstone { RECORD_FLAG_TOMBSTONE } else { 0 });
            body.extend_from_slice(&rec.seq.to_le_bytes());
            body.extend_from_slice(&rec.payload);
        }

        let id_index_offset = body.len() as u64;
        body[id_index_offset_at..id_index_offset_at + 8]
            .copy_from_slice(&id_index_offset.to_le_bytes());
        for (rec, offset) in self.records.iter().zip(&offsets) {
            body.extend_from_slice(&(rec.id.len() as u16).to_le_bytes());
            body.extend_from_slice(&rec.id);
            body.extend_from_slice(&offset.to_le_bytes());
        }

        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let tmp = tmp_path(path);
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        fsync_file(&file)?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn read_u64(b: &[u8], at: usize) -> u64 {
    u64::from_le_bytes([
        b[at],
        b[at + 1],
        b[at + 2],
        b[at + 3],
        b[at + 4],
        b[at + 5],
        b[at + 6],
        b[at + 7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir() -> PathBuf {
        let id = uuid::Uuid::new_v4();
        let dir = std::env::temp_dir().join(format!("sediment_seg_{id}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn raw_payload(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn build_raw(dir: &Path, id: u64, records: &[(&[u8], u64, bool, Vec<f32>)]) -> Segment {
        let dim = records
            .iter()
            .find(|r| !r.2)
            .map(|r| r.3.len())
            .unwrap_or(2) as u32;
        let mut builder = SegmentBuilder::new(dim, dim * 4, None);
        for (rid, seq, tomb, vec) in records {
            let payload = if *tomb { Vec::new() } else { raw_payload(vec) };
            builder.push(rid, *seq, *tomb, &payload).unwrap();
        }
        let path = dir.join(segment_file_name(id));
        builder.finish(&path).unwrap();
        Segment::open(id, &path).unwrap()
    }

    #[test]
    fn test_build_open_lookup() {
        let dir = tmp_dir();
        let seg = build_raw(
            &dir,
            1,
            &[
                (b"alpha", 1, false, vec![1.0, 2.0]),
                (b"beta", 2, false, vec![3.0, 4.0]),
                (b"gamma", 3, true, vec![]),
            ],
        );
        assert_eq!(seg.record_count(), 3);
        assert_eq!(seg.meta().min_seq, 1);
        assert_eq!(seg.meta().max_seq, 3);
        assert!(!seg.meta().pq);

        let rec = seg.lookup(b"beta").unwrap();
        assert_eq!(rec.seq, 2);
        assert!(!rec.tombstone);
        let mut v = Vec::new();
        decode_raw_payload(rec.payload, &mut v);
        assert_eq!(v, vec![3.0, 4.0]);

        let tomb = seg.lookup(b"gamma").unwrap();
        assert!(tomb.tombstone);
        assert!(seg.lookup(b"delta").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_iter_is_id_ordered() {
        let dir = tmp_dir();
        let seg = build_raw(
            &dir,
            1,
            &[
                (b"a", 5, false, vec![0.0, 0.0]),
                (b"b", 4, false, vec![0.0, 1.0]),
                (b"c", 6, false, vec![1.0, 0.0]),
            ],
        );
        let ids: Vec<Vec<u8>> = seg.iter().map(|r| r.id.to_vec()).collect();
        assert_eq!(ids, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rejects_unsorted_push() {
        let mut builder = SegmentBuilder::new(2, 8, None);
        builder.push(b"b", 1, false, &raw_payload(&[0.0, 0.0])).unwrap();
        assert!(builder.push(b"a", 2, false, &raw_payload(&[0.0, 0.0])).is_err());
        assert!(builder.push(b"b", 3, false, &raw_payload(&[0.0, 0.0])).is_err());
    }

    #[test]
    fn test_corruption_detected_on_open() {
        let dir = tmp_dir();
        let seg = build_raw(&dir, 1, &[(b"a", 1, false, vec![1.0, 2.0])]);
        let path = seg.path().to_path_buf();
        drop(seg);

        let mut raw = std::fs::read(&path).unwrap();
        raw[40] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();
        assert!(matches!(Segment::open(1, &path), Err(Error::CorruptSegment { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_truncation_detected_on_open() {
        let dir = tmp_dir();
        let seg = build_raw(&dir, 1, &[(b"a", 1, false, vec![1.0, 2.0])]);
        let path = seg.path().to_path_buf();
        drop(seg);

        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 10]).unwrap();
        assert!(matches!(Segment::open(1, &path), Err(Error::CorruptSegment { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_defunct_unlinks_on_drop() {
        let dir = tmp_dir();
        let seg = build_raw(&dir, 7, &[(b"a", 1, false, vec![1.0, 2.0])]);
        let path = seg.path().to_path_buf();
        assert!(path.exists());
        seg.mark_defunct();
        drop(seg);
        assert!(!path.exists(), "defunct segment file should be unlinked");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_pq_codes_and_norm() {
        let dir = tmp_dir();
        let hash = [7u8; 16];
        let mut builder = SegmentBuilder::new(8, 4 + 4, Some((hash, 4)));
        let mut payload = vec![1u8, 2, 3, 4];
        payload.extend_from_slice(&2.5f32.to_le_bytes());
        builder.push(b"x", 1, false, &payload).unwrap();
        let path = dir.join(segment_file_name(2));
        builder.finish(&path).unwrap();

        let seg = Segment::open(2, &path).unwrap();
        assert!(seg.meta().pq);
        assert_eq!(seg.meta().codec_hash, hash);
        let rec = seg.lookup(b"x").unwrap();
        let (codes, norm) = seg.codes_and_norm(rec.payload);
        assert_eq!(codes, &[1, 2, 3, 4]);
        assert_eq!(norm, Some(2.5));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_payload_at_matches_lookup() {
        let dir = tmp_dir();
        let seg = build_raw(&dir, 3, &[(b"k", 9, false, vec![4.0, 5.0])]);
        let rec = seg.lookup(b"k").unwrap();
        assert_eq!(seg.payload_at(rec.payload_offset), rec.payload);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
