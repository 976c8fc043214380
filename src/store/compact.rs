//! Segment compaction: k-way merge, tombstone GC, codec migration.
//!
//! Compaction merges the oldest segments into one output whose id is greater
//! than any existing segment. For each id the record with the highest
//! sequence wins; a winning tombstone is dropped entirely when no segment
//! outside the input set still holds the id (nothing left to shadow).
//!
//! The merge runs without any engine lock, against pinned segment handles.
//! Committing the result (manifest swap, input unlinking) is the engine's
//! job, so a cancelled or crashed merge leaves at most an orphan file.

use crate::error::{Error, Result};
use crate::metric::Metric;
use crate::pq::PqCodebook;
use crate::store::segment::{decode_raw_payload, segment_file_name, RecordView, Segment, SegmentBuilder};
use crate::store::fsync_dir;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A successfully written (but not yet committed) compaction output.
#[derive(Debug)]
pub struct MergeOutcome {
    pub output_id: u64,
    pub generation: u32,
    pub path: PathBuf,
    pub records: usize,
}

/// Result of a merge attempt.
#[derive(Debug)]
pub enum MergeResult {
    /// Output written and fsynced, ready for manifest commit.
    Written(MergeOutcome),
    /// Every input record was dropped; commit removes the inputs only.
    Empty,
    /// The cancellation flag fired; no output was produced.
    Cancelled,
}

/// Merge `inputs` into a single output segment on disk.
///
/// `later` is every active segment outside the input set (all of them are
/// newer, since compaction always takes the oldest segments); it drives the
/// tombstone drop rule. When the active codebook differs from an input's
/// codec, records are decoded under their original codebook and re-encoded.
#[allow(clippy::too_many_arguments)]
pub fn merge_segments(
    dir: &Path,
    output_id: u64,
    generation: u32,
    inputs: &[Arc<Segment>],
    later: &[Arc<Segment>],
    codebooks: &HashMap<[u8; 16], Arc<PqCodebook>>,
    active: Option<&PqCodebook>,
    metric: Metric,
    dim: usize,
    cancel: &AtomicBool,
) -> Result<MergeResult> {
    let stride = match active {
        Some(cb) => (cb.m() + if metric.needs_stored_norm() { 4 } else { 0 }) as u32,
        None => dim as u32 * 4,
    };
    let codec = active.map(|cb| (cb.hash(), cb.m() as u32));
    let mut builder = SegmentBuilder::new(dim as u32, stride, codec);

    let mut cursors: Vec<_> = inputs.iter().map(|s| s.iter().peekable()).collect();
    let mut decoded = Vec::with_capacity(dim);
    let mut encoded = Vec::new();

    loop {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!(output = output_id, "compaction cancelled mid-merge");
            return Ok(MergeResult::Cancelled);
        }

        // Smallest id across the cursor heads.
        let min_id: Option<Vec<u8>> = cursors
            .iter_mut()
            .filter_map(|c| c.peek().map(|r| r.id.to_vec()))
            .min();
        let Some(min_id) = min_id else { break };

        // Pop every record with that id; the highest sequence wins.
        let mut winner: Option<(usize, RecordView<'_>)> = None;
        for (rank, cursor) in cursors.iter_mut().enumerate() {
            if cursor.peek().map(|r| r.id == min_id.as_slice()) == Some(true) {
                let rec = cursor.next().expect("peeked record must exist");
                if winner.as_ref().map(|(_, w)| rec.seq > w.seq).unwrap_or(true) {
                    winner = Some((rank, rec));
                }
            }
        }
        let (rank, rec) = winner.expect("at least one cursor held the minimum id");

        if rec.tombstone {
            let shadowed_later = later.iter().any(|s| s.contains(&min_id));
            if shadowed_later {
                builder.push(&min_id, rec.seq, true, &[])?;
            }
            // Otherwise the id is fully dead; drop it.
            continue;
        }

        let src = &inputs[rank];
        let src_meta = src.meta();
        let same_codec = match (src_meta.pq, active) {
            (false, None) => true,
            (true, Some(cb)) => src_meta.codec_hash == cb.hash() && src_meta.stride == stride,
            _ => false,
        };
        if same_codec {
            builder.push(&min_id, rec.seq, false, rec.payload)?;
            continue;
        }

        // Codec migration: decode under the source codec, re-encode.
        if src_meta.pq {
            let codebook = codebooks.get(&src_meta.codec_hash).ok_or_else(|| {
                Error::corrupt(
                    src.path(),
                    "segment references a codebook missing from the manifest",
                )
            })?;
            let (codes, _) = src.codes_and_norm(rec.payload);
            codebook.decode_into(codes, &mut decoded);
        } else {
            decode_raw_payload(rec.payload, &mut decoded);
        }

        match active {
            Some(cb) => {
                cb.encode_into(&decoded, &mut encoded);
                if metric.needs_stored_norm() {
                    let norm = decoded.iter().map(|x| x * x).sum::<f32>().sqrt();
                    encoded.extend_from_slice(&norm.to_le_bytes());
                }
            }
            None => {
                encoded.clear();
                for &v in &decoded {
                    encoded.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        builder.push(&min_id, rec.seq, false, &encoded)?;
    }

    let records = builder.record_count();
    if records == 0 {
        tracing::info!(
            inputs = inputs.len(),
            "compaction dropped every record; no output segment"
        );
        return Ok(MergeResult::Empty);
    }

    let path = dir.join(segment_file_name(output_id));
    builder.finish(&path)?;
    fsync_dir(dir)?;
    tracing::info!(
        output = output_id,
        generation,
        records,
        inputs = inputs.len(),
        "wrote compaction output"
    );
    Ok(MergeResult::Written(MergeOutcome {
        output_id,
        generation,
        path,
        records,
    }))
}
