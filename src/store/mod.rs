//! Storage layer: memtable, immutable mmap segments, manifest, compaction.
//!
//! Writes are absorbed by an in-memory [`Memtable`](memtable::Memtable) and
//! periodically sealed into immutable, memory-mapped
//! [`Segment`](segment::Segment) files. The [`Manifest`](manifest::Manifest)
//! is the durable record of the active segment set and codebooks; every
//! state transition (seal, compaction, codebook publish) lands by writing a
//! new manifest and renaming it into place.

/// Segment merging, tombstone garbage collection, and codec migration.
pub mod compact;
/// Durable manifest of the active segment set (text, CRC-sealed).
pub mod manifest;
/// In-memory, ordered, write-absorbing table.
pub mod memtable;
/// Immutable on-disk segment files with an in-file id index.
pub mod segment;

pub use compact::{merge_segments, MergeOutcome, MergeResult};
pub use manifest::{Manifest, ManifestSegment};
pub use memtable::{MemRecord, Memtable};
pub use segment::{segment_file_name, Segment, SegmentBuilder};

use std::fs::File;
use std::io;
use std::path::Path;

/// `fsync` a file, retrying on transient `EINTR`.
pub(crate) fn fsync_file(file: &File) -> io::Result<()> {
    loop {
        match file.sync_all() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// `fsync` a directory so a completed rename is durable.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    let handle = File::open(dir)?;
    fsync_file(&handle)
}
