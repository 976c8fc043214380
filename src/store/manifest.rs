//! Durable manifest of the active segment set and codebooks.
//!
//! The manifest is a small line-oriented text file sealed by a trailing CRC32
//! line. It is replaced atomically (temp file + rename + directory fsync);
//! the previous version is kept as `MANIFEST.prev` and used as a fallback
//! when the current file fails its checksum.
//!
//! Segment lines appear in recency order (oldest first). That ordering — not
//! the numeric segment id — drives read shadowing, because a compaction
//! output has a fresh id but holds the oldest data.

use crate::error::{Error, Result};
use crate::pq::{hex16, parse_hex16};
use crate::store::{fsync_dir, fsync_file};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Current manifest file name.
pub const MANIFEST_NAME: &str = "MANIFEST";

/// Fallback copy of the previous manifest.
pub const MANIFEST_PREV_NAME: &str = "MANIFEST.prev";

/// One active segment as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSegment {
    pub id: u64,
    pub file_name: String,
    /// Compaction generation: 0 for sealed memtables, max(inputs)+1 for
    /// compaction outputs.
    pub generation: u32,
}

/// In-memory manifest state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    /// Active segments, oldest first.
    pub segments: Vec<ManifestSegment>,
    /// Referenced codebooks: (content hash, file name).
    pub codebooks: Vec<([u8; 16], String)>,
    /// Hash of the codebook new seals encode under, if any.
    pub active_codec: Option<[u8; 16]>,
}

impl Manifest {
    /// Largest segment id recorded, or 0 when empty.
    pub fn max_segment_id(&self) -> u64 {
        self.segments.iter().map(|s| s.id).max().unwrap_or(0)
    }

    /// Serialize to the line-oriented text format, CRC line included.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            out.push_str(&format!("segment {} {} {}\n", seg.id, seg.file_name, seg.generation));
        }
        for (hash, file_name) in &self.codebooks {
            out.push_str(&format!("codec {} {}\n", hex16(hash), file_name));
        }
        match &self.active_codec {
            Some(hash) => out.push_str(&format!("active_codec {}\n", hex16(hash))),
            None => out.push_str("active_codec none\n"),
        }
        let crc = crc32fast::hash(out.as_bytes());
        out.push_str(&format!("crc {crc:08x}\n"));
        out
    }

    /// Parse and verify a manifest file's contents.
    pub fn decode(text: &str, path: &Path) -> Result<Self> {
        let body_end = text
            .rfind("crc ")
            .ok_or_else(|| Error::corrupt(path, "missing CRC line"))?;
        let (body, crc_line) = text.split_at(body_end);
        let stored = crc_line
            .trim()
            .strip_prefix("crc ")
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .ok_or_else(|| Error::corrupt(path, "malformed CRC line"))?;
        let computed = crc32fast::hash(body.as_bytes());
        if stored != computed {
            return Err(Error::corrupt(
                path,
                format!("manifest CRC32 mismatch: stored {stored:#010x}, computed {computed:#010x}"),
            ));
        }

        let mut manifest = Manifest::default();
        let mut saw_active = false;
        for line in body.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["segment", id, file_name, generation] => {
                    let id = id
                        .parse()
                        .map_err(|_| Error::corrupt(path, format!("bad segment id in '{line}'")))?;
                    let generation = generation
                        .parse()
                        .map_err(|_| Error::corrupt(path, format!("bad generation in '{line}'")))?;
                    manifest.segments.push(ManifestSegment {
                        id,
                        file_name: (*file_name).to_string(),
                        generation,
                    });
                }
                ["codec", hash, file_name] => {
                    let hash = parse_hex16(hash)
                        .ok_or_else(|| Error::corrupt(path, format!("bad codec hash in '{line}'")))?;
                    manifest.codebooks.push((hash, (*file_name).to_string()));
                }
                ["active_codec", "none"] => saw_active = true,
                ["active_codec", hash] => {
                    manifest.active_codec = Some(
                        parse_hex16(hash)
                            .ok_or_else(|| Error::corrupt(path, format!("bad active codec in '{line}'")))?,
                    );
                    saw_active = true;
                }
                [] => {}
                _ => return Err(Error::corrupt(path, format!("unrecognized manifest line '{line}'"))),
            }
        }
        if !saw_active {
            return Err(Error::corrupt(path, "missing active_codec line"));
        }
        Ok(manifest)
    }

    /// Atomically replace the manifest in `dir`, preserving the previous
    /// version as the fallback copy.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_NAME);
        if path.exists() {
            fs::copy(&path, dir.join(MANIFEST_PREV_NAME))?;
        }
        let tmp = dir.join("MANIFEST.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(self.encode().as_bytes())?;
        fsync_file(&file)?;
        drop(file);
        fs::rename(&tmp, &path)?;
        fsync_dir(dir)?;
        tracing::debug!(
            segments = self.segments.len(),
            codebooks = self.codebooks.len(),
            "committed manifest"
        );
        Ok(())
    }

    /// Load the manifest from `dir`, falling back to the previous copy when
    /// the current one is corrupt. Returns `None` for a fresh directory.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let current = dir.join(MANIFEST_NAME);
        let prev = dir.join(MANIFEST_PREV_NAME);
        let primary = match fs::read_to_string(&current) {
            Ok(text) => Some(Self::decode(&text, &current)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        match primary {
            Some(Ok(manifest)) => Ok(Some(manifest)),
            Some(Err(primary_err)) => {
                tracing::warn!(error = %primary_err, "manifest rejected, trying fallback");
                match fs::read_to_string(&prev) {
                    Ok(text) => Ok(Some(Self::decode(&text, &prev)?)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(primary_err),
                    Err(e) => Err(e.into()),
                }
            }
            None => Ok(None),
        }
    }
}
