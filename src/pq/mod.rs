//! Product quantization: codebooks, encoding, and asymmetric distance.
//!
//! A trained codebook splits each vector into `m` contiguous subvectors and
//! maps every subvector to its nearest centroid, so a stored vector becomes
//! `m` code bytes. Query-time distance uses a precomputed lookup table
//! (asymmetric distance computation): `m` table lookups and additions instead
//! of a full `dim`-wide pass over a decoded vector.
//!
//! Codebooks are immutable once published and identified by a truncated
//! SHA-256 content hash; retraining yields a new hash.

pub mod training;

use crate::error::{Error, Result};
use crate::metric::{similarity_distance, Metric};
use crate::store::{fsync_dir, fsync_file};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub use training::train;

/// Magic bytes at the start of a codebook file.
const CODEBOOK_MAGIC: &[u8; 4] = b"SDBC";

/// Codebook file format version.
const CODEBOOK_VERSION: u16 = 1;

/// Fixed header length: magic, version, nbits, reserved, dim, m.
const CODEBOOK_HEADER_LEN: usize = 16;

/// File extension for codebook files; the stem is the content hash in hex.
pub const CODEBOOK_EXT: &str = "sdbc";

/// A trained product-quantization codebook.
///
/// Centroids are stored in a flat arena:
/// `centroids[sub * k * sub_dim + c * sub_dim ..][..sub_dim]` is centroid `c`
/// of subspace `sub`.
#[derive(Debug, Clone)]
pub struct PqCodebook {
    dim: usize,
    m: usize,
    nbits: u8,
    sub_dim: usize,
    centroids: Vec<f32>,
    hash: [u8; 16],
}

impl PqCodebook {
    /// Assemble a codebook from trained centroids, computing its content hash.
    pub(crate) fn from_parts(dim: usize, m: usize, nbits: u8, centroids: Vec<f32>) -> Self {
        debug_assert_eq!(centroids.len(), m * (1usize << nbits) * (dim / m));
        let hash = content_hash(dim, m, nbits, &centroids);
        Self {
            dim,
            m,
            nbits,
            sub_dim: dim / m,
            centroids,
            hash,
        }
    }

    /// Vector dimension this codebook was trained for.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of subspaces (= code bytes per vector).
    pub fn m(&self) -> usize {
        self.m
    }

    /// Bits per subspace code.
    pub fn nbits(&self) -> u8 {
        self.nbits
    }

    /// Centroids per subspace: `2^nbits`.
    pub fn k(&self) -> usize {
        1usize << self.nbits
    }

    /// Truncated SHA-256 content hash identifying this codebook.
    pub fn hash(&self) -> [u8; 16] {
        self.hash
    }

    /// Content hash as lowercase hex, used as the codebook file stem.
    pub fn hash_hex(&self) -> String {
        hex16(&self.hash)
    }

    fn centroid(&self, sub: usize, c: usize) -> &[f32] {
        let start = (sub * self.k() + c) * self.sub_dim;
        &self.centroids[start..start + self.sub_dim]
    }

    /// Encode a vector into `m` code bytes (nearest centroid per subspace
    /// under L2).
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = Vec::with_capacity(self.m);
        self.encode_into(vector, &mut codes);
        codes
    }

    /// Encode into a caller-provided buffer, clearing it first.
    pub fn encode_into(&self, vector: &[f32], out: &mut Vec<u8>) {
        debug_assert_eq!(vector.len(), self.dim);
        out.clear();
        for sub in 0..self.m {
            let sv = &vector[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            out.push(self.nearest_centroid(sub, sv));
        }
    }

    fn nearest_centroid(&self, sub: usize, sv: &[f32]) -> u8 {
        let mut best = 0u8;
        let mut best_dist = f32::MAX;
        for c in 0..self.k() {
            let centroid = self.centroid(sub, c);
            let mut dist = 0.0f32;
            for d in 0..self.sub_dim {
                let diff = sv[d] - centroid[d];
                dist += diff * diff;
            }
            if dist < best_dist {
                best_dist = dist;
                best = c as u8;
            }
        }
        best
    }

    /// Reconstruct a vector from its codes. Lossy by design.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim);
        self.decode_into(codes, &mut out);
        out
    }

    /// Reconstruct into a caller-provided buffer, clearing it first.
    pub fn decode_into(&self, codes: &[u8], out: &mut Vec<f32>) {
        debug_assert_eq!(codes.len(), self.m);
        out.clear();
        for (sub, &code) in codes.iter().enumerate() {
            out.extend_from_slice(self.centroid(sub, code as usize));
        }
    }

    /// Build the asymmetric distance table for one query under `metric`.
    pub fn distance_table(&self, query: &[f32], metric: Metric) -> DistanceTable {
        debug_assert_eq!(query.len(), self.dim);
        let k = self.k();
        let mut table = vec![0.0f32; self.m * k];
        for sub in 0..self.m {
            let qs = &query[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            for c in 0..k {
                let centroid = self.centroid(sub, c);
                table[sub * k + c] = match metric {
                    Metric::Euclidean => {
                        let mut sum = 0.0f32;
                        for d in 0..self.sub_dim {
                            let diff = qs[d] - centroid[d];
                            sum += diff * diff;
                        }
                        sum
                    }
                    Metric::Manhattan => {
                        let mut sum = 0.0f32;
                        for d in 0..self.sub_dim {
                            sum += (qs[d] - centroid[d]).abs();
                        }
                        sum
                    }
                    Metric::Dot => {
                        let mut sum = 0.0f32;
                        for d in 0..self.sub_dim {
                            sum += qs[d] * centroid[d];
                        }
                        -sum
                    }
                    // Cosine and angular accumulate the dot-product numerator;
                    // the stored record norm supplies the denominator.
                    Metric::Cosine | Metric::Angular => {
                        let mut sum = 0.0f32;
                        for d in 0..self.sub_dim {
                            sum += qs[d] * centroid[d];
                        }
                        sum
                    }
                };
            }
        }
        let query_norm = query.iter().map(|x| x * x).sum::<f32>().sqrt();
        DistanceTable {
            metric,
            m: self.m,
            k,
            table,
            query_norm,
        }
    }

    /// Write the codebook to `dir` as `<hash>.sdbc`, atomically.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let name = format!("{}.{}", self.hash_hex(), CODEBOOK_EXT);
        let path = dir.join(&name);
        let tmp = dir.join(format!("{name}.tmp"));

        let mut buf = Vec::with_capacity(CODEBOOK_HEADER_LEN + self.centroids.len() * 4 + 4);
        buf.extend_from_slice(CODEBOOK_MAGIC);
        buf.extend_from_slice(&CODEBOOK_VERSION.to_le_bytes());
        buf.push(self.nbits);
        buf.push(0); // reserved
        buf.extend_from_slice(&(self.dim as u32).to_le_bytes());
        buf.extend_from_slice(&(self.m as u32).to_le_bytes());
        for &c in &self.centroids {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        fsync_file(&file)?;
        drop(file);
        fs::rename(&tmp, &path)?;
        fsync_dir(dir)?;
        tracing::info!(hash = %self.hash_hex(), bytes = buf.len(), "saved codebook");
        Ok(path)
    }

    /// Load and validate a codebook file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        if raw.len() < CODEBOOK_HEADER_LEN + 4 {
            return Err(Error::corrupt(path, "codebook file too short"));
        }
        let (body, footer) = raw.split_at(raw.len() - 4);
        let stored_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let computed_crc = crc32fast::hash(body);
        if stored_crc != computed_crc {
            return Err(Error::corrupt(
                path,
                format!("codebook CRC32 mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"),
            ));
        }
        if &body[..4] != CODEBOOK_MAGIC {
            return Err(Error::corrupt(path, "bad codebook magic"));
        }
        let version = u16::from_le_bytes([body[4], body[5]]);
        if version != CODEBOOK_VERSION {
            return Err(Error::corrupt(path, format!("unsupported codebook version {version}")));
        }
        let nbits = body[6];
        let dim = u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;
        let m = u32::from_le_bytes([body[12], body[13], body[14], body[15]]) as usize;
        if nbits == 0 || nbits > 8 || m == 0 || dim == 0 || dim % m != 0 {
            return Err(Error::corrupt(path, "inconsistent codebook parameters"));
        }
        let k = 1usize << nbits;
        let expected = CODEBOOK_HEADER_LEN + m * k * (dim / m) * 4;
        if body.len() != expected {
            return Err(Error::corrupt(
                path,
                format!("codebook length {} != expected {expected}", body.len()),
            ));
        }
        let centroids: Vec<f32> = body[CODEBOOK_HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::from_parts(dim, m, nbits, centroids))
    }
}

/// Per-query lookup table for asymmetric distance over PQ codes.
///
/// `estimate` approximates the *true* metric distance, so its output is
/// directly comparable with exact distances computed on raw vectors.
#[derive(Debug)]
pub struct DistanceTable {
    metric: Metric,
    m: usize,
    k: usize,
    table: Vec<f32>,
    query_norm: f32,
}

impl DistanceTable {
    /// Approximate distance from the query to an encoded vector.
    ///
    /// `stored_norm` is the record's vector norm; required for cosine and
    /// angular, ignored otherwise.
    pub fn estimate(&self, codes: &[u8], stored_norm: Option<f32>) -> f32 {
        debug_assert_eq!(codes.len(), self.m);
        let mut sum = 0.0f32;
        for (sub, &code) in codes.iter().enumerate() {
            sum += self.table[sub * self.k + code as usize];
        }
        match self.metric {
            Metric::Euclidean => sum.sqrt(),
            Metric::Manhattan | Metric::Dot => sum,
            Metric::Cosine | Metric::Angular => {
                similarity_distance(self.metric, sum, self.query_norm, stored_norm.unwrap_or(0.0))
            }
        }
    }
}

/// Truncated SHA-256 over the codebook parameters and centroid bytes.
fn content_hash(dim: usize, m: usize, nbits: u8, centroids: &[f32]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update((dim as u32).to_le_bytes());
    hasher.update((m as u32).to_le_bytes());
    hasher.update([nbits]);
    for &c in centroids {
        hasher.update(c.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Lowercase hex of a 16-byte hash.
pub(crate) fn hex16(hash: &[u8; 16]) -> String {
    let mut s = String::with_capacity(32);
    for b in hash {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Parse a 32-char lowercase hex string back into a 16-byte hash.
pub(crate) fn parse_hex16(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir() -> PathBuf {
        let id = uuid::Uuid::new_v4();
        std::env::temp_dir().join(format!("sediment_pq_{id}"))
    }

    fn clustered_samples(n: usize, dim: usize) -> Vec<Vec<f32>> {
        // Deterministic data with visible cluster structure per subspace.
        (0..n)
            .map(|i| {
                (0..dim)
                    .map(|j| ((i * 31 + j * 17) % 97) as f32 / 97.0 + (i % 4) as f32)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_train_encode_decode_roundtrip_error() {
        let dim = 16;
        let samples = clustered_samples(400, dim);
        let cb = train(&samples, dim, 4, 6, 25).unwrap();
        assert_eq!(cb.m(), 4);
        assert_eq!(cb.k(), 64);

        // Mean squared reconstruction error well below the data variance.
        let mean: Vec<f32> = (0..dim)
            .map(|j| samples.iter().map(|s| s[j]).sum::<f32>() / samples.len() as f32)
            .collect();
        let variance: f32 = samples
            .iter()
            .map(|s| {
                s.iter()
                    .zip(&mean)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
            })
            .sum::<f32>()
            / samples.len() as f32;
        let mse: f32 = samples
            .iter()
            .map(|s| {
                let decoded = cb.decode(&cb.encode(s));
                s.iter()
                    .zip(&decoded)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
            })
            .sum::<f32>()
            / samples.len() as f32;
        assert!(
            mse < 0.5 * variance,
            "reconstruction MSE {mse} not below half the variance {variance}"
        );
    }

    #[test]
    fn test_encode_is_m_bytes() {
        let samples = clustered_samples(300, 8);
        let cb = train(&samples, 8, 2, 4, 25).unwrap();
        assert_eq!(cb.encode(&samples[0]).len(), 2);
    }

    #[test]
    fn test_hash_deterministic_and_content_sensitive() {
        let samples = clustered_samples(300, 8);
        let a = train(&samples, 8, 2, 4, 25).unwrap();
        let b = train(&samples, 8, 2, 4, 25).unwrap();
        assert_eq!(a.hash(), b.hash(), "same corpus must reproduce the same codebook");

        let c = train(&samples, 8, 4, 4, 25).unwrap();
        assert_ne!(a.hash(), c.hash(), "different parameters must change the hash");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tmp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let samples = clustered_samples(300, 8);
        let cb = train(&samples, 8, 2, 4, 25).unwrap();
        let path = cb.save(&dir).unwrap();
        assert_eq!(
            path.file_stem().unwrap().to_str().unwrap(),
            cb.hash_hex()
        );

        let loaded = PqCodebook::load(&path).unwrap();
        assert_eq!(loaded.hash(), cb.hash());
        assert_eq!(loaded.dim(), 8);
        assert_eq!(loaded.encode(&samples[0]), cb.encode(&samples[0]));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_detects_corruption() {
        let dir = tmp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let samples = clustered_samples(300, 8);
        let cb = train(&samples, 8, 2, 4, 25).unwrap();
        let path = cb.save(&dir).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        assert!(matches!(
            PqCodebook::load(&path),
            Err(Error::CorruptSegment { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_adc_estimate_tracks_exact_distance() {
        let dim = 16;
        let samples = clustered_samples(500, dim);
        let cb = train(&samples, dim, 4, 6, 25).unwrap();
        let query = &samples[7];

        for metric in [Metric::Euclidean, Metric::Manhattan, Metric::Dot] {
            let table = cb.distance_table(query, metric);
            for s in samples.iter().take(32) {
                let codes = cb.encode(s);
                let est = table.estimate(&codes, None);
                let exact_on_decoded = metric.distance(query, &cb.decode(&codes));
                assert!(
                    (est - exact_on_decoded).abs() < 1e-2 * (1.0 + exact_on_decoded.abs()),
                    "{metric:?}: ADC estimate {est} vs decoded-exact {exact_on_decoded}"
                );
            }
        }
    }

    #[test]
    fn test_adc_cosine_uses_stored_norm() {
        let dim = 16;
        let samples = clustered_samples(500, dim);
        let cb = train(&samples, dim, 4, 6, 25).unwrap();
        let query = &samples[3];
        let table = cb.distance_table(query, Metric::Cosine);

        let stored = &samples[42];
        let codes = cb.encode(stored);
        let norm = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
        let est = table.estimate(&codes, Some(norm));
        let exact = Metric::Cosine.distance(query, stored);
        assert!(
            (est - exact).abs() < 0.1,
            "cosine ADC estimate {est} too far from exact {exact}"
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let h: [u8; 16] = [0, 1, 0xab, 0xcd, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 0xfe, 0xff];
        assert_eq!(parse_hex16(&hex16(&h)), Some(h));
        assert_eq!(parse_hex16("short"), None);
    }
}
