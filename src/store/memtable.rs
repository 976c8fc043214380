//! In-memory write-absorbing table.
//!
//! The memtable maps identifiers to their latest record and iterates in id
//! order, which makes sealing deterministic. It holds both live records and
//! tombstones; visibility is decided by sequence number at read time.

use std::collections::BTreeMap;

/// The latest in-memory record for one identifier.
#[derive(Debug, Clone)]
pub struct MemRecord {
    /// Engine-assigned, strictly increasing sequence number.
    pub seq: u64,
    /// True when this record deletes the identifier.
    pub tombstone: bool,
    /// The vector payload; `None` for tombstones.
    pub vector: Option<Vec<f32>>,
}

/// Ordered mapping from identifier to its latest record.
#[derive(Debug, Default)]
pub struct Memtable {
    entries: BTreeMap<Box<[u8]>, MemRecord>,
    payload_bytes: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a record, replacing any earlier record for the same id.
    pub fn insert(&mut self, id: &[u8], record: MemRecord) {
        let added = Self::cost(id, &record);
        if let Some(old) = self.entries.insert(id.into(), record) {
            self.payload_bytes -= Self::cost(id, &old);
        }
        self.payload_bytes += added;
    }

    pub fn get(&self, id: &[u8]) -> Option<&MemRecord> {
        self.entries.get(id)
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes held (ids plus vector payloads).
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Iterate entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &MemRecord)> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.payload_bytes = 0;
    }

    /// Whether either seal threshold has been crossed.
    pub fn exceeds(&self, max_records: usize, max_bytes: usize) -> bool {
        self.entries.len() >= max_records || self.payload_bytes >= max_bytes
    }

    fn cost(id: &[u8], record: &MemRecord) -> usize {
        id.len() + record.vector.as_ref().map_or(0, |v| v.len() * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(seq: u64, v: &[f32]) -> MemRecord {
        MemRecord {
            seq,
            tombstone: false,
            vector: Some(v.to_vec()),
        }
    }

    fn tomb(seq: u64) -> MemRecord {
        MemRecord {
            seq,
            tombstone: true,
            vector: None,
        }
    }

    #[test]
    fn test_insert_get_overwrite() {
        let mut mt = Memtable::new();
        mt.insert(b"a", live(1, &[1.0, 2.0]));
        assert_eq!(mt.get(b"a").unwrap().seq, 1);

        mt.insert(b"a", live(2, &[3.0, 4.0]));
        assert_eq!(mt.len(), 1);
        assert_eq!(mt.get(b"a").unwrap().vector.as_deref(), Some(&[3.0, 4.0][..]));
    }

    #[test]
    fn test_iteration_is_id_ordered() {
        let mut mt = Memtable::new();
        mt.insert(b"zebra", live(1, &[0.0]));
        mt.insert(b"apple", live(2, &[0.0]));
        mt.insert(b"mango", tomb(3));
        let ids: Vec<&[u8]> = mt.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![&b"apple"[..], &b"mango"[..], &b"zebra"[..]]);
    }

    #[test]
    fn test_payload_accounting_on_overwrite() {
        let mut mt = Memtable::new();
        mt.insert(b"a", live(1, &[1.0, 2.0, 3.0, 4.0]));
        let full = mt.payload_bytes();
        assert_eq!(full, 1 + 16);

        // Tombstone replaces the vector; accounted bytes shrink.
        mt.insert(b"a", tomb(2));
        assert_eq!(mt.payload_bytes(), 1);

        mt.clear();
        assert_eq!(mt.payload_bytes(), 0);
        assert!(mt.is_empty());
    }

    #[test]
    fn test_threshold_checks() {
        let mut mt = Memtable::new();
        assert!(!mt.exceeds(2, 1024));
        mt.insert(b"a", live(1, &[0.0]));
        mt.insert(b"b", live(2, &[0.0]));
        assert!(mt.exceeds(2, 1024), "record threshold");
        assert!(mt.exceeds(100, 8), "byte threshold");
        assert!(!mt.exceeds(100, 1024));
    }
}
