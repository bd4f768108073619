//! Packed adjacency records.
//!
//! Each vertex stores one record: a flat sequence of fixed-width entries
//! `(neighbor: i64 LE, edge: i64 LE, role: u8, 7 bytes padding)` kept sorted
//! by `(neighbor, edge, role)`. The ordering gives `O(log n)` membership
//! checks and binary-range extraction of all edges toward one target.

use crate::error::{Result, StoreError};
use crate::model::Key;

pub(crate) const ENTRY_LEN: usize = 24;

/// The role the record's own vertex plays in one of its edges.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub(crate) enum EntryRole {
    SourceOf = 0,
    TargetOf = 1,
}

impl EntryRole {
    pub(crate) fn flip(self) -> Self {
        match self {
            EntryRole::SourceOf => EntryRole::TargetOf,
            EntryRole::TargetOf => EntryRole::SourceOf,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(EntryRole::SourceOf),
            1 => Ok(EntryRole::TargetOf),
            _ => Err(StoreError::Internal("adjacency entry carries an unknown role")),
        }
    }
}

/// One neighbor entry. Derived ordering is `(neighbor, edge, role)`, the
/// record's storage order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub(crate) struct AdjEntry {
    pub neighbor: Key,
    pub edge: Key,
    pub role: EntryRole,
}

pub(crate) fn decode_record(bytes: &[u8]) -> Result<Vec<AdjEntry>> {
    if bytes.len() % ENTRY_LEN != 0 {
        return Err(StoreError::Internal(
            "adjacency record length is not a multiple of the entry size",
        ));
    }
    let mut entries = Vec::with_capacity(bytes.len() / ENTRY_LEN);
    for chunk in bytes.chunks_exact(ENTRY_LEN) {
        let mut word = [0u8; 8];
        word.copy_from_slice(&chunk[0..8]);
        let neighbor = i64::from_le_bytes(word);
        word.copy_from_slice(&chunk[8..16]);
        let edge = i64::from_le_bytes(word);
        let role = EntryRole::from_byte(chunk[16])?;
        entries.push(AdjEntry { neighbor, edge, role });
    }
    Ok(entries)
}

pub(crate) fn encode_record(entries: &[AdjEntry], out: &mut Vec<u8>) {
    out.reserve(entries.len() * ENTRY_LEN);
    for entry in entries {
        out.extend_from_slice(&entry.neighbor.to_le_bytes());
        out.extend_from_slice(&entry.edge.to_le_bytes());
        out.push(entry.role as u8);
        out.extend_from_slice(&[0u8; 7]);
    }
}

/// Sorted insert; an entry already present is a no-op. Returns whether the
/// record changed.
pub(crate) fn insert_entry(entries: &mut Vec<AdjEntry>, entry: AdjEntry) -> bool {
    match entries.binary_search(&entry) {
        Ok(_) => false,
        Err(pos) => {
            entries.insert(pos, entry);
            true
        }
    }
}

/// Sorted removal; an absent entry is a no-op. Returns whether the record
/// changed.
pub(crate) fn remove_entry(entries: &mut Vec<AdjEntry>, entry: &AdjEntry) -> bool {
    match entries.binary_search(entry) {
        Ok(pos) => {
            entries.remove(pos);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(neighbor: Key, edge: Key, role: EntryRole) -> AdjEntry {
        AdjEntry { neighbor, edge, role }
    }

    #[test]
    fn records_round_trip_and_stay_sorted() {
        let mut entries = Vec::new();
        assert!(insert_entry(&mut entries, entry(5, 2, EntryRole::SourceOf)));
        assert!(insert_entry(&mut entries, entry(1, 9, EntryRole::TargetOf)));
        assert!(insert_entry(&mut entries, entry(5, 1, EntryRole::SourceOf)));
        assert!(!insert_entry(&mut entries, entry(5, 2, EntryRole::SourceOf)));

        let neighbors: Vec<(Key, Key)> = entries.iter().map(|e| (e.neighbor, e.edge)).collect();
        assert_eq!(neighbors, vec![(1, 9), (5, 1), (5, 2)]);

        let mut bytes = Vec::new();
        encode_record(&entries, &mut bytes);
        assert_eq!(bytes.len(), 3 * ENTRY_LEN);
        assert_eq!(decode_record(&bytes).expect("decode"), entries);
    }

    #[test]
    fn removal_is_exact_and_idempotent() {
        let mut entries = Vec::new();
        insert_entry(&mut entries, entry(3, 7, EntryRole::SourceOf));
        assert!(!remove_entry(&mut entries, &entry(3, 8, EntryRole::SourceOf)));
        assert!(remove_entry(&mut entries, &entry(3, 7, EntryRole::SourceOf)));
        assert!(!remove_entry(&mut entries, &entry(3, 7, EntryRole::SourceOf)));
        assert!(entries.is_empty());
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut bytes = Vec::new();
        encode_record(&[entry(1, 1, EntryRole::SourceOf)], &mut bytes);
        bytes.pop();
        assert!(decode_record(&bytes).is_err());
    }

    #[test]
    fn self_loop_entries_differ_by_role() {
        let mut entries = Vec::new();
        assert!(insert_entry(&mut entries, entry(4, 1, EntryRole::SourceOf)));
        assert!(insert_entry(&mut entries, entry(4, 1, EntryRole::TargetOf)));
        assert_eq!(entries.len(), 2);
    }
}
