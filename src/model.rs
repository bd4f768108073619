use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-assigned record key. The full signed range is usable except for
/// [`KEY_UNKNOWN`].
pub type Key = i64;

/// Reserved sentinel key. Doubles as the exclusive upper bound for scans, so
/// it can never address a stored record.
pub const KEY_UNKNOWN: Key = i64::MAX;

/// Length sentinel meaning "no such value". A present-but-empty value has
/// length zero, which is distinct.
pub const LEN_MISSING: u32 = u32::MAX;

/// Degree sentinel meaning "no such vertex".
pub const DEGREE_MISSING: u32 = u32::MAX;

/// Edge identifier meaning "unspecified". Sorts before every real id, so
/// unidentified edges cluster first among parallel edges.
pub const EDGE_UNSPECIFIED: Key = i64::MIN;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CollectionId(pub u32);

/// The reserved default collection, always open.
pub const COLLECTION_MAIN: CollectionId = CollectionId(0);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fully qualified record location. Orders by collection, then key, which
/// is the order batched reads are issued in.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ColKey {
    pub col: CollectionId,
    pub key: Key,
}

impl ColKey {
    pub fn new(col: CollectionId, key: Key) -> Self {
        Self { col, key }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TxnId(pub u64);

/// A directed edge. `id` may be [`EDGE_UNSPECIFIED`]; distinct ids between
/// the same endpoints form a multigraph.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub source: Key,
    pub target: Key,
    pub id: Key,
}

impl Edge {
    pub fn new(source: Key, target: Key, id: Key) -> Self {
        Self { source, target, id }
    }
}

/// Which side of its edges a vertex is pivoting on.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum Role {
    Source,
    Target,
    #[default]
    Any,
}

impl Role {
    pub(crate) fn selects_source(self) -> bool {
        matches!(self, Role::Source | Role::Any)
    }

    pub(crate) fn selects_target(self) -> bool {
        matches!(self, Role::Target | Role::Any)
    }
}

/// Option flags recognized by every batched entry point.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Options {
    /// Record this read in the transaction's read set; commit fails if any
    /// tracked location changed underneath it.
    pub track_reads: bool,
    /// Force durability before the call returns.
    pub flush_writes: bool,
    /// Compute lengths only, skip materializing values.
    pub only_lengths: bool,
}

impl Options {
    pub fn lengths_only() -> Self {
        Self {
            only_lengths: true,
            ..Self::default()
        }
    }
}

/// What `collection_drop` leaves behind.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DropMode {
    /// Keep every key, empty every value.
    ClearValues,
    /// Remove every key; the logical collection is re-created so later
    /// writes against the same handle succeed.
    ClearKeys,
    /// Remove the collection and retire its handle.
    DropCollection,
}
