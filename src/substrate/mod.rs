//! The batched bridge to the underlying ordered KV store.
//!
//! The engines above this trait never touch storage directly: everything
//! funnels through batched, structure-of-arrays shaped calls. Any ordered
//! store that can satisfy this contract plugs in underneath; [`Memory`] is
//! the reference implementation.

mod memory;

pub use memory::Memory;

use crate::arena::Tape;
use crate::error::Result;
use crate::model::{ColKey, CollectionId, DropMode, Key, Options, TxnId};

/// One scan request: ascending keys of `col` starting at `min_key`, at most
/// `max_count` of them.
#[derive(Copy, Clone, Debug)]
pub struct ScanRange {
    pub col: CollectionId,
    pub min_key: Key,
    pub max_count: u32,
}

/// The contract the core consumes from the ordered KV substrate.
///
/// Ordering guarantee: reads inside a transaction observe all prior writes
/// of that transaction. Isolation across concurrent transactions is whatever
/// the implementation provides; the core does not strengthen it.
pub trait Substrate: Send + Sync {
    /// Opens (or creates) a named collection. The empty name is the
    /// reserved main collection.
    fn collection_open(&self, name: &str) -> Result<CollectionId>;

    fn collection_drop(&self, col: CollectionId, mode: DropMode) -> Result<()>;

    fn txn_begin(&self) -> Result<TxnId>;

    /// All-or-nothing application of the transaction's buffered writes.
    fn txn_commit(&self, txn: TxnId, flush: bool) -> Result<()>;

    /// Discards buffered state but keeps the handle usable, i.e. rollback
    /// begins a fresh transaction under the same identity.
    fn txn_rollback(&self, txn: TxnId) -> Result<()>;

    /// Releases the handle without applying anything. Unknown handles are
    /// ignored, so dropping after commit is harmless.
    fn txn_free(&self, txn: TxnId);

    /// Batched point lookup. One tape entry per location, in caller order;
    /// absent keys yield missing entries. With `opts.only_lengths` the tape
    /// carries lengths only.
    fn read(&self, txn: Option<TxnId>, locs: &[ColKey], opts: Options, out: &mut Tape)
        -> Result<()>;

    /// Batched write. `None` payload deletes the key. The batch is applied
    /// atomically: either every location is written or none is.
    fn write(
        &self,
        txn: Option<TxnId>,
        locs: &[ColKey],
        payloads: &[Option<&[u8]>],
        opts: Options,
    ) -> Result<()>;

    /// Batched ordered scan. Replaces the contents of `out_keys` with the
    /// found keys back-to-back and of `out_counts` with one count per range.
    fn scan(
        &self,
        txn: Option<TxnId>,
        ranges: &[ScanRange],
        opts: Options,
        out_keys: &mut Vec<Key>,
        out_counts: &mut Vec<u32>,
    ) -> Result<()>;
}
