//! Database handle, transactions, and the raw binary entry points.

use std::sync::Arc;

use tracing::debug;

use crate::arena::{Arena, TapeView};
use crate::docs::Docs;
use crate::error::{Result, StoreError};
use crate::graph::Graph;
use crate::model::{ColKey, CollectionId, DropMode, Key, Options, TxnId, KEY_UNKNOWN};
use crate::strided::{expect_count, Strided};
use crate::substrate::{Memory, ScanRange, Substrate};

/// One logical database over a substrate. The handle is cheap to share;
/// per-call scratch lives in caller-owned [`Arena`]s, one per thread.
pub struct Database {
    pub(crate) substrate: Arc<dyn Substrate>,
}

impl Database {
    /// A database over the reference in-memory substrate.
    pub fn in_memory() -> Self {
        Self::with_substrate(Arc::new(Memory::new()))
    }

    /// A database over any substrate honoring the bridge contract.
    pub fn with_substrate(substrate: Arc<dyn Substrate>) -> Self {
        Self { substrate }
    }

    /// Opens (or creates) a named collection; the empty name is the
    /// reserved main collection.
    pub fn collection(&self, name: &str) -> Result<CollectionId> {
        self.substrate.collection_open(name)
    }

    pub fn collection_drop(&self, col: CollectionId, mode: DropMode) -> Result<()> {
        self.substrate.collection_drop(col, mode)
    }

    pub fn txn_begin(&self) -> Result<Txn<'_>> {
        let id = self.substrate.txn_begin()?;
        debug!(txn = id.0, "db.txn.begin");
        Ok(Txn {
            db: self,
            id,
            done: false,
        })
    }

    /// Document operations over `col`.
    pub fn docs(&self, col: CollectionId) -> Docs<'_> {
        Docs::new(self, col)
    }

    /// Graph operations over `col`.
    pub fn graph(&self, col: CollectionId) -> Graph<'_> {
        Graph::new(self, col)
    }

    /// Raw batched read. One result per `(collection, key)` pair, in caller
    /// order; missing keys yield missing entries.
    pub fn read<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        cols: Strided<'_, CollectionId>,
        keys: Strided<'_, Key>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<TapeView<'a>> {
        let n = keys.len();
        expect_count(&cols, n, "collections count does not match keys count")?;
        arena.keys.clear();
        for i in 0..n {
            arena.keys.push(ColKey::new(*cols.get(i), *keys.get(i)));
        }
        self.substrate
            .read(txn_id(txn), &arena.keys, opts, &mut arena.tape)?;
        Ok(arena.tape.view())
    }

    /// Raw batched write; a `None` payload deletes its key.
    pub fn write(
        &self,
        txn: Option<&Txn<'_>>,
        cols: Strided<'_, CollectionId>,
        keys: Strided<'_, Key>,
        payloads: Strided<'_, Option<&[u8]>>,
        opts: Options,
        arena: &mut Arena,
    ) -> Result<()> {
        let n = keys.len();
        expect_count(&cols, n, "collections count does not match keys count")?;
        expect_count(&payloads, n, "payloads count does not match keys count")?;
        arena.keys.clear();
        for i in 0..n {
            let key = *keys.get(i);
            if key == KEY_UNKNOWN {
                return Err(StoreError::BadArgument("cannot write the reserved sentinel key"));
            }
            arena.keys.push(ColKey::new(*cols.get(i), key));
        }
        let refs: Vec<Option<&[u8]>> = (0..n).map(|i| *payloads.get(i)).collect();
        self.substrate.write(txn_id(txn), &arena.keys, &refs, opts)
    }

    /// Batched ordered scan: ascending keys per `(collection, min, count)`
    /// range.
    pub fn scan<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        cols: Strided<'_, CollectionId>,
        min_keys: Strided<'_, Key>,
        max_counts: Strided<'_, u32>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<ScanView<'a>> {
        let n = min_keys.len();
        expect_count(&cols, n, "collections count does not match ranges count")?;
        expect_count(&max_counts, n, "max counts do not match ranges count")?;
        let ranges: Vec<ScanRange> = (0..n)
            .map(|i| ScanRange {
                col: *cols.get(i),
                min_key: *min_keys.get(i),
                max_count: *max_counts.get(i),
            })
            .collect();
        self.substrate.scan(
            txn_id(txn),
            &ranges,
            opts,
            &mut arena.scan_keys,
            &mut arena.scan_counts,
        )?;
        Ok(ScanView {
            keys: &arena.scan_keys,
            counts: &arena.scan_counts,
        })
    }
}

pub(crate) fn txn_id(txn: Option<&Txn<'_>>) -> Option<TxnId> {
    txn.map(|t| t.id)
}

/// Scan results: found keys back-to-back plus one count per range.
pub struct ScanView<'a> {
    pub keys: &'a [Key],
    pub counts: &'a [u32],
}

impl<'a> ScanView<'a> {
    /// Keys found for the `i`-th range.
    pub fn range_keys(&self, i: usize) -> &'a [Key] {
        let start: usize = self.counts[..i].iter().map(|&c| c as usize).sum();
        &self.keys[start..start + self.counts[i] as usize]
    }
}

/// A transaction over the substrate. Dropping without commit abandons the
/// buffered writes (implicit rollback).
pub struct Txn<'db> {
    db: &'db Database,
    id: TxnId,
    done: bool,
}

impl Txn<'_> {
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// All-or-nothing application of the buffered writes. The handle is
    /// spent whether or not the commit succeeds.
    pub fn commit(self) -> Result<()> {
        self.commit_with(Options::default())
    }

    pub fn commit_with(mut self, opts: Options) -> Result<()> {
        self.done = true;
        debug!(txn = self.id.0, "db.txn.commit");
        self.db.substrate.txn_commit(self.id, opts.flush_writes)
    }

    /// Discards buffered writes; the handle stays usable, as if a fresh
    /// transaction began under the same identity.
    pub fn rollback(&self) -> Result<()> {
        self.db.substrate.txn_rollback(self.id)
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.db.substrate.txn_free(self.id);
        }
    }
}
