//! Reference substrate: ordered maps behind one lock.
//!
//! Transactions buffer their writes and apply them on commit under the write
//! lock. Conflict detection is first-committer-wins over tracked reads: every
//! committed write bumps a per-key stamp, and a commit fails if any location
//! read with `track_reads` has a newer stamp than the transaction saw.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::arena::Tape;
use crate::error::{Result, StoreError};
use crate::model::{ColKey, CollectionId, DropMode, Key, Options, TxnId, COLLECTION_MAIN, KEY_UNKNOWN};
use crate::substrate::{ScanRange, Substrate};

#[derive(Default)]
struct TxnState {
    /// Buffered writes; `None` is a pending delete.
    writes: BTreeMap<ColKey, Option<Vec<u8>>>,
    /// Tracked reads and the stamp each one observed.
    reads: Vec<(ColKey, u64)>,
}

#[derive(Default)]
struct State {
    names: HashMap<String, CollectionId>,
    /// Collection slot; `None` marks a dropped handle.
    cols: Vec<Option<BTreeMap<Key, Vec<u8>>>>,
    /// Monotonic stamp of the last committed write per location.
    stamps: HashMap<ColKey, u64>,
    next_stamp: u64,
    txns: HashMap<u64, TxnState>,
    next_txn: u64,
}

impl State {
    fn col(&self, id: CollectionId) -> Result<&BTreeMap<Key, Vec<u8>>> {
        self.cols
            .get(id.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(StoreError::ClosedHandle("collection was dropped"))
    }

    fn col_mut(&mut self, id: CollectionId) -> Result<&mut BTreeMap<Key, Vec<u8>>> {
        self.cols
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(StoreError::ClosedHandle("collection was dropped"))
    }

    fn txn(&mut self, id: TxnId) -> Result<&mut TxnState> {
        self.txns
            .get_mut(&id.0)
            .ok_or(StoreError::ClosedHandle("transaction was committed or never began"))
    }

    fn stamp(&self, loc: &ColKey) -> u64 {
        self.stamps.get(loc).copied().unwrap_or(0)
    }

    fn apply(&mut self, loc: ColKey, payload: Option<Vec<u8>>) -> Result<()> {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        let col = self.col_mut(loc.col)?;
        match payload {
            Some(bytes) => {
                col.insert(loc.key, bytes);
            }
            None => {
                col.remove(&loc.key);
            }
        }
        self.stamps.insert(loc, stamp);
        Ok(())
    }
}

pub struct Memory {
    state: RwLock<State>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        let mut state = State::default();
        state.cols.push(Some(BTreeMap::new()));
        Self {
            state: RwLock::new(state),
        }
    }

    fn lookup<'a>(state: &'a State, txn: Option<TxnId>, loc: &ColKey) -> Result<Option<&'a [u8]>> {
        if let Some(txn) = txn {
            let pending = state
                .txns
                .get(&txn.0)
                .ok_or(StoreError::ClosedHandle("transaction was committed or never began"))?;
            if let Some(write) = pending.writes.get(loc) {
                // Validate the collection handle even when the overlay hits.
                state.col(loc.col)?;
                return Ok(write.as_deref());
            }
        }
        Ok(state.col(loc.col)?.get(&loc.key).map(Vec::as_slice))
    }

    fn read_into(
        state: &State,
        txn: Option<TxnId>,
        locs: &[ColKey],
        opts: Options,
        out: &mut Tape,
    ) -> Result<Vec<(ColKey, u64)>> {
        out.clear();
        out.reserve(locs.len(), 0)?;
        let mut seen = Vec::new();
        for loc in locs {
            let found = Self::lookup(state, txn, loc)?;
            if opts.only_lengths {
                out.push_length(found.map(|v| v.len() as u32));
            } else {
                out.push(found)?;
            }
            if opts.track_reads && txn.is_some() {
                seen.push((*loc, state.stamp(loc)));
            }
        }
        Ok(seen)
    }

    fn scan_col(
        state: &State,
        txn: Option<TxnId>,
        range: &ScanRange,
        out_keys: &mut Vec<Key>,
    ) -> Result<u32> {
        let col = state.col(range.col)?;
        let overlay = txn.and_then(|t| state.txns.get(&t.0));
        let mut base = col.range(range.min_key..KEY_UNKNOWN).map(|(k, _)| *k).peekable();
        let mut added = overlay
            .into_iter()
            .flat_map(|t| t.writes.range(ColKey::new(range.col, range.min_key)..))
            .take_while(|(loc, _)| loc.col == range.col && loc.key < KEY_UNKNOWN)
            .peekable();
        let mut count = 0u32;
        while count < range.max_count {
            let base_next = base.peek().copied();
            let overlay_next = added.peek().map(|(loc, payload)| (loc.key, payload.is_some()));
            let next = match (base_next, overlay_next) {
                (Some(b), Some((key, keep))) => {
                    if key <= b {
                        if key == b {
                            base.next();
                        }
                        added.next();
                        if !keep {
                            continue;
                        }
                        key
                    } else {
                        base.next();
                        b
                    }
                }
                (Some(b), None) => {
                    base.next();
                    b
                }
                (None, Some((key, keep))) => {
                    added.next();
                    if !keep {
                        continue;
                    }
                    key
                }
                (None, None) => break,
            };
            out_keys.push(next);
            count += 1;
        }
        Ok(count)
    }
}

impl Substrate for Memory {
    fn collection_open(&self, name: &str) -> Result<CollectionId> {
        if name.is_empty() {
            return Ok(COLLECTION_MAIN);
        }
        let mut state = self.state.write();
        if let Some(id) = state.names.get(name) {
            return Ok(*id);
        }
        let id = CollectionId(state.cols.len() as u32);
        state.cols.push(Some(BTreeMap::new()));
        state.names.insert(name.to_owned(), id);
        debug!(name, id = id.0, "substrate.collection.open");
        Ok(id)
    }

    fn collection_drop(&self, col: CollectionId, mode: DropMode) -> Result<()> {
        let mut state = self.state.write();
        match mode {
            DropMode::ClearValues => {
                for value in state.col_mut(col)?.values_mut() {
                    value.clear();
                }
            }
            DropMode::ClearKeys => {
                state.col_mut(col)?.clear();
            }
            DropMode::DropCollection => {
                if col == COLLECTION_MAIN {
                    return Err(StoreError::BadArgument("the main collection cannot be dropped"));
                }
                state.col(col)?;
                state.cols[col.0 as usize] = None;
                state.names.retain(|_, id| *id != col);
            }
        }
        debug!(col = col.0, ?mode, "substrate.collection.drop");
        Ok(())
    }

    fn txn_begin(&self) -> Result<TxnId> {
        let mut state = self.state.write();
        state.next_txn += 1;
        let id = state.next_txn;
        state.txns.insert(id, TxnState::default());
        trace!(txn = id, "substrate.txn.begin");
        Ok(TxnId(id))
    }

    fn txn_commit(&self, txn: TxnId, flush: bool) -> Result<()> {
        let mut state = self.state.write();
        let pending = state
            .txns
            .remove(&txn.0)
            .ok_or(StoreError::ClosedHandle("transaction was committed or never began"))?;
        for (loc, seen) in &pending.reads {
            if state.stamp(loc) != *seen {
                trace!(txn = txn.0, key = loc.key, "substrate.txn.conflict");
                return Err(StoreError::Substrate(
                    "commit conflict: a tracked read changed underneath the transaction".into(),
                ));
            }
        }
        // Validate every handle before touching data so a failure applies
        // none of the batch.
        for loc in pending.writes.keys() {
            state.col(loc.col)?;
        }
        let writes = pending.writes.len();
        for (loc, payload) in pending.writes {
            state.apply(loc, payload)?;
        }
        trace!(txn = txn.0, writes, flush, "substrate.txn.commit");
        Ok(())
    }

    fn txn_rollback(&self, txn: TxnId) -> Result<()> {
        let mut state = self.state.write();
        let pending = state.txn(txn)?;
        pending.writes.clear();
        pending.reads.clear();
        trace!(txn = txn.0, "substrate.txn.rollback");
        Ok(())
    }

    fn txn_free(&self, txn: TxnId) {
        let mut state = self.state.write();
        if state.txns.remove(&txn.0).is_some() {
            trace!(txn = txn.0, "substrate.txn.free");
        }
    }

    fn read(
        &self,
        txn: Option<TxnId>,
        locs: &[ColKey],
        opts: Options,
        out: &mut Tape,
    ) -> Result<()> {
        match txn.filter(|_| opts.track_reads) {
            Some(tracked) => {
                let mut state = self.state.write();
                let seen = Self::read_into(&*state, txn, locs, opts, out)?;
                state.txn(tracked)?.reads.extend(seen);
                Ok(())
            }
            None => {
                let state = self.state.read();
                Self::read_into(&state, txn, locs, opts, out).map(|_| ())
            }
        }
    }

    fn write(
        &self,
        txn: Option<TxnId>,
        locs: &[ColKey],
        payloads: &[Option<&[u8]>],
        opts: Options,
    ) -> Result<()> {
        if locs.len() != payloads.len() {
            return Err(StoreError::BadArgument("write locations and payloads differ in count"));
        }
        let mut state = self.state.write();
        match txn {
            Some(txn) => {
                // Handle validity is checked at commit; buffering never fails.
                let pending = state.txn(txn)?;
                for (loc, payload) in locs.iter().zip(payloads) {
                    pending.writes.insert(*loc, payload.map(|p| p.to_vec()));
                }
            }
            None => {
                for loc in locs {
                    state.col(loc.col)?;
                }
                for (loc, payload) in locs.iter().zip(payloads) {
                    state.apply(*loc, payload.map(|p| p.to_vec()))?;
                }
            }
        }
        if opts.flush_writes {
            trace!(count = locs.len(), "substrate.write.flush");
        }
        Ok(())
    }

    fn scan(
        &self,
        txn: Option<TxnId>,
        ranges: &[ScanRange],
        _opts: Options,
        out_keys: &mut Vec<Key>,
        out_counts: &mut Vec<u32>,
    ) -> Result<()> {
        let state = self.state.read();
        out_keys.clear();
        out_counts.clear();
        for range in ranges {
            let count = Self::scan_col(&state, txn, range, out_keys)?;
            out_counts.push(count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strided::Strided;

    fn loc(key: Key) -> ColKey {
        ColKey::new(COLLECTION_MAIN, key)
    }

    fn read_one(store: &Memory, txn: Option<TxnId>, key: Key) -> Option<Vec<u8>> {
        let mut tape = Tape::default();
        store
            .read(txn, &[loc(key)], Options::default(), &mut tape)
            .expect("read");
        tape.get(0).map(<[u8]>::to_vec)
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let store = Memory::new();
        let txn = store.txn_begin().expect("begin");
        store
            .write(Some(txn), &[loc(1)], &[Some(b"v")], Options::default())
            .expect("buffered write");
        assert_eq!(read_one(&store, None, 1), None);
        assert_eq!(read_one(&store, Some(txn), 1), Some(b"v".to_vec()));
        store.txn_commit(txn, false).expect("commit");
        assert_eq!(read_one(&store, None, 1), Some(b"v".to_vec()));
    }

    #[test]
    fn tracked_read_conflict_fails_second_committer() {
        let store = Memory::new();
        store
            .write(None, &[loc(1)], &[Some(b"a")], Options::default())
            .expect("seed");
        let txn = store.txn_begin().expect("begin");
        let mut tape = Tape::default();
        let opts = Options {
            track_reads: true,
            ..Options::default()
        };
        store.read(Some(txn), &[loc(1)], opts, &mut tape).expect("tracked read");
        store
            .write(None, &[loc(1)], &[Some(b"b")], Options::default())
            .expect("interfering write");
        store
            .write(Some(txn), &[loc(1)], &[Some(b"c")], Options::default())
            .expect("buffered write");
        assert!(matches!(
            store.txn_commit(txn, false),
            Err(StoreError::Substrate(_))
        ));
    }

    #[test]
    fn rollback_keeps_the_handle_usable() {
        let store = Memory::new();
        let txn = store.txn_begin().expect("begin");
        store
            .write(Some(txn), &[loc(5)], &[Some(b"x")], Options::default())
            .expect("buffered write");
        store.txn_rollback(txn).expect("rollback");
        assert_eq!(read_one(&store, Some(txn), 5), None);
        store
            .write(Some(txn), &[loc(5)], &[Some(b"y")], Options::default())
            .expect("write after rollback");
        store.txn_commit(txn, false).expect("commit");
        assert_eq!(read_one(&store, None, 5), Some(b"y".to_vec()));
    }

    #[test]
    fn scan_merges_transaction_overlay() {
        let store = Memory::new();
        let locs = [loc(1), loc(3), loc(5)];
        store
            .write(None, &locs, &[Some(b"a"), Some(b"b"), Some(b"c")], Options::default())
            .expect("seed");
        let txn = store.txn_begin().expect("begin");
        store
            .write(Some(txn), &[loc(2), loc(3)], &[Some(b"n"), None], Options::default())
            .expect("overlay");
        let mut keys = Vec::new();
        let mut counts = Vec::new();
        store
            .scan(
                Some(txn),
                &[ScanRange {
                    col: COLLECTION_MAIN,
                    min_key: i64::MIN,
                    max_count: 100,
                }],
                Options::default(),
                &mut keys,
                &mut counts,
            )
            .expect("scan");
        assert_eq!(keys, vec![1, 2, 5]);
        assert_eq!(counts, vec![3]);
    }

    #[test]
    fn clear_keys_keeps_the_handle_alive() {
        let store = Memory::new();
        let col = store.collection_open("side").expect("open");
        store
            .write(None, &[ColKey::new(col, 9)], &[Some(b"v")], Options::default())
            .expect("write");
        store.collection_drop(col, DropMode::ClearKeys).expect("clear");
        let mut tape = Tape::default();
        store
            .read(None, &[ColKey::new(col, 9)], Options::default(), &mut tape)
            .expect("read after clear");
        assert_eq!(tape.get(0), None);
        store
            .write(None, &[ColKey::new(col, 9)], &[Some(b"w")], Options::default())
            .expect("write after clear");
    }

    #[test]
    fn dropped_collection_is_a_closed_handle() {
        let store = Memory::new();
        let col = store.collection_open("gone").expect("open");
        store.collection_drop(col, DropMode::DropCollection).expect("drop");
        let mut tape = Tape::default();
        assert!(matches!(
            store.read(None, &[ColKey::new(col, 1)], Options::default(), &mut tape),
            Err(StoreError::ClosedHandle(_))
        ));
    }

    #[test]
    fn broadcast_view_reads_like_a_dense_array() {
        let key = 77i64;
        let view = Strided::broadcast(&key, 3);
        let locs: Vec<ColKey> = view.iter().map(|k| loc(*k)).collect();
        assert_eq!(locs, vec![loc(77), loc(77), loc(77)]);
    }
}
