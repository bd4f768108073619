//! Caller-owned scratch memory.
//!
//! Every buffer an entry point returns is a view into an [`Arena`], valid
//! until the next call on that arena. An arena is single-owner: one thread,
//! one arena, even against the same collection. Buffers are reused across
//! calls, so a hot loop settles into zero allocation.

use crate::docs::gather::GatherBuf;
use crate::error::{Result, StoreError};
use crate::model::{ColKey, Edge, Key, LEN_MISSING};

/// A packed sequence of variable-length values: one contiguous byte buffer
/// plus per-entry offsets and lengths. `LEN_MISSING` marks absent entries.
#[derive(Default, Debug)]
pub struct Tape {
    pub(crate) bytes: Vec<u8>,
    pub(crate) offsets: Vec<u32>,
    pub(crate) lengths: Vec<u32>,
}

impl Tape {
    pub(crate) fn clear(&mut self) {
        self.bytes.clear();
        self.offsets.clear();
        self.lengths.clear();
    }

    pub(crate) fn reserve(&mut self, entries: usize, bytes: usize) -> Result<()> {
        self.offsets
            .try_reserve(entries)
            .and_then(|_| self.lengths.try_reserve(entries))
            .and_then(|_| self.bytes.try_reserve(bytes))
            .map_err(|_| StoreError::OutOfMemory)
    }

    /// Appends one entry; `None` records absence.
    pub(crate) fn push(&mut self, value: Option<&[u8]>) -> Result<()> {
        match value {
            Some(v) => {
                let offset = self.mark()?;
                if v.len() >= LEN_MISSING as usize {
                    return Err(StoreError::BadArgument("value too large for tape"));
                }
                self.bytes.extend_from_slice(v);
                self.offsets.push(offset);
                self.lengths.push(v.len() as u32);
            }
            None => self.push_missing(),
        }
        Ok(())
    }

    pub(crate) fn push_missing(&mut self) {
        self.offsets.push(self.bytes.len() as u32);
        self.lengths.push(LEN_MISSING);
    }

    /// Records a length with no backing bytes, for `only_lengths` reads.
    pub(crate) fn push_length(&mut self, len: Option<u32>) {
        self.offsets.push(0);
        self.lengths.push(len.unwrap_or(LEN_MISSING));
    }

    /// Start of an entry streamed directly into `bytes`; pair with
    /// [`Tape::commit_entry`].
    pub(crate) fn mark(&mut self) -> Result<u32> {
        u32::try_from(self.bytes.len())
            .map_err(|_| StoreError::BadArgument("tape exceeds addressable size"))
    }

    pub(crate) fn commit_entry(&mut self, start: u32) -> Result<()> {
        let len = self.bytes.len() - start as usize;
        if len >= LEN_MISSING as usize {
            return Err(StoreError::BadArgument("value too large for tape"));
        }
        self.offsets.push(start);
        self.lengths.push(len as u32);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.lengths.len()
    }

    pub(crate) fn get(&self, i: usize) -> Option<&[u8]> {
        let len = self.lengths[i];
        if len == LEN_MISSING {
            return None;
        }
        let off = self.offsets[i] as usize;
        Some(&self.bytes[off..off + len as usize])
    }

    pub(crate) fn length(&self, i: usize) -> Option<u32> {
        let len = self.lengths[i];
        (len != LEN_MISSING).then_some(len)
    }

    pub(crate) fn view(&self) -> TapeView<'_> {
        TapeView { tape: self }
    }
}

/// Borrowed read-only view of a [`Tape`], handed back to callers.
#[derive(Copy, Clone, Debug)]
pub struct TapeView<'a> {
    tape: &'a Tape,
}

impl<'a> TapeView<'a> {
    pub fn len(&self) -> usize {
        self.tape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tape.len() == 0
    }

    /// Value at index `i`, or `None` when the entry is missing. For
    /// `only_lengths` results use [`TapeView::length`]; values were never
    /// materialized.
    pub fn get(&self, i: usize) -> Option<&'a [u8]> {
        self.tape.get(i)
    }

    /// Length at index `i`, or `None` when the entry is missing.
    pub fn length(&self, i: usize) -> Option<u32> {
        self.tape.length(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&'a [u8]>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// Per-call scratch region. Create one per thread and pass it to every
/// entry point; results borrow from it until the next call.
#[derive(Default)]
pub struct Arena {
    /// Substrate read results.
    pub(crate) tape: Tape,
    /// Engine outputs: serialized documents, gist paths.
    pub(crate) out: Tape,
    /// Sorted/deduplicated read locations.
    pub(crate) keys: Vec<ColKey>,
    /// Scan results.
    pub(crate) scan_keys: Vec<Key>,
    pub(crate) scan_counts: Vec<u32>,
    /// Graph results.
    pub(crate) degrees: Vec<u32>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) flags: Vec<bool>,
    pub(crate) ids: Vec<Key>,
    /// Columnar gather output.
    pub(crate) gather: GatherBuf,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tape_distinguishes_missing_from_empty() {
        let mut tape = Tape::default();
        tape.push(Some(b"abc")).expect("push value");
        tape.push(Some(b"")).expect("push empty");
        tape.push(None).expect("push missing");
        assert_eq!(tape.get(0), Some(&b"abc"[..]));
        assert_eq!(tape.get(1), Some(&b""[..]));
        assert_eq!(tape.get(2), None);
        assert_eq!(tape.length(1), Some(0));
        assert_eq!(tape.length(2), None);
    }

    #[test]
    fn streamed_entries_commit_contiguously() {
        let mut tape = Tape::default();
        let start = tape.mark().expect("mark");
        tape.bytes.extend_from_slice(b"hello");
        tape.commit_entry(start).expect("commit");
        let start = tape.mark().expect("mark");
        tape.bytes.extend_from_slice(b"world");
        tape.commit_entry(start).expect("commit");
        assert_eq!(tape.get(0), Some(&b"hello"[..]));
        assert_eq!(tape.get(1), Some(&b"world"[..]));
        assert_eq!(&tape.bytes, b"helloworld");
    }
}
