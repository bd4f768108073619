//! The document engine: path-addressed read/modify/write over stored
//! canonical trees, field enumeration, and typed columnar extraction.

pub mod codec;
pub mod gather;
pub mod value;

use std::collections::HashSet;

use tracing::trace;

use crate::arena::{Arena, Tape, TapeView};
use crate::db::{txn_id, Database, Txn};
use crate::docs::codec::{dump_any, parse_any, DocFormat};
use crate::docs::value::{apply_patch, merge_patch, Doc, FieldPath};
use crate::error::{Result, StoreError};
use crate::model::{ColKey, CollectionId, Key, Options, KEY_UNKNOWN};
use crate::strided::{expect_count, Strided};

/// Document operations over one collection. Obtained from
/// [`Database::docs`]; every method is a batched entry point.
pub struct Docs<'db> {
    db: &'db Database,
    col: CollectionId,
}

impl<'db> Docs<'db> {
    pub(crate) fn new(db: &'db Database, col: CollectionId) -> Self {
        Self { db, col }
    }

    /// For each `(key, field)` pair: fetch the stored tree, descend to the
    /// field (the empty field selects the whole document), re-serialize in
    /// `format`. Missing keys and missing fields both yield missing entries.
    /// Textual output is NUL-terminated.
    pub fn read<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        keys: Strided<'_, Key>,
        fields: Option<Strided<'_, &str>>,
        format: DocFormat,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<TapeView<'a>> {
        let n = keys.len();
        if let Some(f) = &fields {
            expect_count(f, n, "fields count does not match keys count")?;
        }
        let has_fields = selects_fields(&fields);

        // Whole documents in the at-rest format go straight to the KV layer.
        if !has_fields && format == DocFormat::CanonicalCbor {
            arena.keys.clear();
            arena
                .keys
                .extend(keys.iter().map(|k| ColKey::new(self.col, *k)));
            self.db
                .substrate
                .read(txn_id(txn), &arena.keys, opts, &mut arena.tape)?;
            return Ok(arena.tape.view());
        }

        let read_opts = Options {
            only_lengths: false,
            ..opts
        };
        let scattered = self.batched_doc_read(txn, &keys, read_opts, arena)?;
        let parsed = parse_stored(&arena.tape)?;

        arena.out.clear();
        for i in 0..n {
            let key = *keys.get(i);
            let field = fields.as_ref().map_or("", |f| *f.get(i));
            let path = FieldPath::parse(field)?;
            let idx = locate(&arena.keys, scattered, self.col, key, i)?;
            let Some(doc) = &parsed[idx] else {
                arena.out.push_missing();
                continue;
            };
            let Some(node) = doc.get_path(&path) else {
                arena.out.push_missing();
                continue;
            };
            let start = arena.out.mark()?;
            dump_any(node, format, &mut arena.out.bytes)?;
            if format.is_textual() {
                arena.out.bytes.push(0);
            }
            arena.out.commit_entry(start)?;
        }
        Ok(arena.out.view())
    }

    /// Batched write in one of four modes keyed on `(has_fields, format)`:
    /// whole-document canonical pass-through, whole-document re-encode,
    /// field-addressed read-modify-write, or patch-dialect application. A
    /// `None` payload deletes the addressed document or field.
    pub fn write(
        &self,
        txn: Option<&Txn<'_>>,
        keys: Strided<'_, Key>,
        fields: Option<Strided<'_, &str>>,
        format: DocFormat,
        payloads: Strided<'_, Option<&[u8]>>,
        opts: Options,
        arena: &mut Arena,
    ) -> Result<()> {
        let n = keys.len();
        expect_count(&payloads, n, "payloads count does not match keys count")?;
        if let Some(f) = &fields {
            expect_count(f, n, "fields count does not match keys count")?;
        }
        for key in keys.iter() {
            if *key == KEY_UNKNOWN {
                return Err(StoreError::BadArgument("cannot write the reserved sentinel key"));
            }
        }
        if n == 0 {
            return Ok(());
        }
        let has_fields = selects_fields(&fields);

        // Mode 1: the payloads already carry the at-rest encoding.
        if !has_fields && format == DocFormat::CanonicalCbor {
            arena.keys.clear();
            arena
                .keys
                .extend(keys.iter().map(|k| ColKey::new(self.col, *k)));
            let refs: Vec<Option<&[u8]>> = (0..n).map(|i| *payloads.get(i)).collect();
            return self.db.substrate.write(txn_id(txn), &arena.keys, &refs, opts);
        }

        // Mode 2: re-encode whole documents, then write.
        if !has_fields && !format.is_patch() {
            arena.keys.clear();
            arena
                .keys
                .extend(keys.iter().map(|k| ColKey::new(self.col, *k)));
            arena.out.clear();
            for i in 0..n {
                match *payloads.get(i) {
                    None => arena.out.push_missing(),
                    Some(payload) => {
                        let parsed = parse_any(payload, format)?;
                        let start = arena.out.mark()?;
                        dump_any(&parsed, DocFormat::CanonicalCbor, &mut arena.out.bytes)?;
                        arena.out.commit_entry(start)?;
                    }
                }
            }
            let refs: Vec<Option<&[u8]>> = (0..n).map(|i| arena.out.get(i)).collect();
            return self.db.substrate.write(txn_id(txn), &arena.keys, &refs, opts);
        }

        // Modes 3 and 4: read-modify-write against the unique key set.
        let read_opts = Options {
            track_reads: opts.track_reads,
            ..Options::default()
        };
        let scattered = self.batched_doc_read(txn, &keys, read_opts, arena)?;
        let unique = arena.keys.len();
        let mut docs: Vec<Doc> = Vec::with_capacity(unique);
        let mut absent: Vec<bool> = Vec::with_capacity(unique);
        for i in 0..unique {
            match arena.tape.get(i) {
                Some(bytes) => {
                    docs.push(parse_any(bytes, DocFormat::CanonicalCbor)?);
                    absent.push(false);
                }
                None => {
                    docs.push(Doc::Null);
                    absent.push(true);
                }
            }
        }

        for i in 0..n {
            let key = *keys.get(i);
            let field = fields.as_ref().map_or("", |f| *f.get(i));
            let path = FieldPath::parse(field)?;
            let idx = locate(&arena.keys, scattered, self.col, key, i)?;
            let payload = *payloads.get(i);
            if format.is_patch() {
                let Some(payload) = payload else {
                    return Err(StoreError::BadArgument("a patch write requires a payload"));
                };
                let patch = parse_any(payload, format)?;
                apply_patch_at(&mut docs[idx], &path, &patch, format)?;
                absent[idx] = false;
            } else {
                match payload {
                    None => {
                        if matches!(path, FieldPath::Root) {
                            docs[idx] = Doc::Null;
                            absent[idx] = true;
                        } else {
                            docs[idx].remove_path(&path);
                        }
                    }
                    Some(payload) => {
                        let value = parse_any(payload, format)?;
                        docs[idx].set_path(&path, value);
                        absent[idx] = false;
                    }
                }
            }
        }

        arena.out.clear();
        for i in 0..unique {
            if absent[i] {
                arena.out.push_missing();
            } else {
                let start = arena.out.mark()?;
                dump_any(&docs[i], DocFormat::CanonicalCbor, &mut arena.out.bytes)?;
                arena.out.commit_entry(start)?;
            }
        }
        let refs: Vec<Option<&[u8]>> = (0..unique).map(|i| arena.out.get(i)).collect();
        self.db.substrate.write(txn_id(txn), &arena.keys, &refs, opts)
    }

    /// The union of flattened field paths across the batch, packed as
    /// NUL-terminated strings. Order within the result is unspecified.
    pub fn gist<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        keys: Strided<'_, Key>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<PathsView<'a>> {
        arena.keys.clear();
        arena
            .keys
            .extend(keys.iter().map(|k| ColKey::new(self.col, *k)));
        let read_opts = Options {
            only_lengths: false,
            ..opts
        };
        self.db
            .substrate
            .read(txn_id(txn), &arena.keys, read_opts, &mut arena.tape)?;

        let mut paths = HashSet::new();
        for i in 0..arena.tape.len() {
            if let Some(bytes) = arena.tape.get(i) {
                parse_any(bytes, DocFormat::CanonicalCbor)?.flatten_paths(&mut paths);
            }
        }
        trace!(docs = arena.tape.len(), paths = paths.len(), "docs.gist");

        arena.out.clear();
        for path in &paths {
            let start = arena.out.mark()?;
            arena.out.bytes.extend_from_slice(path.as_bytes());
            arena.out.bytes.push(0);
            arena.out.commit_entry(start)?;
        }
        Ok(PathsView {
            tape: arena.out.view(),
        })
    }

    /// Issues one substrate read for the batch: strictly ascending key
    /// sequences go through as-is, anything else is sorted and deduplicated
    /// first. Returns whether results must be scattered back through the
    /// sorted unique set.
    fn batched_doc_read(
        &self,
        txn: Option<&Txn<'_>>,
        keys: &Strided<'_, Key>,
        opts: Options,
        arena: &mut Arena,
    ) -> Result<bool> {
        let n = keys.len();
        let mut ascending = true;
        for i in 1..n {
            if keys.get(i - 1) >= keys.get(i) {
                ascending = false;
                break;
            }
        }
        arena.keys.clear();
        arena
            .keys
            .extend(keys.iter().map(|k| ColKey::new(self.col, *k)));
        if !ascending {
            arena.keys.sort_unstable();
            arena.keys.dedup();
        }
        trace!(
            count = n,
            unique = arena.keys.len(),
            ascending,
            "docs.read.batch"
        );
        self.db
            .substrate
            .read(txn_id(txn), &arena.keys, opts, &mut arena.tape)?;
        Ok(!ascending)
    }
}

/// Fields participate only when the selector is present and non-empty; a
/// broadcast empty selector reads as "whole document" for the entire batch.
fn selects_fields(fields: &Option<Strided<'_, &str>>) -> bool {
    match fields {
        None => false,
        Some(f) if f.is_empty() => false,
        Some(f) if f.is_broadcast() => !f.get(0).is_empty(),
        Some(_) => true,
    }
}

fn locate(keys: &[ColKey], scattered: bool, col: CollectionId, key: Key, i: usize) -> Result<usize> {
    if !scattered {
        return Ok(i);
    }
    keys.binary_search(&ColKey::new(col, key))
        .map_err(|_| StoreError::Internal("read plan is missing a requested key"))
}

fn parse_stored(tape: &Tape) -> Result<Vec<Option<Doc>>> {
    (0..tape.len())
        .map(|i| {
            tape.get(i)
                .map(|bytes| parse_any(bytes, DocFormat::CanonicalCbor))
                .transpose()
        })
        .collect()
}

fn apply_patch_at(doc: &mut Doc, path: &FieldPath, patch: &Doc, format: DocFormat) -> Result<()> {
    if matches!(path, FieldPath::Root) {
        return apply_patch_root(doc, patch, format);
    }
    let mut subtree = doc.get_path(path).cloned().unwrap_or(Doc::Null);
    apply_patch_root(&mut subtree, patch, format)?;
    doc.set_path(path, subtree);
    Ok(())
}

fn apply_patch_root(doc: &mut Doc, patch: &Doc, format: DocFormat) -> Result<()> {
    match format {
        DocFormat::JsonPatch => apply_patch(doc, patch),
        DocFormat::MergePatch => {
            merge_patch(doc, patch);
            Ok(())
        }
        _ => Err(StoreError::Internal("patch application with a non-patch format")),
    }
}

/// The result of [`Docs::gist`]: field paths packed back-to-back.
pub struct PathsView<'a> {
    tape: TapeView<'a>,
}

impl<'a> PathsView<'a> {
    pub fn len(&self) -> usize {
        self.tape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tape.is_empty()
    }

    /// The paths as strings, trailing NUL stripped.
    pub fn iter(&self) -> impl Iterator<Item = &'a str> + '_ {
        (0..self.tape.len()).filter_map(move |i| {
            let bytes = self.tape.get(i)?;
            let trimmed = bytes.strip_suffix(&[0]).unwrap_or(bytes);
            std::str::from_utf8(trimmed).ok()
        })
    }

    /// The raw NUL-terminated strings, back-to-back.
    pub fn packed_bytes(&self) -> impl Iterator<Item = Option<&'a [u8]>> + '_ {
        self.tape.iter()
    }
}
