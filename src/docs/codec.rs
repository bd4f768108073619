//! Import and export encodings for documents.
//!
//! One encoding is special: [`DocFormat::CanonicalCbor`] is the at-rest form.
//! It is a deterministic CBOR subset (definite lengths, shortest integer
//! heads, full-width floats, map keys ordered by their encoded bytes), so
//! equal logical documents always canonicalize to identical bytes and a
//! read-modify-write that changes nothing is a no-op at the KV level.

use std::collections::BTreeMap;

use ciborium::value::Value as CborValue;
use serde_json::Value as JsonValue;

use crate::docs::value::Doc;
use crate::error::{Result, StoreError};

/// External encodings accepted and produced by the document engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DocFormat {
    /// Human-readable textual tree; NUL-terminated on export.
    Json,
    /// The canonical at-rest binary tree.
    CanonicalCbor,
    /// Free-form CBOR interchange; any valid encoding accepted on input.
    Cbor,
    /// Compact tag-prefixed native interchange.
    Packed,
    /// Array-of-operations dialect applied to the addressed subtree.
    JsonPatch,
    /// Recursive deep-merge dialect.
    MergePatch,
    /// Opaque payload handled as a binary leaf.
    Raw,
}

impl DocFormat {
    /// Textual outputs get a trailing NUL; binary outputs do not.
    pub(crate) fn is_textual(self) -> bool {
        matches!(self, DocFormat::Json | DocFormat::JsonPatch | DocFormat::MergePatch)
    }

    pub(crate) fn is_patch(self) -> bool {
        matches!(self, DocFormat::JsonPatch | DocFormat::MergePatch)
    }
}

/// Decodes `bytes` in the declared format. Partial parses and trailing
/// garbage are parse failures.
pub fn parse_any(bytes: &[u8], format: DocFormat) -> Result<Doc> {
    match format {
        DocFormat::Json | DocFormat::JsonPatch | DocFormat::MergePatch => {
            let value: JsonValue = serde_json::from_slice(bytes)
                .map_err(|e| StoreError::Parse(e.to_string()))?;
            Ok(doc_from_json(value))
        }
        DocFormat::CanonicalCbor | DocFormat::Cbor => parse_cbor(bytes),
        DocFormat::Packed => parse_packed(bytes),
        DocFormat::Raw => Ok(Doc::Bin(bytes.to_vec())),
    }
}

/// Encodes `doc` in the requested format, appending to `out`.
pub fn dump_any(doc: &Doc, format: DocFormat, out: &mut Vec<u8>) -> Result<()> {
    match format {
        DocFormat::Json | DocFormat::JsonPatch | DocFormat::MergePatch => {
            let value = json_from_doc(doc)?;
            serde_json::to_writer(&mut *out, &value)
                .map_err(|e| StoreError::Serialize(e.to_string()))
        }
        DocFormat::CanonicalCbor => {
            write_canonical(doc, out);
            Ok(())
        }
        DocFormat::Cbor => {
            let value = cbor_from_doc(doc);
            ciborium::ser::into_writer(&value, &mut *out)
                .map_err(|e| StoreError::Serialize(e.to_string()))
        }
        DocFormat::Packed => {
            write_packed(doc, out);
            Ok(())
        }
        DocFormat::Raw => dump_raw(doc, out),
    }
}

// --- textual tree ---------------------------------------------------------

fn doc_from_json(value: JsonValue) -> Doc {
    match value {
        JsonValue::Null => Doc::Null,
        JsonValue::Bool(b) => Doc::Bool(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Doc::Int(i)
            } else if let Some(u) = n.as_u64() {
                Doc::Uint(u)
            } else {
                Doc::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => Doc::Str(s),
        JsonValue::Array(items) => Doc::Seq(items.into_iter().map(doc_from_json).collect()),
        JsonValue::Object(entries) => Doc::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, doc_from_json(v)))
                .collect(),
        ),
    }
}

fn json_from_doc(doc: &Doc) -> Result<JsonValue> {
    Ok(match doc {
        Doc::Null => JsonValue::Null,
        Doc::Bool(b) => JsonValue::Bool(*b),
        Doc::Int(i) => JsonValue::from(*i),
        Doc::Uint(u) => JsonValue::from(*u),
        Doc::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .ok_or_else(|| {
                StoreError::Serialize("non-finite float is not representable in textual form".into())
            })?,
        Doc::Str(s) => JsonValue::String(s.clone()),
        Doc::Bin(_) => {
            return Err(StoreError::Serialize(
                "binary leaf is not representable in textual form".into(),
            ))
        }
        Doc::Seq(items) => JsonValue::Array(
            items
                .iter()
                .map(json_from_doc)
                .collect::<Result<Vec<_>>>()?,
        ),
        Doc::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), json_from_doc(v)?)))
                .collect::<Result<serde_json::Map<_, _>>>()?,
        ),
    })
}

// --- CBOR -----------------------------------------------------------------

/// Byte reader that leaves the unconsumed tail visible through an outer
/// slice, so trailing garbage after a complete value can be rejected.
struct SliceReader<'b, 'a> {
    rest: &'b mut &'a [u8],
}

#[derive(Debug)]
struct ShortInput;

impl ciborium_io::Read for SliceReader<'_, '_> {
    type Error = ShortInput;

    fn read_exact(&mut self, data: &mut [u8]) -> std::result::Result<(), ShortInput> {
        let current = *self.rest;
        if data.len() > current.len() {
            return Err(ShortInput);
        }
        let (head, tail) = current.split_at(data.len());
        data.copy_from_slice(head);
        *self.rest = tail;
        Ok(())
    }
}

fn parse_cbor(bytes: &[u8]) -> Result<Doc> {
    let mut rest = bytes;
    let value: CborValue = ciborium::de::from_reader(SliceReader { rest: &mut rest })
        .map_err(|e| StoreError::Parse(format!("invalid CBOR document: {e:?}")))?;
    if !rest.is_empty() {
        return Err(StoreError::Parse("trailing bytes after CBOR document".into()));
    }
    doc_from_cbor(value)
}

fn doc_from_cbor(value: CborValue) -> Result<Doc> {
    Ok(match value {
        CborValue::Null => Doc::Null,
        CborValue::Bool(b) => Doc::Bool(b),
        CborValue::Integer(n) => {
            let wide = i128::from(n);
            if let Ok(i) = i64::try_from(wide) {
                Doc::Int(i)
            } else if let Ok(u) = u64::try_from(wide) {
                Doc::Uint(u)
            } else {
                return Err(StoreError::Parse("integer outside the representable range".into()));
            }
        }
        CborValue::Float(f) => Doc::Float(f),
        CborValue::Text(s) => Doc::Str(s),
        CborValue::Bytes(b) => Doc::Bin(b),
        CborValue::Array(items) => Doc::Seq(
            items
                .into_iter()
                .map(doc_from_cbor)
                .collect::<Result<Vec<_>>>()?,
        ),
        CborValue::Map(pairs) => {
            let mut entries = BTreeMap::new();
            for (key, value) in pairs {
                let CborValue::Text(key) = key else {
                    return Err(StoreError::Parse("map keys must be text".into()));
                };
                if entries.insert(key, doc_from_cbor(value)?).is_some() {
                    return Err(StoreError::Parse("duplicate map key".into()));
                }
            }
            Doc::Map(entries)
        }
        _ => return Err(StoreError::Parse("unsupported CBOR construct".into())),
    })
}

fn cbor_from_doc(doc: &Doc) -> CborValue {
    match doc {
        Doc::Null => CborValue::Null,
        Doc::Bool(b) => CborValue::Bool(*b),
        Doc::Int(i) => CborValue::Integer((*i).into()),
        Doc::Uint(u) => CborValue::Integer((*u).into()),
        Doc::Float(f) => CborValue::Float(*f),
        Doc::Str(s) => CborValue::Text(s.clone()),
        Doc::Bin(b) => CborValue::Bytes(b.clone()),
        Doc::Seq(items) => CborValue::Array(items.iter().map(cbor_from_doc).collect()),
        Doc::Map(entries) => CborValue::Map(
            entries
                .iter()
                .map(|(k, v)| (CborValue::Text(k.clone()), cbor_from_doc(v)))
                .collect(),
        ),
    }
}

fn write_head(major: u8, value: u64, out: &mut Vec<u8>) {
    let m = major << 5;
    if value < 24 {
        out.push(m | value as u8);
    } else if value <= u8::MAX as u64 {
        out.push(m | 24);
        out.push(value as u8);
    } else if value <= u16::MAX as u64 {
        out.push(m | 25);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= u32::MAX as u64 {
        out.push(m | 26);
        out.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        out.push(m | 27);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// The canonical encoder. Map keys are ordered by their encoded bytes, which
/// sorts shorter keys first, the way canonical CBOR requires.
pub(crate) fn write_canonical(doc: &Doc, out: &mut Vec<u8>) {
    match doc {
        Doc::Null => out.push(0xf6),
        Doc::Bool(false) => out.push(0xf4),
        Doc::Bool(true) => out.push(0xf5),
        Doc::Int(i) => {
            if *i >= 0 {
                write_head(0, *i as u64, out);
            } else {
                write_head(1, !(*i as u64), out);
            }
        }
        Doc::Uint(u) => write_head(0, *u, out),
        Doc::Float(f) => {
            out.push(0xfb);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Doc::Str(s) => {
            write_head(3, s.len() as u64, out);
            out.extend_from_slice(s.as_bytes());
        }
        Doc::Bin(b) => {
            write_head(2, b.len() as u64, out);
            out.extend_from_slice(b);
        }
        Doc::Seq(items) => {
            write_head(4, items.len() as u64, out);
            for item in items {
                write_canonical(item, out);
            }
        }
        Doc::Map(entries) => {
            let mut encoded: Vec<(Vec<u8>, &Doc)> = entries
                .iter()
                .map(|(key, value)| {
                    let mut head = Vec::with_capacity(key.len() + 2);
                    write_head(3, key.len() as u64, &mut head);
                    head.extend_from_slice(key.as_bytes());
                    (head, value)
                })
                .collect();
            encoded.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            write_head(5, encoded.len() as u64, out);
            for (key, value) in encoded {
                out.extend_from_slice(&key);
                write_canonical(value, out);
            }
        }
    }
}

// --- packed native interchange --------------------------------------------

const PACKED_NULL: u8 = 0;
const PACKED_FALSE: u8 = 1;
const PACKED_TRUE: u8 = 2;
const PACKED_INT: u8 = 3;
const PACKED_UINT: u8 = 4;
const PACKED_FLOAT: u8 = 5;
const PACKED_STR: u8 = 6;
const PACKED_BIN: u8 = 7;
const PACKED_SEQ: u8 = 8;
const PACKED_MAP: u8 = 9;

const PACKED_MAX_DEPTH: usize = 128;

fn write_packed(doc: &Doc, out: &mut Vec<u8>) {
    match doc {
        Doc::Null => out.push(PACKED_NULL),
        Doc::Bool(false) => out.push(PACKED_FALSE),
        Doc::Bool(true) => out.push(PACKED_TRUE),
        Doc::Int(i) => {
            out.push(PACKED_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Doc::Uint(u) => {
            out.push(PACKED_UINT);
            out.extend_from_slice(&u.to_le_bytes());
        }
        Doc::Float(f) => {
            out.push(PACKED_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Doc::Str(s) => {
            out.push(PACKED_STR);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Doc::Bin(b) => {
            out.push(PACKED_BIN);
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        Doc::Seq(items) => {
            out.push(PACKED_SEQ);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                write_packed(item, out);
            }
        }
        Doc::Map(entries) => {
            out.push(PACKED_MAP);
            out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (key, value) in entries {
                out.extend_from_slice(&(key.len() as u32).to_le_bytes());
                out.extend_from_slice(key.as_bytes());
                write_packed(value, out);
            }
        }
    }
}

fn parse_packed(bytes: &[u8]) -> Result<Doc> {
    let mut pos = 0;
    let doc = packed_value(bytes, &mut pos, 0)?;
    if pos != bytes.len() {
        return Err(StoreError::Parse("trailing bytes after packed document".into()));
    }
    Ok(doc)
}

fn packed_take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(n)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| StoreError::Parse("truncated packed document".into()))?;
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}

fn packed_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let raw = packed_take(bytes, pos, 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(raw);
    Ok(u32::from_le_bytes(buf))
}

fn packed_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let raw = packed_take(bytes, pos, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok(u64::from_le_bytes(buf))
}

fn packed_string(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let len = packed_u32(bytes, pos)? as usize;
    let raw = packed_take(bytes, pos, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| StoreError::Parse("packed string is not valid UTF-8".into()))
}

fn packed_value(bytes: &[u8], pos: &mut usize, depth: usize) -> Result<Doc> {
    if depth > PACKED_MAX_DEPTH {
        return Err(StoreError::Parse("packed document nests too deeply".into()));
    }
    let tag = packed_take(bytes, pos, 1)?[0];
    Ok(match tag {
        PACKED_NULL => Doc::Null,
        PACKED_FALSE => Doc::Bool(false),
        PACKED_TRUE => Doc::Bool(true),
        PACKED_INT => Doc::Int(packed_u64(bytes, pos)? as i64),
        PACKED_UINT => Doc::Uint(packed_u64(bytes, pos)?),
        PACKED_FLOAT => Doc::Float(f64::from_le_bytes({
            let mut buf = [0u8; 8];
            buf.copy_from_slice(packed_take(bytes, pos, 8)?);
            buf
        })),
        PACKED_STR => Doc::Str(packed_string(bytes, pos)?),
        PACKED_BIN => {
            let len = packed_u32(bytes, pos)? as usize;
            Doc::Bin(packed_take(bytes, pos, len)?.to_vec())
        }
        PACKED_SEQ => {
            let count = packed_u32(bytes, pos)? as usize;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(packed_value(bytes, pos, depth + 1)?);
            }
            Doc::Seq(items)
        }
        PACKED_MAP => {
            let count = packed_u32(bytes, pos)? as usize;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key = packed_string(bytes, pos)?;
                let value = packed_value(bytes, pos, depth + 1)?;
                if entries.insert(key, value).is_some() {
                    return Err(StoreError::Parse("duplicate map key".into()));
                }
            }
            Doc::Map(entries)
        }
        other => {
            return Err(StoreError::Parse(format!("unknown packed tag {other}")));
        }
    })
}

// --- raw binary leaves ----------------------------------------------------

fn dump_raw(doc: &Doc, out: &mut Vec<u8>) -> Result<()> {
    match doc {
        Doc::Null => Ok(()),
        Doc::Bool(b) => {
            out.push(*b as u8);
            Ok(())
        }
        Doc::Int(i) => {
            out.extend_from_slice(&i.to_le_bytes());
            Ok(())
        }
        Doc::Uint(u) => {
            out.extend_from_slice(&u.to_le_bytes());
            Ok(())
        }
        Doc::Float(f) => {
            out.extend_from_slice(&f.to_le_bytes());
            Ok(())
        }
        Doc::Str(s) => {
            out.extend_from_slice(s.as_bytes());
            Ok(())
        }
        Doc::Bin(b) => {
            out.extend_from_slice(b);
            Ok(())
        }
        Doc::Seq(_) | Doc::Map(_) => Err(StoreError::Serialize(
            "cannot export a nested document as a raw value".into(),
        )),
    }
}
