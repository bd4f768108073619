//! Typed columnar extraction: one column per requested `(field, type)` pair,
//! aligned by document index, with Arrow-style validity / conversion /
//! collision bitmaps. Bitmaps are LSB-first within each byte.

use tracing::trace;

use crate::arena::Arena;
use crate::db::{txn_id, Txn};
use crate::docs::codec::{parse_any, DocFormat};
use crate::docs::value::{Doc, FieldPath};
use crate::docs::Docs;
use crate::error::Result;
use crate::model::{ColKey, Key, Options, LEN_MISSING};
use crate::strided::{expect_count, Strided};

/// Requestable column types. Scalars are fixed-width; `Str` and `Bin`
/// produce (offset, length) pairs into one shared byte buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ScalarType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
    Bin,
}

/// Column payload, tightly packed at the requested width.
#[derive(Clone, Debug)]
pub enum ColumnData {
    Bool(Vec<u8>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    /// Offsets and lengths into the shared string buffer; `LEN_MISSING`
    /// marks rows with no representation.
    Strings { offsets: Vec<u32>, lengths: Vec<u32> },
}

#[derive(Clone, Debug)]
pub struct GatherColumn {
    pub requested: ScalarType,
    /// Bit `i` set iff the field was present in doc `i` and expressible as
    /// the requested type.
    pub validity: Vec<u8>,
    /// Bit `i` set iff the stored type differed and was coerced losslessly.
    pub converted: Vec<u8>,
    /// Bit `i` set iff the field exists but cannot be represented.
    pub collision: Vec<u8>,
    pub data: ColumnData,
}

#[derive(Default)]
pub struct GatherBuf {
    pub(crate) columns: Vec<GatherColumn>,
    pub(crate) strings: Vec<u8>,
}

impl GatherBuf {
    fn reset(&mut self, docs: usize, types: impl Iterator<Item = ScalarType>) {
        self.columns.clear();
        self.strings.clear();
        let bitmap_len = docs.div_ceil(8);
        for requested in types {
            let data = match requested {
                ScalarType::Bool => ColumnData::Bool(vec![0; docs]),
                ScalarType::I8 => ColumnData::I8(vec![0; docs]),
                ScalarType::I16 => ColumnData::I16(vec![0; docs]),
                ScalarType::I32 => ColumnData::I32(vec![0; docs]),
                ScalarType::I64 => ColumnData::I64(vec![0; docs]),
                ScalarType::U8 => ColumnData::U8(vec![0; docs]),
                ScalarType::U16 => ColumnData::U16(vec![0; docs]),
                ScalarType::U32 => ColumnData::U32(vec![0; docs]),
                ScalarType::U64 => ColumnData::U64(vec![0; docs]),
                ScalarType::F32 => ColumnData::F32(vec![0.0; docs]),
                ScalarType::F64 => ColumnData::F64(vec![0.0; docs]),
                ScalarType::Str | ScalarType::Bin => ColumnData::Strings {
                    offsets: vec![LEN_MISSING; docs],
                    lengths: vec![LEN_MISSING; docs],
                },
            };
            self.columns.push(GatherColumn {
                requested,
                validity: vec![0; bitmap_len],
                converted: vec![0; bitmap_len],
                collision: vec![0; bitmap_len],
                data,
            });
        }
    }
}

/// Borrowed gather result: `columns[f]` is aligned by document index, string
/// payloads live in `strings`.
pub struct GatherView<'a> {
    pub columns: &'a [GatherColumn],
    pub strings: &'a [u8],
}

/// LSB-first bitmap lookup: bit `i` lives in byte `i / 8`, mask `1 << (i % 8)`.
pub fn bitmap_get(bitmap: &[u8], i: usize) -> bool {
    bitmap[i / 8] & (1 << (i % 8)) != 0
}

fn bitmap_set(bitmap: &mut [u8], i: usize) {
    bitmap[i / 8] |= 1 << (i % 8);
}

impl Docs<'_> {
    /// For `D` keys and `F` `(field, type)` pairs, produce `F` columns of
    /// height `D`. Missing documents and missing fields gather like nulls.
    pub fn gather<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        keys: Strided<'_, Key>,
        fields: Strided<'_, &str>,
        types: Strided<'_, ScalarType>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<GatherView<'a>> {
        let docs = keys.len();
        let field_count = fields.len();
        expect_count(&types, field_count, "types count does not match fields count")?;

        let paths: Vec<FieldPath> = fields
            .iter()
            .map(|f| FieldPath::parse(f))
            .collect::<Result<_>>()?;
        let requested: Vec<ScalarType> = (0..field_count).map(|f| *types.get(f)).collect();

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
        trace!(docs, fields = field_count, "docs.gather");

        arena.gather.reset(docs, requested.iter().copied());
        let GatherBuf { columns, strings } = &mut arena.gather;

        for row in 0..docs {
            let doc = match arena.tape.get(row) {
                Some(bytes) => Some(parse_any(bytes, DocFormat::CanonicalCbor)?),
                None => None,
            };
            for (column, path) in columns.iter_mut().zip(&paths) {
                let node = doc.as_ref().and_then(|d| d.get_path(path));
                gather_into(column, strings, row, node);
            }
        }

        Ok(GatherView {
            columns: &arena.gather.columns,
            strings: &arena.gather.strings,
        })
    }
}

/// Stored-vs-requested type classes; a matching class keeps the converted
/// bit clear.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Class {
    Signed,
    Unsigned,
    Float,
}

trait Scalar: Copy + Default {
    const CLASS: Class;
    const WIDTH: usize;
    fn from_i64(v: i64) -> Option<Self>;
    fn from_u64(v: u64) -> Option<Self>;
    fn from_f64(v: f64) -> Option<Self>;
    fn from_bits(bytes: &[u8]) -> Self;
    fn parse(s: &str) -> Option<Self>;
}

macro_rules! int_scalar {
    ($t:ty, $class:expr) => {
        impl Scalar for $t {
            const CLASS: Class = $class;
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn from_i64(v: i64) -> Option<Self> {
                Self::try_from(v).ok()
            }

            fn from_u64(v: u64) -> Option<Self> {
                Self::try_from(v).ok()
            }

            fn from_f64(v: f64) -> Option<Self> {
                if !v.is_finite() || v.trunc() != v {
                    return None;
                }
                Self::try_from(v as i128).ok()
            }

            fn from_bits(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                Self::from_le_bytes(buf)
            }

            fn parse(s: &str) -> Option<Self> {
                s.parse().ok()
            }
        }
    };
}

int_scalar!(i8, Class::Signed);
int_scalar!(i16, Class::Signed);
int_scalar!(i32, Class::Signed);
int_scalar!(i64, Class::Signed);
int_scalar!(u8, Class::Unsigned);
int_scalar!(u16, Class::Unsigned);
int_scalar!(u32, Class::Unsigned);
int_scalar!(u64, Class::Unsigned);

impl Scalar for f32 {
    const CLASS: Class = Class::Float;
    const WIDTH: usize = 4;

    fn from_i64(v: i64) -> Option<Self> {
        let f = v as f32;
        (f as i128 == v as i128).then_some(f)
    }

    fn from_u64(v: u64) -> Option<Self> {
        let f = v as f32;
        (f as u128 == v as u128).then_some(f)
    }

    fn from_f64(v: f64) -> Option<Self> {
        let f = v as f32;
        (f64::from(f) == v || v.is_nan()).then_some(f)
    }

    fn from_bits(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        f32::from_le_bytes(buf)
    }

    fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl Scalar for f64 {
    const CLASS: Class = Class::Float;
    const WIDTH: usize = 8;

    fn from_i64(v: i64) -> Option<Self> {
        let f = v as f64;
        (f as i128 == v as i128).then_some(f)
    }

    fn from_u64(v: u64) -> Option<Self> {
        let f = v as f64;
        (f as u128 == v as u128).then_some(f)
    }

    fn from_f64(v: f64) -> Option<Self> {
        Some(v)
    }

    fn from_bits(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        f64::from_le_bytes(buf)
    }

    fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

struct Bits<'a> {
    validity: &'a mut [u8],
    converted: &'a mut [u8],
    collision: &'a mut [u8],
}

impl Bits<'_> {
    fn valid(&mut self, row: usize, converted: bool) {
        if converted {
            bitmap_set(self.converted, row);
        }
        bitmap_set(self.validity, row);
    }

    fn collide(&mut self, row: usize) {
        bitmap_set(self.collision, row);
    }
}

fn gather_into(column: &mut GatherColumn, strings: &mut Vec<u8>, row: usize, node: Option<&Doc>) {
    let mut bits = Bits {
        validity: &mut column.validity,
        converted: &mut column.converted,
        collision: &mut column.collision,
    };
    match &mut column.data {
        ColumnData::Bool(out) => gather_bool(node, row, &mut bits, out),
        ColumnData::I8(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::I16(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::I32(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::I64(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::U8(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::U16(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::U32(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::U64(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::F32(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::F64(out) => gather_scalar(node, row, &mut bits, out),
        ColumnData::Strings { offsets, lengths } => {
            gather_string(node, row, &mut bits, offsets, lengths, strings)
        }
    }
}

fn gather_scalar<T: Scalar>(node: Option<&Doc>, row: usize, bits: &mut Bits<'_>, out: &mut Vec<T>) {
    let (value, converted) = match node.unwrap_or(&Doc::Null) {
        Doc::Null => return,
        Doc::Seq(_) | Doc::Map(_) => {
            bits.collide(row);
            return;
        }
        Doc::Bool(b) => (T::from_i64(*b as i64), true),
        Doc::Int(i) => (T::from_i64(*i), T::CLASS != Class::Signed),
        Doc::Uint(u) => (T::from_u64(*u), T::CLASS != Class::Unsigned),
        Doc::Float(f) => (T::from_f64(*f), T::CLASS != Class::Float),
        Doc::Str(s) => (T::parse(s), true),
        Doc::Bin(b) => {
            if b.len() == T::WIDTH {
                (Some(T::from_bits(b)), true)
            } else {
                (None, true)
            }
        }
    };
    match value {
        Some(v) => {
            out[row] = v;
            bits.valid(row, converted);
        }
        None => bits.collide(row),
    }
}

fn gather_bool(node: Option<&Doc>, row: usize, bits: &mut Bits<'_>, out: &mut Vec<u8>) {
    let (value, converted) = match node.unwrap_or(&Doc::Null) {
        Doc::Null => return,
        Doc::Seq(_) | Doc::Map(_) => {
            bits.collide(row);
            return;
        }
        Doc::Bool(b) => (Some(*b), false),
        Doc::Int(0) | Doc::Uint(0) => (Some(false), true),
        Doc::Int(1) | Doc::Uint(1) => (Some(true), true),
        Doc::Int(_) | Doc::Uint(_) => (None, true),
        Doc::Float(f) if *f == 0.0 => (Some(false), true),
        Doc::Float(f) if *f == 1.0 => (Some(true), true),
        Doc::Float(_) => (None, true),
        Doc::Str(s) => (s.parse::<bool>().ok(), true),
        Doc::Bin(b) if b.len() == 1 => (Some(b[0] != 0), true),
        Doc::Bin(_) => (None, true),
    };
    match value {
        Some(v) => {
            out[row] = v as u8;
            bits.valid(row, converted);
        }
        None => bits.collide(row),
    }
}

/// Length of the on-stack print buffer for numeric-to-text conversion,
/// terminator included. Longer renderings report `LEN_MISSING`.
const PRINT_BUF_LEN: usize = 32;

fn gather_string(
    node: Option<&Doc>,
    row: usize,
    bits: &mut Bits<'_>,
    offsets: &mut [u32],
    lengths: &mut [u32],
    strings: &mut Vec<u8>,
) {
    let mut record = |payload: &[u8], terminated: bool, converted: bool| {
        offsets[row] = strings.len() as u32;
        lengths[row] = payload.len() as u32;
        strings.extend_from_slice(payload);
        if terminated {
            strings.push(0);
        }
        bits.valid(row, converted);
    };
    match node.unwrap_or(&Doc::Null) {
        Doc::Null => {}
        Doc::Seq(_) | Doc::Map(_) => bits.collide(row),
        Doc::Str(s) => record(s.as_bytes(), true, false),
        Doc::Bin(b) => record(b, false, false),
        Doc::Bool(b) => record(if *b { b"true" } else { b"false" }, true, true),
        Doc::Int(i) => record(i.to_string().as_bytes(), true, true),
        Doc::Uint(u) => record(u.to_string().as_bytes(), true, true),
        Doc::Float(f) => {
            let printed = format!("{f:.6}");
            if printed.len() + 1 > PRINT_BUF_LEN {
                bits.collide(row);
            } else {
                record(printed.as_bytes(), true, true);
            }
        }
    }
}
