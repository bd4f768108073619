//! The document tree and path addressing.

use std::collections::{BTreeMap, HashSet};

use smallvec::SmallVec;

use crate::error::{Result, StoreError};

/// A schema-free document node. Documents are trees; cyclic references are
/// not representable.
#[derive(Clone, Debug, PartialEq)]
pub enum Doc {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Seq(Vec<Doc>),
    Map(BTreeMap<String, Doc>),
}

impl Default for Doc {
    fn default() -> Self {
        Doc::Null
    }
}

impl Doc {
    pub fn map() -> Self {
        Doc::Map(BTreeMap::new())
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Doc::Null => "null",
            Doc::Bool(_) => "bool",
            Doc::Int(_) => "integer",
            Doc::Uint(_) => "unsigned",
            Doc::Float(_) => "float",
            Doc::Str(_) => "string",
            Doc::Bin(_) => "binary",
            Doc::Seq(_) => "array",
            Doc::Map(_) => "object",
        }
    }

    /// Subtree addressed by `path`, if present.
    pub fn get_path(&self, path: &FieldPath) -> Option<&Doc> {
        match path {
            FieldPath::Root => Some(self),
            FieldPath::Member(name) => match self {
                Doc::Map(entries) => entries.get(name),
                _ => None,
            },
            FieldPath::Pointer(segments) => {
                let mut node = self;
                for segment in segments {
                    node = match node {
                        Doc::Map(entries) => entries.get(segment)?,
                        Doc::Seq(items) => items.get(parse_index(segment)?)?,
                        _ => return None,
                    };
                }
                Some(node)
            }
        }
    }

    /// Places `value` at `path`, creating missing intermediate mappings on
    /// the way down. Assigning a member on a non-object node replaces that
    /// node with an object wrapping the member.
    pub fn set_path(&mut self, path: &FieldPath, value: Doc) {
        match path {
            FieldPath::Root => *self = value,
            FieldPath::Member(name) => {
                set_segments(self, std::slice::from_ref(name), value);
            }
            FieldPath::Pointer(segments) => set_segments(self, segments, value),
        }
    }

    /// Removes the subtree at `path`; `None` when nothing was there.
    pub fn remove_path(&mut self, path: &FieldPath) -> Option<Doc> {
        match path {
            FieldPath::Root => Some(std::mem::take(self)),
            FieldPath::Member(name) => match self {
                Doc::Map(entries) => entries.remove(name),
                _ => None,
            },
            FieldPath::Pointer(segments) => {
                let (last, parent_path) = segments.split_last()?;
                let parent = resolve_mut(self, parent_path)?;
                match parent {
                    Doc::Map(entries) => entries.remove(last),
                    Doc::Seq(items) => {
                        let index = parse_index(last)?;
                        (index < items.len()).then(|| items.remove(index))
                    }
                    _ => None,
                }
            }
        }
    }

    /// Inserts every flattened leaf path of this document into `paths`.
    /// Leaves and empty containers contribute their pointer string; a
    /// primitive root contributes the empty path.
    pub fn flatten_paths(&self, paths: &mut HashSet<String>) {
        let mut prefix = String::new();
        flatten_into(self, &mut prefix, paths);
    }
}

fn flatten_into(node: &Doc, prefix: &mut String, paths: &mut HashSet<String>) {
    match node {
        Doc::Map(entries) if !entries.is_empty() => {
            for (key, value) in entries {
                let saved = prefix.len();
                prefix.push('/');
                push_escaped(prefix, key);
                flatten_into(value, prefix, paths);
                prefix.truncate(saved);
            }
        }
        Doc::Seq(items) if !items.is_empty() => {
            for (i, value) in items.iter().enumerate() {
                let saved = prefix.len();
                prefix.push('/');
                prefix.push_str(&i.to_string());
                flatten_into(value, prefix, paths);
                prefix.truncate(saved);
            }
        }
        _ => {
            paths.insert(prefix.clone());
        }
    }
}

fn push_escaped(out: &mut String, key: &str) {
    for ch in key.chars() {
        match ch {
            '~' => out.push_str("~0"),
            '/' => out.push_str("~1"),
            _ => out.push(ch),
        }
    }
}

fn set_segments(node: &mut Doc, segments: &[String], value: Doc) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if let Doc::Seq(items) = node {
        if let Some(index) = parse_index(head) {
            if index < items.len() {
                return set_segments(&mut items[index], rest, value);
            }
            if index == items.len() {
                items.push(Doc::Null);
                return set_segments(&mut items[index], rest, value);
            }
        }
    }
    if !matches!(node, Doc::Map(_)) {
        *node = Doc::map();
    }
    if let Doc::Map(entries) = node {
        set_segments(entries.entry(head.clone()).or_insert(Doc::Null), rest, value);
    }
}

fn resolve_mut<'a>(node: &'a mut Doc, segments: &[String]) -> Option<&'a mut Doc> {
    let mut node = node;
    for segment in segments {
        node = match node {
            Doc::Map(entries) => entries.get_mut(segment)?,
            Doc::Seq(items) => items.get_mut(parse_index(segment)?)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Array index per pointer rules: digits only, no superfluous leading zero.
fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || (segment.len() > 1 && segment.starts_with('0')) {
        return None;
    }
    if !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

type Segments = SmallVec<[String; 4]>;

/// A field selector: the whole document, a single member name, or a
/// slash-rooted hierarchical pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldPath {
    Root,
    Member(String),
    Pointer(SmallVec<[String; 4]>),
}

impl FieldPath {
    /// The empty string selects the whole document. A leading `/` starts a
    /// hierarchical pointer with `~0`/`~1` escapes; anything else is a plain
    /// member name.
    pub fn parse(field: &str) -> Result<FieldPath> {
        if field.is_empty() {
            return Ok(FieldPath::Root);
        }
        if !field.starts_with('/') {
            return Ok(FieldPath::Member(field.to_owned()));
        }
        let mut segments = Segments::new();
        for raw in field[1..].split('/') {
            segments.push(unescape(raw)?);
        }
        Ok(FieldPath::Pointer(segments))
    }

    /// Pointer parse for the patch dialects, which require `""` or a
    /// slash-rooted path and do not accept bare member names.
    pub(crate) fn parse_pointer(field: &str) -> Result<FieldPath> {
        match Self::parse(field)? {
            FieldPath::Member(_) => Err(StoreError::Parse(format!(
                "patch path must be empty or start with '/': {field:?}"
            ))),
            path => Ok(path),
        }
    }
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '~' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(StoreError::BadArgument("malformed field path escape")),
        }
    }
    Ok(out)
}

/// RFC 7386 deep merge: object patches merge member-wise, `null` members
/// delete, everything else replaces the target outright.
pub fn merge_patch(target: &mut Doc, patch: &Doc) {
    let Doc::Map(patch_entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !matches!(target, Doc::Map(_)) {
        *target = Doc::map();
    }
    let Doc::Map(target_entries) = target else {
        return;
    };
    for (key, value) in patch_entries {
        if matches!(value, Doc::Null) {
            target_entries.remove(key);
        } else {
            merge_patch(
                target_entries.entry(key.clone()).or_insert(Doc::Null),
                value,
            );
        }
    }
}

/// RFC 6902 operation list applied in order. Any failing operation aborts
/// the whole patch.
pub fn apply_patch(target: &mut Doc, ops: &Doc) -> Result<()> {
    let Doc::Seq(ops) = ops else {
        return Err(StoreError::Parse(format!(
            "patch document must be an array of operations, got {}",
            ops.kind_name()
        )));
    };
    for op in ops {
        apply_op(target, op)?;
    }
    Ok(())
}

fn apply_op(target: &mut Doc, op: &Doc) -> Result<()> {
    let Doc::Map(fields) = op else {
        return Err(StoreError::Parse(format!(
            "patch operation must be an object, got {}",
            op.kind_name()
        )));
    };
    let name = op_string(fields, "op")?;
    let path = FieldPath::parse_pointer(op_string(fields, "path")?)?;
    match name {
        "add" => patch_add(target, &path, op_value(fields)?.clone()),
        "remove" => patch_remove(target, &path).map(|_| ()),
        "replace" => {
            let value = op_value(fields)?.clone();
            let slot = patch_resolve(target, &path)?;
            *slot = value;
            Ok(())
        }
        "move" => {
            let from = FieldPath::parse_pointer(op_string(fields, "from")?)?;
            let moved = patch_remove(target, &from)?;
            patch_add(target, &path, moved)
        }
        "copy" => {
            let from = FieldPath::parse_pointer(op_string(fields, "from")?)?;
            let copied = target
                .get_path(&from)
                .ok_or_else(|| StoreError::Parse("patch \"from\" path does not exist".into()))?
                .clone();
            patch_add(target, &path, copied)
        }
        "test" => {
            let value = op_value(fields)?;
            let found = patch_resolve(target, &path)?;
            if found == value {
                Ok(())
            } else {
                Err(StoreError::Parse("patch test failed".into()))
            }
        }
        other => Err(StoreError::Parse(format!("unknown patch op {other:?}"))),
    }
}

fn op_string<'a>(fields: &'a BTreeMap<String, Doc>, key: &str) -> Result<&'a str> {
    match fields.get(key) {
        Some(Doc::Str(s)) => Ok(s),
        _ => Err(StoreError::Parse(format!(
            "patch operation is missing the {key:?} member"
        ))),
    }
}

fn op_value(fields: &BTreeMap<String, Doc>) -> Result<&Doc> {
    fields
        .get("value")
        .ok_or_else(|| StoreError::Parse("patch operation is missing the \"value\" member".into()))
}

fn pointer_segments(path: &FieldPath) -> &[String] {
    match path {
        FieldPath::Pointer(segments) => segments.as_slice(),
        _ => &[],
    }
}

fn patch_resolve<'a>(target: &'a mut Doc, path: &FieldPath) -> Result<&'a mut Doc> {
    resolve_mut(target, pointer_segments(path))
        .ok_or_else(|| StoreError::Parse("patch path does not exist".into()))
}

fn patch_add(target: &mut Doc, path: &FieldPath, value: Doc) -> Result<()> {
    let segments = pointer_segments(path);
    let Some((last, parent_segments)) = segments.split_last() else {
        *target = value;
        return Ok(());
    };
    let parent = resolve_mut(target, parent_segments)
        .ok_or_else(|| StoreError::Parse("patch path does not exist".into()))?;
    match parent {
        Doc::Map(entries) => {
            entries.insert(last.clone(), value);
            Ok(())
        }
        Doc::Seq(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index = parse_index(last)
                .ok_or_else(|| StoreError::Parse(format!("invalid array index {last:?}")))?;
            if index > items.len() {
                return Err(StoreError::Parse("patch array index out of range".into()));
            }
            items.insert(index, value);
            Ok(())
        }
        other => Err(StoreError::Parse(format!(
            "cannot add a member to a {} node",
            other.kind_name()
        ))),
    }
}

fn patch_remove(target: &mut Doc, path: &FieldPath) -> Result<Doc> {
    let segments = pointer_segments(path);
    let Some((last, parent_segments)) = segments.split_last() else {
        return Ok(std::mem::take(target));
    };
    let parent = resolve_mut(target, parent_segments)
        .ok_or_else(|| StoreError::Parse("patch path does not exist".into()))?;
    let removed = match parent {
        Doc::Map(entries) => entries.remove(last),
        Doc::Seq(items) => parse_index(last)
            .filter(|&i| i < items.len())
            .map(|i| items.remove(i)),
        _ => None,
    };
    removed.ok_or_else(|| StoreError::Parse("patch path does not exist".into()))
}
