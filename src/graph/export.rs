//! Textual adjacency-list files with configurable column separator and
//! line delimiter. Each edge is written once, from its source's record:
//! `source SEP target SEP edge-id DELIM`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::arena::Arena;
use crate::db::{txn_id, Txn};
use crate::error::{Result, StoreError};
use crate::graph::adjacency::{decode_record, EntryRole};
use crate::graph::{EdgesView, Graph};
use crate::model::{ColKey, Key, Options, EDGE_UNSPECIFIED};
use crate::substrate::ScanRange;

const SCAN_BATCH: u32 = 1024;

impl Graph<'_> {
    pub fn export_adjacency_list(
        &self,
        txn: Option<&Txn<'_>>,
        path: &Path,
        column_separator: &str,
        line_delimiter: &str,
        arena: &mut Arena,
    ) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let mut min_key = Key::MIN;
        let mut exported = 0u64;
        loop {
            let ranges = [ScanRange {
                col: self.col,
                min_key,
                max_count: SCAN_BATCH,
            }];
            self.db.substrate.scan(
                txn_id(txn),
                &ranges,
                Options::default(),
                &mut arena.scan_keys,
                &mut arena.scan_counts,
            )?;
            let count = arena.scan_counts.first().copied().unwrap_or(0);
            if count == 0 {
                break;
            }
            let locs: Vec<ColKey> = arena
                .scan_keys
                .iter()
                .map(|k| ColKey::new(self.col, *k))
                .collect();
            self.db
                .substrate
                .read(txn_id(txn), &locs, Options::default(), &mut arena.tape)?;
            for (i, &vertex) in arena.scan_keys.iter().enumerate() {
                let Some(bytes) = arena.tape.get(i) else {
                    continue;
                };
                for entry in decode_record(bytes)? {
                    if entry.role != EntryRole::SourceOf {
                        continue;
                    }
                    write!(
                        writer,
                        "{}{}{}{}{}{}",
                        vertex,
                        column_separator,
                        entry.neighbor,
                        column_separator,
                        entry.edge,
                        line_delimiter
                    )?;
                    exported += 1;
                }
            }
            let Some(&last) = arena.scan_keys.last() else {
                break;
            };
            if count < SCAN_BATCH {
                break;
            }
            min_key = last + 1;
        }
        writer.flush()?;
        debug!(edges = exported, "graph.export.adjacency");
        Ok(())
    }

    /// Reads a textual adjacency list and upserts every edge. Records with
    /// two columns get [`EDGE_UNSPECIFIED`] ids; empty records are skipped.
    pub fn import_adjacency_list(
        &self,
        txn: Option<&Txn<'_>>,
        path: &Path,
        column_separator: &str,
        line_delimiter: &str,
        opts: Options,
        arena: &mut Arena,
    ) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut sources: Vec<Key> = Vec::new();
        let mut targets: Vec<Key> = Vec::new();
        let mut ids: Vec<Key> = Vec::new();
        for record in text.split(line_delimiter) {
            if record.is_empty() {
                continue;
            }
            let mut columns = record.split(column_separator);
            let source = parse_key(columns.next(), record)?;
            let target = parse_key(columns.next(), record)?;
            let id = match columns.next() {
                Some(raw) => parse_key(Some(raw), record)?,
                None => EDGE_UNSPECIFIED,
            };
            if columns.next().is_some() {
                return Err(StoreError::Parse(format!(
                    "adjacency record has too many columns: {record:?}"
                )));
            }
            sources.push(source);
            targets.push(target);
            ids.push(id);
        }
        debug!(edges = sources.len(), "graph.import.adjacency");
        self.upsert_edges(
            txn,
            &EdgesView::from_slices(&sources, &targets, &ids),
            opts,
            arena,
        )
    }
}

fn parse_key(raw: Option<&str>, record: &str) -> Result<Key> {
    raw.and_then(|r| r.trim().parse().ok())
        .ok_or_else(|| StoreError::Parse(format!("invalid adjacency record: {record:?}")))
}
