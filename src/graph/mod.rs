//! The graph engine: an adjacency inversion keyed by vertex over the KV
//! substrate, with undirected/directed multigraph semantics.
//!
//! Every edge `(u, v, e)` lives twice: as a source-of entry in `u`'s record
//! and a target-of entry in `v`'s. Both sides are updated in one batched
//! substrate write, so a partial edge is never visible.

mod adjacency;
mod export;

use std::collections::BTreeMap;

use tracing::trace;

use crate::arena::Arena;
use crate::db::{txn_id, Database, Txn};
use crate::error::{Result, StoreError};
use crate::graph::adjacency::{
    decode_record, encode_record, insert_entry, remove_entry, AdjEntry, EntryRole, ENTRY_LEN,
};
use crate::model::{ColKey, CollectionId, Edge, Key, Options, Role, DEGREE_MISSING, KEY_UNKNOWN};
use crate::strided::{expect_count, Strided};

/// Edge batch as three parallel strided columns. Broadcast any column to
/// repeat one value across the batch.
#[derive(Copy, Clone)]
pub struct EdgesView<'a> {
    pub sources: Strided<'a, Key>,
    pub targets: Strided<'a, Key>,
    pub ids: Strided<'a, Key>,
}

impl<'a> EdgesView<'a> {
    pub fn from_slices(sources: &'a [Key], targets: &'a [Key], ids: &'a [Key]) -> Self {
        Self {
            sources: Strided::from_slice(sources),
            targets: Strided::from_slice(targets),
            ids: Strided::from_slice(ids),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn get(&self, i: usize) -> Edge {
        Edge::new(*self.sources.get(i), *self.targets.get(i), *self.ids.get(i))
    }
}

/// Result of [`Graph::find_edges`]: per-vertex degrees plus the selected
/// edges flattened in input order. A missing vertex's degree is
/// [`DEGREE_MISSING`] and it contributes no edges.
pub struct FoundEdges<'a> {
    pub degrees: &'a [u32],
    pub edges: &'a [Edge],
}

impl<'a> FoundEdges<'a> {
    pub fn len(&self) -> usize {
        self.degrees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.degrees.is_empty()
    }

    /// The edges of the `i`-th requested vertex, `None` when it is missing
    /// or when only lengths were requested.
    pub fn vertex_edges(&self, i: usize) -> Option<&'a [Edge]> {
        let degree = self.degrees[i];
        if degree == DEGREE_MISSING {
            return None;
        }
        let start: usize = self.degrees[..i]
            .iter()
            .filter(|&&d| d != DEGREE_MISSING)
            .map(|&d| d as usize)
            .sum();
        self.edges.get(start..start + degree as usize)
    }
}

/// Graph operations over one collection. Obtained from
/// [`Database::graph`]; every method is a batched entry point.
pub struct Graph<'db> {
    db: &'db Database,
    col: CollectionId,
}

impl<'db> Graph<'db> {
    pub(crate) fn new(db: &'db Database, col: CollectionId) -> Self {
        Self { db, col }
    }

    /// Inserts every edge into both endpoint records. Duplicate
    /// `(source, target, id)` triples are no-ops; upserting to an absent
    /// vertex creates it.
    pub fn upsert_edges(
        &self,
        txn: Option<&Txn<'_>>,
        edges: &EdgesView<'_>,
        opts: Options,
        arena: &mut Arena,
    ) -> Result<()> {
        self.update_edges(txn, edges, opts, arena, true)
    }

    /// Removes every edge from both endpoint records. Absent edges are
    /// no-ops; records may become empty but their vertices stay present.
    pub fn remove_edges(
        &self,
        txn: Option<&Txn<'_>>,
        edges: &EdgesView<'_>,
        opts: Options,
        arena: &mut Arena,
    ) -> Result<()> {
        self.update_edges(txn, edges, opts, arena, false)
    }

    fn update_edges(
        &self,
        txn: Option<&Txn<'_>>,
        edges: &EdgesView<'_>,
        opts: Options,
        arena: &mut Arena,
        upsert: bool,
    ) -> Result<()> {
        let n = edges.len();
        expect_count(&edges.targets, n, "targets count does not match sources count")?;
        expect_count(&edges.ids, n, "edge ids count does not match sources count")?;
        for i in 0..n {
            let edge = edges.get(i);
            if edge.source == KEY_UNKNOWN || edge.target == KEY_UNKNOWN {
                return Err(StoreError::BadArgument("edge endpoint is the reserved sentinel key"));
            }
        }
        if n == 0 {
            return Ok(());
        }

        arena.keys.clear();
        for i in 0..n {
            let edge = edges.get(i);
            arena.keys.push(ColKey::new(self.col, edge.source));
            arena.keys.push(ColKey::new(self.col, edge.target));
        }
        arena.keys.sort_unstable();
        arena.keys.dedup();

        let read_opts = Options {
            track_reads: opts.track_reads,
            ..Options::default()
        };
        self.db
            .substrate
            .read(txn_id(txn), &arena.keys, read_opts, &mut arena.tape)?;
        let mut records = decode_tape(&arena.tape)?;
        let mut changed = vec![false; records.len()];

        for i in 0..n {
            let edge = edges.get(i);
            let source_idx = find(&arena.keys, self.col, edge.source)?;
            let target_idx = find(&arena.keys, self.col, edge.target)?;
            let forward = AdjEntry {
                neighbor: edge.target,
                edge: edge.id,
                role: EntryRole::SourceOf,
            };
            let reverse = AdjEntry {
                neighbor: edge.source,
                edge: edge.id,
                role: EntryRole::TargetOf,
            };
            if upsert {
                changed[source_idx] |= upsert_into(&mut records[source_idx], forward);
                changed[target_idx] |= upsert_into(&mut records[target_idx], reverse);
            } else {
                if let Some(record) = records[source_idx].as_mut() {
                    changed[source_idx] |= remove_entry(record, &forward);
                }
                if let Some(record) = records[target_idx].as_mut() {
                    changed[target_idx] |= remove_entry(record, &reverse);
                }
            }
        }

        if upsert {
            trace!(count = n, touched = arena.keys.len(), "graph.upsert.edges");
        } else {
            trace!(count = n, touched = arena.keys.len(), "graph.remove.edges");
        }
        self.write_changed(txn, &records, &changed, opts, arena)
    }

    /// Deletes each vertex's record and severs the reverse entries in the
    /// neighbors selected by `roles` (default: any).
    pub fn remove_vertices(
        &self,
        txn: Option<&Txn<'_>>,
        vertices: Strided<'_, Key>,
        roles: Option<Strided<'_, Role>>,
        opts: Options,
        arena: &mut Arena,
    ) -> Result<()> {
        let n = vertices.len();
        if let Some(r) = &roles {
            expect_count(r, n, "roles count does not match vertices count")?;
        }
        if n == 0 {
            return Ok(());
        }

        arena.keys.clear();
        arena
            .keys
            .extend(vertices.iter().map(|v| ColKey::new(self.col, *v)));
        arena.keys.sort_unstable();
        arena.keys.dedup();

        let read_opts = Options {
            track_reads: opts.track_reads,
            ..Options::default()
        };
        self.db
            .substrate
            .read(txn_id(txn), &arena.keys, read_opts, &mut arena.tape)?;
        let pivot_records = decode_tape(&arena.tape)?;

        // Reverse entries to remove, grouped per neighbor. Neighbors that
        // are themselves pivots are skipped: their records are deleted.
        let mut reverse: BTreeMap<Key, Vec<AdjEntry>> = BTreeMap::new();
        for i in 0..n {
            let vertex = *vertices.get(i);
            let role = roles.as_ref().map_or(Role::Any, |r| *r.get(i));
            let idx = find(&arena.keys, self.col, vertex)?;
            let Some(record) = &pivot_records[idx] else {
                continue;
            };
            for entry in record {
                let selected = match entry.role {
                    EntryRole::SourceOf => role.selects_source(),
                    EntryRole::TargetOf => role.selects_target(),
                };
                if !selected {
                    continue;
                }
                if find(&arena.keys, self.col, entry.neighbor).is_ok() {
                    continue;
                }
                reverse.entry(entry.neighbor).or_default().push(AdjEntry {
                    neighbor: vertex,
                    edge: entry.edge,
                    role: entry.role.flip(),
                });
            }
        }

        let neighbor_locs: Vec<ColKey> = reverse
            .keys()
            .map(|k| ColKey::new(self.col, *k))
            .collect();
        self.db
            .substrate
            .read(txn_id(txn), &neighbor_locs, read_opts, &mut arena.tape)?;
        let mut neighbor_records = decode_tape(&arena.tape)?;

        arena.out.clear();
        let mut write_locs: Vec<ColKey> = Vec::new();
        for (i, removals) in reverse.values().enumerate() {
            let Some(record) = neighbor_records[i].as_mut() else {
                continue;
            };
            let mut touched = false;
            for removal in removals {
                touched |= remove_entry(record, removal);
            }
            if touched {
                let start = arena.out.mark()?;
                encode_record(record, &mut arena.out.bytes);
                arena.out.commit_entry(start)?;
                write_locs.push(neighbor_locs[i]);
            }
        }
        let deletions_from = write_locs.len();
        for (i, loc) in arena.keys.iter().enumerate() {
            if pivot_records[i].is_some() {
                write_locs.push(*loc);
            }
        }
        trace!(
            count = n,
            severed = reverse.len(),
            "graph.remove.vertices"
        );
        if write_locs.is_empty() {
            return Ok(());
        }
        let refs: Vec<Option<&[u8]>> = (0..write_locs.len())
            .map(|i| {
                if i < deletions_from {
                    arena.out.get(i)
                } else {
                    None
                }
            })
            .collect();
        self.db.substrate.write(txn_id(txn), &write_locs, &refs, opts)
    }

    /// Per-vertex degree plus the selected edges, flattened in input order.
    /// With `only_lengths` only degrees are computed.
    pub fn find_edges<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        vertices: Strided<'_, Key>,
        roles: Option<Strided<'_, Role>>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<FoundEdges<'a>> {
        self.find_edges_into(txn, &vertices, roles.as_ref(), opts, arena)?;
        Ok(FoundEdges {
            degrees: &arena.degrees,
            edges: &arena.edges,
        })
    }

    /// Presence check; a vertex with an empty record is still present.
    pub fn contains<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        vertices: Strided<'_, Key>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<&'a [bool]> {
        arena.keys.clear();
        arena
            .keys
            .extend(vertices.iter().map(|v| ColKey::new(self.col, *v)));
        let read_opts = Options {
            only_lengths: true,
            ..opts
        };
        self.db
            .substrate
            .read(txn_id(txn), &arena.keys, read_opts, &mut arena.tape)?;
        arena.flags.clear();
        for i in 0..arena.tape.len() {
            arena.flags.push(arena.tape.length(i).is_some());
        }
        Ok(&arena.flags)
    }

    /// Target ids of the edges leaving `vertex`, in `(neighbor, edge)` order.
    pub fn successors<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        vertex: Key,
        arena: &'a mut Arena,
    ) -> Result<&'a [Key]> {
        let role = Role::Source;
        self.find_edges_into(
            txn,
            &Strided::broadcast(&vertex, 1),
            Some(&Strided::broadcast(&role, 1)),
            Options::default(),
            arena,
        )?;
        arena.ids.clear();
        arena.ids.extend(arena.edges.iter().map(|e| e.target));
        Ok(&arena.ids)
    }

    /// Source ids of the edges entering `vertex`, in `(neighbor, edge)` order.
    pub fn predecessors<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        vertex: Key,
        arena: &'a mut Arena,
    ) -> Result<&'a [Key]> {
        let role = Role::Target;
        self.find_edges_into(
            txn,
            &Strided::broadcast(&vertex, 1),
            Some(&Strided::broadcast(&role, 1)),
            Options::default(),
            arena,
        )?;
        arena.ids.clear();
        arena.ids.extend(arena.edges.iter().map(|e| e.source));
        Ok(&arena.ids)
    }

    /// Every neighbor of `vertex`, normalized so the pivot sits on the
    /// source side before projecting the other endpoint. Self-loops appear
    /// once per stored entry; callers filter if they care.
    pub fn neighbors<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        vertex: Key,
        arena: &'a mut Arena,
    ) -> Result<&'a [Key]> {
        self.find_edges_into(
            txn,
            &Strided::broadcast(&vertex, 1),
            None,
            Options::default(),
            arena,
        )?;
        arena.ids.clear();
        arena.ids.extend(arena.edges.iter().map(|e| {
            if e.source == vertex {
                e.target
            } else {
                e.source
            }
        }));
        Ok(&arena.ids)
    }

    /// All edges from `source` to `target`, extracted by binary range from
    /// the source's ordered record.
    pub fn edges_between<'a>(
        &self,
        txn: Option<&Txn<'_>>,
        source: Key,
        target: Key,
        arena: &'a mut Arena,
    ) -> Result<&'a [Edge]> {
        let role = Role::Source;
        self.find_edges_into(
            txn,
            &Strided::broadcast(&source, 1),
            Some(&Strided::broadcast(&role, 1)),
            Options::default(),
            arena,
        )?;
        let lo = arena.edges.partition_point(|e| e.target < target);
        let hi = arena.edges.partition_point(|e| e.target <= target);
        Ok(&arena.edges[lo..hi])
    }

    fn find_edges_into(
        &self,
        txn: Option<&Txn<'_>>,
        vertices: &Strided<'_, Key>,
        roles: Option<&Strided<'_, Role>>,
        opts: Options,
        arena: &mut Arena,
    ) -> Result<()> {
        let n = vertices.len();
        if let Some(r) = roles {
            expect_count(r, n, "roles count does not match vertices count")?;
        }
        arena.degrees.clear();
        arena.edges.clear();
        arena.keys.clear();
        arena
            .keys
            .extend(vertices.iter().map(|v| ColKey::new(self.col, *v)));

        let role_at = |i: usize| roles.map_or(Role::Any, |r| *r.get(i));
        let all_any = (0..n).all(|i| role_at(i) == Role::Any);

        // Unfiltered degrees fall out of record lengths alone.
        if opts.only_lengths && all_any {
            let read_opts = Options {
                only_lengths: true,
                ..opts
            };
            self.db
                .substrate
                .read(txn_id(txn), &arena.keys, read_opts, &mut arena.tape)?;
            for i in 0..n {
                let degree = arena
                    .tape
                    .length(i)
                    .map_or(DEGREE_MISSING, |len| len / ENTRY_LEN as u32);
                arena.degrees.push(degree);
            }
            return Ok(());
        }

        let read_opts = Options {
            track_reads: opts.track_reads,
            ..Options::default()
        };
        self.db
            .substrate
            .read(txn_id(txn), &arena.keys, read_opts, &mut arena.tape)?;
        for i in 0..n {
            let vertex = *vertices.get(i);
            let role = role_at(i);
            let Some(bytes) = arena.tape.get(i) else {
                arena.degrees.push(DEGREE_MISSING);
                continue;
            };
            let mut degree = 0u32;
            for entry in decode_record(bytes)? {
                let (selected, edge) = match entry.role {
                    EntryRole::SourceOf => (
                        role.selects_source(),
                        Edge::new(vertex, entry.neighbor, entry.edge),
                    ),
                    EntryRole::TargetOf => (
                        role.selects_target(),
                        Edge::new(entry.neighbor, vertex, entry.edge),
                    ),
                };
                if !selected {
                    continue;
                }
                degree += 1;
                if !opts.only_lengths {
                    arena.edges.push(edge);
                }
            }
            arena.degrees.push(degree);
        }
        Ok(())
    }

    fn write_changed(
        &self,
        txn: Option<&Txn<'_>>,
        records: &[Option<Vec<AdjEntry>>],
        changed: &[bool],
        opts: Options,
        arena: &mut Arena,
    ) -> Result<()> {
        arena.out.clear();
        let mut write_locs: Vec<ColKey> = Vec::new();
        for (i, loc) in arena.keys.iter().enumerate() {
            if !changed[i] {
                continue;
            }
            let Some(record) = &records[i] else {
                continue;
            };
            let start = arena.out.mark()?;
            encode_record(record, &mut arena.out.bytes);
            arena.out.commit_entry(start)?;
            write_locs.push(*loc);
        }
        if write_locs.is_empty() {
            return Ok(());
        }
        let refs: Vec<Option<&[u8]>> = (0..write_locs.len()).map(|i| arena.out.get(i)).collect();
        self.db.substrate.write(txn_id(txn), &write_locs, &refs, opts)
    }
}

fn upsert_into(record: &mut Option<Vec<AdjEntry>>, entry: AdjEntry) -> bool {
    let created = record.is_none();
    let entries = record.get_or_insert_with(Vec::new);
    insert_entry(entries, entry) || created
}

fn decode_tape(tape: &crate::arena::Tape) -> Result<Vec<Option<Vec<AdjEntry>>>> {
    (0..tape.len())
        .map(|i| tape.get(i).map(decode_record).transpose())
        .collect()
}

fn find(keys: &[ColKey], col: CollectionId, key: Key) -> Result<usize> {
    keys.binary_search(&ColKey::new(col, key))
        .map_err(|_| StoreError::Internal("touched vertex is missing from the read plan"))
}
