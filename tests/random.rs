use polystore::{
    bitmap_get, Arena, Database, DocFormat, EdgesView, Options, Role, ScalarType, Strided,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_leaf(rng: &mut ChaCha8Rng) -> String {
    match rng.gen_range(0..6) {
        0 => "null".to_owned(),
        1 => if rng.gen() { "true".into() } else { "false".into() },
        2 => rng.gen_range(-100_000i64..100_000).to_string(),
        3 => format!("{}.5", rng.gen_range(-100i32..100)),
        4 => format!("\"text-{}\"", rng.gen_range(0..100)),
        // Numeric strings exercise the lexical-parse conversion path.
        5 => format!("\"{}\"", rng.gen_range(0..300)),
        _ => unreachable!(),
    }
}

fn random_doc(rng: &mut ChaCha8Rng) -> String {
    let mut body = Vec::new();
    for name in ["a", "b", "c"] {
        if rng.gen_bool(0.7) {
            if rng.gen_bool(0.2) {
                body.push(format!("\"{name}\":{{\"inner\":{}}}", random_leaf(rng)));
            } else {
                body.push(format!("\"{name}\":{}", random_leaf(rng)));
            }
        }
    }
    format!("{{{}}}", body.join(","))
}

#[test]
fn gather_bitmaps_stay_disjoint_under_random_documents() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x00C0_FFEE);
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");

    const DOCS: i64 = 48;
    let keys: Vec<i64> = (0..DOCS).collect();
    for &key in &keys {
        let json = random_doc(&mut rng);
        let payload = Some(json.as_bytes());
        db.docs(col)
            .write(
                None,
                Strided::from_slice(&[key]),
                None,
                DocFormat::Json,
                Strided::broadcast(&payload, 1),
                Options::default(),
                &mut arena,
            )
            .expect("write random document");
    }

    let all_types = [
        ScalarType::Bool,
        ScalarType::I8,
        ScalarType::I32,
        ScalarType::I64,
        ScalarType::U16,
        ScalarType::U64,
        ScalarType::F32,
        ScalarType::F64,
        ScalarType::Str,
        ScalarType::Bin,
    ];
    for _ in 0..8 {
        let fields = ["/a", "/b", "/c", "/a/inner"];
        let types: Vec<ScalarType> = (0..fields.len())
            .map(|_| all_types[rng.gen_range(0..all_types.len())])
            .collect();
        let view = db
            .docs(col)
            .gather(
                None,
                Strided::from_slice(&keys),
                Strided::from_slice(&fields),
                Strided::from_slice(&types),
                Options::default(),
                &mut arena,
            )
            .expect("gather");
        assert_eq!(view.columns.len(), fields.len());
        for column in view.columns {
            for row in 0..keys.len() {
                assert!(
                    !(bitmap_get(&column.validity, row) && bitmap_get(&column.collision, row)),
                    "validity and collision overlap for {:?} at row {row}",
                    column.requested
                );
            }
        }
    }
}

#[test]
fn canonical_form_is_stable_under_rewrites() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");

    for key in 0..32i64 {
        let json = random_doc(&mut rng);
        let payload = Some(json.as_bytes());
        db.docs(col)
            .write(
                None,
                Strided::from_slice(&[key]),
                None,
                DocFormat::Json,
                Strided::broadcast(&payload, 1),
                Options::default(),
                &mut arena,
            )
            .expect("write document");
        let first = db
            .docs(col)
            .read(
                None,
                Strided::from_slice(&[key]),
                None,
                DocFormat::CanonicalCbor,
                Options::default(),
                &mut arena,
            )
            .expect("read canonical")
            .get(0)
            .expect("document present")
            .to_vec();

        // Round-trip the canonical bytes through a whole-document rewrite.
        let payload = Some(&first[..]);
        db.docs(col)
            .write(
                None,
                Strided::from_slice(&[key]),
                None,
                DocFormat::Cbor,
                Strided::broadcast(&payload, 1),
                Options::default(),
                &mut arena,
            )
            .expect("rewrite document");
        let second = db
            .docs(col)
            .read(
                None,
                Strided::from_slice(&[key]),
                None,
                DocFormat::CanonicalCbor,
                Options::default(),
                &mut arena,
            )
            .expect("read canonical again")
            .get(0)
            .expect("document present")
            .to_vec();
        assert_eq!(first, second);
    }
}

#[test]
fn random_edge_churn_preserves_adjacency_invariants() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");

    let mut edges: Vec<(i64, i64, i64)> = (0..200)
        .map(|_| {
            (
                rng.gen_range(0..20),
                rng.gen_range(0..20),
                rng.gen_range(0..5),
            )
        })
        .collect();
    for chunk in edges.chunks(17) {
        let sources: Vec<i64> = chunk.iter().map(|e| e.0).collect();
        let targets: Vec<i64> = chunk.iter().map(|e| e.1).collect();
        let ids: Vec<i64> = chunk.iter().map(|e| e.2).collect();
        db.graph(col)
            .upsert_edges(
                None,
                &EdgesView::from_slices(&sources, &targets, &ids),
                Options::default(),
                &mut arena,
            )
            .expect("upsert chunk");
    }

    // Every upserted edge is visible from both of its endpoints, and each
    // record enumerates in strictly increasing (neighbor, edge) order.
    edges.sort_unstable();
    edges.dedup();
    for &(source, target, id) in &edges {
        let role = Role::Source;
        let outgoing = db
            .graph(col)
            .find_edges(
                None,
                Strided::from_slice(&[source]),
                Some(Strided::broadcast(&role, 1)),
                Options::default(),
                &mut arena,
            )
            .expect("outgoing edges")
            .vertex_edges(0)
            .expect("source present")
            .to_vec();
        assert!(outgoing
            .windows(2)
            .all(|w| (w[0].target, w[0].id) < (w[1].target, w[1].id)));
        assert!(outgoing.iter().any(|e| e.target == target && e.id == id));

        let role = Role::Target;
        let incoming = db
            .graph(col)
            .find_edges(
                None,
                Strided::from_slice(&[target]),
                Some(Strided::broadcast(&role, 1)),
                Options::default(),
                &mut arena,
            )
            .expect("incoming edges")
            .vertex_edges(0)
            .expect("target present")
            .to_vec();
        assert!(incoming.iter().any(|e| e.source == source && e.id == id));
    }

    // Removing everything returns every degree to zero.
    let sources: Vec<i64> = edges.iter().map(|e| e.0).collect();
    let targets: Vec<i64> = edges.iter().map(|e| e.1).collect();
    let ids: Vec<i64> = edges.iter().map(|e| e.2).collect();
    db.graph(col)
        .remove_edges(
            None,
            &EdgesView::from_slices(&sources, &targets, &ids),
            Options::default(),
            &mut arena,
        )
        .expect("remove all");
    for vertex in 0..20i64 {
        let found = db
            .graph(col)
            .find_edges(
                None,
                Strided::from_slice(&[vertex]),
                None,
                Options::lengths_only(),
                &mut arena,
            )
            .expect("degrees");
        let degree = found.degrees[0];
        assert!(degree == 0 || degree == polystore::DEGREE_MISSING);
    }
}
