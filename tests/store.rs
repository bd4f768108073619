use polystore::{
    Arena, Database, DropMode, Options, StoreError, Strided, COLLECTION_MAIN, KEY_UNKNOWN,
};

fn put(db: &Database, col: polystore::CollectionId, key: i64, value: &[u8], arena: &mut Arena) {
    let payload = Some(value);
    db.write(
        None,
        Strided::broadcast(&col, 1),
        Strided::from_slice(&[key]),
        Strided::broadcast(&payload, 1),
        Options::default(),
        arena,
    )
    .expect("write value");
}

fn get(db: &Database, col: polystore::CollectionId, key: i64, arena: &mut Arena) -> Option<Vec<u8>> {
    let view = db
        .read(
            None,
            Strided::broadcast(&col, 1),
            Strided::from_slice(&[key]),
            Options::default(),
            arena,
        )
        .expect("read value");
    view.get(0).map(<[u8]>::to_vec)
}

#[test]
fn blobs_round_trip_and_preserve_batch_order() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");
    for (key, value) in [(3, &b"c"[..]), (1, b"a"), (2, b"b")] {
        put(&db, col, key, value, &mut arena);
    }

    let keys = [2i64, 3, 404, 1];
    let view = db
        .read(
            None,
            Strided::broadcast(&col, 1),
            Strided::from_slice(&keys),
            Options::default(),
            &mut arena,
        )
        .expect("batched read");
    let got: Vec<Option<Vec<u8>>> = view.iter().map(|v| v.map(<[u8]>::to_vec)).collect();
    assert_eq!(
        got,
        vec![
            Some(b"b".to_vec()),
            Some(b"c".to_vec()),
            None,
            Some(b"a".to_vec()),
        ]
    );
}

#[test]
fn empty_values_are_present_not_missing() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");
    put(&db, col, 1, b"", &mut arena);

    let view = db
        .read(
            None,
            Strided::broadcast(&col, 1),
            Strided::from_slice(&[1, 2]),
            Options::default(),
            &mut arena,
        )
        .expect("read");
    assert_eq!(view.get(0), Some(&b""[..]));
    assert_eq!(view.length(0), Some(0));
    assert_eq!(view.get(1), None);
}

#[test]
fn interleaved_key_layouts_read_like_parallel_arrays() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");
    for key in [10, 20, 30] {
        put(&db, col, key, b"v", &mut arena);
    }

    // (key, payload-id) pairs flattened into one buffer; stride walks keys.
    let interleaved = [10i64, 900, 20, 901, 30, 902];
    let keys = Strided::with_stride(&interleaved, 2, 3).expect("strided keys");
    let view = db
        .read(
            None,
            Strided::broadcast(&col, 1),
            keys,
            Options::default(),
            &mut arena,
        )
        .expect("strided read");
    assert_eq!(view.len(), 3);
    assert!(view.iter().all(|v| v == Some(&b"v"[..])));
}

#[test]
fn scan_returns_ascending_keys_per_range() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let main = db.collection("").expect("main collection");
    let side = db.collection("side").expect("side collection");
    for key in [5, 1, 9, 3] {
        put(&db, main, key, b"m", &mut arena);
    }
    put(&db, side, 7, b"s", &mut arena);

    let cols = [main, side];
    let mins = [2i64, i64::MIN];
    let counts = [2u32, 10];
    let view = db
        .scan(
            None,
            Strided::from_slice(&cols),
            Strided::from_slice(&mins),
            Strided::from_slice(&counts),
            Options::default(),
            &mut arena,
        )
        .expect("scan");
    assert_eq!(view.range_keys(0), &[3, 5]);
    assert_eq!(view.range_keys(1), &[7]);
}

#[test]
fn drop_modes_distinguish_values_keys_and_handles() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("scratch").expect("open");
    put(&db, col, 1, b"x", &mut arena);

    db.collection_drop(col, DropMode::ClearValues).expect("clear values");
    assert_eq!(get(&db, col, 1, &mut arena), Some(Vec::new()));

    db.collection_drop(col, DropMode::ClearKeys).expect("clear keys");
    assert_eq!(get(&db, col, 1, &mut arena), None);
    put(&db, col, 2, b"y", &mut arena);
    assert_eq!(get(&db, col, 2, &mut arena), Some(b"y".to_vec()));

    db.collection_drop(col, DropMode::DropCollection).expect("drop");
    let err = db
        .read(
            None,
            Strided::broadcast(&col, 1),
            Strided::from_slice(&[2]),
            Options::default(),
            &mut arena,
        )
        .expect_err("read after drop");
    assert!(matches!(err, StoreError::ClosedHandle(_)));

    let err = db
        .collection_drop(COLLECTION_MAIN, DropMode::DropCollection)
        .expect_err("drop main");
    assert!(matches!(err, StoreError::BadArgument(_)));
}

#[test]
fn count_mismatches_are_bad_arguments() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");

    let keys = [1i64, 2];
    let payloads = [Some(&b"a"[..])];
    let err = db
        .write(
            None,
            Strided::broadcast(&col, 1),
            Strided::from_slice(&keys),
            Strided::from_slice(&payloads),
            Options::default(),
            &mut arena,
        )
        .expect_err("mismatched batch");
    assert!(matches!(err, StoreError::BadArgument(_)));
}

#[test]
fn the_sentinel_key_is_not_writable() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");
    let payload = Some(&b"x"[..]);
    let err = db
        .write(
            None,
            Strided::broadcast(&col, 1),
            Strided::from_slice(&[KEY_UNKNOWN]),
            Strided::broadcast(&payload, 1),
            Options::default(),
            &mut arena,
        )
        .expect_err("sentinel write");
    assert!(matches!(err, StoreError::BadArgument(_)));
}

#[test]
fn tracked_reads_make_commits_conflict_sensitive() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");
    put(&db, col, 1, b"before", &mut arena);

    let txn = db.txn_begin().expect("begin");
    let opts = Options {
        track_reads: true,
        ..Options::default()
    };
    db.read(
        Some(&txn),
        Strided::broadcast(&col, 1),
        Strided::from_slice(&[1]),
        opts,
        &mut arena,
    )
    .expect("tracked read");

    // Another writer sneaks in underneath the transaction.
    put(&db, col, 1, b"interference", &mut arena);

    let payload = Some(&b"mine"[..]);
    db.write(
        Some(&txn),
        Strided::broadcast(&col, 1),
        Strided::from_slice(&[1]),
        Strided::broadcast(&payload, 1),
        Options::default(),
        &mut arena,
    )
    .expect("buffered write");
    let err = txn.commit().expect_err("conflicting commit");
    assert!(matches!(err, StoreError::Substrate(_)));
    assert_eq!(get(&db, col, 1, &mut arena), Some(b"interference".to_vec()));
}

#[test]
fn dropped_transactions_abandon_their_writes() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");

    {
        let txn = db.txn_begin().expect("begin");
        let payload = Some(&b"ghost"[..]);
        db.write(
            Some(&txn),
            Strided::broadcast(&col, 1),
            Strided::from_slice(&[1]),
            Strided::broadcast(&payload, 1),
            Options::default(),
            &mut arena,
        )
        .expect("buffered write");
    }
    assert_eq!(get(&db, col, 1, &mut arena), None);
}

#[test]
fn arena_buffers_are_reused_across_calls() {
    let db = Database::in_memory();
    let mut arena = Arena::new();
    let col = db.collection("").expect("main collection");
    put(&db, col, 1, b"first", &mut arena);
    put(&db, col, 2, b"second", &mut arena);

    let first = get(&db, col, 1, &mut arena).expect("first");
    let second = get(&db, col, 2, &mut arena).expect("second");
    assert_eq!(first, b"first");
    assert_eq!(second, b"second");
}
