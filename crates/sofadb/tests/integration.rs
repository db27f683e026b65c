//! End-to-end scenarios across the document store and the view engine.

use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sofadb::{
    AllDocsOptions, ChangesOptions, Context, Database, Error, GetOptions, QueryOptions,
    UpdateMode,
};

fn db() -> Database {
    Database::open_in_memory().unwrap()
}

fn ctx() -> Context {
    Context::background()
}

fn put_view(db: &Database, map: &str, reduce: Option<&str>) {
    let mut view = serde_json::Map::new();
    view.insert("map".into(), json!(map));
    if let Some(reduce) = reduce {
        view.insert("reduce".into(), json!(reduce));
    }
    db.put(
        &ctx(),
        "_design/foo",
        &json!({"views": {"bar": Value::Object(view)}}),
    )
    .unwrap();
}

fn query_rows(db: &Database, options: &QueryOptions) -> Vec<(Value, Value)> {
    let mut rows = db
        .query(&ctx(), "_design/foo", "_view/bar", options)
        .unwrap();
    rows.collect_rows()
        .unwrap()
        .into_iter()
        .map(|r| (r.key, r.value))
        .collect()
}

#[test]
fn simple_count() {
    let db = db();
    put_view(
        &db,
        "function(d){emit(d._id,[1]);}",
        Some("_count"),
    );
    db.put(&ctx(), "a", &json!({})).unwrap();
    db.put(&ctx(), "b", &json!({})).unwrap();

    let rows = query_rows(&db, &QueryOptions::default());
    assert_eq!(rows, vec![(json!(null), json!(2))]);
}

#[test]
fn group_by_first_key_element() {
    let db = db();
    put_view(
        &db,
        "function(doc) { if (doc.key) { emit(doc.key, 1); } }",
        Some("_sum"),
    );
    db.put(&ctx(), "a", &json!({"key": "a"})).unwrap();
    db.put(&ctx(), "A", &json!({"key": "a"})).unwrap();
    db.put(&ctx(), "ab", &json!({"key": ["a", "b"]})).unwrap();
    db.put(&ctx(), "aa", &json!({"key": ["a", "a"]})).unwrap();

    let mut options = QueryOptions::default();
    options.group_level = Some(1);
    let rows = query_rows(&db, &options);
    assert_eq!(
        rows,
        vec![(json!("a"), json!(2)), (json!(["a"]), json!(2))]
    );
}

#[test]
fn pre_reduce_with_stats() {
    let db = db();
    put_view(
        &db,
        "function(doc) { emit(doc._id, doc.val); }",
        Some("_stats"),
    );
    db.put(&ctx(), "a", &json!({"val": 100})).unwrap();
    db.put(
        &ctx(),
        "b",
        &json!({"val": {"sum": 5, "min": 5, "max": 5, "count": 5, "sumsqr": 5, "ignored": 5}}),
    )
    .unwrap();

    let rows = query_rows(&db, &QueryOptions::default());
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].1,
        json!({"sum": 105, "count": 6, "min": 5, "max": 100, "sumsqr": 10005})
    );
}

#[test]
fn update_lazy_builds_in_background() {
    let db = db();
    put_view(&db, "function(d){emit(d._id, null);}", None);
    db.put(&ctx(), "a", &json!({})).unwrap();

    // Nothing is indexed yet, so lazy returns empty immediately.
    let mut options = QueryOptions::default();
    options.update = UpdateMode::Lazy;
    let rows = query_rows(&db, &options);
    assert!(rows.is_empty());

    // The background build completes shortly; update=false then sees it.
    let mut options = QueryOptions::default();
    options.update = UpdateMode::False;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let rows = query_rows(&db, &options);
        if rows.len() == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "background index build never finished"
        );
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn couchdb_collation_ordering() {
    let db = db();
    put_view(&db, "function(d){emit(d.key, null);}", None);
    let keys = [
        json!(null),
        json!(false),
        json!(true),
        json!(1),
        json!(2),
        json!(3.0),
        json!("a"),
        json!("A"),
        json!("aa"),
        json!(["a"]),
        json!(["b", "c"]),
        json!({"a": 1}),
    ];
    // Insert shuffled so the output order is the collation's doing.
    for (i, key) in keys.iter().enumerate().rev() {
        db.put(&ctx(), &format!("doc{i:02}"), &json!({"key": key}))
            .unwrap();
    }

    let rows = query_rows(&db, &QueryOptions::default());
    assert_eq!(rows.len(), keys.len());
    for ((got, _), want) in rows.iter().zip(keys.iter()) {
        assert_eq!(
            sofadb_collate::collate(got, want, sofadb_collate::Collation::Unicode),
            std::cmp::Ordering::Equal,
            "expected {want}, got {got}"
        );
    }
}

#[test]
fn ascii_collation_sorts_strings_by_byte() {
    let db = db();
    db.put(
        &ctx(),
        "_design/foo",
        &json!({
            "views": {"bar": {"map": "function(d){emit(d.key, null);}"}},
            "options": {"collation": "ascii"}
        }),
    )
    .unwrap();
    for (id, key) in [("w", "a"), ("x", "B"), ("y", "A"), ("z", "b")] {
        db.put(&ctx(), id, &json!({"key": key})).unwrap();
    }

    let rows = query_rows(&db, &QueryOptions::default());
    let keys: Vec<Value> = rows.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![json!("A"), json!("B"), json!("a"), json!("b")]);
}

#[test]
fn deletion_deindexes_and_design_docs_stay_out() {
    let db = db();
    put_view(&db, "function(d){emit(d._id, null);}", None);
    let rev = db.put(&ctx(), "a", &json!({})).unwrap();

    let rows = query_rows(&db, &QueryOptions::default());
    assert_eq!(rows.len(), 1);

    db.delete(&ctx(), "a", &rev).unwrap();
    let rows = query_rows(&db, &QueryOptions::default());
    assert!(
        rows.is_empty(),
        "deleted documents must leave no emissions behind"
    );
}

#[test]
fn include_design_feeds_design_docs_to_map() {
    let db = db();
    db.put(
        &ctx(),
        "_design/foo",
        &json!({
            "views": {"bar": {"map": "function(d){emit(d._id, null);}"}},
            "options": {"include_design": true}
        }),
    )
    .unwrap();
    let mut rows = db
        .query(&ctx(), "_design/foo", "_view/bar", &QueryOptions::default())
        .unwrap();
    let ids: Vec<String> = rows
        .collect_rows()
        .unwrap()
        .into_iter()
        .map(|r| r.id.unwrap())
        .collect();
    assert_eq!(ids, vec!["_design/foo"]);
}

#[test]
fn throwing_map_function_skips_doc_without_failing_query() {
    let db = db();
    put_view(
        &db,
        "function(d){ if (d.bad) { throw new Error('nope'); } emit(d._id, null); }",
        None,
    );
    db.put(&ctx(), "good", &json!({})).unwrap();
    db.put(&ctx(), "bad", &json!({"bad": true})).unwrap();

    let mut rows = db
        .query(&ctx(), "_design/foo", "_view/bar", &QueryOptions::default())
        .unwrap();
    let ids: Vec<String> = rows
        .collect_rows()
        .unwrap()
        .into_iter()
        .map(|r| r.id.unwrap())
        .collect();
    assert_eq!(ids, vec!["good"]);
}

#[test]
fn incremental_indexing_picks_up_new_docs() {
    let db = db();
    put_view(&db, "function(d){emit(d._id, null);}", None);
    db.put(&ctx(), "a", &json!({})).unwrap();
    assert_eq!(query_rows(&db, &QueryOptions::default()).len(), 1);

    db.put(&ctx(), "b", &json!({})).unwrap();
    let rows = query_rows(&db, &QueryOptions::default());
    assert_eq!(rows.len(), 2);
}

#[test]
fn reduce_with_include_docs_is_rejected() {
    let db = db();
    put_view(&db, "function(d){emit(d._id, 1);}", Some("_count"));
    db.put(&ctx(), "a", &json!({})).unwrap();

    let mut options = QueryOptions::default();
    options.include_docs = true;
    let err = db
        .query(&ctx(), "_design/foo", "_view/bar", &options)
        .unwrap_err();
    assert_eq!(err.status(), 400);
}

#[test]
fn cancelled_context_propagates_everywhere() {
    let db = db();
    put_view(&db, "function(d){emit(d._id, null);}", None);
    db.put(&ctx(), "a", &json!({})).unwrap();

    let cancelled = Context::background();
    cancelled.cancel();
    assert!(matches!(
        db.query(&cancelled, "_design/foo", "_view/bar", &QueryOptions::default()),
        Err(Error::Cancelled)
    ));
    assert!(matches!(
        db.get_with(&cancelled, "a", &GetOptions::default()),
        Err(Error::Cancelled)
    ));
    assert!(matches!(
        db.all_docs(&cancelled, &AllDocsOptions::default()),
        Err(Error::Cancelled)
    ));
    assert!(matches!(
        db.changes(&cancelled, &ChangesOptions::default()),
        Err(Error::Cancelled)
    ));
}

#[test]
fn iterator_close_is_idempotent_and_aborts() {
    let db = db();
    put_view(&db, "function(d){emit(d._id, null);}", None);
    db.put(&ctx(), "a", &json!({})).unwrap();
    db.put(&ctx(), "b", &json!({})).unwrap();

    let mut rows = db
        .query(&ctx(), "_design/foo", "_view/bar", &QueryOptions::default())
        .unwrap();
    assert!(rows.next());
    rows.close();
    rows.close();
    assert!(!rows.next());
    assert!(matches!(rows.err(), Some(Error::IteratorClosed)));
}

#[test]
fn view_indexes_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sofa");
    {
        let db = Database::open(&path, sofadb::Config::default()).unwrap();
        put_view(&db, "function(d){emit(d._id, null);}", None);
        db.put(&ctx(), "a", &json!({})).unwrap();
        let rows = query_rows(&db, &QueryOptions::default());
        assert_eq!(rows.len(), 1);
    }

    // The map table and its last_seq survive a reopen; update=false reads
    // the index without touching the sandbox.
    let db = Database::open(&path, sofadb::Config::default()).unwrap();
    let mut options = QueryOptions::default();
    options.update = UpdateMode::False;
    let rows = query_rows(&db, &options);
    assert_eq!(rows.len(), 1);
}

#[test]
fn conflict_winners_are_deterministic() {
    let db = db();
    // Replicate two conflicting branches; the higher rev_id wins.
    db.bulk_docs(
        &ctx(),
        &[json!({"_id": "a", "_rev": "1-bbb", "from": "b"})],
        false,
    )
    .unwrap();
    db.bulk_docs(
        &ctx(),
        &[json!({"_id": "a", "_rev": "1-aaa", "from": "a"})],
        false,
    )
    .unwrap();

    let mut opts = GetOptions::default();
    opts.conflicts = true;
    let (body, rev) = db.get_with(&ctx(), "a", &opts).unwrap();
    assert_eq!(rev, "1-bbb");
    assert_eq!(body["from"], json!("b"));
    assert_eq!(body["_conflicts"], json!(["1-aaa"]));
}

#[test]
fn changes_after_views_share_one_sequence() {
    let db = db();
    put_view(&db, "function(d){emit(d._id, null);}", None);
    db.put(&ctx(), "a", &json!({})).unwrap();

    let mut options = QueryOptions::default();
    options.update_seq = true;
    let mut rows = db
        .query(&ctx(), "_design/foo", "_view/bar", &options)
        .unwrap();
    let update_seq = rows.update_seq().unwrap();
    rows.collect_rows().unwrap();

    assert_eq!(update_seq, db.update_seq(&ctx()).unwrap());
}
