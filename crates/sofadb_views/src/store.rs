//! Per-view index tables.
//!
//! A view index is identified by a digest of `(map source, reduce source,
//! collation)`, so a design-document update that leaves a view's functions
//! untouched keeps its index. Each index owns two tables: `view_map_<d>`
//! with the emitted `(id, key, value)` rows, `key` collated under the
//! view's collation, and `view_rd_<d>` caching reduce outputs over
//! contiguous key ranges. A `view_indexes` meta row tracks the collation
//! and the last indexed sequence.

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use sofadb_collate::{canonical_text, Collation};
use sofadb_core::{Error, Result, Seq};

/// Stable identity of a view index.
#[must_use]
pub fn view_digest(map: &str, reduce: Option<&str>, collation: Collation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(map.as_bytes());
    hasher.update([0]);
    hasher.update(reduce.unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(collation.sqlite_name().as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Handle to one view's tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewHandle {
    digest: String,
    collation: Collation,
}

/// A raw map-table row: the key and value in canonical JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRow {
    /// Map-table rowid, used as the row's sequence bound in reduction.
    pub rowid: i64,
    /// Emitting document id.
    pub id: String,
    /// Canonical key text.
    pub key: String,
    /// Canonical value text.
    pub value: String,
}

/// A cached reduce output over `[min_key, max_key]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedReduce {
    /// Smallest key covered.
    pub min_key: String,
    /// Largest key covered.
    pub max_key: String,
    /// Canonical reduce value text.
    pub value: String,
}

impl ViewHandle {
    /// The view's collation.
    #[must_use]
    pub const fn collation(&self) -> Collation {
        self.collation
    }

    /// The view's digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub(crate) fn map_table(&self) -> String {
        format!("view_map_{}", self.digest)
    }

    pub(crate) fn reduce_table(&self) -> String {
        format!("view_rd_{}", self.digest)
    }
}

/// Creates the meta table used to track all view indexes. Idempotent.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS view_indexes (
            digest TEXT PRIMARY KEY,
            collation TEXT NOT NULL,
            last_seq INTEGER NOT NULL DEFAULT 0
        )",
    )?;
    Ok(())
}

/// Creates a view's tables if absent and returns its handle. Idempotent.
pub fn upsert_view(conn: &Connection, digest: &str, collation: Collation) -> Result<ViewHandle> {
    migrate(conn)?;
    let handle = ViewHandle {
        digest: digest.to_owned(),
        collation,
    };
    let collation_name = collation.sqlite_name();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {map} (
            id TEXT NOT NULL,
            key TEXT COLLATE {collation_name},
            value TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_{map} ON {map} (key, id);
        CREATE TABLE IF NOT EXISTS {rd} (
            min_key TEXT COLLATE {collation_name},
            max_key TEXT COLLATE {collation_name},
            value TEXT,
            UNIQUE (min_key, max_key)
        );",
        map = handle.map_table(),
        rd = handle.reduce_table(),
    ))?;
    conn.execute(
        "INSERT OR IGNORE INTO view_indexes (digest, collation, last_seq) VALUES (?1, ?2, 0)",
        rusqlite::params![digest, collation_name],
    )?;
    Ok(handle)
}

/// Drops every view index whose digest is not in `live`.
pub fn prune_orphans(conn: &Connection, live: &[String]) -> Result<usize> {
    migrate(conn)?;
    let mut stmt = conn.prepare("SELECT digest FROM view_indexes")?;
    let digests = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut dropped = 0;
    for digest in digests {
        if live.contains(&digest) {
            continue;
        }
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS view_map_{digest};
             DROP TABLE IF EXISTS view_rd_{digest};"
        ))?;
        conn.execute("DELETE FROM view_indexes WHERE digest = ?1", [&digest])?;
        dropped += 1;
    }
    Ok(dropped)
}

/// The highest indexed sequence.
pub fn last_seq(conn: &Connection, handle: &ViewHandle) -> Result<Seq> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT last_seq FROM view_indexes WHERE digest = ?1",
            [handle.digest()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(Seq::from_i64(seq.unwrap_or(0)))
}

/// Advances the indexed sequence.
pub fn set_last_seq(conn: &Connection, handle: &ViewHandle, seq: Seq) -> Result<()> {
    conn.execute(
        "UPDATE view_indexes SET last_seq = ?2 WHERE digest = ?1",
        rusqlite::params![handle.digest(), seq.as_i64()],
    )?;
    Ok(())
}

/// Replaces all map rows for `doc_id` with `pairs`, invalidating every
/// reduce-cache row whose range touches an affected key.
///
/// Callers wrap this in the same transaction that advances `last_seq`.
pub fn replace_emissions(
    conn: &Connection,
    handle: &ViewHandle,
    doc_id: &str,
    pairs: &[(Value, Value)],
) -> Result<()> {
    let map = handle.map_table();
    let rd = handle.reduce_table();

    let mut affected: Vec<String> = {
        let mut stmt = conn.prepare(&format!("SELECT key FROM {map} WHERE id = ?1"))?;
        let rows = stmt
            .query_map([doc_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    conn.execute(&format!("DELETE FROM {map} WHERE id = ?1"), [doc_id])?;
    for (key, value) in pairs {
        let key_text = canonical_text(key);
        conn.execute(
            &format!("INSERT INTO {map} (id, key, value) VALUES (?1, ?2, ?3)"),
            rusqlite::params![doc_id, key_text, canonical_text(value)],
        )?;
        affected.push(key_text);
    }

    for key in affected {
        conn.execute(
            &format!("DELETE FROM {rd} WHERE min_key <= ?1 AND max_key >= ?1"),
            [&key],
        )?;
    }
    Ok(())
}

/// Total number of map rows in the view.
pub fn total_rows(conn: &Connection, handle: &ViewHandle) -> Result<u64> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", handle.map_table()),
        [],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Caches a reduce output for a complete key range.
pub fn cache_reduce(
    conn: &Connection,
    handle: &ViewHandle,
    min_key: &str,
    max_key: &str,
    value: &str,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (min_key, max_key, value) VALUES (?1, ?2, ?3)",
            handle.reduce_table()
        ),
        rusqlite::params![min_key, max_key, value],
    )?;
    Ok(())
}

/// Cached rows lying entirely within `[lo, hi]` (unbounded when `None`),
/// ordered by `min_key`.
pub fn cached_within(
    conn: &Connection,
    handle: &ViewHandle,
    lo: Option<&str>,
    hi: Option<&str>,
) -> Result<Vec<CachedReduce>> {
    let mut sql = format!(
        "SELECT min_key, max_key, value FROM {} WHERE 1=1",
        handle.reduce_table()
    );
    let mut params: Vec<String> = Vec::new();
    if let Some(lo) = lo {
        params.push(lo.to_owned());
        sql.push_str(&format!(" AND min_key >= ?{}", params.len()));
    }
    if let Some(hi) = hi {
        params.push(hi.to_owned());
        sql.push_str(&format!(" AND max_key <= ?{}", params.len()));
    }
    sql.push_str(" ORDER BY min_key");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        Ok(CachedReduce {
            min_key: row.get(0)?,
            max_key: row.get(1)?,
            value: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Looks up a cached reduce output for an exact key range.
pub fn lookup_reduce(
    conn: &Connection,
    handle: &ViewHandle,
    min_key: &str,
    max_key: &str,
) -> Result<Option<String>> {
    let value = conn
        .query_row(
            &format!(
                "SELECT value FROM {} WHERE min_key = ?1 AND max_key = ?2",
                handle.reduce_table()
            ),
            rusqlite::params![min_key, max_key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

/// Parses a canonical key column back to a JSON value.
pub fn parse_stored(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| Error::internal(format!("corrupt index row: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sofadb_collate::collate_raw;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.create_collation("couchdb_json", |a, b| {
            collate_raw(a, b, Collation::Unicode)
        })
        .unwrap();
        conn.create_collation("couchdb_ascii", |a, b| collate_raw(a, b, Collation::Ascii))
            .unwrap();
        conn
    }

    fn handle(conn: &Connection) -> ViewHandle {
        upsert_view(conn, "abc123", Collation::Unicode).unwrap()
    }

    #[test]
    fn digest_is_stable_and_discriminates() {
        let a = view_digest("map1", Some("_count"), Collation::Unicode);
        let b = view_digest("map1", Some("_count"), Collation::Unicode);
        assert_eq!(a, b);
        assert_ne!(a, view_digest("map2", Some("_count"), Collation::Unicode));
        assert_ne!(a, view_digest("map1", None, Collation::Unicode));
        assert_ne!(a, view_digest("map1", Some("_count"), Collation::Ascii));
    }

    #[test]
    fn upsert_is_idempotent_and_tracks_last_seq() {
        let conn = test_conn();
        let h = handle(&conn);
        let h2 = upsert_view(&conn, "abc123", Collation::Unicode).unwrap();
        assert_eq!(h, h2);

        assert_eq!(last_seq(&conn, &h).unwrap(), Seq::new(0));
        set_last_seq(&conn, &h, Seq::new(42)).unwrap();
        assert_eq!(last_seq(&conn, &h).unwrap(), Seq::new(42));
    }

    #[test]
    fn replace_emissions_swaps_rows() {
        let conn = test_conn();
        let h = handle(&conn);
        replace_emissions(
            &conn,
            &h,
            "doc1",
            &[(json!("a"), json!(1)), (json!("b"), json!(2))],
        )
        .unwrap();
        assert_eq!(total_rows(&conn, &h).unwrap(), 2);

        replace_emissions(&conn, &h, "doc1", &[(json!("c"), json!(3))]).unwrap();
        assert_eq!(total_rows(&conn, &h).unwrap(), 1);

        replace_emissions(&conn, &h, "doc1", &[]).unwrap();
        assert_eq!(total_rows(&conn, &h).unwrap(), 0);
    }

    #[test]
    fn map_rows_order_under_collation() {
        let conn = test_conn();
        let h = handle(&conn);
        replace_emissions(&conn, &h, "d1", &[(json!("Zed"), json!(null))]).unwrap();
        replace_emissions(&conn, &h, "d2", &[(json!(10), json!(null))]).unwrap();
        replace_emissions(&conn, &h, "d3", &[(json!([1]), json!(null))]).unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT key FROM {} ORDER BY key",
                h.map_table()
            ))
            .unwrap();
        let keys: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        // numbers < strings < arrays
        assert_eq!(keys, vec!["10", "\"Zed\"", "[1]"]);
    }

    #[test]
    fn cache_invalidation_on_overlap() {
        let conn = test_conn();
        let h = handle(&conn);
        cache_reduce(&conn, &h, "\"a\"", "\"m\"", "5").unwrap();
        cache_reduce(&conn, &h, "\"n\"", "\"z\"", "7").unwrap();

        // A new emission at "b" invalidates the first range only.
        replace_emissions(&conn, &h, "doc", &[(json!("b"), json!(1))]).unwrap();
        assert!(lookup_reduce(&conn, &h, "\"a\"", "\"m\"").unwrap().is_none());
        assert_eq!(
            lookup_reduce(&conn, &h, "\"n\"", "\"z\"").unwrap(),
            Some("7".into())
        );
    }

    #[test]
    fn cached_within_respects_bounds() {
        let conn = test_conn();
        let h = handle(&conn);
        cache_reduce(&conn, &h, "\"a\"", "\"c\"", "1").unwrap();
        cache_reduce(&conn, &h, "\"d\"", "\"f\"", "2").unwrap();
        cache_reduce(&conn, &h, "\"g\"", "\"i\"", "3").unwrap();

        let rows = cached_within(&conn, &h, Some("\"d\""), Some("\"z\"")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].min_key, "\"d\"");

        let all = cached_within(&conn, &h, None, None).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn prune_drops_dead_indexes() {
        let conn = test_conn();
        let _h1 = upsert_view(&conn, "live1", Collation::Unicode).unwrap();
        let _h2 = upsert_view(&conn, "dead1", Collation::Unicode).unwrap();

        let dropped = prune_orphans(&conn, &["live1".to_owned()]).unwrap();
        assert_eq!(dropped, 1);

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM view_indexes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
