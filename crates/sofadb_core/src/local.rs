//! Local (non-replicated) documents.
//!
//! `_local/*` documents have no revision DAG and no sequence: they never
//! appear in the change feed, in views, or in `_all_docs`. The revision is
//! a plain counter rendered as `0-N`.

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{Error, Result};

/// Whether `id` names a local document.
#[must_use]
pub fn is_local_id(id: &str) -> bool {
    id.starts_with("_local/")
}

/// Reads a local document.
pub fn get(conn: &Connection, id: &str) -> Result<(String, Value)> {
    let row = conn
        .query_row(
            "SELECT rev, doc FROM local_docs WHERE id = ?1",
            [id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((rev, doc)) = row else {
        return Err(Error::not_found("missing"));
    };
    Ok((format!("0-{rev}"), serde_json::from_str(&doc)?))
}

/// Writes a local document, bumping its counter revision.
pub fn put(conn: &Connection, id: &str, body: &Value) -> Result<String> {
    let current: Option<i64> = conn
        .query_row("SELECT rev FROM local_docs WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    let next = current.unwrap_or(0) + 1;
    conn.execute(
        "INSERT OR REPLACE INTO local_docs (id, rev, doc) VALUES (?1, ?2, ?3)",
        rusqlite::params![id, next, serde_json::to_string(body)?],
    )?;
    Ok(format!("0-{next}"))
}

/// Deletes a local document.
pub fn delete(conn: &Connection, id: &str) -> Result<()> {
    let n = conn.execute("DELETE FROM local_docs WHERE id = ?1", [id])?;
    if n == 0 {
        return Err(Error::not_found("missing"));
    }
    Ok(())
}

/// Lists all local documents in id order.
pub fn list(conn: &Connection) -> Result<Vec<(String, String, Value)>> {
    let mut stmt =
        conn.prepare("SELECT id, rev, doc FROM local_docs ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, rev, doc) = row?;
        out.push((id, format!("0-{rev}"), serde_json::from_str(&doc)?));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use serde_json::json;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn put_get_delete_round_trip() {
        let conn = test_conn();
        let rev = put(&conn, "_local/cfg", &json!({"a": 1})).unwrap();
        assert_eq!(rev, "0-1");

        let (rev, body) = get(&conn, "_local/cfg").unwrap();
        assert_eq!(rev, "0-1");
        assert_eq!(body, json!({"a": 1}));

        let rev = put(&conn, "_local/cfg", &json!({"a": 2})).unwrap();
        assert_eq!(rev, "0-2");

        delete(&conn, "_local/cfg").unwrap();
        assert!(get(&conn, "_local/cfg").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let conn = test_conn();
        assert!(delete(&conn, "_local/ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn list_is_id_ordered() {
        let conn = test_conn();
        put(&conn, "_local/b", &json!(2)).unwrap();
        put(&conn, "_local/a", &json!(1)).unwrap();
        let ids: Vec<_> = list(&conn).unwrap().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec!["_local/a", "_local/b"]);
    }

    #[test]
    fn local_id_detection() {
        assert!(is_local_id("_local/x"));
        assert!(!is_local_id("x"));
        assert!(!is_local_id("_design/x"));
    }
}
