//! Revision DAG queries.

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;
use crate::types::{Revision, Seq};

/// The winning revision of a document, with its stored body.
#[derive(Debug, Clone)]
pub struct WinningDoc {
    /// Sequence at which this revision was persisted.
    pub seq: Seq,
    /// The winning revision.
    pub rev: Revision,
    /// Whether every leaf is deleted (the winner is a tombstone).
    pub deleted: bool,
    /// The stored body (underscore fields stripped).
    pub body: Value,
}

/// Computes the winning revision of `id`.
///
/// Among non-deleted leaves the highest `(rev, rev_id)` wins; if every leaf
/// is deleted, the highest deleted leaf is returned with `deleted = true`.
/// `None` means the document has never existed.
pub fn winning_doc(conn: &Connection, id: &str) -> Result<Option<WinningDoc>> {
    let row = conn
        .query_row(
            "SELECT seq, rev, rev_id, doc, deleted
             FROM leaves
             WHERE id = ?1
             ORDER BY deleted ASC, rev DESC, rev_id DESC
             LIMIT 1",
            [id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((seq, rev, rev_id, doc, deleted)) = row else {
        return Ok(None);
    };
    Ok(Some(WinningDoc {
        seq: Seq::from_i64(seq),
        rev: Revision::new(rev as u64, rev_id),
        deleted,
        body: serde_json::from_str(&doc)?,
    }))
}

/// Whether `rev` is a current leaf of `id`.
pub fn is_leaf(conn: &Connection, id: &str, rev: &Revision) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM revs AS rev
         LEFT JOIN revs AS child
            ON child.id = rev.id
            AND child.parent_rev = rev.rev
            AND child.parent_rev_id = rev.rev_id
         WHERE rev.id = ?1 AND rev.rev = ?2 AND rev.rev_id = ?3
            AND child.id IS NULL",
        rusqlite::params![id, rev.num as i64, rev.id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// All leaves of `id` with their deleted flags, winning order first.
pub fn leaves(conn: &Connection, id: &str) -> Result<Vec<(Revision, bool)>> {
    let mut stmt = conn.prepare(
        "SELECT rev, rev_id, deleted
         FROM leaves
         WHERE id = ?1
         ORDER BY deleted ASC, rev DESC, rev_id DESC",
    )?;
    let rows = stmt.query_map([id], |row| {
        Ok((
            Revision::new(row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?),
            row.get::<_, bool>(2)?,
        ))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Non-deleted leaves other than the winner: the `_conflicts` array.
pub fn conflicting_revs(conn: &Connection, id: &str, winner: &Revision) -> Result<Vec<Revision>> {
    Ok(leaves(conn, id)?
        .into_iter()
        .filter(|(rev, deleted)| !deleted && rev != winner)
        .map(|(rev, _)| rev)
        .collect())
}

/// Fetches one exact revision's body row.
pub fn rev_row(
    conn: &Connection,
    id: &str,
    rev: &Revision,
) -> Result<Option<(Seq, Value, bool)>> {
    let row = conn
        .query_row(
            "SELECT seq, doc, deleted FROM docs WHERE id = ?1 AND rev = ?2 AND rev_id = ?3",
            rusqlite::params![id, rev.num as i64, rev.id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((seq, doc, deleted)) = row else {
        return Ok(None);
    };
    Ok(Some((
        Seq::from_i64(seq),
        serde_json::from_str(&doc)?,
        deleted,
    )))
}

/// The newest non-deleted leaf descending from `rev` (the `latest=true`
/// option), found with a recursive walk down the DAG.
pub fn latest_leaf(conn: &Connection, id: &str, rev: &Revision) -> Result<Option<Revision>> {
    let row = conn
        .query_row(
            "WITH RECURSIVE descendants AS (
                SELECT id, rev, rev_id
                FROM revs
                WHERE id = ?1 AND rev = ?2 AND rev_id = ?3
                UNION ALL
                SELECT r.id, r.rev, r.rev_id
                FROM revs AS r
                JOIN descendants AS d
                    ON r.id = d.id
                    AND r.parent_rev = d.rev
                    AND r.parent_rev_id = d.rev_id
            )
            SELECT rev.rev, rev.rev_id
            FROM descendants AS rev
            JOIN docs AS doc
                ON doc.id = rev.id AND doc.rev = rev.rev AND doc.rev_id = rev.rev_id
            LEFT JOIN revs AS child
                ON child.id = rev.id
                AND child.parent_rev = rev.rev
                AND child.parent_rev_id = rev.rev_id
            WHERE child.id IS NULL AND doc.deleted = 0
            ORDER BY rev.rev DESC, rev.rev_id DESC
            LIMIT 1",
            rusqlite::params![id, rev.num as i64, rev.id],
            |row| {
                Ok(Revision::new(
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, String>(1)?,
                ))
            },
        )
        .optional()?;
    Ok(row)
}

/// Ancestors of `rev`, newest first, by walking parent edges.
pub fn ancestry(conn: &Connection, id: &str, rev: &Revision) -> Result<Vec<Revision>> {
    let mut out = Vec::new();
    let mut current = rev.clone();
    loop {
        let parent = conn
            .query_row(
                "SELECT parent_rev, parent_rev_id
                 FROM revs
                 WHERE id = ?1 AND rev = ?2 AND rev_id = ?3",
                rusqlite::params![id, current.num as i64, current.id],
                |row| {
                    Ok(match row.get::<_, Option<i64>>(0)? {
                        Some(num) => Some(Revision::new(num as u64, row.get::<_, String>(1)?)),
                        None => None,
                    })
                },
            )
            .optional()?
            .flatten();
        match parent {
            Some(p) => {
                out.push(p.clone());
                current = p;
            }
            None => return Ok(out),
        }
    }
}
