//! SQLite schema.
//!
//! Tables: `revs` holds the revision DAG (parent edges reference other revs
//! rows), `docs` holds one row per stored revision body keyed by the
//! process-wide sequence, `attachments` plus `attachments_bridge` share
//! attachment blobs across revisions, `design` holds one row per design
//! function, `local_docs` and `security` are plain key/value side tables.
//! The `leaves` view selects revisions without children.

use rusqlite::Connection;

use crate::error::Result;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS revs (
        id TEXT NOT NULL,
        rev INTEGER NOT NULL,
        rev_id TEXT NOT NULL,
        parent_rev INTEGER,
        parent_rev_id TEXT,
        UNIQUE (id, rev, rev_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_revs_parent ON revs (id, parent_rev, parent_rev_id)",
    // seq is AUTOINCREMENT so sequences are strictly increasing and never
    // reused, even across deletes.
    "CREATE TABLE IF NOT EXISTS docs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL,
        rev INTEGER NOT NULL,
        rev_id TEXT NOT NULL,
        doc TEXT NOT NULL,
        md5sum TEXT NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        UNIQUE (id, rev, rev_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_docs_id ON docs (id)",
    "CREATE TABLE IF NOT EXISTS attachments (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        length INTEGER NOT NULL,
        digest TEXT NOT NULL,
        data BLOB NOT NULL,
        rev_pos INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS attachments_bridge (
        pk INTEGER NOT NULL,
        id TEXT NOT NULL,
        rev INTEGER NOT NULL,
        rev_id TEXT NOT NULL,
        UNIQUE (id, rev, rev_id, pk)
    )",
    "CREATE VIEW IF NOT EXISTS leaves AS
        SELECT
            doc.seq     AS seq,
            rev.id      AS id,
            rev.rev     AS rev,
            rev.rev_id  AS rev_id,
            doc.doc     AS doc,
            doc.deleted AS deleted
        FROM revs AS rev
        LEFT JOIN revs AS child
            ON rev.id = child.id
            AND rev.rev = child.parent_rev
            AND rev.rev_id = child.parent_rev_id
        JOIN docs AS doc
            ON rev.id = doc.id AND rev.rev = doc.rev AND rev.rev_id = doc.rev_id
        WHERE child.id IS NULL",
    "CREATE TABLE IF NOT EXISTS design (
        id TEXT NOT NULL,
        rev INTEGER NOT NULL,
        rev_id TEXT NOT NULL,
        language TEXT NOT NULL DEFAULT 'javascript',
        func_type TEXT NOT NULL
            CHECK (func_type IN ('map', 'reduce', 'update', 'filter', 'validate')),
        func_name TEXT NOT NULL,
        func_body TEXT NOT NULL,
        auto_update INTEGER NOT NULL DEFAULT 1,
        UNIQUE (id, rev, rev_id, func_type, func_name)
    )",
    "CREATE TABLE IF NOT EXISTS local_docs (
        id TEXT PRIMARY KEY,
        rev INTEGER NOT NULL,
        doc TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS security (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        doc TEXT NOT NULL
    )",
];

/// Creates all tables, indexes and views if absent. Idempotent.
pub fn migrate(conn: &Connection) -> Result<()> {
    for stmt in SCHEMA {
        conn.execute_batch(stmt)?;
    }
    Ok(())
}
