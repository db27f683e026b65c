//! Attachment storage.
//!
//! Attachment blobs live in `attachments`; `attachments_bridge` maps each
//! blob to the `(id, rev, rev_id)` revisions that carry it, so a revision
//! chain shares one row per distinct upload. Rows with no bridge references
//! are collected during compaction.

use base64::Engine as _;
use md5::{Digest as _, Md5};
use rusqlite::{Connection, OptionalExtension};

use crate::doc::IncomingAttachment;
use crate::error::{Error, Result};
use crate::types::Revision;

/// A stored attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Filename.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub length: u64,
    /// `md5-<base64>` content digest.
    pub digest: String,
    /// Revision number at which the attachment was introduced.
    pub rev_pos: u64,
    /// Raw content.
    pub data: Vec<u8>,
}

/// Computes the CouchDB digest string for attachment content.
#[must_use]
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    let digest = hasher.finalize();
    format!(
        "md5-{}",
        base64::engine::general_purpose::STANDARD.encode(digest)
    )
}

/// Inserts a new attachment blob and bridges it to `rev`.
pub(crate) fn insert(
    conn: &Connection,
    id: &str,
    rev: &Revision,
    att: &IncomingAttachment,
) -> Result<()> {
    conn.execute(
        "INSERT INTO attachments (filename, content_type, length, digest, data, rev_pos)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            att.filename,
            att.content_type,
            att.data.len() as i64,
            content_digest(&att.data),
            att.data,
            rev.num as i64,
        ],
    )?;
    let pk = conn.last_insert_rowid();
    bridge(conn, pk, id, rev)
}

/// Adds a bridge row linking an existing blob to `rev`.
pub(crate) fn bridge(conn: &Connection, pk: i64, id: &str, rev: &Revision) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO attachments_bridge (pk, id, rev, rev_id)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![pk, id, rev.num as i64, rev.id],
    )?;
    Ok(())
}

/// Carries a parent revision's attachment forward to `rev` (stub handling).
///
/// Returns `BadRequest` when the parent has no attachment by that name.
pub(crate) fn carry_forward(
    conn: &Connection,
    id: &str,
    parent: &Revision,
    rev: &Revision,
    filename: &str,
) -> Result<()> {
    let pk = conn
        .query_row(
            "SELECT att.pk
             FROM attachments_bridge AS bridge
             JOIN attachments AS att ON att.pk = bridge.pk
             WHERE bridge.id = ?1 AND bridge.rev = ?2 AND bridge.rev_id = ?3
                AND att.filename = ?4",
            rusqlite::params![id, parent.num as i64, parent.id, filename],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    match pk {
        Some(pk) => bridge(conn, pk, id, rev),
        None => Err(Error::bad_request(format!(
            "invalid attachment stub in {id} for {filename}"
        ))),
    }
}

/// All attachments bridged to one revision.
pub fn for_rev(conn: &Connection, id: &str, rev: &Revision) -> Result<Vec<Attachment>> {
    let mut stmt = conn.prepare(
        "SELECT att.filename, att.content_type, att.length, att.digest, att.rev_pos, att.data
         FROM attachments_bridge AS bridge
         JOIN attachments AS att ON att.pk = bridge.pk
         WHERE bridge.id = ?1 AND bridge.rev = ?2 AND bridge.rev_id = ?3
         ORDER BY att.filename",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![id, rev.num as i64, rev.id],
        |row| {
            Ok(Attachment {
                filename: row.get(0)?,
                content_type: row.get(1)?,
                length: row.get::<_, i64>(2)? as u64,
                digest: row.get(3)?,
                rev_pos: row.get::<_, i64>(4)? as u64,
                data: row.get(5)?,
            })
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// One named attachment on one revision.
pub fn get(
    conn: &Connection,
    id: &str,
    rev: &Revision,
    filename: &str,
) -> Result<Option<Attachment>> {
    Ok(for_rev(conn, id, rev)?
        .into_iter()
        .find(|a| a.filename == filename))
}

/// Deletes attachment rows with no remaining bridge references.
pub(crate) fn collect_garbage(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM attachments
         WHERE pk NOT IN (SELECT pk FROM attachments_bridge)",
        [],
    )?;
    Ok(n)
}
