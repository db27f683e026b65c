//! Change feed primitives.
//!
//! Every committed revision gets a process-wide sequence. The feed reports
//! one row per document: the document's latest sequence, its leaf
//! revisions (winning first) and whether the winner is a tombstone. The
//! indexer and the `_changes` surface both consume [`changes_batch`];
//! longpoll and continuous feeds block on the [`CommitNotifier`].

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;

use crate::error::Result;
use crate::revs;
use crate::types::{Revision, Seq};

/// One row of the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    /// The document's latest sequence.
    pub seq: Seq,
    /// Document id.
    pub id: String,
    /// Whether the winning revision is deleted.
    pub deleted: bool,
    /// Leaf revisions, winning revision first.
    pub changes: Vec<Revision>,
}

/// Reads changes with `seq > since`, ascending, one row per document.
///
/// `limit` bounds the row count; `None` streams to the end.
pub fn changes_batch(
    conn: &Connection,
    since: Seq,
    limit: Option<usize>,
) -> Result<Vec<ChangeRow>> {
    let mut stmt = conn.prepare(
        "SELECT d.seq, d.id
         FROM docs AS d
         WHERE d.seq = (SELECT MAX(d2.seq) FROM docs AS d2 WHERE d2.id = d.id)
            AND d.seq > ?1
         ORDER BY d.seq ASC",
    )?;
    let rows = stmt
        .query_map([since.as_i64()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut out = Vec::new();
    for (seq, id) in rows {
        if let Some(limit) = limit {
            if out.len() >= limit {
                break;
            }
        }
        let leaves = revs::leaves(conn, &id)?;
        let deleted = leaves.first().is_some_and(|(_, deleted)| *deleted);
        out.push(ChangeRow {
            seq: Seq::from_i64(seq),
            id,
            deleted,
            changes: leaves.into_iter().map(|(rev, _)| rev).collect(),
        });
    }
    Ok(out)
}

/// Wakes feed consumers when a commit lands.
#[derive(Debug, Default)]
pub struct CommitNotifier {
    last: Mutex<u64>,
    committed: Condvar,
}

impl CommitNotifier {
    /// Creates a notifier with no commits observed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a committed sequence and wakes all waiters.
    pub fn notify(&self, seq: Seq) {
        let mut last = self.last.lock();
        if seq.as_u64() > *last {
            *last = seq.as_u64();
        }
        self.committed.notify_all();
    }

    /// The highest committed sequence observed.
    #[must_use]
    pub fn last_seq(&self) -> Seq {
        Seq::new(*self.last.lock())
    }

    /// Blocks until a sequence above `after` is committed or `timeout`
    /// elapses. Returns whether new commits arrived.
    pub fn wait_past(&self, after: Seq, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut last = self.last.lock();
        while *last <= after.as_u64() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self
                .committed
                .wait_for(&mut last, deadline - now)
                .timed_out()
            {
                return *last > after.as_u64();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use std::sync::Arc;
    use std::thread;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    fn insert_doc(conn: &Connection, id: &str, rev: u64, rev_id: &str, deleted: bool) {
        conn.execute(
            "INSERT INTO revs (id, rev, rev_id, parent_rev, parent_rev_id)
             VALUES (?1, ?2, ?3, NULL, NULL)",
            rusqlite::params![id, rev as i64, rev_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO docs (id, rev, rev_id, doc, md5sum, deleted)
             VALUES (?1, ?2, ?3, '{}', '', ?4)",
            rusqlite::params![id, rev as i64, rev_id, deleted],
        )
        .unwrap();
    }

    #[test]
    fn one_row_per_document_in_seq_order() {
        let conn = test_conn();
        insert_doc(&conn, "a", 1, "aaa", false);
        insert_doc(&conn, "b", 1, "bbb", false);

        let rows = changes_batch(&conn, Seq::new(0), None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "a");
        assert_eq!(rows[1].id, "b");
        assert!(rows[0].seq < rows[1].seq);
    }

    #[test]
    fn since_filters_and_limit_bounds() {
        let conn = test_conn();
        insert_doc(&conn, "a", 1, "aaa", false);
        insert_doc(&conn, "b", 1, "bbb", false);
        insert_doc(&conn, "c", 1, "ccc", false);

        let rows = changes_batch(&conn, Seq::new(1), None).unwrap();
        assert_eq!(rows.len(), 2);

        let rows = changes_batch(&conn, Seq::new(0), Some(1)).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn deleted_flag_follows_winner() {
        let conn = test_conn();
        insert_doc(&conn, "a", 1, "aaa", true);
        let rows = changes_batch(&conn, Seq::new(0), None).unwrap();
        assert!(rows[0].deleted);
        assert_eq!(rows[0].changes, vec![Revision::new(1, "aaa")]);
    }

    #[test]
    fn notifier_wakes_waiters() {
        let notifier = Arc::new(CommitNotifier::new());
        let n2 = Arc::clone(&notifier);
        let waiter = thread::spawn(move || n2.wait_past(Seq::new(0), Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        notifier.notify(Seq::new(1));
        assert!(waiter.join().unwrap());
        assert_eq!(notifier.last_seq(), Seq::new(1));
    }

    #[test]
    fn notifier_times_out() {
        let notifier = CommitNotifier::new();
        assert!(!notifier.wait_past(Seq::new(0), Duration::from_millis(10)));
    }
}
