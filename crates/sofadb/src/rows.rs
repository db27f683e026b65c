//! The row iterator contract.
//!
//! `next` prepares the next row and returns `true`, or returns `false` at
//! the end of the result set or on error; `err` distinguishes the two.
//! Terminal metadata (`offset`, `total_rows`, `update_seq`, `bookmark`,
//! `warning`) is meaningful once iteration finishes. `close` is idempotent
//! and may be called mid-iteration to abort; reads after close fail with
//! the iterator-closed sentinel, which is distinct from exhaustion.

use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde_json::Value;
use sofadb_core::{Context, Error, Result, Seq};

/// One materialized response row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    /// Emitting document id; `None` for reduce rows.
    pub id: Option<String>,
    /// Row key.
    pub key: Value,
    /// Row value.
    pub value: Value,
    /// Attached document body, when requested.
    pub doc: Option<Value>,
    /// Per-row error (e.g. a missing revision in `open_revs`).
    pub error: Option<String>,
}

/// Streaming iterator over query results.
pub struct Rows {
    ctx: Context,
    pending: VecDeque<Row>,
    current: Option<Row>,
    closed: bool,
    exhausted: bool,
    err: Option<Error>,
    offset: Option<u64>,
    total_rows: Option<u64>,
    update_seq: Option<Seq>,
    bookmark: Option<String>,
    warning: Option<String>,
}

impl Rows {
    pub(crate) fn new(ctx: Context, rows: Vec<Row>) -> Self {
        Self {
            ctx,
            pending: rows.into(),
            current: None,
            closed: false,
            exhausted: false,
            err: None,
            offset: None,
            total_rows: None,
            update_seq: None,
            bookmark: None,
            warning: None,
        }
    }

    pub(crate) fn with_offset(mut self, offset: Option<u64>) -> Self {
        self.offset = offset;
        self
    }

    pub(crate) fn with_total_rows(mut self, total: Option<u64>) -> Self {
        self.total_rows = total;
        self
    }

    pub(crate) fn with_update_seq(mut self, seq: Option<Seq>) -> Self {
        self.update_seq = seq;
        self
    }

    pub(crate) fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }

    pub(crate) fn with_bookmark(mut self, bookmark: Option<String>) -> Self {
        self.bookmark = bookmark;
        self
    }

    /// Advances to the next row. Returns `false` at the end of the result
    /// set, on cancellation, or after close; consult [`Rows::err`].
    pub fn next(&mut self) -> bool {
        if self.closed {
            self.err = Some(Error::IteratorClosed);
            self.current = None;
            return false;
        }
        if let Err(err) = self.ctx.check() {
            self.err = Some(err);
            self.current = None;
            return false;
        }
        match self.pending.pop_front() {
            Some(row) => {
                self.current = Some(row);
                true
            }
            None => {
                self.current = None;
                self.exhausted = true;
                false
            }
        }
    }

    /// The iteration error, if any. `None` after normal exhaustion.
    #[must_use]
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Stops iteration and releases buffered rows. Idempotent; does not
    /// disturb an already-recorded error.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        self.current = None;
    }

    /// Whether the iterator was closed before exhaustion.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn current(&self) -> Result<&Row> {
        if self.closed {
            return Err(Error::IteratorClosed);
        }
        self.current
            .as_ref()
            .ok_or_else(|| Error::internal("no current row; call next() first"))
    }

    /// The current row's document id.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.current.as_ref().and_then(|r| r.id.as_deref())
    }

    /// The current row's key as canonical JSON text.
    #[must_use]
    pub fn key_json(&self) -> String {
        self.current
            .as_ref()
            .map(|r| sofadb_collate::canonical_text(&r.key))
            .unwrap_or_default()
    }

    /// The current row's value as canonical JSON text.
    #[must_use]
    pub fn value_json(&self) -> String {
        self.current
            .as_ref()
            .map(|r| sofadb_collate::canonical_text(&r.value))
            .unwrap_or_default()
    }

    /// The current row's per-row error, if any.
    #[must_use]
    pub fn row_error(&self) -> Option<&str> {
        self.current.as_ref().and_then(|r| r.error.as_deref())
    }

    /// Deserializes the current row's key.
    pub fn scan_key<T: DeserializeOwned>(&self) -> Result<T> {
        let row = self.current()?;
        Ok(serde_json::from_value(row.key.clone())?)
    }

    /// Deserializes the current row's value.
    pub fn scan_value<T: DeserializeOwned>(&self) -> Result<T> {
        let row = self.current()?;
        Ok(serde_json::from_value(row.value.clone())?)
    }

    /// Deserializes the current row's attached document.
    ///
    /// Fails when the query did not include documents.
    pub fn scan_doc<T: DeserializeOwned>(&self) -> Result<T> {
        let row = self.current()?;
        let doc = row
            .doc
            .as_ref()
            .ok_or_else(|| Error::bad_request("query did not include documents"))?;
        Ok(serde_json::from_value(doc.clone())?)
    }

    /// Rows preceding the result window in the unlimited result set.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Total rows in the view, disregarding limits.
    #[must_use]
    pub fn total_rows(&self) -> Option<u64> {
        self.total_rows
    }

    /// The view's indexed sequence, when requested.
    #[must_use]
    pub fn update_seq(&self) -> Option<Seq> {
        self.update_seq
    }

    /// Paging bookmark (`_find` interface).
    #[must_use]
    pub fn bookmark(&self) -> Option<&str> {
        self.bookmark.as_deref()
    }

    /// Query warning, if any.
    #[must_use]
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Drains all remaining rows into a vector. Closes the iterator.
    pub fn collect_rows(&mut self) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        while self.next() {
            if let Some(row) = self.current.clone() {
                out.push(row);
            }
        }
        self.close();
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}
