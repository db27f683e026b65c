//! The `_changes` surface.
//!
//! `normal` returns what is committed and ends. `longpoll` waits for at
//! least one change (or the timeout) before ending. `continuous` keeps
//! yielding as commits land until the context is cancelled or the timeout
//! elapses with nothing new. Filters name a design-document function
//! (`ddoc/name`) run in the sandbox; a throwing filter excludes the
//! document and logs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use sofadb_core::{
    attachments_for_rev, filter_function, winning_doc, Context, Error, FullDoc, LogRecord, Result,
    Seq, Store,
};
use sofadb_script::Sandbox;

/// Feed style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Feed {
    /// Return current changes, then end.
    #[default]
    Normal,
    /// Wait for at least one change (or the timeout), then end.
    Longpoll,
    /// Stream until cancelled or timed out.
    Continuous,
}

/// Options for opening a change feed.
#[derive(Debug, Clone)]
pub struct ChangesOptions {
    /// Feed style.
    pub feed: Feed,
    /// Only changes with `seq > since`.
    pub since: Seq,
    /// Maximum number of changes yielded.
    pub limit: Option<usize>,
    /// Attach winning bodies.
    pub include_docs: bool,
    /// `ddoc/name` filter function.
    pub filter: Option<String>,
    /// Reverse sequence order (`normal` feeds only).
    pub descending: bool,
    /// Longpoll/continuous wait bound; defaults to the store's configured
    /// longpoll timeout.
    pub timeout: Option<Duration>,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            feed: Feed::Normal,
            since: Seq::new(0),
            limit: None,
            include_docs: false,
            filter: None,
            descending: false,
            timeout: None,
        }
    }
}

/// One change feed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// The document's latest sequence.
    pub seq: Seq,
    /// Document id.
    pub id: String,
    /// Whether the winning revision is deleted.
    pub deleted: bool,
    /// Leaf revisions, winning first.
    pub changes: Vec<String>,
    /// Winning body, when `include_docs` was requested.
    pub doc: Option<Value>,
}

/// A change iterator.
pub struct ChangesFeed {
    store: Arc<Store>,
    ctx: Context,
    options: ChangesOptions,
    filter_source: Option<String>,
    sandbox: Option<Sandbox>,
    buffer: VecDeque<Change>,
    last_seq: Seq,
    yielded: usize,
    done: bool,
}

impl ChangesFeed {
    pub(crate) fn open(store: Arc<Store>, ctx: Context, options: ChangesOptions) -> Result<Self> {
        ctx.check()?;
        let filter_source = match &options.filter {
            Some(spec) => {
                let (ddoc, name) = spec
                    .split_once('/')
                    .ok_or_else(|| Error::bad_request("filter must be 'designdoc/filtername'"))?;
                let source = store
                    .with_conn(|conn| filter_function(conn, ddoc, name))?
                    .ok_or_else(|| Error::not_found("missing filter function"))?;
                Some(source)
            }
            None => None,
        };

        let mut feed = Self {
            last_seq: options.since,
            store,
            ctx,
            options,
            filter_source,
            sandbox: None,
            buffer: VecDeque::new(),
            yielded: 0,
            done: false,
        };
        feed.fill()?;

        if feed.buffer.is_empty() && feed.options.feed == Feed::Longpoll {
            let timeout = feed.timeout();
            feed.store.notifier().wait_past(feed.last_seq, timeout);
            feed.ctx.check()?;
            feed.fill()?;
        }
        if feed.options.descending && feed.options.feed == Feed::Normal {
            feed.buffer.make_contiguous().reverse();
        }
        Ok(feed)
    }

    fn timeout(&self) -> Duration {
        self.options
            .timeout
            .unwrap_or(self.store.config().longpoll_timeout)
    }

    /// The sequence up to which this feed has reported.
    #[must_use]
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    /// Yields the next change, or `None` when the feed ends.
    ///
    /// For `continuous` feeds this blocks until a commit lands, the
    /// context is cancelled, or the timeout passes with nothing new.
    pub fn next(&mut self) -> Result<Option<Change>> {
        loop {
            self.ctx.check()?;
            if self.done {
                return Ok(None);
            }
            if let Some(change) = self.buffer.pop_front() {
                self.yielded += 1;
                if let Some(limit) = self.options.limit {
                    if self.yielded >= limit {
                        self.done = true;
                    }
                }
                return Ok(Some(change));
            }
            match self.options.feed {
                Feed::Normal | Feed::Longpoll => {
                    self.done = true;
                    return Ok(None);
                }
                Feed::Continuous => {
                    let deadline = Instant::now() + self.timeout();
                    loop {
                        self.ctx.check()?;
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            self.done = true;
                            return Ok(None);
                        }
                        let woke = self
                            .store
                            .notifier()
                            .wait_past(self.last_seq, remaining.min(Duration::from_millis(100)));
                        if woke {
                            break;
                        }
                    }
                    self.fill()?;
                }
            }
        }
    }

    /// Pulls committed changes past `last_seq` into the buffer, applying
    /// the filter and `include_docs`.
    fn fill(&mut self) -> Result<()> {
        let remaining = self
            .options
            .limit
            .map(|l| l.saturating_sub(self.yielded + self.buffer.len()));
        if remaining == Some(0) {
            return Ok(());
        }
        let raw = self.store.changes(&self.ctx, self.last_seq, remaining)?;
        for row in raw {
            self.last_seq = row.seq;
            let needs_body = self.options.include_docs || self.filter_source.is_some();
            let body = if needs_body && !row.deleted {
                self.store.with_conn(|conn| {
                    let Some(win) = winning_doc(conn, &row.id)? else {
                        return Ok(None);
                    };
                    let fields = match win.body {
                        Value::Object(fields) => fields,
                        _ => Map::new(),
                    };
                    Ok(Some(
                        FullDoc {
                            id: row.id.clone(),
                            rev: win.rev.clone(),
                            deleted: false,
                            body: fields,
                            attachments: attachments_for_rev(conn, &row.id, &win.rev)?,
                            attachments_inline: false,
                            conflicts: Vec::new(),
                            revisions: None,
                            local_seq: None,
                        }
                        .to_value(),
                    ))
                })?
            } else {
                None
            };

            if let Some(source) = &self.filter_source {
                let doc = body.clone().unwrap_or(Value::Null);
                if self.sandbox.is_none() {
                    self.sandbox = Some(Sandbox::new()?);
                }
                let Some(sandbox) = self.sandbox.as_mut() else {
                    return Err(Error::internal("sandbox unavailable"));
                };
                match sandbox.call_filter(source, &doc) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(message) => {
                        self.store.log_script_failure(LogRecord {
                            doc_id: row.id.clone(),
                            message,
                        });
                        continue;
                    }
                }
            }

            self.buffer.push_back(Change {
                seq: row.seq,
                id: row.id,
                deleted: row.deleted,
                changes: row.changes.iter().map(ToString::to_string).collect(),
                doc: if self.options.include_docs { body } else { None },
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChangesFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesFeed")
            .field("feed", &self.options.feed)
            .field("last_seq", &self.last_seq)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
