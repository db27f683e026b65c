//! The document store handle.

use std::path::Path;
use std::sync::Arc;

use md5::{Digest as _, Md5};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, Transaction};
use serde_json::{Map, Value};
use sofadb_collate::{collate_raw, Collation};
use sofadb_script::{Sandbox, ValidationOutcome};
use tracing::{debug, warn};

use crate::attachments::{self, Attachment};
use crate::changes::{self, ChangeRow, CommitNotifier};
use crate::config::{Config, LogRecord};
use crate::context::Context;
use crate::design::{self, DesignDocument};
use crate::doc::{parse_incoming, FullDoc, GetOptions, IncomingAttachment, IncomingDoc};
use crate::error::{Error, Result};
use crate::local;
use crate::revs::{self, winning_doc};
use crate::schema;
use crate::types::{Revision, Seq};

/// Options for a document write.
#[derive(Debug, Clone)]
pub struct PutOptions {
    /// Expected current revision; overrides `_rev` in the body.
    pub rev: Option<Revision>,
    /// `false` accepts replicated revisions verbatim (no conflict checks,
    /// no new revision id).
    pub new_edits: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            rev: None,
            new_edits: true,
        }
    }
}

/// Per-document outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkResult {
    /// Document id.
    pub id: String,
    /// New revision on success.
    pub rev: Option<Revision>,
    /// Error name (`conflict`, `forbidden`, ...) on failure.
    pub error: Option<String>,
    /// Human-readable failure reason.
    pub reason: Option<String>,
}

/// Database statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    /// Documents whose winning revision is live.
    pub doc_count: u64,
    /// Documents whose every leaf is deleted.
    pub deleted_count: u64,
    /// Highest assigned sequence.
    pub update_seq: Seq,
}

/// The main document-store handle.
///
/// All access funnels through one SQLite connection guarded by a mutex;
/// every operation is a short transaction, so readers always observe a
/// consistent snapshot and writers never interleave within a document.
pub struct Store {
    conn: Mutex<Connection>,
    config: Config,
    notifier: Arc<CommitNotifier>,
    is_open: RwLock<bool>,
}

impl Store {
    /// Opens (creating if necessary) a store at `path`.
    pub fn open(path: &Path, config: Config) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, config)
    }

    /// Opens a fresh in-memory store for testing.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Opens an in-memory store with custom configuration.
    pub fn open_in_memory_with_config(config: Config) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, config)
    }

    fn init(conn: Connection, config: Config) -> Result<Self> {
        conn.create_collation("couchdb_json", |a, b| {
            collate_raw(a, b, Collation::Unicode)
        })?;
        conn.create_collation("couchdb_ascii", |a, b| collate_raw(a, b, Collation::Ascii))?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
            notifier: Arc::new(CommitNotifier::new()),
            is_open: RwLock::new(true),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    ///
    /// This is the low-level hook the view engine builds on; holders must
    /// keep their transactions short.
    pub fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
        self.ensure_open()?;
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    /// The commit notifier feed consumers block on.
    #[must_use]
    pub fn notifier(&self) -> Arc<CommitNotifier> {
        Arc::clone(&self.notifier)
    }

    /// Store configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Delivers a user-script failure to the configured sink.
    pub fn log_script_failure(&self, record: LogRecord) {
        warn!(doc_id = %record.doc_id, message = %record.message, "user script failure");
        if let Some(sink) = &self.config.log_sink {
            sink(record);
        }
    }

    /// Writes a document, returning its new revision.
    pub fn put(&self, ctx: &Context, id: &str, body: &Value, opts: PutOptions) -> Result<Revision> {
        ctx.check()?;
        validate_doc_id(id)?;
        let mut incoming = parse_incoming(body)?;
        if let Some(body_id) = &incoming.id {
            if body_id != id {
                return Err(Error::bad_request("document ID mismatch"));
            }
        }
        if opts.rev.is_some() {
            if incoming.rev.is_some() && incoming.rev != opts.rev {
                return Err(Error::bad_request("document rev and option have different values"));
            }
            incoming.rev = opts.rev.clone();
        }
        let (rev, seq) = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let result = write_revision(&tx, id, &incoming, opts.new_edits)?;
            tx.commit()?;
            Ok(result)
        })?;
        self.notifier.notify(seq);
        debug!(%id, %rev, %seq, "document written");
        Ok(rev)
    }

    /// Deletes a document by writing a tombstone revision.
    pub fn delete(&self, ctx: &Context, id: &str, rev: &Revision) -> Result<Revision> {
        ctx.check()?;
        validate_doc_id(id)?;
        let incoming = IncomingDoc {
            id: Some(id.to_owned()),
            rev: Some(rev.clone()),
            deleted: true,
            attachments: Vec::new(),
            revisions: None,
            body: Map::new(),
        };
        let (rev, seq) = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let result = write_revision(&tx, id, &incoming, true)?;
            tx.commit()?;
            Ok(result)
        })?;
        self.notifier.notify(seq);
        Ok(rev)
    }

    /// Reads a document.
    pub fn get(&self, ctx: &Context, id: &str, opts: &GetOptions) -> Result<FullDoc> {
        ctx.check()?;
        self.with_conn(|conn| read_doc(conn, id, opts))
    }

    /// Returns the winning revision of a document.
    pub fn get_rev(&self, ctx: &Context, id: &str) -> Result<Revision> {
        ctx.check()?;
        self.with_conn(|conn| {
            let win = winning_doc(conn, id)?.ok_or_else(|| Error::not_found("not found"))?;
            if win.deleted {
                return Err(Error::not_found("not found"));
            }
            Ok(win.rev)
        })
    }

    /// Applies a batch of writes, one outcome per input document.
    ///
    /// Per-document conflicts and validation failures land in the result
    /// list; infrastructure failures abort the batch.
    pub fn bulk_docs(
        &self,
        ctx: &Context,
        docs: &[Value],
        new_edits: bool,
    ) -> Result<Vec<BulkResult>> {
        let mut out = Vec::with_capacity(docs.len());
        let mut last_seq = None;
        for body in docs {
            ctx.check()?;
            let result: Result<(String, Revision, Seq)> = (|| {
                let incoming = parse_incoming(body)?;
                let id = incoming
                    .id
                    .clone()
                    .unwrap_or_else(generate_doc_id);
                validate_doc_id(&id)?;
                let (rev, seq) = self.with_conn(|conn| {
                    let tx = conn.transaction()?;
                    let result = write_revision(&tx, &id, &incoming, new_edits)?;
                    tx.commit()?;
                    Ok(result)
                })?;
                Ok((id, rev, seq))
            })();
            match result {
                Ok((id, rev, seq)) => {
                    last_seq = Some(seq);
                    out.push(BulkResult {
                        id,
                        rev: Some(rev),
                        error: None,
                        reason: None,
                    });
                }
                Err(err) => {
                    let id = body
                        .get("_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    let name = match &err {
                        Error::Conflict => "conflict",
                        Error::Forbidden(_) => "forbidden",
                        Error::Unauthorized(_) => "unauthorized",
                        Error::BadRequest(_) | Error::Json(_) => "bad_request",
                        _ => return Err(err),
                    };
                    out.push(BulkResult {
                        id,
                        rev: None,
                        error: Some(name.to_owned()),
                        reason: Some(err.to_string()),
                    });
                }
            }
        }
        if let Some(seq) = last_seq {
            self.notifier.notify(seq);
        }
        Ok(out)
    }

    /// Reads one attachment.
    pub fn get_attachment(
        &self,
        ctx: &Context,
        id: &str,
        filename: &str,
        rev: Option<&Revision>,
    ) -> Result<Attachment> {
        ctx.check()?;
        self.with_conn(|conn| {
            let rev = match rev {
                Some(rev) => rev.clone(),
                None => {
                    let win =
                        winning_doc(conn, id)?.ok_or_else(|| Error::not_found("not found"))?;
                    if win.deleted {
                        return Err(Error::not_found("not found"));
                    }
                    win.rev
                }
            };
            attachments::get(conn, id, &rev, filename)?
                .ok_or_else(|| Error::not_found("attachment not found"))
        })
    }

    /// Adds or replaces one attachment, creating a new revision.
    pub fn put_attachment(
        &self,
        ctx: &Context,
        id: &str,
        rev: Option<&Revision>,
        att: IncomingAttachment,
    ) -> Result<Revision> {
        ctx.check()?;
        validate_doc_id(id)?;
        let (rev, seq) = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let incoming = attachment_edit(&tx, id, rev, Some(att), None)?;
            let result = write_revision(&tx, id, &incoming, true)?;
            tx.commit()?;
            Ok(result)
        })?;
        self.notifier.notify(seq);
        Ok(rev)
    }

    /// Removes one attachment, creating a new revision.
    pub fn delete_attachment(
        &self,
        ctx: &Context,
        id: &str,
        filename: &str,
        rev: &Revision,
    ) -> Result<Revision> {
        ctx.check()?;
        let (rev, seq) = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let incoming = attachment_edit(&tx, id, Some(rev), None, Some(filename))?;
            let result = write_revision(&tx, id, &incoming, true)?;
            tx.commit()?;
            Ok(result)
        })?;
        self.notifier.notify(seq);
        Ok(rev)
    }

    /// Reads a local document; the returned revision is the `0-N` counter.
    pub fn get_local(&self, ctx: &Context, id: &str) -> Result<(String, Value)> {
        ctx.check()?;
        self.with_conn(|conn| local::get(conn, id))
    }

    /// Writes a local document.
    pub fn put_local(&self, ctx: &Context, id: &str, body: &Value) -> Result<String> {
        ctx.check()?;
        self.with_conn(|conn| local::put(conn, id, body))
    }

    /// Deletes a local document.
    pub fn delete_local(&self, ctx: &Context, id: &str) -> Result<()> {
        ctx.check()?;
        self.with_conn(|conn| local::delete(conn, id))
    }

    /// Lists all local documents.
    pub fn local_docs(&self, ctx: &Context) -> Result<Vec<(String, String, Value)>> {
        ctx.check()?;
        self.with_conn(|conn| local::list(conn))
    }

    /// Reads changes with `seq > since`.
    pub fn changes(
        &self,
        ctx: &Context,
        since: Seq,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeRow>> {
        ctx.check()?;
        self.with_conn(|conn| changes::changes_batch(conn, since, limit))
    }

    /// The highest assigned sequence.
    pub fn update_seq(&self, ctx: &Context) -> Result<Seq> {
        ctx.check()?;
        self.with_conn(|conn| {
            let seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM docs", [], |row| {
                row.get(0)
            })?;
            Ok(Seq::from_i64(seq))
        })
    }

    /// Drops non-leaf revision bodies and unreferenced attachments.
    ///
    /// The revision DAG itself is retained for replication.
    pub fn compact(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM docs
                 WHERE (id, rev, rev_id) NOT IN (SELECT id, rev, rev_id FROM leaves)",
                [],
            )?;
            tx.execute(
                "DELETE FROM attachments_bridge
                 WHERE (id, rev, rev_id) NOT IN (SELECT id, rev, rev_id FROM docs)",
                [],
            )?;
            let collected = attachments::collect_garbage(&tx)?;
            tx.commit()?;
            debug!(collected, "compaction finished");
            Ok(())
        })
    }

    /// Reads the security object (empty object when unset).
    pub fn security(&self, ctx: &Context) -> Result<Value> {
        ctx.check()?;
        self.with_conn(|conn| {
            use rusqlite::OptionalExtension as _;
            let doc: Option<String> = conn
                .query_row("SELECT doc FROM security WHERE id = 0", [], |row| {
                    row.get(0)
                })
                .optional()?;
            match doc {
                Some(doc) => Ok(serde_json::from_str(&doc)?),
                None => Ok(Value::Object(Map::new())),
            }
        })
    }

    /// Replaces the security object.
    pub fn set_security(&self, ctx: &Context, security: &Value) -> Result<()> {
        ctx.check()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO security (id, doc) VALUES (0, ?1)",
                [serde_json::to_string(security)?],
            )?;
            Ok(())
        })
    }

    /// Database statistics.
    pub fn stats(&self, ctx: &Context) -> Result<DbStats> {
        ctx.check()?;
        self.with_conn(|conn| {
            let doc_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM
                    (SELECT id FROM leaves GROUP BY id HAVING MIN(deleted) = 0)",
                [],
                |row| row.get(0),
            )?;
            let deleted_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM
                    (SELECT id FROM leaves GROUP BY id HAVING MIN(deleted) = 1)",
                [],
                |row| row.get(0),
            )?;
            let update_seq: i64 =
                conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM docs", [], |row| {
                    row.get(0)
                })?;
            Ok(DbStats {
                doc_count: doc_count as u64,
                deleted_count: deleted_count as u64,
                update_seq: Seq::from_i64(update_seq),
            })
        })
    }

    /// Closes the store; later operations fail.
    pub fn close(&self) {
        *self.is_open.write() = false;
    }

    /// Whether the store is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::internal("store is closed"))
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Rejects reserved ids that are not documents of this table.
fn validate_doc_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::bad_request("document ID must not be empty"));
    }
    if id.starts_with('_') && !design::is_design_id(id) {
        return Err(Error::bad_request(format!(
            "only reserved document ids may start with underscore: {id}"
        )));
    }
    Ok(())
}

fn generate_doc_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn generate_rev_id(parent: Option<&Revision>, deleted: bool, body_text: &str) -> String {
    let mut hasher = Md5::new();
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update([u8::from(deleted)]);
    hasher.update(body_text.as_bytes());
    hex(&hasher.finalize())
}

/// Runs every design document's `validate_doc_update` against the write.
fn run_validation(
    tx: &Transaction<'_>,
    id: &str,
    incoming: &IncomingDoc,
    parent: Option<&Revision>,
) -> Result<()> {
    let validators = design::validate_functions(tx)?;
    if validators.is_empty() {
        return Ok(());
    }

    let mut new_doc = Map::new();
    new_doc.insert("_id".into(), Value::String(id.to_owned()));
    if let Some(rev) = &incoming.rev {
        new_doc.insert("_rev".into(), Value::String(rev.to_string()));
    }
    if incoming.deleted {
        new_doc.insert("_deleted".into(), Value::Bool(true));
    }
    for (k, v) in &incoming.body {
        new_doc.insert(k.clone(), v.clone());
    }
    let new_doc = Value::Object(new_doc);

    let old_doc = match parent {
        Some(rev) => match revs::rev_row(tx, id, rev)? {
            Some((_, body, _)) => {
                let mut old = Map::new();
                old.insert("_id".into(), Value::String(id.to_owned()));
                old.insert("_rev".into(), Value::String(rev.to_string()));
                if let Value::Object(fields) = body {
                    old.extend(fields);
                }
                Value::Object(old)
            }
            None => Value::Null,
        },
        None => Value::Null,
    };
    let user_ctx = serde_json::json!({"db": "", "name": null, "roles": []});

    let mut sandbox = Sandbox::new()?;
    for (ddoc_id, source) in validators {
        match sandbox.call_validate(&source, &new_doc, &old_doc, &user_ctx) {
            ValidationOutcome::Ok => {}
            ValidationOutcome::Forbidden(msg) => {
                debug!(%ddoc_id, %msg, "write forbidden by validate function");
                return Err(Error::Forbidden(msg));
            }
            ValidationOutcome::Unauthorized(msg) => return Err(Error::Unauthorized(msg)),
        }
    }
    Ok(())
}

/// The shared write path: conflict checks, revision id assignment, DAG and
/// body insertion, attachment bridging, design-table upkeep.
fn write_revision(
    tx: &Transaction<'_>,
    id: &str,
    incoming: &IncomingDoc,
    new_edits: bool,
) -> Result<(Revision, Seq)> {
    if new_edits {
        write_edit(tx, id, incoming)
    } else {
        write_replicated(tx, id, incoming)
    }
}

fn write_edit(tx: &Transaction<'_>, id: &str, incoming: &IncomingDoc) -> Result<(Revision, Seq)> {
    let winner = winning_doc(tx, id)?;
    let parent = match (&incoming.rev, &winner) {
        (Some(rev), _) => {
            if !revs::is_leaf(tx, id, rev)? {
                return Err(Error::Conflict);
            }
            Some(rev.clone())
        }
        (None, Some(win)) if !win.deleted => return Err(Error::Conflict),
        // A fully deleted document is recreated by extending the tombstone.
        (None, Some(win)) => Some(win.rev.clone()),
        (None, None) => None,
    };

    run_validation(tx, id, incoming, parent.as_ref())?;

    let body_text = serde_json::to_string(&Value::Object(incoming.body.clone()))?;
    let rev = Revision::new(
        parent.as_ref().map_or(1, |p| p.num + 1),
        generate_rev_id(parent.as_ref(), incoming.deleted, &body_text),
    );

    if let Some((seq, _, _)) = revs::rev_row(tx, id, &rev)? {
        // Identical content against the same parent: idempotent.
        return Ok((rev, seq));
    }

    insert_revision(tx, id, &rev, parent.as_ref(), incoming, &body_text)?;
    let seq = Seq::from_i64(tx.last_insert_rowid());

    for att in &incoming.attachments {
        if att.stub {
            let parent = parent
                .as_ref()
                .ok_or_else(|| Error::bad_request("attachment stub without a parent revision"))?;
            attachments::carry_forward(tx, id, parent, &rev, &att.filename)?;
        } else {
            attachments::insert(tx, id, &rev, att)?;
        }
    }

    if design::is_design_id(id) && !incoming.deleted {
        let ddoc = DesignDocument::parse(id, &Value::Object(incoming.body.clone()))?;
        design::write_design_rows(tx, id, &rev, &ddoc)?;
    }

    Ok((rev, seq))
}

fn write_replicated(
    tx: &Transaction<'_>,
    id: &str,
    incoming: &IncomingDoc,
) -> Result<(Revision, Seq)> {
    let leaf = incoming
        .rev
        .clone()
        .ok_or_else(|| Error::bad_request("_rev required when new_edits is false"))?;

    let chain: Vec<Revision> = match &incoming.revisions {
        Some((start, ids)) => {
            if *start != leaf.num || ids.first() != Some(&leaf.id) || ids.len() as u64 > *start {
                return Err(Error::bad_request("invalid _revisions history"));
            }
            ids.iter()
                .enumerate()
                .map(|(i, rev_id)| Revision::new(start - i as u64, rev_id.clone()))
                .collect()
        }
        None => vec![leaf.clone()],
    };

    run_validation(tx, id, incoming, chain.get(1))?;

    // Oldest first so parent rows exist before children reference them.
    for (i, rev) in chain.iter().enumerate().rev() {
        let parent = chain.get(i + 1);
        tx.execute(
            "INSERT OR IGNORE INTO revs (id, rev, rev_id, parent_rev, parent_rev_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id,
                rev.num as i64,
                rev.id,
                parent.map(|p| p.num as i64),
                parent.map(|p| p.id.as_str()),
            ],
        )?;
    }

    if let Some((seq, _, _)) = revs::rev_row(tx, id, &leaf)? {
        return Ok((leaf, seq));
    }

    let body_text = serde_json::to_string(&Value::Object(incoming.body.clone()))?;
    tx.execute(
        "INSERT INTO docs (id, rev, rev_id, doc, md5sum, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id,
            leaf.num as i64,
            leaf.id,
            body_text,
            hex(&Md5::digest(body_text.as_bytes())),
            incoming.deleted,
        ],
    )?;
    let seq = Seq::from_i64(tx.last_insert_rowid());

    for att in &incoming.attachments {
        if att.stub {
            let parent = chain
                .get(1)
                .ok_or_else(|| Error::bad_request("attachment stub without a parent revision"))?;
            attachments::carry_forward(tx, id, parent, &leaf, &att.filename)?;
        } else {
            attachments::insert(tx, id, &leaf, att)?;
        }
    }

    if design::is_design_id(id) && !incoming.deleted {
        let ddoc = DesignDocument::parse(id, &Value::Object(incoming.body.clone()))?;
        design::write_design_rows(tx, id, &leaf, &ddoc)?;
    }

    Ok((leaf, seq))
}

fn insert_revision(
    tx: &Transaction<'_>,
    id: &str,
    rev: &Revision,
    parent: Option<&Revision>,
    incoming: &IncomingDoc,
    body_text: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO revs (id, rev, rev_id, parent_rev, parent_rev_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            id,
            rev.num as i64,
            rev.id,
            parent.map(|p| p.num as i64),
            parent.map(|p| p.id.as_str()),
        ],
    )?;
    tx.execute(
        "INSERT INTO docs (id, rev, rev_id, doc, md5sum, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id,
            rev.num as i64,
            rev.id,
            body_text,
            hex(&Md5::digest(body_text.as_bytes())),
            incoming.deleted,
        ],
    )?;
    Ok(())
}

/// Builds the incoming doc for an attachment add/remove against the current
/// revision: body unchanged, existing attachments carried as stubs.
fn attachment_edit(
    tx: &Transaction<'_>,
    id: &str,
    rev: Option<&Revision>,
    add: Option<IncomingAttachment>,
    remove: Option<&str>,
) -> Result<IncomingDoc> {
    let winner = winning_doc(tx, id)?;
    let (parent, body) = match (&rev, &winner) {
        (Some(rev), Some(_)) => {
            if !revs::is_leaf(tx, id, rev)? {
                return Err(Error::Conflict);
            }
            let (_, body, _) = revs::rev_row(tx, id, rev)?
                .ok_or_else(|| Error::not_found("not found"))?;
            (Some((*rev).clone()), body)
        }
        (None, Some(win)) if !win.deleted => return Err(Error::Conflict),
        (None, _) => (None, Value::Object(Map::new())),
        (Some(_), None) => return Err(Error::Conflict),
    };

    let mut atts: Vec<IncomingAttachment> = match &parent {
        Some(parent_rev) => attachments::for_rev(tx, id, parent_rev)?
            .into_iter()
            .filter(|a| {
                add.as_ref().map_or(true, |new| new.filename != a.filename)
                    && remove.map_or(true, |name| name != a.filename)
            })
            .map(|a| IncomingAttachment {
                filename: a.filename,
                content_type: a.content_type,
                stub: true,
                data: Vec::new(),
            })
            .collect(),
        None => Vec::new(),
    };

    if let Some(name) = remove {
        let parent_rev = parent.as_ref().ok_or_else(|| Error::not_found("not found"))?;
        if attachments::get(tx, id, parent_rev, name)?.is_none() {
            return Err(Error::not_found("attachment not found"));
        }
    }
    if let Some(new) = add {
        atts.push(new);
    }

    let body = match body {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    Ok(IncomingDoc {
        id: Some(id.to_owned()),
        rev: parent,
        deleted: false,
        attachments: atts,
        revisions: None,
        body,
    })
}

/// Resolves and assembles a document read.
fn read_doc(conn: &Connection, id: &str, opts: &GetOptions) -> Result<FullDoc> {
    let (rev, body, deleted, seq) = match &opts.rev {
        Some(requested) => {
            let rev = if opts.latest {
                revs::latest_leaf(conn, id, requested)?.unwrap_or_else(|| requested.clone())
            } else {
                requested.clone()
            };
            let (seq, body, deleted) =
                revs::rev_row(conn, id, &rev)?.ok_or_else(|| Error::not_found("missing"))?;
            (rev, body, deleted, seq)
        }
        None => {
            let win = winning_doc(conn, id)?.ok_or_else(|| Error::not_found("not found"))?;
            if win.deleted {
                return Err(Error::not_found("not found"));
            }
            (win.rev, win.body, win.deleted, win.seq)
        }
    };

    let conflicts = if opts.conflicts {
        revs::conflicting_revs(conn, id, &rev)?
    } else {
        Vec::new()
    };
    let revisions = if opts.revs {
        let mut ids = vec![rev.id.clone()];
        ids.extend(revs::ancestry(conn, id, &rev)?.into_iter().map(|r| r.id));
        Some((rev.num, ids))
    } else {
        None
    };
    let body = match body {
        Value::Object(fields) => fields,
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    };

    Ok(FullDoc {
        id: id.to_owned(),
        rev: rev.clone(),
        deleted,
        attachments: attachments::for_rev(conn, id, &rev)?,
        attachments_inline: opts.attachments,
        body,
        conflicts,
        revisions,
        local_seq: opts.local_seq.then_some(seq.as_u64()),
    })
}
