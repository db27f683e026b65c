//! The view engine: leases, the incremental indexer, and query entry.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use serde_json::Value;
use sofadb_collate::Collation;
use sofadb_core::{
    changes_batch, is_design_id, winning_doc, ChangeRow, Context, DesignDocument, Error, FullDoc,
    LogRecord, Result, Store, ViewDefinition,
};
use sofadb_script::{InterpreterPool, Sandbox};
use tracing::{debug, warn};

use crate::options::{QueryOptions, UpdateMode};
use crate::planner::{self, QueryResponse};
use crate::store::{self, view_digest};

/// A view resolved against the current winning design-document revision.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedView {
    pub ddoc: DesignDocument,
    pub view: ViewDefinition,
    pub digest: String,
}

impl ResolvedView {
    pub(crate) fn collation(&self) -> Collation {
        self.ddoc.collation
    }
}

/// Per-view exclusive indexing leases.
///
/// Indexing for a given view is serialized through here; readers are never
/// blocked (they scan whatever is committed).
#[derive(Debug, Default)]
struct Leases {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

struct LeaseGuard {
    leases: Arc<Leases>,
    digest: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.held.lock().remove(&self.digest);
        self.leases.released.notify_all();
    }
}

impl Leases {
    fn acquire(self: &Arc<Self>, digest: &str) -> LeaseGuard {
        let mut held = self.held.lock();
        while held.contains(digest) {
            self.released.wait(&mut held);
        }
        held.insert(digest.to_owned());
        LeaseGuard {
            leases: Arc::clone(self),
            digest: digest.to_owned(),
        }
    }

    fn try_acquire(self: &Arc<Self>, digest: &str) -> Option<LeaseGuard> {
        let mut held = self.held.lock();
        if held.contains(digest) {
            return None;
        }
        held.insert(digest.to_owned());
        Some(LeaseGuard {
            leases: Arc::clone(self),
            digest: digest.to_owned(),
        })
    }
}

/// Materializes view indexes and answers view queries.
pub struct ViewEngine {
    store: Arc<Store>,
    pool: Arc<InterpreterPool>,
    leases: Arc<Leases>,
}

impl ViewEngine {
    /// Creates an engine over a document store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        let pool = Arc::new(InterpreterPool::new(store.config().sandbox_pool_size));
        Self {
            store,
            pool,
            leases: Arc::new(Leases::default()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn pool(&self) -> &Arc<InterpreterPool> {
        &self.pool
    }

    /// Answers a view query with the full option surface.
    pub fn query(
        self: &Arc<Self>,
        ctx: &Context,
        ddoc: &str,
        view: &str,
        options: &QueryOptions,
    ) -> Result<QueryResponse> {
        ctx.check()?;
        let resolved = self
            .store
            .with_conn(|conn| resolve_view(conn, ddoc, view))?;
        options.validate(resolved.view.reduce.is_some())?;

        match options.update {
            UpdateMode::True => self.update_index(ctx, &resolved)?,
            UpdateMode::Lazy => self.spawn_background_build(&resolved),
            UpdateMode::False => {}
        }

        planner::execute(self, ctx, &resolved, options)
    }

    /// Brings a view's index up to the store's current sequence.
    ///
    /// Blocks on the per-view lease if another indexer is running.
    pub(crate) fn update_index(&self, ctx: &Context, resolved: &ResolvedView) -> Result<()> {
        let _lease = self.leases.acquire(&resolved.digest);
        self.build(ctx, resolved)
    }

    /// `update=lazy`: schedule a background build unless one is running.
    fn spawn_background_build(self: &Arc<Self>, resolved: &ResolvedView) {
        let Some(lease) = self.leases.try_acquire(&resolved.digest) else {
            return;
        };
        let engine = Arc::clone(self);
        let resolved = resolved.clone();
        thread::spawn(move || {
            let _lease = lease;
            if let Err(err) = engine.build(&Context::background(), &resolved) {
                warn!(digest = %resolved.digest, %err, "background index build failed");
            }
        });
    }

    /// The indexing loop: streams changes past `last_seq`, maps winning
    /// bodies in the sandbox, and commits per batch atomically with the
    /// `last_seq` advance.
    fn build(&self, ctx: &Context, resolved: &ResolvedView) -> Result<()> {
        let batch_size = self.store.config().indexer_batch.max(1);
        let _permit = self.pool.acquire();
        let mut sandbox = Sandbox::new()?;

        // Indexes whose defining view no longer exists are dropped here,
        // the only place that runs with a lease held.
        self.store.with_conn(|conn| {
            let live = live_digests(conn)?;
            let dropped = store::prune_orphans(conn, &live)?;
            if dropped > 0 {
                debug!(dropped, "pruned obsolete view indexes");
            }
            Ok(())
        })?;

        loop {
            ctx.check()?;
            let applied = self.store.with_conn(|conn| {
                let tx = conn.transaction()?;
                let handle = store::upsert_view(&tx, &resolved.digest, resolved.collation())?;
                let last = store::last_seq(&tx, &handle)?;
                let changes = changes_batch(&tx, last, Some(batch_size))?;
                for change in &changes {
                    let emissions = self.map_change(&tx, &mut sandbox, resolved, change)?;
                    store::replace_emissions(&tx, &handle, &change.id, &emissions)?;
                    store::set_last_seq(&tx, &handle, change.seq)?;
                }
                tx.commit()?;
                Ok(changes.len())
            })?;
            if applied < batch_size {
                return Ok(());
            }
        }
    }

    /// Computes the emissions for one change: the winning body mapped in
    /// the sandbox, or nothing for deletions and excluded documents.
    fn map_change(
        &self,
        conn: &Connection,
        sandbox: &mut Sandbox,
        resolved: &ResolvedView,
        change: &ChangeRow,
    ) -> Result<Vec<(Value, Value)>> {
        let Some(win) = winning_doc(conn, &change.id)? else {
            return Ok(Vec::new());
        };
        if win.deleted {
            return Ok(Vec::new());
        }
        if is_design_id(&change.id) && !resolved.ddoc.include_design {
            return Ok(Vec::new());
        }

        let body = match win.body {
            Value::Object(fields) => fields,
            _ => serde_json::Map::new(),
        };
        let doc = FullDoc {
            id: change.id.clone(),
            rev: win.rev.clone(),
            deleted: false,
            body,
            attachments: sofadb_core::attachments_for_rev(conn, &change.id, &win.rev)?,
            attachments_inline: false,
            conflicts: Vec::new(),
            revisions: None,
            local_seq: resolved.ddoc.local_seq.then_some(win.seq.as_u64()),
        }
        .to_value();

        let outcome = sandbox.call_map(&resolved.view.map, &doc);
        if let Some(message) = outcome.failure {
            self.store.log_script_failure(LogRecord {
                doc_id: change.id.clone(),
                message,
            });
            return Ok(Vec::new());
        }
        Ok(outcome.pairs)
    }
}

impl std::fmt::Debug for ViewEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewEngine")
            .field("pool_capacity", &self.pool.capacity())
            .finish_non_exhaustive()
    }
}

/// Looks up `(ddoc, view)` on the winning design revision.
pub(crate) fn resolve_view(conn: &Connection, ddoc: &str, view: &str) -> Result<ResolvedView> {
    let ddoc_id = if is_design_id(ddoc) {
        ddoc.to_owned()
    } else {
        format!("_design/{ddoc}")
    };
    let view_name = view.strip_prefix("_view/").unwrap_or(view);

    let win = winning_doc(conn, &ddoc_id)?.ok_or_else(|| Error::not_found("missing"))?;
    if win.deleted {
        return Err(Error::not_found("missing"));
    }
    let parsed = DesignDocument::parse(&ddoc_id, &win.body)?;
    let view = parsed
        .view(view_name)
        .cloned()
        .ok_or_else(|| Error::not_found("missing named view"))?;
    let digest = view_digest(&view.map, view.reduce.as_deref(), parsed.collation);
    Ok(ResolvedView {
        ddoc: parsed,
        view,
        digest,
    })
}

/// Digests of every view on every winning design revision.
fn live_digests(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT id FROM docs WHERE id LIKE '\\_design/%' ESCAPE '\\'",
    )?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut out = Vec::new();
    for id in ids {
        let Some(win) = winning_doc(conn, &id)? else {
            continue;
        };
        if win.deleted {
            continue;
        }
        let Ok(parsed) = DesignDocument::parse(&id, &win.body) else {
            continue;
        };
        for view in &parsed.views {
            out.push(view_digest(
                &view.map,
                view.reduce.as_deref(),
                parsed.collation,
            ));
        }
    }
    Ok(out)
}
