//! Query planning and execution.
//!
//! Map-only queries range-scan the map table under the view's collation
//! with bounds, direction and paging pushed into SQL. Reduce queries scan
//! the requested range in ascending order, substitute cached pre-reduced
//! rows where the cache covers map rows, run the grouping engine, and
//! apply direction and paging to the grouped output.

use std::cmp::Ordering;

use rusqlite::Connection;
use serde_json::{Map, Value};
use sofadb_collate::{canonical_text, collate_raw, Collation};
use sofadb_core::{
    attachments_for_rev, conflicting_revs, winning_doc, Context, FullDoc, LogRecord, Result, Seq,
    Store,
};
use sofadb_script::{InterpreterPermit, Sandbox};

use crate::builtins::BuiltinReducer;
use crate::engine::{ResolvedView, ViewEngine};
use crate::options::QueryOptions;
use crate::reduce::{reduce, CacheCallback, ReduceRow, GROUP_NONE};
use crate::store::{self, ViewHandle};

/// One response row.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    /// Emitting document id; `None` for reduce rows.
    pub id: Option<String>,
    /// Row key (emitted key, or truncated group key when reducing).
    pub key: Value,
    /// Row value.
    pub value: Value,
    /// The document body, when `include_docs` was requested.
    pub doc: Option<Value>,
}

/// A materialized view response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResponse {
    /// Response rows in output order.
    pub rows: Vec<ViewRow>,
    /// Rows preceding the window in the full result (map queries only).
    pub offset: Option<u64>,
    /// Total map rows in the view (map queries only).
    pub total_rows: Option<u64>,
    /// The view's indexed sequence, when `update_seq` was requested.
    pub update_seq: Option<Seq>,
}

/// The reducer a query runs with, resolved once per query.
enum ViewReducer<'a> {
    Builtin(BuiltinReducer),
    User {
        // Holding a pool permit bounds live interpreters; acquired before
        // the connection lock to keep lock order consistent with the
        // indexer.
        _permit: InterpreterPermit<'a>,
        sandbox: Sandbox,
        source: String,
        store: std::sync::Arc<Store>,
    },
}

impl ViewReducer<'_> {
    fn call(
        &mut self,
        keys: &[(Value, String)],
        values: &[Value],
        rereduce: bool,
    ) -> Result<Vec<Value>> {
        match self {
            Self::Builtin(builtin) => builtin.call(keys, values, rereduce).map(|v| vec![v]),
            Self::User {
                sandbox,
                source,
                store,
                ..
            } => match sandbox.call_reduce(source, keys, values, rereduce) {
                Ok(value) => Ok(vec![value]),
                Err(message) => {
                    store.log_script_failure(LogRecord {
                        doc_id: String::new(),
                        message,
                    });
                    Ok(vec![Value::Null])
                }
            },
        }
    }
}

pub(crate) fn execute(
    engine: &ViewEngine,
    ctx: &Context,
    resolved: &ResolvedView,
    options: &QueryOptions,
) -> Result<QueryResponse> {
    let wants_reduce = options.wants_reduce(resolved.view.reduce.is_some());
    let mut reducer = if wants_reduce {
        let source = resolved.view.reduce.clone().unwrap_or_default();
        Some(match BuiltinReducer::parse(&source) {
            Some(builtin) => ViewReducer::Builtin(builtin),
            None => ViewReducer::User {
                _permit: engine.pool().acquire(),
                sandbox: Sandbox::new()?,
                source,
                store: std::sync::Arc::clone(engine.store()),
            },
        })
    } else {
        None
    };

    engine.store().with_conn(|conn| {
        let handle = store::upsert_view(conn, &resolved.digest, resolved.collation())?;
        match &mut reducer {
            Some(reducer) => exec_reduce(ctx, conn, &handle, options, reducer),
            None => exec_map(ctx, conn, &handle, options),
        }
    })
}

/// One side of the scanned key range, in canonical text.
struct Bound {
    key: String,
    inclusive: bool,
    doc_id: Option<String>,
}

struct Range {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl Range {
    /// Normalizes start/end options to lower/upper bounds; `descending`
    /// swaps start and end semantics, and `inclusive_end` always follows
    /// the `endkey` side.
    fn from_options(options: &QueryOptions) -> Self {
        if let Some(key) = &options.key {
            let text = canonical_text(key);
            return Self {
                lower: Some(Bound {
                    key: text.clone(),
                    inclusive: true,
                    doc_id: None,
                }),
                upper: Some(Bound {
                    key: text,
                    inclusive: true,
                    doc_id: None,
                }),
            };
        }
        let start = options.start_key.as_ref().map(|k| Bound {
            key: canonical_text(k),
            inclusive: true,
            doc_id: options.start_key_doc_id.clone(),
        });
        let end = options.end_key.as_ref().map(|k| Bound {
            key: canonical_text(k),
            inclusive: options.inclusive_end,
            doc_id: options.end_key_doc_id.clone(),
        });
        if options.descending {
            Self {
                lower: end,
                upper: start,
            }
        } else {
            Self {
                lower: start,
                upper: end,
            }
        }
    }

    /// Appends bound conditions to a WHERE clause.
    ///
    /// Document-id refinements only apply while the boundary key itself is
    /// in range; an exclusive bound drops the refinement with the key.
    fn where_clause(&self, params: &mut Vec<String>) -> String {
        let mut sql = String::new();
        if let Some(bound) = &self.lower {
            params.push(bound.key.clone());
            let k = params.len();
            match (&bound.doc_id, bound.inclusive) {
                (_, false) => sql.push_str(&format!(" AND key > ?{k}")),
                (Some(doc_id), true) => {
                    params.push(doc_id.clone());
                    let d = params.len();
                    sql.push_str(&format!(
                        " AND (key > ?{k} OR (key = ?{k} AND id >= ?{d}))"
                    ));
                }
                (None, true) => sql.push_str(&format!(" AND key >= ?{k}")),
            }
        }
        if let Some(bound) = &self.upper {
            params.push(bound.key.clone());
            let k = params.len();
            match (&bound.doc_id, bound.inclusive) {
                (_, false) => sql.push_str(&format!(" AND key < ?{k}")),
                (Some(doc_id), true) => {
                    params.push(doc_id.clone());
                    let d = params.len();
                    sql.push_str(&format!(
                        " AND (key < ?{k} OR (key = ?{k} AND id <= ?{d}))"
                    ));
                }
                (None, true) => sql.push_str(&format!(" AND key <= ?{k}")),
            }
        }
        sql
    }

    fn is_unconstrained(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }
}

/// Rows preceding the scan window in the full view, for the `offset`
/// response field.
fn count_before(
    conn: &Connection,
    handle: &ViewHandle,
    range: &Range,
    descending: bool,
) -> Result<u64> {
    let boundary = if descending { &range.upper } else { &range.lower };
    let Some(bound) = boundary else {
        return Ok(0);
    };
    let op = if descending { ">" } else { "<" };
    let mut params = vec![bound.key.clone()];
    let condition = match (&bound.doc_id, bound.inclusive) {
        (_, false) => format!("key {op}= ?1"),
        (Some(doc_id), true) => {
            params.push(doc_id.clone());
            format!("key {op} ?1 OR (key = ?1 AND id {op} ?2)")
        }
        (None, true) => format!("key {op} ?1"),
    };
    let n: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {condition}",
            handle.map_table()
        ),
        rusqlite::params_from_iter(params.iter()),
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

struct RawRow {
    rowid: i64,
    id: String,
    key: String,
    value: String,
}

fn scan_eq(conn: &Connection, handle: &ViewHandle, key: &str, dir: &str) -> Result<Vec<RawRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT rowid, id, key, value FROM {} WHERE key = ?1 ORDER BY id {dir}",
        handle.map_table()
    ))?;
    let rows = stmt.query_map([key], raw_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        rowid: row.get(0)?,
        id: row.get(1)?,
        key: row.get(2)?,
        value: row.get(3)?,
    })
}

fn exec_map(
    ctx: &Context,
    conn: &Connection,
    handle: &ViewHandle,
    options: &QueryOptions,
) -> Result<QueryResponse> {
    let dir = if options.descending { "DESC" } else { "ASC" };
    let total_rows = store::total_rows(conn, handle)?;
    let mut offset = options.skip;
    let mut raw: Vec<RawRow>;

    if let Some(keys) = &options.keys {
        raw = Vec::new();
        for key in keys {
            ctx.check()?;
            raw.extend(scan_eq(conn, handle, &canonical_text(key), dir)?);
        }
        // Paging over multi-key fetches happens after collection.
        let skip = options.skip as usize;
        raw = raw.into_iter().skip(skip).collect();
        if let Some(limit) = options.limit {
            raw.truncate(limit as usize);
        }
    } else {
        let range = Range::from_options(options);
        let mut params: Vec<String> = Vec::new();
        let where_sql = range.where_clause(&mut params);
        let limit = options.limit.map_or(-1, |l| l as i64);
        let sql = format!(
            "SELECT rowid, id, key, value FROM {map}
             WHERE 1=1{where_sql}
             ORDER BY key {dir}, id {dir}
             LIMIT {limit} OFFSET {skip}",
            map = handle.map_table(),
            skip = options.skip,
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), raw_row)?;
        raw = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        offset += count_before(conn, handle, &range, options.descending)?;
    }

    let mut out = Vec::with_capacity(raw.len());
    for row in raw {
        ctx.check()?;
        let doc = if options.include_docs {
            Some(fetch_doc(
                conn,
                &row.id,
                options.conflicts,
                options.attachments,
            )?)
        } else {
            None
        };
        out.push(ViewRow {
            id: Some(row.id),
            key: store::parse_stored(&row.key)?,
            value: store::parse_stored(&row.value)?,
            doc,
        });
    }

    Ok(QueryResponse {
        rows: out,
        offset: Some(offset),
        total_rows: Some(total_rows),
        update_seq: options
            .update_seq
            .then(|| store::last_seq(conn, handle))
            .transpose()?,
    })
}

/// The current winning body of a row's document, with optional conflicts
/// and inlined attachments.
fn fetch_doc(
    conn: &Connection,
    id: &str,
    conflicts: bool,
    attachments_inline: bool,
) -> Result<Value> {
    let Some(win) = winning_doc(conn, id)? else {
        return Ok(Value::Null);
    };
    if win.deleted {
        return Ok(Value::Null);
    }
    let body = match win.body {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    let conflicts = if conflicts {
        conflicting_revs(conn, id, &win.rev)?
    } else {
        Vec::new()
    };
    Ok(FullDoc {
        id: id.to_owned(),
        rev: win.rev.clone(),
        deleted: false,
        body,
        attachments: attachments_for_rev(conn, id, &win.rev)?,
        attachments_inline,
        conflicts,
        revisions: None,
        local_seq: None,
    }
    .to_value())
}

fn exec_reduce(
    ctx: &Context,
    conn: &Connection,
    handle: &ViewHandle,
    options: &QueryOptions,
    reducer: &mut ViewReducer<'_>,
) -> Result<QueryResponse> {
    let group_level = options.effective_group_level();
    let collation = handle.collation();

    let mut outputs: Vec<ReduceRow> = Vec::new();
    let mut cache_writes: Vec<(String, String, String)> = Vec::new();

    if let Some(keys) = &options.keys {
        // Each requested key reduces independently, in the given order.
        let mut fn_ =
            |k: &[(Value, String)], v: &[Value], re: bool| -> Result<Vec<Value>> {
                reducer.call(k, v, re)
            };
        for key in keys {
            ctx.check()?;
            let rows = scan_eq(conn, handle, &canonical_text(key), "ASC")?
                .into_iter()
                .map(reduce_input)
                .collect::<Result<Vec<_>>>()?;
            outputs.extend(reduce(rows, &mut fn_, group_level, None)?);
        }
    } else {
        let range = Range::from_options(options);
        let use_cache = range.is_unconstrained() && group_level == GROUP_NONE;

        let mut params: Vec<String> = Vec::new();
        let where_sql = range.where_clause(&mut params);
        let sql = format!(
            "SELECT rowid, id, key, value FROM {map}
             WHERE 1=1{where_sql}
             ORDER BY key ASC, id ASC",
            map = handle.map_table(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), raw_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let input = if use_cache {
            let cached = store::cached_within(conn, handle, None, None)?;
            merge_with_cache(raw, cached, collation)?
        } else {
            raw.into_iter()
                .map(reduce_input)
                .collect::<Result<Vec<_>>>()?
        };

        ctx.check()?;
        let mut fn_ =
            |k: &[(Value, String)], v: &[Value], re: bool| -> Result<Vec<Value>> {
                reducer.call(k, v, re)
            };
        if use_cache {
            let mut cb = |_depth: u32,
                          min: &Value,
                          max: &Value,
                          rows: &[ReduceRow],
                          rereduce: bool| {
                // Cache complete raw batches only; single-row batches are
                // not worth a cache entry.
                if rereduce || rows.len() != 1 || rows[0].first == rows[0].last {
                    return;
                }
                cache_writes.push((
                    canonical_text(min),
                    canonical_text(max),
                    canonical_text(&rows[0].value),
                ));
            };
            outputs = reduce(
                input,
                &mut fn_,
                group_level,
                Some(&mut cb as &mut CacheCallback<'_>),
            )?;
        } else {
            outputs = reduce(input, &mut fn_, group_level, None)?;
        }
    }

    for (min_key, max_key, value) in cache_writes {
        store::cache_reduce(conn, handle, &min_key, &max_key, &value)?;
    }

    if options.descending {
        outputs.reverse();
    }
    let skip = options.skip as usize;
    let mut rows: Vec<ViewRow> = outputs
        .into_iter()
        .skip(skip)
        .map(|row| ViewRow {
            id: None,
            key: row.key,
            value: row.value,
            doc: None,
        })
        .collect();
    if let Some(limit) = options.limit {
        rows.truncate(limit as usize);
    }

    Ok(QueryResponse {
        rows,
        offset: None,
        total_rows: None,
        update_seq: options
            .update_seq
            .then(|| store::last_seq(conn, handle))
            .transpose()?,
    })
}

fn reduce_input(row: RawRow) -> Result<ReduceRow> {
    Ok(ReduceRow {
        first: row.rowid,
        last: row.rowid,
        id: row.id,
        key: store::parse_stored(&row.key)?,
        value: store::parse_stored(&row.value)?,
    })
}

/// Substitutes cached pre-reduced rows for the map rows they cover and
/// merges the two streams in key order.
fn merge_with_cache(
    raw: Vec<RawRow>,
    cached: Vec<store::CachedReduce>,
    collation: Collation,
) -> Result<Vec<ReduceRow>> {
    let covered = |key: &str| {
        cached.iter().any(|c| {
            collate_raw(&c.min_key, key, collation) != Ordering::Greater
                && collate_raw(key, &c.max_key, collation) != Ordering::Greater
        })
    };

    let mut out = Vec::with_capacity(raw.len() + cached.len());
    let mut cache_iter = cached.iter().peekable();
    for row in raw {
        while let Some(c) = cache_iter.peek() {
            if collate_raw(&c.min_key, &row.key, collation) == Ordering::Greater {
                break;
            }
            out.push(cached_input(c)?);
            cache_iter.next();
        }
        if covered(&row.key) {
            continue;
        }
        out.push(reduce_input(row)?);
    }
    for c in cache_iter {
        out.push(cached_input(c)?);
    }
    Ok(out)
}

fn cached_input(c: &store::CachedReduce) -> Result<ReduceRow> {
    Ok(ReduceRow {
        first: 0,
        last: 0,
        id: String::new(),
        key: store::parse_stored(&c.min_key)?,
        value: store::parse_stored(&c.value)?,
    })
}
