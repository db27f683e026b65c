//! The `_find` path: Mango selectors over winning documents.
//!
//! Without secondary Mango indexes, every find is a full scan of the
//! winning revisions; the response carries the same warning CouchDB emits
//! for un-indexed queries.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map, Value};
use sofadb_core::{winning_doc, Context, Error, FullDoc, Result, Store};

use crate::rows::{Row, Rows};

const SCAN_WARNING: &str = "no matching index found, create an index to optimize query time";

/// Options for a selector query.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Maximum documents returned.
    pub limit: Option<u64>,
    /// Documents skipped after sorting.
    pub skip: u64,
    /// Project only these (dotted) fields.
    pub fields: Option<Vec<String>>,
    /// Sort by these (dotted) fields; `true` means descending.
    pub sort: Vec<(String, bool)>,
}

pub(crate) fn find(
    store: &Arc<Store>,
    ctx: &Context,
    selector: &Value,
    options: &FindOptions,
) -> Result<Rows> {
    ctx.check()?;
    let parsed = sofadb_mango::parse(selector).map_err(|e| Error::bad_request(e.to_string()))?;

    let ids: Vec<String> = store.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM leaves GROUP BY id HAVING MIN(deleted) = 0 ORDER BY id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    })?;

    let mut matched: Vec<(String, Value)> = Vec::new();
    for id in ids {
        ctx.check()?;
        if id.starts_with('_') {
            continue;
        }
        let doc = store.with_conn(|conn| {
            let Some(win) = winning_doc(conn, &id)? else {
                return Ok(None);
            };
            if win.deleted {
                return Ok(None);
            }
            let body = match win.body {
                Value::Object(fields) => fields,
                _ => Map::new(),
            };
            Ok(Some(
                FullDoc {
                    id: id.clone(),
                    rev: win.rev.clone(),
                    deleted: false,
                    body,
                    attachments: Vec::new(),
                    attachments_inline: false,
                    conflicts: Vec::new(),
                    revisions: None,
                    local_seq: None,
                }
                .to_value(),
            ))
        })?;
        let Some(doc) = doc else { continue };
        if sofadb_mango::matches(&parsed, &doc) {
            matched.push((id, doc));
        }
    }

    if !options.sort.is_empty() {
        matched.sort_by(|(_, a), (_, b)| sort_cmp(a, b, &options.sort));
    }

    let skip = options.skip as usize;
    let mut matched: Vec<(String, Value)> = matched.into_iter().skip(skip).collect();
    if let Some(limit) = options.limit {
        matched.truncate(limit as usize);
    }

    let rows = matched
        .into_iter()
        .map(|(id, doc)| {
            let doc = match &options.fields {
                Some(fields) => project(&doc, fields),
                None => doc,
            };
            Row {
                id: Some(id),
                key: Value::Null,
                value: Value::Null,
                doc: Some(doc),
                error: None,
            }
        })
        .collect();

    Ok(Rows::new(ctx.clone(), rows).with_warning(Some(SCAN_WARNING.to_owned())))
}

fn sort_cmp(a: &Value, b: &Value, sort: &[(String, bool)]) -> Ordering {
    for (field, descending) in sort {
        let left = lookup(a, field).unwrap_or(&Value::Null);
        let right = lookup(b, field).unwrap_or(&Value::Null);
        let ord = sofadb_collate::collate(left, right, sofadb_collate::Collation::Unicode);
        let ord = if *descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Builds a document containing only the requested fields.
fn project(doc: &Value, fields: &[String]) -> Value {
    let mut out = Map::new();
    for field in fields {
        if let Some(value) = lookup(doc, field) {
            insert_path(&mut out, field, value.clone());
        }
    }
    Value::Object(out)
}

fn insert_path(out: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            out.insert(path.to_owned(), value);
        }
        Some((head, rest)) => {
            let entry = out
                .entry(head.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(nested) = entry {
                insert_path(nested, rest, value);
            }
        }
    }
}
