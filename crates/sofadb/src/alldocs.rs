//! `_all_docs`, `_design_docs` and `_local_docs` listings.
//!
//! Documents list by id in byte order (ids are not collated like view
//! keys). Each row's value carries the winning revision; `include_docs`
//! attaches the body.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use sofadb_core::{
    attachments_for_rev, conflicting_revs, is_design_id, winning_doc, Context, FullDoc, Result,
    Store,
};

use crate::rows::{Row, Rows};

/// Which document set to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DocSet {
    /// Every live document, design documents included.
    All,
    /// `_design/*` only.
    Design,
    /// `_local/*` only.
    Local,
}

/// Options for the id-ordered listings.
#[derive(Debug, Clone)]
pub struct AllDocsOptions {
    /// Restrict to one id.
    pub key: Option<String>,
    /// Restrict to listed ids, in the given order.
    pub keys: Option<Vec<String>>,
    /// Inclusive range start.
    pub start_key: Option<String>,
    /// Range end.
    pub end_key: Option<String>,
    /// Whether `end_key` itself is included.
    pub inclusive_end: bool,
    /// Reverse order; swaps start/end semantics.
    pub descending: bool,
    /// Row cap.
    pub limit: Option<u64>,
    /// Rows skipped.
    pub skip: u64,
    /// Attach document bodies.
    pub include_docs: bool,
    /// Include `_conflicts` in attached bodies.
    pub conflicts: bool,
    /// Inline attachment data in attached bodies.
    pub attachments: bool,
    /// Report the database's update sequence.
    pub update_seq: bool,
}

impl Default for AllDocsOptions {
    fn default() -> Self {
        Self {
            key: None,
            keys: None,
            start_key: None,
            end_key: None,
            inclusive_end: true,
            descending: false,
            limit: None,
            skip: 0,
            include_docs: false,
            conflicts: false,
            attachments: false,
            update_seq: false,
        }
    }
}

pub(crate) fn list(
    store: &Arc<Store>,
    ctx: &Context,
    options: &AllDocsOptions,
    set: DocSet,
) -> Result<Rows> {
    ctx.check()?;
    let update_seq = if options.update_seq {
        Some(store.update_seq(ctx)?)
    } else {
        None
    };

    if set == DocSet::Local {
        return list_local(store, ctx, options, update_seq);
    }

    let candidates: Vec<String> = store.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM leaves GROUP BY id HAVING MIN(deleted) = 0 ORDER BY id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    })?;

    let mut ids: Vec<String> = candidates
        .into_iter()
        .filter(|id| match set {
            DocSet::Design => is_design_id(id),
            _ => true,
        })
        .collect();
    let total = ids.len() as u64;

    if options.descending {
        ids.reverse();
    }
    let (ids, offset) = window(ids, options);

    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        ctx.check()?;
        let row = store.with_conn(|conn| {
            let Some(win) = winning_doc(conn, &id)? else {
                return Ok(None);
            };
            if win.deleted {
                return Ok(None);
            }
            let doc = if options.include_docs {
                let body = match win.body {
                    Value::Object(fields) => fields,
                    _ => Map::new(),
                };
                let conflicts = if options.conflicts {
                    conflicting_revs(conn, &id, &win.rev)?
                } else {
                    Vec::new()
                };
                Some(
                    FullDoc {
                        id: id.clone(),
                        rev: win.rev.clone(),
                        deleted: false,
                        body,
                        attachments: attachments_for_rev(conn, &id, &win.rev)?,
                        attachments_inline: options.attachments,
                        conflicts,
                        revisions: None,
                        local_seq: None,
                    }
                    .to_value(),
                )
            } else {
                None
            };
            Ok(Some(Row {
                id: Some(id.clone()),
                key: json!(id),
                value: json!({"rev": win.rev.to_string()}),
                doc,
                error: None,
            }))
        })?;
        if let Some(row) = row {
            rows.push(row);
        }
    }

    Ok(Rows::new(ctx.clone(), rows)
        .with_total_rows(Some(total))
        .with_offset(Some(offset))
        .with_update_seq(update_seq))
}

fn list_local(
    store: &Arc<Store>,
    ctx: &Context,
    options: &AllDocsOptions,
    update_seq: Option<sofadb_core::Seq>,
) -> Result<Rows> {
    let all = store.local_docs(ctx)?;
    let total = all.len() as u64;
    let mut ids: Vec<(String, String, Value)> = all;
    if options.descending {
        ids.reverse();
    }
    let keep: Vec<String> = ids.iter().map(|(id, _, _)| id.clone()).collect();
    let (kept, offset) = window(keep, options);

    let rows = ids
        .into_iter()
        .filter(|(id, _, _)| kept.contains(id))
        .map(|(id, rev, doc)| Row {
            id: Some(id.clone()),
            key: json!(id),
            value: json!({"rev": rev}),
            doc: options.include_docs.then_some(doc),
            error: None,
        })
        .collect();

    Ok(Rows::new(ctx.clone(), rows)
        .with_total_rows(Some(total))
        .with_offset(Some(offset))
        .with_update_seq(update_seq))
}

/// Applies key/range/paging options to an ordered id list, returning the
/// window plus the number of rows preceding it.
fn window(ids: Vec<String>, options: &AllDocsOptions) -> (Vec<String>, u64) {
    if let Some(keys) = &options.keys {
        let out: Vec<String> = keys.iter().filter(|k| ids.contains(k)).cloned().collect();
        return (paged(out, options).0, options.skip);
    }
    if let Some(key) = &options.key {
        let out: Vec<String> = ids.into_iter().filter(|id| id == key).collect();
        return (paged(out, options).0, options.skip);
    }

    let descending = options.descending;
    let in_lower = |id: &str| -> bool {
        let bound = if descending {
            &options.end_key
        } else {
            &options.start_key
        };
        match bound {
            None => true,
            Some(b) if descending && !options.inclusive_end => id > b.as_str(),
            Some(b) => id >= b.as_str(),
        }
    };
    let in_upper = |id: &str| -> bool {
        let bound = if descending {
            &options.start_key
        } else {
            &options.end_key
        };
        match bound {
            None => true,
            Some(b) if !descending && !options.inclusive_end => id < b.as_str(),
            Some(b) => id <= b.as_str(),
        }
    };

    let mut before = 0u64;
    let mut in_range = Vec::new();
    for id in ids {
        if !in_lower(&id) && !descending || !in_upper(&id) && descending {
            before += 1;
            continue;
        }
        if in_lower(&id) && in_upper(&id) {
            in_range.push(id);
        }
    }

    let (out, skipped) = paged(in_range, options);
    (out, before + skipped)
}

fn paged(ids: Vec<String>, options: &AllDocsOptions) -> (Vec<String>, u64) {
    let skip = options.skip.min(ids.len() as u64);
    let mut out: Vec<String> = ids.into_iter().skip(skip as usize).collect();
    if let Some(limit) = options.limit {
        out.truncate(limit as usize);
    }
    (out, skip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    fn db_with_docs(ids: &[&str]) -> Database {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        for id in ids {
            db.put(&ctx, id, &json!({"me": *id})).unwrap();
        }
        db
    }

    #[test]
    fn lists_live_docs_in_id_order() {
        let db = db_with_docs(&["c", "a", "b"]);
        let ctx = Context::background();
        let mut rows = db.all_docs(&ctx, &AllDocsOptions::default()).unwrap();
        let collected = rows.collect_rows().unwrap();
        let ids: Vec<_> = collected.iter().map(|r| r.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(collected[0].value["rev"].as_str().unwrap().starts_with("1-"));
    }

    #[test]
    fn deleted_docs_are_absent() {
        let db = db_with_docs(&["a", "b"]);
        let ctx = Context::background();
        let rev = db.get_rev(&ctx, "a").unwrap();
        db.delete(&ctx, "a", &rev).unwrap();

        let mut rows = db.all_docs(&ctx, &AllDocsOptions::default()).unwrap();
        let ids: Vec<_> = rows
            .collect_rows()
            .unwrap()
            .into_iter()
            .map(|r| r.id.unwrap())
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn range_descending_and_paging() {
        let db = db_with_docs(&["a", "b", "c", "d"]);
        let ctx = Context::background();

        let mut opts = AllDocsOptions::default();
        opts.start_key = Some("b".into());
        opts.end_key = Some("c".into());
        let mut rows = db.all_docs(&ctx, &opts).unwrap();
        assert_eq!(rows.offset(), Some(1));
        let collected = rows.collect_rows().unwrap();
        assert_eq!(collected.len(), 2);

        let mut opts = AllDocsOptions::default();
        opts.descending = true;
        opts.limit = Some(2);
        let mut rows = db.all_docs(&ctx, &opts).unwrap();
        let ids: Vec<_> = rows
            .collect_rows()
            .unwrap()
            .into_iter()
            .map(|r| r.id.unwrap())
            .collect();
        assert_eq!(ids, vec!["d", "c"]);
    }

    #[test]
    fn design_docs_filter() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        db.put(&ctx, "a", &json!({})).unwrap();
        db.put(&ctx, "_design/foo", &json!({"views": {}})).unwrap();

        let mut rows = db.design_docs(&ctx, &AllDocsOptions::default()).unwrap();
        let ids: Vec<_> = rows
            .collect_rows()
            .unwrap()
            .into_iter()
            .map(|r| r.id.unwrap())
            .collect();
        assert_eq!(ids, vec!["_design/foo"]);

        // _all_docs includes design docs.
        let mut rows = db.all_docs(&ctx, &AllDocsOptions::default()).unwrap();
        assert_eq!(rows.collect_rows().unwrap().len(), 2);
    }

    #[test]
    fn local_docs_listing() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        db.put(&ctx, "_local/cfg", &json!({"x": 1})).unwrap();
        db.put(&ctx, "a", &json!({})).unwrap();

        let mut opts = AllDocsOptions::default();
        opts.include_docs = true;
        let mut rows = db.local_docs(&ctx, &opts).unwrap();
        let collected = rows.collect_rows().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].id.as_deref(), Some("_local/cfg"));
        assert_eq!(collected[0].doc.as_ref().unwrap()["x"], json!(1));
    }

    #[test]
    fn include_docs_attaches_bodies() {
        let db = db_with_docs(&["a"]);
        let ctx = Context::background();
        let mut opts = AllDocsOptions::default();
        opts.include_docs = true;
        let mut rows = db.all_docs(&ctx, &opts).unwrap();
        let collected = rows.collect_rows().unwrap();
        let doc = collected[0].doc.as_ref().unwrap();
        assert_eq!(doc["me"], json!("a"));
    }
}
