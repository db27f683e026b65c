//! `open_revs`: multi-revision fetches for replication.
//!
//! A replicator asks for specific revisions (or `all` leaves) of one
//! document and receives each as its own row, tombstones included.
//! Requested revisions that do not exist come back as per-row errors
//! rather than failing the fetch.

use std::sync::Arc;

use serde_json::{Map, Value};
use sofadb_core::{
    attachments_for_rev, winning_doc, Context, Error, Result, Revision, Store,
};

use crate::rows::{Row, Rows};

/// Options for a multi-revision fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenRevsOptions {
    /// Resolve each requested revision to its newest non-deleted leaf.
    pub latest: bool,
    /// Include the `_revisions` ancestry in each document.
    pub revs: bool,
}

pub(crate) fn open_revs(
    store: &Arc<Store>,
    ctx: &Context,
    id: &str,
    revs: &[String],
    options: &OpenRevsOptions,
) -> Result<Rows> {
    ctx.check()?;
    store.with_conn(|conn| {
        let targets: Vec<Revision> = if revs.is_empty() {
            // The winning revision, tombstone or not.
            match winning_doc(conn, id)? {
                Some(win) => vec![win.rev],
                None => Vec::new(),
            }
        } else if revs.len() == 1 && revs[0] == "all" {
            sofadb_core::leaves_of(conn, id)?
                .into_iter()
                .map(|(rev, _)| rev)
                .collect()
        } else {
            revs.iter()
                .map(|r| {
                    Revision::parse(r)
                        .map_err(|_| Error::bad_request("invalid rev format"))
                })
                .collect::<Result<Vec<_>>>()?
        };

        if targets.is_empty() {
            return Err(Error::not_found("missing"));
        }

        let mut rows = Vec::with_capacity(targets.len());
        for requested in targets {
            ctx.check()?;
            let rev = if options.latest {
                sofadb_core::latest_leaf_of(conn, id, &requested)?.unwrap_or(requested)
            } else {
                requested
            };
            let Some((_, body, deleted)) = sofadb_core::rev_row_of(conn, id, &rev)? else {
                rows.push(Row {
                    id: Some(id.to_owned()),
                    key: Value::Null,
                    value: Value::Null,
                    doc: None,
                    error: Some("missing".into()),
                });
                continue;
            };
            let fields = match body {
                Value::Object(fields) => fields,
                _ => Map::new(),
            };
            let revisions = if options.revs {
                let mut ids = vec![rev.id.clone()];
                ids.extend(
                    sofadb_core::ancestry_of(conn, id, &rev)?
                        .into_iter()
                        .map(|r| r.id),
                );
                Some((rev.num, ids))
            } else {
                None
            };
            let doc = sofadb_core::FullDoc {
                id: id.to_owned(),
                rev: rev.clone(),
                deleted,
                body: fields,
                attachments: attachments_for_rev(conn, id, &rev)?,
                attachments_inline: false,
                conflicts: Vec::new(),
                revisions,
                local_seq: None,
            }
            .to_value();
            rows.push(Row {
                id: Some(id.to_owned()),
                key: Value::Null,
                value: Value::Null,
                doc: Some(doc),
                error: None,
            });
        }
        Ok(Rows::new(ctx.clone(), rows))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    #[test]
    fn default_returns_winning_rev() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        let rev = db.put(&ctx, "a", &json!({"v": 1})).unwrap();

        let mut rows = db
            .open_revs(&ctx, "a", &[], &OpenRevsOptions::default())
            .unwrap();
        let collected = rows.collect_rows().unwrap();
        assert_eq!(collected.len(), 1);
        let doc = collected[0].doc.as_ref().unwrap();
        assert_eq!(doc["_rev"], json!(rev));
    }

    #[test]
    fn all_returns_every_leaf_including_tombstones() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        // Two conflicting branches via replication-style writes.
        db.bulk_docs(
            &ctx,
            &[json!({"_id": "a", "_rev": "1-aaa", "v": 1})],
            false,
        )
        .unwrap();
        db.bulk_docs(
            &ctx,
            &[json!({"_id": "a", "_rev": "1-bbb", "v": 2})],
            false,
        )
        .unwrap();

        let mut rows = db
            .open_revs(
                &ctx,
                "a",
                &["all".to_owned()],
                &OpenRevsOptions::default(),
            )
            .unwrap();
        let collected = rows.collect_rows().unwrap();
        assert_eq!(collected.len(), 2);
    }

    #[test]
    fn missing_revisions_become_row_errors() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        let rev = db.put(&ctx, "a", &json!({})).unwrap();

        let mut rows = db
            .open_revs(
                &ctx,
                "a",
                &[rev, "9-nope".to_owned()],
                &OpenRevsOptions::default(),
            )
            .unwrap();
        let collected = rows.collect_rows().unwrap();
        assert_eq!(collected.len(), 2);
        assert!(collected[0].error.is_none());
        assert_eq!(collected[1].error.as_deref(), Some("missing"));
    }

    #[test]
    fn missing_document_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        let err = db
            .open_revs(&ctx, "ghost", &[], &OpenRevsOptions::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn revs_option_includes_ancestry() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        let rev1 = db.put(&ctx, "a", &json!({"v": 1})).unwrap();
        let rev2 = db
            .put(&ctx, "a", &json!({"_rev": rev1, "v": 2}))
            .unwrap();

        let mut opts = OpenRevsOptions::default();
        opts.revs = true;
        let mut rows = db.open_revs(&ctx, "a", &[rev2], &opts).unwrap();
        let collected = rows.collect_rows().unwrap();
        let revisions = &collected[0].doc.as_ref().unwrap()["_revisions"];
        assert_eq!(revisions["start"], json!(2));
        assert_eq!(revisions["ids"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn latest_follows_descendants() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        let rev1 = db.put(&ctx, "a", &json!({"v": 1})).unwrap();
        let rev2 = db
            .put(&ctx, "a", &json!({"_rev": rev1.clone(), "v": 2}))
            .unwrap();

        let mut opts = OpenRevsOptions::default();
        opts.latest = true;
        let mut rows = db.open_revs(&ctx, "a", &[rev1], &opts).unwrap();
        let collected = rows.collect_rows().unwrap();
        assert_eq!(
            collected[0].doc.as_ref().unwrap()["_rev"],
            json!(rev2)
        );
    }
}
