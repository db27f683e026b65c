//! The driver facade.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use sofadb_core::{
    is_local_id, Attachment, BulkResult, Config, Context, DbStats, GetOptions,
    IncomingAttachment, PutOptions, Result, Revision, Seq, Store,
};
use sofadb_views::{QueryOptions, ViewEngine};

use crate::alldocs::{self, AllDocsOptions, DocSet};
use crate::changes::{ChangesFeed, ChangesOptions};
use crate::find::{self, FindOptions};
use crate::openrevs::{self, OpenRevsOptions};
use crate::rows::{Row, Rows};

/// A database handle: the document store plus its view engine.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Debug, Clone)]
pub struct Database {
    store: Arc<Store>,
    views: Arc<ViewEngine>,
}

impl Database {
    fn wrap(store: Store) -> Self {
        let store = Arc::new(store);
        let views = Arc::new(ViewEngine::new(Arc::clone(&store)));
        Self { store, views }
    }

    /// Opens (creating if necessary) a database file.
    pub fn open(path: &Path, config: Config) -> Result<Self> {
        Ok(Self::wrap(Store::open(path, config)?))
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::wrap(Store::open_in_memory()?))
    }

    /// Opens an in-memory database with custom configuration.
    pub fn open_in_memory_with_config(config: Config) -> Result<Self> {
        Ok(Self::wrap(Store::open_in_memory_with_config(config)?))
    }

    /// The underlying document store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Writes a document; the revision comes from the body's `_rev`.
    pub fn put(&self, ctx: &Context, id: &str, body: &Value) -> Result<String> {
        self.put_with(ctx, id, body, PutOptions::default())
    }

    /// Writes a document with explicit options.
    pub fn put_with(
        &self,
        ctx: &Context,
        id: &str,
        body: &Value,
        opts: PutOptions,
    ) -> Result<String> {
        if is_local_id(id) {
            return self.store.put_local(ctx, id, body);
        }
        Ok(self.store.put(ctx, id, body, opts)?.to_string())
    }

    /// Reads a document's current body and revision.
    pub fn get(&self, ctx: &Context, id: &str) -> Result<(Value, String)> {
        self.get_with(ctx, id, &GetOptions::default())
    }

    /// Reads a document with explicit options.
    pub fn get_with(
        &self,
        ctx: &Context,
        id: &str,
        opts: &GetOptions,
    ) -> Result<(Value, String)> {
        if is_local_id(id) {
            let (rev, body) = self.store.get_local(ctx, id)?;
            return Ok((body, rev));
        }
        let doc = self.store.get(ctx, id, opts)?;
        let rev = doc.rev.to_string();
        Ok((doc.to_value(), rev))
    }

    /// The winning revision of a document.
    pub fn get_rev(&self, ctx: &Context, id: &str) -> Result<String> {
        if is_local_id(id) {
            return Ok(self.store.get_local(ctx, id)?.0);
        }
        Ok(self.store.get_rev(ctx, id)?.to_string())
    }

    /// Deletes a document, writing a tombstone revision.
    pub fn delete(&self, ctx: &Context, id: &str, rev: &str) -> Result<String> {
        if is_local_id(id) {
            let (rev, _) = self.store.get_local(ctx, id)?;
            self.store.delete_local(ctx, id)?;
            return Ok(rev);
        }
        let rev = Revision::parse(rev)?;
        Ok(self.store.delete(ctx, id, &rev)?.to_string())
    }

    /// Applies a batch of writes; `new_edits = false` accepts replicated
    /// revisions verbatim.
    pub fn bulk_docs(
        &self,
        ctx: &Context,
        docs: &[Value],
        new_edits: bool,
    ) -> Result<Vec<BulkResult>> {
        self.store.bulk_docs(ctx, docs, new_edits)
    }

    /// Reads one attachment.
    pub fn get_attachment(
        &self,
        ctx: &Context,
        id: &str,
        filename: &str,
        rev: Option<&str>,
    ) -> Result<Attachment> {
        let rev = rev.map(Revision::parse).transpose()?;
        self.store.get_attachment(ctx, id, filename, rev.as_ref())
    }

    /// Adds or replaces one attachment, creating a new revision.
    pub fn put_attachment(
        &self,
        ctx: &Context,
        id: &str,
        rev: Option<&str>,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String> {
        let rev = rev.map(Revision::parse).transpose()?;
        let att = IncomingAttachment {
            filename: filename.to_owned(),
            content_type: content_type.to_owned(),
            stub: false,
            data,
        };
        Ok(self
            .store
            .put_attachment(ctx, id, rev.as_ref(), att)?
            .to_string())
    }

    /// Removes one attachment, creating a new revision.
    pub fn delete_attachment(
        &self,
        ctx: &Context,
        id: &str,
        filename: &str,
        rev: &str,
    ) -> Result<String> {
        let rev = Revision::parse(rev)?;
        Ok(self
            .store
            .delete_attachment(ctx, id, filename, &rev)?
            .to_string())
    }

    /// Queries a design-document view. The core of the driver surface.
    pub fn query(
        &self,
        ctx: &Context,
        ddoc: &str,
        view: &str,
        options: &QueryOptions,
    ) -> Result<Rows> {
        let resp = self.views.query(ctx, ddoc, view, options)?;
        let rows = resp
            .rows
            .into_iter()
            .map(|r| Row {
                id: r.id,
                key: r.key,
                value: r.value,
                doc: r.doc,
                error: None,
            })
            .collect();
        Ok(Rows::new(ctx.clone(), rows)
            .with_offset(resp.offset)
            .with_total_rows(resp.total_rows)
            .with_update_seq(resp.update_seq))
    }

    /// Lists all live documents by id.
    pub fn all_docs(&self, ctx: &Context, options: &AllDocsOptions) -> Result<Rows> {
        alldocs::list(&self.store, ctx, options, DocSet::All)
    }

    /// Lists design documents.
    pub fn design_docs(&self, ctx: &Context, options: &AllDocsOptions) -> Result<Rows> {
        alldocs::list(&self.store, ctx, options, DocSet::Design)
    }

    /// Lists local documents.
    pub fn local_docs(&self, ctx: &Context, options: &AllDocsOptions) -> Result<Rows> {
        alldocs::list(&self.store, ctx, options, DocSet::Local)
    }

    /// Opens the change feed.
    pub fn changes(&self, ctx: &Context, options: &ChangesOptions) -> Result<ChangesFeed> {
        ChangesFeed::open(Arc::clone(&self.store), ctx.clone(), options.clone())
    }

    /// Runs a Mango selector over the database.
    pub fn find(&self, ctx: &Context, selector: &Value, options: &FindOptions) -> Result<Rows> {
        find::find(&self.store, ctx, selector, options)
    }

    /// Fetches multiple revisions of one document, for replication.
    pub fn open_revs(
        &self,
        ctx: &Context,
        id: &str,
        revs: &[String],
        options: &OpenRevsOptions,
    ) -> Result<Rows> {
        openrevs::open_revs(&self.store, ctx, id, revs, options)
    }

    /// Reads the security object.
    pub fn security(&self, ctx: &Context) -> Result<Value> {
        self.store.security(ctx)
    }

    /// Replaces the security object.
    pub fn set_security(&self, ctx: &Context, security: &Value) -> Result<()> {
        self.store.set_security(ctx, security)
    }

    /// Compacts the database: drops non-leaf bodies and unreferenced
    /// attachments.
    pub fn compact(&self, ctx: &Context) -> Result<()> {
        self.store.compact(ctx)
    }

    /// Database statistics.
    pub fn stats(&self, ctx: &Context) -> Result<DbStats> {
        self.store.stats(ctx)
    }

    /// The highest assigned sequence.
    pub fn update_seq(&self, ctx: &Context) -> Result<Seq> {
        self.store.update_seq(ctx)
    }

    /// Closes the database; later operations fail.
    pub fn close(&self) {
        self.store.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn facade_put_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        let rev = db.put(&ctx, "a", &json!({"n": 1})).unwrap();
        let (body, got_rev) = db.get(&ctx, "a").unwrap();
        assert_eq!(got_rev, rev);
        assert_eq!(body["n"], json!(1));
        assert_eq!(body["_id"], json!("a"));
    }

    #[test]
    fn facade_routes_local_docs() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        let rev = db.put(&ctx, "_local/cfg", &json!({"n": 1})).unwrap();
        assert_eq!(rev, "0-1");
        let (body, rev) = db.get(&ctx, "_local/cfg").unwrap();
        assert_eq!(rev, "0-1");
        assert_eq!(body, json!({"n": 1}));
        let deleted_rev = db.delete(&ctx, "_local/cfg", "0-1").unwrap();
        assert_eq!(deleted_rev, "0-1");
        assert!(db.get(&ctx, "_local/cfg").is_err());
    }

    #[test]
    fn delete_requires_valid_rev() {
        let db = Database::open_in_memory().unwrap();
        let ctx = Context::background();
        db.put(&ctx, "a", &json!({})).unwrap();
        assert!(db.delete(&ctx, "a", "garbage").is_err());
    }
}
