//! # SofaDB
//!
//! A CouchDB-compatible document store persisting JSON documents in
//! SQLite: multi-version documents with a revision DAG, attachments,
//! design documents carrying map/reduce views, selector-based queries and
//! replication-capable bulk operations.
//!
//! [`Database`] is the driver surface transport layers build on; every
//! operation takes a [`Context`] for cancellation and returns either a
//! value or a streaming [`Rows`] iterator.
//!
//! ```no_run
//! use serde_json::json;
//! use sofadb::{Context, Database, QueryOptions};
//!
//! # fn main() -> sofadb::Result<()> {
//! let db = Database::open_in_memory()?;
//! let ctx = Context::background();
//!
//! db.put(&ctx, "_design/foo", &json!({
//!     "views": {"bar": {
//!         "map": "function(doc) { emit(doc._id, null); }",
//!         "reduce": "_count",
//!     }},
//! }))?;
//! db.put(&ctx, "a", &json!({"kind": "couch"}))?;
//!
//! let mut rows = db.query(&ctx, "_design/foo", "_view/bar", &QueryOptions::default())?;
//! while rows.next() {
//!     println!("{}: {}", rows.key_json(), rows.value_json());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod alldocs;
mod changes;
mod database;
mod find;
mod openrevs;
mod rows;

pub use alldocs::AllDocsOptions;
pub use changes::{Change, ChangesFeed, ChangesOptions, Feed};
pub use database::Database;
pub use find::FindOptions;
pub use openrevs::OpenRevsOptions;
pub use rows::{Row, Rows};

pub use sofadb_core::{
    Attachment, BulkResult, Config, Context, DbStats, Error, GetOptions, IncomingAttachment,
    LogRecord, PutOptions, Result, Revision, Seq,
};
pub use sofadb_views::{QueryOptions, UpdateMode};
