//! # SofaDB Core
//!
//! The document store: JSON documents with a CouchDB-style revision DAG,
//! attachments, design documents and a sequence-ordered change feed, all
//! persisted in SQLite.
//!
//! This crate provides:
//! - The [`Store`] handle: document CRUD, bulk operations, attachments,
//!   local documents, compaction, security object, stats
//! - Revision parsing and winning-revision computation
//! - The change feed primitives the view indexer consumes
//! - Request-scoped cancellation via [`Context`]
//! - The unified [`Error`] kinds shared across the workspace

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachments;
mod changes;
mod config;
mod context;
mod database;
mod design;
mod doc;
mod error;
mod local;
mod revs;
mod schema;
mod types;

pub use attachments::{content_digest, for_rev as attachments_for_rev, Attachment};
pub use changes::{changes_batch, ChangeRow, CommitNotifier};
pub use config::{Config, LogRecord, LogSink};
pub use context::Context;
pub use database::{BulkResult, DbStats, PutOptions, Store};
pub use design::{
    filter_function, is_design_id, DesignDocument, DesignFunction, FunctionType, ViewDefinition,
};
pub use doc::{parse_incoming, FullDoc, GetOptions, IncomingAttachment, IncomingDoc};
pub use error::{Error, Result};
pub use local::is_local_id;
pub use revs::{
    ancestry as ancestry_of, conflicting_revs, latest_leaf as latest_leaf_of, leaves as leaves_of,
    rev_row as rev_row_of, winning_doc, WinningDoc,
};
pub use types::{Revision, Seq};
