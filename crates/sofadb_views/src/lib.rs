//! # SofaDB Views
//!
//! The view engine: translates design-document map/reduce functions into
//! materialized SQLite indexes and answers view queries with the full
//! CouchDB option surface.
//!
//! This crate provides:
//! - The per-view index store: map tables collated under CouchDB rules and
//!   a reduce cache keyed by contiguous key ranges
//! - The incremental indexer, driven by the document store's sequence
//!   stream under a per-view lease
//! - The sequence-aware grouping/re-reduce engine
//! - Built-in reducers (`_count`, `_sum`, `_stats`,
//!   `_approx_count_distinct`)
//! - The query planner/executor

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builtins;
mod engine;
mod options;
mod planner;
mod reduce;
mod store;

pub use builtins::BuiltinReducer;
pub use engine::ViewEngine;
pub use options::{QueryOptions, UpdateMode};
pub use planner::{QueryResponse, ViewRow};
pub use reduce::{reduce, ReduceRow, GROUP_FULL, GROUP_NONE};
pub use store::{view_digest, ViewHandle};
