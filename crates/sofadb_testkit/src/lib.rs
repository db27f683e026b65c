//! # SofaDB Testkit
//!
//! Test utilities for SofaDB.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - Property-based generators for JSON keys and documents using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sofadb_testkit::with_temp_db;
//!
//! #[test]
//! fn test_with_database() {
//!     with_temp_db(|db, ctx| {
//!         db.put(ctx, "a", &serde_json::json!({})).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

pub use fixtures::{with_file_db, with_temp_db, TestDatabase};
pub use generators::{doc_id_strategy, document_strategy, json_key_strategy};
