//! # SofaDB Mango
//!
//! The Mango selector language: a JSON query syntax evaluated against
//! document bodies. Used by the `_find` path; the view engine does not
//! depend on it.
//!
//! Selectors parse into a tree of combination selectors (`$and`, `$or`,
//! `$nor`, `$not`), field selectors (dotted paths), condition selectors
//! (`$eq`, `$lt`, `$regex`, ...), and element selectors (`$elemMatch`,
//! `$allMatch`, `$keyMapMatch`). Implicit `$and` applies at the top level
//! and implicit `$eq` applies to scalar field values. Range operators
//! compare under CouchDB collation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ast;
mod eval;
mod parse;

pub use ast::{Condition, JsonType, Selector};
pub use eval::matches;
pub use parse::parse;

use thiserror::Error;

/// Errors raised while parsing a selector.
#[derive(Debug, Error)]
pub enum MangoError {
    /// A condition object carried more than one operator key.
    #[error("too many keys in object")]
    TooManyKeys,

    /// An unrecognized `$`-prefixed operator.
    #[error("unknown mango operator '{0}'")]
    UnknownOperator(String),

    /// Structurally invalid selector.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// `$regex` with an invalid pattern.
    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),
}

/// Result alias for selector parsing.
pub type MangoResult<T> = Result<T, MangoError>;
