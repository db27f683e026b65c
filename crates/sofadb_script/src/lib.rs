//! Sandboxed JavaScript execution for design-document functions.
//!
//! Map, reduce, filter and validate functions from design documents run in
//! an embedded ECMAScript interpreter with a deterministic API surface: no
//! filesystem, network or process access, `Date.now` pinned to a fixed
//! epoch, and `Math.random` backed by a seeded generator. Script failures
//! are isolated per document / per reduce group and never propagate as
//! errors; callers receive the failure message and decide where to log it.
//!
//! Interpreters are thread-bound, so concurrency is limited by an
//! [`InterpreterPool`] semaphore rather than by sharing interpreter objects
//! across threads. Within one [`Sandbox`], functions are compiled once per
//! source and reused across invocations.
//!
//! Known limitation: ECMAScript object property order is what the
//! interpreter says it is. An emitted key like `{b: 2, a: 1}` may reach the
//! index with its members reordered; collation of such keys follows the
//! order that arrives.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod pool;
mod sandbox;

pub use pool::{InterpreterPermit, InterpreterPool};
pub use sandbox::{MapOutcome, Sandbox, ValidationOutcome};

use thiserror::Error;

/// Errors raised while preparing a script (not while running user code).
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The function source failed to compile or did not evaluate to a
    /// callable.
    #[error("script compile error: {0}")]
    Compile(String),

    /// The design document declared a language other than JavaScript.
    #[error("unsupported script language: {0}")]
    UnsupportedLanguage(String),
}

/// Result alias for sandbox preparation.
pub type ScriptResult<T> = Result<T, ScriptError>;
