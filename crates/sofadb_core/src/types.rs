//! Core type definitions.

use std::fmt;

use crate::error::Error;

/// Process-wide update sequence.
///
/// Assigned when a revision is persisted; strictly increasing and never
/// reused (the docs table is `AUTOINCREMENT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Seq(pub u64);

impl Seq {
    /// Creates a sequence from a raw value.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Conversion for SQLite bind parameters.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Conversion from a SQLite column.
    #[must_use]
    pub const fn from_i64(v: i64) -> Self {
        Self(v as u64)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document revision: `(rev_number, rev_id)`, rendered as `N-hex`.
///
/// Ordering is by number first, then lexicographically on the id, which is
/// exactly CouchDB's winning-revision tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision {
    /// Revision number, starting at 1.
    pub num: u64,
    /// Opaque hex identifier.
    pub id: String,
}

impl Revision {
    /// Creates a revision from parts.
    #[must_use]
    pub fn new(num: u64, id: impl Into<String>) -> Self {
        Self { num, id: id.into() }
    }

    /// Parses the `N-hex` wire format.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (num, id) = s
            .split_once('-')
            .ok_or_else(|| Error::bad_request("invalid rev format"))?;
        let num: u64 = num
            .parse()
            .map_err(|_| Error::bad_request("invalid rev format"))?;
        if num == 0 || id.is_empty() {
            return Err(Error::bad_request("invalid rev format"));
        }
        Ok(Self {
            num,
            id: id.to_owned(),
        })
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.num, self.id)
    }
}
