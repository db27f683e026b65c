//! Query options: parsing and validation.

use serde_json::Value;
use sofadb_core::{Error, Result};

use crate::reduce::{GROUP_FULL, GROUP_NONE};

/// How a query refreshes the index before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Index up to the current sequence, then answer.
    #[default]
    True,
    /// Answer from whatever is indexed.
    False,
    /// Answer from whatever is indexed; kick off a background build.
    Lazy,
}

impl UpdateMode {
    fn parse(v: &Value) -> Result<Self> {
        match v {
            Value::Bool(true) => Ok(Self::True),
            Value::Bool(false) => Ok(Self::False),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Self::True),
                "false" => Ok(Self::False),
                "lazy" => Ok(Self::Lazy),
                _ => Err(Error::bad_request("invalid value for 'update'")),
            },
            _ => Err(Error::bad_request("invalid value for 'update'")),
        }
    }
}

/// The full option surface of a view query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Index refresh mode.
    pub update: UpdateMode,
    /// Force reduce on or off; defaults to on iff the view has a reducer.
    pub reduce: Option<bool>,
    /// Group by the full emitted key.
    pub group: bool,
    /// Group by the first N elements of array keys.
    pub group_level: Option<i64>,
    /// Restrict to one exact key.
    pub key: Option<Value>,
    /// Restrict to a list of keys, returned in the given order.
    pub keys: Option<Vec<Value>>,
    /// Inclusive range start.
    pub start_key: Option<Value>,
    /// Range end (inclusive unless `inclusive_end` is false).
    pub end_key: Option<Value>,
    /// Document id refining the range at `start_key`.
    pub start_key_doc_id: Option<String>,
    /// Document id refining the range at `end_key`.
    pub end_key_doc_id: Option<String>,
    /// Whether `end_key` itself is part of the range.
    pub inclusive_end: bool,
    /// Reverse scan order; swaps start/end semantics.
    pub descending: bool,
    /// Row cap, applied after ordering and grouping.
    pub limit: Option<u64>,
    /// Rows skipped, applied after ordering and grouping.
    pub skip: u64,
    /// `false` permits unordered output.
    pub sorted: bool,
    /// Attach the current document body to each row.
    pub include_docs: bool,
    /// Include conflicting revisions in included docs.
    pub conflicts: bool,
    /// Inline attachment data in included docs.
    pub attachments: bool,
    /// Report the view's indexed sequence with the response.
    pub update_seq: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            update: UpdateMode::True,
            reduce: None,
            group: false,
            group_level: None,
            key: None,
            keys: None,
            start_key: None,
            end_key: None,
            start_key_doc_id: None,
            end_key_doc_id: None,
            inclusive_end: true,
            descending: false,
            limit: None,
            skip: 0,
            sorted: true,
            include_docs: false,
            conflicts: false,
            attachments: false,
            update_seq: false,
        }
    }
}

fn parse_bool(v: &Value, name: &str) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s == "true" => Ok(true),
        Value::String(s) if s == "false" => Ok(false),
        _ => Err(Error::bad_request(format!("invalid value for '{name}'"))),
    }
}

fn parse_uint(v: &Value, name: &str) -> Result<u64> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| Error::bad_request(format!("invalid value for '{name}'"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| Error::bad_request(format!("invalid value for '{name}'"))),
        _ => Err(Error::bad_request(format!("invalid value for '{name}'"))),
    }
}

impl QueryOptions {
    /// Parses a JSON options map, as a transport layer would supply it.
    ///
    /// Unknown members are ignored; malformed values are `BadRequest`.
    pub fn from_json(options: &Value) -> Result<Self> {
        let mut out = Self::default();
        let Some(map) = options.as_object() else {
            if options.is_null() {
                return Ok(out);
            }
            return Err(Error::bad_request("options must be an object"));
        };

        for (name, value) in map {
            match name.as_str() {
                "update" => out.update = UpdateMode::parse(value)?,
                "reduce" => out.reduce = Some(parse_bool(value, name)?),
                "group" => out.group = parse_bool(value, name)?,
                "group_level" => match value {
                    Value::String(s) if s == "exact" => out.group = true,
                    other => out.group_level = Some(parse_uint(other, name)? as i64),
                },
                "key" => out.key = Some(value.clone()),
                "keys" => {
                    let keys = value
                        .as_array()
                        .ok_or_else(|| Error::bad_request("invalid value for 'keys'"))?;
                    out.keys = Some(keys.clone());
                }
                "startkey" | "start_key" => out.start_key = Some(value.clone()),
                "endkey" | "end_key" => out.end_key = Some(value.clone()),
                "startkey_docid" | "start_key_doc_id" => {
                    out.start_key_doc_id = Some(
                        value
                            .as_str()
                            .ok_or_else(|| Error::bad_request("invalid value for 'startkey_docid'"))?
                            .to_owned(),
                    );
                }
                "endkey_docid" | "end_key_doc_id" => {
                    out.end_key_doc_id = Some(
                        value
                            .as_str()
                            .ok_or_else(|| Error::bad_request("invalid value for 'endkey_docid'"))?
                            .to_owned(),
                    );
                }
                "inclusive_end" => out.inclusive_end = parse_bool(value, name)?,
                "descending" => out.descending = parse_bool(value, name)?,
                "limit" => out.limit = Some(parse_uint(value, name)?),
                "skip" => out.skip = parse_uint(value, name)?,
                "sorted" => out.sorted = parse_bool(value, name)?,
                "include_docs" => out.include_docs = parse_bool(value, name)?,
                "conflicts" => out.conflicts = parse_bool(value, name)?,
                "attachments" => out.attachments = parse_bool(value, name)?,
                "update_seq" => out.update_seq = parse_bool(value, name)?,
                _ => {}
            }
        }
        Ok(out)
    }

    /// Whether this query runs the reducer, given the view's shape.
    #[must_use]
    pub fn wants_reduce(&self, has_reduce: bool) -> bool {
        has_reduce && self.reduce.unwrap_or(true)
    }

    /// The effective group level: `0` none, `-1` full key, `N` prefix.
    #[must_use]
    pub fn effective_group_level(&self) -> i64 {
        match self.group_level {
            Some(level) => level,
            None if self.group => GROUP_FULL,
            None => GROUP_NONE,
        }
    }

    /// Cross-option validation against the view's shape.
    pub fn validate(&self, has_reduce: bool) -> Result<()> {
        if !has_reduce {
            if self.reduce == Some(true) {
                return Err(Error::bad_request("reduce is invalid for map-only views"));
            }
            if self.group {
                return Err(Error::bad_request("group is invalid for map-only views"));
            }
            if self.group_level.is_some() {
                return Err(Error::bad_request(
                    "group_level is invalid for map-only views",
                ));
            }
        }
        let reducing = self.wants_reduce(has_reduce);
        if reducing {
            if self.include_docs {
                return Err(Error::bad_request("include_docs is invalid with reduce"));
            }
            if self.conflicts {
                return Err(Error::bad_request("conflicts is invalid with reduce"));
            }
            if self.keys.is_some() && self.effective_group_level() == GROUP_NONE {
                return Err(Error::bad_request(
                    "multi-key fetches for reduce views must use group=true",
                ));
            }
        }
        if self.conflicts && !self.include_docs {
            return Err(Error::bad_request("conflicts requires include_docs"));
        }
        if self.key.is_some() && self.keys.is_some() {
            return Err(Error::bad_request("'key' and 'keys' are mutually exclusive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let opts = QueryOptions::default();
        assert_eq!(opts.update, UpdateMode::True);
        assert!(opts.inclusive_end);
        assert!(opts.sorted);
        assert_eq!(opts.effective_group_level(), GROUP_NONE);
    }

    #[test]
    fn parse_accepts_strings_and_types() {
        let opts = QueryOptions::from_json(&json!({
            "update": "lazy",
            "group_level": 2,
            "descending": "true",
            "limit": "10",
            "skip": 3,
            "startkey": ["a"],
            "endkey_docid": "z"
        }))
        .unwrap();
        assert_eq!(opts.update, UpdateMode::Lazy);
        assert_eq!(opts.effective_group_level(), 2);
        assert!(opts.descending);
        assert_eq!(opts.limit, Some(10));
        assert_eq!(opts.skip, 3);
        assert_eq!(opts.start_key, Some(json!(["a"])));
        assert_eq!(opts.end_key_doc_id.as_deref(), Some("z"));
    }

    #[test]
    fn parse_rejects_bad_update() {
        let err = QueryOptions::from_json(&json!({"update": "foo"})).unwrap_err();
        assert_eq!(err.to_string(), "bad request: invalid value for 'update'");
    }

    #[test]
    fn group_level_exact_means_group() {
        let opts = QueryOptions::from_json(&json!({"group_level": "exact"})).unwrap();
        assert!(opts.group);
        assert_eq!(opts.effective_group_level(), GROUP_FULL);
    }

    #[test]
    fn map_only_views_reject_grouping() {
        let mut opts = QueryOptions::default();
        opts.group = true;
        let err = opts.validate(false).unwrap_err();
        assert!(err.to_string().contains("invalid for map-only views"));

        let mut opts = QueryOptions::default();
        opts.reduce = Some(true);
        assert!(opts.validate(false).is_err());

        // reduce=false against a map-only view is fine.
        let mut opts = QueryOptions::default();
        opts.reduce = Some(false);
        opts.validate(false).unwrap();
    }

    #[test]
    fn reduce_rejects_doc_options() {
        let mut opts = QueryOptions::default();
        opts.include_docs = true;
        let err = opts.validate(true).unwrap_err();
        assert_eq!(err.status(), 400);

        let mut opts = QueryOptions::default();
        opts.reduce = Some(false);
        opts.include_docs = true;
        opts.validate(true).unwrap();
    }

    #[test]
    fn keys_with_reduce_needs_group() {
        let mut opts = QueryOptions::default();
        opts.keys = Some(vec![json!("a")]);
        assert!(opts.validate(true).is_err());
        opts.group = true;
        opts.validate(true).unwrap();
    }

    #[test]
    fn key_and_keys_conflict() {
        let mut opts = QueryOptions::default();
        opts.key = Some(json!("a"));
        opts.keys = Some(vec![json!("b")]);
        assert!(opts.validate(false).is_err());
    }
}
