//! Document body parsing and response assembly.

use serde_json::{Map, Value};

use crate::attachments::Attachment;
use crate::error::{Error, Result};
use crate::types::Revision;

/// Underscore fields stripped from bodies before storage and re-injected on
/// the way out.
const SPECIAL_FIELDS: &[&str] = &[
    "_id",
    "_rev",
    "_deleted",
    "_attachments",
    "_revisions",
    "_conflicts",
    "_deleted_conflicts",
    "_local_seq",
    "_revs_info",
];

/// An attachment as supplied inside `_attachments` on a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingAttachment {
    /// Attachment filename.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// `true` when the entry is a stub referencing an existing attachment.
    pub stub: bool,
    /// Decoded data for non-stub entries.
    pub data: Vec<u8>,
}

/// A parsed incoming document body.
#[derive(Debug, Clone)]
pub struct IncomingDoc {
    /// `_id`, if present in the body.
    pub id: Option<String>,
    /// `_rev`, if present in the body.
    pub rev: Option<Revision>,
    /// `_deleted`.
    pub deleted: bool,
    /// Parsed `_attachments` entries.
    pub attachments: Vec<IncomingAttachment>,
    /// `_revisions` ancestry (`start`, newest-first ids), for
    /// `new_edits=false` writes.
    pub revisions: Option<(u64, Vec<String>)>,
    /// The body with underscore fields stripped.
    pub body: Map<String, Value>,
}

/// Parses and validates a request body.
pub fn parse_incoming(body: &Value) -> Result<IncomingDoc> {
    let obj = body
        .as_object()
        .ok_or_else(|| Error::bad_request("document body must be a JSON object"))?;

    for key in obj.keys() {
        if key.starts_with('_') && !SPECIAL_FIELDS.contains(&key.as_str()) {
            return Err(Error::bad_request(format!(
                "bad special document member: {key}"
            )));
        }
    }

    let id = match obj.get("_id") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(Error::bad_request("document ID must be a string")),
    };
    let rev = match obj.get("_rev") {
        None => None,
        Some(Value::String(s)) => Some(Revision::parse(s)?),
        Some(_) => return Err(Error::bad_request("invalid rev format")),
    };
    let deleted = obj.get("_deleted").and_then(Value::as_bool).unwrap_or(false);

    let mut attachments = Vec::new();
    if let Some(atts) = obj.get("_attachments") {
        let atts = atts
            .as_object()
            .ok_or_else(|| Error::bad_request("'_attachments' must be an object"))?;
        for (filename, spec) in atts {
            attachments.push(parse_attachment(filename, spec)?);
        }
    }

    let revisions = match obj.get("_revisions") {
        None => None,
        Some(v) => {
            let r = v
                .as_object()
                .ok_or_else(|| Error::bad_request("'_revisions' must be an object"))?;
            let start = r
                .get("start")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::bad_request("'_revisions.start' must be an integer"))?;
            let ids = r
                .get("ids")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::bad_request("'_revisions.ids' must be an array"))?
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| Error::bad_request("'_revisions.ids' must be strings"))
                })
                .collect::<Result<Vec<_>>>()?;
            Some((start, ids))
        }
    };

    let body = obj
        .iter()
        .filter(|(k, _)| !SPECIAL_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(IncomingDoc {
        id,
        rev,
        deleted,
        attachments,
        revisions,
        body,
    })
}

fn parse_attachment(filename: &str, spec: &Value) -> Result<IncomingAttachment> {
    use base64::Engine as _;

    let spec = spec
        .as_object()
        .ok_or_else(|| Error::bad_request(format!("attachment '{filename}' must be an object")))?;
    let content_type = spec
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_owned();
    let stub = spec.get("stub").and_then(Value::as_bool).unwrap_or(false)
        || spec.get("follows").and_then(Value::as_bool).unwrap_or(false);
    let data = if stub {
        Vec::new()
    } else {
        let encoded = spec.get("data").and_then(Value::as_str).ok_or_else(|| {
            Error::bad_request(format!("attachment '{filename}' is missing data"))
        })?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| Error::bad_request(format!("attachment '{filename}': invalid base64")))?
    };
    Ok(IncomingAttachment {
        filename: filename.to_owned(),
        content_type,
        stub,
        data,
    })
}

/// Options for reading a document.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Read this exact revision instead of the winner.
    pub rev: Option<Revision>,
    /// With `rev`, follow the DAG down to the newest non-deleted leaf.
    pub latest: bool,
    /// Include the `_conflicts` array.
    pub conflicts: bool,
    /// Include the `_revisions` ancestry object.
    pub revs: bool,
    /// Include `_local_seq`.
    pub local_seq: bool,
    /// Inline attachment data instead of stubs.
    pub attachments: bool,
}

/// A fully assembled document response.
#[derive(Debug, Clone)]
pub struct FullDoc {
    /// Document id.
    pub id: String,
    /// Revision being returned.
    pub rev: Revision,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// Stored body fields.
    pub body: Map<String, Value>,
    /// Attachments on this revision.
    pub attachments: Vec<Attachment>,
    /// Inline attachment data (otherwise stubs are rendered).
    pub attachments_inline: bool,
    /// Conflicting non-deleted leaf revisions.
    pub conflicts: Vec<Revision>,
    /// `(start, ids)` ancestry, newest first.
    pub revisions: Option<(u64, Vec<String>)>,
    /// The revision's sequence, when requested.
    pub local_seq: Option<u64>,
}

impl FullDoc {
    /// Renders the response body, `_id` and `_rev` first, meta fields after
    /// the document's own members.
    #[must_use]
    pub fn to_value(&self) -> Value {
        use base64::Engine as _;

        let mut out = Map::new();
        out.insert("_id".into(), Value::String(self.id.clone()));
        out.insert("_rev".into(), Value::String(self.rev.to_string()));
        for (k, v) in &self.body {
            out.insert(k.clone(), v.clone());
        }
        if self.deleted {
            out.insert("_deleted".into(), Value::Bool(true));
        }
        if !self.attachments.is_empty() {
            let mut atts = Map::new();
            for att in &self.attachments {
                let mut entry = Map::new();
                entry.insert(
                    "content_type".into(),
                    Value::String(att.content_type.clone()),
                );
                entry.insert("revpos".into(), Value::from(att.rev_pos));
                entry.insert("digest".into(), Value::String(att.digest.clone()));
                entry.insert("length".into(), Value::from(att.length));
                if self.attachments_inline {
                    entry.insert(
                        "data".into(),
                        Value::String(
                            base64::engine::general_purpose::STANDARD.encode(&att.data),
                        ),
                    );
                } else {
                    entry.insert("stub".into(), Value::Bool(true));
                }
                atts.insert(att.filename.clone(), Value::Object(entry));
            }
            out.insert("_attachments".into(), Value::Object(atts));
        }
        if !self.conflicts.is_empty() {
            out.insert(
                "_conflicts".into(),
                Value::Array(
                    self.conflicts
                        .iter()
                        .map(|r| Value::String(r.to_string()))
                        .collect(),
                ),
            );
        }
        if let Some((start, ids)) = &self.revisions {
            let mut revisions = Map::new();
            revisions.insert("start".into(), Value::from(*start));
            revisions.insert(
                "ids".into(),
                Value::Array(ids.iter().cloned().map(Value::String).collect()),
            );
            out.insert("_revisions".into(), Value::Object(revisions));
        }
        if let Some(seq) = self.local_seq {
            out.insert("_local_seq".into(), Value::from(seq));
        }
        Value::Object(out)
    }
}
