//! Design documents: parsing and the `design` function table.

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use sofadb_collate::Collation;

use crate::error::{Error, Result};
use crate::revs::winning_doc;
use crate::types::Revision;

/// Kind of a design-document function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    /// View map function.
    Map,
    /// View reduce function (or builtin name).
    Reduce,
    /// Update handler.
    Update,
    /// Changes filter.
    Filter,
    /// `validate_doc_update`.
    Validate,
}

impl FunctionType {
    /// The `design.func_type` column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::Reduce => "reduce",
            Self::Update => "update",
            Self::Filter => "filter",
            Self::Validate => "validate",
        }
    }
}

/// One named function extracted from a design document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignFunction {
    /// Function kind.
    pub func_type: FunctionType,
    /// Name (view or filter name; empty for validate).
    pub name: String,
    /// Source text.
    pub body: String,
}

/// A named view: map source plus optional reduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDefinition {
    /// View name (the part after `_view/`).
    pub name: String,
    /// Map function source.
    pub map: String,
    /// Reduce function source or builtin name.
    pub reduce: Option<String>,
}

/// A parsed design document.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignDocument {
    /// Full document id (`_design/...`).
    pub id: String,
    /// Declared language; only `javascript` is executable.
    pub language: String,
    /// Named views.
    pub views: Vec<ViewDefinition>,
    /// Named changes filters.
    pub filters: Vec<(String, String)>,
    /// `validate_doc_update` source, if present.
    pub validate: Option<String>,
    /// String collation for this document's views.
    pub collation: Collation,
    /// Whether design documents themselves are fed to map functions.
    pub include_design: bool,
    /// Whether `_local_seq` is injected before mapping.
    pub local_seq: bool,
    /// Whether queries keep this document's views fresh by default.
    pub auto_update: bool,
}

/// Whether `id` names a design document.
#[must_use]
pub fn is_design_id(id: &str) -> bool {
    id.starts_with("_design/")
}

impl DesignDocument {
    /// Extracts functions and options from a design document body.
    pub fn parse(id: &str, body: &Value) -> Result<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| Error::bad_request("design document body must be an object"))?;

        let language = obj
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("javascript")
            .to_owned();

        let mut views = Vec::new();
        if let Some(view_map) = obj.get("views") {
            let view_map = view_map
                .as_object()
                .ok_or_else(|| Error::bad_request("'views' must be an object"))?;
            for (name, def) in view_map {
                let def = def
                    .as_object()
                    .ok_or_else(|| Error::bad_request(format!("view '{name}' must be an object")))?;
                let map = def
                    .get("map")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::bad_request(format!("view '{name}' is missing a map function"))
                    })?
                    .to_owned();
                let reduce = def
                    .get("reduce")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                views.push(ViewDefinition {
                    name: name.clone(),
                    map,
                    reduce,
                });
            }
        }

        let mut filters = Vec::new();
        if let Some(filter_map) = obj.get("filters").and_then(Value::as_object) {
            for (name, src) in filter_map {
                let src = src.as_str().ok_or_else(|| {
                    Error::bad_request(format!("filter '{name}' must be a string"))
                })?;
                filters.push((name.clone(), src.to_owned()));
            }
        }

        let validate = obj
            .get("validate_doc_update")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let options = obj.get("options").and_then(Value::as_object);
        let collation = match options.and_then(|o| o.get("collation")).and_then(Value::as_str) {
            Some(name) => Collation::parse(name)
                .ok_or_else(|| Error::bad_request(format!("unknown collation '{name}'")))?,
            None => Collation::Unicode,
        };
        let include_design = options
            .and_then(|o| o.get("include_design"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let local_seq = options
            .and_then(|o| o.get("local_seq"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let auto_update = obj
            .get("autoupdate")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        Ok(Self {
            id: id.to_owned(),
            language,
            views,
            filters,
            validate,
            collation,
            include_design,
            local_seq,
            auto_update,
        })
    }

    /// Finds a view by name.
    #[must_use]
    pub fn view(&self, name: &str) -> Option<&ViewDefinition> {
        self.views.iter().find(|v| v.name == name)
    }

    /// Flattens to `design` table rows.
    #[must_use]
    pub fn functions(&self) -> Vec<DesignFunction> {
        let mut out = Vec::new();
        for view in &self.views {
            out.push(DesignFunction {
                func_type: FunctionType::Map,
                name: view.name.clone(),
                body: view.map.clone(),
            });
            if let Some(reduce) = &view.reduce {
                out.push(DesignFunction {
                    func_type: FunctionType::Reduce,
                    name: view.name.clone(),
                    body: reduce.clone(),
                });
            }
        }
        for (name, body) in &self.filters {
            out.push(DesignFunction {
                func_type: FunctionType::Filter,
                name: name.clone(),
                body: body.clone(),
            });
        }
        if let Some(validate) = &self.validate {
            out.push(DesignFunction {
                func_type: FunctionType::Validate,
                name: String::new(),
                body: validate.clone(),
            });
        }
        out
    }
}

/// Replaces the `design` rows for one document revision.
pub(crate) fn write_design_rows(
    conn: &Connection,
    id: &str,
    rev: &Revision,
    ddoc: &DesignDocument,
) -> Result<()> {
    for func in ddoc.functions() {
        conn.execute(
            "INSERT OR REPLACE INTO design
                (id, rev, rev_id, language, func_type, func_name, func_body, auto_update)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id,
                rev.num as i64,
                rev.id,
                ddoc.language,
                func.func_type.as_str(),
                func.name,
                func.body,
                ddoc.auto_update,
            ],
        )?;
    }
    Ok(())
}

/// Looks up a changes filter function on the winning revision of a ddoc.
pub fn filter_function(conn: &Connection, ddoc: &str, name: &str) -> Result<Option<String>> {
    let id = if is_design_id(ddoc) {
        ddoc.to_owned()
    } else {
        format!("_design/{ddoc}")
    };
    let Some(win) = winning_doc(conn, &id)? else {
        return Ok(None);
    };
    if win.deleted {
        return Ok(None);
    }
    let body = conn
        .query_row(
            "SELECT func_body FROM design
             WHERE id = ?1 AND rev = ?2 AND rev_id = ?3
                AND func_type = 'filter' AND func_name = ?4",
            rusqlite::params![id, win.rev.num as i64, win.rev.id, name],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(body)
}

/// All `validate_doc_update` functions on winning design revisions.
pub fn validate_functions(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT DISTINCT id FROM design")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut out = Vec::new();
    for id in ids {
        let Some(win) = winning_doc(conn, &id)? else {
            continue;
        };
        if win.deleted {
            continue;
        }
        let body = conn
            .query_row(
                "SELECT func_body FROM design
                 WHERE id = ?1 AND rev = ?2 AND rev_id = ?3 AND func_type = 'validate'",
                rusqlite::params![id, win.rev.num as i64, win.rev.id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if let Some(body) = body {
            out.push((id, body));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_views_and_options() {
        let body = json!({
            "views": {
                "by_name": {
                    "map": "function(doc) { emit(doc.name, null); }",
                    "reduce": "_count"
                },
                "by_age": {
                    "map": "function(doc) { emit(doc.age, 1); }"
                }
            },
            "options": {"collation": "ascii", "include_design": true},
            "filters": {"mine": "function(doc) { return doc.mine; }"},
            "validate_doc_update": "function(newDoc, oldDoc, userCtx) {}"
        });
        let ddoc = DesignDocument::parse("_design/foo", &body).unwrap();
        assert_eq!(ddoc.views.len(), 2);
        assert_eq!(ddoc.collation, Collation::Ascii);
        assert!(ddoc.include_design);
        assert!(!ddoc.local_seq);
        assert!(ddoc.auto_update);
        assert_eq!(ddoc.filters.len(), 1);
        assert!(ddoc.validate.is_some());

        let view = ddoc.view("by_name").unwrap();
        assert_eq!(view.reduce.as_deref(), Some("_count"));
        assert!(ddoc.view("nope").is_none());
    }

    #[test]
    fn parse_rejects_missing_map() {
        let body = json!({"views": {"bad": {"reduce": "_count"}}});
        let err = DesignDocument::parse("_design/foo", &body).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn parse_rejects_unknown_collation() {
        let body = json!({"options": {"collation": "latin-1"}});
        assert!(DesignDocument::parse("_design/foo", &body).is_err());
    }

    #[test]
    fn functions_flatten_every_kind() {
        let body = json!({
            "views": {"v": {"map": "m", "reduce": "r"}},
            "filters": {"f": "ff"},
            "validate_doc_update": "vv"
        });
        let ddoc = DesignDocument::parse("_design/foo", &body).unwrap();
        let funcs = ddoc.functions();
        assert_eq!(funcs.len(), 4);
        assert!(funcs
            .iter()
            .any(|f| f.func_type == FunctionType::Validate && f.body == "vv"));
    }

    #[test]
    fn design_id_detection() {
        assert!(is_design_id("_design/foo"));
        assert!(!is_design_id("foo"));
        assert!(!is_design_id("_local/foo"));
    }
}
