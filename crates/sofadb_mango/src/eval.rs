//! Selector evaluation.

use std::cmp::Ordering;

use serde_json::Value;
use sofadb_collate::{collate, Collation};

use crate::ast::{Condition, Selector};

/// Whether `doc` satisfies `selector`.
#[must_use]
pub fn matches(selector: &Selector, doc: &Value) -> bool {
    match selector {
        Selector::And(clauses) => clauses.iter().all(|s| matches(s, doc)),
        Selector::Or(clauses) => clauses.iter().any(|s| matches(s, doc)),
        Selector::Nor(clauses) => !clauses.iter().any(|s| matches(s, doc)),
        Selector::Not(inner) => !matches(inner, doc),
        Selector::Field { path, condition } => {
            let value = resolve(doc, path);
            check(condition, value)
        }
    }
}

/// Walks a dotted path. Segments may themselves contain dots
/// (`{"a.b": ...}` addresses the same field as `{"a": {"b": ...}}`).
fn resolve<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.iter().flat_map(|s| s.split('.')) {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn cmp(a: &Value, b: &Value) -> Ordering {
    collate(a, b, Collation::Unicode)
}

fn equal(a: &Value, b: &Value) -> bool {
    cmp(a, b) == Ordering::Equal
}

/// Applies one condition to a (possibly missing) field value.
///
/// A missing field satisfies only `$exists false`, `$ne` and `$nin`.
fn check(condition: &Condition, value: Option<&Value>) -> bool {
    let Some(value) = value else {
        return match condition {
            Condition::Exists(wanted) => !wanted,
            Condition::Ne(_) | Condition::Nin(_) => true,
            Condition::Not(inner) => !check(inner, None),
            _ => false,
        };
    };

    match condition {
        Condition::Eq(expected) => equal(value, expected),
        Condition::Ne(expected) => !equal(value, expected),
        Condition::Lt(bound) => cmp(value, bound) == Ordering::Less,
        Condition::Lte(bound) => cmp(value, bound) != Ordering::Greater,
        Condition::Gt(bound) => cmp(value, bound) == Ordering::Greater,
        Condition::Gte(bound) => cmp(value, bound) != Ordering::Less,
        Condition::Exists(wanted) => *wanted,
        Condition::Type(ty) => ty.matches(value),
        Condition::In(set) => set.iter().any(|v| equal(value, v)),
        Condition::Nin(set) => !set.iter().any(|v| equal(value, v)),
        Condition::Size(n) => value.as_array().is_some_and(|a| a.len() as u64 == *n),
        Condition::Mod { divisor, remainder } => value
            .as_i64()
            .is_some_and(|v| v % divisor == *remainder),
        Condition::Regex(re) => value.as_str().is_some_and(|s| re.is_match(s)),
        Condition::All(required) => value.as_array().is_some_and(|elements| {
            required
                .iter()
                .all(|r| elements.iter().any(|e| equal(e, r)))
        }),
        Condition::ElemMatch(sub) => value
            .as_array()
            .is_some_and(|elements| elements.iter().any(|e| matches(sub, e))),
        Condition::AllMatch(sub) => value
            .as_array()
            .is_some_and(|elements| elements.iter().all(|e| matches(sub, e))),
        Condition::KeyMapMatch(sub) => value.as_object().is_some_and(|map| {
            map.keys()
                .any(|k| matches(sub, &Value::String(k.clone())))
        }),
        Condition::Not(inner) => !check(inner, Some(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use serde_json::json;

    fn hit(selector: Value, doc: Value) -> bool {
        matches(&parse(&selector).unwrap(), &doc)
    }

    #[test]
    fn implicit_eq() {
        assert!(hit(json!({"name": "bob"}), json!({"name": "bob"})));
        assert!(!hit(json!({"name": "bob"}), json!({"name": "alice"})));
        assert!(!hit(json!({"name": "bob"}), json!({})));
    }

    #[test]
    fn ranges_use_collation() {
        assert!(hit(json!({"n": {"$gt": 5}}), json!({"n": 6})));
        assert!(hit(json!({"n": {"$lte": 5}}), json!({"n": 5.0})));
        // Strings sort above every number under collation.
        assert!(hit(json!({"n": {"$gt": 5}}), json!({"n": "a"})));
        assert!(!hit(json!({"n": {"$lt": 5}}), json!({"n": "a"})));
    }

    #[test]
    fn ne_and_nin_match_missing_fields() {
        assert!(hit(json!({"x": {"$ne": 1}}), json!({})));
        assert!(hit(json!({"x": {"$nin": [1, 2]}}), json!({})));
        assert!(!hit(json!({"x": {"$eq": null}}), json!({})));
    }

    #[test]
    fn exists_and_type() {
        assert!(hit(json!({"x": {"$exists": true}}), json!({"x": null})));
        assert!(hit(json!({"x": {"$exists": false}}), json!({})));
        assert!(hit(json!({"x": {"$type": "array"}}), json!({"x": []})));
        assert!(!hit(json!({"x": {"$type": "string"}}), json!({"x": 3})));
    }

    #[test]
    fn in_nin_size() {
        assert!(hit(json!({"x": {"$in": [1, 2, 3]}}), json!({"x": 2})));
        assert!(!hit(json!({"x": {"$in": []}}), json!({"x": 2})));
        assert!(hit(json!({"x": {"$nin": [1]}}), json!({"x": 2})));
        assert!(hit(json!({"x": {"$size": 2}}), json!({"x": [1, 2]})));
        assert!(!hit(json!({"x": {"$size": 2}}), json!({"x": "ab"})));
    }

    #[test]
    fn mod_and_regex() {
        assert!(hit(json!({"x": {"$mod": [3, 1]}}), json!({"x": 7})));
        assert!(!hit(json!({"x": {"$mod": [3, 1]}}), json!({"x": 9})));
        // Non-integer field values simply do not match.
        assert!(!hit(json!({"x": {"$mod": [3, 1]}}), json!({"x": 7.5})));

        assert!(hit(json!({"x": {"$regex": "^b.b$"}}), json!({"x": "bob"})));
        assert!(!hit(json!({"x": {"$regex": "^b"}}), json!({"x": 42})));
    }

    #[test]
    fn all_and_element_selectors() {
        assert!(hit(
            json!({"tags": {"$all": ["a", "b"]}}),
            json!({"tags": ["b", "c", "a"]})
        ));
        assert!(!hit(
            json!({"tags": {"$all": ["a", "z"]}}),
            json!({"tags": ["a"]})
        ));

        assert!(hit(
            json!({"scores": {"$elemMatch": {"$gt": 8}}}),
            json!({"scores": [3, 9]})
        ));
        assert!(hit(
            json!({"scores": {"$allMatch": {"$gt": 2}}}),
            json!({"scores": [3, 9]})
        ));
        assert!(!hit(
            json!({"scores": {"$allMatch": {"$gt": 5}}}),
            json!({"scores": [3, 9]})
        ));

        assert!(hit(
            json!({"people": {"$elemMatch": {"name": "bob"}}}),
            json!({"people": [{"name": "alice"}, {"name": "bob"}]})
        ));
    }

    #[test]
    fn key_map_match() {
        assert!(hit(
            json!({"counts": {"$keyMapMatch": {"$eq": "red"}}}),
            json!({"counts": {"red": 2, "blue": 1}})
        ));
        assert!(!hit(
            json!({"counts": {"$keyMapMatch": {"$eq": "green"}}}),
            json!({"counts": {"red": 2}})
        ));
    }

    #[test]
    fn combinators() {
        assert!(hit(
            json!({"$or": [{"a": 1}, {"a": 2}]}),
            json!({"a": 2})
        ));
        assert!(hit(
            json!({"$nor": [{"a": 1}, {"a": 2}]}),
            json!({"a": 3})
        ));
        assert!(hit(json!({"$not": {"a": 1}}), json!({"a": 2})));
        assert!(!hit(json!({"$not": {"a": 1}}), json!({"a": 1})));
    }

    #[test]
    fn field_level_not() {
        assert!(hit(json!({"a": {"$not": {"$gt": 5}}}), json!({"a": 3})));
        assert!(!hit(json!({"a": {"$not": {"$gt": 5}}}), json!({"a": 9})));
    }

    #[test]
    fn dotted_and_nested_paths_agree() {
        let doc = json!({"a": {"b": 7}});
        assert!(hit(json!({"a.b": 7}), doc.clone()));
        assert!(hit(json!({"a": {"b": 7}}), doc));
    }
}
