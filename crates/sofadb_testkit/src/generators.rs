//! Property-based generators using proptest.

use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for valid document ids.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9][a-zA-Z0-9_-]{0,31}").expect("invalid regex")
}

/// Strategy for JSON values usable as view keys: scalars, flat arrays and
/// flat objects, covering every collation type rank.
pub fn json_key_strategy() -> impl Strategy<Value = Value> {
    let scalar = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        (-1.0e6f64..1.0e6).prop_map(Value::from),
        "[a-zA-Z]{0,8}".prop_map(Value::from),
    ];
    prop_oneof![
        scalar.clone(),
        prop::collection::vec(scalar.clone(), 0..4).prop_map(Value::Array),
        prop::collection::vec(("[a-z]{1,6}", scalar), 0..4).prop_map(|pairs| {
            let mut map = Map::new();
            for (k, v) in pairs {
                map.insert(k, v);
            }
            Value::Object(map)
        }),
    ]
}

/// Strategy for small document bodies.
pub fn document_strategy() -> impl Strategy<Value = Value> {
    prop::collection::vec(("[a-z]{1,8}", json_key_strategy()), 0..6).prop_map(|pairs| {
        let mut map = Map::new();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        Value::Object(map)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sofadb_collate::{collate, Collation};
    use std::cmp::Ordering;

    proptest! {
        /// Collation is a total order: antisymmetric and transitive on
        /// sampled triples.
        #[test]
        fn collation_is_consistent(a in json_key_strategy(), b in json_key_strategy(), c in json_key_strategy()) {
            let ab = collate(&a, &b, Collation::Unicode);
            let ba = collate(&b, &a, Collation::Unicode);
            prop_assert_eq!(ab, ba.reverse());

            if ab == Ordering::Less && collate(&b, &c, Collation::Unicode) == Ordering::Less {
                prop_assert_eq!(collate(&a, &c, Collation::Unicode), Ordering::Less);
            }
        }

        #[test]
        fn collation_round_trips_canonical_text(a in json_key_strategy()) {
            let text = sofadb_collate::canonical_text(&a);
            prop_assert_eq!(
                sofadb_collate::collate_raw(&text, &text, Collation::Unicode),
                Ordering::Equal
            );
        }

        #[test]
        fn generated_docs_are_storable(id in doc_id_strategy(), body in document_strategy()) {
            crate::with_temp_db(|db, ctx| {
                db.put(ctx, &id, &body).unwrap();
                let (got, _) = db.get(ctx, &id).unwrap();
                assert_eq!(got["_id"], serde_json::json!(id.clone()));
            });
        }
    }
}
