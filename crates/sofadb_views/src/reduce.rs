//! The grouping / re-reduce engine.
//!
//! Consumes a key-sorted stream of rows that may mix raw map output
//! (`id` non-empty, `first == last`) with previously reduced rows (`id`
//! empty, `[first, last]` the covered range). Rows are batched into
//! contiguous runs sharing a truncated group key and a raw/pre-reduced
//! phase; each run becomes one reducer call. If the combined output still
//! contains adjacent rows with equal truncated keys (mixed input phases),
//! the output is re-reduced recursively until it does not.
//!
//! A batch of length one in the re-reduce phase bypasses the reducer: the
//! value is already reduced, and not calling user code on it is both
//! faster and safer against misbehaving reducers.

use std::cmp::Ordering;

use serde_json::Value;
use sofadb_collate::{collate, Collation};
use sofadb_core::Result;

/// `group_level` value meaning no grouping (`group=false`).
pub const GROUP_NONE: i64 = 0;
/// `group_level` value meaning grouping by the full key (`group=true`).
pub const GROUP_FULL: i64 = -1;

/// One input or output row of a reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceRow {
    /// First sequence covered by this row.
    pub first: i64,
    /// Last sequence covered by this row.
    pub last: i64,
    /// Emitting document id; empty for pre-reduced rows.
    pub id: String,
    /// Emitted key (or truncated group key on output rows).
    pub key: Value,
    /// Emitted or reduced value.
    pub value: Value,
}

/// The reducer invoked per batch. Returns one or more output values; extra
/// values are flattened into the output inheriting the batch's range.
pub type ReduceFn<'a> =
    dyn FnMut(&[(Value, String)], &[Value], bool) -> Result<Vec<Value>> + 'a;

/// Observer of every intermediate reduce result, used for cache write-back:
/// `(depth, batch min key, batch max key, output rows, rereduce)`.
pub type CacheCallback<'a> = dyn FnMut(u32, &Value, &Value, &[ReduceRow], bool) + 'a;

/// Truncates a key to a group level: `0` drops it, negative keeps it whole,
/// `N` keeps the first `N` elements of array keys (scalars stay whole).
#[must_use]
pub fn truncate_key(key: &Value, level: i64) -> Value {
    if level == GROUP_NONE {
        return Value::Null;
    }
    let Value::Array(elements) = key else {
        return key.clone();
    };
    if level > 0 && (level as usize) < elements.len() {
        Value::Array(elements[..level as usize].to_vec())
    } else {
        key.clone()
    }
}

/// Key equality under collation, so `3` and `3.0` share a group.
fn keys_equal(a: &Value, b: &Value) -> bool {
    collate(a, b, Collation::Unicode) == Ordering::Equal
}

fn key_len(key: &Value) -> usize {
    match key {
        Value::Null => 0,
        Value::Array(elements) => elements.len(),
        _ => 1,
    }
}

/// Reduces a sorted row stream. See the module docs for the contract.
pub fn reduce(
    rows: Vec<ReduceRow>,
    reducer: &mut ReduceFn<'_>,
    group_level: i64,
    mut cb: Option<&mut CacheCallback<'_>>,
) -> Result<Vec<ReduceRow>> {
    let mut pass = Pass {
        out: Vec::with_capacity(1),
        keys: Vec::new(),
        values: Vec::new(),
        target: None,
        rereduce: false,
        first: 0,
        last: 0,
        batch_min: None,
        batch_max: None,
    };

    for row in rows {
        let truncated = truncate_key(&row.key, group_level);
        let is_pre_reduced = row.id.is_empty();
        let boundary = match &pass.target {
            Some(target) => !keys_equal(target, &truncated) || pass.rereduce != is_pre_reduced,
            None => false,
        };
        if boundary {
            pass.flush(reducer, cb.as_deref_mut())?;
        }
        if boundary || pass.target.is_none() {
            pass.target = Some(truncated);
            pass.rereduce = is_pre_reduced;
        }
        if pass.first == 0 {
            pass.first = row.first;
        }
        pass.last = row.last;
        if pass.batch_min.is_none() {
            pass.batch_min = Some(row.key.clone());
        }
        pass.batch_max = Some(row.key.clone());
        pass.keys.push((row.key, row.id));
        pass.values.push(row.value);
    }
    pass.flush(reducer, cb.as_deref_mut())?;

    let out = pass.out;
    if out.len() <= 1 {
        return Ok(out);
    }

    // Mixed map/pre-reduced input can leave adjacent rows in the same
    // group; a recursive pass folds them together.
    for i in 1..out.len() {
        let prev = truncate_key(&out[i - 1].key, group_level);
        let this = truncate_key(&out[i].key, group_level);
        if keys_equal(&prev, &this) {
            return reduce(out, reducer, group_level, cb);
        }
    }
    Ok(out)
}

struct Pass {
    out: Vec<ReduceRow>,
    keys: Vec<(Value, String)>,
    values: Vec<Value>,
    target: Option<Value>,
    rereduce: bool,
    first: i64,
    last: i64,
    batch_min: Option<Value>,
    batch_max: Option<Value>,
}

impl Pass {
    fn flush(
        &mut self,
        reducer: &mut ReduceFn<'_>,
        cb: Option<&mut CacheCallback<'_>>,
    ) -> Result<()> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let group_key = self.target.clone().unwrap_or(Value::Null);

        if self.keys.len() == 1 && self.rereduce {
            // Single already-reduced input: pass through untouched.
            self.out.push(ReduceRow {
                first: self.first,
                last: self.last,
                id: String::new(),
                key: group_key,
                value: self.values[0].clone(),
            });
        } else {
            let results = reducer(&self.keys, &self.values, self.rereduce)?;
            let mut batch_rows = Vec::with_capacity(results.len());
            let (mut first, mut last) = (self.first, self.last);
            for value in results {
                let key = if key_len(&group_key) > 0 {
                    group_key.clone()
                } else {
                    Value::Null
                };
                batch_rows.push(ReduceRow {
                    first,
                    last,
                    id: String::new(),
                    key,
                    value,
                });
                // Only the first output row carries the batch's range.
                first = 0;
                last = 0;
            }
            if let Some(cb) = cb {
                let depth = match &group_key {
                    Value::Null => 0,
                    Value::Array(elements) => elements.len() as u32,
                    _ => 1,
                };
                let min = self.batch_min.clone().unwrap_or(Value::Null);
                let max = self.batch_max.clone().unwrap_or(Value::Null);
                cb(depth, &min, &max, &batch_rows, self.rereduce);
            }
            self.out.append(&mut batch_rows);
        }

        self.keys.clear();
        self.values.clear();
        self.first = 0;
        self.last = 0;
        self.batch_min = None;
        self.batch_max = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(seq: i64, id: &str, key: Value, value: Value) -> ReduceRow {
        ReduceRow {
            first: seq,
            last: seq,
            id: id.into(),
            key,
            value,
        }
    }

    fn pre(first: i64, last: i64, key: Value, value: Value) -> ReduceRow {
        ReduceRow {
            first,
            last,
            id: String::new(),
            key,
            value,
        }
    }

    /// `_count`-shaped reducer.
    fn count() -> impl FnMut(&[(Value, String)], &[Value], bool) -> Result<Vec<Value>> {
        |_keys, values: &[Value], rereduce| {
            if rereduce {
                let total: i64 = values.iter().map(|v| v.as_i64().unwrap_or(0)).sum();
                Ok(vec![json!(total)])
            } else {
                Ok(vec![json!(values.len())])
            }
        }
    }

    #[test]
    fn single_group_counts_everything() {
        let rows = vec![
            raw(1, "a", json!("x"), json!(null)),
            raw(2, "b", json!("y"), json!(null)),
        ];
        let mut fn_ = count();
        let out = reduce(rows, &mut fn_, GROUP_NONE, None).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, json!(null));
        assert_eq!(out[0].value, json!(2));
        assert_eq!((out[0].first, out[0].last), (1, 2));
    }

    #[test]
    fn group_full_groups_by_whole_key() {
        let rows = vec![
            raw(1, "a", json!("x"), json!(null)),
            raw(2, "b", json!("x"), json!(null)),
            raw(3, "c", json!("y"), json!(null)),
        ];
        let mut fn_ = count();
        let out = reduce(rows, &mut fn_, GROUP_FULL, None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].key.clone(), out[0].value.clone()), (json!("x"), json!(2)));
        assert_eq!((out[1].key.clone(), out[1].value.clone()), (json!("y"), json!(1)));
    }

    #[test]
    fn group_level_truncates_array_keys() {
        // Scalar "a" sorts before arrays; scalars are their own group.
        let rows = vec![
            raw(1, "d1", json!("a"), json!(null)),
            raw(2, "d2", json!("a"), json!(null)),
            raw(3, "d3", json!(["a"]), json!(null)),
            raw(4, "d4", json!(["a", "a"]), json!(null)),
            raw(5, "d5", json!(["a", "b"]), json!(null)),
        ];
        let mut fn_ = count();
        let out = reduce(rows, &mut fn_, 1, None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, json!("a"));
        assert_eq!(out[0].value, json!(2));
        assert_eq!(out[1].key, json!(["a"]));
        assert_eq!(out[1].value, json!(3));
    }

    #[test]
    fn single_pre_reduced_row_bypasses_the_reducer() {
        let rows = vec![pre(1, 5, json!(null), json!(42))];
        let mut calls = 0;
        let mut fn_ = |_k: &[(Value, String)], _v: &[Value], _re: bool| {
            calls += 1;
            Ok(vec![json!(0)])
        };
        let out = reduce(rows, &mut fn_, GROUP_NONE, None).unwrap();
        assert_eq!(calls, 0);
        assert_eq!(out[0].value, json!(42));
        assert_eq!((out[0].first, out[0].last), (1, 5));
    }

    #[test]
    fn mixed_raw_and_pre_reduced_re_reduces() {
        let rows = vec![
            pre(1, 2, json!(null), json!(2)),
            raw(3, "c", json!("x"), json!(null)),
            raw(4, "d", json!("y"), json!(null)),
        ];
        let mut fn_ = count();
        let out = reduce(rows, &mut fn_, GROUP_NONE, None).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!(4));
    }

    #[test]
    fn numeric_keys_group_across_representations() {
        let rows = vec![
            raw(1, "a", json!(3), json!(null)),
            raw(2, "b", json!(3.0), json!(null)),
        ];
        let mut fn_ = count();
        let out = reduce(rows, &mut fn_, GROUP_FULL, None).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!(2));
    }

    #[test]
    fn callback_sees_batch_ranges() {
        let rows = vec![
            raw(1, "a", json!("x"), json!(null)),
            raw(2, "b", json!("y"), json!(null)),
        ];
        let mut fn_ = count();
        let mut seen = Vec::new();
        let mut cb = |depth: u32, min: &Value, max: &Value, rows: &[ReduceRow], rereduce: bool| {
            seen.push((depth, min.clone(), max.clone(), rows.len(), rereduce));
        };
        reduce(rows, &mut fn_, GROUP_NONE, Some(&mut cb)).unwrap();
        assert_eq!(seen, vec![(0, json!("x"), json!("y"), 1, false)]);
    }

    #[test]
    fn partitioned_reduce_matches_unpartitioned() {
        // reduce(all) == rereduce(reduce(B1), reduce(B2)) for _count.
        let all: Vec<ReduceRow> = (1..=10)
            .map(|i| raw(i, &format!("d{i}"), json!("k"), json!(null)))
            .collect();

        let mut fn_ = count();
        let direct = reduce(all.clone(), &mut fn_, GROUP_NONE, None).unwrap();

        let (b1, b2) = all.split_at(4);
        let mut fn_ = count();
        let r1 = reduce(b1.to_vec(), &mut fn_, GROUP_NONE, None).unwrap();
        let r2 = reduce(b2.to_vec(), &mut fn_, GROUP_NONE, None).unwrap();
        let merged: Vec<ReduceRow> = r1.into_iter().chain(r2).collect();
        let combined = reduce(merged, &mut fn_, GROUP_NONE, None).unwrap();

        assert_eq!(direct[0].value, combined[0].value);
    }

    mod partitioning {
        use super::*;
        use crate::builtins::BuiltinReducer;
        use proptest::prelude::*;

        fn builtin_fn(
            builtin: BuiltinReducer,
        ) -> impl FnMut(&[(Value, String)], &[Value], bool) -> Result<Vec<Value>> {
            move |keys, values, rereduce| {
                builtin.call(keys, values, rereduce).map(|v| vec![v])
            }
        }

        fn rows_from(values: &[i64]) -> Vec<ReduceRow> {
            values
                .iter()
                .enumerate()
                .map(|(i, v)| raw(i as i64 + 1, &format!("d{i}"), json!("k"), json!(v)))
                .collect()
        }

        proptest! {
            /// For any split point, reducing each part and re-reducing the
            /// results equals the single unpartitioned call.
            #[test]
            fn split_and_rereduce_matches_direct(
                values in prop::collection::vec(0i64..100, 1..40),
                split in 0usize..40,
                which in 0usize..3,
            ) {
                let builtin = [
                    BuiltinReducer::Count,
                    BuiltinReducer::Sum,
                    BuiltinReducer::Stats,
                ][which];
                let rows = rows_from(&values);
                let split = split.min(rows.len());

                let mut f = builtin_fn(builtin);
                let direct = reduce(rows.clone(), &mut f, GROUP_NONE, None).unwrap();

                let (b1, b2) = rows.split_at(split);
                let r1 = reduce(b1.to_vec(), &mut f, GROUP_NONE, None).unwrap();
                let r2 = reduce(b2.to_vec(), &mut f, GROUP_NONE, None).unwrap();
                let combined = reduce(
                    r1.into_iter().chain(r2).collect(),
                    &mut f,
                    GROUP_NONE,
                    None,
                )
                .unwrap();

                prop_assert_eq!(direct.len(), 1);
                prop_assert_eq!(combined.len(), 1);
                prop_assert_eq!(&direct[0].value, &combined[0].value);
            }
        }
    }

    #[test]
    fn truncate_key_levels() {
        assert_eq!(truncate_key(&json!(["a", "b", "c"]), 0), json!(null));
        assert_eq!(truncate_key(&json!(["a", "b", "c"]), 2), json!(["a", "b"]));
        assert_eq!(truncate_key(&json!(["a", "b", "c"]), 5), json!(["a", "b", "c"]));
        assert_eq!(truncate_key(&json!(["a", "b", "c"]), -1), json!(["a", "b", "c"]));
        assert_eq!(truncate_key(&json!("scalar"), 3), json!("scalar"));
        assert_eq!(truncate_key(&json!("scalar"), 0), json!(null));
    }
}
