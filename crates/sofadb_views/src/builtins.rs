//! Native reducers.
//!
//! CouchDB's built-in reduce functions, recognized by exact source text in
//! the design document and executed natively; the sandbox is never entered
//! for them.

use std::collections::HashSet;

use serde_json::{Map, Value};
use sofadb_collate::canonical_text;
use sofadb_core::{Error, Result};

/// A built-in reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinReducer {
    /// `_count`: number of raw rows.
    Count,
    /// `_sum`: numeric sum of values (element-wise over arrays).
    Sum,
    /// `_stats`: `{sum, count, min, max, sumsqr}` over numeric values.
    Stats,
    /// `_approx_count_distinct`: approximate distinct-key count.
    ApproxCountDistinct,
}

impl BuiltinReducer {
    /// Recognizes a reduce source as a builtin by exact text.
    #[must_use]
    pub fn parse(source: &str) -> Option<Self> {
        match source {
            "_count" => Some(Self::Count),
            "_sum" => Some(Self::Sum),
            "_stats" => Some(Self::Stats),
            "_approx_count_distinct" => Some(Self::ApproxCountDistinct),
            _ => None,
        }
    }

    /// Runs the reducer over one batch.
    pub fn call(
        self,
        keys: &[(Value, String)],
        values: &[Value],
        rereduce: bool,
    ) -> Result<Value> {
        match self {
            Self::Count => count(values, rereduce),
            Self::Sum => sum(values),
            Self::Stats => stats(values, rereduce),
            Self::ApproxCountDistinct => approx_count_distinct(keys, values, rereduce),
        }
    }
}

/// Renders a float back to JSON, preferring integer representation.
fn number(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9e15 {
        #[allow(clippy::cast_possible_truncation)]
        Value::from(v as i64)
    } else {
        Value::from(v)
    }
}

fn as_number(v: &Value, what: &str) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| Error::bad_request(format!("the {what} function requires numeric input")))
}

fn count(values: &[Value], rereduce: bool) -> Result<Value> {
    if !rereduce {
        return Ok(Value::from(values.len()));
    }
    let mut total = 0.0;
    for v in values {
        total += as_number(v, "_count")?;
    }
    Ok(number(total))
}

fn sum(values: &[Value]) -> Result<Value> {
    // Scalar sums are the common case; arrays sum element-wise and the
    // result widens to the longest input.
    let mut scalar = 0.0;
    let mut vector: Vec<f64> = Vec::new();
    let mut saw_vector = false;
    for v in values {
        match v {
            Value::Array(elements) => {
                saw_vector = true;
                if vector.len() < elements.len() {
                    vector.resize(elements.len(), 0.0);
                }
                for (i, element) in elements.iter().enumerate() {
                    vector[i] += as_number(element, "_sum")?;
                }
            }
            other => scalar += as_number(other, "_sum")?,
        }
    }
    if saw_vector {
        if scalar != 0.0 {
            // A scalar mixed into array sums adds to the first element,
            // matching CouchDB.
            if vector.is_empty() {
                vector.push(0.0);
            }
            vector[0] += scalar;
        }
        return Ok(Value::Array(vector.into_iter().map(number).collect()));
    }
    Ok(number(scalar))
}

#[derive(Debug, Clone, Copy, Default)]
struct StatsAcc {
    sum: f64,
    count: f64,
    min: f64,
    max: f64,
    sumsqr: f64,
    seen: bool,
}

impl StatsAcc {
    fn add_number(&mut self, v: f64) {
        if self.seen {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        } else {
            self.min = v;
            self.max = v;
            self.seen = true;
        }
        self.sum += v;
        self.count += 1.0;
        self.sumsqr += v * v;
    }

    fn merge(&mut self, other: &StatsAcc) {
        if !other.seen {
            return;
        }
        if self.seen {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        } else {
            self.min = other.min;
            self.max = other.max;
            self.seen = true;
        }
        self.sum += other.sum;
        self.count += other.count;
        self.sumsqr += other.sumsqr;
    }

    fn from_object(fields: &Map<String, Value>) -> Result<Self> {
        let mut acc = Self {
            seen: true,
            ..Self::default()
        };
        acc.sum = stats_field(fields, "sum")?;
        acc.min = stats_field(fields, "min")?;
        acc.max = stats_field(fields, "max")?;
        acc.count = stats_field(fields, "count")?;
        acc.sumsqr = stats_field(fields, "sumsqr")?;
        Ok(acc)
    }

    fn to_value(self) -> Value {
        let mut out = Map::new();
        out.insert("sum".into(), number(self.sum));
        out.insert("count".into(), number(self.count));
        out.insert("min".into(), number(if self.seen { self.min } else { 0.0 }));
        out.insert("max".into(), number(if self.seen { self.max } else { 0.0 }));
        out.insert("sumsqr".into(), number(self.sumsqr));
        Value::Object(out)
    }
}

fn stats_field(fields: &Map<String, Value>, name: &str) -> Result<f64> {
    fields
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            Error::bad_request(format!(
                "user _stats input missing required field {name}"
            ))
        })
}

fn stats(values: &[Value], rereduce: bool) -> Result<Value> {
    let mut scalar = StatsAcc::default();
    let mut vector: Vec<StatsAcc> = Vec::new();
    let mut saw_vector = false;

    for v in values {
        match v {
            Value::Array(elements) => {
                saw_vector = true;
                if vector.len() < elements.len() {
                    vector.resize(elements.len(), StatsAcc::default());
                }
                for (i, element) in elements.iter().enumerate() {
                    accumulate_stats(&mut vector[i], element, rereduce)?;
                }
            }
            other => accumulate_stats(&mut scalar, other, rereduce)?,
        }
    }

    if saw_vector {
        if scalar.seen {
            return Err(Error::bad_request(
                "the _stats function cannot mix scalar and array input",
            ));
        }
        return Ok(Value::Array(
            vector.into_iter().map(StatsAcc::to_value).collect(),
        ));
    }
    Ok(scalar.to_value())
}

/// A map value that is already a stats object is folded in as a
/// pre-aggregate, both in first-phase reduce and in re-reduce.
fn accumulate_stats(acc: &mut StatsAcc, v: &Value, rereduce: bool) -> Result<()> {
    match v {
        Value::Object(fields) => {
            acc.merge(&StatsAcc::from_object(fields)?);
            Ok(())
        }
        Value::Number(n) if !rereduce => {
            acc.add_number(n.as_f64().unwrap_or(0.0));
            Ok(())
        }
        _ => Err(Error::bad_request(
            "the _stats function requires that map values be numbers or arrays of numbers",
        )),
    }
}

fn approx_count_distinct(
    keys: &[(Value, String)],
    values: &[Value],
    rereduce: bool,
) -> Result<Value> {
    if rereduce {
        // Inputs cover disjoint key ranges (up to batch-boundary keys), so
        // the estimates sum.
        let mut total = 0.0;
        for v in values {
            total += as_number(v, "_approx_count_distinct")?;
        }
        return Ok(number(total));
    }
    let distinct: HashSet<String> = keys.iter().map(|(k, _)| canonical_text(k)).collect();
    Ok(Value::from(distinct.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keyed(values: &[Value]) -> Vec<(Value, String)> {
        values
            .iter()
            .enumerate()
            .map(|(i, _)| (json!(format!("k{i}")), format!("d{i}")))
            .collect()
    }

    #[test]
    fn count_counts_rows_then_sums() {
        let values = vec![json!(null), json!(null), json!(null)];
        let got = BuiltinReducer::Count
            .call(&keyed(&values), &values, false)
            .unwrap();
        assert_eq!(got, json!(3));

        let got = BuiltinReducer::Count
            .call(&[], &[json!(3), json!(4)], true)
            .unwrap();
        assert_eq!(got, json!(7));
    }

    #[test]
    fn sum_handles_scalars_and_arrays() {
        let values = vec![json!(1), json!(2.5), json!(3)];
        let got = BuiltinReducer::Sum.call(&keyed(&values), &values, false).unwrap();
        assert_eq!(got, json!(6.5));

        let values = vec![json!([1, 2]), json!([3, 4, 5])];
        let got = BuiltinReducer::Sum.call(&keyed(&values), &values, false).unwrap();
        assert_eq!(got, json!([4, 6, 5]));
    }

    #[test]
    fn sum_rejects_non_numbers() {
        let values = vec![json!("nope")];
        assert!(BuiltinReducer::Sum
            .call(&keyed(&values), &values, false)
            .is_err());
    }

    #[test]
    fn stats_over_numbers() {
        let values = vec![json!(1), json!(2), json!(3)];
        let got = BuiltinReducer::Stats
            .call(&keyed(&values), &values, false)
            .unwrap();
        assert_eq!(
            got,
            json!({"sum": 6, "count": 3, "min": 1, "max": 3, "sumsqr": 14})
        );
    }

    #[test]
    fn stats_folds_pre_aggregated_objects() {
        // A map value may itself be a stats object; extra keys are ignored.
        let values = vec![
            json!(100),
            json!({"sum": 5, "min": 5, "max": 5, "count": 5, "sumsqr": 5, "ignored": 5}),
        ];
        let got = BuiltinReducer::Stats
            .call(&keyed(&values), &values, false)
            .unwrap();
        assert_eq!(
            got,
            json!({"sum": 105, "count": 6, "min": 5, "max": 100, "sumsqr": 10005})
        );
    }

    #[test]
    fn stats_rereduce_merges() {
        let values = vec![
            json!({"sum": 6, "count": 3, "min": 1, "max": 3, "sumsqr": 14}),
            json!({"sum": 10, "count": 2, "min": 4, "max": 6, "sumsqr": 52}),
        ];
        let got = BuiltinReducer::Stats.call(&[], &values, true).unwrap();
        assert_eq!(
            got,
            json!({"sum": 16, "count": 5, "min": 1, "max": 6, "sumsqr": 66})
        );
    }

    #[test]
    fn stats_rejects_missing_fields() {
        let values = vec![json!({"sum": 1})];
        let err = BuiltinReducer::Stats.call(&[], &values, true).unwrap_err();
        assert!(err.to_string().contains("missing required field"));
    }

    #[test]
    fn stats_rejects_numbers_in_rereduce() {
        let values = vec![json!(7)];
        assert!(BuiltinReducer::Stats.call(&[], &values, true).is_err());
    }

    #[test]
    fn approx_count_distinct_counts_keys() {
        let keys = vec![
            (json!("a"), "d1".to_owned()),
            (json!("a"), "d2".to_owned()),
            (json!("b"), "d3".to_owned()),
        ];
        let values = vec![json!(null); 3];
        let got = BuiltinReducer::ApproxCountDistinct
            .call(&keys, &values, false)
            .unwrap();
        assert_eq!(got, json!(2));

        let got = BuiltinReducer::ApproxCountDistinct
            .call(&[], &[json!(2), json!(3)], true)
            .unwrap();
        assert_eq!(got, json!(5));
    }

    #[test]
    fn parse_is_exact() {
        assert_eq!(BuiltinReducer::parse("_count"), Some(BuiltinReducer::Count));
        assert_eq!(BuiltinReducer::parse("_sum"), Some(BuiltinReducer::Sum));
        assert_eq!(BuiltinReducer::parse("_stats"), Some(BuiltinReducer::Stats));
        assert_eq!(
            BuiltinReducer::parse("_approx_count_distinct"),
            Some(BuiltinReducer::ApproxCountDistinct)
        );
        assert_eq!(BuiltinReducer::parse(" _count"), None);
        assert_eq!(BuiltinReducer::parse("function(k,v) {}"), None);
    }
}
