//! Selector parsing.

use regex::Regex;
use serde_json::Value;

use crate::ast::{Condition, JsonType, Selector};
use crate::{MangoError, MangoResult};

/// Parses a selector document.
///
/// The top level is an implicit `$and` over its members. A field whose
/// value is a scalar or array is implicit `$eq`; an object value either
/// carries exactly one `$` operator or descends into subfields.
pub fn parse(selector: &Value) -> MangoResult<Selector> {
    let obj = selector
        .as_object()
        .ok_or_else(|| MangoError::InvalidSelector("selector must be an object".into()))?;

    let mut clauses = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        clauses.push(parse_member(key, value)?);
    }
    Ok(match clauses.len() {
        1 => clauses.pop().unwrap_or(Selector::And(Vec::new())),
        _ => Selector::And(clauses),
    })
}

fn parse_member(key: &str, value: &Value) -> MangoResult<Selector> {
    if let Some(op) = key.strip_prefix('$') {
        return parse_combination(op, value);
    }
    parse_field(vec![key.to_owned()], value)
}

fn parse_combination(op: &str, value: &Value) -> MangoResult<Selector> {
    match op {
        "and" | "or" | "nor" => {
            let members = value.as_array().ok_or_else(|| {
                MangoError::InvalidSelector(format!("${op} argument must be an array"))
            })?;
            let parsed = members.iter().map(parse).collect::<MangoResult<Vec<_>>>()?;
            Ok(match op {
                "and" => Selector::And(parsed),
                "or" => Selector::Or(parsed),
                _ => Selector::Nor(parsed),
            })
        }
        "not" => Ok(Selector::Not(Box::new(parse(value)?))),
        other => Err(MangoError::UnknownOperator(format!("${other}"))),
    }
}

/// Parses a field's right-hand side, descending through nested objects.
fn parse_field(path: Vec<String>, value: &Value) -> MangoResult<Selector> {
    let Some(obj) = value.as_object() else {
        // Scalars and arrays are implicit equality.
        return Ok(Selector::Field {
            path,
            condition: Condition::Eq(value.clone()),
        });
    };

    let has_ops = obj.keys().any(|k| k.starts_with('$'));
    if !has_ops {
        if obj.is_empty() {
            return Ok(Selector::Field {
                path,
                condition: Condition::Eq(value.clone()),
            });
        }
        // No operators: every member is a subfield.
        let mut clauses = Vec::with_capacity(obj.len());
        for (key, sub) in obj {
            let mut sub_path = path.clone();
            sub_path.push(key.clone());
            clauses.push(parse_field(sub_path, sub)?);
        }
        return Ok(match clauses.len() {
            1 => clauses.pop().unwrap_or(Selector::And(Vec::new())),
            _ => Selector::And(clauses),
        });
    }

    // A condition object must carry exactly one operator key.
    if obj.len() != 1 {
        return Err(MangoError::TooManyKeys);
    }
    let (op, arg) = obj.iter().next().map(|(k, v)| (k.as_str(), v)).unwrap_or(("", value));
    let condition = parse_condition(op, arg)?;
    Ok(Selector::Field { path, condition })
}

fn parse_condition(op: &str, arg: &Value) -> MangoResult<Condition> {
    match op {
        "$eq" => Ok(Condition::Eq(arg.clone())),
        "$ne" => Ok(Condition::Ne(arg.clone())),
        "$lt" => Ok(Condition::Lt(arg.clone())),
        "$lte" => Ok(Condition::Lte(arg.clone())),
        "$gt" => Ok(Condition::Gt(arg.clone())),
        "$gte" => Ok(Condition::Gte(arg.clone())),
        "$exists" => arg
            .as_bool()
            .map(Condition::Exists)
            .ok_or_else(|| MangoError::InvalidSelector("$exists argument must be a boolean".into())),
        "$type" => {
            let name = arg.as_str().ok_or_else(|| {
                MangoError::InvalidSelector("$type argument must be a string".into())
            })?;
            JsonType::parse(name)
                .map(Condition::Type)
                .ok_or_else(|| MangoError::InvalidSelector(format!("unknown $type '{name}'")))
        }
        "$in" | "$nin" => {
            let values = arg.as_array().ok_or_else(|| {
                MangoError::InvalidSelector(format!("{op} argument must be an array"))
            })?;
            Ok(if op == "$in" {
                Condition::In(values.clone())
            } else {
                Condition::Nin(values.clone())
            })
        }
        "$size" => arg
            .as_u64()
            .map(Condition::Size)
            .ok_or_else(|| {
                MangoError::InvalidSelector("$size argument must be a non-negative integer".into())
            }),
        "$mod" => parse_mod(arg),
        "$regex" => {
            let pattern = arg.as_str().ok_or_else(|| {
                MangoError::InvalidSelector("$regex argument must be a string".into())
            })?;
            Regex::new(pattern)
                .map(Condition::Regex)
                .map_err(|e| MangoError::InvalidRegex(e.to_string()))
        }
        "$all" => {
            let values = arg.as_array().ok_or_else(|| {
                MangoError::InvalidSelector("$all argument must be an array".into())
            })?;
            Ok(Condition::All(values.clone()))
        }
        "$elemMatch" => Ok(Condition::ElemMatch(Box::new(parse_element(arg)?))),
        "$allMatch" => Ok(Condition::AllMatch(Box::new(parse_element(arg)?))),
        "$keyMapMatch" => Ok(Condition::KeyMapMatch(Box::new(parse_element(arg)?))),
        "$not" => {
            let obj = arg.as_object().ok_or_else(|| {
                MangoError::InvalidSelector("$not argument must be an object".into())
            })?;
            if obj.len() != 1 {
                return Err(MangoError::TooManyKeys);
            }
            let (inner_op, inner_arg) =
                obj.iter().next().map(|(k, v)| (k.as_str(), v)).unwrap_or(("", arg));
            Ok(Condition::Not(Box::new(parse_condition(inner_op, inner_arg)?)))
        }
        other => Err(MangoError::UnknownOperator(other.to_owned())),
    }
}

/// `$mod` takes `[divisor, remainder]`, both integers, divisor non-zero.
/// Non-integer arguments are rejected outright rather than echoing the
/// upstream behavior of a not-found response.
fn parse_mod(arg: &Value) -> MangoResult<Condition> {
    let parts = arg
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| {
            MangoError::InvalidSelector("$mod argument must be a two-element array".into())
        })?;
    let divisor = parts[0].as_i64().ok_or_else(|| {
        MangoError::InvalidSelector("$mod divisor must be an integer".into())
    })?;
    let remainder = parts[1].as_i64().ok_or_else(|| {
        MangoError::InvalidSelector("$mod remainder must be an integer".into())
    })?;
    if divisor == 0 {
        return Err(MangoError::InvalidSelector(
            "$mod divisor must not be zero".into(),
        ));
    }
    Ok(Condition::Mod { divisor, remainder })
}

/// Element-selector arguments are full selectors over the element; an
/// object of bare operators applies to the element itself.
fn parse_element(arg: &Value) -> MangoResult<Selector> {
    let obj = arg.as_object().ok_or_else(|| {
        MangoError::InvalidSelector("element selector argument must be an object".into())
    })?;
    let all_ops = !obj.is_empty() && obj.keys().all(|k| k.starts_with('$'));
    if all_ops {
        if obj.len() != 1 {
            return Err(MangoError::TooManyKeys);
        }
        let (op, inner) = obj.iter().next().map(|(k, v)| (k.as_str(), v)).unwrap_or(("", arg));
        if matches!(op, "$and" | "$or" | "$nor" | "$not") {
            return parse(arg);
        }
        return Ok(Selector::Field {
            path: Vec::new(),
            condition: parse_condition(op, inner)?,
        });
    }
    parse(arg)
}
