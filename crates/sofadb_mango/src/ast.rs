//! Selector tree types.

use regex::Regex;
use serde_json::Value;

/// JSON type names accepted by `$type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    /// `null`
    Null,
    /// `boolean`
    Boolean,
    /// `number`
    Number,
    /// `string`
    String,
    /// `array`
    Array,
    /// `object`
    Object,
}

impl JsonType {
    /// Parses a `$type` argument.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "null" => Some(Self::Null),
            "boolean" => Some(Self::Boolean),
            "number" => Some(Self::Number),
            "string" => Some(Self::String),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    /// Whether `value` has this type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Null, Value::Null)
                | (Self::Boolean, Value::Bool(_))
                | (Self::Number, Value::Number(_))
                | (Self::String, Value::String(_))
                | (Self::Array, Value::Array(_))
                | (Self::Object, Value::Object(_))
        )
    }
}

/// A single condition applied to a field's value.
#[derive(Debug, Clone)]
pub enum Condition {
    /// `$eq` (also the implicit form).
    Eq(Value),
    /// `$ne`
    Ne(Value),
    /// `$lt`
    Lt(Value),
    /// `$lte`
    Lte(Value),
    /// `$gt`
    Gt(Value),
    /// `$gte`
    Gte(Value),
    /// `$exists`
    Exists(bool),
    /// `$type`
    Type(JsonType),
    /// `$in`
    In(Vec<Value>),
    /// `$nin`
    Nin(Vec<Value>),
    /// `$size`
    Size(u64),
    /// `$mod`: `[divisor, remainder]`, divisor non-zero.
    Mod {
        /// The divisor.
        divisor: i64,
        /// The expected remainder.
        remainder: i64,
    },
    /// `$regex`
    Regex(Regex),
    /// `$all`
    All(Vec<Value>),
    /// `$elemMatch`: some array element matches.
    ElemMatch(Box<Selector>),
    /// `$allMatch`: every array element matches.
    AllMatch(Box<Selector>),
    /// `$keyMapMatch`: some object key matches.
    KeyMapMatch(Box<Selector>),
    /// `$not` nested inside a condition object.
    Not(Box<Condition>),
}

/// A parsed selector.
#[derive(Debug, Clone)]
pub enum Selector {
    /// `$and` (also the implicit top-level form).
    And(Vec<Selector>),
    /// `$or`
    Or(Vec<Selector>),
    /// `$nor`
    Nor(Vec<Selector>),
    /// `$not`
    Not(Box<Selector>),
    /// A condition on a dotted field path. An empty path applies the
    /// condition to the value itself (used inside element selectors).
    Field {
        /// Dotted path segments; empty means "the value itself".
        path: Vec<String>,
        /// The condition to apply.
        condition: Condition,
    },
}
