use std::fmt;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// A scalar value: trait values, flag values, and condition literals all use it.
///
/// Absence of a value is represented with `Option<Value>`, so `Value` itself is never null.
///
/// ```
/// # use flag_engine::Value;
/// let string_value: Value = "example".into();
/// let integer_value: Value = 42i64.into();
/// let float_value: Value = 4.2.into();
/// let bool_value: Value = true.into();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum Value {
    /// A boolean value.
    Boolean(bool),
    /// An integer value. JSON numbers without a fractional part land here.
    Integer(i64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    String(String),
}

impl Value {
    /// Returns the string slice if this is a `Value::String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the numeric value for integers and floats. Booleans and strings are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the boolean value if this is a `Value::Boolean`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

/// Stringification used by condition matching: `true`/`false`, decimal integers, shortest float
/// representation, and strings verbatim.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Value;

    #[test]
    fn deserializes_untagged_scalars() {
        let values: Vec<Value> = serde_json::from_str(r#"[true, 12, 1.5, "text"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Boolean(true),
                Value::Integer(12),
                Value::Float(1.5),
                Value::String("text".to_owned()),
            ]
        );
    }

    #[test]
    fn stringifies() {
        assert_eq!(Value::from(false).to_string(), "false");
        assert_eq!(Value::from(-7).to_string(), "-7");
        assert_eq!(Value::from(0.25).to_string(), "0.25");
        assert_eq!(Value::from("abc").to_string(), "abc");
    }

    #[test]
    fn numbers_exclude_booleans() {
        assert_eq!(Value::from(3).as_f64(), Some(3.0));
        assert_eq!(Value::from(true).as_f64(), None);
        assert_eq!(Value::from("3").as_f64(), None);
    }
}
