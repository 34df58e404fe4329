use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

/// A single column value.
///
/// The variants cover the types the engine can copy losslessly between dialects. Values that
/// have no dedicated variant are carried in their text form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Numeric(BigDecimal),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the value as an integer key, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(value) => Some(i64::from(*value)),
            Value::I64(value) => Some(*value),
            _ => None,
        }
    }

    /// Appends a type-tagged, unambiguous encoding of the value to `out`.
    ///
    /// Two values produce the same bytes only if they are equal, which makes the encoding
    /// usable for digests that are compared across dialects. Integers of different widths
    /// encode identically.
    pub fn encode_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),
            Value::Bool(value) => {
                out.push(1);
                out.push(u8::from(*value));
            }
            Value::I32(_) | Value::I64(_) => {
                out.push(2);
                out.extend_from_slice(&self.as_i64().unwrap_or_default().to_be_bytes());
            }
            Value::F64(value) => {
                out.push(3);
                out.extend_from_slice(&value.to_bits().to_be_bytes());
            }
            Value::Numeric(value) => encode_text(out, 4, &value.normalized().to_string()),
            Value::String(value) => encode_text(out, 5, value),
            Value::Bytes(value) => {
                out.push(6);
                out.extend_from_slice(&(value.len() as u64).to_be_bytes());
                out.extend_from_slice(value);
            }
            Value::Date(value) => encode_text(out, 7, &value.to_string()),
            Value::Timestamp(value) => {
                out.push(8);
                out.extend_from_slice(&value.and_utc().timestamp_micros().to_be_bytes());
            }
            Value::TimestampTz(value) => {
                out.push(9);
                out.extend_from_slice(&value.timestamp_micros().to_be_bytes());
            }
            Value::Uuid(value) => {
                out.push(10);
                out.extend_from_slice(value.as_bytes());
            }
            Value::Json(value) => encode_text(out, 11, &value.to_string()),
        }
    }
}

fn encode_text(out: &mut Vec<u8>, tag: u8, text: &str) {
    out.push(tag);
    out.extend_from_slice(&(text.len() as u64).to_be_bytes());
    out.extend_from_slice(text.as_bytes());
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::I32(value) => write!(f, "{value}"),
            Value::I64(value) => write!(f, "{value}"),
            Value::F64(value) => write!(f, "{value}"),
            Value::Numeric(value) => write!(f, "{value}"),
            Value::String(value) => f.write_str(value),
            Value::Bytes(value) => {
                f.write_str("\\x")?;
                for byte in value {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Date(value) => write!(f, "{value}"),
            Value::Timestamp(value) => write!(f, "{value}"),
            Value::TimestampTz(value) => write!(f, "{}", value.to_rfc3339()),
            Value::Uuid(value) => write!(f, "{value}"),
            Value::Json(value) => write!(f, "{value}"),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn canonical(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        value.encode_canonical(&mut out);
        out
    }

    #[test]
    fn integer_widths_encode_identically() {
        assert_eq!(canonical(&Value::I32(42)), canonical(&Value::I64(42)));
    }

    #[test]
    fn numeric_scale_does_not_change_encoding() {
        let a = Value::Numeric(BigDecimal::from_str("1.50").unwrap());
        let b = Value::Numeric(BigDecimal::from_str("1.5").unwrap());

        assert_eq!(canonical(&a), canonical(&b));
    }

    #[test]
    fn adjacent_strings_do_not_collide() {
        let mut ab_c = Vec::new();
        Value::from("ab").encode_canonical(&mut ab_c);
        Value::from("c").encode_canonical(&mut ab_c);

        let mut a_bc = Vec::new();
        Value::from("a").encode_canonical(&mut a_bc);
        Value::from("bc").encode_canonical(&mut a_bc);

        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn null_and_empty_string_differ() {
        assert_ne!(canonical(&Value::Null), canonical(&Value::from("")));
    }
}
