//! The dynamic value tree carried as request arguments, responses, and event
//! payloads, plus its `rmpv` mapping and scalar coercions.

use std::fmt;

/// A MessagePack-shaped dynamic value.
///
/// Map keys are restricted to strings: a wire-level map with a non-string
/// key is a decode error (see [`crate::codec`]), so this type never needs
/// to represent one.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Normalizes a decoded `args` value into a positional argument list,
    /// per the dispatcher's argument normalization rule: `Null` becomes an
    /// empty list, a `List` is used as-is, anything else becomes a
    /// single-element list.
    pub fn into_positional(self) -> Vec<Value> {
        match self {
            Value::Null => Vec::new(),
            Value::List(items) => items,
            other => vec![other],
        }
    }

    pub(crate) fn from_rmpv(v: rmpv::Value) -> Result<Value, String> {
        match v {
            rmpv::Value::Nil => Ok(Value::Null),
            rmpv::Value::Boolean(b) => Ok(Value::Bool(b)),
            rmpv::Value::Integer(i) => {
                if let Some(n) = i.as_i64() {
                    if n < 0 {
                        Ok(Value::Int(n))
                    } else {
                        Ok(Value::UInt(n as u64))
                    }
                } else if let Some(u) = i.as_u64() {
                    Ok(Value::UInt(u))
                } else {
                    Err("integer out of representable range".to_string())
                }
            }
            rmpv::Value::F32(f) => Ok(Value::Float(f as f64)),
            rmpv::Value::F64(f) => Ok(Value::Float(f)),
            rmpv::Value::String(s) => match s.into_str() {
                Some(s) => Ok(Value::Str(s)),
                None => Err("string payload is not valid UTF-8".to_string()),
            },
            rmpv::Value::Binary(b) => Ok(Value::Bin(b)),
            rmpv::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Value::from_rmpv(item)?);
                }
                Ok(Value::List(out))
            }
            rmpv::Value::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = k
                        .as_str()
                        .ok_or_else(|| "map key is not a string".to_string())?
                        .to_string();
                    out.push((key, Value::from_rmpv(v)?));
                }
                Ok(Value::Map(out))
            }
            rmpv::Value::Ext(_, _) => Err("ext types are not supported".to_string()),
        }
    }

    pub(crate) fn to_rmpv(&self) -> rmpv::Value {
        match self {
            Value::Null => rmpv::Value::Nil,
            Value::Bool(b) => rmpv::Value::Boolean(*b),
            Value::Int(i) => rmpv::Value::Integer((*i).into()),
            Value::UInt(u) => rmpv::Value::Integer((*u).into()),
            Value::Float(f) => rmpv::Value::F64(*f),
            Value::Str(s) => rmpv::Value::String(s.clone().into()),
            Value::Bin(b) => rmpv::Value::Binary(b.clone()),
            Value::List(items) => {
                rmpv::Value::Array(items.iter().map(Value::to_rmpv).collect())
            }
            Value::Map(entries) => rmpv::Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (rmpv::Value::String(k.clone().into()), v.to_rmpv()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bin(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self { Value::Int(v as i64) }
        })*
    };
}
macro_rules! from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self { Value::UInt(v as u64) }
        })*
    };
}
from_signed!(i8, i16, i32, i64);
from_unsigned!(u8, u16, u32, u64);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bin(v)
    }
}

/// Coercion target for dispatcher arguments (see [`crate::service`]).
///
/// Implementations mirror the conversion rules in the component design:
/// exact matches pass through, numeric widening is allowed where
/// representable, and everything else fails with a descriptive message.
pub trait FromValue: Sized {
    fn from_value(v: &Value) -> Result<Self, String>;
}

impl FromValue for Value {
    fn from_value(v: &Value) -> Result<Self, String> {
        Ok(v.clone())
    }
}

impl FromValue for bool {
    fn from_value(v: &Value) -> Result<Self, String> {
        match v {
            Value::Bool(b) => Ok(*b),
            other => Err(format!("cannot convert {} to bool", type_name(other))),
        }
    }
}

impl FromValue for String {
    fn from_value(v: &Value) -> Result<Self, String> {
        match v {
            Value::Str(s) => Ok(s.clone()),
            other => Err(format!("cannot convert {} to str", type_name(other))),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(v: &Value) -> Result<Self, String> {
        match v {
            Value::Bin(b) => Ok(b.clone()),
            other => Err(format!("cannot convert {} to bin", type_name(other))),
        }
    }
}

macro_rules! from_value_int {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(impl FromValue for $t {
            fn from_value(v: &Value) -> Result<Self, String> {
                match v {
                    Value::Int(i) => <$t>::try_from(*i).map_err(|_| format!("{} out of range for {}", i, $name)),
                    Value::UInt(u) => <$t>::try_from(*u).map_err(|_| format!("{} out of range for {}", u, $name)),
                    Value::Float(f) => {
                        if f.fract() != 0.0 {
                            Err(format!("{} is not an exact integer for {}", f, $name))
                        } else if *f < <$t>::MIN as f64 || *f > <$t>::MAX as f64 {
                            Err(format!("{} out of range for {}", f, $name))
                        } else {
                            Ok(*f as $t)
                        }
                    }
                    other => Err(format!("cannot convert {} to {}", type_name(other), $name)),
                }
            }
        })*
    };
}
from_value_int!(i8 => "i8", i16 => "i16", i32 => "i32", i64 => "i64", u8 => "u8", u16 => "u16", u32 => "u32", u64 => "u64");

impl FromValue for f64 {
    fn from_value(v: &Value) -> Result<Self, String> {
        match v {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::UInt(u) => Ok(*u as f64),
            other => Err(format!("cannot convert {} to f64", type_name(other))),
        }
    }
}

impl FromValue for f32 {
    fn from_value(v: &Value) -> Result<Self, String> {
        f64::from_value(v).map(|f| f as f32)
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::UInt(_) => "uint",
        Value::Float(_) => "float",
        Value::Str(_) => "str",
        Value::Bin(_) => "bin",
        Value::List(_) => "list",
        Value::Map(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip_through_rmpv() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-7),
            Value::UInt(7),
            Value::Float(1.5),
            Value::Str("hello".into()),
            Value::Bin(vec![1, 2, 3]),
            Value::List(vec![Value::Int(1), Value::Str("x".into())]),
            Value::Map(vec![("a".into(), Value::Int(1))]),
        ];
        for v in values {
            let round = Value::from_rmpv(v.to_rmpv()).unwrap();
            assert_eq!(v, round);
        }
    }

    #[test]
    fn into_positional_normalizes() {
        assert_eq!(Value::Null.into_positional(), Vec::<Value>::new());
        assert_eq!(
            Value::List(vec![Value::Int(1)]).into_positional(),
            vec![Value::Int(1)]
        );
        assert_eq!(
            Value::Int(5).into_positional(),
            vec![Value::Int(5)]
        );
    }

    #[test]
    fn numeric_widening_coercion() {
        assert_eq!(i64::from_value(&Value::UInt(3)).unwrap(), 3);
        assert_eq!(u8::from_value(&Value::Int(3)).unwrap(), 3);
        assert!(u8::from_value(&Value::Int(-1)).is_err());
        assert_eq!(f64::from_value(&Value::Int(2)).unwrap(), 2.0);
    }

    #[test]
    fn exact_float_coerces_to_integer() {
        assert_eq!(i64::from_value(&Value::Float(4.0)).unwrap(), 4);
        assert!(i64::from_value(&Value::Float(4.5)).is_err());
        assert!(u8::from_value(&Value::Float(1000.0)).is_err());
    }

    #[test]
    fn map_with_non_string_key_rejected_on_decode() {
        let bad = rmpv::Value::Map(vec![(rmpv::Value::Integer(1.into()), rmpv::Value::Nil)]);
        assert!(Value::from_rmpv(bad).is_err());
    }
}
