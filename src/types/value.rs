//! # Runtime Value Representation
//!
//! `Value` is the typed-value interface between the engine and its
//! consumers (query execution, dump serialisers, and the REPL are all
//! external collaborators). Writes accept `Value`s and intern them into
//! slots and element stores; reads reconstruct `Value`s from slots.
//!
//! Composite- and interface-typed fields read back as `Value::Ref` rather
//! than a deep record, which keeps reads over cyclic data terminating;
//! strings, arrays, sets, dictionaries, enum payloads, and big numerics are
//! reconstructed in full.

use std::fmt;

use eyre::{bail, Result};

use super::bignum::BigNum;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Char(char),
    /// Any signed integer primitive, including int128.
    Int(i128),
    /// Any unsigned integer primitive, including uint128.
    UInt(u128),
    Float(f64),
    Str(String),
    /// Array and set literals; sets deduplicate on the write path.
    Array(Vec<Value>),
    /// Dictionary literal as insertion-ordered entries.
    Dict(Vec<(Value, Value)>),
    /// Composite literal; interned into its table catalog on write.
    Record {
        type_name: String,
        fields: Vec<(String, Value)>,
    },
    /// Reference to an existing record in a table catalog.
    Ref { type_name: String, index: u32 },
    /// Enum value; `fields` is empty for bare variants.
    Enum {
        variant: String,
        fields: Vec<(String, Value)>,
    },
    BigInt(BigNum),
    Fraction { num: BigNum, den: BigNum },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn record(type_name: impl Into<String>, fields: Vec<(&str, Value)>) -> Self {
        Value::Record {
            type_name: type_name.into(),
            fields: fields.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
        }
    }

    pub fn reference(type_name: impl Into<String>, index: u32) -> Self {
        Value::Ref {
            type_name: type_name.into(),
            index,
        }
    }

    pub fn enum_bare(variant: impl Into<String>) -> Self {
        Value::Enum {
            variant: variant.into(),
            fields: Vec::new(),
        }
    }

    pub fn enum_with(variant: impl Into<String>, fields: Vec<(&str, Value)>) -> Self {
        Value::Enum {
            variant: variant.into(),
            fields: fields.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
        }
    }

    /// Field accessor for `Record` and `Enum` values.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record { fields, .. } | Value::Enum { fields, .. } => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => bail!("expected string value, found {}", other.kind_name()),
        }
    }

    pub fn as_int(&self) -> Result<i128> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::UInt(v) if *v <= i128::MAX as u128 => Ok(*v as i128),
            other => bail!("expected integer value, found {}", other.kind_name()),
        }
    }

    pub fn as_ref_index(&self) -> Result<u32> {
        match self {
            Value::Ref { index, .. } => Ok(*index),
            other => bail!("expected record reference, found {}", other.kind_name()),
        }
    }

    pub fn as_array(&self) -> Result<&[Value]> {
        match self {
            Value::Array(items) => Ok(items),
            other => bail!("expected array value, found {}", other.kind_name()),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Char(_) => "character",
            Value::Int(_) => "integer",
            Value::UInt(_) => "unsigned integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Dict(_) => "dictionary",
            Value::Record { .. } => "record",
            Value::Ref { .. } => "reference",
            Value::Enum { .. } => "enum",
            Value::BigInt(_) => "bigint",
            Value::Fraction { .. } => "fraction",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Char(c) => write!(f, "'{}'", c),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Record { type_name, fields } => {
                write!(f, "{}(", type_name)?;
                for (i, (n, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", n, v)?;
                }
                write!(f, ")")
            }
            Value::Ref { type_name, index } => write!(f, "{}#{}", type_name, index),
            Value::Enum { variant, fields } => {
                if fields.is_empty() {
                    write!(f, ".{}", variant)
                } else {
                    write!(f, ".{}(", variant)?;
                    for (i, (n, v)) in fields.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}={}", n, v)?;
                    }
                    write!(f, ")")
                }
            }
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Fraction { num, den } => write!(f, "{}/{}", num, den),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_lookup_on_records_and_enums() {
        let rec = Value::record("Person", vec![("name", Value::Str("Ada".into()))]);
        assert_eq!(rec.field("name"), Some(&Value::Str("Ada".into())));
        assert_eq!(rec.field("age"), None);

        let en = Value::enum_with("Circle", vec![("radius", Value::Float(2.0))]);
        assert_eq!(en.field("radius"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn display_is_readable() {
        let v = Value::record(
            "Point",
            vec![
                ("x", Value::Int(1)),
                ("tags", Value::Array(vec![Value::Str("a".into())])),
            ],
        );
        assert_eq!(v.to_string(), "Point(x=1, tags=[\"a\"])");
        assert_eq!(Value::reference("Node", 3).to_string(), "Node#3");
        assert_eq!(Value::enum_bare("Red").to_string(), ".Red");
    }

    #[test]
    fn as_int_accepts_small_uints() {
        assert_eq!(Value::UInt(7).as_int().unwrap(), 7);
        assert!(Value::UInt(u128::MAX).as_int().is_err());
        assert!(Value::Str("x".into()).as_int().is_err());
    }
}
