//! Runtime value representation of component properties.
//!
//! Properties have a fixed primitive dtype declared in the schema; rows carry
//! one [`Value`] per property. Secondary indexes order rows by [`IndexKey`],
//! which collapses the numeric dtypes into a single totally-ordered key so
//! one index structure serves every dtype.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Fixed primitive dtype of a property.
///
/// Strings and byte strings are fixed-capacity: the capacity is part of the
/// schema and values longer than it are rejected at write time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Str(u32),
    Bytes(u32),
}

impl PropType {
    /// The canonical dtype tag stored in the component's schema JSON.
    pub fn tag(&self) -> String {
        match self {
            PropType::I8 => "i8".into(),
            PropType::I16 => "i16".into(),
            PropType::I32 => "i32".into(),
            PropType::I64 => "i64".into(),
            PropType::U8 => "u8".into(),
            PropType::U16 => "u16".into(),
            PropType::U32 => "u32".into(),
            PropType::U64 => "u64".into(),
            PropType::F32 => "f32".into(),
            PropType::F64 => "f64".into(),
            PropType::Bool => "bool".into(),
            PropType::Str(n) => format!("str{n}"),
            PropType::Bytes(n) => format!("bytes{n}"),
        }
    }

    pub fn parse_tag(tag: &str) -> Result<Self, SchemaError> {
        let t = match tag {
            "i8" => PropType::I8,
            "i16" => PropType::I16,
            "i32" => PropType::I32,
            "i64" => PropType::I64,
            "u8" => PropType::U8,
            "u16" => PropType::U16,
            "u32" => PropType::U32,
            "u64" => PropType::U64,
            "f32" => PropType::F32,
            "f64" => PropType::F64,
            "bool" => PropType::Bool,
            _ => {
                let parse_cap = |rest: &str| rest.parse::<u32>().ok();
                if let Some(rest) = tag.strip_prefix("str") {
                    PropType::Str(parse_cap(rest).ok_or_else(|| SchemaError::BadDtype(tag.into()))?)
                } else if let Some(rest) = tag.strip_prefix("bytes") {
                    PropType::Bytes(
                        parse_cap(rest).ok_or_else(|| SchemaError::BadDtype(tag.into()))?,
                    )
                } else {
                    return Err(SchemaError::BadDtype(tag.into()));
                }
            }
        };
        Ok(t)
    }

    /// String-like dtypes are ordered lexicographically in indexes and accept
    /// `(x` / `[x` endpoint prefixes in range queries.
    pub fn is_string_like(&self) -> bool {
        matches!(self, PropType::Str(_) | PropType::Bytes(_))
    }

    pub fn is_numeric(&self) -> bool {
        !self.is_string_like() // bool indexes as 0/1
    }

    /// Smallest representable key, used to clamp `-inf` query sentinels.
    pub fn min_key(&self) -> IndexKey {
        match self {
            PropType::I8 => IndexKey::Int(i8::MIN as i128),
            PropType::I16 => IndexKey::Int(i16::MIN as i128),
            PropType::I32 => IndexKey::Int(i32::MIN as i128),
            PropType::I64 => IndexKey::Int(i64::MIN as i128),
            PropType::U8 | PropType::U16 | PropType::U32 | PropType::U64 | PropType::Bool => {
                IndexKey::Int(0)
            }
            PropType::F32 => IndexKey::Float(TotalF64(f32::MIN as f64)),
            PropType::F64 => IndexKey::Float(TotalF64(f64::MIN)),
            PropType::Str(_) => IndexKey::Str(String::new()),
            PropType::Bytes(_) => IndexKey::Bytes(Vec::new()),
        }
    }

    /// Largest representable key, used to clamp `+inf` query sentinels.
    pub fn max_key(&self) -> IndexKey {
        match self {
            PropType::I8 => IndexKey::Int(i8::MAX as i128),
            PropType::I16 => IndexKey::Int(i16::MAX as i128),
            PropType::I32 => IndexKey::Int(i32::MAX as i128),
            PropType::I64 => IndexKey::Int(i64::MAX as i128),
            PropType::U8 => IndexKey::Int(u8::MAX as i128),
            PropType::U16 => IndexKey::Int(u16::MAX as i128),
            PropType::U32 => IndexKey::Int(u32::MAX as i128),
            PropType::U64 => IndexKey::Int(u64::MAX as i128),
            PropType::Bool => IndexKey::Int(1),
            PropType::F32 => IndexKey::Float(TotalF64(f32::MAX as f64)),
            PropType::F64 => IndexKey::Float(TotalF64(f64::MAX)),
            // No finite maximum for lex keys; a capacity-filled 0xFF string
            // sorts after any valid UTF-8 value of that capacity.
            PropType::Str(_) => IndexKey::Str("\u{10FFFF}".repeat(64)),
            PropType::Bytes(n) => IndexKey::Bytes(vec![0xFF; *n as usize + 1]),
        }
    }
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// One property value. The variant always matches the property's dtype.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Whether this value is storable under `ty` (variant match plus
    /// capacity check for string-like dtypes).
    pub fn matches(&self, ty: &PropType) -> bool {
        match (self, ty) {
            (Value::I8(_), PropType::I8)
            | (Value::I16(_), PropType::I16)
            | (Value::I32(_), PropType::I32)
            | (Value::I64(_), PropType::I64)
            | (Value::U8(_), PropType::U8)
            | (Value::U16(_), PropType::U16)
            | (Value::U32(_), PropType::U32)
            | (Value::U64(_), PropType::U64)
            | (Value::F32(_), PropType::F32)
            | (Value::F64(_), PropType::F64)
            | (Value::Bool(_), PropType::Bool) => true,
            (Value::Str(s), PropType::Str(cap)) => s.chars().count() <= *cap as usize,
            (Value::Bytes(b), PropType::Bytes(cap)) => b.len() <= *cap as usize,
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(*v as i64),
            Value::I16(v) => Some(*v as i64),
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            Value::U8(v) => Some(*v as i64),
            Value::U16(v) => Some(*v as i64),
            Value::U32(v) => Some(*v as i64),
            Value::U64(v) => i64::try_from(*v).ok(),
            Value::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The wire string form used by raw row dicts and change payloads.
    pub fn to_raw(&self) -> String {
        match self {
            Value::I8(v) => v.to_string(),
            Value::I16(v) => v.to_string(),
            Value::I32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::U8(v) => v.to_string(),
            Value::U16(v) => v.to_string(),
            Value::U32(v) => v.to_string(),
            Value::U64(v) => v.to_string(),
            Value::F32(v) => format!("{v:?}"),
            Value::F64(v) => format!("{v:?}"),
            Value::Bool(v) => (*v as u8).to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => hex::encode(b),
        }
    }

    /// Parse the wire string form back into a typed value.
    pub fn from_raw(ty: &PropType, s: &str) -> Option<Value> {
        let v = match ty {
            PropType::I8 => Value::I8(s.parse().ok()?),
            PropType::I16 => Value::I16(s.parse().ok()?),
            PropType::I32 => Value::I32(s.parse().ok()?),
            PropType::I64 => Value::I64(s.parse().ok()?),
            PropType::U8 => Value::U8(s.parse().ok()?),
            PropType::U16 => Value::U16(s.parse().ok()?),
            PropType::U32 => Value::U32(s.parse().ok()?),
            PropType::U64 => Value::U64(s.parse().ok()?),
            PropType::F32 => Value::F32(s.parse().ok()?),
            PropType::F64 => Value::F64(s.parse().ok()?),
            PropType::Bool => Value::Bool(s.parse::<u8>().ok()? != 0),
            PropType::Str(_) => Value::Str(s.to_owned()),
            PropType::Bytes(_) => Value::Bytes(hex::decode(s).ok()?),
        };
        Some(v)
    }

    /// The typed-dict (JSON) form used by subscription payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::I8(v) => (*v).into(),
            Value::I16(v) => (*v).into(),
            Value::I32(v) => (*v).into(),
            Value::I64(v) => (*v).into(),
            Value::U8(v) => (*v).into(),
            Value::U16(v) => (*v).into(),
            Value::U32(v) => (*v).into(),
            Value::U64(v) => (*v).into(),
            Value::F32(v) => serde_json::json!(*v),
            Value::F64(v) => serde_json::json!(*v),
            Value::Bool(v) => (*v).into(),
            Value::Str(s) => s.clone().into(),
            Value::Bytes(b) => hex::encode(b).into(),
        }
    }

    pub fn from_json(ty: &PropType, v: &serde_json::Value) -> Option<Value> {
        let out = match ty {
            PropType::I8 => Value::I8(i8::try_from(v.as_i64()?).ok()?),
            PropType::I16 => Value::I16(i16::try_from(v.as_i64()?).ok()?),
            PropType::I32 => Value::I32(i32::try_from(v.as_i64()?).ok()?),
            PropType::I64 => Value::I64(v.as_i64()?),
            PropType::U8 => Value::U8(u8::try_from(v.as_u64()?).ok()?),
            PropType::U16 => Value::U16(u16::try_from(v.as_u64()?).ok()?),
            PropType::U32 => Value::U32(u32::try_from(v.as_u64()?).ok()?),
            PropType::U64 => Value::U64(v.as_u64()?),
            PropType::F32 => Value::F32(v.as_f64()? as f32),
            PropType::F64 => Value::F64(v.as_f64()?),
            PropType::Bool => Value::Bool(v.as_bool().or(v.as_i64().map(|i| i != 0))?),
            PropType::Str(_) => Value::Str(v.as_str()?.to_owned()),
            PropType::Bytes(_) => Value::Bytes(hex::decode(v.as_str()?).ok()?),
        };
        Some(out)
    }

    /// The ordering key this value takes in a secondary index.
    pub fn index_key(&self) -> IndexKey {
        match self {
            Value::F32(v) => IndexKey::Float(TotalF64(*v as f64)),
            Value::F64(v) => IndexKey::Float(TotalF64(*v)),
            Value::Str(s) => IndexKey::Str(s.clone()),
            Value::Bytes(b) => IndexKey::Bytes(b.clone()),
            other => IndexKey::Int(match other {
                Value::U64(v) => *v as i128,
                _ => other.as_i64().unwrap_or(0) as i128,
            }),
        }
    }
}

/// `f64` with the IEEE total order, so float keys are `Ord` (and hashable,
/// for commit-time duplicate detection).
#[derive(Clone, Copy, Debug)]
pub struct TotalF64(pub f64);

impl PartialEq for TotalF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}
impl Eq for TotalF64 {}
impl std::hash::Hash for TotalF64 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Consistent with the total order: distinct bit patterns that the
        // total order distinguishes hash apart.
        self.0.to_bits().hash(state);
    }
}
impl PartialOrd for TotalF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TotalF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Totally-ordered index key. Within one index every key is the same variant
/// because the indexed property has a single dtype.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Int(i128),
    Float(TotalF64),
    Str(String),
    Bytes(Vec<u8>),
}

/// One endpoint of a range query: the key plus whether the endpoint is open.
#[derive(Clone, Debug)]
pub struct IndexBound {
    pub key: IndexKey,
    pub open: bool,
}

impl IndexBound {
    pub fn closed(key: IndexKey) -> Self {
        IndexBound { key, open: false }
    }

    /// Interpret a query value against an index of dtype `ty`.
    ///
    /// String-like indexes accept a `(x` or `[x` prefix choosing an open or
    /// closed endpoint. Numeric indexes accept `±inf` float sentinels, which
    /// clamp to the dtype's extrema.
    pub fn from_query(ty: &PropType, value: &Value) -> Option<IndexBound> {
        if ty.is_string_like() {
            let s = value.as_str()?;
            let (open, rest) = match s.as_bytes().first() {
                Some(b'(') => (true, &s[1..]),
                Some(b'[') => (false, &s[1..]),
                _ => (false, s),
            };
            return Some(match ty {
                PropType::Bytes(_) => IndexBound {
                    key: IndexKey::Bytes(hex::decode(rest).ok()?),
                    open,
                },
                _ => IndexBound {
                    key: IndexKey::Str(rest.to_owned()),
                    open,
                },
            });
        }
        // Numeric index: infinities clamp, finite floats must match a float
        // dtype, integers coerce freely between the numeric dtypes.
        match value {
            Value::F32(f) if f.is_infinite() => Some(IndexBound::closed(clamp_inf(ty, *f as f64))),
            Value::F64(f) if f.is_infinite() => Some(IndexBound::closed(clamp_inf(ty, *f))),
            Value::F32(_) | Value::F64(_) => {
                if matches!(ty, PropType::F32 | PropType::F64) {
                    Some(IndexBound::closed(value.index_key()))
                } else {
                    None
                }
            }
            _ => {
                let key = match ty {
                    PropType::F32 | PropType::F64 => IndexKey::Float(TotalF64(value.as_f64()?)),
                    _ => match value {
                        Value::U64(v) => IndexKey::Int(*v as i128),
                        _ => IndexKey::Int(value.as_i64()? as i128),
                    },
                };
                Some(IndexBound::closed(key))
            }
        }
    }
}

fn clamp_inf(ty: &PropType, f: f64) -> IndexKey {
    if f.is_sign_negative() {
        ty.min_key()
    } else {
        ty.max_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dtype_tags_round_trip() {
        for ty in [
            PropType::I8,
            PropType::U64,
            PropType::F32,
            PropType::Bool,
            PropType::Str(16),
            PropType::Bytes(128),
        ] {
            assert_eq!(PropType::parse_tag(&ty.tag()).unwrap(), ty);
        }
        assert!(PropType::parse_tag("str").is_err());
        assert!(PropType::parse_tag("void").is_err());
    }

    #[test]
    fn raw_round_trip() {
        let cases = [
            (PropType::I64, Value::I64(-42)),
            (PropType::U64, Value::U64(u64::MAX)),
            (PropType::F64, Value::F64(1.5)),
            (PropType::Bool, Value::Bool(true)),
            (PropType::Str(8), Value::Str("sword".into())),
            (PropType::Bytes(4), Value::Bytes(vec![0, 255, 3])),
        ];
        for (ty, v) in cases {
            assert_eq!(Value::from_raw(&ty, &v.to_raw()).unwrap(), v);
        }
    }

    #[test]
    fn capacity_enforced() {
        assert!(Value::Str("abcd".into()).matches(&PropType::Str(4)));
        assert!(!Value::Str("abcde".into()).matches(&PropType::Str(4)));
    }

    #[test]
    fn index_key_ordering() {
        assert!(Value::I64(-1).index_key() < Value::I64(0).index_key());
        assert!(Value::U64(u64::MAX).index_key() > Value::I64(i64::MAX).index_key());
        assert!(Value::F64(-0.5).index_key() < Value::F64(0.5).index_key());
        assert!(Value::Str("a".into()).index_key() < Value::Str("b".into()).index_key());
    }

    #[test]
    fn inf_clamps_to_extrema() {
        let b = IndexBound::from_query(&PropType::I32, &Value::F64(f64::INFINITY)).unwrap();
        assert_eq!(b.key, IndexKey::Int(i32::MAX as i128));
        let b = IndexBound::from_query(&PropType::U16, &Value::F64(f64::NEG_INFINITY)).unwrap();
        assert_eq!(b.key, IndexKey::Int(0));
    }

    #[test]
    fn string_bound_prefixes() {
        let ty = PropType::Str(16);
        let b = IndexBound::from_query(&ty, &Value::Str("(abc".into())).unwrap();
        assert!(b.open);
        assert_eq!(b.key, IndexKey::Str("abc".into()));
        let b = IndexBound::from_query(&ty, &Value::Str("[abc".into())).unwrap();
        assert!(!b.open);
        let b = IndexBound::from_query(&ty, &Value::Str("abc".into())).unwrap();
        assert!(!b.open);
    }
}
