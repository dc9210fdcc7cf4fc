//! Typed scalar values and the conversion/comparison rules shared by the
//! function evaluator, the math evaluator, and the result assembler.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::geo::Geometry;
use super::{QueryError, Result, Uid};

/// Schema-level type of a predicate value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Untyped string storage (treated as [`ValueType::String`]).
    Default,
    /// UTF-8 string.
    String,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
    /// Datetime with a retained UTC offset.
    DateTime,
    /// Geometry (GeoJSON-shaped).
    Geo,
    /// Edge to another node.
    Uid,
}

impl ValueType {
    /// Human-readable name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Default => "default",
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::DateTime => "datetime",
            ValueType::Geo => "geo",
            ValueType::Uid => "uid",
        }
    }

    /// The type's zero value, used when a variable read has no binding.
    pub fn zero(self) -> TypedValue {
        match self {
            ValueType::Default | ValueType::String => TypedValue::Str(String::new()),
            ValueType::Int => TypedValue::Int(0),
            ValueType::Float => TypedValue::Float(0.0),
            ValueType::Bool => TypedValue::Bool(false),
            ValueType::DateTime => TypedValue::DateTime(OffsetDateTime::UNIX_EPOCH),
            ValueType::Geo => TypedValue::Str(String::new()),
            ValueType::Uid => TypedValue::Uid(Uid::ZERO),
        }
    }
}

/// Comparison operators understood by the evaluators.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CompareOp {
    /// Equality.
    Eq,
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl CompareOp {
    /// Applies the operator to an [`Ordering`].
    pub fn matches(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

/// A typed scalar value flowing through the executor.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
    /// UTF-8 string (language variants are a storage concern, not a value
    /// concern).
    Str(String),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Datetime; comparisons use the UTC instant, display keeps the offset.
    DateTime(OffsetDateTime),
    /// Geometry value.
    Geo(Geometry),
    /// Node reference.
    Uid(Uid),
}

impl TypedValue {
    /// The value's type tag.
    pub fn value_type(&self) -> ValueType {
        match self {
            TypedValue::Str(_) => ValueType::String,
            TypedValue::Int(_) => ValueType::Int,
            TypedValue::Float(_) => ValueType::Float,
            TypedValue::Bool(_) => ValueType::Bool,
            TypedValue::DateTime(_) => ValueType::DateTime,
            TypedValue::Geo(_) => ValueType::Geo,
            TypedValue::Uid(_) => ValueType::Uid,
        }
    }

    /// Numeric view, coercing ints to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Int(i) => Some(*i as f64),
            TypedValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer view (floats only when integral).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TypedValue::Int(i) => Some(*i),
            TypedValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// True for [`TypedValue::Int`] and [`TypedValue::Float`].
    pub fn is_numeric(&self) -> bool {
        matches!(self, TypedValue::Int(_) | TypedValue::Float(_))
    }

    /// Converts the value to `target`, parsing strings where necessary.
    ///
    /// Conversion is explicit and may fail; failures surface as
    /// [`QueryError::TypeMismatch`] (or [`QueryError::InvalidGeometry`] for
    /// geometry decode errors) and are contained or fatal per the caller's
    /// policy.
    pub fn convert(&self, target: ValueType) -> Result<TypedValue> {
        let mismatch = || {
            QueryError::TypeMismatch(format!(
                "cannot convert {} value to {}",
                self.value_type().name(),
                target.name()
            ))
        };
        match (self, target) {
            (v, t) if v.value_type() == t => Ok(v.clone()),
            (v, ValueType::Default) if v.value_type() == ValueType::String => Ok(v.clone()),
            (TypedValue::Str(s), ValueType::Default) => Ok(TypedValue::Str(s.clone())),
            (TypedValue::Str(s), ValueType::Int) => {
                s.parse::<i64>().map(TypedValue::Int).map_err(|_| mismatch())
            }
            (TypedValue::Str(s), ValueType::Float) => s
                .parse::<f64>()
                .map(TypedValue::Float)
                .map_err(|_| mismatch()),
            (TypedValue::Str(s), ValueType::Bool) => {
                s.parse::<bool>().map(TypedValue::Bool).map_err(|_| mismatch())
            }
            (TypedValue::Str(s), ValueType::DateTime) => {
                parse_datetime(s).map(TypedValue::DateTime)
            }
            (TypedValue::Str(s), ValueType::Geo) => {
                Geometry::from_geojson(s).map(TypedValue::Geo)
            }
            (TypedValue::Str(s), ValueType::Uid) => Uid::parse(s).map(TypedValue::Uid),
            (TypedValue::Int(i), ValueType::Float) => Ok(TypedValue::Float(*i as f64)),
            (TypedValue::Int(i), ValueType::String) => Ok(TypedValue::Str(i.to_string())),
            (TypedValue::Float(f), ValueType::Int) if f.is_finite() => {
                Ok(TypedValue::Int(*f as i64))
            }
            (TypedValue::Float(f), ValueType::String) => Ok(TypedValue::Str(f.to_string())),
            (TypedValue::Bool(b), ValueType::String) => Ok(TypedValue::Str(b.to_string())),
            (TypedValue::Bool(b), ValueType::Int) => Ok(TypedValue::Int(*b as i64)),
            (TypedValue::DateTime(dt), ValueType::String) => Ok(TypedValue::Str(
                dt.format(&Rfc3339).map_err(|_| mismatch())?,
            )),
            (TypedValue::Geo(g), ValueType::String) => Ok(TypedValue::Str(g.to_geojson())),
            (TypedValue::Uid(u), ValueType::String) => Ok(TypedValue::Str(u.to_hex())),
            _ => Err(mismatch()),
        }
    }

    /// Total ordering between two comparable values.
    ///
    /// Numeric values compare across int/float; strings compare byte-wise on
    /// canonical UTF-8; datetimes compare on the UTC instant, so a
    /// timezone-shifted literal equal in absolute time compares equal.
    pub fn ordering(&self, other: &TypedValue) -> Result<Ordering> {
        let mismatch = || {
            QueryError::TypeMismatch(format!(
                "cannot compare {} with {}",
                self.value_type().name(),
                other.value_type().name()
            ))
        };
        match (self, other) {
            (TypedValue::Str(a), TypedValue::Str(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            (TypedValue::Int(a), TypedValue::Int(b)) => Ok(a.cmp(b)),
            (TypedValue::Int(a), TypedValue::Float(b)) => {
                (*a as f64).partial_cmp(b).ok_or_else(mismatch)
            }
            (TypedValue::Float(a), TypedValue::Int(b)) => {
                a.partial_cmp(&(*b as f64)).ok_or_else(mismatch)
            }
            (TypedValue::Float(a), TypedValue::Float(b)) => a.partial_cmp(b).ok_or_else(mismatch),
            (TypedValue::Bool(a), TypedValue::Bool(b)) => Ok(a.cmp(b)),
            (TypedValue::DateTime(a), TypedValue::DateTime(b)) => Ok(a.cmp(b)),
            (TypedValue::Uid(a), TypedValue::Uid(b)) => Ok(a.cmp(b)),
            _ => Err(mismatch()),
        }
    }

    /// Applies `op` between two values using [`TypedValue::ordering`].
    pub fn compare(op: CompareOp, a: &TypedValue, b: &TypedValue) -> Result<bool> {
        Ok(op.matches(a.ordering(b)?))
    }

    /// Marshals the value to its wire/text form.
    pub fn marshal_text(&self) -> Result<String> {
        match self {
            TypedValue::Str(s) => Ok(s.clone()),
            TypedValue::Int(i) => Ok(i.to_string()),
            TypedValue::Float(f) => Ok(f.to_string()),
            TypedValue::Bool(b) => Ok(b.to_string()),
            TypedValue::DateTime(dt) => dt
                .format(&Rfc3339)
                .map_err(|e| QueryError::TypeMismatch(format!("unformattable datetime: {e}"))),
            TypedValue::Geo(g) => Ok(g.to_geojson()),
            TypedValue::Uid(u) => Ok(u.to_hex()),
        }
    }

    /// Unmarshals a wire/text form into a value of type `ty`.
    pub fn unmarshal_text(ty: ValueType, text: &str) -> Result<TypedValue> {
        TypedValue::Str(text.to_owned()).convert(ty)
    }

    /// JSON form used by the result assembler.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TypedValue::Str(s) => serde_json::Value::String(s.clone()),
            TypedValue::Int(i) => serde_json::Value::from(*i),
            TypedValue::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, Into::into)
            }
            TypedValue::Bool(b) => serde_json::Value::Bool(*b),
            TypedValue::DateTime(dt) => serde_json::Value::String(
                dt.format(&Rfc3339).unwrap_or_else(|_| dt.to_string()),
            ),
            TypedValue::Geo(g) => g.to_json(),
            TypedValue::Uid(u) => serde_json::Value::String(u.to_hex()),
        }
    }
}

/// Parses a datetime literal, accepting the partial forms `"1932"`,
/// `"1932-03"`, `"1932-03-01"`, and a full RFC 3339 timestamp with or
/// without an explicit offset (missing offsets read as UTC).
pub fn parse_datetime(s: &str) -> Result<OffsetDateTime> {
    let s = s.trim();
    let err = || QueryError::TypeMismatch(format!("invalid datetime literal {s:?}"));
    if s.is_empty() {
        return Err(err());
    }
    let expanded = expand_partial_datetime(s).ok_or_else(err)?;
    OffsetDateTime::parse(&expanded, &Rfc3339).map_err(|_| err())
}

fn expand_partial_datetime(s: &str) -> Option<String> {
    let has_time = s.contains('T');
    if !has_time {
        return match s.len() {
            4 => Some(format!("{s}-01-01T00:00:00Z")),
            7 => Some(format!("{s}-01T00:00:00Z")),
            10 => Some(format!("{s}T00:00:00Z")),
            _ => None,
        };
    }
    // A trailing offset is either `Z` or `+hh:mm`/`-hh:mm` after the time
    // part; anything else gets UTC appended.
    let time_part = &s[s.find('T')? + 1..];
    let has_offset =
        time_part.ends_with('Z') || time_part.contains('+') || time_part.rfind('-').is_some();
    if has_offset {
        Some(s.to_owned())
    } else {
        Some(format!("{s}Z"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn numeric_comparison_coerces() {
        assert!(TypedValue::compare(
            CompareOp::Lt,
            &TypedValue::Int(1),
            &TypedValue::Float(1.5)
        )
        .unwrap());
        assert!(TypedValue::compare(
            CompareOp::Eq,
            &TypedValue::Float(2.0),
            &TypedValue::Int(2)
        )
        .unwrap());
    }

    #[test]
    fn empty_string_is_orderable() {
        let empty = TypedValue::Str(String::new());
        let a = TypedValue::Str("A".into());
        assert!(TypedValue::compare(CompareOp::Lt, &empty, &a).unwrap());
        assert!(TypedValue::compare(CompareOp::Le, &empty, &empty).unwrap());
        assert!(!TypedValue::compare(CompareOp::Le, &a, &empty).unwrap());
    }

    #[test]
    fn datetime_compares_on_instant() {
        let utc = parse_datetime("1909-05-05T00:00:00Z").unwrap();
        let shifted = parse_datetime("1909-05-05T05:30:00+05:30").unwrap();
        assert_eq!(
            TypedValue::DateTime(utc)
                .ordering(&TypedValue::DateTime(shifted))
                .unwrap(),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn partial_datetime_literals_expand() {
        assert_eq!(
            parse_datetime("1932").unwrap(),
            datetime!(1932-01-01 00:00:00 UTC)
        );
        assert_eq!(
            parse_datetime("1932-03-01").unwrap(),
            datetime!(1932-03-01 00:00:00 UTC)
        );
        assert_eq!(
            parse_datetime("2019-03-28T13:41:57").unwrap(),
            datetime!(2019-03-28 13:41:57 UTC)
        );
    }

    #[test]
    fn datetime_display_preserves_offset() {
        let dt = parse_datetime("2019-03-28T07:41:57+23:00").unwrap();
        assert_eq!(
            TypedValue::DateTime(dt).marshal_text().unwrap(),
            "2019-03-28T07:41:57+23:00"
        );
    }

    #[test]
    fn string_to_int_conversion_fails_loudly() {
        let err = TypedValue::Str("alice".into())
            .convert(ValueType::Int)
            .unwrap_err();
        assert_eq!(err.code(), "TypeMismatch");
    }

    #[test]
    fn incomparable_types_mismatch() {
        let err = TypedValue::Str("x".into())
            .ordering(&TypedValue::Int(3))
            .unwrap_err();
        assert_eq!(err.code(), "TypeMismatch");
    }
}
