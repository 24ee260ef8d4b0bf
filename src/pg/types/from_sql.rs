//! Conversion of result columns into Rust types.

use std::net::IpAddr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::codec::utf8;
use super::{
    Array, Circle, Format, Inet, Interval, Line, Lseg, Numeric, Oid, Path, PgBox, Point, Polygon,
    Range, Tid, TypeMap, Value,
};
use crate::pg::error::{PgError, PgResult};

/// A type a result column can be scanned into.
///
/// `from_value` converts the generic decoded form. `scan_raw` may read the
/// wire bytes directly and skip building a [`Value`]; returning `None`
/// falls back to decoding.
pub trait FromSql: Sized {
    fn scan_raw(_map: &TypeMap, _oid: Oid, _format: Format, _raw: Option<&[u8]>) -> Option<PgResult<Self>> {
        None
    }

    fn from_value(value: Value) -> PgResult<Self>;
}

fn wrong_type(target: &str, value: &Value) -> PgError {
    if value.is_null() {
        PgError::Decode(format!("cannot scan NULL into {}; use Option", target))
    } else {
        PgError::Decode(format!("cannot scan {:?} into {}", value.kind(), target))
    }
}

fn out_of_range(target: &str, v: impl std::fmt::Display) -> PgError {
    PgError::Decode(format!("{} is out of range for {}", v, target))
}

fn parse<T>(target: &str, s: &str) -> PgResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.trim()
        .parse()
        .map_err(|e| PgError::Decode(format!("cannot parse {:?} as {}: {}", s, target, e)))
}

impl FromSql for Value {
    fn from_value(value: Value) -> PgResult<Self> {
        Ok(value)
    }
}

impl FromSql for bool {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            Value::Text(s) => match s.trim() {
                "t" | "true" => Ok(true),
                "f" | "false" => Ok(false),
                _ => Err(PgError::Decode(format!("cannot parse {:?} as bool", s))),
            },
            other => Err(wrong_type("bool", &other)),
        }
    }
}

macro_rules! int_from_sql {
    ($($ty:ty),*) => {
        $(
            impl FromSql for $ty {
                fn from_value(value: Value) -> PgResult<Self> {
                    let name = stringify!($ty);
                    match value {
                        Value::Int2(v) => <$ty>::try_from(v).map_err(|_| out_of_range(name, v)),
                        Value::Int4(v) => <$ty>::try_from(v).map_err(|_| out_of_range(name, v)),
                        Value::Int8(v) => <$ty>::try_from(v).map_err(|_| out_of_range(name, v)),
                        Value::Numeric(n) => parse(name, n.as_str()),
                        Value::Text(s) => parse(name, &s),
                        other => Err(wrong_type(name, &other)),
                    }
                }
            }
        )*
    };
}

int_from_sql!(i16, i32, i64, u32);

impl FromSql for f64 {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Float8(v) => Ok(v),
            Value::Float4(v) => Ok(v as f64),
            Value::Int2(v) => Ok(v as f64),
            Value::Int4(v) => Ok(v as f64),
            Value::Int8(v) => Ok(v as f64),
            Value::Numeric(n) => Ok(n.to_f64()),
            Value::Text(s) => parse("f64", &s),
            other => Err(wrong_type("f64", &other)),
        }
    }
}

impl FromSql for f32 {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Float4(v) => Ok(v),
            Value::Text(s) => parse("f32", &s),
            other => f64::from_value(other).map(|v| v as f32),
        }
    }
}

impl FromSql for String {
    fn scan_raw(_map: &TypeMap, oid: Oid, format: Format, raw: Option<&[u8]>) -> Option<PgResult<Self>> {
        let text_like = matches!(
            oid,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::NAME | Oid::UNKNOWN
        );
        match raw {
            Some(raw) if format == Format::Text || text_like => {
                Some(utf8(raw, "text").map(str::to_string))
            }
            _ => None,
        }
    }

    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Text(s) => Ok(s),
            Value::Numeric(n) => Ok(n.to_string()),
            Value::Uuid(u) => Ok(u.to_string()),
            Value::Json(j) => Ok(j.to_string()),
            other => Err(wrong_type("String", &other)),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Bytea(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            Value::Raw(raw) => Ok(raw.bytes.to_vec()),
            other => Err(wrong_type("Vec<u8>", &other)),
        }
    }
}

impl FromSql for Uuid {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Uuid(u) => Ok(u),
            Value::Text(s) => parse("uuid", &s),
            other => Err(wrong_type("Uuid", &other)),
        }
    }
}

impl FromSql for DateTime<Utc> {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::TimestampTz(ts) => Ok(ts),
            Value::Timestamp(ts) => Ok(ts.and_utc()),
            other => Err(wrong_type("DateTime<Utc>", &other)),
        }
    }
}

impl FromSql for serde_json::Value {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Json(j) => Ok(j),
            Value::Text(s) => serde_json::from_str(&s)
                .map_err(|e| PgError::Decode(format!("Invalid JSON: {}", e))),
            other => Err(wrong_type("JSON", &other)),
        }
    }
}

/// Scans a json or jsonb column into any deserializable type.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromSql for Json<T> {
    fn from_value(value: Value) -> PgResult<Self> {
        let json = serde_json::Value::from_value(value)?;
        serde_json::from_value(json)
            .map(Json)
            .map_err(|e| PgError::Decode(format!("cannot deserialize JSON: {}", e)))
    }
}

macro_rules! variant_from_sql {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromSql for $ty {
                fn from_value(value: Value) -> PgResult<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(wrong_type(stringify!($ty), &other)),
                    }
                }
            }
        )*
    };
}

variant_from_sql! {
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    Interval => Interval,
    Inet => Inet,
    [u8; 6] => MacAddr,
    Point => Point,
    Line => Line,
    Lseg => Lseg,
    PgBox => Box,
    Path => Path,
    Polygon => Polygon,
    Circle => Circle,
    Tid => Tid,
    Array => Array,
}

impl FromSql for Numeric {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Numeric(n) => Ok(n),
            Value::Int2(v) => Ok(Numeric::from(v as i32)),
            Value::Int4(v) => Ok(Numeric::from(v)),
            Value::Int8(v) => Ok(Numeric::from(v)),
            Value::Text(s) => Numeric::new(&s),
            other => Err(wrong_type("Numeric", &other)),
        }
    }
}

impl FromSql for IpAddr {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Inet(inet) => Ok(inet.addr),
            other => Err(wrong_type("IpAddr", &other)),
        }
    }
}

impl FromSql for Range {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Range(r) => Ok(*r),
            other => Err(wrong_type("Range", &other)),
        }
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn scan_raw(map: &TypeMap, oid: Oid, format: Format, raw: Option<&[u8]>) -> Option<PgResult<Self>> {
        match raw {
            None => Some(Ok(None)),
            Some(_) => T::scan_raw(map, oid, format, raw).map(|r| r.map(Some)),
        }
    }

    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// One-dimensional arrays; NULL elements need `Vec<Option<T>>`.
impl<T: FromSql> FromSql for Vec<T> {
    fn from_value(value: Value) -> PgResult<Self> {
        match value {
            Value::Array(array) => array.elements.into_iter().map(T::from_value).collect(),
            other => Err(wrong_type("Vec", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_null_requires_option() {
        let map = TypeMap::new();
        let err = map.scan::<i32>(Oid::INT4, Format::Binary, None).unwrap_err();
        assert!(matches!(err, PgError::Decode(_)));
        assert_eq!(map.scan::<Option<i32>>(Oid::INT4, Format::Binary, None).unwrap(), None);
    }

    #[test]
    fn test_integer_widening_and_range_checks() {
        let map = TypeMap::new();
        let raw = 300i32.to_be_bytes();
        assert_eq!(map.scan::<i64>(Oid::INT4, Format::Binary, Some(&raw)).unwrap(), 300);
        assert!(map.scan::<i16>(Oid::INT8, Format::Text, Some(&b"70000"[..])).is_err());
        assert_eq!(map.scan::<f64>(Oid::INT4, Format::Binary, Some(&raw)).unwrap(), 300.0);
    }

    #[test]
    fn test_string_fast_path() {
        let map = TypeMap::new();
        assert_eq!(map.scan::<String>(Oid::INT4, Format::Text, Some(&b"42"[..])).unwrap(), "42");
        assert_eq!(
            map.scan::<String>(Oid::VARCHAR, Format::Binary, Some(&b"abc"[..])).unwrap(),
            "abc"
        );
        let uuid = Uuid::nil();
        assert_eq!(
            map.scan::<String>(Oid::UUID, Format::Binary, Some(uuid.as_bytes())).unwrap(),
            uuid.to_string()
        );
    }

    #[test]
    fn test_json_into_struct() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Settings {
            theme: String,
        }
        let map = TypeMap::new();
        let Json(settings) = map
            .scan::<Json<Settings>>(Oid::JSON, Format::Text, Some(&br#"{"theme":"dark"}"#[..]))
            .unwrap();
        assert_eq!(settings.theme, "dark");
    }

    #[test]
    fn test_array_into_vec() {
        let map = TypeMap::new();
        let bytes = map
            .encode(Oid::INT4_ARRAY, Format::Binary, &Value::array(vec![Some(1), None::<i32>]))
            .unwrap()
            .unwrap();
        let scanned: Vec<Option<i32>> = map.scan(Oid::INT4_ARRAY, Format::Binary, Some(&bytes)).unwrap();
        assert_eq!(scanned, vec![Some(1), None]);
        assert!(map.scan::<Vec<i32>>(Oid::INT4_ARRAY, Format::Binary, Some(&bytes)).is_err());
    }
}
