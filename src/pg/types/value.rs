//! Native representation of PostgreSQL values.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::numeric::Numeric;
use super::{Format, Oid};
use crate::pg::error::{PgError, PgResult};

// ============================================================================
// Values
// ============================================================================

/// A PostgreSQL value.
///
/// Used both as query argument and as the generic decoded form of a result
/// column. Codecs in the [`TypeMap`](super::TypeMap) translate between this
/// and the wire encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Numeric),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Interval(Interval),
    Inet(Inet),
    MacAddr([u8; 6]),
    Point(Point),
    Line(Line),
    Lseg(Lseg),
    Box(PgBox),
    Path(Path),
    Polygon(Polygon),
    Circle(Circle),
    Tid(Tid),
    Array(Array),
    Composite(Vec<Value>),
    Range(Box<Range>),
    /// Undecoded bytes of a type the registry does not know.
    Raw(RawValue),
    /// Application value exposing the [`Valuer`] capability.
    Custom(CustomValue),
}

impl Value {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Shape of this value, used to key encode plans.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int2(_) => ValueKind::Int2,
            Value::Int4(_) => ValueKind::Int4,
            Value::Int8(_) => ValueKind::Int8,
            Value::Float4(_) => ValueKind::Float4,
            Value::Float8(_) => ValueKind::Float8,
            Value::Numeric(_) => ValueKind::Numeric,
            Value::Text(_) => ValueKind::Text,
            Value::Bytea(_) => ValueKind::Bytea,
            Value::Uuid(_) => ValueKind::Uuid,
            Value::Json(_) => ValueKind::Json,
            Value::Date(_) => ValueKind::Date,
            Value::Time(_) => ValueKind::Time,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::TimestampTz(_) => ValueKind::TimestampTz,
            Value::Interval(_) => ValueKind::Interval,
            Value::Inet(_) => ValueKind::Inet,
            Value::MacAddr(_) => ValueKind::MacAddr,
            Value::Point(_) => ValueKind::Point,
            Value::Line(_) => ValueKind::Line,
            Value::Lseg(_) => ValueKind::Lseg,
            Value::Box(_) => ValueKind::Box,
            Value::Path(_) => ValueKind::Path,
            Value::Polygon(_) => ValueKind::Polygon,
            Value::Circle(_) => ValueKind::Circle,
            Value::Tid(_) => ValueKind::Tid,
            Value::Array(_) => ValueKind::Array,
            Value::Composite(_) => ValueKind::Composite,
            Value::Range(_) => ValueKind::Range,
            Value::Raw(_) => ValueKind::Raw,
            Value::Custom(c) => ValueKind::Custom(c.0.shape()),
        }
    }

    /// Values that cannot be written as a single SQL literal.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Composite(_) | Value::Range(_)
        )
    }

    /// Serialize `value` into a JSON value.
    pub fn json<T: Serialize>(value: &T) -> PgResult<Self> {
        serde_json::to_value(value)
            .map(Value::Json)
            .map_err(|e| PgError::Encode(format!("JSON serialization failed: {}", e)))
    }

    /// One-dimensional array from anything convertible to values.
    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Array(Array::from_values(items.into_iter().map(Into::into).collect()))
    }

    /// Wrap an application value implementing [`Valuer`].
    pub fn custom(valuer: impl Valuer + 'static) -> Self {
        Value::Custom(CustomValue(Arc::new(valuer)))
    }
}

/// Discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Bytea,
    Uuid,
    Json,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Inet,
    MacAddr,
    Point,
    Line,
    Lseg,
    Box,
    Path,
    Polygon,
    Circle,
    Tid,
    Array,
    Composite,
    Range,
    Raw,
    /// Keyed by the application type name.
    Custom(&'static str),
}

impl ValueKind {
    pub fn is_integer(self) -> bool {
        matches!(self, ValueKind::Int2 | ValueKind::Int4 | ValueKind::Int8)
    }
}

// ============================================================================
// Application capabilities
// ============================================================================

/// Capability for application types used as query arguments.
///
/// The registry tries, in order: a codec accepting the value directly,
/// [`underlying`](Valuer::underlying) re-planned through the registry, and
/// finally [`text_value`](Valuer::text_value) sent as wire text.
pub trait Valuer: fmt::Debug + Send + Sync {
    /// Representation for wrapper types (e.g. a newtype around `i64`).
    ///
    /// Consulted for every value encoded, so it may vary between values of
    /// one type; a value without one falls back to
    /// [`text_value`](Valuer::text_value) in text format.
    fn underlying(&self) -> Option<Value> {
        None
    }

    /// Text form handed to the server as-is. `None` encodes NULL.
    fn text_value(&self) -> PgResult<Option<String>> {
        Err(PgError::Encode(format!(
            "{} has neither an underlying value nor a text form",
            self.shape()
        )))
    }

    /// Distinguishes application types in the plan cache.
    fn shape(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Shared handle to an application [`Valuer`].
#[derive(Clone)]
pub struct CustomValue(pub Arc<dyn Valuer>);

impl fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Bytes of a value whose type the registry could not decode.
#[derive(Debug, Clone, PartialEq)]
pub struct RawValue {
    pub oid: Oid,
    pub format: Format,
    pub bytes: Bytes,
}

// ============================================================================
// Composite payloads
// ============================================================================

/// `interval` as the server stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

impl Interval {
    pub fn new(months: i32, days: i32, microseconds: i64) -> Self {
        Self {
            months,
            days,
            microseconds,
        }
    }

    pub fn from_duration(d: std::time::Duration) -> Self {
        Self::new(0, 0, d.as_micros() as i64)
    }
}

/// `inet` / `cidr` address with prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Inet {
    /// Host address with a full-length prefix.
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Line `{A,B,C}` meaning Ax + By + C = 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Line {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Lseg(pub [Point; 2]);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PgBox(pub [Point; 2]);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Path {
    pub points: Vec<Point>,
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polygon(pub Vec<Point>);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Circle {
    pub center: Point,
    pub radius: f64,
}

/// Physical row location `(block, offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tid {
    pub block: u32,
    pub offset: u16,
}

/// Array dimension: element count and lower bound (1 by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDimension {
    pub len: i32,
    pub lower_bound: i32,
}

/// Possibly multi-dimensional array; `elements` are stored row-major.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Array {
    pub dims: Vec<ArrayDimension>,
    pub elements: Vec<Value>,
}

impl Array {
    /// One-dimensional array with lower bound 1.
    pub fn from_values(elements: Vec<Value>) -> Self {
        let dims = if elements.is_empty() {
            Vec::new()
        } else {
            vec![ArrayDimension {
                len: elements.len() as i32,
                lower_bound: 1,
            }]
        };
        Self { dims, elements }
    }

    /// Check that the dimensions describe exactly `elements.len()` values.
    pub fn validate(&self) -> PgResult<()> {
        let expected: i64 = if self.dims.is_empty() {
            0
        } else {
            self.dims.iter().map(|d| d.len.max(0) as i64).product()
        };
        if expected != self.elements.len() as i64 {
            return Err(PgError::Encode(format!(
                "array dimensions describe {} elements but {} were given",
                expected,
                self.elements.len()
            )));
        }
        Ok(())
    }
}

/// One end of a range.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeBound {
    Inclusive(Value),
    Exclusive(Value),
    Unbounded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub lower: RangeBound,
    pub upper: RangeBound,
    pub empty: bool,
}

impl Range {
    pub fn new(lower: RangeBound, upper: RangeBound) -> Self {
        Self {
            lower,
            upper,
            empty: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            lower: RangeBound::Unbounded,
            upper: RangeBound::Unbounded,
            empty: true,
        }
    }
}

// ============================================================================
// Conversions into values
// ============================================================================

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    Numeric => Numeric,
    String => Text,
    Vec<u8> => Bytea,
    Uuid => Uuid,
    serde_json::Value => Json,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    Interval => Interval,
    Inet => Inet,
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

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytea(v.to_vec())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int8(v as i64)
    }
}

impl From<IpAddr> for Value {
    fn from(v: IpAddr) -> Self {
        Value::Inet(Inet::host(v))
    }
}

impl From<Range> for Value {
    fn from(v: Range) -> Self {
        Value::Range(Box::new(v))
    }
}

impl From<std::time::Duration> for Value {
    fn from(v: std::time::Duration) -> Self {
        Value::Interval(Interval::from_duration(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

macro_rules! value_from_vec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for Value {
                fn from(v: Vec<$ty>) -> Self {
                    Value::array(v)
                }
            }
        )*
    };
}

value_from_vec!(bool, i16, i32, i64, f32, f64, String, &str, Uuid, Numeric, NaiveDate, NaiveDateTime, Value);

/// Build a `Vec<Value>` of query arguments.
///
/// ```
/// let args = pgexec::params![1, "two", 3.0_f64, None::<i32>];
/// assert_eq!(args.len(), 4);
/// ```
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($arg)),+]
    };
}
