//! PostgreSQL type system: values, codecs and the per-connection type map.
//!
//! Every wire type id maps to a [`Codec`] in a [`TypeMap`]. Codecs for
//! arrays, composites and ranges call back into the map for their element
//! types, so user-defined types compose with the built-in ones.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

mod array;
pub mod codec;
mod composite;
mod datetime;
mod from_sql;
mod geometric;
mod net;
mod numeric;
mod oid;
mod plan;
mod range;
mod registry;
mod value;

pub use codec::{Codec, LtreeCodec, TextCodec};
pub use from_sql::{FromSql, Json};
pub use numeric::Numeric;
pub use oid::Oid;
pub use registry::{PgType, TypeKind, TypeMap};
pub use value::{
    Array, ArrayDimension, Circle, CustomValue, Inet, Interval, Line, Lseg, Path, PgBox, Point,
    Polygon, Range, RangeBound, RawValue, Tid, Value, ValueKind, Valuer,
};

/// Wire format code of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Text,
    Binary,
}

impl Format {
    /// Format code as sent in Bind.
    #[inline]
    pub fn code(self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }

    #[inline]
    pub fn from_code(code: i16) -> Self {
        if code == 1 {
            Format::Binary
        } else {
            Format::Text
        }
    }
}
