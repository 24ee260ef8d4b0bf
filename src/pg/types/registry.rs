//! The per-connection type map: type descriptors, default types and plans.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::array::ArrayCodec;
use super::codec::{
    natural_oid, BoolCodec, ByteaCodec, CharCodec, Codec, Float4Codec, Float8Codec, Int2Codec,
    Int4Codec, Int8Codec, JsonCodec, OidCodec, TextCodec, TidCodec, UuidCodec,
};
use super::composite::CompositeCodec;
use super::datetime::{DateCodec, IntervalCodec, TimeCodec, TimestampCodec};
use super::from_sql::FromSql;
use super::geometric::{GeometryCodec, Shape};
use super::net::{InetCodec, MacAddrCodec};
use super::numeric::NumericCodec;
use super::plan::{DecodePlan, PlanCache};
use super::range::RangeCodec;
use super::{Format, Oid, RawValue, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

// ============================================================================
// Type descriptors
// ============================================================================

/// How a type is built from other types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Scalar,
    Array { element: Oid },
    Composite { fields: Vec<(String, Oid)> },
    Domain { base: Oid },
    Range { subtype: Oid },
    Enum,
}

/// A registered type: id, name, codec and the types it depends on.
#[derive(Debug, Clone)]
pub struct PgType {
    pub oid: Oid,
    pub name: String,
    pub kind: TypeKind,
    pub codec: Arc<dyn Codec>,
}

impl PgType {
    /// Scalar type handled by `codec`.
    pub fn scalar(oid: Oid, name: impl Into<String>, codec: impl Codec + 'static) -> Self {
        Self {
            oid,
            name: name.into(),
            kind: TypeKind::Scalar,
            codec: Arc::new(codec),
        }
    }

    fn dependencies(&self) -> Vec<Oid> {
        match &self.kind {
            TypeKind::Scalar | TypeKind::Enum => Vec::new(),
            TypeKind::Array { element } => vec![*element],
            TypeKind::Composite { fields } => fields.iter().map(|(_, oid)| *oid).collect(),
            TypeKind::Domain { base } => vec![*base],
            TypeKind::Range { subtype } => vec![*subtype],
        }
    }
}

// ============================================================================
// Type map
// ============================================================================

/// Maps wire type ids to codecs.
///
/// Each connection owns one. Registration takes `&mut self` and so happens
/// during setup; encoding and decoding take `&self` and may run from several
/// call sites, with plans memoized behind a lock.
#[derive(Clone)]
pub struct TypeMap {
    types: HashMap<Oid, Arc<PgType>>,
    names: HashMap<String, Oid>,
    /// Element type id -> array type id.
    arrays: HashMap<Oid, Oid>,
    /// Subtype id -> range type id.
    ranges: HashMap<Oid, Oid>,
    default_types: HashMap<ValueKind, Oid>,
    plans: PlanCache,
}

impl fmt::Debug for TypeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMap")
            .field("types", &self.types.len())
            .field("default_types", &self.default_types.len())
            .finish()
    }
}

impl Default for TypeMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in array types: (array oid, name, element oid).
const BUILTIN_ARRAYS: &[(Oid, &str, Oid)] = &[
    (Oid::BOOL_ARRAY, "_bool", Oid::BOOL),
    (Oid::BYTEA_ARRAY, "_bytea", Oid::BYTEA),
    (Oid::CHAR_ARRAY, "_char", Oid::CHAR),
    (Oid::NAME_ARRAY, "_name", Oid::NAME),
    (Oid::INT2_ARRAY, "_int2", Oid::INT2),
    (Oid::INT4_ARRAY, "_int4", Oid::INT4),
    (Oid::INT8_ARRAY, "_int8", Oid::INT8),
    (Oid::TEXT_ARRAY, "_text", Oid::TEXT),
    (Oid::OID_ARRAY, "_oid", Oid::OID),
    (Oid::TID_ARRAY, "_tid", Oid::TID),
    (Oid::JSON_ARRAY, "_json", Oid::JSON),
    (Oid::JSONB_ARRAY, "_jsonb", Oid::JSONB),
    (Oid::POINT_ARRAY, "_point", Oid::POINT),
    (Oid::LSEG_ARRAY, "_lseg", Oid::LSEG),
    (Oid::PATH_ARRAY, "_path", Oid::PATH),
    (Oid::BOX_ARRAY, "_box", Oid::BOX),
    (Oid::POLYGON_ARRAY, "_polygon", Oid::POLYGON),
    (Oid::LINE_ARRAY, "_line", Oid::LINE),
    (Oid::CIRCLE_ARRAY, "_circle", Oid::CIRCLE),
    (Oid::FLOAT4_ARRAY, "_float4", Oid::FLOAT4),
    (Oid::FLOAT8_ARRAY, "_float8", Oid::FLOAT8),
    (Oid::CIDR_ARRAY, "_cidr", Oid::CIDR),
    (Oid::MACADDR_ARRAY, "_macaddr", Oid::MACADDR),
    (Oid::INET_ARRAY, "_inet", Oid::INET),
    (Oid::BPCHAR_ARRAY, "_bpchar", Oid::BPCHAR),
    (Oid::VARCHAR_ARRAY, "_varchar", Oid::VARCHAR),
    (Oid::DATE_ARRAY, "_date", Oid::DATE),
    (Oid::TIME_ARRAY, "_time", Oid::TIME),
    (Oid::TIMESTAMP_ARRAY, "_timestamp", Oid::TIMESTAMP),
    (Oid::TIMESTAMPTZ_ARRAY, "_timestamptz", Oid::TIMESTAMPTZ),
    (Oid::INTERVAL_ARRAY, "_interval", Oid::INTERVAL),
    (Oid::NUMERIC_ARRAY, "_numeric", Oid::NUMERIC),
    (Oid::UUID_ARRAY, "_uuid", Oid::UUID),
    (Oid::RECORD_ARRAY, "_record", Oid::RECORD),
];

/// Built-in range types: (range oid, name, subtype oid, array oid).
const BUILTIN_RANGES: &[(Oid, &str, Oid, Oid)] = &[
    (Oid::INT4RANGE, "int4range", Oid::INT4, Oid::INT4RANGE_ARRAY),
    (Oid::INT8RANGE, "int8range", Oid::INT8, Oid::INT8RANGE_ARRAY),
    (Oid::NUMRANGE, "numrange", Oid::NUMERIC, Oid::NUMRANGE_ARRAY),
    (Oid::TSRANGE, "tsrange", Oid::TIMESTAMP, Oid::TSRANGE_ARRAY),
    (Oid::TSTZRANGE, "tstzrange", Oid::TIMESTAMPTZ, Oid::TSTZRANGE_ARRAY),
    (Oid::DATERANGE, "daterange", Oid::DATE, Oid::DATERANGE_ARRAY),
];

impl TypeMap {
    /// A map with no types registered.
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
            names: HashMap::new(),
            arrays: HashMap::new(),
            ranges: HashMap::new(),
            default_types: HashMap::new(),
            plans: PlanCache::default(),
        }
    }

    /// A map seeded with the built-in types and default-type table.
    pub fn new() -> Self {
        let mut map = Self::empty();
        let scalars: Vec<PgType> = vec![
            PgType::scalar(Oid::BOOL, "bool", BoolCodec),
            PgType::scalar(Oid::BYTEA, "bytea", ByteaCodec),
            PgType::scalar(Oid::CHAR, "char", CharCodec),
            PgType::scalar(Oid::NAME, "name", TextCodec),
            PgType::scalar(Oid::INT8, "int8", Int8Codec),
            PgType::scalar(Oid::INT2, "int2", Int2Codec),
            PgType::scalar(Oid::INT4, "int4", Int4Codec),
            PgType::scalar(Oid::TEXT, "text", TextCodec),
            PgType::scalar(Oid::OID, "oid", OidCodec),
            PgType::scalar(Oid::TID, "tid", TidCodec),
            PgType::scalar(Oid::JSON, "json", JsonCodec { jsonb: false }),
            PgType::scalar(Oid::JSONB, "jsonb", JsonCodec { jsonb: true }),
            PgType::scalar(Oid::POINT, "point", GeometryCodec::new(Shape::Point)),
            PgType::scalar(Oid::LSEG, "lseg", GeometryCodec::new(Shape::Lseg)),
            PgType::scalar(Oid::PATH, "path", GeometryCodec::new(Shape::Path)),
            PgType::scalar(Oid::BOX, "box", GeometryCodec::new(Shape::Box)),
            PgType::scalar(Oid::POLYGON, "polygon", GeometryCodec::new(Shape::Polygon)),
            PgType::scalar(Oid::LINE, "line", GeometryCodec::new(Shape::Line)),
            PgType::scalar(Oid::CIRCLE, "circle", GeometryCodec::new(Shape::Circle)),
            PgType::scalar(Oid::FLOAT4, "float4", Float4Codec),
            PgType::scalar(Oid::FLOAT8, "float8", Float8Codec),
            PgType::scalar(Oid::UNKNOWN, "unknown", TextCodec),
            PgType::scalar(Oid::CIDR, "cidr", InetCodec { cidr: true }),
            PgType::scalar(Oid::MACADDR, "macaddr", MacAddrCodec),
            PgType::scalar(Oid::INET, "inet", InetCodec { cidr: false }),
            PgType::scalar(Oid::BPCHAR, "bpchar", TextCodec),
            PgType::scalar(Oid::VARCHAR, "varchar", TextCodec),
            PgType::scalar(Oid::DATE, "date", DateCodec),
            PgType::scalar(Oid::TIME, "time", TimeCodec),
            PgType::scalar(Oid::TIMESTAMP, "timestamp", TimestampCodec { with_tz: false }),
            PgType::scalar(Oid::TIMESTAMPTZ, "timestamptz", TimestampCodec { with_tz: true }),
            PgType::scalar(Oid::INTERVAL, "interval", IntervalCodec),
            PgType::scalar(Oid::NUMERIC, "numeric", NumericCodec),
            PgType::scalar(Oid::UUID, "uuid", UuidCodec),
            PgType::scalar(Oid::RECORD, "record", CompositeCodec::record()),
        ];
        // Built-ins have no unmet dependencies, so these cannot fail
        for ty in scalars {
            map.insert(ty);
        }
        for (oid, name, element) in BUILTIN_ARRAYS {
            if let Ok(ty) = map.array_type(*oid, name, *element) {
                map.insert(ty);
            }
        }
        for (oid, name, subtype, array) in BUILTIN_RANGES {
            if let Ok(ty) = map.range_type(*oid, name, *subtype) {
                map.insert(ty);
            }
            if let Ok(ty) = map.array_type(*array, &format!("_{}", name), *oid) {
                map.insert(ty);
            }
        }

        for kind in [
            ValueKind::Bool,
            ValueKind::Int2,
            ValueKind::Int4,
            ValueKind::Int8,
            ValueKind::Float4,
            ValueKind::Float8,
            ValueKind::Numeric,
            ValueKind::Text,
            ValueKind::Bytea,
            ValueKind::Uuid,
            ValueKind::Json,
            ValueKind::Date,
            ValueKind::Time,
            ValueKind::Timestamp,
            ValueKind::TimestampTz,
            ValueKind::Interval,
            ValueKind::Inet,
            ValueKind::MacAddr,
            ValueKind::Point,
            ValueKind::Line,
            ValueKind::Lseg,
            ValueKind::Box,
            ValueKind::Path,
            ValueKind::Polygon,
            ValueKind::Circle,
            ValueKind::Tid,
        ] {
            if let Some(oid) = natural_oid(kind) {
                map.default_types.insert(kind, oid);
            }
        }
        map
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    pub fn get(&self, oid: Oid) -> Option<&Arc<PgType>> {
        self.types.get(&oid)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Arc<PgType>> {
        self.names.get(name).and_then(|oid| self.types.get(oid))
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.types.contains_key(&oid)
    }

    /// Array type whose elements are `element`.
    pub fn array_of(&self, element: Oid) -> Option<Oid> {
        self.arrays.get(&element).copied()
    }

    pub(crate) fn plans(&self) -> &PlanCache {
        &self.plans
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register a type. Every type it is built from must already be
    /// registered; a type referring to itself is rejected.
    pub fn register_type(&mut self, ty: PgType) -> PgResult<()> {
        self.check_dependencies(&ty)?;
        self.insert(ty);
        Ok(())
    }

    pub fn register_array(&mut self, oid: Oid, name: &str, element: Oid) -> PgResult<()> {
        let ty = self.array_type(oid, name, element)?;
        self.register_type(ty)
    }

    pub fn register_composite<S: Into<String>>(
        &mut self,
        oid: Oid,
        name: &str,
        fields: Vec<(S, Oid)>,
    ) -> PgResult<()> {
        let fields: Vec<(String, Oid)> = fields.into_iter().map(|(n, o)| (n.into(), o)).collect();
        let candidate = PgType {
            oid,
            name: name.to_string(),
            kind: TypeKind::Composite {
                fields: fields.clone(),
            },
            codec: Arc::new(CompositeCodec::record()),
        };
        self.check_dependencies(&candidate)?;
        let codec = CompositeCodec {
            fields: fields.iter().map(|(_, oid)| *oid).collect(),
            anonymous: false,
            fields_binary: fields.iter().all(|(_, oid)| self.supports_binary(*oid)),
        };
        self.register_type(PgType {
            codec: Arc::new(codec),
            ..candidate
        })
    }

    /// A domain shares its base type's codec.
    pub fn register_domain(&mut self, oid: Oid, name: &str, base: Oid) -> PgResult<()> {
        let codec = self
            .get(base)
            .map(|ty| ty.codec.clone())
            .ok_or_else(|| missing(name, base))?;
        self.register_type(PgType {
            oid,
            name: name.to_string(),
            kind: TypeKind::Domain { base },
            codec,
        })
    }

    pub fn register_range(&mut self, oid: Oid, name: &str, subtype: Oid) -> PgResult<()> {
        let ty = self.range_type(oid, name, subtype)?;
        self.register_type(ty)
    }

    /// Enum labels travel as text in both formats.
    pub fn register_enum(&mut self, oid: Oid, name: &str) -> PgResult<()> {
        self.register_type(PgType {
            oid,
            name: name.to_string(),
            kind: TypeKind::Enum,
            codec: Arc::new(TextCodec),
        })
    }

    /// Use `oid` for values of `kind` when no type id is known ahead.
    pub fn register_default_type(&mut self, kind: ValueKind, oid: Oid) -> PgResult<()> {
        if !self.contains(oid) {
            return Err(missing(&format!("{:?}", kind), oid));
        }
        self.default_types.insert(kind, oid);
        self.plans.clear();
        Ok(())
    }

    fn array_type(&self, oid: Oid, name: &str, element: Oid) -> PgResult<PgType> {
        if element == oid || !self.contains(element) {
            return Err(missing(name, element));
        }
        let codec = ArrayCodec {
            element,
            delimiter: if element == Oid::BOX { b';' } else { b',' },
            element_binary: self.supports_binary(element),
        };
        Ok(PgType {
            oid,
            name: name.to_string(),
            kind: TypeKind::Array { element },
            codec: Arc::new(codec),
        })
    }

    fn range_type(&self, oid: Oid, name: &str, subtype: Oid) -> PgResult<PgType> {
        if subtype == oid || !self.contains(subtype) {
            return Err(missing(name, subtype));
        }
        let codec = RangeCodec {
            subtype,
            subtype_binary: self.supports_binary(subtype),
        };
        Ok(PgType {
            oid,
            name: name.to_string(),
            kind: TypeKind::Range { subtype },
            codec: Arc::new(codec),
        })
    }

    fn check_dependencies(&self, ty: &PgType) -> PgResult<()> {
        for dep in ty.dependencies() {
            if dep == ty.oid || !self.contains(dep) {
                return Err(missing(&ty.name, dep));
            }
        }
        Ok(())
    }

    fn supports_binary(&self, oid: Oid) -> bool {
        self.get(oid)
            .is_some_and(|ty| ty.codec.format_supported(Format::Binary))
    }

    fn insert(&mut self, ty: PgType) {
        match ty.kind {
            TypeKind::Array { element } => {
                self.arrays.insert(element, ty.oid);
            }
            TypeKind::Range { subtype } => {
                self.ranges.insert(subtype, ty.oid);
            }
            _ => {}
        }
        self.names.insert(ty.name.clone(), ty.oid);
        self.types.insert(ty.oid, Arc::new(ty));
        self.plans.clear();
    }

    // ------------------------------------------------------------------------
    // Format selection
    // ------------------------------------------------------------------------

    /// Type id to assume for `value` when the server has not described the
    /// parameter.
    pub fn default_oid(&self, value: &Value) -> Option<Oid> {
        match value {
            Value::Null | Value::Composite(_) => None,
            Value::Raw(raw) => Some(raw.oid),
            Value::Custom(c) => c.0.underlying().and_then(|inner| self.default_oid(&inner)),
            Value::Array(array) => array
                .elements
                .iter()
                .find(|e| !e.is_null())
                .and_then(|e| self.default_oid(e))
                .and_then(|element| self.array_of(element)),
            Value::Range(range) => [&range.lower, &range.upper]
                .into_iter()
                .find_map(|bound| match bound {
                    super::RangeBound::Inclusive(v) | super::RangeBound::Exclusive(v) => {
                        self.default_oid(v)
                    }
                    super::RangeBound::Unbounded => None,
                })
                .and_then(|subtype| self.ranges.get(&subtype).copied()),
            other => self.default_types.get(&other.kind()).copied(),
        }
    }

    /// Binary only when the codec for `oid` can write every part of `value`
    /// in binary; text otherwise.
    pub fn format_for_encode(&self, oid: Oid, value: &Value) -> Format {
        if self.binary_encodable(oid, value) {
            Format::Binary
        } else {
            Format::Text
        }
    }

    fn binary_encodable(&self, oid: Oid, value: &Value) -> bool {
        let Some(ty) = self.get(oid) else {
            return matches!(value, Value::Raw(raw) if raw.format == Format::Binary);
        };
        match value {
            Value::Null => ty.codec.preferred_format() == Format::Binary,
            Value::Raw(raw) => raw.format == Format::Binary,
            Value::Custom(c) => c
                .0
                .underlying()
                .is_some_and(|inner| self.binary_encodable(oid, &inner)),
            _ if !ty.codec.accepts(value.kind())
                || !ty.codec.format_supported(Format::Binary)
                || ty.codec.preferred_format() != Format::Binary =>
            {
                false
            }
            Value::Array(array) => match ty.kind {
                TypeKind::Array { element } => array
                    .elements
                    .iter()
                    .all(|e| self.binary_encodable(element, e)),
                _ => true,
            },
            Value::Composite(values) => match &ty.kind {
                TypeKind::Composite { fields } => fields
                    .iter()
                    .zip(values)
                    .all(|((_, oid), v)| self.binary_encodable(*oid, v)),
                _ => true,
            },
            Value::Range(range) => match ty.kind {
                TypeKind::Range { subtype } => [&range.lower, &range.upper]
                    .into_iter()
                    .all(|bound| match bound {
                        super::RangeBound::Inclusive(v) | super::RangeBound::Exclusive(v) => {
                            self.binary_encodable(subtype, v)
                        }
                        super::RangeBound::Unbounded => true,
                    }),
                _ => true,
            },
            _ => true,
        }
    }

    /// Result format to request for a column of type `oid`.
    pub fn format_for_decode(&self, oid: Oid) -> Format {
        match self.get(oid) {
            Some(ty) if ty.codec.format_supported(Format::Binary) => ty.codec.preferred_format(),
            _ => Format::Text,
        }
    }

    // ------------------------------------------------------------------------
    // Encode / decode
    // ------------------------------------------------------------------------

    /// Append the encoding of `value` to `buf`. Returns `false`, writing
    /// nothing, when the value encodes as NULL.
    pub fn encode_into(&self, oid: Oid, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<bool> {
        self.plans
            .encode_plan(self, oid, format, value)
            .execute(self, oid, format, value, buf)
    }

    /// Append a length-prefixed field (-1 for NULL), as used in Bind,
    /// DataRow, COPY rows and array/composite elements.
    pub fn encode_field(&self, oid: Oid, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let start = buf.len();
        buf.put_i32(0);
        if self.encode_into(oid, format, value, buf)? {
            let len = buf.len() - start - 4;
            let len = i32::try_from(len)
                .map_err(|_| PgError::Encode(format!("value of {} bytes is too large", len)))?;
            buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
        } else {
            buf[start..start + 4].copy_from_slice(&(-1i32).to_be_bytes());
        }
        Ok(())
    }

    /// Encode to owned bytes; `None` for NULL.
    pub fn encode(&self, oid: Oid, format: Format, value: &Value) -> PgResult<Option<Bytes>> {
        let mut buf = BytesMut::new();
        Ok(self
            .encode_into(oid, format, value, &mut buf)?
            .then(|| buf.freeze()))
    }

    /// Decode a column value; `None` raw bytes decode to `Value::Null`.
    pub fn decode(&self, oid: Oid, format: Format, raw: Option<&[u8]>) -> PgResult<Value> {
        let Some(raw) = raw else {
            return Ok(Value::Null);
        };
        match self.plans.decode_plan(self, oid, format) {
            DecodePlan::Codec(codec) => codec.decode(self, format, raw),
            DecodePlan::UnknownText => std::str::from_utf8(raw)
                .map(|s| Value::Text(s.to_string()))
                .map_err(|e| PgError::Decode(format!("Invalid UTF-8 in type OID {}: {}", oid, e))),
            DecodePlan::UnknownBinary => Ok(Value::Raw(RawValue {
                oid,
                format,
                bytes: Bytes::copy_from_slice(raw),
            })),
        }
    }

    /// Convert a column value into `T`, letting `T` scan the raw bytes
    /// first.
    pub fn scan<T: FromSql>(&self, oid: Oid, format: Format, raw: Option<&[u8]>) -> PgResult<T> {
        if let Some(result) = T::scan_raw(self, oid, format, raw) {
            return result;
        }
        T::from_value(self.decode(oid, format, raw)?)
    }
}

fn missing(type_name: &str, dependency: Oid) -> PgError {
    PgError::MissingDependency {
        type_name: type_name.to_string(),
        dependency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::types::{Array, Range, RangeBound};

    #[test]
    fn test_builtin_scalars_roundtrip_through_map() {
        let map = TypeMap::new();
        let cases = vec![
            (Oid::BOOL, Value::Bool(true)),
            (Oid::INT2, Value::Int2(7)),
            (Oid::INT4, Value::Int4(-7)),
            (Oid::INT8, Value::Int8(1 << 40)),
            (Oid::FLOAT4, Value::Float4(0.5)),
            (Oid::FLOAT8, Value::Float8(1e-3)),
            (Oid::TEXT, Value::Text("abc".into())),
            (Oid::VARCHAR, Value::Text("varchar".into())),
            (Oid::BYTEA, Value::Bytea(vec![1, 2, 3])),
            (Oid::NUMERIC, Value::Numeric("3.14159".parse().unwrap())),
            (Oid::UUID, Value::Uuid(uuid::Uuid::nil())),
            (Oid::JSONB, Value::Json(serde_json::json!({"k": "v"}))),
        ];
        for (oid, value) in cases {
            for format in [Format::Text, Format::Binary] {
                let bytes = map.encode(oid, format, &value).unwrap().unwrap();
                let decoded = map.decode(oid, format, Some(&bytes)).unwrap();
                assert_eq!(decoded, value, "oid {} {:?}", oid, format);
            }
        }
    }

    #[test]
    fn test_composite_requires_registered_fields() {
        let mut map = TypeMap::new();
        let err = map
            .register_composite(Oid(90_001), "pair", vec![("a", Oid::INT4), ("b", Oid(90_000))])
            .unwrap_err();
        assert!(matches!(
            err,
            PgError::MissingDependency { dependency, .. } if dependency == Oid(90_000)
        ));

        // Self reference is rejected even though the id is the type's own
        let err = map
            .register_composite(Oid(90_002), "node", vec![("next", Oid(90_002))])
            .unwrap_err();
        assert!(matches!(err, PgError::MissingDependency { .. }));
        assert!(!map.contains(Oid(90_002)));

        map.register_composite(Oid(90_000), "inner", vec![("x", Oid::INT4)])
            .unwrap();
        map.register_composite(Oid(90_001), "pair", vec![("a", Oid::INT4), ("b", Oid(90_000))])
            .unwrap();

        let value = Value::Composite(vec![Value::Int4(1), Value::Composite(vec![Value::Int4(2)])]);
        for format in [Format::Text, Format::Binary] {
            let bytes = map.encode(Oid(90_001), format, &value).unwrap().unwrap();
            assert_eq!(map.decode(Oid(90_001), format, Some(&bytes)).unwrap(), value);
        }
    }

    #[test]
    fn test_domain_enum_and_custom_range() {
        let mut map = TypeMap::new();
        map.register_domain(Oid(91_000), "positive_int", Oid::INT4).unwrap();
        map.register_enum(Oid(91_001), "mood").unwrap();
        map.register_array(Oid(91_002), "_mood", Oid(91_001)).unwrap();
        map.register_range(Oid(91_003), "floatrange", Oid::FLOAT8).unwrap();
        assert!(map.register_domain(Oid(91_004), "dangling", Oid(12_345)).is_err());

        let bytes = map.encode(Oid(91_000), Format::Binary, &Value::Int4(5)).unwrap().unwrap();
        assert_eq!(&bytes[..], &5i32.to_be_bytes());

        let moods = Value::array(vec!["happy", "sad"]);
        let bytes = map.encode(Oid(91_002), Format::Binary, &moods).unwrap().unwrap();
        assert_eq!(map.decode(Oid(91_002), Format::Binary, Some(&bytes)).unwrap(), moods);

        let range = Value::from(Range::new(
            RangeBound::Inclusive(Value::Float8(1.5)),
            RangeBound::Exclusive(Value::Float8(2.5)),
        ));
        let bytes = map.encode(Oid(91_003), Format::Text, &range).unwrap().unwrap();
        assert_eq!(&bytes[..], b"[1.5,2.5)");
        assert_eq!(map.get_by_name("floatrange").map(|t| t.oid), Some(Oid(91_003)));
    }

    #[test]
    fn test_default_oids() {
        let map = TypeMap::new();
        assert_eq!(map.default_oid(&Value::Int8(1)), Some(Oid::INT8));
        assert_eq!(map.default_oid(&Value::from(vec![1_i32, 2])), Some(Oid::INT4_ARRAY));
        assert_eq!(
            map.default_oid(&Value::from(Range::new(
                RangeBound::Unbounded,
                RangeBound::Exclusive(Value::Int8(3))
            ))),
            Some(Oid::INT8RANGE)
        );
        assert_eq!(map.default_oid(&Value::Array(Array::default())), None);
        assert_eq!(map.default_oid(&Value::Composite(vec![])), None);
    }

    #[test]
    fn test_format_selection() {
        let map = TypeMap::new();
        assert_eq!(map.format_for_encode(Oid::INT4, &Value::Int4(1)), Format::Binary);
        // A string for a date column is sent as text
        assert_eq!(
            map.format_for_encode(Oid::DATE, &Value::Text("2024-01-01".into())),
            Format::Text
        );
        assert_eq!(map.format_for_encode(Oid(55_555), &Value::Int4(1)), Format::Text);
        assert_eq!(map.format_for_decode(Oid::INT8), Format::Binary);
        assert_eq!(map.format_for_decode(Oid(55_555)), Format::Text);
    }

    #[test]
    fn test_registration_resets_plans() {
        let mut map = TypeMap::new();
        map.encode(Oid::INT4, Format::Binary, &Value::Int4(1)).unwrap();
        assert!(map.plans().len().0 > 0);
        map.register_enum(Oid(92_000), "color").unwrap();
        assert_eq!(map.plans().len(), (0, 0));

        // Clones start without plans of their own
        map.encode(Oid::INT4, Format::Binary, &Value::Int4(1)).unwrap();
        let copy = map.clone();
        assert_eq!(copy.plans().len(), (0, 0));
    }
}
