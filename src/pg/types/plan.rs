//! Memoized encode/decode strategies.
//!
//! A plan is chosen once per (type id, format, value shape) by walking a
//! fixed chain of capability checks, then reused. Plans are append-only and
//! bounded by the number of distinct shapes a connection actually sees.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;

use super::codec::Codec;
use super::{Format, Oid, TypeMap, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

/// How to encode one value shape for one type id.
#[derive(Debug, Clone)]
pub(crate) enum EncodePlan {
    /// Write the NULL marker.
    Null,
    /// The target type's codec accepts the shape.
    Direct(Arc<dyn Codec>),
    /// Pre-encoded bytes in the requested format.
    RawPassthrough,
    /// A string is already valid wire text for any type.
    TextPassthrough,
    /// Text form produced by the codec of the value's own default type.
    ViaDefault,
    /// Application wrapper: plan its underlying value instead.
    Unwrap,
    /// Application value without an underlying value: send its text form.
    ValuerText,
    Unsupported,
}

impl EncodePlan {
    /// Walk the capability chain for a value of this shape.
    pub(crate) fn build(map: &TypeMap, oid: Oid, format: Format, value: &Value) -> Self {
        let kind = value.kind();
        if kind == ValueKind::Null {
            return EncodePlan::Null;
        }
        if let Some(ty) = map.get(oid) {
            if ty.codec.accepts(kind) && ty.codec.format_supported(format) {
                return EncodePlan::Direct(ty.codec.clone());
            }
        }
        match value {
            Value::Raw(_) => return EncodePlan::RawPassthrough,
            Value::Text(_) if format == Format::Text => return EncodePlan::TextPassthrough,
            Value::Custom(c) => {
                return if c.0.underlying().is_some() {
                    EncodePlan::Unwrap
                } else if format == Format::Text {
                    EncodePlan::ValuerText
                } else {
                    EncodePlan::Unsupported
                };
            }
            _ => {}
        }
        if format == Format::Text {
            let natural = map.default_oid(value).filter(|natural| *natural != oid);
            if let Some(ty) = natural.and_then(|natural| map.get(natural)) {
                if ty.codec.accepts(kind) {
                    return EncodePlan::ViaDefault;
                }
            }
        }
        EncodePlan::Unsupported
    }

    /// Encode `value`. Returns `false` when it encodes as NULL.
    pub(crate) fn execute(
        &self,
        map: &TypeMap,
        oid: Oid,
        format: Format,
        value: &Value,
        buf: &mut BytesMut,
    ) -> PgResult<bool> {
        match self {
            EncodePlan::Null => Ok(false),
            EncodePlan::Direct(codec) => codec.encode(map, format, value, buf).map(|_| true),
            EncodePlan::RawPassthrough => match value {
                Value::Raw(raw) if raw.format == format => {
                    buf.put_slice(&raw.bytes);
                    Ok(true)
                }
                Value::Raw(raw) => Err(PgError::Encode(format!(
                    "raw value of type OID {} is in {:?} format, {:?} was requested",
                    raw.oid, raw.format, format
                ))),
                _ => Err(unsupported(oid, format, value)),
            },
            EncodePlan::TextPassthrough => match value {
                Value::Text(s) if !s.contains('\0') => {
                    buf.put_slice(s.as_bytes());
                    Ok(true)
                }
                Value::Text(_) => Err(PgError::Encode(
                    "text values cannot contain NUL bytes".to_string(),
                )),
                _ => Err(unsupported(oid, format, value)),
            },
            EncodePlan::ViaDefault => match map.default_oid(value) {
                Some(natural) if natural != oid => map.encode_into(natural, Format::Text, value, buf),
                _ => Err(unsupported(oid, format, value)),
            },
            // The plan is keyed on the shape; which representation a value
            // offers is checked again per value
            EncodePlan::Unwrap | EncodePlan::ValuerText => match value {
                Value::Custom(c) => match c.0.underlying() {
                    Some(inner) => map.encode_into(oid, format, &inner, buf),
                    None if format == Format::Text => match c.0.text_value()? {
                        Some(text) => {
                            buf.put_slice(text.as_bytes());
                            Ok(true)
                        }
                        None => Ok(false),
                    },
                    None => Err(unsupported(oid, format, value)),
                },
                _ => Err(unsupported(oid, format, value)),
            },
            EncodePlan::Unsupported => Err(unsupported(oid, format, value)),
        }
    }
}

fn unsupported(oid: Oid, format: Format, value: &Value) -> PgError {
    PgError::Encode(format!(
        "cannot encode {:?} as type OID {} in {:?} format",
        value.kind(),
        oid,
        format
    ))
}

/// How to decode one type id in one format.
#[derive(Debug, Clone)]
pub(crate) enum DecodePlan {
    Codec(Arc<dyn Codec>),
    /// Unregistered type in text format: keep the string.
    UnknownText,
    /// Unregistered type in binary format: keep the bytes.
    UnknownBinary,
}

impl DecodePlan {
    pub(crate) fn build(map: &TypeMap, oid: Oid, format: Format) -> Self {
        match map.get(oid) {
            Some(ty) if ty.codec.format_supported(format) => DecodePlan::Codec(ty.codec.clone()),
            _ if format == Format::Text => DecodePlan::UnknownText,
            _ => DecodePlan::UnknownBinary,
        }
    }
}

type EncodeKey = (Oid, Format, ValueKind);

/// Per-map plan memo. Readers never block each other; a miss takes the
/// write lock only to insert.
#[derive(Default)]
pub(crate) struct PlanCache {
    encode: RwLock<HashMap<EncodeKey, EncodePlan>>,
    decode: RwLock<HashMap<(Oid, Format), DecodePlan>>,
}

impl PlanCache {
    pub(crate) fn encode_plan(&self, map: &TypeMap, oid: Oid, format: Format, value: &Value) -> EncodePlan {
        let key = (oid, format, value.kind());
        if let Some(plan) = self.encode.read().get(&key) {
            return plan.clone();
        }
        let plan = EncodePlan::build(map, oid, format, value);
        self.encode.write().entry(key).or_insert(plan).clone()
    }

    pub(crate) fn decode_plan(&self, map: &TypeMap, oid: Oid, format: Format) -> DecodePlan {
        if let Some(plan) = self.decode.read().get(&(oid, format)) {
            return plan.clone();
        }
        let plan = DecodePlan::build(map, oid, format);
        self.decode.write().entry((oid, format)).or_insert(plan).clone()
    }

    /// Forget every plan; registrations can change any of them.
    pub(crate) fn clear(&mut self) {
        self.encode.get_mut().clear();
        self.decode.get_mut().clear();
    }

    /// Number of (encode, decode) plans held.
    pub(crate) fn len(&self) -> (usize, usize) {
        (self.encode.read().len(), self.decode.read().len())
    }
}

// A cloned map starts with no plans: they hold codecs of the original.
impl Clone for PlanCache {
    fn clone(&self) -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::types::{CustomValue, Valuer};

    #[derive(Debug)]
    struct Meters(i64);

    impl Valuer for Meters {
        fn underlying(&self) -> Option<Value> {
            Some(Value::Int8(self.0))
        }
    }

    #[derive(Debug)]
    struct Color(&'static str);

    impl Valuer for Color {
        fn text_value(&self) -> PgResult<Option<String>> {
            Ok(Some(self.0.to_string()))
        }
    }

    #[test]
    fn test_plan_chain_order() {
        let map = TypeMap::new();
        let plan = |oid, format, value: &Value| EncodePlan::build(&map, oid, format, value);

        assert!(matches!(plan(Oid::INT4, Format::Binary, &Value::Null), EncodePlan::Null));
        assert!(matches!(plan(Oid::INT8, Format::Binary, &Value::Int4(1)), EncodePlan::Direct(_)));
        assert!(matches!(
            plan(Oid::DATE, Format::Text, &Value::Text("2024-01-01".into())),
            EncodePlan::TextPassthrough
        ));
        assert!(matches!(
            plan(Oid::TEXT, Format::Text, &Value::Int4(5)),
            EncodePlan::ViaDefault
        ));
        assert!(matches!(
            plan(Oid::INT8, Format::Binary, &Value::custom(Meters(3))),
            EncodePlan::Unwrap
        ));
        assert!(matches!(
            plan(Oid(99_999), Format::Text, &Value::custom(Color("red"))),
            EncodePlan::ValuerText
        ));
        assert!(matches!(
            plan(Oid::INT4, Format::Binary, &Value::Text("x".into())),
            EncodePlan::Unsupported
        ));
    }

    #[test]
    fn test_plans_are_memoized() {
        let map = TypeMap::new();
        let mut buf = BytesMut::new();
        map.encode_into(Oid::INT4, Format::Binary, &Value::Int4(1), &mut buf).unwrap();
        map.encode_into(Oid::INT4, Format::Binary, &Value::Int4(2), &mut buf).unwrap();
        map.encode_into(Oid::INT4, Format::Text, &Value::Int4(3), &mut buf).unwrap();
        assert_eq!(map.plans().len().0, 2);

        let custom = Value::Custom(CustomValue(Arc::new(Meters(9))));
        let mut buf = BytesMut::new();
        assert!(map.encode_into(Oid::INT8, Format::Binary, &custom, &mut buf).unwrap());
        assert_eq!(&buf[..], &9i64.to_be_bytes());
    }

    /// Offers an underlying value only every other time it is asked.
    #[derive(Debug, Default)]
    struct Flaky(std::sync::atomic::AtomicBool);

    impl Valuer for Flaky {
        fn underlying(&self) -> Option<Value> {
            let flip = !self.0.fetch_xor(true, std::sync::atomic::Ordering::SeqCst);
            flip.then_some(Value::Int4(7))
        }

        fn text_value(&self) -> PgResult<Option<String>> {
            Ok(Some("7".to_string()))
        }
    }

    #[test]
    fn test_custom_plan_rechecks_representation() {
        let map = TypeMap::new();
        for _ in 0..4 {
            let mut buf = BytesMut::new();
            let value = Value::custom(Flaky::default());
            assert!(map.encode_into(Oid::INT4, Format::Text, &value, &mut buf).unwrap());
            assert_eq!(&buf[..], b"7");
        }
        // Binary has no text fallback
        let _ = map.encode_into(Oid::INT4, Format::Binary, &Value::custom(Flaky::default()), &mut BytesMut::new());
        let flaky = Value::custom(Flaky::default());
        let mut buf = BytesMut::new();
        assert!(map.encode_into(Oid::INT4, Format::Binary, &flaky, &mut buf).is_ok());
        let mut buf = BytesMut::new();
        assert!(map.encode_into(Oid::INT4, Format::Binary, &flaky, &mut buf).is_err());
    }

    #[test]
    fn test_unknown_type_decodes_best_effort() {
        let map = TypeMap::new();
        assert_eq!(
            map.decode(Oid(77_777), Format::Text, Some(&b"hello"[..])).unwrap(),
            Value::Text("hello".into())
        );
        match map.decode(Oid(77_777), Format::Binary, Some(&[1u8, 2][..])).unwrap() {
            Value::Raw(raw) => assert_eq!(&raw.bytes[..], &[1, 2]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
